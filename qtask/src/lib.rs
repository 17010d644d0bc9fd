//! # QTask
//!
//! A partitioned task-queue runtime on top of a Redis-Streams-compatible
//! store. Producers publish payloads addressed by a logical topic and a
//! partition key; a statically-assigned worker fleet consumes the per
//! partition streams through consumer groups with at-least-once delivery
//! and automatic reclaim of entries whose processing stalled.

pub mod config;
pub mod consumer;
pub mod error;
pub mod manager;
pub mod partition;
pub mod publisher;
pub mod redis;

use std::sync::Arc;

use serde_json::Value;
use tracing::{info, warn};

use crate::config::Config;
use crate::error::{ConfigError, PublishError, QTaskError, RegisterError};
use crate::manager::{ConsumerManager, Subscription};
use crate::partition::Partitioner;
use crate::publisher::{PublishOptions, Publisher};
use crate::redis::{RedisStreamClient, StreamClient};

struct Session {
    publisher: Publisher,
    manager: ConsumerManager,
}

/// Facade composing partitioner, publisher and consumer manager behind a
/// `connect` / `register` / `publish` / `stop` lifecycle.
///
/// Construction validates the partition count eagerly; everything that needs
/// a store session is deferred to [`QTask::connect`]. After [`QTask::stop`],
/// `publish` and `register` fail with `NotConnected` again.
pub struct QTask {
    config: Config,
    partitioner: Partitioner,
    session: Option<Session>,
}

impl QTask {
    pub fn new(config: Config) -> Result<Self, ConfigError> {
        let partitioner = Partitioner::new(config.total_partitions)?;
        Ok(Self {
            config,
            partitioner,
            session: None,
        })
    }

    /// Open the store session. Fails loudly if the endpoint does not answer.
    pub async fn connect(&mut self) -> Result<(), QTaskError> {
        if self.session.is_some() {
            warn!("already connected, ignoring connect");
            return Ok(());
        }
        let client = RedisStreamClient::connect(&self.config.redis_url())
            .await
            .map_err(QTaskError::Connect)?;
        self.attach(Arc::new(client));
        info!(
            host = %self.config.redis_host,
            port = self.config.redis_port,
            total_partitions = self.config.total_partitions,
            "connected to stream store"
        );
        Ok(())
    }

    /// Build an already-connected instance over any stream client. Lets
    /// tests and embedders swap the store for an in-memory one.
    pub fn with_client(
        config: Config,
        client: Arc<dyn StreamClient>,
    ) -> Result<Self, ConfigError> {
        let mut qtask = Self::new(config)?;
        qtask.attach(client);
        Ok(qtask)
    }

    fn attach(&mut self, client: Arc<dyn StreamClient>) {
        let publisher = Publisher::new(client.clone(), self.partitioner);
        let manager = ConsumerManager::new(client, self.partitioner);
        self.session = Some(Session { publisher, manager });
    }

    /// Publish a payload to the partition of `base_topic` selected by `key`.
    pub async fn publish(
        &self,
        base_topic: &str,
        key: Option<&str>,
        payload: &Value,
        options: Option<PublishOptions>,
    ) -> Result<String, PublishError> {
        let session = self.session.as_ref().ok_or(PublishError::NotConnected)?;
        session.publisher.publish(base_topic, key, payload, options).await
    }

    /// Register a handler for a logical topic. Fleet position and consumer
    /// tunables default to the configured values when the subscription does
    /// not carry its own.
    pub async fn register(&self, mut subscription: Subscription) -> Result<(), RegisterError> {
        let session = self.session.as_ref().ok_or(RegisterError::NotConnected)?;
        if subscription.partitioning.is_none() {
            subscription.partitioning = Some(self.config.fleet_assignment()?);
        }
        if subscription.options.is_none() {
            subscription.options = Some(self.config.consumer_options());
        }
        session.manager.register(subscription).await
    }

    /// Stop all consumers, then close the store session.
    pub async fn stop(&mut self) {
        if let Some(session) = self.session.take() {
            session.manager.stop_all().await;
            info!("qtask stopped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EnvMsDuration;
    use crate::consumer::{ConsumerOptions, Message, MessageHandler};
    use crate::redis::MockStreamClient;
    use async_trait::async_trait;
    use serde_json::json;
    use std::time::Duration;

    struct NoopHandler;

    #[async_trait]
    impl MessageHandler for NoopHandler {
        async fn handle(&self, _message: &Message) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn config(total_partitions: u32) -> Config {
        Config {
            redis_host: "localhost".to_string(),
            redis_port: 6379,
            redis_username: None,
            redis_password: None,
            total_partitions,
            instance_id: 0,
            instance_count: 1,
            block_timeout: EnvMsDuration(Duration::from_millis(50)),
            claim_interval: EnvMsDuration(Duration::from_secs(3600)),
            min_idle_time: EnvMsDuration(Duration::from_secs(60)),
        }
    }

    fn fast_subscription() -> Subscription {
        let mut subscription = Subscription::new("jobs", "workers", Arc::new(NoopHandler));
        subscription.options = Some(ConsumerOptions {
            block_timeout: Duration::from_millis(50),
            claim_interval: Duration::from_secs(3600),
            min_idle_time: Duration::from_secs(60),
        });
        subscription
    }

    #[test]
    fn construction_rejects_zero_partitions() {
        assert!(QTask::new(config(0)).is_err());
    }

    #[tokio::test]
    async fn operations_before_connect_fail_with_not_connected() {
        let qtask = QTask::new(config(4)).unwrap();
        assert!(matches!(
            qtask.publish("jobs", Some("k"), &json!("x"), None).await,
            Err(PublishError::NotConnected)
        ));
        assert!(matches!(
            qtask.register(fast_subscription()).await,
            Err(RegisterError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn stop_returns_the_facade_to_not_connected() {
        let client = MockStreamClient::new();
        let mut qtask = QTask::with_client(config(4), Arc::new(client.clone())).unwrap();

        qtask
            .publish("jobs", Some("abc"), &json!({"to": "x"}), None)
            .await
            .unwrap();
        qtask.register(fast_subscription()).await.unwrap();

        qtask.stop().await;
        assert!(matches!(
            qtask.publish("jobs", Some("abc"), &json!("x"), None).await,
            Err(PublishError::NotConnected)
        ));
        // Stop is idempotent.
        qtask.stop().await;
    }

    #[tokio::test]
    async fn register_falls_back_to_configured_fleet_position() {
        let client = MockStreamClient::new();
        let mut config = config(4);
        config.instance_id = 1;
        config.instance_count = 2;
        let qtask = QTask::with_client(config, Arc::new(client.clone())).unwrap();

        let mut subscription = fast_subscription();
        subscription.partitioning = None;
        qtask.register(subscription).await.unwrap();

        // Instance 1 of 2 owns partitions 1 and 3 of 4.
        assert!(client.group_exists("jobs:1", "workers"));
        assert!(client.group_exists("jobs:3", "workers"));
        assert!(!client.group_exists("jobs:0", "workers"));
    }
}
