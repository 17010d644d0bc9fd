//! Static fleet assignment and the lifecycle of per-partition consumers.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{error, info, warn};

use crate::consumer::{ConsumerOptions, MessageHandler, PartitionConsumer};
use crate::error::{ConfigError, RegisterError};
use crate::partition::Partitioner;
use crate::redis::{StreamClient, StreamError};

/// Position of this process in the fleet. Immutable for the process
/// lifetime; resizing the fleet means redeploying every member with updated
/// values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FleetAssignment {
    pub instance_id: u32,
    pub instance_count: u32,
}

impl FleetAssignment {
    pub fn new(instance_id: u32, instance_count: u32) -> Result<Self, ConfigError> {
        if instance_count == 0 || instance_id >= instance_count {
            return Err(ConfigError::InvalidAssignment {
                instance_id,
                instance_count,
            });
        }
        Ok(Self {
            instance_id,
            instance_count,
        })
    }

    /// Read `INSTANCE_ID` / `INSTANCE_COUNT`, defaulting to the only member
    /// of a fleet of one.
    pub fn from_env() -> Result<Self, ConfigError> {
        let instance_id = env_u32("INSTANCE_ID", 0)?;
        let instance_count = env_u32("INSTANCE_COUNT", 1)?;
        Self::new(instance_id, instance_count)
    }

    /// The partition indexes this member owns: `{ i : i mod count == id }`.
    /// Across a consistent fleet these sets are disjoint and cover the full
    /// range.
    pub fn owned_partitions(&self, total_partitions: u32) -> Vec<u32> {
        (0..total_partitions)
            .filter(|index| index % self.instance_count == self.instance_id)
            .collect()
    }
}

fn env_u32(name: &'static str, default: u32) -> Result<u32, ConfigError> {
    match std::env::var(name) {
        Ok(value) => value
            .parse()
            .map_err(|_| ConfigError::InvalidEnvInteger { name, value }),
        Err(_) => Ok(default),
    }
}

/// A registration request: one handler consuming one logical topic through
/// one consumer group.
pub struct Subscription {
    pub base_topic: String,
    pub group: String,
    pub handler: Arc<dyn MessageHandler>,
    /// Explicit fleet position; falls back to the environment, then `(0, 1)`.
    pub partitioning: Option<FleetAssignment>,
    /// Base for consumer identities; defaults to `consumer-{group}`.
    pub consumer_id_base: Option<String>,
    pub options: Option<ConsumerOptions>,
}

impl Subscription {
    pub fn new(base_topic: &str, group: &str, handler: Arc<dyn MessageHandler>) -> Self {
        Self {
            base_topic: base_topic.to_owned(),
            group: group.to_owned(),
            handler,
            partitioning: None,
            consumer_id_base: None,
            options: None,
        }
    }
}

/// Owns one `PartitionConsumer` per owned partition per registration.
pub struct ConsumerManager {
    client: Arc<dyn StreamClient>,
    partitioner: Partitioner,
    consumers: Mutex<HashMap<String, PartitionConsumer>>,
}

impl ConsumerManager {
    pub fn new(client: Arc<dyn StreamClient>, partitioner: Partitioner) -> Self {
        Self {
            client,
            partitioner,
            consumers: Mutex::new(HashMap::new()),
        }
    }

    /// Ensure the consumer group exists on every owned partition stream and
    /// start one consumer per owned partition.
    ///
    /// Transport failures abort the registration: a store that is down at
    /// startup is fatal. Any other per-partition group-creation failure only
    /// skips that partition, because a partial subscription is better than
    /// none.
    pub async fn register(&self, subscription: Subscription) -> Result<(), RegisterError> {
        let assignment = match subscription.partitioning {
            Some(assignment) => assignment,
            None => FleetAssignment::from_env()?,
        };
        let owned = assignment.owned_partitions(self.partitioner.total_partitions());
        if owned.is_empty() {
            warn!(
                topic = %subscription.base_topic,
                group = %subscription.group,
                instance_id = assignment.instance_id,
                instance_count = assignment.instance_count,
                "no partitions owned by this instance, nothing to consume"
            );
            return Ok(());
        }

        let base = subscription
            .consumer_id_base
            .unwrap_or_else(|| format!("consumer-{}", subscription.group));
        let process_id = std::process::id();
        let options = subscription.options.unwrap_or_default();

        for index in owned {
            let stream = self
                .partitioner
                .stream_name(&subscription.base_topic, index)?;

            match self
                .client
                .xgroup_create(&stream, &subscription.group, "0")
                .await
            {
                Ok(()) => {}
                Err(err @ StreamError::Connection(_)) => {
                    return Err(RegisterError::GroupCreation(err));
                }
                Err(err) => {
                    error!(
                        stream = %stream,
                        group = %subscription.group,
                        "failed to create consumer group, skipping partition: {err}"
                    );
                    continue;
                }
            }

            let consumer_id = format!("{base}-{process_id}-{index}");
            let key = format!("{stream}:{}:{consumer_id}", subscription.group);
            let mut consumers = self
                .consumers
                .lock()
                .expect("poisoned ConsumerManager mutex");
            if consumers.contains_key(&key) {
                warn!(key = %key, "consumer already registered, ignoring");
                continue;
            }

            let consumer = PartitionConsumer::new(
                self.client.clone(),
                subscription.handler.clone(),
                stream,
                subscription.group.clone(),
                consumer_id,
                index,
                options.clone(),
            );
            consumer.start();
            consumers.insert(key, consumer);
        }

        info!(
            topic = %subscription.base_topic,
            group = %subscription.group,
            consumers = self
                .consumers
                .lock()
                .expect("poisoned ConsumerManager mutex")
                .len(),
            "registration complete"
        );
        Ok(())
    }

    /// Registry keys of the currently managed consumers.
    pub fn consumer_keys(&self) -> Vec<String> {
        self.consumers
            .lock()
            .expect("poisoned ConsumerManager mutex")
            .keys()
            .cloned()
            .collect()
    }

    /// Stop every consumer, clear the registry, and wait long enough for
    /// in-flight blocking reads to unwind on their own. No forced
    /// cancellation; idempotent.
    pub async fn stop_all(&self) {
        let drained: Vec<PartitionConsumer> = self
            .consumers
            .lock()
            .expect("poisoned ConsumerManager mutex")
            .drain()
            .map(|(_, consumer)| consumer)
            .collect();
        if drained.is_empty() {
            return;
        }

        let max_block = drained
            .iter()
            .map(|consumer| consumer.block_timeout())
            .max()
            .unwrap_or_default();
        for consumer in &drained {
            consumer.stop();
        }
        info!(consumers = drained.len(), "waiting for consumers to unwind");
        tokio::time::sleep(max_block + Duration::from_millis(500)).await;
    }

    /// Stop and forget one consumer by registry key.
    pub async fn stop(&self, key: &str) {
        let removed = self
            .consumers
            .lock()
            .expect("poisoned ConsumerManager mutex")
            .remove(key);
        match removed {
            Some(consumer) => {
                consumer.stop();
                tokio::time::sleep(consumer.block_timeout() + Duration::from_millis(500)).await;
            }
            None => warn!(key = %key, "no consumer registered under this key"),
        }
    }
}
