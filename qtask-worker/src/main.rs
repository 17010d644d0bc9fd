//! Consume partitioned task-queue streams and log every delivered message.

use std::sync::Arc;

use async_trait::async_trait;
use envconfig::Envconfig;
use tracing::info;

use qtask::consumer::{Message, MessageHandler};
use qtask::manager::Subscription;
use qtask::QTask;

use crate::config::Config;

mod config;
mod metrics;

struct LogHandler;

#[async_trait]
impl MessageHandler for LogHandler {
    async fn handle(&self, message: &Message) -> anyhow::Result<()> {
        info!(
            entry_id = %message.id,
            partition = message.partition,
            fields = ?message.fields,
            "handled message"
        );
        Ok(())
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let config = Config::init_from_env().expect("failed to load configuration from env");

    let mut qtask = QTask::new(config.qtask.clone()).expect("invalid qtask configuration");
    qtask
        .connect()
        .await
        .expect("failed to connect to the stream store");

    let subscription = Subscription::new(&config.topic, &config.group, Arc::new(LogHandler));
    qtask
        .register(subscription)
        .await
        .expect("failed to register consumers");

    let router = metrics::setup_metrics_router();
    let bind = config.bind();
    tokio::task::spawn(async move {
        metrics::serve(router, &bind)
            .await
            .expect("failed to start serving metrics");
    });

    tokio::signal::ctrl_c()
        .await
        .expect("failed to listen for shutdown signal");
    info!("shutdown signal received");
    qtask.stop().await;
}
