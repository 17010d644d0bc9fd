use thiserror::Error;

use crate::redis::StreamError;

/// Enumeration of configuration errors. These surface synchronously from
/// construction or registration and should abort startup.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("total_partitions must be a positive integer")]
    InvalidTotalPartitions,
    #[error("partition index {index} is out of range for {total} partitions")]
    InvalidPartitionIndex { index: u32, total: u32 },
    #[error("instance_id {instance_id} must be an integer in [0, {instance_count})")]
    InvalidAssignment {
        instance_id: u32,
        instance_count: u32,
    },
    #[error("{name} must be an integer, got {value:?}")]
    InvalidEnvInteger { name: &'static str, value: String },
}

/// Enumeration of errors raised when publishing a payload.
#[derive(Error, Debug)]
pub enum PublishError {
    #[error("invalid publish argument: {0}")]
    InvalidArgument(&'static str),
    #[error("not connected to the stream store")]
    NotConnected,
    #[error("failed to append entry to stream")]
    Stream(#[from] StreamError),
}

/// Enumeration of errors raised when registering a subscription.
#[derive(Error, Debug)]
pub enum RegisterError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("not connected to the stream store")]
    NotConnected,
    #[error("failed to create consumer group")]
    GroupCreation(#[source] StreamError),
}

/// Top-level error type for the `QTask` facade lifecycle.
#[derive(Error, Debug)]
pub enum QTaskError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("failed to connect to the stream store")]
    Connect(#[source] StreamError),
    #[error(transparent)]
    Publish(#[from] PublishError),
    #[error(transparent)]
    Register(#[from] RegisterError),
}
