//! External collaborators.
//!
//! The pipeline talks to the outside world only through these traits: a
//! notification feed, an object store and a message transport. Production
//! adapters live in the submodules.

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::AsyncWrite;

use crate::event::OutboundMessage;

#[cfg(feature = "kafka")]
pub mod kafka;
pub mod s3;
pub mod sqs;

#[cfg(feature = "kafka")]
pub use kafka::KafkaTransport;
pub use s3::S3Store;
pub use sqs::SqsFeed;

/// One message pulled from the notification feed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedMessage {
    pub body: String,
    pub receipt_handle: String,
}

#[derive(Debug, Error)]
pub enum FeedError {
    #[error("queue {queue} is unavailable: {reason}")]
    Unavailable { queue: String, reason: String },

    #[error("failed to delete message from {queue}: {reason}")]
    Delete { queue: String, reason: String },
}

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("object not found")]
    NotFound,

    #[error("bucket not found")]
    BucketNotFound,

    #[error("failed to write download destination: {0}")]
    Write(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("delivery to topic {topic} failed: {reason}")]
    Delivery { topic: String, reason: String },

    #[error("transport unavailable: {0}")]
    Unavailable(String),
}

/// Source of file-arrival notifications
#[async_trait]
pub trait NotificationFeed: Send + Sync {
    /// Returns up to `max` pending messages. An empty result means the feed is
    /// currently drained.
    async fn receive(&self, max: usize) -> Result<Vec<FeedMessage>, FeedError>;

    /// Acknowledges a message so it is not redelivered.
    async fn delete(&self, receipt_handle: &str) -> Result<(), FeedError>;
}

/// Object storage the notified files are fetched from
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Streams `bucket/key` into `dest`, returning the number of bytes written.
    async fn download(
        &self,
        bucket: &str,
        key: &str,
        dest: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<u64, DownloadError>;
}

/// Downstream message broker
#[async_trait]
pub trait MessageTransport: Send + Sync {
    /// Writes a batch. Success means every message was accepted.
    async fn write(&self, messages: &[OutboundMessage]) -> Result<(), TransportError>;
}

/// Loads the shared AWS SDK configuration, applying region and endpoint
/// overrides.
pub async fn load_aws_config(settings: &crate::config::AwsSettings) -> aws_config::SdkConfig {
    let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest());
    if let Some(region) = &settings.region {
        loader = loader.region(aws_config::Region::new(region.clone()));
    }
    if let Some(endpoint) = &settings.endpoint_url {
        loader = loader.endpoint_url(endpoint);
    }
    loader.load().await
}
