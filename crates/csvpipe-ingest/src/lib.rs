//! csvpipe ingest library
//!
//! A staged, concurrent pipeline that turns file-arrival notifications into
//! messages: notifications are read from a feed, the referenced objects are
//! downloaded and parsed as delimited text, and every row (or every failure) is
//! published to a message broker.
//!
//! # Stages
//!
//! - **Source**: polls the notification feed
//! - **Fetch**: downloads each object into a temporary file
//! - **Decode**: streams CSV rows, optionally transcoding to UTF-8 first
//! - **Sink**: batches rows to the value topic and acknowledges finished files
//! - **Escalate**: publishes errors to the error topic
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use csvpipe_ingest::clients::{load_aws_config, KafkaTransport, S3Store, SqsFeed};
//! use csvpipe_ingest::config::{AwsSettings, KafkaSettings, PipelineConfig};
//! use csvpipe_ingest::pipeline::{Collaborators, Pipeline};
//! use csvpipe_ingest::shutdown::create_shutdown_channel;
//!
//! # async fn example(kafka: KafkaSettings) -> anyhow::Result<()> {
//! let config = PipelineConfig::default();
//! let aws = load_aws_config(&AwsSettings::default()).await;
//! let transport = Arc::new(KafkaTransport::new(&kafka)?);
//!
//! let collaborators = Collaborators {
//!     feed: Arc::new(SqsFeed::connect(&aws, &config.queue, config.wait_time_secs).await?),
//!     store: Arc::new(S3Store::new(&aws)),
//!     values: transport.clone(),
//!     errors: transport,
//! };
//!
//! let (shutdown, _) = create_shutdown_channel();
//! let summary = Pipeline::spawn(&config, collaborators, shutdown)?.run().await;
//! std::process::exit(summary.exit_code());
//! # }
//! ```

#![deny(clippy::unwrap_used, clippy::expect_used)]
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used))]

pub mod ack;
pub mod clients;
pub mod config;
pub mod error;
pub mod event;
pub mod pipeline;
pub mod shutdown;
pub mod stages;

#[cfg(test)]
mod test_support;

pub use ack::Ack;
pub use config::{AckPolicy, PipelineConfig};
pub use error::{PipelineError, Severity, StageError};
pub use event::{Event, OutboundMessage, Row};
pub use pipeline::{Collaborators, Pipeline, RunSummary};
