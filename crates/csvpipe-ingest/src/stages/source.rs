//! Source stage: turns feed messages into [`Notification`]s.
//!
//! Feed messages are S3 event notifications. A message may hold several
//! records; each becomes its own notification sharing a split acknowledgment,
//! so the message is deleted only once every referenced file completed.

use std::borrow::Cow;
use std::sync::Arc;

use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::emit;
use crate::ack::Ack;
use crate::clients::{FeedMessage, NotificationFeed};
use crate::config::PipelineConfig;
use crate::error::{PipelineError, StageError};
use crate::event::{Event, Notification};
use crate::shutdown::ShutdownRx;

pub const STAGE: &str = "source";

#[derive(Debug, Deserialize)]
struct S3Event {
    #[serde(rename = "Records", default)]
    records: Vec<S3EventRecord>,
}

#[derive(Debug, Deserialize)]
struct S3EventRecord {
    s3: Option<S3Entity>,
}

#[derive(Debug, Deserialize)]
struct S3Entity {
    bucket: S3Bucket,
    object: S3Object,
}

#[derive(Debug, Deserialize)]
struct S3Bucket {
    name: String,
}

#[derive(Debug, Deserialize)]
struct S3Object {
    key: String,
    size: Option<u64>,
}

/// Object keys arrive form-encoded: `+` for spaces, percent escapes for the rest.
fn decode_key(raw: &str) -> String {
    let spaced = raw.replace('+', " ");
    urlencoding::decode(&spaced)
        .map(Cow::into_owned)
        .unwrap_or_else(|_| raw.to_string())
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SourceReport {
    pub polls: usize,
    pub messages: usize,
    pub notifications: usize,
    pub errors: usize,
}

pub struct SourceStage {
    feed: Arc<dyn NotificationFeed>,
    max_messages: usize,
    drain: bool,
}

impl SourceStage {
    pub fn new(config: &PipelineConfig, feed: Arc<dyn NotificationFeed>) -> Self {
        Self {
            feed,
            max_messages: config.max_messages,
            drain: config.drain,
        }
    }

    /// Polls the feed once, or until an empty poll when draining.
    ///
    /// A feed failure is reported once and ends the sequence.
    pub async fn run(
        self,
        outbound: mpsc::Sender<Event<Notification>>,
        shutdown: ShutdownRx,
    ) -> SourceReport {
        let mut report = SourceReport::default();

        loop {
            let polled = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                polled = self.feed.receive(self.max_messages) => polled,
            };
            report.polls += 1;

            let messages = match polled {
                Ok(messages) => messages,
                Err(e) => {
                    report.errors += 1;
                    let error = StageError::new(STAGE, PipelineError::FeedUnavailable(e));
                    emit(&outbound, Event::Failed(error), &shutdown).await;
                    break;
                },
            };

            if messages.is_empty() {
                debug!("feed drained");
                break;
            }

            report.messages += messages.len();
            for message in messages {
                for event in self.parse(message) {
                    match &event {
                        Event::Item(_) => report.notifications += 1,
                        Event::Failed(_) => report.errors += 1,
                    }
                    if !emit(&outbound, event, &shutdown).await {
                        return report;
                    }
                }
            }

            if !self.drain {
                break;
            }
        }

        info!(
            polls = report.polls,
            messages = report.messages,
            notifications = report.notifications,
            "source finished"
        );
        report
    }

    fn parse(&self, message: FeedMessage) -> Vec<Event<Notification>> {
        let event: S3Event = match serde_json::from_str(&message.body) {
            Ok(event) => event,
            Err(e) => {
                let error = StageError::new(
                    STAGE,
                    PipelineError::MalformedNotification(e.to_string()),
                );
                return vec![Event::Failed(error)];
            },
        };

        if event.records.is_empty() {
            warn!(
                receipt = %message.receipt_handle,
                "notification holds no records, leaving it on the queue"
            );
            return Vec::new();
        }

        let ack = Ack::feed(Arc::clone(&self.feed), message.receipt_handle);
        let acks = ack.split(event.records.len());

        event
            .records
            .into_iter()
            .zip(acks)
            .map(|(record, ack)| match record.s3 {
                Some(entity) => Event::Item(Notification {
                    bucket: entity.bucket.name,
                    key: decode_key(&entity.object.key),
                    size: entity.object.size,
                    ack,
                }),
                None => {
                    ack.withhold("record without s3 entity");
                    Event::Failed(StageError::new(
                        STAGE,
                        PipelineError::MalformedNotification(
                            "record has no s3 entity".to_string(),
                        ),
                    ))
                },
            })
            .collect()
    }
}
