//! Items flowing between stages.
//!
//! Every channel carries [`Event`]s: either a typed payload or a
//! [`StageError`]. Stages match on the two cases and never look inside a
//! failed event's payload, because it has none.

use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;
use tokio::io::AsyncRead;

use crate::ack::Ack;
use crate::error::StageError;

/// A payload or an error, never both
#[derive(Debug)]
pub enum Event<T> {
    Item(T),
    Failed(StageError),
}

impl<T> Event<T> {
    pub fn error(&self) -> Option<&StageError> {
        match self {
            Event::Item(_) => None,
            Event::Failed(error) => Some(error),
        }
    }
}

impl<T: Payload> Event<T> {
    /// The acknowledgment this event carries, if any. Failed events carry none.
    pub fn on_completion(&self) -> Option<&Ack> {
        match self {
            Event::Item(item) => item.completion(),
            Event::Failed(_) => None,
        }
    }
}

impl<T> From<StageError> for Event<T> {
    fn from(error: StageError) -> Self {
        Event::Failed(error)
    }
}

/// Implemented by every payload type that may carry an acknowledgment
pub trait Payload {
    fn completion(&self) -> Option<&Ack>;
}

/// Identifies one fetched file for the lifetime of the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FileId(pub u64);

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A new object is available in a bucket
#[derive(Debug)]
pub struct Notification {
    pub bucket: String,
    pub key: String,
    pub size: Option<u64>,
    pub ack: Ack,
}

impl Payload for Notification {
    fn completion(&self) -> Option<&Ack> {
        Some(&self.ack)
    }
}

/// A downloaded object, readable from the start
pub struct FetchedContent {
    pub bucket: String,
    pub key: String,
    /// Logical name used in rows and error reports
    pub name: String,
    pub reader: Box<dyn AsyncRead + Send + Unpin>,
    pub ack: Ack,
}

impl fmt::Debug for FetchedContent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FetchedContent")
            .field("bucket", &self.bucket)
            .field("key", &self.key)
            .field("name", &self.name)
            .field("ack", &self.ack)
            .finish_non_exhaustive()
    }
}

impl Payload for FetchedContent {
    fn completion(&self) -> Option<&Ack> {
        Some(&self.ack)
    }
}

/// One data line of a file, keyed by header column
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Row {
    #[serde(skip)]
    pub file: FileId,
    pub name: String,
    /// 1-based, the header line excluded
    pub line: u64,
    pub columns: BTreeMap<String, String>,
}

impl Payload for Row {
    fn completion(&self) -> Option<&Ack> {
        None
    }
}

/// Marks the end of a file's rows; carries the file's acknowledgment
#[derive(Debug)]
pub struct FileCompletion {
    pub file: FileId,
    pub name: String,
    pub rows: u64,
    pub failed_rows: u64,
    /// `None` when the acknowledgment was withheld by the decode stage
    pub ack: Option<Ack>,
}

impl Payload for FileCompletion {
    fn completion(&self) -> Option<&Ack> {
        self.ack.as_ref()
    }
}

/// Output of the decode stage
#[derive(Debug)]
pub enum Decoded {
    Row(Row),
    Completed(FileCompletion),
}

impl Payload for Decoded {
    fn completion(&self) -> Option<&Ack> {
        match self {
            Decoded::Row(row) => row.completion(),
            Decoded::Completed(done) => done.completion(),
        }
    }
}

/// A message ready for the transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub topic: String,
    pub key: Vec<u8>,
    pub payload: Vec<u8>,
}

impl OutboundMessage {
    /// Serializes a row for the value topic, keyed by its file name.
    pub fn from_row(topic: &str, row: &Row) -> serde_json::Result<Self> {
        Ok(Self {
            topic: topic.to_string(),
            key: row.name.as_bytes().to_vec(),
            payload: serde_json::to_vec(row)?,
        })
    }

    /// Serializes an error for the error topic, keyed by its file name when
    /// known.
    pub fn from_error(topic: &str, error: &StageError) -> Self {
        Self {
            topic: topic.to_string(),
            key: error.file().unwrap_or_default().as_bytes().to_vec(),
            payload: error.to_payload(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PipelineError;

    fn row() -> Row {
        Row {
            file: FileId(1),
            name: "people.csv".into(),
            line: 1,
            columns: BTreeMap::from([
                ("name".to_string(), "ava".to_string()),
                ("age".to_string(), "5".to_string()),
            ]),
        }
    }

    #[test]
    fn test_failed_event_has_no_completion() {
        let error = StageError::new("fetch", PipelineError::MalformedNotification("x".into()));
        let event: Event<Notification> = error.into();

        assert!(event.error().is_some());
        assert!(event.on_completion().is_none());
    }

    #[test]
    fn test_notification_carries_completion() {
        let event = Event::Item(Notification {
            bucket: "b".into(),
            key: "k".into(),
            size: None,
            ack: Ack::noop(),
        });

        assert!(event.error().is_none());
        assert!(event.on_completion().is_some());
    }

    #[test]
    fn test_withheld_file_completion_has_no_ack() {
        let done = Decoded::Completed(FileCompletion {
            file: FileId(2),
            name: "x.csv".into(),
            rows: 0,
            failed_rows: 1,
            ack: None,
        });
        assert!(Event::Item(done).on_completion().is_none());
    }

    #[test]
    fn test_row_message_shape() {
        let message = OutboundMessage::from_row("values", &row()).unwrap();
        assert_eq!(message.topic, "values");
        assert_eq!(message.key, b"people.csv");

        let payload: serde_json::Value = serde_json::from_slice(&message.payload).unwrap();
        assert_eq!(payload["name"], "people.csv");
        assert_eq!(payload["line"], 1);
        assert_eq!(payload["columns"]["name"], "ava");
        assert_eq!(payload["columns"]["age"], "5");
        assert!(payload.get("file").is_none());
    }

    #[test]
    fn test_error_message_keyed_by_file() {
        let error = StageError::new("decode", PipelineError::MalformedRecord("bad".into()))
            .with("file", "people.csv");
        let message = OutboundMessage::from_error("errors", &error);
        assert_eq!(message.key, b"people.csv");

        let bare = StageError::new("source", PipelineError::MalformedNotification("x".into()));
        assert!(OutboundMessage::from_error("errors", &bare).key.is_empty());
    }
}
