//! Error taxonomy for the ingest pipeline.
//!
//! From the fetch stage onward errors are data: they travel on the same
//! channels as rows, wrapped in a [`StageError`] that names the reporting stage
//! and carries structured context (file, line, bucket, ...). Each
//! [`PipelineError`] maps to a [`Severity`] that decides how far the failure
//! reaches.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use thiserror::Error;

use crate::clients::{FeedError, TransportError};

/// Result type alias for pipeline operations
pub type Result<T> = std::result::Result<T, PipelineError>;

/// How far a failure reaches
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// One line or one notification; the run continues.
    Recoverable,
    /// The remainder of one file is abandoned.
    FileFatal,
    /// The whole pipeline stops.
    Fatal,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Severity::Recoverable => "recoverable",
            Severity::FileFatal => "file_fatal",
            Severity::Fatal => "fatal",
        })
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("notification feed unavailable: {0}")]
    FeedUnavailable(#[source] FeedError),

    #[error("malformed notification: {0}")]
    MalformedNotification(String),

    #[error("object s3://{bucket}/{key} not found")]
    ObjectNotFound { bucket: String, key: String },

    #[error("bucket {bucket} not found")]
    BucketNotFound { bucket: String },

    #[error("download of s3://{bucket}/{key} failed: {reason}")]
    Download {
        bucket: String,
        key: String,
        reason: String,
    },

    #[error("temporary file error: {0}")]
    TempFile(#[source] std::io::Error),

    #[error("charset detection failed: {0}")]
    EncodingDetection(#[source] std::io::Error),

    #[error("invalid header: {0}")]
    Header(String),

    #[error("malformed record: {0}")]
    MalformedRecord(String),

    #[error("stream failed: {0}")]
    Stream(#[source] std::io::Error),

    #[error("failed to serialize row: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("transport write failed: {0}")]
    Transport(#[source] TransportError),

    #[error("acknowledgment failed: {0}")]
    Acknowledge(#[source] FeedError),
}

impl PipelineError {
    pub fn severity(&self) -> Severity {
        match self {
            PipelineError::MalformedNotification(_)
            | PipelineError::ObjectNotFound { .. }
            | PipelineError::BucketNotFound { .. }
            | PipelineError::MalformedRecord(_)
            | PipelineError::Serialization(_)
            | PipelineError::Acknowledge(_) => Severity::Recoverable,
            PipelineError::TempFile(_)
            | PipelineError::EncodingDetection(_)
            | PipelineError::Header(_)
            | PipelineError::Stream(_) => Severity::FileFatal,
            PipelineError::FeedUnavailable(_)
            | PipelineError::Download { .. }
            | PipelineError::Transport(_) => Severity::Fatal,
        }
    }

    /// Stable machine-readable name
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::FeedUnavailable(_) => "feed_unavailable",
            PipelineError::MalformedNotification(_) => "malformed_notification",
            PipelineError::ObjectNotFound { .. } => "object_not_found",
            PipelineError::BucketNotFound { .. } => "bucket_not_found",
            PipelineError::Download { .. } => "download",
            PipelineError::TempFile(_) => "temp_file",
            PipelineError::EncodingDetection(_) => "encoding_detection",
            PipelineError::Header(_) => "header",
            PipelineError::MalformedRecord(_) => "malformed_record",
            PipelineError::Stream(_) => "stream",
            PipelineError::Serialization(_) => "serialization",
            PipelineError::Transport(_) => "transport",
            PipelineError::Acknowledge(_) => "acknowledge",
        }
    }
}

/// A [`PipelineError`] as reported by one stage, with context attached
#[derive(Debug, Error)]
#[error("{stage}: {kind}")]
pub struct StageError {
    kind: PipelineError,
    stage: &'static str,
    context: BTreeMap<String, Value>,
    occurred_at: DateTime<Utc>,
}

impl StageError {
    pub fn new(stage: &'static str, kind: PipelineError) -> Self {
        Self {
            kind,
            stage,
            context: BTreeMap::new(),
            occurred_at: Utc::now(),
        }
    }

    /// Adds a context entry. Existing entries are kept.
    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.context.entry(key.to_string()).or_insert_with(|| value.into());
        self
    }

    pub fn kind(&self) -> &PipelineError {
        &self.kind
    }

    pub fn stage(&self) -> &'static str {
        self.stage
    }

    pub fn severity(&self) -> Severity {
        self.kind.severity()
    }

    pub fn context(&self) -> &BTreeMap<String, Value> {
        &self.context
    }

    pub fn occurred_at(&self) -> DateTime<Utc> {
        self.occurred_at
    }

    /// Logical name of the file the error belongs to, if any
    pub fn file(&self) -> Option<&str> {
        self.context.get("file").and_then(Value::as_str)
    }

    /// Wire representation for the error topic.
    ///
    /// Errors carrying context are sent as a JSON document; bare errors as their
    /// message text.
    pub fn to_payload(&self) -> Vec<u8> {
        if self.context.is_empty() {
            return self.kind.to_string().into_bytes();
        }

        json!({
            "message": self.kind.to_string(),
            "kind": self.kind.kind(),
            "severity": self.severity(),
            "stage": self.stage,
            "occurred_at": self.occurred_at.to_rfc3339(),
            "meta": self.context,
        })
        .to_string()
        .into_bytes()
    }
}
