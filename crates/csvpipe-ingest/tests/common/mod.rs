//! Shared in-memory collaborators for pipeline integration tests

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use csvpipe_ingest::clients::{
    DownloadError, FeedError, FeedMessage, MessageTransport, NotificationFeed, ObjectStore,
    TransportError,
};
use csvpipe_ingest::pipeline::Collaborators;
use csvpipe_ingest::OutboundMessage;
use tokio::io::{AsyncWrite, AsyncWriteExt};

/// Serves scripted polls in order, then empty polls. Records deletes.
#[derive(Default)]
pub struct RecordingFeed {
    polls: Mutex<VecDeque<Result<Vec<FeedMessage>, FeedError>>>,
    deleted: Mutex<Vec<String>>,
}

impl RecordingFeed {
    pub fn new(polls: Vec<Result<Vec<FeedMessage>, FeedError>>) -> Arc<Self> {
        Arc::new(Self {
            polls: Mutex::new(polls.into()),
            deleted: Mutex::default(),
        })
    }

    pub fn unavailable() -> Arc<Self> {
        Self::new(vec![Err(FeedError::Unavailable {
            queue: "s3-events".into(),
            reason: "connection refused".into(),
        })])
    }

    pub fn deleted(&self) -> Vec<String> {
        self.deleted.lock().unwrap().clone()
    }
}

#[async_trait]
impl NotificationFeed for RecordingFeed {
    async fn receive(&self, max: usize) -> Result<Vec<FeedMessage>, FeedError> {
        let next = self.polls.lock().unwrap().pop_front();
        next.unwrap_or_else(|| Ok(Vec::new())).map(|mut messages| {
            messages.truncate(max);
            messages
        })
    }

    async fn delete(&self, receipt_handle: &str) -> Result<(), FeedError> {
        self.deleted.lock().unwrap().push(receipt_handle.to_string());
        Ok(())
    }
}

/// An S3 event notification for one object
pub fn s3_event(receipt: &str, bucket: &str, key: &str, size: u64) -> FeedMessage {
    FeedMessage {
        body: serde_json::json!({
            "Records": [{
                "eventVersion": "2.1",
                "eventSource": "aws:s3",
                "awsRegion": "eu-west-1",
                "eventName": "ObjectCreated:Put",
                "s3": {
                    "s3SchemaVersion": "1.0",
                    "bucket": { "name": bucket, "arn": format!("arn:aws:s3:::{bucket}") },
                    "object": { "key": key, "size": size }
                }
            }]
        })
        .to_string(),
        receipt_handle: receipt.to_string(),
    }
}

/// Objects keyed by object key; anything unknown is not found.
#[derive(Default)]
pub struct ScriptedStore {
    objects: HashMap<String, Vec<u8>>,
    unreachable: bool,
}

impl ScriptedStore {
    pub fn with(mut self, key: &str, content: impl Into<Vec<u8>>) -> Self {
        self.objects.insert(key.to_string(), content.into());
        self
    }

    pub fn unreachable() -> Self {
        Self {
            unreachable: true,
            ..Default::default()
        }
    }
}

#[async_trait]
impl ObjectStore for ScriptedStore {
    async fn download(
        &self,
        _bucket: &str,
        key: &str,
        dest: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<u64, DownloadError> {
        if self.unreachable {
            return Err(DownloadError::Other("dispatch failure: connection reset".into()));
        }
        let content = self.objects.get(key).ok_or(DownloadError::NotFound)?;
        dest.write_all(content).await?;
        Ok(content.len() as u64)
    }
}

/// Records successful writes; fails every write while `failing` is set.
#[derive(Default)]
pub struct RecordingTransport {
    writes: Mutex<Vec<Vec<OutboundMessage>>>,
    failing: AtomicBool,
}

impl RecordingTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing() -> Arc<Self> {
        let transport = Self::default();
        transport.failing.store(true, Ordering::SeqCst);
        Arc::new(transport)
    }

    pub fn batch_sizes(&self) -> Vec<usize> {
        self.writes.lock().unwrap().iter().map(Vec::len).collect()
    }

    pub fn messages(&self) -> Vec<OutboundMessage> {
        self.writes.lock().unwrap().iter().flatten().cloned().collect()
    }

    pub fn payloads(&self) -> Vec<serde_json::Value> {
        self.messages()
            .iter()
            .map(|message| serde_json::from_slice(&message.payload).unwrap())
            .collect()
    }
}

#[async_trait]
impl MessageTransport for RecordingTransport {
    async fn write(&self, messages: &[OutboundMessage]) -> Result<(), TransportError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(TransportError::Unavailable("all brokers down".into()));
        }
        self.writes.lock().unwrap().push(messages.to_vec());
        Ok(())
    }
}

pub fn collaborators(
    feed: &Arc<RecordingFeed>,
    store: ScriptedStore,
    values: &Arc<RecordingTransport>,
    errors: &Arc<RecordingTransport>,
) -> Collaborators {
    Collaborators {
        feed: feed.clone(),
        store: Arc::new(store),
        values: values.clone(),
        errors: errors.clone(),
    }
}
