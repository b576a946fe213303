//! In-memory collaborators for unit tests

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::ack::Ack;
use crate::clients::{
    DownloadError, FeedError, FeedMessage, MessageTransport, NotificationFeed, ObjectStore,
    TransportError,
};
use crate::event::OutboundMessage;

/// Returns scripted polls, then empty ones; records deletes.
#[derive(Default)]
pub struct MockFeed {
    polls: Mutex<VecDeque<Result<Vec<FeedMessage>, FeedError>>>,
    deleted: Mutex<Vec<String>>,
}

impl MockFeed {
    pub fn new(polls: Vec<Result<Vec<FeedMessage>, FeedError>>) -> Arc<Self> {
        Arc::new(Self {
            polls: Mutex::new(polls.into()),
            deleted: Mutex::default(),
        })
    }

    pub fn deleted(&self) -> Vec<String> {
        self.deleted.lock().unwrap().clone()
    }
}

#[async_trait]
impl NotificationFeed for MockFeed {
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

pub fn message(receipt: &str, bucket: &str, key: &str) -> FeedMessage {
    FeedMessage {
        body: serde_json::json!({
            "Records": [{
                "eventSource": "aws:s3",
                "s3": {
                    "bucket": { "name": bucket },
                    "object": { "key": key, "size": 42 }
                }
            }]
        })
        .to_string(),
        receipt_handle: receipt.to_string(),
    }
}

/// Unknown keys are not found.
pub enum StoredObject {
    Content(Vec<u8>),
    BucketNotFound,
    Unreachable,
}

#[derive(Default)]
pub struct MockStore {
    objects: HashMap<String, StoredObject>,
}

impl MockStore {
    pub fn with(mut self, key: &str, object: StoredObject) -> Self {
        self.objects.insert(key.to_string(), object);
        self
    }
}

#[async_trait]
impl ObjectStore for MockStore {
    async fn download(
        &self,
        _bucket: &str,
        key: &str,
        dest: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<u64, DownloadError> {
        match self.objects.get(key) {
            Some(StoredObject::Content(bytes)) => {
                dest.write_all(bytes).await?;
                Ok(bytes.len() as u64)
            },
            Some(StoredObject::BucketNotFound) => Err(DownloadError::BucketNotFound),
            Some(StoredObject::Unreachable) => Err(DownloadError::Other("connection refused".into())),
            None => Err(DownloadError::NotFound),
        }
    }
}

/// Records every write; fails while `failing` is set.
#[derive(Default)]
pub struct RecordingTransport {
    writes: Mutex<Vec<Vec<OutboundMessage>>>,
    failing: AtomicBool,
}

impl RecordingTransport {
    pub fn failing() -> Arc<Self> {
        let transport = Self::default();
        transport.failing.store(true, Ordering::SeqCst);
        Arc::new(transport)
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn batch_sizes(&self) -> Vec<usize> {
        self.writes.lock().unwrap().iter().map(Vec::len).collect()
    }

    pub fn messages(&self) -> Vec<OutboundMessage> {
        self.writes.lock().unwrap().iter().flatten().cloned().collect()
    }
}

#[async_trait]
impl MessageTransport for RecordingTransport {
    async fn write(&self, messages: &[OutboundMessage]) -> Result<(), TransportError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(TransportError::Unavailable("broker down".into()));
        }
        self.writes.lock().unwrap().push(messages.to_vec());
        Ok(())
    }
}

/// Acks that append their label to a shared log when completed.
#[derive(Clone, Default)]
pub struct AckLog(Arc<Mutex<Vec<String>>>);

impl AckLog {
    pub fn ack(&self, label: &str) -> Ack {
        let log = Arc::clone(&self.0);
        let label = label.to_string();
        Ack::from_fn(move || log.lock().unwrap().push(label))
    }

    pub fn completed(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }
}

/// Counts completions.
#[derive(Clone, Default)]
pub struct AckCounter(Arc<AtomicUsize>);

impl AckCounter {
    pub fn ack(&self) -> Ack {
        let count = Arc::clone(&self.0);
        Ack::from_fn(move || {
            count.fetch_add(1, Ordering::SeqCst);
        })
    }

    pub fn count(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}
