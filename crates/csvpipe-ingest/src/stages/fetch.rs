//! Fetch stage: downloads each notified object into an anonymous temp file.
//!
//! The temp file is unlinked on creation and disappears when the decode stage
//! drops its reader. Failed downloads keep the notification unacknowledged.

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::fs::File;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, info, info_span, Instrument};

use super::{drain_errors, emit, next};
use crate::clients::{DownloadError, ObjectStore};
use crate::config::PipelineConfig;
use crate::error::{PipelineError, StageError};
use crate::event::{Event, FetchedContent, Notification};
use crate::shutdown::ShutdownRx;

pub const STAGE: &str = "fetch";

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FetchReport {
    pub fetched: usize,
    pub bytes: u64,
    pub failed: usize,
    pub forwarded_errors: usize,
}

pub struct FetchStage {
    store: Arc<dyn ObjectStore>,
    temp_dir: Option<PathBuf>,
}

impl FetchStage {
    pub fn new(config: &PipelineConfig, store: Arc<dyn ObjectStore>) -> Self {
        Self {
            store,
            temp_dir: config.temp_dir.clone(),
        }
    }

    pub async fn run(
        self,
        mut inbound: mpsc::Receiver<Event<Notification>>,
        outbound: mpsc::Sender<Event<FetchedContent>>,
        shutdown: ShutdownRx,
    ) -> FetchReport {
        let mut report = FetchReport::default();

        while let Some(event) = next(&mut inbound, &shutdown).await {
            let fetched = match event {
                Event::Failed(error) => {
                    report.forwarded_errors += 1;
                    Event::Failed(error)
                },
                Event::Item(notification) => {
                    let span = info_span!("fetch", bucket = %notification.bucket, key = %notification.key);
                    let fetched = self.fetch(notification).instrument(span).await;
                    match &fetched {
                        Ok((_, bytes)) => {
                            report.fetched += 1;
                            report.bytes += bytes;
                        },
                        Err(_) => report.failed += 1,
                    }
                    match fetched {
                        Ok((content, _)) => Event::Item(content),
                        Err(error) => Event::Failed(error),
                    }
                },
            };

            if !emit(&outbound, fetched, &shutdown).await {
                break;
            }
        }

        if shutdown.is_shutdown() {
            report.forwarded_errors += drain_errors(&mut inbound, &outbound).await;
        }

        info!(
            fetched = report.fetched,
            failed = report.failed,
            bytes = report.bytes,
            "fetch finished"
        );
        report
    }

    async fn fetch(&self, notification: Notification) -> Result<(FetchedContent, u64), StageError> {
        let Notification {
            bucket, key, ack, ..
        } = notification;

        let context = |error: StageError| {
            error
                .with("file", key.as_str())
                .with("bucket", bucket.as_str())
                .with("key", key.as_str())
        };

        let downloaded = async {
            let mut file = File::from_std(self.temp_file().await.map_err(PipelineError::TempFile)?);
            let bytes = self
                .store
                .download(&bucket, &key, &mut file)
                .await
                .map_err(|e| classify(e, &bucket, &key))?;
            file.flush().await.map_err(PipelineError::TempFile)?;
            file.rewind().await.map_err(PipelineError::TempFile)?;
            Ok::<_, PipelineError>((file, bytes))
        }
        .await;

        match downloaded {
            Ok((file, bytes)) => {
                debug!(bytes, "object fetched");
                Ok((
                    FetchedContent {
                        name: key.clone(),
                        bucket,
                        key,
                        reader: Box::new(file),
                        ack,
                    },
                    bytes,
                ))
            },
            Err(kind) => {
                ack.withhold("fetch failed");
                Err(context(StageError::new(STAGE, kind)))
            },
        }
    }

    async fn temp_file(&self) -> io::Result<std::fs::File> {
        let dir = self.temp_dir.clone();
        tokio::task::spawn_blocking(move || match dir {
            Some(dir) => tempfile::tempfile_in(dir),
            None => tempfile::tempfile(),
        })
        .await
        .map_err(io::Error::other)?
    }
}

fn classify(error: DownloadError, bucket: &str, key: &str) -> PipelineError {
    match error {
        DownloadError::NotFound => PipelineError::ObjectNotFound {
            bucket: bucket.to_string(),
            key: key.to_string(),
        },
        DownloadError::BucketNotFound => PipelineError::BucketNotFound {
            bucket: bucket.to_string(),
        },
        DownloadError::Write(e) => PipelineError::TempFile(e),
        DownloadError::Other(reason) => PipelineError::Download {
            bucket: bucket.to_string(),
            key: key.to_string(),
            reason,
        },
    }
}
