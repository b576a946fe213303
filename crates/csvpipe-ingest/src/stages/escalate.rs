//! Error escalation: publishes every error to the error topic and passes it on
//! to the process boundary.
//!
//! Errors are batched like rows, except that a fatal error flushes at once.
//! On cancellation the pending batch is flushed and the stage keeps draining
//! until every upstream sender is gone, so reports raised during shutdown are
//! still published.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, error, info};

use super::batch::Batch;
use crate::clients::MessageTransport;
use crate::config::PipelineConfig;
use crate::error::{PipelineError, Severity, StageError};
use crate::event::OutboundMessage;
use crate::shutdown::ShutdownRx;

pub const STAGE: &str = "escalate";

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct EscalationReport {
    pub errors: usize,
    pub published: usize,
    pub flushes: usize,
    pub failed_flushes: usize,
}

pub struct EscalationStage {
    transport: Arc<dyn MessageTransport>,
    topic: String,
    batch: Batch<OutboundMessage>,
    report: EscalationReport,
}

impl EscalationStage {
    pub fn new(config: &PipelineConfig, transport: Arc<dyn MessageTransport>) -> Self {
        Self {
            transport,
            topic: config.error_topic.clone(),
            batch: Batch::new(config.error_batch_size),
            report: EscalationReport::default(),
        }
    }

    /// Fails only when the boundary stopped listening before a transport
    /// failure could be reported.
    pub async fn run(
        mut self,
        mut inbound: mpsc::Receiver<StageError>,
        reports: mpsc::Sender<StageError>,
        shutdown: ShutdownRx,
    ) -> Result<EscalationReport, StageError> {
        let mut stopping = false;

        loop {
            let next = if stopping {
                inbound.recv().await
            } else {
                tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => {
                        debug!("cancellation requested, flushing pending errors");
                        stopping = true;
                        self.flush(&reports).await?;
                        continue;
                    }
                    next = inbound.recv() => next,
                }
            };

            let Some(stage_error) = next else {
                break;
            };

            self.report.errors += 1;
            let flush_now = stage_error.severity() == Severity::Fatal || stopping;
            let full = self
                .batch
                .push(OutboundMessage::from_error(&self.topic, &stage_error));

            if reports.send(stage_error).await.is_err() {
                debug!("boundary no longer listening for reports");
            }

            if flush_now || full {
                self.flush(&reports).await?;
            }
        }

        self.flush(&reports).await?;
        info!(
            errors = self.report.errors,
            published = self.report.published,
            "escalation finished"
        );
        Ok(self.report)
    }

    async fn flush(&mut self, reports: &mpsc::Sender<StageError>) -> Result<(), StageError> {
        if self.batch.is_empty() {
            return Ok(());
        }

        let messages = self.batch.take();
        match self.transport.write(&messages).await {
            Ok(()) => {
                self.report.flushes += 1;
                self.report.published += messages.len();
                Ok(())
            },
            Err(e) => {
                self.report.failed_flushes += 1;
                for message in &messages {
                    error!(
                        key = %String::from_utf8_lossy(&message.key),
                        payload = %String::from_utf8_lossy(&message.payload),
                        "error report could not be published"
                    );
                }

                let failure = StageError::new(STAGE, PipelineError::Transport(e))
                    .with("batch_size", messages.len())
                    .with("topic", self.topic.as_str());
                reports.send(failure).await.map_err(|unsent| unsent.0)
            },
        }
    }
}
