//! Pipeline wiring and the run loop at the process boundary.
//!
//! `Source → Fetch → Decode → Sink` are joined by bounded channels; errors ride
//! the same channels until the sink hands them to the escalation stage, which
//! publishes them and reports them here. A fatal report cancels the run.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, info_span, warn, Instrument, Span};
use uuid::Uuid;

use crate::clients::{MessageTransport, NotificationFeed, ObjectStore};
use crate::config::{ConfigError, PipelineConfig};
use crate::error::{Severity, StageError};
use crate::shutdown::ShutdownTx;
use crate::stages::{
    DecodeReport, DecodeStage, EscalationReport, EscalationStage, FetchReport, FetchStage,
    SinkReport, SinkStage, SourceReport, SourceStage,
};

/// Everything the pipeline talks to
#[derive(Clone)]
pub struct Collaborators {
    pub feed: Arc<dyn NotificationFeed>,
    pub store: Arc<dyn ObjectStore>,
    /// Transport for the value topic
    pub values: Arc<dyn MessageTransport>,
    /// Transport for the error topic
    pub errors: Arc<dyn MessageTransport>,
}

/// Outcome of one pipeline run
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub run_id: String,
    pub recoverable: usize,
    pub file_fatal: usize,
    pub fatal: usize,
    pub source: SourceReport,
    pub fetch: FetchReport,
    pub decode: DecodeReport,
    pub sink: SinkReport,
    pub escalation: EscalationReport,
}

impl RunSummary {
    /// Recoverable and file-fatal errors alone do not fail a run.
    pub fn is_success(&self) -> bool {
        self.fatal == 0
    }

    pub fn exit_code(&self) -> i32 {
        if self.is_success() {
            0
        } else {
            1
        }
    }

    fn record(&mut self, severity: Severity) {
        match severity {
            Severity::Recoverable => self.recoverable += 1,
            Severity::FileFatal => self.file_fatal += 1,
            Severity::Fatal => self.fatal += 1,
        }
    }
}

struct Handles {
    source: JoinHandle<SourceReport>,
    fetch: JoinHandle<FetchReport>,
    decode: JoinHandle<DecodeReport>,
    sink: JoinHandle<Result<SinkReport, StageError>>,
    escalate: JoinHandle<Result<EscalationReport, StageError>>,
}

/// A running pipeline. Every stage worker is started by [`Pipeline::spawn`].
pub struct Pipeline {
    run_id: Uuid,
    span: Span,
    shutdown: ShutdownTx,
    reports: mpsc::Receiver<StageError>,
    handles: Handles,
}

impl Pipeline {
    /// Validates `config` and starts one worker per stage.
    pub fn spawn(
        config: &PipelineConfig,
        collaborators: Collaborators,
        shutdown: ShutdownTx,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        let run_id = Uuid::new_v4();
        let span = info_span!("pipeline", run_id = %run_id);
        let capacity = config.channel_capacity;

        let (notifications_tx, notifications_rx) = mpsc::channel(capacity);
        let (contents_tx, contents_rx) = mpsc::channel(capacity);
        let (decoded_tx, decoded_rx) = mpsc::channel(capacity);
        let (errors_tx, errors_rx) = mpsc::channel(capacity);
        let (reports_tx, reports_rx) = mpsc::channel(capacity);

        let source = SourceStage::new(config, collaborators.feed);
        let fetch = FetchStage::new(config, collaborators.store);
        let decode = DecodeStage::new(config);
        let sink = SinkStage::new(config, collaborators.values);
        let escalate = EscalationStage::new(config, collaborators.errors);

        let handles = Handles {
            source: tokio::spawn(
                source
                    .run(notifications_tx, shutdown.subscribe())
                    .instrument(info_span!(parent: &span, "source")),
            ),
            fetch: tokio::spawn(
                fetch
                    .run(notifications_rx, contents_tx, shutdown.subscribe())
                    .instrument(info_span!(parent: &span, "fetch_stage")),
            ),
            decode: tokio::spawn(
                decode
                    .run(contents_rx, decoded_tx, shutdown.subscribe())
                    .instrument(info_span!(parent: &span, "decode_stage")),
            ),
            sink: tokio::spawn(
                sink.run(decoded_rx, errors_tx, shutdown.subscribe())
                    .instrument(info_span!(parent: &span, "sink")),
            ),
            escalate: tokio::spawn(
                escalate
                    .run(errors_rx, reports_tx, shutdown.subscribe())
                    .instrument(info_span!(parent: &span, "escalate")),
            ),
        };

        info!(parent: &span, "pipeline started");

        Ok(Self {
            run_id,
            span,
            shutdown,
            reports: reports_rx,
            handles,
        })
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Drains error reports until every stage has finished, then joins the
    /// workers. A fatal report cancels the run.
    pub async fn run(self) -> RunSummary {
        let Pipeline {
            run_id,
            span,
            shutdown,
            mut reports,
            handles,
        } = self;

        async move {
            let mut summary = RunSummary {
                run_id: run_id.to_string(),
                ..Default::default()
            };

            while let Some(report) = reports.recv().await {
                let severity = report.severity();
                summary.record(severity);
                match severity {
                    Severity::Recoverable | Severity::FileFatal => {
                        warn!(severity = %severity, error = %report, context = ?report.context(), "pipeline error");
                    },
                    Severity::Fatal => {
                        error!(error = %report, context = ?report.context(), "fatal pipeline error, stopping");
                        shutdown.shutdown();
                    },
                }
            }

            summary.source = join("source", handles.source, &mut summary.fatal).await.unwrap_or_default();
            summary.fetch = join("fetch", handles.fetch, &mut summary.fatal).await.unwrap_or_default();
            summary.decode = join("decode", handles.decode, &mut summary.fatal).await.unwrap_or_default();
            summary.sink = join_fallible("sink", handles.sink, &mut summary.fatal).await;
            summary.escalation = join_fallible("escalate", handles.escalate, &mut summary.fatal).await;

            info!(
                recoverable = summary.recoverable,
                file_fatal = summary.file_fatal,
                fatal = summary.fatal,
                rows = summary.sink.rows_written,
                acks = summary.sink.acks,
                "pipeline finished"
            );
            summary
        }
        .instrument(span)
        .await
    }
}

async fn join<T>(stage: &str, handle: JoinHandle<T>, fatal: &mut usize) -> Option<T> {
    match handle.await {
        Ok(report) => Some(report),
        Err(e) => {
            error!(stage, error = %e, "stage worker failed");
            *fatal += 1;
            None
        },
    }
}

async fn join_fallible<T: Default>(
    stage: &str,
    handle: JoinHandle<Result<T, StageError>>,
    fatal: &mut usize,
) -> T {
    match join(stage, handle, fatal).await {
        Some(Ok(report)) => report,
        Some(Err(e)) => {
            error!(stage, error = %e, "stage ended with an unreported error");
            *fatal += 1;
            T::default()
        },
        None => T::default(),
    }
}
