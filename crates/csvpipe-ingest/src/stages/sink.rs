//! Batching sink: writes rows to the value topic in bounded batches.
//!
//! Rows are serialized into a [`Batch`] and handed to the transport when it
//! fills up, when upstream closes, or when cancellation is requested. File
//! acknowledgments arrive as [`FileCompletion`] markers behind the file's rows
//! and are released only after the batch holding those rows was written. A
//! failed write withholds every acknowledgment that depended on it.

use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::batch::Batch;
use crate::ack::Ack;
use crate::clients::MessageTransport;
use crate::config::{AckPolicy, PipelineConfig};
use crate::error::{PipelineError, Severity, StageError};
use crate::event::{Decoded, Event, FileCompletion, FileId, OutboundMessage, Row};
use crate::shutdown::ShutdownRx;

pub const STAGE: &str = "sink";

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SinkReport {
    pub rows_written: u64,
    pub flushes: usize,
    pub failed_flushes: usize,
    pub acks: usize,
    pub withheld_acks: usize,
    pub forwarded_errors: usize,
}

pub struct SinkStage {
    transport: Arc<dyn MessageTransport>,
    topic: String,
    ack_policy: AckPolicy,
    batch: Batch<OutboundMessage>,
    /// Files with at least one row in the current batch
    batch_files: HashSet<FileId>,
    /// Completions waiting for the current batch, in arrival order
    deferred: Vec<(FileId, String, Ack)>,
    /// Files that lost rows; their completion must not acknowledge
    poisoned: HashSet<FileId>,
    report: SinkReport,
}

impl SinkStage {
    pub fn new(config: &PipelineConfig, transport: Arc<dyn MessageTransport>) -> Self {
        Self {
            transport,
            topic: config.value_topic.clone(),
            ack_policy: config.ack_policy,
            batch: Batch::new(config.batch_size),
            batch_files: HashSet::new(),
            deferred: Vec::new(),
            poisoned: HashSet::new(),
            report: SinkReport::default(),
        }
    }

    /// Runs until upstream closes or cancellation is requested, then flushes
    /// whatever is left.
    ///
    /// Errors go to `errors` without racing cancellation, so reports produced
    /// during shutdown still reach the escalation stage. Fails only when such a
    /// report cannot be delivered.
    pub async fn run(
        mut self,
        mut inbound: mpsc::Receiver<Event<Decoded>>,
        errors: mpsc::Sender<StageError>,
        shutdown: ShutdownRx,
    ) -> Result<SinkReport, StageError> {
        loop {
            let event = tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    debug!("cancellation requested, draining buffered events");
                    inbound.close();
                    while let Ok(event) = inbound.try_recv() {
                        self.handle(event, &errors).await?;
                    }
                    break;
                }
                event = inbound.recv() => event,
            };

            match event {
                Some(event) => self.handle(event, &errors).await?,
                None => break,
            }
        }

        self.flush(&errors).await?;
        if !self.poisoned.is_empty() {
            debug!(files = self.poisoned.len(), "files left unacknowledged");
        }

        info!(
            rows = self.report.rows_written,
            flushes = self.report.flushes,
            acks = self.report.acks,
            "sink finished"
        );
        Ok(self.report)
    }

    async fn handle(
        &mut self,
        event: Event<Decoded>,
        errors: &mpsc::Sender<StageError>,
    ) -> Result<(), StageError> {
        match event {
            Event::Failed(error) => {
                self.report.forwarded_errors += 1;
                report(errors, error).await
            },
            Event::Item(Decoded::Row(row)) => self.accept(row, errors).await,
            Event::Item(Decoded::Completed(done)) => self.complete_file(done, errors).await,
        }
    }

    async fn accept(&mut self, row: Row, errors: &mpsc::Sender<StageError>) -> Result<(), StageError> {
        let message = match OutboundMessage::from_row(&self.topic, &row) {
            Ok(message) => message,
            Err(e) => {
                if self.ack_policy == AckPolicy::Strict {
                    self.poisoned.insert(row.file);
                }
                let error = StageError::new(STAGE, PipelineError::Serialization(e))
                    .with("file", row.name)
                    .with("line", row.line);
                return report(errors, error).await;
            },
        };

        self.batch_files.insert(row.file);
        if self.batch.push(message) {
            self.flush(errors).await?;
        }
        Ok(())
    }

    async fn complete_file(
        &mut self,
        done: FileCompletion,
        errors: &mpsc::Sender<StageError>,
    ) -> Result<(), StageError> {
        let poisoned = self.poisoned.remove(&done.file);
        let Some(ack) = done.ack else {
            self.report.withheld_acks += 1;
            return Ok(());
        };

        if poisoned {
            self.report.withheld_acks += 1;
            ack.withhold("rows of this file were not written");
        } else if self.batch_files.contains(&done.file) {
            self.deferred.push((done.file, done.name, ack));
        } else {
            self.acknowledge(ack, &done.name, errors).await?;
        }
        Ok(())
    }

    /// Writes the current batch, then releases the completions waiting on it.
    async fn flush(&mut self, errors: &mpsc::Sender<StageError>) -> Result<(), StageError> {
        if self.batch.is_empty() {
            return Ok(());
        }

        let size = self.batch.len();
        let files = std::mem::take(&mut self.batch_files);
        let deferred = std::mem::take(&mut self.deferred);

        match self.transport.write(self.batch.items()).await {
            Ok(()) => {
                self.batch.clear();
                self.report.flushes += 1;
                self.report.rows_written += size as u64;
                debug!(size, "batch flushed");

                for (_, name, ack) in deferred {
                    self.acknowledge(ack, &name, errors).await?;
                }
                Ok(())
            },
            Err(e) => {
                self.batch.clear();
                self.report.failed_flushes += 1;
                error!(size, error = %e, "batch write failed");

                // Completions already seen for this batch are dropped here; the
                // remaining files must not acknowledge later.
                let completed: HashSet<FileId> = deferred.iter().map(|(file, _, _)| *file).collect();
                self.poisoned
                    .extend(files.into_iter().filter(|file| !completed.contains(file)));
                for (_, _, ack) in deferred {
                    self.report.withheld_acks += 1;
                    ack.withhold("batch write failed");
                }

                let error = StageError::new(STAGE, PipelineError::Transport(e))
                    .with("batch_size", size)
                    .with("topic", self.topic.as_str());
                report(errors, error).await
            },
        }
    }

    async fn acknowledge(
        &mut self,
        ack: Ack,
        file: &str,
        errors: &mpsc::Sender<StageError>,
    ) -> Result<(), StageError> {
        match ack.complete().await {
            Ok(()) => {
                self.report.acks += 1;
                Ok(())
            },
            Err(e) => {
                warn!(error = %e, "acknowledgment failed");
                let error = StageError::new(STAGE, PipelineError::Acknowledge(e)).with("file", file);
                report(errors, error).await
            },
        }
    }
}

/// Hands an error to the escalation stage. Fails only if it is gone.
async fn report(errors: &mpsc::Sender<StageError>, error: StageError) -> Result<(), StageError> {
    match errors.send(error).await {
        Ok(()) => Ok(()),
        Err(mpsc::error::SendError(error)) => {
            if error.severity() == Severity::Fatal {
                error!(error = %error, "error stage gone, cannot report");
            }
            Err(error)
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shutdown::create_shutdown_channel;
    use crate::test_support::{AckLog, RecordingTransport};
    use std::collections::BTreeMap;

    fn row(file: u64, name: &str, line: u64) -> Event<Decoded> {
        Event::Item(Decoded::Row(Row {
            file: FileId(file),
            name: name.into(),
            line,
            columns: BTreeMap::from([("n".to_string(), line.to_string())]),
        }))
    }

    fn done(file: u64, name: &str, ack: Option<Ack>) -> Event<Decoded> {
        Event::Item(Decoded::Completed(FileCompletion {
            file: FileId(file),
            name: name.into(),
            rows: 0,
            failed_rows: 0,
            ack,
        }))
    }

    fn config(batch_size: usize) -> PipelineConfig {
        PipelineConfig {
            batch_size,
            ..Default::default()
        }
    }

    async fn run_sink(
        config: PipelineConfig,
        transport: Arc<RecordingTransport>,
        events: Vec<Event<Decoded>>,
    ) -> (SinkReport, Vec<StageError>) {
        let (_shutdown_tx, shutdown_rx) = create_shutdown_channel();
        let (in_tx, in_rx) = mpsc::channel(events.len().max(1));
        let (err_tx, mut err_rx) = mpsc::channel(64);

        for event in events {
            in_tx.send(event).await.unwrap();
        }
        drop(in_tx);

        let report = SinkStage::new(&config, transport)
            .run(in_rx, err_tx, shutdown_rx)
            .await
            .unwrap();

        let mut errors = Vec::new();
        while let Some(error) = err_rx.recv().await {
            errors.push(error);
        }
        (report, errors)
    }

    #[tokio::test]
    async fn test_threshold_plus_one_gives_two_writes_and_ordered_acks() {
        let transport = Arc::new(RecordingTransport::default());
        let log = AckLog::default();

        let mut events = Vec::new();
        for file in 1..=4u64 {
            let name = format!("f{file}.csv");
            events.push(row(file, &name, 1));
            events.push(done(file, &name, Some(log.ack(&name))));
        }
        events.push(row(5, "f5.csv", 1));
        events.push(done(5, "f5.csv", Some(log.ack("f5.csv"))));

        let (report, errors) = run_sink(config(4), transport.clone(), events).await;

        assert!(errors.is_empty());
        assert_eq!(transport.batch_sizes(), vec![4, 1]);
        assert_eq!(log.completed(), vec!["f1.csv", "f2.csv", "f3.csv", "f4.csv", "f5.csv"]);
        assert_eq!(report.acks, 5);
        assert_eq!(report.rows_written, 5);
    }

    #[tokio::test]
    async fn test_ack_waits_for_flush() {
        let transport = Arc::new(RecordingTransport::default());
        let log = AckLog::default();
        let (_shutdown_tx, shutdown_rx) = create_shutdown_channel();
        let (in_tx, in_rx) = mpsc::channel(8);
        let (err_tx, _err_rx) = mpsc::channel(8);

        let worker = tokio::spawn(SinkStage::new(&config(100), transport.clone()).run(in_rx, err_tx, shutdown_rx));

        in_tx.send(row(1, "a.csv", 1)).await.unwrap();
        in_tx.send(row(1, "a.csv", 2)).await.unwrap();
        in_tx.send(done(1, "a.csv", Some(log.ack("a.csv")))).await.unwrap();
        tokio::task::yield_now().await;
        assert!(log.completed().is_empty());

        drop(in_tx);
        worker.await.unwrap().unwrap();
        assert_eq!(transport.batch_sizes(), vec![2]);
        assert_eq!(log.completed(), vec!["a.csv"]);
    }

    #[tokio::test]
    async fn test_failed_write_fires_no_acks_and_one_error() {
        let transport = RecordingTransport::failing();
        let log = AckLog::default();

        let events = vec![
            row(1, "a.csv", 1),
            done(1, "a.csv", Some(log.ack("a.csv"))),
            row(2, "b.csv", 1),
            done(2, "b.csv", Some(log.ack("b.csv"))),
            row(3, "c.csv", 1),
            done(3, "c.csv", Some(log.ack("c.csv"))),
        ];

        let (report, errors) = run_sink(config(100), transport, events).await;

        assert!(log.completed().is_empty());
        assert_eq!(errors.len(), 1);
        assert!(matches!(errors[0].kind(), PipelineError::Transport(_)));
        assert_eq!(errors[0].severity(), Severity::Fatal);
        assert_eq!(errors[0].context()["batch_size"], 3);
        assert_eq!(report.failed_flushes, 1);
        assert_eq!(report.acks, 0);
    }

    #[tokio::test]
    async fn test_file_spanning_failed_batch_is_not_acknowledged() {
        let transport = Arc::new(RecordingTransport::default());
        let log = AckLog::default();
        let (_shutdown_tx, shutdown_rx) = create_shutdown_channel();
        let (in_tx, in_rx) = mpsc::channel(8);
        let (err_tx, mut err_rx) = mpsc::channel(8);

        transport.set_failing(true);
        let worker = tokio::spawn(SinkStage::new(&config(2), transport.clone()).run(in_rx, err_tx, shutdown_rx));

        in_tx.send(row(1, "a.csv", 1)).await.unwrap();
        in_tx.send(row(1, "a.csv", 2)).await.unwrap();
        assert!(err_rx.recv().await.is_some());

        transport.set_failing(false);
        in_tx.send(row(1, "a.csv", 3)).await.unwrap();
        in_tx.send(done(1, "a.csv", Some(log.ack("a.csv")))).await.unwrap();
        in_tx.send(row(2, "b.csv", 1)).await.unwrap();
        in_tx.send(done(2, "b.csv", Some(log.ack("b.csv")))).await.unwrap();
        drop(in_tx);

        let report = worker.await.unwrap().unwrap();
        assert_eq!(transport.batch_sizes(), vec![2]);
        assert_eq!(log.completed(), vec!["b.csv"]);
        assert_eq!(report.withheld_acks, 1);
    }

    #[tokio::test]
    async fn test_completion_without_pending_rows_acks_immediately() {
        let transport = Arc::new(RecordingTransport::default());
        let log = AckLog::default();

        let (report, _) = run_sink(config(100), transport.clone(), vec![done(1, "empty.csv", Some(log.ack("empty.csv")))]).await;

        assert_eq!(log.completed(), vec!["empty.csv"]);
        assert!(transport.batch_sizes().is_empty());
        assert_eq!(report.acks, 1);
    }

    #[tokio::test]
    async fn test_errors_forwarded_not_batched() {
        let transport = Arc::new(RecordingTransport::default());
        let upstream = StageError::new("decode", PipelineError::MalformedRecord("bad".into()));

        let (report, errors) = run_sink(
            config(100),
            transport.clone(),
            vec![Event::Failed(upstream), row(1, "a.csv", 1), done(1, "a.csv", None)],
        )
        .await;

        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].stage(), "decode");
        assert_eq!(transport.batch_sizes(), vec![1]);
        assert_eq!(report.withheld_acks, 1);
    }

    #[tokio::test]
    async fn test_cancellation_flushes_partial_batch_once() {
        let transport = Arc::new(RecordingTransport::default());
        let log = AckLog::default();
        let (shutdown_tx, shutdown_rx) = create_shutdown_channel();
        let (in_tx, in_rx) = mpsc::channel(1);
        let (err_tx, _err_rx) = mpsc::channel(8);

        let worker = tokio::spawn(SinkStage::new(&config(100), transport.clone()).run(in_rx, err_tx, shutdown_rx));

        for line in 1..=7 {
            in_tx.send(row(1, "seven.csv", line)).await.unwrap();
        }
        in_tx.send(done(1, "seven.csv", Some(log.ack("seven.csv")))).await.unwrap();
        shutdown_tx.shutdown();

        let report = tokio::time::timeout(std::time::Duration::from_secs(5), worker)
            .await
            .expect("sink stops")
            .unwrap()
            .unwrap();

        assert_eq!(transport.batch_sizes(), vec![7]);
        assert_eq!(report.flushes, 1);
        assert_eq!(log.completed(), vec!["seven.csv"]);
        drop(in_tx);
    }
}
