//! Decode stage: streams CSV rows out of fetched files.
//!
//! The first record of each file is its header. Every later record is zipped
//! against the header into a [`Row`], numbered from 1 in file order. A bad
//! record costs only its own line; a failing stream abandons the rest of the
//! file. After the last row a [`FileCompletion`] carries the file's
//! acknowledgment downstream, so the sink can release it once the rows are
//! durable.

use std::collections::{BTreeMap, HashSet};

use csv_async::{AsyncReaderBuilder, StringRecord};
use tokio::sync::mpsc;
use tracing::{debug, info, info_span, Instrument};

use super::charset::{self, BoxedReader};
use super::{drain_errors, emit, next};
use crate::ack::Ack;
use crate::config::{AckPolicy, PipelineConfig};
use crate::error::{PipelineError, StageError};
use crate::event::{Decoded, Event, FetchedContent, FileCompletion, FileId, Row};
use crate::shutdown::ShutdownRx;

pub const STAGE: &str = "decode";

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DecodeReport {
    pub files: usize,
    pub rows: u64,
    pub failed_rows: u64,
    pub failed_files: usize,
    pub forwarded_errors: usize,
}

/// How decoding one file ended
enum FileOutcome {
    Done,
    /// Downstream is gone or cancellation was requested.
    Stopped,
}

pub struct DecodeStage {
    delimiter: u8,
    convert_to_utf8: bool,
    sample_lines: usize,
    ack_policy: AckPolicy,
    next_file: u64,
}

impl DecodeStage {
    pub fn new(config: &PipelineConfig) -> Self {
        Self {
            delimiter: config.delimiter,
            convert_to_utf8: config.convert_to_utf8,
            sample_lines: config.encoding_sample_lines,
            ack_policy: config.ack_policy,
            next_file: 1,
        }
    }

    pub async fn run(
        mut self,
        mut inbound: mpsc::Receiver<Event<FetchedContent>>,
        outbound: mpsc::Sender<Event<Decoded>>,
        shutdown: ShutdownRx,
    ) -> DecodeReport {
        let mut report = DecodeReport::default();

        while let Some(event) = next(&mut inbound, &shutdown).await {
            let content = match event {
                Event::Item(content) => content,
                Event::Failed(error) => {
                    report.forwarded_errors += 1;
                    if !emit(&outbound, Event::Failed(error), &shutdown).await {
                        break;
                    }
                    continue;
                },
            };

            let file = FileId(self.next_file);
            self.next_file += 1;
            report.files += 1;

            let span = info_span!("decode", file_id = %file, file = %content.name);
            let outcome = self
                .decode_file(file, content, &outbound, &shutdown, &mut report)
                .instrument(span)
                .await;
            if matches!(outcome, FileOutcome::Stopped) {
                break;
            }
        }

        if shutdown.is_shutdown() {
            report.forwarded_errors += drain_errors(&mut inbound, &outbound).await;
        }

        info!(
            files = report.files,
            rows = report.rows,
            failed_rows = report.failed_rows,
            "decode finished"
        );
        report
    }

    async fn decode_file(
        &self,
        file: FileId,
        content: FetchedContent,
        outbound: &mpsc::Sender<Event<Decoded>>,
        shutdown: &ShutdownRx,
        report: &mut DecodeReport,
    ) -> FileOutcome {
        let FetchedContent {
            name, reader, ack, ..
        } = content;

        let fail = |kind: PipelineError, line: Option<u64>| {
            let error = StageError::new(STAGE, kind).with("file", name.as_str());
            let error = match line {
                Some(line) => error.with("line", line),
                None => error,
            };
            Event::Failed(error)
        };

        let reader: BoxedReader = if self.convert_to_utf8 {
            match charset::to_utf8(reader, self.sample_lines).await {
                Ok(reader) => reader,
                Err(e) => {
                    report.failed_files += 1;
                    ack.withhold("charset detection failed");
                    return self
                        .send(outbound, fail(PipelineError::EncodingDetection(e), None), shutdown)
                        .await;
                },
            }
        } else {
            reader
        };

        let mut csv = AsyncReaderBuilder::new()
            .delimiter(self.delimiter)
            .has_headers(false)
            .flexible(true)
            .create_reader(reader);
        let mut record = StringRecord::new();

        let header: Vec<String> = match read(&mut csv, &mut record, shutdown).await {
            None => {
                ack.withhold("cancelled");
                return FileOutcome::Stopped;
            },
            Some(Ok(true)) => record.iter().map(str::to_string).collect(),
            Some(Ok(false)) => {
                debug!("empty file");
                return self.complete(file, &name, 0, 0, ack, outbound, shutdown).await;
            },
            Some(Err(e)) => {
                report.failed_files += 1;
                ack.withhold("unreadable header");
                return self
                    .send(outbound, fail(PipelineError::Header(e.to_string()), None), shutdown)
                    .await;
            },
        };

        if let Some(column) = duplicate(&header) {
            report.failed_files += 1;
            ack.withhold("duplicate header column");
            return self
                .send(
                    outbound,
                    fail(PipelineError::Header(format!("duplicate column {column:?}")), None),
                    shutdown,
                )
                .await;
        }

        let mut line = 0u64;
        let mut rows = 0u64;
        let mut failed_rows = 0u64;

        loop {
            let event = match read(&mut csv, &mut record, shutdown).await {
                None => {
                    ack.withhold("cancelled");
                    return FileOutcome::Stopped;
                },
                Some(Ok(false)) => break,
                Some(Ok(true)) => {
                    line += 1;
                    if record.len() == header.len() {
                        rows += 1;
                        Event::Item(Decoded::Row(Row {
                            file,
                            name: name.clone(),
                            line,
                            columns: header
                                .iter()
                                .cloned()
                                .zip(record.iter().map(str::to_string))
                                .collect::<BTreeMap<_, _>>(),
                        }))
                    } else {
                        failed_rows += 1;
                        fail(
                            PipelineError::MalformedRecord(format!(
                                "expected {} fields, found {}",
                                header.len(),
                                record.len()
                            )),
                            Some(line),
                        )
                    }
                },
                Some(Err(e)) if e.is_io_error() => {
                    report.rows += rows;
                    report.failed_rows += failed_rows;
                    report.failed_files += 1;
                    ack.withhold("stream failed");
                    return self
                        .send(
                            outbound,
                            fail(PipelineError::Stream(std::io::Error::other(e)), Some(line + 1)),
                            shutdown,
                        )
                        .await;
                },
                Some(Err(e)) => {
                    line += 1;
                    failed_rows += 1;
                    fail(PipelineError::MalformedRecord(e.to_string()), Some(line))
                },
            };

            if let FileOutcome::Stopped = self.send(outbound, event, shutdown).await {
                ack.withhold("cancelled");
                return FileOutcome::Stopped;
            }
        }

        report.rows += rows;
        report.failed_rows += failed_rows;
        debug!(rows, failed_rows, "file decoded");
        self.complete(file, &name, rows, failed_rows, ack, outbound, shutdown)
            .await
    }

    /// Emits the file's completion marker, withholding the acknowledgment when
    /// the policy does not allow it.
    #[allow(clippy::too_many_arguments)]
    async fn complete(
        &self,
        file: FileId,
        name: &str,
        rows: u64,
        failed_rows: u64,
        ack: Ack,
        outbound: &mpsc::Sender<Event<Decoded>>,
        shutdown: &ShutdownRx,
    ) -> FileOutcome {
        let ack = if failed_rows > 0 && self.ack_policy == AckPolicy::Strict {
            ack.withhold("file has failed lines");
            None
        } else {
            Some(ack)
        };

        let done = FileCompletion {
            file,
            name: name.to_string(),
            rows,
            failed_rows,
            ack,
        };
        self.send(outbound, Event::Item(Decoded::Completed(done)), shutdown)
            .await
    }

    async fn send(
        &self,
        outbound: &mpsc::Sender<Event<Decoded>>,
        event: Event<Decoded>,
        shutdown: &ShutdownRx,
    ) -> FileOutcome {
        if emit(outbound, event, shutdown).await {
            FileOutcome::Done
        } else {
            FileOutcome::Stopped
        }
    }
}

/// First column name that appears twice in `header`.
fn duplicate(header: &[String]) -> Option<&str> {
    let mut seen = HashSet::with_capacity(header.len());
    header
        .iter()
        .find(|column| !seen.insert(column.as_str()))
        .map(String::as_str)
}

/// Reads the next record, racing cancellation. `None` when cancelled.
async fn read(
    csv: &mut csv_async::AsyncReader<BoxedReader>,
    record: &mut StringRecord,
    shutdown: &ShutdownRx,
) -> Option<csv_async::Result<bool>> {
    tokio::select! {
        biased;
        _ = shutdown.cancelled() => None,
        read = csv.read_record(record) => Some(read),
    }
}
