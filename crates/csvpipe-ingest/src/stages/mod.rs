//! Pipeline stages.
//!
//! Each stage is a value built from [`PipelineConfig`](crate::config::PipelineConfig)
//! and its collaborators, consumed by an async `run` that owns one inbound and
//! one outbound channel. Stages never know their neighbours; the pipeline wires
//! them together.

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::event::Event;
use crate::shutdown::{forward, ShutdownRx};

pub mod batch;
pub mod charset;
pub mod decode;
pub mod escalate;
pub mod fetch;
pub mod sink;
pub mod source;

pub use batch::Batch;
pub use decode::{DecodeReport, DecodeStage};
pub use escalate::{EscalationReport, EscalationStage};
pub use fetch::{FetchReport, FetchStage};
pub use sink::{SinkReport, SinkStage};
pub use source::{SourceReport, SourceStage};

/// Waits for the next inbound item. `None` once the channel is closed or
/// cancellation was requested.
pub(crate) async fn next<T>(inbound: &mut mpsc::Receiver<T>, shutdown: &ShutdownRx) -> Option<T> {
    tokio::select! {
        biased;
        _ = shutdown.cancelled() => None,
        item = inbound.recv() => item,
    }
}

/// Forwards an event downstream. Returns `false` when the stage should stop.
///
/// Items race cancellation. Error reports do not: they are only lost when the
/// next stage is gone.
pub(crate) async fn emit<T>(
    outbound: &mpsc::Sender<Event<T>>,
    event: Event<T>,
    shutdown: &ShutdownRx,
) -> bool {
    if event.error().is_none() {
        return forward(outbound, event, shutdown).await;
    }
    match outbound.send(event).await {
        Ok(()) => true,
        Err(mpsc::error::SendError(event)) => {
            if let Some(error) = event.error() {
                warn!(error = %error, "error report dropped, next stage is gone");
            }
            false
        },
    }
}

/// Passes on the error reports still queued after cancellation.
///
/// Closes `inbound`, forwards every queued [`Event::Failed`] and drops the
/// unprocessed items, whose acknowledgments are withheld. Returns the number
/// of forwarded reports.
pub(crate) async fn drain_errors<T, U>(
    inbound: &mut mpsc::Receiver<Event<T>>,
    outbound: &mpsc::Sender<Event<U>>,
) -> usize {
    inbound.close();

    let mut forwarded = 0;
    let mut dropped = 0;
    while let Some(event) = inbound.recv().await {
        match event {
            Event::Failed(error) => {
                if let Err(mpsc::error::SendError(event)) = outbound.send(Event::Failed(error)).await {
                    if let Some(error) = event.error() {
                        warn!(error = %error, "error report dropped, next stage is gone");
                    }
                    continue;
                }
                forwarded += 1;
            },
            Event::Item(_) => dropped += 1,
        }
    }

    if forwarded > 0 || dropped > 0 {
        debug!(forwarded, dropped, "inbound drained after cancellation");
    }
    forwarded
}
