use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use futures::future::join_all;
use metrics::{counter, histogram};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::batch::{Batch, BatchOffset, ParseError, Record};
use crate::sinks::{Sink, SinkError, SinkErrorKind};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DispatchMode {
    /// Deliver the whole batch to one sink before moving to the next
    Sequential,
    /// Deliver to all sinks at the same time
    Concurrent,
}

impl FromStr for DispatchMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_ref() {
            "sequential" => Ok(DispatchMode::Sequential),
            "concurrent" => Ok(DispatchMode::Concurrent),
            _ => Err(format!("Unknown dispatch mode: {s}")),
        }
    }
}

/// Lifecycle of one batch. `Committed` and `Failed` are terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InvocationState {
    Received,
    Parsed,
    Dispatching,
    Committed,
    Failed,
}

impl InvocationState {
    pub fn can_advance_to(self, next: InvocationState) -> bool {
        use InvocationState as S;
        matches!(
            (self, next),
            (S::Received, S::Parsed)
                | (S::Received, S::Failed)
                | (S::Parsed, S::Dispatching)
                | (S::Dispatching, S::Committed)
                | (S::Dispatching, S::Failed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, InvocationState::Committed | InvocationState::Failed)
    }
}

struct Invocation {
    offset: BatchOffset,
    state: InvocationState,
}

impl Invocation {
    fn new(offset: BatchOffset) -> Self {
        Self {
            offset,
            state: InvocationState::Received,
        }
    }

    fn advance(&mut self, next: InvocationState) {
        debug_assert!(
            self.state.can_advance_to(next),
            "illegal transition {:?} -> {:?}",
            self.state,
            next
        );
        debug!(offset = %self.offset, from = ?self.state, to = ?next, "invocation state");
        self.state = next;

        if next.is_terminal() {
            let outcome = match next {
                InvocationState::Committed => "committed",
                _ => "failed",
            };
            counter!("beacon_router_invocations_total", "outcome" => outcome).increment(1);
        }
    }
}

/// Result of handing one record to one sink.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DispatchOutcome<'a> {
    Committed { sink: &'a str },
    Failed { sink: &'a str, kind: SinkErrorKind },
}

impl<'a> DispatchOutcome<'a> {
    fn of(sink: &'a str, result: &Result<(), SinkError>) -> Self {
        match result {
            Ok(()) => DispatchOutcome::Committed { sink },
            Err(err) => DispatchOutcome::Failed {
                sink,
                kind: err.kind(),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SinkReport {
    pub sink: String,
    pub delivered: usize,
}

#[derive(Debug)]
pub struct SinkFailure {
    pub sink: String,
    /// Record that was rejected, `None` when the sink failed outside of a record
    pub ordinal: Option<usize>,
    /// Records committed on this sink before the failure
    pub delivered: usize,
    pub error: SinkError,
}

impl fmt::Display for SinkFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.ordinal {
            Some(ordinal) => write!(
                f,
                "{} rejected record {} ({}): {}",
                self.sink,
                ordinal,
                self.error.kind().as_str(),
                self.error
            ),
            None => write!(f, "{} failed: {}", self.sink, self.error),
        }
    }
}

fn describe(failures: &[SinkFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// The single failure reported for a batch. Records committed before the
/// failure stay committed, so retrying the batch delivers them again.
#[derive(Error, Debug)]
pub enum InvocationError {
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error("batch {offset} failed on {} sink(s): {}", .failures.len(), describe(.failures))]
    Dispatch {
        offset: BatchOffset,
        failures: Vec<SinkFailure>,
    },
    #[error("batch {offset} cancelled after {delivered} deliveries")]
    Cancelled { offset: BatchOffset, delivered: usize },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvocationReport {
    pub offset: BatchOffset,
    pub records: usize,
    pub deliveries: Vec<SinkReport>,
}

#[derive(Error, Debug)]
#[error("at least one sink must be configured")]
pub struct NoSinksConfigured;

enum SinkRun {
    Completed(SinkReport),
    Cancelled(SinkReport),
    Failed(SinkFailure),
}

/// Fans the records of a batch out to every configured sink.
///
/// Each sink sees the records strictly in ordinal order, one call at a time.
/// A sink stops at its first rejected record, later records of the batch are
/// not offered to it. There is no retry here: the whole batch is reported as
/// failed and the source decides whether to deliver it again.
pub struct Dispatcher {
    sinks: Vec<Arc<dyn Sink>>,
    mode: DispatchMode,
}

impl Dispatcher {
    pub fn new(sinks: Vec<Arc<dyn Sink>>, mode: DispatchMode) -> Result<Self, NoSinksConfigured> {
        if sinks.is_empty() {
            return Err(NoSinksConfigured);
        }
        Ok(Self { sinks, mode })
    }

    pub fn sink_names(&self) -> Vec<&str> {
        self.sinks.iter().map(|s| s.name()).collect()
    }

    #[instrument(skip_all, fields(offset = %batch.offset))]
    pub async fn invoke(
        &self,
        batch: &Batch,
        cancel: &CancellationToken,
    ) -> Result<InvocationReport, InvocationError> {
        let mut invocation = Invocation::new(batch.offset);

        let records: Vec<Record> = match batch.records() {
            Ok(records) => records.collect(),
            Err(err) => {
                invocation.advance(InvocationState::Failed);
                return Err(err.into());
            }
        };
        invocation.advance(InvocationState::Parsed);
        histogram!("beacon_router_batch_records").record(records.len() as f64);

        invocation.advance(InvocationState::Dispatching);
        let runs = match self.mode {
            DispatchMode::Sequential => {
                let mut runs = Vec::with_capacity(self.sinks.len());
                for sink in &self.sinks {
                    runs.push(deliver(sink.as_ref(), batch.offset, &records, cancel).await);
                }
                runs
            }
            DispatchMode::Concurrent => {
                join_all(
                    self.sinks
                        .iter()
                        .map(|sink| deliver(sink.as_ref(), batch.offset, &records, cancel)),
                )
                .await
            }
        };

        let mut deliveries = Vec::with_capacity(runs.len());
        let mut failures = Vec::new();
        let mut cancelled = false;
        for run in runs {
            match run {
                SinkRun::Completed(report) => deliveries.push(report),
                SinkRun::Cancelled(report) => {
                    cancelled = true;
                    deliveries.push(report);
                }
                SinkRun::Failed(failure) => failures.push(failure),
            }
        }

        if !failures.is_empty() {
            invocation.advance(InvocationState::Failed);
            return Err(InvocationError::Dispatch {
                offset: batch.offset,
                failures,
            });
        }
        if cancelled {
            invocation.advance(InvocationState::Failed);
            return Err(InvocationError::Cancelled {
                offset: batch.offset,
                delivered: deliveries.iter().map(|d| d.delivered).sum(),
            });
        }

        invocation.advance(InvocationState::Committed);
        Ok(InvocationReport {
            offset: batch.offset,
            records: records.len(),
            deliveries,
        })
    }
}

/// Deliver the records to one sink, in order, stopping at the first failure.
/// Cancellation is only checked between records: a delivery in flight is
/// always allowed to finish.
async fn deliver(
    sink: &dyn Sink,
    offset: BatchOffset,
    records: &[Record],
    cancel: &CancellationToken,
) -> SinkRun {
    let name = sink.name();
    let mut report = SinkReport {
        sink: name.to_owned(),
        delivered: 0,
    };

    if records.is_empty() {
        return SinkRun::Completed(report);
    }
    if cancel.is_cancelled() {
        return SinkRun::Cancelled(report);
    }

    let mut delivery = match sink.open(offset).await {
        Ok(delivery) => delivery,
        Err(error) => {
            warn!(sink = name, "failed to open sink: {}", error);
            return SinkRun::Failed(SinkFailure {
                sink: report.sink,
                ordinal: None,
                delivered: 0,
                error,
            });
        }
    };

    for record in records {
        if cancel.is_cancelled() {
            debug!(sink = name, delivered = report.delivered, "delivery cancelled");
            return SinkRun::Cancelled(report);
        }

        let result = delivery.accept(record).await;
        match DispatchOutcome::of(name, &result) {
            DispatchOutcome::Committed { .. } => report.delivered += 1,
            DispatchOutcome::Failed { sink, kind } => {
                counter!(
                    "beacon_router_record_delivery_errors_total",
                    "sink" => sink.to_owned(),
                    "kind" => kind.as_str()
                )
                .increment(1);
            }
        }

        if let Err(error) = result {
            warn!(
                sink = name,
                ordinal = record.ordinal(),
                skipped = records.len() - record.ordinal() - 1,
                "record rejected, aborting sink for this batch: {}",
                error
            );
            return SinkRun::Failed(SinkFailure {
                sink: report.sink,
                ordinal: Some(record.ordinal()),
                delivered: report.delivered,
                error,
            });
        }
    }

    if let Err(error) = delivery.finish().await {
        return SinkRun::Failed(SinkFailure {
            sink: report.sink,
            ordinal: None,
            delivered: report.delivered,
            error,
        });
    }
    SinkRun::Completed(report)
}
