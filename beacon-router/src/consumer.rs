use std::sync::Arc;
use std::time::Duration;

use health::HealthHandle;
use metrics::{counter, histogram};
use time::OffsetDateTime;
use tokio::time::{sleep, timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::batch::Batch;
use crate::dispatcher::{Dispatcher, InvocationError};
use crate::retry::{Backoff, RetryPolicy};
use crate::source::{MessageSource, SourceError};

/// Pulls batches from a source, runs them through the dispatcher and reports
/// the outcome back so the source can move on or hand the batch out again.
pub struct BatchConsumerLoop {
    source: Arc<dyn MessageSource>,
    dispatcher: Dispatcher,
    liveness: HealthHandle,
    retry_policy: RetryPolicy,
    invocation_timeout: Duration,
    poll_timeout: Duration,
}

impl BatchConsumerLoop {
    pub fn new(
        source: Arc<dyn MessageSource>,
        dispatcher: Dispatcher,
        liveness: HealthHandle,
        retry_policy: RetryPolicy,
        invocation_timeout: Duration,
        poll_timeout: Duration,
    ) -> Self {
        Self {
            source,
            dispatcher,
            liveness,
            retry_policy,
            invocation_timeout,
            poll_timeout,
        }
    }

    /// Runs until shutdown. Fails when a batch can neither be processed nor
    /// handed back to the source: continuing would store later offsets of the
    /// same partition and lose it.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<(), SourceError> {
        info!(sinks = ?self.dispatcher.sink_names(), "starting consumer loop");
        let mut backoff = Backoff::new(self.retry_policy);

        loop {
            self.liveness.report_healthy();

            let polled = tokio::select! {
                _ = shutdown.cancelled() => break,
                polled = timeout(self.poll_timeout, self.source.next_batch()) => polled,
            };

            let batch = match polled {
                Err(_) => continue,
                Ok(Ok(batch)) => batch,
                Ok(Err(err)) => {
                    error!("failed to receive batch: {}", err);
                    counter!("beacon_router_source_errors_total").increment(1);
                    if !self.wait(&mut backoff, &shutdown).await {
                        break;
                    }
                    continue;
                }
            };

            self.process(batch, &mut backoff, &shutdown).await?;
        }

        info!("consumer loop stopped");
        Ok(())
    }

    async fn process(
        &self,
        batch: Batch,
        backoff: &mut Backoff,
        shutdown: &CancellationToken,
    ) -> Result<(), SourceError> {
        if let Some(enqueued_at) = batch.enqueued_at {
            let lag = OffsetDateTime::now_utc() - enqueued_at;
            histogram!("beacon_router_batch_lag_seconds").record(lag.as_seconds_f64());
        }

        // Cancelled by shutdown or by the timer, whichever comes first
        let cancel = shutdown.child_token();
        let invocation = self.dispatcher.invoke(&batch, &cancel);
        tokio::pin!(invocation);

        let result = tokio::select! {
            result = &mut invocation => result,
            _ = sleep(self.invocation_timeout) => {
                warn!(offset = %batch.offset, "invocation timed out, cancelling");
                counter!("beacon_router_invocation_timeouts_total").increment(1);
                cancel.cancel();
                invocation.await
            }
        };

        match result {
            Ok(report) => {
                debug!(offset = %report.offset, records = report.records, "batch committed");
                backoff.reset();
                self.checkpoint(&batch).await;
            }
            Err(InvocationError::Parse(err)) => {
                // The same bytes will never parse, redelivering would block the partition
                error!(offset = %batch.offset, "dropping unparseable batch: {}", err);
                debug!(payload = %String::from_utf8_lossy(&batch.payload), "unparseable payload");
                counter!("beacon_router_batches_dropped_total").increment(1);
                self.checkpoint(&batch).await;
            }
            Err(err) => {
                warn!("batch will be redelivered: {}", err);
                counter!("beacon_router_batch_redeliveries_total").increment(1);
                self.wait(backoff, shutdown).await;
                if let Err(err) = self.source.redeliver(&batch).await {
                    error!(offset = %batch.offset, "failed to redeliver batch, stopping: {}", err);
                    return Err(err);
                }
            }
        }
        Ok(())
    }

    async fn checkpoint(&self, batch: &Batch) {
        if let Err(err) = self.source.checkpoint(batch).await {
            error!(offset = %batch.offset, "failed to checkpoint batch: {}", err);
        }
    }

    /// Sleep for the next backoff interval, reporting liveness at least once
    /// per poll timeout. Returns false if shutdown cut it short.
    async fn wait(&self, backoff: &mut Backoff, shutdown: &CancellationToken) -> bool {
        let delay = backoff.next_delay();
        debug!(attempt = backoff.attempt(), ?delay, "backing off");

        let now = Instant::now();
        let deadline = now
            .checked_add(delay)
            .unwrap_or_else(|| now + Duration::from_secs(86_400));
        loop {
            self.liveness.report_healthy();
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            let step = (deadline - now).min(self.poll_timeout);
            tokio::select! {
                _ = shutdown.cancelled() => return false,
                _ = sleep(step) => {}
            }
        }
    }
}
