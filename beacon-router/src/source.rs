use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::error::KafkaError;
use rdkafka::{Message, Offset};
use thiserror::Error;
use time::OffsetDateTime;
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::batch::{Batch, BatchOffset};

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("kafka error: {0}")]
    Kafka(#[from] KafkaError),
    #[error("source state is unavailable")]
    Poisoned,
}

/// Where batches come from, and where their fate is reported back to.
///
/// A batch that is neither checkpointed nor redelivered is delivered again
/// after a restart, since its offset was never stored.
#[async_trait]
pub trait MessageSource: Send + Sync {
    /// Wait for the next batch. Must be cancel safe: the caller bounds it
    /// with a poll timeout.
    async fn next_batch(&self) -> Result<Batch, SourceError>;

    /// The batch is done with, move past it.
    async fn checkpoint(&self, batch: &Batch) -> Result<(), SourceError>;

    /// The batch failed, hand it out again.
    async fn redeliver(&self, batch: &Batch) -> Result<(), SourceError>;
}

pub struct KafkaSource {
    consumer: StreamConsumer,
    topic: String,
    seek_timeout: Duration,
}

impl KafkaSource {
    pub fn new(consumer: StreamConsumer, topic: String) -> Self {
        Self {
            consumer,
            topic,
            seek_timeout: Duration::from_secs(5),
        }
    }
}

#[async_trait]
impl MessageSource for KafkaSource {
    async fn next_batch(&self) -> Result<Batch, SourceError> {
        let message = self.consumer.recv().await?;

        let offset = BatchOffset {
            partition: message.partition(),
            offset: message.offset(),
        };
        // A tombstone becomes an empty payload, which then fails to parse
        let payload = message
            .payload()
            .map(Bytes::copy_from_slice)
            .unwrap_or_default();
        let enqueued_at = message.timestamp().to_millis().and_then(|millis| {
            OffsetDateTime::from_unix_timestamp_nanos(i128::from(millis) * 1_000_000).ok()
        });

        debug!(%offset, bytes = payload.len(), "received batch");
        Ok(Batch {
            payload,
            offset,
            enqueued_at,
        })
    }

    async fn checkpoint(&self, batch: &Batch) -> Result<(), SourceError> {
        // librdkafka stores offset + 1, the position of the next message to read
        self.consumer.store_offset(
            &self.topic,
            batch.offset.partition,
            batch.offset.offset,
        )?;
        Ok(())
    }

    async fn redeliver(&self, batch: &Batch) -> Result<(), SourceError> {
        if let Err(err) = self.consumer.seek(
            &self.topic,
            batch.offset.partition,
            Offset::Offset(batch.offset.offset),
            self.seek_timeout,
        ) {
            // Consuming on from here would store later offsets and skip the batch
            warn!(offset = %batch.offset, "failed to seek back for redelivery: {}", err);
            return Err(err.into());
        }
        Ok(())
    }
}

#[derive(Default)]
struct MemoryState {
    pending: VecDeque<Batch>,
    checkpoints: Vec<BatchOffset>,
    redeliveries: HashMap<BatchOffset, usize>,
}

/// In-process source with the same checkpoint contract as `KafkaSource`.
#[derive(Clone, Default)]
pub struct MemorySource {
    state: Arc<Mutex<MemoryState>>,
    notify: Arc<Notify>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, batch: Batch) {
        if let Ok(mut state) = self.state.lock() {
            state.pending.push_back(batch);
        }
        self.notify.notify_one();
    }

    /// Checkpointed offsets, in checkpoint order.
    pub fn checkpoints(&self) -> Vec<BatchOffset> {
        self.state
            .lock()
            .map(|state| state.checkpoints.clone())
            .unwrap_or_default()
    }

    pub fn redeliveries(&self, offset: BatchOffset) -> usize {
        self.state
            .lock()
            .map(|state| state.redeliveries.get(&offset).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    pub fn pending(&self) -> usize {
        self.state
            .lock()
            .map(|state| state.pending.len())
            .unwrap_or(0)
    }
}

#[async_trait]
impl MessageSource for MemorySource {
    async fn next_batch(&self) -> Result<Batch, SourceError> {
        loop {
            let notified = self.notify.notified();
            {
                let mut state = self.state.lock().map_err(|_| SourceError::Poisoned)?;
                if let Some(batch) = state.pending.pop_front() {
                    return Ok(batch);
                }
            }
            notified.await;
        }
    }

    async fn checkpoint(&self, batch: &Batch) -> Result<(), SourceError> {
        let mut state = self.state.lock().map_err(|_| SourceError::Poisoned)?;
        state.checkpoints.push(batch.offset);
        Ok(())
    }

    async fn redeliver(&self, batch: &Batch) -> Result<(), SourceError> {
        {
            let mut state = self.state.lock().map_err(|_| SourceError::Poisoned)?;
            *state.redeliveries.entry(batch.offset).or_default() += 1;
            state.pending.push_front(batch.clone());
        }
        self.notify.notify_one();
        Ok(())
    }
}
