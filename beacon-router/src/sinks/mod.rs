use async_trait::async_trait;
use common_kafka::kafka_producer::KafkaProduceError;
use thiserror::Error;

use crate::batch::{BatchOffset, Record};

pub mod kafka;
pub mod postgres;
pub mod print;

/// A destination for records. `open` is called once per batch and the
/// returned delivery receives that batch's records, one at a time.
#[async_trait]
pub trait Sink: Send + Sync {
    fn name(&self) -> &str;

    async fn open(&self, batch: BatchOffset) -> Result<Box<dyn Delivery>, SinkError>;
}

/// Per-batch delivery scope. Anything it holds is released when it is
/// dropped, so an aborted batch needs no explicit cleanup.
#[async_trait]
pub trait Delivery: Send {
    async fn accept(&mut self, record: &Record) -> Result<(), SinkError>;

    /// Called after the last record was accepted.
    async fn finish(self: Box<Self>) -> Result<(), SinkError> {
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SinkErrorKind {
    Transient,
    Nonretriable,
}

impl SinkErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SinkErrorKind::Transient => "transient",
            SinkErrorKind::Nonretriable => "nonretriable",
        }
    }
}

#[derive(Error, Debug)]
pub enum SinkError {
    #[error("failed to produce to kafka: {0}")]
    Kafka(rdkafka::error::KafkaError),
    #[error("failed to produce to kafka (timeout)")]
    ProduceCanceled,
    #[error("record is larger than the destination accepts")]
    RecordTooBig,
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("sink unavailable: {0}")]
    Unavailable(String),
    #[error("record rejected: {0}")]
    Rejected(String),
}

impl SinkError {
    pub fn kind(&self) -> SinkErrorKind {
        match self {
            SinkError::RecordTooBig | SinkError::Rejected(_) => SinkErrorKind::Nonretriable,
            // The statement itself is fixed, so a server-side error is about the record
            SinkError::Database(sqlx::Error::Database(_)) => SinkErrorKind::Nonretriable,
            SinkError::Kafka(_)
            | SinkError::ProduceCanceled
            | SinkError::Database(_)
            | SinkError::Unavailable(_) => SinkErrorKind::Transient,
        }
    }
}

impl From<KafkaProduceError> for SinkError {
    fn from(error: KafkaProduceError) -> Self {
        match error {
            KafkaProduceError::KafkaProduceError { error } => SinkError::Kafka(error),
            KafkaProduceError::MessageTooLarge => SinkError::RecordTooBig,
            KafkaProduceError::KafkaProduceCanceled => SinkError::ProduceCanceled,
        }
    }
}
