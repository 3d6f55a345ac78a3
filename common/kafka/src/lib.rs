pub mod config;
pub mod kafka_consumer;
pub mod kafka_producer;
pub mod test;

/// Carries the batch offset and record ordinal of a re-published record, so
/// downstream consumers can detect redelivered copies.
pub const DELIVERY_KEY_HEADER: &str = "beacon-delivery-key";
