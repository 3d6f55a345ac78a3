use async_trait::async_trait;
use metrics::counter;
use tracing::info;

use crate::batch::{BatchOffset, DeliveryKey, Record};
use crate::sinks::{Delivery, Sink, SinkError};

/// Logs records instead of delivering them, for local runs without a broker
/// or database.
pub struct PrintSink {}

#[async_trait]
impl Sink for PrintSink {
    fn name(&self) -> &str {
        "print"
    }

    async fn open(&self, batch: BatchOffset) -> Result<Box<dyn Delivery>, SinkError> {
        Ok(Box::new(PrintDelivery { batch }))
    }
}

struct PrintDelivery {
    batch: BatchOffset,
}

#[async_trait]
impl Delivery for PrintDelivery {
    async fn accept(&mut self, record: &Record) -> Result<(), SinkError> {
        info!(
            key = %DeliveryKey::new(self.batch, record),
            "record: {}",
            record.canonical()
        );
        counter!("beacon_router_records_delivered_total", "sink" => "print").increment(1);
        Ok(())
    }
}
