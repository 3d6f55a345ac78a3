use async_trait::async_trait;
use common_kafka::kafka_producer::{send_and_ack, KafkaContext};
use common_kafka::DELIVERY_KEY_HEADER;
use metrics::counter;
use rdkafka::message::{Header, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord};
use tracing::{debug, instrument};

use crate::batch::{BatchOffset, DeliveryKey, Record};
use crate::sinks::{Delivery, Sink, SinkError};

/// Re-publishes every record as its own message on the output topic.
///
/// The producer is built once at startup and shared by every invocation:
/// cloning it only clones a handle to the same rdkafka client.
#[derive(Clone)]
pub struct KafkaSink {
    producer: FutureProducer<KafkaContext>,
    topic: String,
}

impl KafkaSink {
    pub fn new(producer: FutureProducer<KafkaContext>, topic: String) -> Self {
        Self { producer, topic }
    }
}

#[async_trait]
impl Sink for KafkaSink {
    fn name(&self) -> &str {
        "stream"
    }

    async fn open(&self, batch: BatchOffset) -> Result<Box<dyn Delivery>, SinkError> {
        Ok(Box::new(KafkaDelivery {
            producer: self.producer.clone(),
            topic: self.topic.clone(),
            batch,
        }))
    }
}

struct KafkaDelivery {
    producer: FutureProducer<KafkaContext>,
    topic: String,
    batch: BatchOffset,
}

#[async_trait]
impl Delivery for KafkaDelivery {
    #[instrument(skip_all, fields(ordinal = record.ordinal()))]
    async fn accept(&mut self, record: &Record) -> Result<(), SinkError> {
        let key = DeliveryKey::new(self.batch, record).to_string();
        let headers = OwnedHeaders::new().insert(Header {
            key: DELIVERY_KEY_HEADER,
            value: Some(key.as_str()),
        });

        let produced = send_and_ack(
            &self.producer,
            FutureRecord {
                topic: self.topic.as_str(),
                payload: Some(record.canonical()),
                partition: None,
                key: Some(key.as_str()),
                timestamp: None,
                headers: Some(headers),
            },
        )
        .await;

        match produced {
            Ok((partition, offset)) => {
                debug!(partition, offset, key, "record published");
                counter!("beacon_router_records_delivered_total", "sink" => "stream").increment(1);
                Ok(())
            }
            Err(err) => {
                debug!(key, "failed to publish record: {}", err);
                Err(err.into())
            }
        }
    }
}
