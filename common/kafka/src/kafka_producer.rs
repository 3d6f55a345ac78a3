use std::time::Duration;

use health::HealthHandle;
use metrics::gauge;
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use rdkafka::{ClientConfig, ClientContext};
use thiserror::Error;
use tracing::{debug, error, info};

use crate::config::KafkaConfig;

pub struct KafkaContext {
    liveness: HealthHandle,
}

impl From<HealthHandle> for KafkaContext {
    fn from(value: HealthHandle) -> Self {
        KafkaContext { liveness: value }
    }
}

impl ClientContext for KafkaContext {
    fn stats(&self, stats: rdkafka::Statistics) {
        // Signal liveness, as the main rdkafka loop is running and calling us
        self.liveness.report_healthy();

        gauge!("beacon_kafka_producer_queue_depth").set(stats.msg_cnt as f64);
        gauge!("beacon_kafka_producer_queue_depth_limit").set(stats.msg_max as f64);
        gauge!("beacon_kafka_producer_queue_bytes").set(stats.msg_size as f64);
        gauge!("beacon_kafka_producer_queue_bytes_limit").set(stats.msg_size_max as f64);

        for (_, broker) in stats.brokers {
            gauge!(
                "beacon_kafka_broker_requests_pending",
                "broker" => broker.nodeid.to_string()
            )
            .set(broker.outbuf_cnt as f64);
        }
    }
}

pub fn create_kafka_producer(
    config: &KafkaConfig,
    liveness: HealthHandle,
) -> Result<FutureProducer<KafkaContext>, KafkaError> {
    info!("connecting to Kafka brokers at {}...", config.kafka_hosts);

    let mut client_config = ClientConfig::new();
    client_config
        .set("bootstrap.servers", &config.kafka_hosts)
        .set("statistics.interval.ms", "10000")
        .set("linger.ms", config.kafka_producer_linger_ms.to_string())
        .set(
            "message.timeout.ms",
            config.kafka_message_timeout_ms.to_string(),
        )
        .set(
            "compression.codec",
            config.kafka_compression_codec.to_owned(),
        )
        .set(
            "queue.buffering.max.kbytes",
            (config.kafka_producer_queue_mib * 1024).to_string(),
        );

    if config.kafka_tls {
        client_config
            .set("security.protocol", "ssl")
            .set("enable.ssl.certificate.verification", "false");
    };

    debug!("rdkafka configuration: {:?}", client_config);
    let producer: FutureProducer<KafkaContext> =
        client_config.create_with_context(liveness.into())?;

    // "Ping" the brokers by requesting metadata, fail after 15 seconds
    match producer
        .client()
        .fetch_metadata(None, Timeout::After(Duration::from_secs(15)))
    {
        Ok(metadata) => {
            info!(
                "connected to Kafka brokers, found {} topics",
                metadata.topics().len()
            );
        }
        Err(error) => {
            error!("failed to fetch metadata from Kafka brokers: {:?}", error);
            return Err(error);
        }
    }

    Ok(producer)
}

#[derive(Error, Debug)]
pub enum KafkaProduceError {
    #[error("failed to produce to kafka: {error}")]
    KafkaProduceError { error: KafkaError },
    #[error("message is larger than the broker accepts")]
    MessageTooLarge,
    #[error("failed to produce to kafka (timeout)")]
    KafkaProduceCanceled,
}

impl From<KafkaError> for KafkaProduceError {
    fn from(error: KafkaError) -> Self {
        match error.rdkafka_error_code() {
            Some(RDKafkaErrorCode::MessageSizeTooLarge) => KafkaProduceError::MessageTooLarge,
            _ => KafkaProduceError::KafkaProduceError { error },
        }
    }
}

/// Enqueue one record and wait for the broker ack. Rejections can happen
/// twice: locally when enqueueing, and remotely when the broker answers.
pub async fn send_and_ack<C>(
    producer: &FutureProducer<C>,
    record: FutureRecord<'_, str, str>,
) -> Result<(i32, i64), KafkaProduceError>
where
    C: ClientContext + 'static,
{
    let delivery = producer.send_result(record).map_err(|(e, _)| e)?;

    match delivery.await {
        Ok(Ok(position)) => Ok(position),
        Ok(Err((e, _))) => Err(e.into()),
        // Cancelled by the producer once message.timeout.ms expired
        Err(_) => Err(KafkaProduceError::KafkaProduceCanceled),
    }
}
