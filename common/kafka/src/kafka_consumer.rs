use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::error::KafkaError;
use rdkafka::ClientConfig;
use tracing::{debug, info};

use crate::config::{ConsumerConfig, KafkaConfig};

/// Build a consumer subscribed to the configured topic. Offsets are never
/// stored automatically: a message only counts as consumed once the caller
/// stores its offset explicitly.
pub fn create_stream_consumer(
    common_config: &KafkaConfig,
    consumer_config: &ConsumerConfig,
) -> Result<StreamConsumer, KafkaError> {
    let mut client_config = ClientConfig::new();
    client_config
        .set("bootstrap.servers", &common_config.kafka_hosts)
        .set("statistics.interval.ms", "10000")
        .set("group.id", &consumer_config.kafka_consumer_group)
        .set(
            "auto.offset.reset",
            &consumer_config.kafka_consumer_offset_reset,
        )
        .set(
            "enable.auto.commit",
            consumer_config.kafka_consumer_auto_commit.to_string(),
        )
        .set(
            "auto.commit.interval.ms",
            consumer_config
                .kafka_consumer_auto_commit_interval_ms
                .to_string(),
        )
        .set("enable.auto.offset.store", "false");

    if common_config.kafka_tls {
        client_config
            .set("security.protocol", "ssl")
            .set("enable.ssl.certificate.verification", "false");
    };

    debug!("rdkafka configuration: {:?}", client_config);
    let consumer: StreamConsumer = client_config.create()?;
    consumer.subscribe(&[consumer_config.kafka_consumer_topic.as_str()])?;

    info!(
        topic = consumer_config.kafka_consumer_topic,
        group_id = consumer_config.kafka_consumer_group,
        "kafka consumer subscribed"
    );
    Ok(consumer)
}
