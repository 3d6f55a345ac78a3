//! Publish synthetic beacon batches to Kafka, one per second, until interrupted.
use std::time::Duration;

use anyhow::{bail, Context};
use clap::Parser;
use common_kafka::config::KafkaConfig;
use common_kafka::kafka_producer::{create_kafka_producer, send_and_ack, KafkaContext};
use envconfig::Envconfig;
use health::HealthRegistry;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rdkafka::producer::{FutureProducer, FutureRecord};
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::level_filters::LevelFilter;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

mod generator;

const MAX_CONSECUTIVE_FAILURES: u32 = 10;

#[derive(Parser)]
#[command(about = "Beacon traffic generator. Ctrl-C to exit.")]
struct Cli {
    /// Kafka bootstrap servers to publish to
    destination: String,
}

#[derive(Envconfig)]
struct Config {
    #[envconfig(default = "beacon_batches")]
    kafka_topic: String,

    #[envconfig(nested = true)]
    kafka: KafkaConfig,
}

async fn publish(
    producer: &FutureProducer<KafkaContext>,
    topic: &str,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let mut rng = StdRng::from_entropy();
    let mut ticker = interval(Duration::from_secs(1));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut failures = 0;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            _ = ticker.tick() => {}
        }

        let batch = generator::generate_batch(&mut rng);
        let payload = serde_json::to_string(&batch)?;

        match send_and_ack(producer, FutureRecord::to(topic).payload(payload.as_str())).await {
            Ok((partition, offset)) => {
                failures = 0;
                info!(partition, offset, records = batch.len(), "sent batch");
                debug!(payload, "batch payload");
            }
            Err(err) => {
                failures += 1;
                error!(failures, "failed to send batch: {}", err);
                if failures >= MAX_CONSECUTIVE_FAILURES {
                    bail!("giving up after {failures} consecutive failures: {err}");
                }
            }
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .init();

    let cli = Cli::parse();
    let mut config = Config::init_from_env().context("invalid configuration")?;
    config.kafka.kafka_hosts = cli.destination;

    // Nothing serves probes here, the registry only satisfies the producer context
    let liveness = HealthRegistry::new("liveness");
    let producer = create_kafka_producer(
        &config.kafka,
        liveness.register("rdkafka", time::Duration::seconds(30)),
    )
    .context("failed to connect to kafka")?;
    info!(topic = config.kafka_topic, "connected, sending a batch every second");

    let shutdown = CancellationToken::new();
    let on_interrupt = shutdown.clone();
    tokio::spawn(async move {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!("failed to listen for ctrl-c: {}", err);
            return;
        }
        info!("interrupted, stopping");
        on_interrupt.cancel();
    });

    publish(&producer, &config.kafka_topic, shutdown).await
}
