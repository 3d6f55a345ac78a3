//! Split beacon batches from Kafka into records and fan them out to the configured sinks.
use std::sync::Arc;

use anyhow::Context;
use envconfig::Envconfig;
use health::HealthRegistry;
use sqlx::postgres::PgPoolOptions;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::level_filters::LevelFilter;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use beacon_router::config::{Config, SinkKind};
use beacon_router::consumer::BatchConsumerLoop;
use beacon_router::dispatcher::Dispatcher;
use beacon_router::router::{router, serve, setup_metrics_recorder};
use beacon_router::sinks::kafka::KafkaSink;
use beacon_router::sinks::postgres::PgStoreSink;
use beacon_router::sinks::print::PrintSink;
use beacon_router::sinks::Sink;
use beacon_router::source::KafkaSource;
use common_kafka::kafka_consumer::create_stream_consumer;
use common_kafka::kafka_producer::create_kafka_producer;

fn setup_tracing() {
    let log_layer = tracing_subscriber::fmt::layer().with_filter(
        EnvFilter::builder()
            .with_default_directive(LevelFilter::INFO.into())
            .from_env_lossy()
            .add_directive("rdkafka=warn".parse().expect("valid directive")),
    );
    tracing_subscriber::registry().with(log_layer).init();
}

async fn shutdown(token: CancellationToken) {
    let mut term = signal::unix::signal(signal::unix::SignalKind::terminate())
        .expect("failed to register SIGTERM handler");

    tokio::select! {
        _ = term.recv() => {},
        _ = signal::ctrl_c() => {},
    };

    info!("Shutdown signal received");
    token.cancel();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    setup_tracing();

    let config = Config::init_from_env().context("invalid configuration")?;
    info!(
        sinks = ?config.sinks,
        mode = ?config.dispatch_mode,
        topic = config.consumer.kafka_consumer_topic,
        "starting beacon router"
    );

    let liveness = HealthRegistry::new("liveness");
    let recorder = setup_metrics_recorder().context("failed to install metrics recorder")?;

    let mut sinks: Vec<Arc<dyn Sink>> = Vec::new();
    for kind in config.sinks.iter() {
        let sink: Arc<dyn Sink> = match kind {
            SinkKind::Stream => {
                let handle = liveness.register("rdkafka", time::Duration::seconds(30));
                let producer = create_kafka_producer(&config.kafka, handle)
                    .context("failed to create kafka producer")?;
                Arc::new(KafkaSink::new(producer, config.kafka_output_topic.clone()))
            }
            SinkKind::Store => {
                let pool = PgPoolOptions::new()
                    .max_connections(config.max_pg_connections)
                    .connect(&config.database_url)
                    .await
                    .context("failed to connect to postgres")?;
                if config.run_migrations {
                    sqlx::migrate!("./migrations")
                        .run(&pool)
                        .await
                        .context("failed to run migrations")?;
                }
                Arc::new(PgStoreSink::new(pool, &config.store_table))
            }
            SinkKind::Print => Arc::new(PrintSink {}),
        };
        sinks.push(sink);
    }
    let dispatcher = Dispatcher::new(sinks, config.dispatch_mode)?;

    let consumer = create_stream_consumer(&config.kafka, &config.consumer)
        .context("failed to create kafka consumer")?;
    let source = Arc::new(KafkaSource::new(
        consumer,
        config.consumer.kafka_consumer_topic.clone(),
    ));

    // Backoff reports on its own. Between reports fit one poll, one invocation and
    // the delivery it lets finish after timing out.
    let deadline = config.invocation_timeout_ms.0 * 2 + config.poll_timeout_ms.0;
    let consumer_liveness = liveness.register(
        "consumer",
        time::Duration::try_from(deadline).context("invalid liveness deadline")?,
    );
    let consumer_loop = BatchConsumerLoop::new(
        source,
        dispatcher,
        consumer_liveness,
        (&config.retry_policy).into(),
        config.invocation_timeout_ms.0,
        config.poll_timeout_ms.0,
    );

    let token = CancellationToken::new();
    tokio::spawn(shutdown(token.clone()));

    let bind = config.bind();
    let server_token = token.clone();
    let server = tokio::spawn(async move {
        if let Err(err) = serve(router(liveness, Some(recorder)), &bind, server_token).await {
            error!("failed to serve probes and metrics: {}", err);
        }
    });

    let consumed = consumer_loop.run(token.clone()).await;
    token.cancel();
    server.await?;
    consumed.context("consumer loop failed")?;

    info!("beacon router shut down");
    Ok(())
}
