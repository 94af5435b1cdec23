//! Consume activity messages from Kafka and route them to the valid or malformed topic.
use envconfig::Envconfig;
use tokio::signal::unix::SignalKind;
use tracing::level_filters::LevelFilter;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use mars_common::health::HealthRegistry;
use mars_common::kafka_producer::create_kafka_producer;
use mars_common::metrics::{serve, setup_metrics_router};
use mars_router::config::Config;
use mars_router::error::StartupError;
use mars_router::router::{RouterSettings, StreamRouter};
use mars_router::sink::{KafkaSink, RetryingSink};
use mars_router::source::KafkaSource;

fn setup_tracing() {
    let log_layer = tracing_subscriber::fmt::layer().with_filter(
        EnvFilter::builder()
            .with_default_directive(LevelFilter::INFO.into())
            .from_env_lossy()
            .add_directive("rdkafka=warn".parse().expect("valid directive")),
    );
    tracing_subscriber::registry().with(log_layer).init();
}

async fn wait_for_shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    let mut sigterm = match tokio::signal::unix::signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(e) => {
            error!("failed to install SIGTERM handler: {}", e);
            drop(ctrl_c.await);
            return;
        }
    };

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT"),
        _ = sigterm.recv() => info!("received SIGTERM"),
    }
}

#[tokio::main]
async fn main() -> Result<(), StartupError> {
    setup_tracing();

    let config = Config::init_from_env()?;
    let job_name = config.job_name();
    info!(
        project = %config.project_name,
        job = %job_name,
        source_topic = %config.consumer.kafka_consumer_topic,
        valid_topic = %config.valid_topic,
        malformed_topic = %config.malformed_topic,
        max_in_flight = config.max_in_flight,
        "starting mars router"
    );

    let liveness = HealthRegistry::new("liveness");
    let consumer_liveness = liveness
        .register("kafka-consumer", time::Duration::seconds(30))
        .await;
    let producer_liveness = liveness
        .register("kafka-producer", time::Duration::seconds(30))
        .await;
    let router_liveness = liveness
        .register("stream-router", time::Duration::seconds(30))
        .await;

    let router = setup_metrics_router(liveness, &config.project_name)?;
    let bind = config.bind();
    tokio::task::spawn(async move {
        if let Err(e) = serve(router, &bind).await {
            error!("failed to serve metrics on {}: {}", bind, e);
        }
    });

    let source = KafkaSource::new(
        &config.kafka,
        &config.consumer,
        &job_name,
        consumer_liveness,
    )?;
    let producer = create_kafka_producer(&config.kafka, &job_name, producer_liveness).await?;

    let retry_policy = config.retry_policy.policy();
    let valid_sink = RetryingSink::new(
        "valid",
        KafkaSink::new(producer.clone(), &config.valid_topic),
        retry_policy,
    );
    let malformed_sink = RetryingSink::new(
        "malformed",
        KafkaSink::new(producer, &config.malformed_topic),
        retry_policy,
    );

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        _ = shutdown_tx.send(true);
    });

    let stream_router = StreamRouter::new(
        source,
        valid_sink,
        malformed_sink,
        RouterSettings {
            max_in_flight: config.max_in_flight,
            shutdown_timeout: config.shutdown_timeout.0,
        },
        router_liveness,
    );
    let stats = stream_router.run(shutdown_rx).await?;

    info!(
        received = stats.received,
        valid = stats.valid,
        malformed = stats.malformed,
        "mars router shut down"
    );
    Ok(())
}
