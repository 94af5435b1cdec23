use std::time::Duration;

use metrics::gauge;
use rdkafka::consumer::ConsumerContext;
use rdkafka::error::KafkaError;
use rdkafka::producer::{FutureProducer, Producer};
use rdkafka::ClientConfig;
use tracing::{debug, error, info};

use crate::config::KafkaConfig;
use crate::health::HealthHandle;

/// rdkafka client context shared by the consumer and the producer.
pub struct KafkaContext {
    liveness: HealthHandle,
}

impl From<HealthHandle> for KafkaContext {
    fn from(value: HealthHandle) -> Self {
        KafkaContext { liveness: value }
    }
}

impl rdkafka::ClientContext for KafkaContext {
    fn stats(&self, stats: rdkafka::Statistics) {
        // Signal liveness, as the main rdkafka loop is running and calling us
        self.liveness.try_report_healthy();

        let client = stats.client_id;
        gauge!("mars_kafka_callback_queue_depth", "client" => client.clone())
            .set(stats.replyq as f64);
        gauge!("mars_kafka_queue_depth", "client" => client.clone()).set(stats.msg_cnt as f64);
        gauge!("mars_kafka_queue_bytes", "client" => client).set(stats.msg_size as f64);
    }
}

impl ConsumerContext for KafkaContext {}

/// Apply the settings shared by every client of the router.
pub fn base_client_config(config: &KafkaConfig, client_id: &str) -> ClientConfig {
    let mut client_config = ClientConfig::new();
    client_config
        .set("bootstrap.servers", &config.kafka_hosts)
        .set("client.id", client_id)
        .set("statistics.interval.ms", "10000");

    if config.kafka_tls {
        client_config
            .set("security.protocol", "ssl")
            .set("enable.ssl.certificate.verification", "false");
    };

    client_config
}

pub async fn create_kafka_producer(
    config: &KafkaConfig,
    client_id: &str,
    liveness: HealthHandle,
) -> Result<FutureProducer<KafkaContext>, KafkaError> {
    let mut client_config = base_client_config(config, client_id);
    client_config
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

    debug!("rdkafka producer configuration: {:?}", client_config);
    let producer: FutureProducer<KafkaContext> =
        client_config.create_with_context(liveness.into())?;

    // "Ping" the Kafka brokers by requesting metadata
    match producer
        .client()
        .fetch_metadata(None, Duration::from_secs(15))
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
