use std::str::FromStr;
use std::time;

use envconfig::Envconfig;

#[derive(Envconfig, Clone)]
pub struct KafkaConfig {
    #[envconfig(default = "20")]
    pub kafka_producer_linger_ms: u32, // Maximum time between producer batches during low traffic

    #[envconfig(default = "400")]
    pub kafka_producer_queue_mib: u32, // Size of the in-memory producer queue in mebibytes

    #[envconfig(default = "20000")]
    pub kafka_message_timeout_ms: u32, // Time before we stop retrying producing a message

    #[envconfig(default = "none")]
    pub kafka_compression_codec: String, // none, gzip, snappy, lz4, zstd

    #[envconfig(default = "false")]
    pub kafka_tls: bool,

    #[envconfig(default = "localhost:9092")]
    pub kafka_hosts: String,
}

#[derive(Envconfig, Clone)]
pub struct ConsumerConfig {
    #[envconfig(default = "mars-router")]
    pub kafka_consumer_group: String,

    #[envconfig(default = "activities")]
    pub kafka_consumer_topic: String,

    // Only relevant the first time the group subscribes, committed offsets win afterwards.
    #[envconfig(default = "earliest")]
    pub kafka_consumer_offset_reset: String, // earliest, latest

    // Interval between commits of the offsets stored after acknowledgement.
    #[envconfig(default = "5000")]
    pub kafka_consumer_auto_commit_interval_ms: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnvMsDuration(pub time::Duration);

#[derive(Debug, PartialEq, Eq)]
pub struct ParseEnvMsDurationError;

impl std::fmt::Display for ParseEnvMsDurationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "expected a duration in milliseconds")
    }
}

impl FromStr for EnvMsDuration {
    type Err = ParseEnvMsDurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ms = s.parse::<u64>().map_err(|_| ParseEnvMsDurationError)?;

        Ok(EnvMsDuration(time::Duration::from_millis(ms)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_env_ms_duration() {
        assert_eq!(
            "1500".parse::<EnvMsDuration>(),
            Ok(EnvMsDuration(time::Duration::from_millis(1500)))
        );
        assert_eq!("".parse::<EnvMsDuration>(), Err(ParseEnvMsDurationError));
        assert_eq!("1.5s".parse::<EnvMsDuration>(), Err(ParseEnvMsDurationError));
    }

    #[test]
    fn test_kafka_config_defaults() {
        let config = KafkaConfig::init_from_hashmap(&Default::default()).unwrap();

        assert_eq!(config.kafka_hosts, "localhost:9092");
        assert_eq!(config.kafka_compression_codec, "none");
        assert!(!config.kafka_tls);
    }

    #[test]
    fn test_consumer_config_overrides() {
        let env = [
            ("KAFKA_CONSUMER_TOPIC".to_owned(), "activities-replay".to_owned()),
            ("KAFKA_CONSUMER_OFFSET_RESET".to_owned(), "latest".to_owned()),
        ]
        .into_iter()
        .collect();

        let config = ConsumerConfig::init_from_hashmap(&env).unwrap();

        assert_eq!(config.kafka_consumer_group, "mars-router");
        assert_eq!(config.kafka_consumer_topic, "activities-replay");
        assert_eq!(config.kafka_consumer_offset_reset, "latest");
        assert_eq!(config.kafka_consumer_auto_commit_interval_ms, 5000);
    }
}
