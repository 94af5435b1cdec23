use envconfig::Envconfig;
use mars_common::config::{ConsumerConfig, EnvMsDuration, KafkaConfig};
use mars_common::retry::RetryPolicy;

#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "3302")]
    pub port: u16,

    /// Required: the deployment this router belongs to, used to name the job.
    #[envconfig(from = "PROJECT_NAME")]
    pub project_name: String,

    /// Kafka client id. Defaults to `mars-job-<UTC timestamp>` when unset.
    #[envconfig(from = "JOB_NAME")]
    pub job_name: Option<String>,

    #[envconfig(default = "mars_raw")]
    pub valid_topic: String,

    #[envconfig(default = "mars_raw_malformed")]
    pub malformed_topic: String,

    #[envconfig(default = "100")]
    pub max_in_flight: usize,

    #[envconfig(default = "30000")]
    pub shutdown_timeout: EnvMsDuration,

    #[envconfig(nested = true)]
    pub kafka: KafkaConfig,

    #[envconfig(nested = true)]
    pub consumer: ConsumerConfig,

    #[envconfig(nested = true)]
    pub retry_policy: RetryPolicyConfig,
}

impl Config {
    /// Produce a host:port address for binding a TcpListener.
    pub fn bind(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn job_name(&self) -> String {
        match &self.job_name {
            Some(name) if !name.is_empty() => name.to_owned(),
            _ => default_job_name(chrono::Utc::now()),
        }
    }
}

pub fn default_job_name(now: chrono::DateTime<chrono::Utc>) -> String {
    format!("mars-job-{}", now.format("%Y%m%d%H%M"))
}

#[derive(Envconfig, Clone)]
pub struct RetryPolicyConfig {
    #[envconfig(default = "2")]
    pub backoff_coefficient: u32,

    #[envconfig(default = "100")]
    pub initial_interval: EnvMsDuration,

    #[envconfig(default = "10000")]
    pub maximum_interval: EnvMsDuration,

    #[envconfig(default = "5")]
    pub max_attempts: u32,
}

impl RetryPolicyConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::build(self.backoff_coefficient, self.initial_interval.0)
            .maximum_interval(self.maximum_interval.0)
            .max_attempts(self.max_attempts)
            .provide()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::time::Duration;

    use chrono::TimeZone;

    use super::*;

    fn env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_project_name_is_required() {
        let result = Config::init_from_hashmap(&env(&[]));

        assert!(matches!(
            result,
            Err(envconfig::Error::EnvVarMissing { name: "PROJECT_NAME" })
        ));
    }

    #[test]
    fn test_defaults() {
        let config = Config::init_from_hashmap(&env(&[("PROJECT_NAME", "mars")])).unwrap();

        assert_eq!(config.bind(), "0.0.0.0:3302");
        assert_eq!(config.valid_topic, "mars_raw");
        assert_eq!(config.malformed_topic, "mars_raw_malformed");
        assert_eq!(config.consumer.kafka_consumer_topic, "activities");
        assert_eq!(config.max_in_flight, 100);
        assert_eq!(config.shutdown_timeout.0, Duration::from_secs(30));

        let policy = config.retry_policy.policy();
        assert_eq!(policy.max_attempts(), 5);
        assert_eq!(policy.retry_interval(0), Duration::from_millis(100));
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        let result = Config::init_from_hashmap(&env(&[
            ("PROJECT_NAME", "mars"),
            ("MAX_IN_FLIGHT", "lots"),
        ]));

        assert!(matches!(
            result,
            Err(envconfig::Error::ParseError { name: "MAX_IN_FLIGHT" })
        ));
    }

    #[test]
    fn test_job_name() {
        let now = chrono::Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();
        assert_eq!(default_job_name(now), "mars-job-202401020304");

        let config = Config::init_from_hashmap(&env(&[
            ("PROJECT_NAME", "mars"),
            ("JOB_NAME", "mars-job-backfill"),
        ]))
        .unwrap();
        assert_eq!(config.job_name(), "mars-job-backfill");

        let config = Config::init_from_hashmap(&env(&[("PROJECT_NAME", "mars")])).unwrap();
        assert!(config.job_name().starts_with("mars-job-"));
    }
}
