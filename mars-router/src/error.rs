use mars_common::record::DeliveryToken;
use rdkafka::types::RDKafkaErrorCode;
use thiserror::Error;

/// Errors raised by a message source. Data quality problems never show up here, only
/// transport failures.
#[derive(Error, Debug)]
pub enum SourceError {
    #[error("kafka error: {0}")]
    Kafka(#[from] rdkafka::error::KafkaError),
    #[error("consumer for {0} has been closed")]
    Closed(String),
    #[error("transient receive error: {0}")]
    Transient(String),
}

impl SourceError {
    /// Transient errors are logged and the receive is attempted again.
    pub fn is_transient(&self) -> bool {
        match self {
            SourceError::Transient(_) => true,
            SourceError::Kafka(error) => error
                .rdkafka_error_code()
                .map(|code| {
                    matches!(
                        code,
                        RDKafkaErrorCode::BrokerTransportFailure
                            | RDKafkaErrorCode::AllBrokersDown
                            | RDKafkaErrorCode::OperationTimedOut
                            | RDKafkaErrorCode::PartitionEOF
                    )
                })
                .unwrap_or(false),
            SourceError::Closed(_) => false,
        }
    }
}

/// Errors raised while writing a record to a sink.
#[derive(Error, Debug)]
pub enum SinkError {
    #[error("failed to serialize record: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("record is too large for the sink")]
    MessageTooLarge,
    #[error("failed to produce to kafka: {0}")]
    Produce(rdkafka::error::KafkaError),
    #[error("failed to produce to kafka before the write timeout")]
    Canceled,
    #[error("sink is unavailable: {0}")]
    Unavailable(String),
}

impl SinkError {
    pub fn is_retryable(&self) -> bool {
        match self {
            SinkError::Serialization(_) | SinkError::MessageTooLarge => false,
            SinkError::Produce(_) | SinkError::Canceled | SinkError::Unavailable(_) => true,
        }
    }
}

/// Infrastructure errors that stop the router. A malformed message is never one of these.
#[derive(Error, Debug)]
pub enum RouterError {
    #[error("failed to receive a message: {0}")]
    Receive(#[source] SourceError),
    #[error("failed to dispatch {token} to the {sink} sink: {error}")]
    Dispatch {
        token: DeliveryToken,
        sink: &'static str,
        #[source]
        error: SinkError,
    },
    #[error("failed to acknowledge {token}: {error}")]
    Acknowledge {
        token: DeliveryToken,
        #[source]
        error: SourceError,
    },
    #[error("failed to flush the {sink} sink: {error}")]
    Flush {
        sink: &'static str,
        #[source]
        error: SinkError,
    },
    #[error("message processing task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Errors that abort the process before or while it runs.
#[derive(Error, Debug)]
pub enum StartupError {
    #[error("invalid configuration: {0}")]
    Config(#[from] envconfig::Error),
    #[error("failed to create kafka client: {0}")]
    Kafka(#[from] rdkafka::error::KafkaError),
    #[error("failed to install metrics recorder: {0}")]
    Metrics(#[from] metrics_exporter_prometheus::BuildError),
    #[error(transparent)]
    Router(#[from] RouterError),
}
