use std::marker::PhantomData;
use std::time::Duration;

use async_trait::async_trait;
use mars_common::kafka_producer::KafkaContext;
use mars_common::retry::RetryPolicy;
use metrics::counter;
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::producer::{DeliveryFuture, FutureProducer, FutureRecord, Producer};
use serde::Serialize;
use tracing::{error, warn};

use crate::error::SinkError;

/// An append-only destination for one record shape.
///
/// Implementations must accept concurrent writes: the router shares each sink between all
/// in-flight messages.
#[async_trait]
pub trait RecordSink<T: Send + 'static>: Send + Sync {
    /// Resolve once the record has been durably accepted.
    async fn write(&self, record: T) -> Result<(), SinkError>;

    /// Wait for buffered writes to complete before shutting down.
    async fn flush(&self) -> Result<(), SinkError> {
        Ok(())
    }
}

/// Writes records as JSON objects to a Kafka topic.
#[derive(Clone)]
pub struct KafkaSink {
    producer: FutureProducer<KafkaContext>,
    topic: String,
}

impl KafkaSink {
    pub fn new(producer: FutureProducer<KafkaContext>, topic: &str) -> Self {
        Self {
            producer,
            topic: topic.to_owned(),
        }
    }

    fn enqueue<T: Serialize>(&self, record: &T) -> Result<DeliveryFuture, SinkError> {
        let payload = serde_json::to_string(record)?;

        match self.producer.send_result(FutureRecord::<(), String> {
            topic: self.topic.as_str(),
            payload: Some(&payload),
            partition: None,
            key: None,
            timestamp: None,
            headers: None,
        }) {
            Ok(ack) => Ok(ack),
            Err((e, _)) => match e.rdkafka_error_code() {
                Some(RDKafkaErrorCode::MessageSizeTooLarge) => Err(SinkError::MessageTooLarge),
                _ => Err(SinkError::Produce(e)),
            },
        }
    }

    async fn process_ack(&self, delivery: DeliveryFuture) -> Result<(), SinkError> {
        match delivery.await {
            Err(_) => {
                // Cancelled due to timeout while retrying
                counter!("mars_kafka_produce_errors_total", "topic" => self.topic.clone())
                    .increment(1);
                Err(SinkError::Canceled)
            }
            Ok(Err((KafkaError::MessageProduction(RDKafkaErrorCode::MessageSizeTooLarge), _))) => {
                // Rejected by broker due to message size
                Err(SinkError::MessageTooLarge)
            }
            Ok(Err((err, _))) => {
                counter!("mars_kafka_produce_errors_total", "topic" => self.topic.clone())
                    .increment(1);
                Err(SinkError::Produce(err))
            }
            Ok(Ok(_)) => Ok(()),
        }
    }
}

#[async_trait]
impl<T> RecordSink<T> for KafkaSink
where
    T: Serialize + Send + Sync + 'static,
{
    async fn write(&self, record: T) -> Result<(), SinkError> {
        let ack = self.enqueue(&record)?;
        self.process_ack(ack).await
    }

    async fn flush(&self) -> Result<(), SinkError> {
        let producer = self.producer.clone();
        tokio::task::spawn_blocking(move || producer.flush(Duration::from_secs(30)))
            .await
            .map_err(|e| SinkError::Unavailable(e.to_string()))?
            .map_err(SinkError::Produce)
    }
}

/// Retries retryable write errors of the inner sink with the configured backoff.
///
/// Records are cloned for every attempt, the inner sink takes ownership of each copy.
pub struct RetryingSink<S, T> {
    name: &'static str,
    inner: S,
    policy: RetryPolicy,
    _record: PhantomData<fn(T)>,
}

impl<S, T> RetryingSink<S, T> {
    pub fn new(name: &'static str, inner: S, policy: RetryPolicy) -> Self {
        Self {
            name,
            inner,
            policy,
            _record: PhantomData,
        }
    }
}

#[async_trait]
impl<S, T> RecordSink<T> for RetryingSink<S, T>
where
    S: RecordSink<T>,
    T: Clone + Send + Sync + 'static,
{
    async fn write(&self, record: T) -> Result<(), SinkError> {
        let mut attempt = 0;

        loop {
            attempt += 1;
            let error = match self.inner.write(record.clone()).await {
                Ok(()) => return Ok(()),
                Err(error) => error,
            };

            if !error.is_retryable() || !self.policy.should_retry(attempt) {
                error!(
                    sink = self.name,
                    attempt, "giving up writing record: {}", error
                );
                return Err(error);
            }

            let interval = self.policy.retry_interval(attempt - 1);
            warn!(
                sink = self.name,
                attempt,
                backoff_ms = interval.as_millis() as u64,
                "retryable sink error, backing off: {}",
                error
            );
            counter!("mars_sink_write_retries_total", "sink" => self.name).increment(1);
            tokio::time::sleep(interval).await;
        }
    }

    async fn flush(&self) -> Result<(), SinkError> {
        self.inner.flush().await
    }
}
