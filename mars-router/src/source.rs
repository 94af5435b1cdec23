use std::collections::{BTreeSet, HashMap};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use mars_common::config::{ConsumerConfig, KafkaConfig};
use mars_common::health::HealthHandle;
use mars_common::kafka_producer::{base_client_config, KafkaContext};
use mars_common::record::{DeliveryToken, RawMessage};
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::error::KafkaError;
use rdkafka::types::RDKafkaErrorCode;
use rdkafka::Message;
use tracing::{debug, info, warn};

use crate::error::SourceError;

/// An ordered, acknowledgeable stream of raw messages.
#[async_trait]
pub trait MessageSource: Send + Sync {
    /// Wait for the next message. `Ok(None)` means the source is exhausted.
    async fn receive(&self) -> Result<Option<RawMessage>, SourceError>;

    /// Mark a message as fully processed. Unacknowledged messages are redelivered.
    async fn acknowledge(&self, token: DeliveryToken) -> Result<(), SourceError>;

    /// Release the source once no more messages will be received or acknowledged.
    async fn close(&self) -> Result<(), SourceError> {
        Ok(())
    }
}

#[derive(Default)]
struct PartitionOffsets {
    in_flight: BTreeSet<i64>,
    completed: BTreeSet<i64>,
    stored: Option<i64>,
}

impl PartitionOffsets {
    /// Highest offset such that every tracked offset up to it has completed.
    fn watermark(&self) -> Option<i64> {
        match self.in_flight.first() {
            Some(lowest) => self.completed.range(..*lowest).next_back().copied(),
            None => self.completed.last().copied(),
        }
    }
}

/// Tracks in-flight offsets per partition, so that concurrent acknowledgements only ever
/// commit past a message once every earlier message of its partition is done.
#[derive(Default)]
pub struct OffsetTracker {
    partitions: Mutex<HashMap<(String, i32), PartitionOffsets>>,
}

impl OffsetTracker {
    pub fn track(&self, token: &DeliveryToken) {
        let mut partitions = self.partitions.lock().unwrap_or_else(PoisonError::into_inner);
        partitions
            .entry((token.topic.clone(), token.partition))
            .or_default()
            .in_flight
            .insert(token.offset);
    }

    /// Mark an offset as done. Returns the new offset to store when the partition's
    /// watermark moved forward.
    pub fn complete(&self, token: &DeliveryToken) -> Option<i64> {
        let mut partitions = self.partitions.lock().unwrap_or_else(PoisonError::into_inner);
        let offsets = partitions.get_mut(&(token.topic.clone(), token.partition))?;

        if !offsets.in_flight.remove(&token.offset) {
            return None;
        }
        offsets.completed.insert(token.offset);

        let watermark = offsets.watermark()?;
        // Everything at or below the watermark is settled.
        offsets.completed = offsets.completed.split_off(&(watermark + 1));

        if offsets.stored.is_some_and(|stored| stored >= watermark) {
            return None;
        }
        offsets.stored = Some(watermark);
        Some(watermark)
    }

    /// Number of offsets received but not yet completed, across all partitions.
    pub fn in_flight(&self) -> usize {
        let partitions = self.partitions.lock().unwrap_or_else(PoisonError::into_inner);
        partitions.values().map(|p| p.in_flight.len()).sum()
    }
}

/// Reads raw messages from a single Kafka topic.
///
/// Offsets are stored when messages are acknowledged and committed by librdkafka's auto
/// commit, so a message that is never acknowledged is consumed again after a restart.
pub struct KafkaSource {
    consumer: StreamConsumer<KafkaContext>,
    topic: String,
    offsets: OffsetTracker,
}

impl KafkaSource {
    pub fn new(
        kafka_config: &KafkaConfig,
        consumer_config: &ConsumerConfig,
        client_id: &str,
        liveness: HealthHandle,
    ) -> Result<Self, KafkaError> {
        let mut client_config = base_client_config(kafka_config, client_id);
        client_config
            .set("group.id", &consumer_config.kafka_consumer_group)
            .set(
                "auto.offset.reset",
                &consumer_config.kafka_consumer_offset_reset,
            )
            .set("enable.auto.commit", "true")
            .set(
                "auto.commit.interval.ms",
                consumer_config
                    .kafka_consumer_auto_commit_interval_ms
                    .to_string(),
            )
            .set("enable.auto.offset.store", "false")
            .set("enable.partition.eof", "false");

        debug!("rdkafka consumer configuration: {:?}", client_config);
        let consumer: StreamConsumer<KafkaContext> =
            client_config.create_with_context(liveness.into())?;
        consumer.subscribe(&[consumer_config.kafka_consumer_topic.as_str()])?;

        info!(
            topic = %consumer_config.kafka_consumer_topic,
            group_id = %consumer_config.kafka_consumer_group,
            "kafka consumer subscribed"
        );

        Ok(Self {
            consumer,
            topic: consumer_config.kafka_consumer_topic.to_owned(),
            offsets: OffsetTracker::default(),
        })
    }
}

#[async_trait]
impl MessageSource for KafkaSource {
    async fn receive(&self) -> Result<Option<RawMessage>, SourceError> {
        let message = self.consumer.recv().await?;

        let token = DeliveryToken {
            topic: message.topic().to_owned(),
            partition: message.partition(),
            offset: message.offset(),
        };
        // A null payload is an empty message, and ends up in the dead-letter topic.
        let payload = message.payload().unwrap_or_default().to_vec();

        self.offsets.track(&token);
        Ok(Some(RawMessage::new(payload, token)))
    }

    async fn acknowledge(&self, token: DeliveryToken) -> Result<(), SourceError> {
        let Some(offset) = self.offsets.complete(&token) else {
            return Ok(());
        };

        // Storing fails for partitions revoked by a rebalance. The new owner starts from the
        // last commit, which only means some messages are processed twice.
        if let Err(error) = self
            .consumer
            .store_offset(&token.topic, token.partition, offset)
        {
            metrics::counter!("mars_source_offset_store_errors_total").increment(1);
            warn!(%token, "failed to store offset: {}", error);
        }

        Ok(())
    }

    async fn close(&self) -> Result<(), SourceError> {
        info!(
            topic = %self.topic,
            in_flight = self.offsets.in_flight(),
            "committing offsets and closing kafka consumer"
        );

        match self.consumer.commit_consumer_state(CommitMode::Sync) {
            Ok(()) => {}
            Err(error) if error.rdkafka_error_code() == Some(RDKafkaErrorCode::NoOffset) => {}
            Err(error) => return Err(SourceError::Kafka(error)),
        }
        self.consumer.unsubscribe();

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token(partition: i32, offset: i64) -> DeliveryToken {
        DeliveryToken {
            topic: "activities".to_owned(),
            partition,
            offset,
        }
    }

    #[test]
    fn test_in_order_completion_advances_watermark() {
        let tracker = OffsetTracker::default();
        tracker.track(&token(0, 10));
        tracker.track(&token(0, 11));

        assert_eq!(tracker.complete(&token(0, 10)), Some(10));
        assert_eq!(tracker.complete(&token(0, 11)), Some(11));
        assert_eq!(tracker.in_flight(), 0);
    }

    #[test]
    fn test_out_of_order_completion_waits_for_lowest_offset() {
        let tracker = OffsetTracker::default();
        for offset in 10..14 {
            tracker.track(&token(0, offset));
        }

        assert_eq!(tracker.complete(&token(0, 12)), None);
        assert_eq!(tracker.complete(&token(0, 11)), None);
        assert_eq!(tracker.complete(&token(0, 10)), Some(12));
        assert_eq!(tracker.in_flight(), 1);
        assert_eq!(tracker.complete(&token(0, 13)), Some(13));
    }

    #[test]
    fn test_partitions_are_independent() {
        let tracker = OffsetTracker::default();
        tracker.track(&token(0, 5));
        tracker.track(&token(1, 7));
        tracker.track(&token(1, 8));

        assert_eq!(tracker.complete(&token(1, 8)), None);
        assert_eq!(tracker.complete(&token(0, 5)), Some(5));
        assert_eq!(tracker.complete(&token(1, 7)), Some(8));
    }

    #[test]
    fn test_unknown_or_repeated_completion_is_ignored() {
        let tracker = OffsetTracker::default();
        assert_eq!(tracker.complete(&token(0, 1)), None);

        tracker.track(&token(0, 1));
        assert_eq!(tracker.complete(&token(0, 1)), Some(1));
        assert_eq!(tracker.complete(&token(0, 1)), None);
    }

    #[test]
    fn test_watermark_never_moves_backwards() {
        let tracker = OffsetTracker::default();
        tracker.track(&token(0, 20));
        assert_eq!(tracker.complete(&token(0, 20)), Some(20));

        // Redelivered after a rebalance.
        tracker.track(&token(0, 15));
        assert_eq!(tracker.complete(&token(0, 15)), None);
    }
}
