//! Dispatch parsed messages to the valid and malformed sinks.
//!
//! The router owns no validation logic: every message goes through `parser::parse` and
//! ends up in exactly one sink. Malformed messages are a normal outcome and are
//! acknowledged like any other. Only sink or transport failures stop the router, leaving
//! the affected message unacknowledged so the transport delivers it again.
use std::fmt;
use std::sync::Arc;
use std::time;

use mars_common::health::{ComponentStatus, HealthHandle};
use mars_common::parser::parse;
use mars_common::record::{MalformedRecord, Outcome, ParsedRecord, RawMessage, RecordKind};
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error, info, warn};

use crate::error::RouterError;
use crate::sink::RecordSink;
use crate::source::MessageSource;

/// Pause after a transient receive error before polling the source again.
const RECEIVE_ERROR_BACKOFF: time::Duration = time::Duration::from_secs(1);

/// How often the router reports healthy while idle, waiting for a message.
const LIVENESS_REPORT_INTERVAL: time::Duration = time::Duration::from_secs(5);

#[derive(Debug, Clone, Copy)]
pub struct RouterSettings {
    /// Maximum number of messages being parsed, dispatched or acknowledged at once.
    pub max_in_flight: usize,
    /// How long in-flight messages may take to finish once the router stops.
    pub shutdown_timeout: time::Duration,
}

impl Default for RouterSettings {
    fn default() -> Self {
        Self {
            max_in_flight: 100,
            shutdown_timeout: time::Duration::from_secs(30),
        }
    }
}

/// Counts of what happened to the messages received during one `run`.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RouterStats {
    pub received: u64,
    pub valid: u64,
    pub malformed: u64,
    pub acknowledged: u64,
}

impl RouterStats {
    fn record(&mut self, kind: RecordKind) {
        match kind {
            RecordKind::Valid => self.valid += 1,
            RecordKind::Malformed => self.malformed += 1,
        }
        self.acknowledged += 1;
    }
}

/// Lifecycle of a single message. States are strictly sequential, `DispatchFailed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageState {
    Received,
    Parsed,
    Dispatched,
    Acknowledged,
    DispatchFailed,
}

impl MessageState {
    pub fn can_transition_to(self, next: MessageState) -> bool {
        matches!(
            (self, next),
            (MessageState::Received, MessageState::Parsed)
                | (MessageState::Parsed, MessageState::Dispatched)
                | (MessageState::Parsed, MessageState::DispatchFailed)
                | (MessageState::Dispatched, MessageState::Acknowledged)
        )
    }
}

impl fmt::Display for MessageState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MessageState::Received => "received",
            MessageState::Parsed => "parsed",
            MessageState::Dispatched => "dispatched",
            MessageState::Acknowledged => "acknowledged",
            MessageState::DispatchFailed => "dispatch_failed",
        };
        f.write_str(name)
    }
}

/// Consumes a message source and routes every message to the valid or malformed sink.
///
/// Reports healthy on every loop iteration and periodically while waiting for messages.
/// A router stuck waiting for capacity stops reporting and eventually fails liveness.
pub struct StreamRouter<S, V, M> {
    source: Arc<S>,
    valid_sink: Arc<V>,
    malformed_sink: Arc<M>,
    settings: RouterSettings,
    liveness: HealthHandle,
}

impl<S, V, M> StreamRouter<S, V, M>
where
    S: MessageSource + 'static,
    V: RecordSink<ParsedRecord> + 'static,
    M: RecordSink<MalformedRecord> + 'static,
{
    pub fn new(
        source: S,
        valid_sink: V,
        malformed_sink: M,
        settings: RouterSettings,
        liveness: HealthHandle,
    ) -> Self {
        Self {
            source: Arc::new(source),
            valid_sink: Arc::new(valid_sink),
            malformed_sink: Arc::new(malformed_sink),
            settings: RouterSettings {
                max_in_flight: settings.max_in_flight.clamp(1, Semaphore::MAX_PERMITS),
                ..settings
            },
            liveness,
        }
    }

    /// Route messages until the source is exhausted, `shutdown` is set to true, or an
    /// infrastructure error occurs.
    ///
    /// In every case the router stops receiving, gives in-flight messages up to
    /// `shutdown_timeout` to finish, then flushes both sinks and closes the source before
    /// returning. Messages abandoned at the timeout are left unacknowledged. The router
    /// reports itself unhealthy once stopped.
    pub async fn run(
        self,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<RouterStats, RouterError> {
        let max_in_flight = self.settings.max_in_flight;
        let semaphore = Arc::new(Semaphore::new(max_in_flight));
        let mut tasks: JoinSet<Result<RecordKind, RouterError>> = JoinSet::new();
        let mut stats = RouterStats::default();
        let mut failure: Option<RouterError> = None;
        let mut heartbeat = tokio::time::interval_at(
            tokio::time::Instant::now() + LIVENESS_REPORT_INTERVAL,
            LIVENESS_REPORT_INTERVAL,
        );
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        info!(max_in_flight, "starting stream router");

        loop {
            self.liveness.report_healthy().await;
            metrics::gauge!("mars_router_saturation_percent")
                .set(1f64 - semaphore.available_permits() as f64 / max_in_flight as f64);

            // Wait for capacity before receiving, collecting finished messages meanwhile.
            let permit = tokio::select! {
                biased;
                _ = wait_for_shutdown(&mut shutdown) => {
                    info!("shutdown requested, no longer receiving messages");
                    break;
                }
                Some(joined) = tasks.join_next() => {
                    if let Err(error) = collect(&mut stats, joined) {
                        failure = Some(error);
                        break;
                    }
                    continue;
                }
                permit = semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let receive = self.source.receive();
            tokio::pin!(receive);
            let received = loop {
                tokio::select! {
                    biased;
                    _ = wait_for_shutdown(&mut shutdown) => break None,
                    received = &mut receive => break Some(received),
                    _ = heartbeat.tick() => self.liveness.report_healthy().await,
                }
            };
            let Some(received) = received else {
                info!("shutdown requested, no longer receiving messages");
                break;
            };

            match received {
                Ok(Some(message)) => {
                    stats.received += 1;
                    metrics::counter!("mars_messages_received_total").increment(1);
                    self.spawn_message_task(&mut tasks, permit, message);
                }
                Ok(None) => {
                    info!("message source exhausted");
                    break;
                }
                Err(error) if error.is_transient() => {
                    metrics::counter!("mars_source_receive_errors_total").increment(1);
                    warn!("transient error receiving message, will retry: {}", error);
                    drop(permit);
                    tokio::select! {
                        _ = wait_for_shutdown(&mut shutdown) => break,
                        _ = tokio::time::sleep(RECEIVE_ERROR_BACKOFF) => {}
                    }
                }
                Err(error) => {
                    metrics::counter!("mars_source_receive_errors_total").increment(1);
                    failure = Some(RouterError::Receive(error));
                    break;
                }
            }
        }

        let drained = self.drain(&mut tasks, &mut stats).await;
        if failure.is_none() {
            failure = drained.err();
        }

        let released = self.release().await;
        if failure.is_none() {
            failure = released.err();
        }
        self.liveness
            .report_status(ComponentStatus::Unhealthy)
            .await;

        info!(
            received = stats.received,
            valid = stats.valid,
            malformed = stats.malformed,
            acknowledged = stats.acknowledged,
            "stream router stopped"
        );

        match failure {
            Some(error) => {
                error!("stream router stopped on error: {}", error);
                Err(error)
            }
            None => Ok(stats),
        }
    }

    fn spawn_message_task(
        &self,
        tasks: &mut JoinSet<Result<RecordKind, RouterError>>,
        permit: OwnedSemaphorePermit,
        message: RawMessage,
    ) {
        let source = self.source.clone();
        let valid_sink = self.valid_sink.clone();
        let malformed_sink = self.malformed_sink.clone();

        tasks.spawn(async move {
            let start = tokio::time::Instant::now();
            let result = process_message(
                source.as_ref(),
                valid_sink.as_ref(),
                malformed_sink.as_ref(),
                message,
            )
            .await;
            drop(permit);

            metrics::histogram!("mars_message_processing_duration_seconds")
                .record(start.elapsed().as_secs_f64());
            result
        });
    }

    /// Wait for in-flight messages, abandoning them once the shutdown timeout is reached.
    async fn drain(
        &self,
        tasks: &mut JoinSet<Result<RecordKind, RouterError>>,
        stats: &mut RouterStats,
    ) -> Result<(), RouterError> {
        if !tasks.is_empty() {
            info!(in_flight = tasks.len(), "waiting for in-flight messages");
        }

        let mut first_error = None;
        let completed = tokio::time::timeout(self.settings.shutdown_timeout, async {
            while let Some(joined) = tasks.join_next().await {
                if let Err(error) = collect(stats, joined) {
                    first_error.get_or_insert(error);
                }
            }
        })
        .await;

        if completed.is_err() {
            warn!(
                abandoned = tasks.len(),
                "shutdown timeout reached, abandoning unacknowledged messages"
            );
            tasks.abort_all();
            while let Some(joined) = tasks.join_next().await {
                match joined {
                    Err(error) if error.is_cancelled() => {}
                    joined => {
                        if let Err(error) = collect(stats, joined) {
                            first_error.get_or_insert(error);
                        }
                    }
                }
            }
        }

        match first_error {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    /// Flush both sinks, then close the source so that stored offsets get committed.
    async fn release(&self) -> Result<(), RouterError> {
        let mut first_error = None;

        for (sink, flushed) in [
            ("valid", self.valid_sink.flush().await),
            ("malformed", self.malformed_sink.flush().await),
        ] {
            if let Err(error) = flushed {
                error!(sink, "failed to flush sink: {}", error);
                first_error.get_or_insert(RouterError::Flush { sink, error });
            }
        }

        if let Err(error) = self.source.close().await {
            // Offsets that were not committed only lead to redeliveries.
            warn!("failed to close message source: {}", error);
        }

        match first_error {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

/// Parse one message, write it to its sink, then acknowledge it.
///
/// Returns which sink received the message. An error means the message was not
/// acknowledged.
pub async fn process_message<S, V, M>(
    source: &S,
    valid_sink: &V,
    malformed_sink: &M,
    message: RawMessage,
) -> Result<RecordKind, RouterError>
where
    S: MessageSource + ?Sized,
    V: RecordSink<ParsedRecord> + ?Sized,
    M: RecordSink<MalformedRecord> + ?Sized,
{
    let RawMessage { payload, token } = message;
    let mut state = MessageState::Received;

    let outcome = parse(&payload);
    state = advance(&token, state, MessageState::Parsed);

    let kind = outcome.kind();
    metrics::counter!("mars_messages_classified_total", "outcome" => kind.as_str()).increment(1);

    let dispatched = match outcome {
        Outcome::Valid(record) => valid_sink.write(record).await,
        Outcome::Malformed(record) => malformed_sink.write(record).await,
    };

    if let Err(error) = dispatched {
        advance(&token, state, MessageState::DispatchFailed);
        metrics::counter!("mars_dispatch_failures_total", "sink" => kind.as_str()).increment(1);
        return Err(RouterError::Dispatch {
            token,
            sink: kind.as_str(),
            error,
        });
    }
    state = advance(&token, state, MessageState::Dispatched);

    if let Err(error) = source.acknowledge(token.clone()).await {
        return Err(RouterError::Acknowledge { token, error });
    }
    advance(&token, state, MessageState::Acknowledged);
    metrics::counter!("mars_messages_acknowledged_total").increment(1);

    Ok(kind)
}

fn advance(
    token: &mars_common::record::DeliveryToken,
    from: MessageState,
    to: MessageState,
) -> MessageState {
    debug_assert!(from.can_transition_to(to), "invalid transition {from} -> {to}");
    debug!(%token, from = %from, to = %to, "message state changed");
    to
}

fn collect(
    stats: &mut RouterStats,
    joined: Result<Result<RecordKind, RouterError>, JoinError>,
) -> Result<(), RouterError> {
    let kind = joined??;
    stats.record(kind);
    Ok(())
}

/// Resolves once `shutdown` holds true. A dropped sender never requests shutdown.
async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    let requested = shutdown.wait_for(|stop| *stop).await.is_ok();
    if !requested {
        std::future::pending::<()>().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_state_transitions() {
        use MessageState::{Acknowledged, DispatchFailed, Dispatched, Parsed, Received};

        assert!(Received.can_transition_to(Parsed));
        assert!(Parsed.can_transition_to(Dispatched));
        assert!(Parsed.can_transition_to(DispatchFailed));
        assert!(Dispatched.can_transition_to(Acknowledged));

        assert!(!Received.can_transition_to(Dispatched));
        assert!(!Dispatched.can_transition_to(DispatchFailed));
        assert!(!Acknowledged.can_transition_to(Received));
        assert!(!DispatchFailed.can_transition_to(Acknowledged));
    }

    #[test]
    fn test_router_stats_record() {
        let mut stats = RouterStats::default();
        stats.record(RecordKind::Valid);
        stats.record(RecordKind::Malformed);
        stats.record(RecordKind::Malformed);

        assert_eq!(stats.valid, 1);
        assert_eq!(stats.malformed, 2);
        assert_eq!(stats.acknowledged, 3);
    }
}
