use std::collections::HashMap;
use std::ops::Add;
use std::sync::{Arc, RwLock};

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use time::{Duration, OffsetDateTime};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Liveness reporting for the long running loops of the router.
///
/// The process is only live if every registered component keeps reporting healthy before
/// its deadline. The rdkafka clients report from their statistics callback, so a stuck
/// librdkafka loop eventually fails the probe and gets the pod restarted.
///
/// A component that never reported, reported unhealthy, or missed its deadline makes the
/// whole registry unhealthy. An empty registry is unhealthy too.
#[derive(Default, Debug)]
pub struct HealthStatus {
    pub healthy: bool,
    pub components: HashMap<String, ComponentStatus>,
}

impl IntoResponse for HealthStatus {
    fn into_response(self) -> Response {
        let body = format!("{:?}", self);
        let status = if self.healthy {
            StatusCode::OK
        } else {
            StatusCode::INTERNAL_SERVER_ERROR
        };
        (status, body).into_response()
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ComponentStatus {
    /// Registered, no report yet
    Starting,
    /// Reported healthy, must report again before this instant
    HealthyUntil(OffsetDateTime),
    /// Reported unhealthy
    Unhealthy,
    /// Missed its HealthyUntil deadline
    Stalled,
}

impl ComponentStatus {
    /// Resolve the status as seen at `now`, turning expired deadlines into `Stalled`.
    fn at(&self, now: OffsetDateTime) -> ComponentStatus {
        match self {
            ComponentStatus::HealthyUntil(until) if *until <= now => ComponentStatus::Stalled,
            other => other.clone(),
        }
    }

    fn is_healthy(&self) -> bool {
        matches!(self, ComponentStatus::HealthyUntil(_))
    }
}

struct StatusReport {
    component: String,
    status: ComponentStatus,
}

pub struct HealthHandle {
    component: String,
    deadline: Duration,
    sender: mpsc::Sender<StatusReport>,
}

impl HealthHandle {
    /// Report healthy until `now + deadline`.
    pub async fn report_healthy(&self) {
        self.report_status(ComponentStatus::HealthyUntil(
            OffsetDateTime::now_utc().add(self.deadline),
        ))
        .await
    }

    pub async fn report_status(&self, status: ComponentStatus) {
        if let Err(err) = self.sender.send(self.report(status)).await {
            warn!(component = %self.component, "failed to report health status: {}", err)
        }
    }

    /// Synchronous variant of `report_healthy` for rdkafka callbacks, which may run on a
    /// librdkafka thread or inside the consumer's task. Drops the report if the queue is full.
    pub fn try_report_healthy(&self) {
        let status = ComponentStatus::HealthyUntil(OffsetDateTime::now_utc().add(self.deadline));
        if let Err(err) = self.sender.try_send(self.report(status)) {
            warn!(component = %self.component, "failed to report health status: {}", err)
        }
    }

    fn report(&self, status: ComponentStatus) -> StatusReport {
        StatusReport {
            component: self.component.clone(),
            status,
        }
    }
}

#[derive(Clone)]
pub struct HealthRegistry {
    name: String,
    components: Arc<RwLock<HashMap<String, ComponentStatus>>>,
    sender: mpsc::Sender<StatusReport>,
}

impl HealthRegistry {
    /// Create a registry and spawn the task applying status reports. Needs a tokio runtime.
    pub fn new(name: &str) -> Self {
        let (sender, mut receiver) = mpsc::channel::<StatusReport>(16);
        let components: Arc<RwLock<HashMap<String, ComponentStatus>>> = Default::default();

        let writer = components.clone();
        tokio::spawn(async move {
            while let Some(report) = receiver.recv().await {
                match writer.write() {
                    Ok(mut map) => {
                        _ = map.insert(report.component, report.status);
                    }
                    // Probes will fail and the process will restart
                    Err(_) => warn!("poisoned HealthRegistry lock"),
                }
            }
        });

        Self {
            name: name.to_owned(),
            components,
            sender,
        }
    }

    /// Register a component, starting in `Starting`. The handle must then report more often
    /// than `deadline`.
    pub async fn register(&self, component: &str, deadline: Duration) -> HealthHandle {
        let handle = HealthHandle {
            component: component.to_owned(),
            deadline,
            sender: self.sender.clone(),
        };
        handle.report_status(ComponentStatus::Starting).await;
        handle
    }

    /// Current status of the process. Usable directly as an axum handler.
    pub fn get_status(&self) -> HealthStatus {
        let now = OffsetDateTime::now_utc();
        let components: HashMap<String, ComponentStatus> = match self.components.read() {
            Ok(map) => map
                .iter()
                .map(|(name, status)| (name.clone(), status.at(now)))
                .collect(),
            Err(_) => {
                warn!("{} health check failed: poisoned lock", self.name);
                return HealthStatus::default();
            }
        };

        let healthy = !components.is_empty() && components.values().all(|s| s.is_healthy());
        if healthy {
            debug!("{} health check ok", self.name);
        } else {
            warn!("{} health check failed: {:?}", self.name, components);
        }

        HealthStatus {
            healthy,
            components,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ops::Sub;

    async fn wait_until<F>(check: F)
    where
        F: Fn() -> bool,
    {
        let deadline = OffsetDateTime::now_utc().add(Duration::seconds(5));
        while !check() && OffsetDateTime::now_utc() < deadline {
            tokio::time::sleep(tokio::time::Duration::from_millis(50)).await;
        }
        assert!(check())
    }

    #[tokio::test]
    async fn empty_registry_is_unhealthy() {
        let registry = HealthRegistry::new("liveness");
        assert!(!registry.get_status().healthy);
    }

    #[tokio::test]
    async fn component_lifecycle() {
        let registry = HealthRegistry::new("liveness");
        let handle = registry
            .register("kafka-consumer", Duration::seconds(30))
            .await;

        wait_until(|| registry.get_status().components.len() == 1).await;
        let status = registry.get_status();
        assert!(!status.healthy);
        assert_eq!(
            status.components.get("kafka-consumer"),
            Some(&ComponentStatus::Starting)
        );

        handle.report_healthy().await;
        wait_until(|| registry.get_status().healthy).await;

        handle.report_status(ComponentStatus::Unhealthy).await;
        wait_until(|| !registry.get_status().healthy).await;

        handle.try_report_healthy();
        wait_until(|| registry.get_status().healthy).await;

        handle.report_status(ComponentStatus::Unhealthy).await;
        wait_until(|| !registry.get_status().healthy).await;
        assert_eq!(
            registry.get_status().components.get("kafka-consumer"),
            Some(&ComponentStatus::Unhealthy)
        );
    }

    #[tokio::test]
    async fn missed_deadline_is_stalled() {
        let registry = HealthRegistry::new("liveness");
        let handle = registry
            .register("kafka-producer", Duration::seconds(30))
            .await;

        handle
            .report_status(ComponentStatus::HealthyUntil(
                OffsetDateTime::now_utc().sub(Duration::seconds(1)),
            ))
            .await;
        wait_until(|| {
            registry.get_status().components.get("kafka-producer")
                == Some(&ComponentStatus::Stalled)
        })
        .await;
        assert!(!registry.get_status().healthy);
    }

    #[tokio::test]
    async fn every_component_must_be_healthy() {
        let registry = HealthRegistry::new("liveness");
        let consumer = registry
            .register("kafka-consumer", Duration::seconds(30))
            .await;
        let producer = registry
            .register("kafka-producer", Duration::seconds(30))
            .await;

        consumer.report_healthy().await;
        wait_until(|| {
            registry.get_status().components.get("kafka-consumer")
                != Some(&ComponentStatus::Starting)
        })
        .await;
        assert!(!registry.get_status().healthy);

        producer.report_healthy().await;
        wait_until(|| registry.get_status().healthy).await;
    }

    #[tokio::test]
    async fn into_response() {
        let nok = HealthStatus::default().into_response();
        assert_eq!(nok.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let ok = HealthStatus {
            healthy: true,
            components: Default::default(),
        }
        .into_response();
        assert_eq!(ok.status(), StatusCode::OK);
    }
}
