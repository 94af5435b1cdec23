use std::future::ready;

use axum::{routing::get, Router};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

use crate::health::HealthRegistry;

/// Bind a `TcpListener` on the provided bind address to serve a `Router` on it.
pub async fn serve(router: Router, bind: &str) -> Result<(), std::io::Error> {
    let listener = tokio::net::TcpListener::bind(bind).await?;

    axum::serve(listener, router).await?;

    Ok(())
}

/// Build the operational router: Prometheus metrics plus liveness and readiness probes.
/// Every metric is labelled with the project it is exported for.
///
/// Readiness mirrors liveness: the router has no warm-up phase once its Kafka clients are up.
pub fn setup_metrics_router(liveness: HealthRegistry, project: &str) -> Result<Router, BuildError> {
    let recorder_handle = setup_metrics_recorder(project)?;
    let readiness = liveness.clone();

    Ok(Router::new()
        .route("/", get(index))
        .route("/_liveness", get(move || ready(liveness.get_status())))
        .route("/_readiness", get(move || ready(readiness.get_status())))
        .route("/metrics", get(move || ready(recorder_handle.render()))))
}

pub fn setup_metrics_recorder(project: &str) -> Result<PrometheusHandle, BuildError> {
    const EXPONENTIAL_SECONDS: &[f64] = &[
        0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
    ];

    PrometheusBuilder::new()
        .add_global_label("project", project)
        .set_buckets(EXPONENTIAL_SECONDS)?
        .install_recorder()
}

async fn index() -> &'static str {
    "mars router"
}
