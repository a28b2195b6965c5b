//! Prometheus metrics endpoint shared by both binaries.

use axum::routing::get;
use axum::Router;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

use crate::health::HealthRegistry;

/// Bind a `TcpListener` on the provided address and serve a `Router` on it.
pub async fn serve(router: Router, bind: &str) -> Result<(), std::io::Error> {
    let listener = tokio::net::TcpListener::bind(bind).await?;

    axum::serve(listener, router).await?;

    Ok(())
}

pub fn setup_metrics_recorder() -> PrometheusHandle {
    const EXPONENTIAL_SECONDS: &[f64] = &[
        0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0,
    ];

    PrometheusBuilder::new()
        .set_buckets(EXPONENTIAL_SECONDS)
        .expect("bucket list is non-empty")
        .install_recorder()
        .expect("failed to install Prometheus recorder")
}

/// The observability router: metrics plus liveness/readiness probes backed
/// by the health registry.
pub fn observability_router(liveness: HealthRegistry, recorder: PrometheusHandle) -> Router {
    Router::new()
        .route("/", get(|| async { "dragnet" }))
        .route("/_readiness", get(|| async { "ok" }))
        .route(
            "/_liveness",
            get(move || std::future::ready(liveness.get_status())),
        )
        .route(
            "/metrics",
            get(move || std::future::ready(recorder.render())),
        )
}
