use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Install the prometheus recorder and build the scrape router.
pub fn build_router() -> axum::Router<()> {
    use axum::routing::get;

    let handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("metrics recorder installs once at startup");

    axum::Router::new().route("/prometheus", get(move || prometheus_metrics(handle.clone())))
}

#[tracing::instrument(skip_all)]
async fn prometheus_metrics(handle: PrometheusHandle) -> (axum::http::StatusCode, String) {
    (axum::http::StatusCode::OK, handle.render())
}
