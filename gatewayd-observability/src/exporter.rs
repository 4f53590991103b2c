use crate::merger::MetricsMerger;
use crate::metrics::MetricsCollector;
use axum::Router;
use axum::extract::State;
use axum::http::header::CONTENT_TYPE;
use axum::response::IntoResponse;
use axum::routing::get;
use std::sync::Arc;
use tracing::info;

const EXPOSITION_CONTENT_TYPE: &str = "text/plain; version=0.0.4";

/// State behind the metrics endpoint.
pub struct MetricsEndpoint {
    pub collector: Arc<MetricsCollector>,
    pub merger: Option<Arc<MetricsMerger>>,
}

/// Build the metrics router. The endpoint serves the gateway's own
/// exposition followed by the merged plugin buffer.
pub fn router(path: &str, endpoint: Arc<MetricsEndpoint>) -> Router {
    Router::new().route(path, get(render_metrics)).with_state(endpoint)
}

async fn render_metrics(State(endpoint): State<Arc<MetricsEndpoint>>) -> impl IntoResponse {
    let mut body = endpoint.collector.gather_text();
    if let Some(merger) = &endpoint.merger {
        let merged = merger.output();
        if !merged.is_empty() {
            body.push_str(&String::from_utf8_lossy(&merged));
        }
    }
    ([(CONTENT_TYPE, EXPOSITION_CONTENT_TYPE)], body)
}

/// Serve the metrics endpoint until the process exits. Runs on whatever
/// tokio runtime the caller provides (a dedicated thread in practice).
pub async fn serve(addr: &str, path: &str, endpoint: Arc<MetricsEndpoint>) -> anyhow::Result<()> {
    let app = router(path, endpoint);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = addr, path = path, "Metrics endpoint listening");
    axum::serve(listener, app).await?;
    Ok(())
}
