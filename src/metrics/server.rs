use std::net::SocketAddr;
use std::sync::Arc;

use axum::{extract::State, routing::get, Router};
use tracing::info;

use crate::metrics::registry::Metrics;

/// Prometheus exposition endpoint. The engine's only outward HTTP surface:
/// `GET /metrics` serving the consensus gauges in text format on a dedicated
/// listener.
pub struct MetricsServer {
    listen_addr: String,
    metrics: Arc<Metrics>,
}

impl MetricsServer {
    pub fn new(listen_addr: impl Into<String>, metrics: Arc<Metrics>) -> Self {
        Self {
            listen_addr: listen_addr.into(),
            metrics,
        }
    }

    pub async fn run(self) -> Result<(), anyhow::Error> {
        let addr: SocketAddr = self.listen_addr.parse()?;
        let listener = tokio::net::TcpListener::bind(addr).await?;
        info!(addr = %addr, "Metrics endpoint listening");

        let router = Router::new()
            .route("/metrics", get(serve_metrics))
            .with_state(self.metrics);
        axum::serve(listener, router).await?;
        Ok(())
    }
}

async fn serve_metrics(State(metrics): State<Arc<Metrics>>) -> String {
    metrics.encode()
}
