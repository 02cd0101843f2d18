//! Internal telemetry: the process's own counters on `GET /metrics`

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use axum::extract::State;
use axum::http::header;
use axum::response::IntoResponse;
use axum::routing::get;
use tokio::net::TcpListener;
use tokio::sync::watch;

use crate::core::constants::PROMETHEUS_CONTENT_TYPE;
use crate::domain::{AdmissionController, StatsRegistry};

#[derive(Clone)]
struct TelemetryState {
    registry: Arc<StatsRegistry>,
    admission: Arc<AdmissionController>,
}

async fn metrics(State(state): State<TelemetryState>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, PROMETHEUS_CONTENT_TYPE)],
        state.registry.render(&state.admission),
    )
}

pub struct TelemetryServer {
    listener: TcpListener,
    state: TelemetryState,
}

impl TelemetryServer {
    pub async fn bind(
        addr: SocketAddr,
        registry: Arc<StatsRegistry>,
        admission: Arc<AdmissionController>,
    ) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind telemetry endpoint on {}", addr))?;
        Ok(Self {
            listener,
            state: TelemetryState {
                registry,
                admission,
            },
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub async fn start(self, mut shutdown_rx: watch::Receiver<bool>) -> Result<()> {
        tracing::debug!(addr = %self.local_addr()?, "Starting internal telemetry server");
        let router = Router::new()
            .route("/metrics", get(metrics))
            .with_state(self.state);
        axum::serve(self.listener, router)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.wait_for(|&v| v).await;
            })
            .await?;
        Ok(())
    }
}
