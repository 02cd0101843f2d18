//! `health_check` extension

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::sync::watch;

use crate::core::config::HealthCheckConfig;

/// Readiness flag shared between startup and the health server
#[derive(Clone)]
pub struct HealthState {
    ready: Arc<AtomicBool>,
    up_since: DateTime<Utc>,
}

impl Default for HealthState {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthState {
    pub fn new() -> Self {
        Self {
            ready: Arc::new(AtomicBool::new(false)),
            up_since: Utc::now(),
        }
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::Release);
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthResponse {
    status: &'static str,
    up_since: String,
    uptime: String,
}

async fn health(State(state): State<HealthState>) -> Response {
    let uptime = (Utc::now() - state.up_since).to_std().unwrap_or_default();
    let (code, status) = if state.is_ready() {
        (StatusCode::OK, "Server available")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "Server not available")
    };
    (
        code,
        Json(HealthResponse {
            status,
            up_since: state.up_since.to_rfc3339_opts(SecondsFormat::Millis, true),
            uptime: format!("{:?}", uptime),
        }),
    )
        .into_response()
}

fn routes(path: &str, state: HealthState) -> Router {
    Router::new().route(path, get(health)).with_state(state)
}

pub struct HealthServer {
    listener: TcpListener,
    router: Router,
}

impl HealthServer {
    pub async fn bind(config: &HealthCheckConfig, state: HealthState) -> Result<Self> {
        let listener = TcpListener::bind(config.endpoint)
            .await
            .with_context(|| format!("Failed to bind health check on {}", config.endpoint))?;
        Ok(Self {
            listener,
            router: routes(&config.path, state),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub async fn start(self, mut shutdown_rx: watch::Receiver<bool>) -> Result<()> {
        tracing::debug!(addr = %self.local_addr()?, "Starting health check server");
        axum::serve(self.listener, self.router)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.wait_for(|&v| v).await;
            })
            .await?;
        Ok(())
    }
}
