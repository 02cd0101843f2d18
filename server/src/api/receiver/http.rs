//! OTLP/HTTP listener

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, State};
use axum::http::HeaderMap;
use axum::response::Response;
use axum::routing::post;
use opentelemetry_proto::tonic::collector::{
    logs::v1::ExportLogsServiceResponse, metrics::v1::ExportMetricsServiceResponse,
    trace::v1::ExportTraceServiceResponse,
};
use prost::Message;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower_http::decompression::RequestDecompressionLayer;
use tower_http::trace::TraceLayer;

use super::Ingest;
use super::encoding::{OtlpContentType, decode_request, success_response};
use crate::core::constants::OTLP_BODY_LIMIT;
use crate::domain::SignalType;
use crate::utils::otlp::{self, ConvertError, Converted};

pub struct OtlpHttpServer {
    listener: TcpListener,
    ingest: Arc<Ingest>,
}

impl OtlpHttpServer {
    pub async fn bind(addr: SocketAddr, ingest: Arc<Ingest>) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind OTLP/HTTP listener on {}", addr))?;
        Ok(Self { listener, ingest })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub async fn start(self, mut shutdown_rx: watch::Receiver<bool>) -> Result<()> {
        let addr = self.local_addr()?;
        let receiver = self.ingest.name().to_string();
        tracing::debug!(%addr, %receiver, "Starting OTLP/HTTP server");

        axum::serve(self.listener, routes(self.ingest))
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.wait_for(|&v| v).await;
                tracing::debug!(%receiver, "OTLP/HTTP server shutting down");
            })
            .await?;
        Ok(())
    }
}

fn routes(ingest: Arc<Ingest>) -> Router {
    Router::new()
        .route("/v1/traces", post(export_traces))
        .route("/v1/metrics", post(export_metrics))
        .route("/v1/logs", post(export_logs))
        .layer(DefaultBodyLimit::max(OTLP_BODY_LIMIT))
        .layer(RequestDecompressionLayer::new())
        .layer(TraceLayer::new_for_http())
        .with_state(ingest)
}

async fn export_traces(
    State(ingest): State<Arc<Ingest>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    export::<_, ExportTraceServiceResponse, _>(
        &ingest,
        SignalType::Traces,
        &headers,
        body,
        otlp::spans_from_request,
    )
}

async fn export_metrics(
    State(ingest): State<Arc<Ingest>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    export::<_, ExportMetricsServiceResponse, _>(
        &ingest,
        SignalType::Metrics,
        &headers,
        body,
        otlp::metrics_from_request,
    )
}

async fn export_logs(
    State(ingest): State<Arc<Ingest>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    export::<_, ExportLogsServiceResponse, _>(
        &ingest,
        SignalType::Logs,
        &headers,
        body,
        otlp::logs_from_request,
    )
}

fn export<Req, Resp, F>(
    ingest: &Ingest,
    signal: SignalType,
    headers: &HeaderMap,
    body: Bytes,
    convert: F,
) -> Response
where
    Req: Message + Default + DeserializeOwned,
    Resp: Message + Serialize + Default,
    F: FnOnce(Req) -> Result<Converted, ConvertError>,
{
    let content_type = OtlpContentType::from_headers(headers);

    let reservation = match ingest.admit(signal, body.len()) {
        Ok(r) => r,
        Err(e) => return e.into_response(),
    };
    let request: Req = match decode_request(&body, content_type) {
        Ok(req) => req,
        Err(e) => return ingest.decode_failed(signal, e.to_string()).into_response(),
    };
    drop(body);

    match ingest.submit(signal, convert(request), reservation) {
        Ok(()) => success_response(&Resp::default(), content_type),
        Err(e) => e.into_response(),
    }
}
