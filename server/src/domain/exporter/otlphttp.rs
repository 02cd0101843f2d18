//! `otlphttp` exporter: OTLP/HTTP protobuf client

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use prost::Message;
use reqwest::header::{CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue};

use crate::core::config::{OtlpExporterConfig, TlsConfig};
use crate::domain::signal::{Batch, SignalType};
use crate::utils::otlp;

use super::push::{BatchSender, ExportError};

const PROTOBUF_CONTENT_TYPE: &str = "application/x-protobuf";

pub struct OtlpHttpSender {
    client: reqwest::Client,
    url: String,
}

/// Parse configured headers into a reqwest header map
pub(super) fn header_map(headers: &std::collections::BTreeMap<String, String>) -> Result<HeaderMap> {
    let mut map = HeaderMap::with_capacity(headers.len());
    for (k, v) in headers {
        let name = HeaderName::from_bytes(k.as_bytes())
            .with_context(|| format!("Invalid header name '{}'", k))?;
        let value =
            HeaderValue::from_str(v).with_context(|| format!("Invalid value for header '{}'", k))?;
        map.insert(name, value);
    }
    Ok(map)
}

/// HTTP client with the exporter's timeout, headers and extra CA
pub(super) fn http_client(
    timeout: Duration,
    headers: HeaderMap,
    tls: Option<&TlsConfig>,
) -> Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder()
        .timeout(timeout)
        .connect_timeout(timeout)
        .default_headers(headers);
    if let Some(ca_file) = tls.and_then(|t| t.ca_file.as_ref()) {
        let pem = std::fs::read(ca_file)
            .with_context(|| format!("Failed to read CA file {}", ca_file.display()))?;
        let cert = reqwest::Certificate::from_pem(&pem)
            .with_context(|| format!("Invalid CA certificate {}", ca_file.display()))?;
        builder = builder.add_root_certificate(cert);
    }
    builder.build().context("Failed to build HTTP client")
}

impl OtlpHttpSender {
    pub fn new(signal: SignalType, config: &OtlpExporterConfig) -> Result<Self> {
        let client = http_client(
            Duration::from_millis(config.timeout_ms),
            header_map(&config.headers)?,
            Some(&config.tls),
        )?;
        Ok(Self {
            client,
            url: format!("{}/v1/{}", config.endpoint.trim_end_matches('/'), signal),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl BatchSender for OtlpHttpSender {
    async fn send(&self, batch: &Batch) -> Result<(), ExportError> {
        let body = match batch.signal() {
            SignalType::Traces => otlp::traces_request(batch.items()).encode_to_vec(),
            SignalType::Metrics => otlp::metrics_request(batch.items()).encode_to_vec(),
            SignalType::Logs => otlp::logs_request(batch.items()).encode_to_vec(),
        };

        let response = self
            .client
            .post(&self.url)
            .header(CONTENT_TYPE, PROTOBUF_CONTENT_TYPE)
            .body(body)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let text = response.text().await.unwrap_or_default();
        Err(ExportError::from_http_status(status, &text))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use axum::Router;
    use axum::body::Bytes;
    use axum::extract::State;
    use axum::http::{HeaderMap as AxumHeaders, StatusCode};
    use axum::routing::post;
    use opentelemetry_proto::tonic::collector::metrics::v1::ExportMetricsServiceRequest;
    use parking_lot::Mutex;
    use tokio::net::TcpListener;

    use super::*;
    use crate::domain::signal::testing::{gauge, resource};

    #[derive(Clone, Default)]
    struct Backend {
        calls: Arc<AtomicUsize>,
        unavailable_first: usize,
        bodies: Arc<Mutex<Vec<(Option<String>, Bytes)>>>,
    }

    async fn receive(State(backend): State<Backend>, headers: AxumHeaders, body: Bytes) -> StatusCode {
        let n = backend.calls.fetch_add(1, Ordering::SeqCst);
        if n < backend.unavailable_first {
            return StatusCode::SERVICE_UNAVAILABLE;
        }
        let auth = headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .map(String::from);
        backend.bodies.lock().push((auth, body));
        StatusCode::OK
    }

    async fn serve(backend: Backend) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = Router::new()
            .route("/v1/metrics", post(receive))
            .route("/bad/v1/metrics", post(|| async { StatusCode::BAD_REQUEST }))
            .with_state(backend);
        tokio::spawn(async move { axum::serve(listener, app).await });
        format!("http://{}", addr)
    }

    fn config(endpoint: String) -> OtlpExporterConfig {
        serde_json::from_value(serde_json::json!({
            "endpoint": endpoint,
            "headers": { "Authorization": "Bearer token" }
        }))
        .unwrap()
    }

    fn metrics_batch() -> Batch {
        let r = resource(&[("service.name", "api")]);
        Batch::seal(
            SignalType::Metrics,
            0,
            vec![gauge(&r, "active_requests_current", 3.0)],
            0,
        )
    }

    #[test]
    fn test_url_per_signal() {
        let sender =
            OtlpHttpSender::new(SignalType::Logs, &config("http://collector:4318/".into())).unwrap();
        assert_eq!(sender.url(), "http://collector:4318/v1/logs");
    }

    #[tokio::test]
    async fn test_posts_protobuf_request() {
        let backend = Backend::default();
        let endpoint = serve(backend.clone()).await;
        let sender = OtlpHttpSender::new(SignalType::Metrics, &config(endpoint)).unwrap();

        sender.send(&metrics_batch()).await.unwrap();

        let bodies = backend.bodies.lock();
        assert_eq!(bodies.len(), 1);
        assert_eq!(bodies[0].0.as_deref(), Some("Bearer token"));
        let request = ExportMetricsServiceRequest::decode(bodies[0].1.as_ref()).unwrap();
        let metric = &request.resource_metrics[0].scope_metrics[0].metrics[0];
        assert_eq!(metric.name, "active_requests_current");
    }

    #[tokio::test]
    async fn test_status_classification() {
        let backend = Backend {
            unavailable_first: 1,
            ..Default::default()
        };
        let endpoint = serve(backend.clone()).await;

        let sender = OtlpHttpSender::new(SignalType::Metrics, &config(endpoint.clone())).unwrap();
        let err = sender.send(&metrics_batch()).await.unwrap_err();
        assert!(err.is_transient());
        sender.send(&metrics_batch()).await.unwrap();

        let bad = OtlpHttpSender::new(SignalType::Metrics, &config(format!("{}/bad", endpoint)))
            .unwrap();
        let err = bad.send(&metrics_batch()).await.unwrap_err();
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn test_connection_refused_is_transient() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let sender =
            OtlpHttpSender::new(SignalType::Metrics, &config(format!("http://{}", addr))).unwrap();
        assert!(sender.send(&metrics_batch()).await.unwrap_err().is_transient());
    }
}
