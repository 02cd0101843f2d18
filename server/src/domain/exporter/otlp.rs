//! `otlp` exporter: OTLP/gRPC client

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use opentelemetry_proto::tonic::collector::{
    logs::v1::logs_service_client::LogsServiceClient,
    metrics::v1::metrics_service_client::MetricsServiceClient,
    trace::v1::trace_service_client::TraceServiceClient,
};
use tonic::metadata::{AsciiMetadataKey, AsciiMetadataValue};
use tonic::transport::{Certificate, Channel, ClientTlsConfig, Endpoint};
use tonic::{Code, Request, Status};

use crate::core::config::OtlpExporterConfig;
use crate::core::constants::OTLP_BODY_LIMIT;
use crate::domain::signal::{Batch, SignalType};
use crate::utils::otlp;

use super::push::{BatchSender, ExportError};

pub struct OtlpGrpcSender {
    signal: SignalType,
    channel: Channel,
    headers: Vec<(AsciiMetadataKey, AsciiMetadataValue)>,
}

/// Prefix a scheme when missing: https unless the connection is insecure
fn normalize_endpoint(endpoint: &str, insecure: bool) -> String {
    if endpoint.contains("://") {
        endpoint.to_string()
    } else if insecure {
        format!("http://{}", endpoint)
    } else {
        format!("https://{}", endpoint)
    }
}

impl OtlpGrpcSender {
    pub fn new(signal: SignalType, config: &OtlpExporterConfig) -> Result<Self> {
        let timeout = Duration::from_millis(config.timeout_ms);
        let uri = normalize_endpoint(&config.endpoint, config.tls.insecure);

        let mut endpoint = Endpoint::from_shared(uri.clone())
            .with_context(|| format!("Invalid OTLP endpoint '{}'", config.endpoint))?
            .timeout(timeout)
            .connect_timeout(timeout);

        if uri.starts_with("https://") {
            let mut tls = ClientTlsConfig::new().with_webpki_roots();
            if let Some(ca_file) = &config.tls.ca_file {
                let pem = std::fs::read(ca_file)
                    .with_context(|| format!("Failed to read CA file {}", ca_file.display()))?;
                tls = tls.ca_certificate(Certificate::from_pem(pem));
            }
            endpoint = endpoint
                .tls_config(tls)
                .context("Failed to configure TLS for OTLP exporter")?;
        }

        let headers = config
            .headers
            .iter()
            .map(|(k, v)| {
                let key = AsciiMetadataKey::from_bytes(k.to_lowercase().as_bytes())
                    .with_context(|| format!("Invalid header name '{}'", k))?;
                let value: AsciiMetadataValue = v
                    .parse()
                    .with_context(|| format!("Invalid value for header '{}'", k))?;
                Ok((key, value))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            signal,
            // connects on first use and reconnects after failures
            channel: endpoint.connect_lazy(),
            headers,
        })
    }

    fn request<T>(&self, message: T) -> Request<T> {
        let mut request = Request::new(message);
        for (key, value) in &self.headers {
            request.metadata_mut().insert(key.clone(), value.clone());
        }
        request
    }
}

/// gRPC codes a retry can fix
fn classify_status(status: Status) -> ExportError {
    let message = format!("gRPC {:?}: {}", status.code(), status.message());
    match status.code() {
        Code::Cancelled
        | Code::DeadlineExceeded
        | Code::ResourceExhausted
        | Code::Aborted
        | Code::OutOfRange
        | Code::Unavailable
        | Code::DataLoss => ExportError::Transient(message),
        _ => ExportError::Permanent(message),
    }
}

#[async_trait]
impl BatchSender for OtlpGrpcSender {
    async fn send(&self, batch: &Batch) -> Result<(), ExportError> {
        let channel = self.channel.clone();
        // (rejected count, message) from a partial success response
        let partial: Option<(i64, String)> = match self.signal {
            SignalType::Traces => TraceServiceClient::new(channel)
                .max_encoding_message_size(OTLP_BODY_LIMIT)
                .export(self.request(otlp::traces_request(batch.items())))
                .await
                .map_err(classify_status)?
                .into_inner()
                .partial_success
                .map(|p| (p.rejected_spans, p.error_message)),
            SignalType::Metrics => MetricsServiceClient::new(channel)
                .max_encoding_message_size(OTLP_BODY_LIMIT)
                .export(self.request(otlp::metrics_request(batch.items())))
                .await
                .map_err(classify_status)?
                .into_inner()
                .partial_success
                .map(|p| (p.rejected_data_points, p.error_message)),
            SignalType::Logs => LogsServiceClient::new(channel)
                .max_encoding_message_size(OTLP_BODY_LIMIT)
                .export(self.request(otlp::logs_request(batch.items())))
                .await
                .map_err(classify_status)?
                .into_inner()
                .partial_success
                .map(|p| (p.rejected_log_records, p.error_message)),
        };

        if let Some((rejected, message)) = partial
            && rejected > 0
        {
            tracing::warn!(
                signal = %self.signal,
                rejected,
                message = %message,
                "Backend rejected part of the batch"
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use opentelemetry_proto::tonic::collector::trace::v1::{
        ExportTraceServiceRequest, ExportTraceServiceResponse,
        trace_service_server::{TraceService, TraceServiceServer},
    };
    use parking_lot::Mutex;
    use tokio::net::TcpListener;
    use tokio_stream::wrappers::TcpListenerStream;

    use super::*;
    use crate::domain::signal::testing::{resource, span};

    #[derive(Clone, Default)]
    struct Collector {
        requests: Arc<Mutex<Vec<(Option<String>, ExportTraceServiceRequest)>>>,
    }

    #[tonic::async_trait]
    impl TraceService for Collector {
        async fn export(
            &self,
            request: Request<ExportTraceServiceRequest>,
        ) -> Result<tonic::Response<ExportTraceServiceResponse>, Status> {
            let tenant = request
                .metadata()
                .get("x-tenant")
                .and_then(|v| v.to_str().ok())
                .map(String::from);
            self.requests.lock().push((tenant, request.into_inner()));
            Ok(tonic::Response::new(ExportTraceServiceResponse {
                partial_success: None,
            }))
        }
    }

    fn config(endpoint: String) -> OtlpExporterConfig {
        serde_json::from_value(serde_json::json!({
            "endpoint": endpoint,
            "tls": { "insecure": true },
            "headers": { "X-Tenant": "acme" }
        }))
        .unwrap()
    }

    #[test]
    fn test_normalize_endpoint() {
        assert_eq!(normalize_endpoint("tempo:4317", true), "http://tempo:4317");
        assert_eq!(normalize_endpoint("tempo:4317", false), "https://tempo:4317");
        assert_eq!(
            normalize_endpoint("http://tempo:4317", false),
            "http://tempo:4317"
        );
    }

    #[test]
    fn test_status_classification() {
        assert!(classify_status(Status::unavailable("down")).is_transient());
        assert!(classify_status(Status::resource_exhausted("full")).is_transient());
        assert!(classify_status(Status::deadline_exceeded("slow")).is_transient());
        assert!(!classify_status(Status::invalid_argument("bad")).is_transient());
        assert!(!classify_status(Status::unauthenticated("who")).is_transient());
    }

    #[tokio::test]
    async fn test_exports_spans_to_collector() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let collector = Collector::default();
        let server = tokio::spawn(
            tonic::transport::Server::builder()
                .add_service(TraceServiceServer::new(collector.clone()))
                .serve_with_incoming(TcpListenerStream::new(listener)),
        );

        let sender = OtlpGrpcSender::new(SignalType::Traces, &config(addr.to_string())).unwrap();
        let r = resource(&[("service.name", "checkout")]);
        let batch = Batch::seal(
            SignalType::Traces,
            0,
            vec![span(&r, "GET /cart"), span(&r, "SELECT cart")],
            0,
        );
        sender.send(&batch).await.unwrap();

        let requests = collector.requests.lock();
        assert_eq!(requests.len(), 1);
        let (tenant, request) = &requests[0];
        assert_eq!(tenant.as_deref(), Some("acme"));
        assert_eq!(request.resource_spans.len(), 1);
        assert_eq!(request.resource_spans[0].scope_spans[0].spans.len(), 2);
        server.abort();
    }

    #[tokio::test]
    async fn test_unreachable_collector_is_transient() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let sender = OtlpGrpcSender::new(SignalType::Logs, &config(addr.to_string())).unwrap();
        let batch = Batch::seal(SignalType::Logs, 0, Vec::new(), 0);
        let err = sender.send(&batch).await.unwrap_err();
        assert!(err.is_transient(), "{}", err);
    }
}
