//! OTLP/gRPC listener
//!
//! The three collector services are served with a pass-through codec so the
//! protobuf payload is decoded by `Ingest`, the same way the HTTP listener
//! does it. Malformed payloads are then counted and answered with
//! `INVALID_ARGUMENT` instead of failing inside the codec.

use std::convert::Infallible;
use std::marker::PhantomData;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use opentelemetry_proto::tonic::collector::{
    logs::v1::{ExportLogsServiceRequest, ExportLogsServiceResponse},
    metrics::v1::{ExportMetricsServiceRequest, ExportMetricsServiceResponse},
    trace::v1::{ExportTraceServiceRequest, ExportTraceServiceResponse},
};
use prost::Message;
use prost::bytes::Buf;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::body::BoxBody;
use tonic::codec::{Codec, DecodeBuf, Decoder, EncodeBuf, Encoder};
use tonic::codegen::{Body, BoxFuture, Bytes, Context as TaskContext, Poll, Service, StdError, http};
use tonic::server::{Grpc, NamedService, UnaryService};
use tonic::transport::Server as TonicServer;
use tonic::{Request, Response, Status};

use super::{Ingest, IngestError};
use crate::core::constants::OTLP_BODY_LIMIT;
use crate::domain::SignalType;
use crate::utils::otlp::{self, ConvertError, Converted};

pub struct OtlpGrpcServer {
    listener: TcpListener,
    ingest: Arc<Ingest>,
}

impl OtlpGrpcServer {
    pub async fn bind(addr: SocketAddr, ingest: Arc<Ingest>) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind OTLP/gRPC listener on {}", addr))?;
        Ok(Self { listener, ingest })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub async fn start(self, mut shutdown_rx: watch::Receiver<bool>) -> Result<()> {
        let addr = self.local_addr()?;
        let receiver = self.ingest.name().to_string();
        tracing::debug!(%addr, %receiver, "Starting OTLP gRPC server");

        TonicServer::builder()
            .add_service(ExportServer::<TraceExport>::new(Arc::clone(&self.ingest)))
            .add_service(ExportServer::<MetricsExport>::new(Arc::clone(&self.ingest)))
            .add_service(ExportServer::<LogsExport>::new(self.ingest))
            .serve_with_incoming_shutdown(TcpListenerStream::new(self.listener), async move {
                let _ = shutdown_rx.wait_for(|&v| v).await;
                tracing::debug!(%receiver, "OTLP gRPC server shutting down");
            })
            .await?;

        Ok(())
    }
}

/// One OTLP collector service: its gRPC name, message types and conversion
trait OtlpExport: Send + Sync + 'static {
    const SERVICE: &'static str;
    const SIGNAL: SignalType;
    type Request: Message + Default + 'static;
    type Response: Message + Default + 'static;

    fn convert(request: Self::Request) -> Result<Converted, ConvertError>;
}

struct TraceExport;

impl OtlpExport for TraceExport {
    const SERVICE: &'static str = "opentelemetry.proto.collector.trace.v1.TraceService";
    const SIGNAL: SignalType = SignalType::Traces;
    type Request = ExportTraceServiceRequest;
    type Response = ExportTraceServiceResponse;

    fn convert(request: Self::Request) -> Result<Converted, ConvertError> {
        otlp::spans_from_request(request)
    }
}

struct MetricsExport;

impl OtlpExport for MetricsExport {
    const SERVICE: &'static str = "opentelemetry.proto.collector.metrics.v1.MetricsService";
    const SIGNAL: SignalType = SignalType::Metrics;
    type Request = ExportMetricsServiceRequest;
    type Response = ExportMetricsServiceResponse;

    fn convert(request: Self::Request) -> Result<Converted, ConvertError> {
        otlp::metrics_from_request(request)
    }
}

struct LogsExport;

impl OtlpExport for LogsExport {
    const SERVICE: &'static str = "opentelemetry.proto.collector.logs.v1.LogsService";
    const SIGNAL: SignalType = SignalType::Logs;
    type Request = ExportLogsServiceRequest;
    type Response = ExportLogsServiceResponse;

    fn convert(request: Self::Request) -> Result<Converted, ConvertError> {
        otlp::logs_from_request(request)
    }
}

/// Admit, decode and submit one raw export payload
fn ingest_payload<K: OtlpExport>(ingest: &Ingest, payload: Bytes) -> Result<(), IngestError> {
    let reservation = ingest.admit(K::SIGNAL, payload.len())?;
    let request = <K::Request as Message>::decode(payload)
        .map_err(|e| ingest.decode_failed(K::SIGNAL, e.to_string()))?;
    ingest.submit(K::SIGNAL, K::convert(request), reservation)
}

struct ExportServer<K> {
    ingest: Arc<Ingest>,
    kind: PhantomData<fn() -> K>,
}

impl<K> ExportServer<K> {
    fn new(ingest: Arc<Ingest>) -> Self {
        Self {
            ingest,
            kind: PhantomData,
        }
    }
}

impl<K> Clone for ExportServer<K> {
    fn clone(&self) -> Self {
        Self::new(Arc::clone(&self.ingest))
    }
}

impl<K: OtlpExport> NamedService for ExportServer<K> {
    const NAME: &'static str = K::SERVICE;
}

impl<K, B> Service<http::Request<B>> for ExportServer<K>
where
    K: OtlpExport,
    B: Body + Send + 'static,
    B::Error: Into<StdError> + Send + 'static,
{
    type Response = http::Response<BoxBody>;
    type Error = Infallible;
    type Future = BoxFuture<Self::Response, Self::Error>;

    fn poll_ready(&mut self, _cx: &mut TaskContext<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: http::Request<B>) -> Self::Future {
        if req.uri().path() != format!("/{}/Export", K::SERVICE) {
            return Box::pin(async move { Ok(Status::unimplemented("").into_http()) });
        }
        let method = ExportMethod::<K> {
            ingest: Arc::clone(&self.ingest),
            kind: PhantomData,
        };
        Box::pin(async move {
            let mut grpc = Grpc::new(PassThroughCodec::<K::Response>::default())
                .apply_max_message_size_config(Some(OTLP_BODY_LIMIT), Some(OTLP_BODY_LIMIT));
            Ok(grpc.unary(method, req).await)
        })
    }
}

struct ExportMethod<K> {
    ingest: Arc<Ingest>,
    kind: PhantomData<fn() -> K>,
}

impl<K: OtlpExport> UnaryService<Bytes> for ExportMethod<K> {
    type Response = K::Response;
    type Future = BoxFuture<Response<K::Response>, Status>;

    fn call(&mut self, request: Request<Bytes>) -> Self::Future {
        let ingest = Arc::clone(&self.ingest);
        Box::pin(async move {
            ingest_payload::<K>(&ingest, request.into_inner())?;
            Ok(Response::new(K::Response::default()))
        })
    }
}

/// Hands the request payload over undecoded; encodes the protobuf response
struct PassThroughCodec<Resp>(PhantomData<fn() -> Resp>);

impl<Resp> Default for PassThroughCodec<Resp> {
    fn default() -> Self {
        Self(PhantomData)
    }
}

impl<Resp: Message + Send + 'static> Codec for PassThroughCodec<Resp> {
    type Encode = Resp;
    type Decode = Bytes;
    type Encoder = ResponseEncoder<Resp>;
    type Decoder = PayloadDecoder;

    fn encoder(&mut self) -> Self::Encoder {
        ResponseEncoder(PhantomData)
    }

    fn decoder(&mut self) -> Self::Decoder {
        PayloadDecoder
    }
}

struct ResponseEncoder<Resp>(PhantomData<fn() -> Resp>);

impl<Resp: Message> Encoder for ResponseEncoder<Resp> {
    type Item = Resp;
    type Error = Status;

    fn encode(&mut self, item: Resp, dst: &mut EncodeBuf<'_>) -> Result<(), Status> {
        item.encode(dst)
            .map_err(|e| Status::internal(format!("failed to encode response: {}", e)))
    }
}

struct PayloadDecoder;

impl Decoder for PayloadDecoder {
    type Item = Bytes;
    type Error = Status;

    fn decode(&mut self, src: &mut DecodeBuf<'_>) -> Result<Option<Bytes>, Status> {
        let len = src.remaining();
        Ok(Some(src.copy_to_bytes(len)))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use opentelemetry_proto::tonic::collector::logs::v1::logs_service_client::LogsServiceClient;
    use opentelemetry_proto::tonic::collector::metrics::v1::metrics_service_client::MetricsServiceClient;

    use super::super::testing::{IngestFixture, ingest_fixture};
    use super::*;
    use crate::domain::AdmissionController;
    use crate::domain::admission::MemoryLimits;
    use crate::utils::otlp::fixtures;

    async fn serve(fixture: &IngestFixture) -> String {
        let server = OtlpGrpcServer::bind("127.0.0.1:0".parse().unwrap(), fixture.ingest.clone())
            .await
            .unwrap();
        let addr = server.local_addr().unwrap();
        tokio::spawn(server.start(fixture.shutdown.subscribe()));
        format!("http://{}", addr)
    }

    #[tokio::test]
    async fn test_metrics_export_reaches_pipeline() {
        let fixture = ingest_fixture(&[SignalType::Metrics], AdmissionController::unlimited());
        let endpoint = serve(&fixture).await;

        let mut client = MetricsServiceClient::connect(endpoint).await.unwrap();
        let response = client
            .export(fixtures::metrics_request_fixture())
            .await
            .unwrap()
            .into_inner();
        assert!(response.partial_success.is_none());

        for _ in 0..100 {
            if fixture.items(SignalType::Metrics) > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(fixture.items(SignalType::Metrics) > 0);
        assert!(fixture.stats.accepted_items() > 0);
    }

    #[tokio::test]
    async fn test_unrouted_signal_is_unimplemented() {
        let fixture = ingest_fixture(&[SignalType::Metrics], AdmissionController::unlimited());
        let endpoint = serve(&fixture).await;

        let mut client = LogsServiceClient::connect(endpoint).await.unwrap();
        let status = client
            .export(fixtures::logs_request_fixture(&[(9, "hello")]))
            .await
            .unwrap_err();
        assert_eq!(status.code(), tonic::Code::Unimplemented);
        assert_eq!(fixture.items(SignalType::Logs), 0);
    }

    /// Message whose field 1 is a varint where a span list is expected
    #[derive(Clone, PartialEq, prost::Message)]
    struct WrongWireType {
        #[prost(uint64, tag = "1")]
        resource_spans: u64,
    }

    #[tokio::test]
    async fn test_malformed_payload_is_invalid_argument() {
        let fixture = ingest_fixture(&[SignalType::Traces], AdmissionController::unlimited());
        let endpoint = serve(&fixture).await;

        let channel = tonic::transport::Channel::from_shared(endpoint)
            .unwrap()
            .connect()
            .await
            .unwrap();
        let mut grpc = tonic::client::Grpc::new(channel);
        grpc.ready().await.unwrap();
        let status = grpc
            .unary::<_, ExportTraceServiceResponse, _>(
                Request::new(WrongWireType { resource_spans: 7 }),
                http::uri::PathAndQuery::from_static(
                    "/opentelemetry.proto.collector.trace.v1.TraceService/Export",
                ),
                tonic::codec::ProstCodec::default(),
            )
            .await
            .unwrap_err();

        assert_eq!(status.code(), tonic::Code::InvalidArgument);
        assert_eq!(fixture.stats.decode_failures(), 1);
        assert_eq!(fixture.items(SignalType::Traces), 0);
    }

    #[tokio::test]
    async fn test_refusal_is_resource_exhausted() {
        let admission = AdmissionController::new(Some(MemoryLimits {
            hard_bytes: 10,
            soft_bytes: 5,
            check_interval: Duration::from_millis(10),
        }));
        let _held = admission.reserve(100);
        admission.check();

        let fixture = ingest_fixture(&[SignalType::Logs], admission);
        let endpoint = serve(&fixture).await;

        let mut client = LogsServiceClient::connect(endpoint).await.unwrap();
        let status = client
            .export(fixtures::logs_request_fixture(&[(9, "hello")]))
            .await
            .unwrap_err();
        assert_eq!(status.code(), tonic::Code::ResourceExhausted);
        assert_eq!(fixture.stats.refused_submissions(), 1);
    }
}
