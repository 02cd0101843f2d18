//! OTLP/HTTP payload encodings
//!
//! Protobuf (`application/x-protobuf`) and JSON (`application/json`) bodies;
//! responses are written in the encoding of the request.

use axum::body::Bytes;
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use prost::Message;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OtlpContentType {
    Protobuf,
    Json,
}

impl OtlpContentType {
    /// Missing or unrecognized content types are treated as protobuf
    #[inline]
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let content_type = headers
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");

        if content_type.starts_with("application/json") {
            OtlpContentType::Json
        } else {
            OtlpContentType::Protobuf
        }
    }

    #[inline]
    pub fn as_header_value(self) -> &'static str {
        match self {
            OtlpContentType::Protobuf => "application/x-protobuf",
            OtlpContentType::Json => "application/json",
        }
    }
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("protobuf decode error: {0}")]
    Protobuf(String),
    #[error("JSON decode error: {0}")]
    Json(String),
}

#[inline]
pub fn decode_request<T>(body: &Bytes, content_type: OtlpContentType) -> Result<T, DecodeError>
where
    T: Message + Default + for<'de> Deserialize<'de>,
{
    match content_type {
        OtlpContentType::Protobuf => {
            T::decode(body.as_ref()).map_err(|e| DecodeError::Protobuf(e.to_string()))
        }
        OtlpContentType::Json => {
            serde_json::from_slice(body.as_ref()).map_err(|e| DecodeError::Json(e.to_string()))
        }
    }
}

fn encode_response<T>(response: &T, content_type: OtlpContentType) -> Result<Vec<u8>, String>
where
    T: Message + Serialize,
{
    match content_type {
        OtlpContentType::Protobuf => Ok(response.encode_to_vec()),
        OtlpContentType::Json => serde_json::to_vec(response).map_err(|e| e.to_string()),
    }
}

/// Export response in the request's encoding
pub fn success_response<T>(response: &T, content_type: OtlpContentType) -> Response
where
    T: Message + Serialize,
{
    match encode_response(response, content_type) {
        Ok(bytes) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, content_type.as_header_value())],
            bytes,
        )
            .into_response(),
        Err(e) => {
            tracing::error!(error = %e, "Failed to encode OTLP response");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                [(header::CONTENT_TYPE, "text/plain")],
                "Internal server error",
            )
                .into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use opentelemetry_proto::tonic::collector::logs::v1::ExportLogsServiceRequest;
    use opentelemetry_proto::tonic::collector::metrics::v1::ExportMetricsServiceResponse;
    use opentelemetry_proto::tonic::collector::trace::v1::ExportTraceServiceRequest;

    use super::*;
    use crate::utils::otlp::fixtures;

    fn headers(content_type: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_TYPE, content_type.parse().unwrap());
        headers
    }

    #[test]
    fn test_content_type_detection() {
        assert_eq!(
            OtlpContentType::from_headers(&headers("application/x-protobuf")),
            OtlpContentType::Protobuf
        );
        assert_eq!(
            OtlpContentType::from_headers(&headers("application/json; charset=utf-8")),
            OtlpContentType::Json
        );
        assert_eq!(
            OtlpContentType::from_headers(&headers("text/plain")),
            OtlpContentType::Protobuf
        );
        assert_eq!(
            OtlpContentType::from_headers(&HeaderMap::new()),
            OtlpContentType::Protobuf
        );
    }

    #[test]
    fn test_decode_protobuf_request() {
        let request = fixtures::trace_request(&["GET /users/{id}"]);
        let bytes = Bytes::from(request.encode_to_vec());

        let decoded: ExportTraceServiceRequest =
            decode_request(&bytes, OtlpContentType::Protobuf).unwrap();
        assert_eq!(decoded, request);
    }

    #[test]
    fn test_decode_json_request_with_hex_ids() {
        let json = r#"{
            "resourceSpans": [{
                "resource": {
                    "attributes": [{
                        "key": "service.name",
                        "value": {"stringValue": "checkout"}
                    }]
                },
                "scopeSpans": [{
                    "spans": [{
                        "traceId": "0102030405060708090a0b0c0d0e0f10",
                        "spanId": "0102030405060708",
                        "name": "POST /orders"
                    }]
                }]
            }]
        }"#;

        let decoded: ExportTraceServiceRequest =
            decode_request(&Bytes::from(json), OtlpContentType::Json).unwrap();
        let span = &decoded.resource_spans[0].scope_spans[0].spans[0];
        assert_eq!(span.name, "POST /orders");
        assert_eq!(span.trace_id, (1..=16).collect::<Vec<u8>>());
    }

    #[test]
    fn test_decode_errors() {
        let result: Result<ExportTraceServiceRequest, _> =
            decode_request(&Bytes::from("not valid protobuf"), OtlpContentType::Protobuf);
        assert!(matches!(result, Err(DecodeError::Protobuf(_))));

        let result: Result<ExportLogsServiceRequest, _> =
            decode_request(&Bytes::from("not valid json"), OtlpContentType::Json);
        assert!(matches!(result, Err(DecodeError::Json(_))));
    }

    #[test]
    fn test_empty_protobuf_body_is_empty_request() {
        let decoded: ExportTraceServiceRequest =
            decode_request(&Bytes::new(), OtlpContentType::Protobuf).unwrap();
        assert!(decoded.resource_spans.is_empty());
    }

    #[test]
    fn test_success_response_matches_request_encoding() {
        let response = ExportMetricsServiceResponse {
            partial_success: None,
        };

        let json = success_response(&response, OtlpContentType::Json);
        assert_eq!(json.status(), StatusCode::OK);
        assert_eq!(json.headers()[header::CONTENT_TYPE], "application/json");

        let proto = success_response(&response, OtlpContentType::Protobuf);
        assert_eq!(
            proto.headers()[header::CONTENT_TYPE],
            "application/x-protobuf"
        );
    }
}
