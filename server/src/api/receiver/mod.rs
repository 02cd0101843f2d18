//! OTLP receiver: gRPC and HTTP listeners feeding the pipelines

mod encoding;
mod grpc;
mod http;

pub use grpc::OtlpGrpcServer;
pub use http::OtlpHttpServer;

use std::sync::Arc;

use axum::http::{HeaderName, StatusCode, header};
use axum::response::{IntoResponse, Response};
use thiserror::Error;
use tonic::Status;

use crate::core::constants::BACKPRESSURE_RETRY_AFTER_SECS;
use crate::domain::admission::MemoryLimitExceeded;
use crate::domain::pipeline::{Routes, SubmitError};
use crate::domain::stats::ReceiverStats;
use crate::domain::{AdmissionController, Reservation, SignalType};
use crate::utils::otlp::{ConvertError, Converted};

/// Why a submission was not accepted
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("receiver '{receiver}' does not feed a {signal} pipeline")]
    NotRouted { receiver: String, signal: SignalType },
    #[error(transparent)]
    Refused(#[from] MemoryLimitExceeded),
    #[error("{0} pipeline is busy")]
    QueueFull(SignalType),
    #[error("invalid {signal} request: {message}")]
    Decode { signal: SignalType, message: String },
    #[error("{0} pipeline is shutting down")]
    Closed(SignalType),
}

impl IngestError {
    /// HTTP response for the OTLP/HTTP listener
    pub fn into_response(self) -> Response {
        match self {
            IngestError::NotRouted { .. } => (
                StatusCode::NOT_FOUND,
                [(header::CONTENT_TYPE, "text/plain")],
                self.to_string(),
            )
                .into_response(),
            IngestError::Refused(_) | IngestError::QueueFull(_) | IngestError::Closed(_) => (
                StatusCode::SERVICE_UNAVAILABLE,
                [(
                    HeaderName::from_static("retry-after"),
                    BACKPRESSURE_RETRY_AFTER_SECS.to_string(),
                )],
            )
                .into_response(),
            IngestError::Decode { .. } => (
                StatusCode::BAD_REQUEST,
                [(header::CONTENT_TYPE, "text/plain")],
                self.to_string(),
            )
                .into_response(),
        }
    }
}

impl From<IngestError> for Status {
    fn from(err: IngestError) -> Self {
        match &err {
            IngestError::NotRouted { .. } => Status::unimplemented(err.to_string()),
            IngestError::Refused(_) | IngestError::QueueFull(_) => {
                Status::resource_exhausted(err.to_string())
            }
            IngestError::Closed(_) => Status::unavailable(err.to_string()),
            IngestError::Decode { .. } => Status::invalid_argument(err.to_string()),
        }
    }
}

/// Shared ingest path of both transports of one receiver
pub struct Ingest {
    name: String,
    routes: Routes,
    admission: Arc<AdmissionController>,
    stats: Arc<ReceiverStats>,
}

impl Ingest {
    pub fn new(
        name: String,
        routes: Routes,
        admission: Arc<AdmissionController>,
        stats: Arc<ReceiverStats>,
    ) -> Self {
        Self {
            name,
            routes,
            admission,
            stats,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Gate a submission before decoding: it must be routed and admitted.
    ///
    /// The returned reservation covers the encoded request while it is decoded.
    pub fn admit(&self, signal: SignalType, encoded_bytes: usize) -> Result<Reservation, IngestError> {
        if !self.routes.contains_key(&signal) {
            self.stats.record_unrouted();
            return Err(IngestError::NotRouted {
                receiver: self.name.clone(),
                signal,
            });
        }
        if let Err(e) = self.admission.admit() {
            self.stats.record_refused();
            tracing::debug!(receiver = %self.name, %signal, error = %e, "Submission refused");
            return Err(e.into());
        }
        Ok(self.admission.reserve(encoded_bytes))
    }

    /// Count a submission that could not be decoded or converted
    pub fn decode_failed(&self, signal: SignalType, message: impl Into<String>) -> IngestError {
        let message = message.into();
        self.stats.record_decode_failure();
        tracing::warn!(receiver = %self.name, %signal, error = %message, "Failed to decode OTLP request");
        IngestError::Decode { signal, message }
    }

    /// Hand converted items to the signal's pipeline.
    ///
    /// The decode reservation is exchanged for one sized to the items.
    pub fn submit(
        &self,
        signal: SignalType,
        converted: Result<Converted, ConvertError>,
        decode_reservation: Reservation,
    ) -> Result<(), IngestError> {
        let converted = converted.map_err(|e| self.decode_failed(signal, e.to_string()))?;
        if converted.skipped > 0 {
            self.stats.record_skipped(converted.skipped);
            tracing::debug!(
                receiver = %self.name,
                points = converted.skipped,
                "Skipped metric points of unsupported kinds"
            );
        }
        if converted.items.is_empty() {
            return Ok(());
        }

        let handle = self.routes.get(&signal).ok_or_else(|| IngestError::NotRouted {
            receiver: self.name.clone(),
            signal,
        })?;
        let count = converted.items.len();
        let bytes = converted.items.iter().map(|item| item.size_bytes()).sum();
        let reservation = self.admission.reserve(bytes);
        drop(decode_reservation);

        match handle.submit(converted.items, reservation) {
            Ok(()) => {
                self.stats.record_accepted(count);
                Ok(())
            }
            Err(SubmitError::QueueFull(signal)) => {
                self.stats.record_refused();
                Err(IngestError::QueueFull(signal))
            }
            Err(SubmitError::Closed(signal)) => Err(IngestError::Closed(signal)),
        }
    }
}
