//! Network surfaces: OTLP receivers, health check and internal telemetry

pub mod health;
pub mod receiver;
pub mod telemetry;

pub use health::{HealthServer, HealthState};
pub use receiver::{Ingest, OtlpGrpcServer, OtlpHttpServer};
pub use telemetry::TelemetryServer;
