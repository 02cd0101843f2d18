//! otelflow: telemetry collection pipeline for metrics, traces and logs

pub mod api;
pub mod app;
pub mod core;
pub mod domain;
pub mod utils;
