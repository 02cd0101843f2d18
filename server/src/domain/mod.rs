//! Telemetry pipeline domain
//!
//! - `signal` - signal model shared by every stage
//! - `admission` - process-wide memory admission control
//! - `processor` - ordered transformation stages
//! - `batcher` - size/timeout batching
//! - `exporter` - pull and push exporters
//! - `pipeline` - per-signal pipelines and their router
//! - `stats` - internal counters

pub mod admission;
pub mod batcher;
pub mod exporter;
pub mod pipeline;
pub mod processor;
pub mod signal;
pub mod stats;

pub use admission::{AdmissionController, Reservation};
pub use pipeline::{PipelineHandle, PipelineRouter};
pub use signal::{Batch, SignalItem, SignalType};
pub use stats::StatsRegistry;
