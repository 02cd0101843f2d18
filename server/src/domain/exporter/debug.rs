//! `debug` exporter: writes batches to the log

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::core::config::Verbosity;
use crate::domain::signal::{Batch, SignalItem};
use crate::domain::stats::ExporterStats;

use super::Exporter;

pub struct DebugExporter {
    name: String,
    verbosity: Verbosity,
    stats: Arc<ExporterStats>,
}

impl DebugExporter {
    pub fn new(name: String, verbosity: Verbosity, stats: Arc<ExporterStats>) -> Self {
        Self {
            name,
            verbosity,
            stats,
        }
    }
}

fn log_item(exporter: &str, item: &SignalItem) {
    match item {
        SignalItem::Metric(m) => tracing::info!(
            exporter,
            metric = %m.name,
            value = ?m.value,
            attributes = ?m.attributes,
            "Metric point"
        ),
        SignalItem::Span(s) => tracing::info!(
            exporter,
            trace_id = %s.trace_id,
            span_id = %s.span_id,
            span = %s.name,
            duration_ns = s.end_time_unix_nano.saturating_sub(s.start_time_unix_nano),
            "Span"
        ),
        SignalItem::Log(l) => tracing::info!(
            exporter,
            severity = l.severity_number,
            body = %l.body,
            "Log record"
        ),
    }
}

#[async_trait]
impl Exporter for DebugExporter {
    fn name(&self) -> &str {
        &self.name
    }

    fn consume(&self, batch: Arc<Batch>) {
        tracing::info!(
            exporter = %self.name,
            signal = %batch.signal(),
            sequence = batch.sequence(),
            items = batch.len(),
            "Batch received"
        );
        if self.verbosity == Verbosity::Detailed {
            for item in batch.items() {
                log_item(&self.name, item);
            }
        }
        self.stats.record_sent(batch.len());
    }

    async fn shutdown(&self, _grace: Duration) {}
}
