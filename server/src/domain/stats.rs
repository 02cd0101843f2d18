//! Internal counters
//!
//! Lock-free counters for receivers, pipelines and exporters, collected in a
//! [`StatsRegistry`] that renders them in Prometheus text format.

use std::fmt::Write;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use super::admission::AdmissionController;
use super::signal::SignalType;
use crate::core::constants::APP_NAME_LOWER;

fn add(counter: &AtomicU64, n: u64) {
    counter.fetch_add(n, Ordering::Relaxed);
}

fn get(counter: &AtomicU64) -> u64 {
    counter.load(Ordering::Relaxed)
}

/// Counters for one receiver
#[derive(Debug, Default)]
pub struct ReceiverStats {
    accepted_items: AtomicU64,
    refused_submissions: AtomicU64,
    decode_failures: AtomicU64,
    unrouted_submissions: AtomicU64,
    skipped_points: AtomicU64,
}

impl ReceiverStats {
    pub fn record_accepted(&self, items: usize) {
        add(&self.accepted_items, items as u64);
    }

    pub fn record_refused(&self) {
        add(&self.refused_submissions, 1);
    }

    pub fn record_decode_failure(&self) {
        add(&self.decode_failures, 1);
    }

    pub fn record_unrouted(&self) {
        add(&self.unrouted_submissions, 1);
    }

    /// Data points of kinds the model does not carry
    pub fn record_skipped(&self, points: usize) {
        add(&self.skipped_points, points as u64);
    }

    pub fn accepted_items(&self) -> u64 {
        get(&self.accepted_items)
    }

    pub fn refused_submissions(&self) -> u64 {
        get(&self.refused_submissions)
    }

    pub fn decode_failures(&self) -> u64 {
        get(&self.decode_failures)
    }

    pub fn unrouted_submissions(&self) -> u64 {
        get(&self.unrouted_submissions)
    }

    pub fn skipped_points(&self) -> u64 {
        get(&self.skipped_points)
    }
}

/// Counters for one pipeline
#[derive(Debug, Default)]
pub struct PipelineStats {
    items_received: AtomicU64,
    items_filtered: AtomicU64,
    processor_errors: AtomicU64,
    queue_full: AtomicU64,
    batches_sealed: AtomicU64,
    items_sealed: AtomicU64,
}

impl PipelineStats {
    pub fn record_received(&self, items: usize) {
        add(&self.items_received, items as u64);
    }

    pub fn record_filtered(&self, items: u64) {
        add(&self.items_filtered, items);
    }

    pub fn record_processor_errors(&self, errors: u64) {
        add(&self.processor_errors, errors);
    }

    pub fn record_queue_full(&self) {
        add(&self.queue_full, 1);
    }

    pub fn record_sealed(&self, items: usize) {
        add(&self.batches_sealed, 1);
        add(&self.items_sealed, items as u64);
    }

    pub fn items_received(&self) -> u64 {
        get(&self.items_received)
    }

    pub fn items_filtered(&self) -> u64 {
        get(&self.items_filtered)
    }

    pub fn processor_errors(&self) -> u64 {
        get(&self.processor_errors)
    }

    pub fn queue_full(&self) -> u64 {
        get(&self.queue_full)
    }

    pub fn batches_sealed(&self) -> u64 {
        get(&self.batches_sealed)
    }

    pub fn items_sealed(&self) -> u64 {
        get(&self.items_sealed)
    }
}

/// Counters for one exporter instance
#[derive(Debug, Default)]
pub struct ExporterStats {
    batches_sent: AtomicU64,
    items_sent: AtomicU64,
    batches_failed: AtomicU64,
    items_failed: AtomicU64,
    batches_dropped: AtomicU64,
    items_dropped: AtomicU64,
    retries: AtomicU64,
}

impl ExporterStats {
    pub fn record_sent(&self, items: usize) {
        add(&self.batches_sent, 1);
        add(&self.items_sent, items as u64);
    }

    /// Permanent error or exhausted retries
    pub fn record_failed(&self, items: usize) {
        add(&self.batches_failed, 1);
        add(&self.items_failed, items as u64);
    }

    /// Queue overflow or abandoned at shutdown
    pub fn record_dropped(&self, items: usize) {
        add(&self.batches_dropped, 1);
        add(&self.items_dropped, items as u64);
    }

    pub fn record_retry(&self) {
        add(&self.retries, 1);
    }

    pub fn batches_sent(&self) -> u64 {
        get(&self.batches_sent)
    }

    pub fn items_sent(&self) -> u64 {
        get(&self.items_sent)
    }

    pub fn batches_failed(&self) -> u64 {
        get(&self.batches_failed)
    }

    pub fn items_failed(&self) -> u64 {
        get(&self.items_failed)
    }

    pub fn batches_dropped(&self) -> u64 {
        get(&self.batches_dropped)
    }

    pub fn items_dropped(&self) -> u64 {
        get(&self.items_dropped)
    }

    pub fn retries(&self) -> u64 {
        get(&self.retries)
    }
}

/// Registry of every counter set in the process
#[derive(Default)]
pub struct StatsRegistry {
    receivers: Mutex<Vec<(String, Arc<ReceiverStats>)>>,
    pipelines: Mutex<Vec<(SignalType, Arc<PipelineStats>)>>,
    exporters: Mutex<Vec<(SignalType, String, Arc<ExporterStats>)>>,
}

impl StatsRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn receiver(&self, name: &str) -> Arc<ReceiverStats> {
        let stats = Arc::new(ReceiverStats::default());
        self.receivers
            .lock()
            .push((name.to_string(), Arc::clone(&stats)));
        stats
    }

    pub fn pipeline(&self, signal: SignalType) -> Arc<PipelineStats> {
        let stats = Arc::new(PipelineStats::default());
        self.pipelines.lock().push((signal, Arc::clone(&stats)));
        stats
    }

    pub fn exporter(&self, signal: SignalType, name: &str) -> Arc<ExporterStats> {
        let stats = Arc::new(ExporterStats::default());
        self.exporters
            .lock()
            .push((signal, name.to_string(), Arc::clone(&stats)));
        stats
    }

    /// Render all counters in Prometheus text exposition format
    pub fn render(&self, admission: &AdmissionController) -> String {
        let mut out = String::with_capacity(4096);
        let p = APP_NAME_LOWER;

        {
            let receivers = self.receivers.lock();
            let series: [(&str, &str, fn(&ReceiverStats) -> u64); 5] = [
                (
                    "receiver_accepted_items_total",
                    "Items accepted and forwarded to a pipeline",
                    ReceiverStats::accepted_items,
                ),
                (
                    "receiver_refused_submissions_total",
                    "Submissions refused by admission control or a full pipeline queue",
                    ReceiverStats::refused_submissions,
                ),
                (
                    "receiver_decode_failures_total",
                    "Submissions rejected because they could not be decoded",
                    ReceiverStats::decode_failures,
                ),
                (
                    "receiver_unrouted_submissions_total",
                    "Submissions for a signal with no pipeline fed by the receiver",
                    ReceiverStats::unrouted_submissions,
                ),
                (
                    "receiver_skipped_points_total",
                    "Metric points of unsupported kinds",
                    ReceiverStats::skipped_points,
                ),
            ];
            for (name, help, value) in series {
                let _ = writeln!(out, "# HELP {p}_{name} {help}");
                let _ = writeln!(out, "# TYPE {p}_{name} counter");
                for (receiver, stats) in receivers.iter() {
                    let _ = writeln!(
                        out,
                        "{p}_{name}{{receiver=\"{receiver}\"}} {}",
                        value(stats)
                    );
                }
            }
        }

        let _ = writeln!(
            out,
            "# HELP {p}_memory_in_flight_bytes Estimated bytes held by in-flight data"
        );
        let _ = writeln!(out, "# TYPE {p}_memory_in_flight_bytes gauge");
        let _ = writeln!(out, "{p}_memory_in_flight_bytes {}", admission.usage());
        let _ = writeln!(
            out,
            "# HELP {p}_memory_refusing Whether new submissions are currently refused"
        );
        let _ = writeln!(out, "# TYPE {p}_memory_refusing gauge");
        let _ = writeln!(
            out,
            "{p}_memory_refusing {}",
            u8::from(admission.is_refusing())
        );
        let _ = writeln!(
            out,
            "# HELP {p}_memory_refused_total Submissions refused by the memory limiter"
        );
        let _ = writeln!(out, "# TYPE {p}_memory_refused_total counter");
        let _ = writeln!(out, "{p}_memory_refused_total {}", admission.refused_count());

        {
            let pipelines = self.pipelines.lock();
            let series: [(&str, &str, fn(&PipelineStats) -> u64); 6] = [
                (
                    "pipeline_received_items_total",
                    "Items accepted onto the pipeline ingest queue",
                    PipelineStats::items_received,
                ),
                (
                    "pipeline_filtered_items_total",
                    "Items dropped by filter processors",
                    PipelineStats::items_filtered,
                ),
                (
                    "pipeline_processor_errors_total",
                    "Items passed through unmodified after a processor error",
                    PipelineStats::processor_errors,
                ),
                (
                    "pipeline_queue_full_total",
                    "Submissions refused because the ingest queue was full",
                    PipelineStats::queue_full,
                ),
                (
                    "pipeline_sealed_batches_total",
                    "Batches sealed and dispatched to exporters",
                    PipelineStats::batches_sealed,
                ),
                (
                    "pipeline_sealed_items_total",
                    "Items contained in sealed batches",
                    PipelineStats::items_sealed,
                ),
            ];
            for (name, help, value) in series {
                let _ = writeln!(out, "# HELP {p}_{name} {help}");
                let _ = writeln!(out, "# TYPE {p}_{name} counter");
                for (signal, stats) in pipelines.iter() {
                    let _ = writeln!(out, "{p}_{name}{{pipeline=\"{signal}\"}} {}", value(stats));
                }
            }
        }

        {
            let exporters = self.exporters.lock();
            let series: [(&str, &str, fn(&ExporterStats) -> u64); 7] = [
                (
                    "exporter_sent_batches_total",
                    "Batches delivered",
                    ExporterStats::batches_sent,
                ),
                (
                    "exporter_sent_items_total",
                    "Items delivered",
                    ExporterStats::items_sent,
                ),
                (
                    "exporter_failed_batches_total",
                    "Batches dropped after a permanent error or exhausted retries",
                    ExporterStats::batches_failed,
                ),
                (
                    "exporter_failed_items_total",
                    "Items in failed batches",
                    ExporterStats::items_failed,
                ),
                (
                    "exporter_dropped_batches_total",
                    "Batches dropped on a full sending queue or at shutdown",
                    ExporterStats::batches_dropped,
                ),
                (
                    "exporter_dropped_items_total",
                    "Items in dropped batches",
                    ExporterStats::items_dropped,
                ),
                (
                    "exporter_retries_total",
                    "Delivery attempts retried after a transient error",
                    ExporterStats::retries,
                ),
            ];
            for (name, help, value) in series {
                let _ = writeln!(out, "# HELP {p}_{name} {help}");
                let _ = writeln!(out, "# TYPE {p}_{name} counter");
                for (signal, exporter, stats) in exporters.iter() {
                    let _ = writeln!(
                        out,
                        "{p}_{name}{{pipeline=\"{signal}\",exporter=\"{exporter}\"}} {}",
                        value(stats)
                    );
                }
            }
        }

        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exporter_stats_counts() {
        let stats = ExporterStats::default();
        stats.record_sent(10);
        stats.record_sent(5);
        stats.record_failed(3);
        stats.record_dropped(2);
        stats.record_retry();
        assert_eq!(stats.batches_sent(), 2);
        assert_eq!(stats.items_sent(), 15);
        assert_eq!(stats.batches_failed(), 1);
        assert_eq!(stats.items_failed(), 3);
        assert_eq!(stats.batches_dropped(), 1);
        assert_eq!(stats.items_dropped(), 2);
        assert_eq!(stats.retries(), 1);
    }

    #[test]
    fn test_render_includes_labels() {
        let registry = StatsRegistry::new();
        let receiver = registry.receiver("otlp");
        receiver.record_accepted(7);
        receiver.record_decode_failure();
        let pipeline = registry.pipeline(SignalType::Traces);
        pipeline.record_sealed(4);
        let exporter = registry.exporter(SignalType::Traces, "otlp/tempo");
        exporter.record_failed(4);

        let admission = AdmissionController::unlimited();
        let text = registry.render(&admission);

        assert!(text.contains("# TYPE otelflow_receiver_accepted_items_total counter"));
        assert!(text.contains("otelflow_receiver_accepted_items_total{receiver=\"otlp\"} 7"));
        assert!(text.contains("otelflow_receiver_decode_failures_total{receiver=\"otlp\"} 1"));
        assert!(text.contains("otelflow_pipeline_sealed_items_total{pipeline=\"traces\"} 4"));
        assert!(text.contains(
            "otelflow_exporter_failed_batches_total{pipeline=\"traces\",exporter=\"otlp/tempo\"} 1"
        ));
        assert!(text.contains("otelflow_memory_refusing 0"));
    }
}
