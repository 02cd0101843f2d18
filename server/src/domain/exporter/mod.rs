//! Exporter set
//!
//! Every exporter consumes sealed batches through the same [`Exporter`]
//! interface. Pull exporters (`prometheus`) fold batches into state served to
//! scrapers; push exporters (`otlp`, `otlphttp`, `loki`) queue batches for a
//! delivery task. `consume` never blocks, so a slow exporter cannot stall the
//! batcher or its siblings.

mod debug;
mod loki;
mod otlp;
mod otlphttp;
mod prometheus;
mod push;

pub use debug::DebugExporter;
pub use loki::LokiSender;
pub use otlp::OtlpGrpcSender;
pub use otlphttp::OtlpHttpSender;
pub use prometheus::PrometheusExporter;
pub use push::{BatchSender, ExportError, PushExporter};

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;

use crate::core::config::{ComponentId, ExporterConfig};
use crate::utils::retry::RetryPolicy;

use super::signal::{Batch, SignalType};
use super::stats::ExporterStats;

#[async_trait]
pub trait Exporter: Send + Sync {
    fn name(&self) -> &str;

    /// Hand over a sealed batch. Must return without waiting on I/O.
    fn consume(&self, batch: Arc<Batch>);

    /// Flush what can be flushed within `grace`, then release resources.
    async fn shutdown(&self, grace: Duration);
}

/// Instantiate one exporter for the pipeline of `signal`
pub async fn build_exporter(
    id: &ComponentId,
    config: &ExporterConfig,
    signal: SignalType,
    stats: Arc<ExporterStats>,
) -> Result<Arc<dyn Exporter>> {
    let name = id.to_string();
    let exporter: Arc<dyn Exporter> = match config {
        ExporterConfig::Prometheus(cfg) => {
            Arc::new(PrometheusExporter::start(name, cfg, stats).await?)
        }
        ExporterConfig::Otlp(cfg) => Arc::new(PushExporter::spawn(
            name,
            Arc::new(OtlpGrpcSender::new(signal, cfg)?),
            RetryPolicy::from(&cfg.retry_on_failure),
            cfg.sending_queue.queue_size,
            stats,
        )),
        ExporterConfig::OtlpHttp(cfg) => Arc::new(PushExporter::spawn(
            name,
            Arc::new(OtlpHttpSender::new(signal, cfg)?),
            RetryPolicy::from(&cfg.retry_on_failure),
            cfg.sending_queue.queue_size,
            stats,
        )),
        ExporterConfig::Loki(cfg) => Arc::new(PushExporter::spawn(
            name,
            Arc::new(LokiSender::new(cfg)?),
            RetryPolicy::from(&cfg.retry_on_failure),
            cfg.sending_queue.queue_size,
            stats,
        )),
        ExporterConfig::Debug(cfg) => Arc::new(DebugExporter::new(name, cfg.verbosity, stats)),
    };
    tracing::debug!(exporter = %id, signal = %signal, "Exporter ready");
    Ok(exporter)
}

/// The exporters of one pipeline
pub struct ExporterSet {
    exporters: Vec<Arc<dyn Exporter>>,
}

impl ExporterSet {
    pub fn new(exporters: Vec<Arc<dyn Exporter>>) -> Self {
        Self { exporters }
    }

    pub fn len(&self) -> usize {
        self.exporters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.exporters.is_empty()
    }

    /// Hand one sealed batch to every exporter
    pub fn dispatch(&self, batch: Batch) {
        let batch = Arc::new(batch);
        for exporter in &self.exporters {
            exporter.consume(Arc::clone(&batch));
        }
    }

    /// Shut every exporter down concurrently, each within `grace`
    pub async fn shutdown(&self, grace: Duration) {
        futures::future::join_all(self.exporters.iter().map(|e| async move {
            e.shutdown(grace).await;
            tracing::debug!(exporter = e.name(), "Exporter stopped");
        }))
        .await;
    }
}


#[cfg(test)]
mod tests {
    use super::testing::RecordingExporter;
    use super::*;
    use crate::domain::signal::testing::{resource, span};

    #[tokio::test]
    async fn test_set_dispatches_same_batch_to_all() {
        let a = Arc::new(RecordingExporter::default());
        let b = Arc::new(RecordingExporter::default());
        let set = ExporterSet::new(vec![a.clone(), b.clone()]);
        assert_eq!(set.len(), 2);

        let r = resource(&[]);
        set.dispatch(Batch::seal(SignalType::Traces, 0, vec![span(&r, "a")], 100));

        let first = a.batches.lock()[0].clone();
        let second = b.batches.lock()[0].clone();
        assert!(Arc::ptr_eq(&first, &second));

        set.shutdown(Duration::from_secs(1)).await;
        assert!(*a.stopped.lock());
        assert!(*b.stopped.lock());
    }
}
