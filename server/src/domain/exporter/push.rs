//! Push delivery: bounded sending queue drained by one task per exporter

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::domain::signal::Batch;
use crate::domain::stats::ExporterStats;
use crate::utils::retry::{RetryError, RetryPolicy, retry_with_backoff_async};

use super::Exporter;

#[derive(Debug, Error)]
pub enum ExportError {
    /// Worth retrying: network failures, throttling, unavailable backends
    #[error("transient export failure: {0}")]
    Transient(String),
    #[error("permanent export failure: {0}")]
    Permanent(String),
}

impl ExportError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ExportError::Transient(_))
    }

    /// Classify an HTTP response status
    pub fn from_http_status(status: reqwest::StatusCode, body: &str) -> Self {
        let message = format!("HTTP {}: {}", status.as_u16(), body.trim());
        match status.as_u16() {
            429 | 502 | 503 | 504 => ExportError::Transient(message),
            _ => ExportError::Permanent(message),
        }
    }
}

impl From<reqwest::Error> for ExportError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_builder() {
            ExportError::Permanent(e.to_string())
        } else {
            ExportError::Transient(e.to_string())
        }
    }
}

/// One delivery attempt of a batch to a remote backend
#[async_trait]
pub trait BatchSender: Send + Sync + 'static {
    async fn send(&self, batch: &Batch) -> Result<(), ExportError>;
}

pub struct PushExporter {
    name: String,
    tx: Mutex<Option<mpsc::Sender<Arc<Batch>>>>,
    /// Items queued or in flight
    pending: Arc<AtomicUsize>,
    draining: watch::Sender<bool>,
    worker: Mutex<Option<JoinHandle<()>>>,
    stats: Arc<ExporterStats>,
}

impl PushExporter {
    /// Create the sending queue and spawn the delivery task
    pub fn spawn(
        name: String,
        sender: Arc<dyn BatchSender>,
        policy: RetryPolicy,
        queue_size: usize,
        stats: Arc<ExporterStats>,
    ) -> Self {
        let (tx, rx) = mpsc::channel(queue_size.max(1));
        let (draining, draining_rx) = watch::channel(false);
        let pending = Arc::new(AtomicUsize::new(0));

        let worker = tokio::spawn(deliver(
            name.clone(),
            sender,
            policy,
            rx,
            draining_rx,
            Arc::clone(&pending),
            Arc::clone(&stats),
        ));

        Self {
            name,
            tx: Mutex::new(Some(tx)),
            pending,
            draining,
            worker: Mutex::new(Some(worker)),
            stats,
        }
    }
}

async fn deliver(
    name: String,
    sender: Arc<dyn BatchSender>,
    policy: RetryPolicy,
    mut rx: mpsc::Receiver<Arc<Batch>>,
    mut draining: watch::Receiver<bool>,
    pending: Arc<AtomicUsize>,
    stats: Arc<ExporterStats>,
) {
    while let Some(batch) = rx.recv().await {
        let items = batch.len();

        let outcome = if *draining.borrow() {
            // draining: one attempt per remaining batch
            sender.send(&batch).await.map(|()| 1).map_err(|error| {
                RetryError::Cancelled { error, attempts: 1 }
            })
        } else {
            retry_with_backoff_async(
                &policy,
                &mut draining,
                ExportError::is_transient,
                || stats.record_retry(),
                || sender.send(&batch),
            )
            .await
        };

        match outcome {
            Ok(attempts) => {
                stats.record_sent(items);
                tracing::trace!(exporter = %name, items, attempts, "Batch delivered");
            }
            Err(e) => {
                let attempts = e.attempts();
                let (RetryError::Permanent { error, .. }
                | RetryError::Exhausted { error, .. }
                | RetryError::Cancelled { error, .. }) = e;
                stats.record_failed(items);
                tracing::warn!(
                    exporter = %name,
                    sequence = batch.sequence(),
                    items,
                    attempts,
                    error = %error,
                    "Dropping batch after failed export"
                );
            }
        }
        pending.fetch_sub(items, Ordering::Relaxed);
    }
}

#[async_trait]
impl Exporter for PushExporter {
    fn name(&self) -> &str {
        &self.name
    }

    fn consume(&self, batch: Arc<Batch>) {
        let items = batch.len();
        let guard = self.tx.lock();
        let Some(tx) = guard.as_ref() else {
            self.stats.record_dropped(items);
            return;
        };
        self.pending.fetch_add(items, Ordering::Relaxed);
        if let Err(e) = tx.try_send(batch) {
            self.pending.fetch_sub(items, Ordering::Relaxed);
            self.stats.record_dropped(items);
            match e {
                mpsc::error::TrySendError::Full(_) => {
                    tracing::warn!(exporter = %self.name, items, "Sending queue full, dropping batch");
                }
                mpsc::error::TrySendError::Closed(_) => {
                    tracing::debug!(exporter = %self.name, items, "Sending queue closed, dropping batch");
                }
            }
        }
    }

    async fn shutdown(&self, grace: Duration) {
        self.draining.send_replace(true);
        // closing the queue lets the worker exit once it is empty
        self.tx.lock().take();

        let Some(mut worker) = self.worker.lock().take() else {
            return;
        };
        if tokio::time::timeout(grace, &mut worker).await.is_err() {
            worker.abort();
            let abandoned = self.pending.swap(0, Ordering::Relaxed);
            if abandoned > 0 {
                self.stats.record_dropped(abandoned);
                tracing::warn!(
                    exporter = %self.name,
                    items = abandoned,
                    "Shutdown grace elapsed, abandoning queued batches"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::signal::SignalType;
    use crate::domain::signal::testing::{log, resource};

    /// Fails the first `failures` attempts with the given error kind
    struct FlakySender {
        failures: usize,
        transient: bool,
        calls: AtomicUsize,
        hang: bool,
    }

    impl FlakySender {
        fn new(failures: usize, transient: bool) -> Arc<Self> {
            Arc::new(Self {
                failures,
                transient,
                calls: AtomicUsize::new(0),
                hang: false,
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl BatchSender for FlakySender {
        async fn send(&self, _batch: &Batch) -> Result<(), ExportError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if self.hang {
                std::future::pending::<()>().await;
            }
            if n < self.failures {
                if self.transient {
                    Err(ExportError::Transient("connection refused".into()))
                } else {
                    Err(ExportError::Permanent("HTTP 400: bad request".into()))
                }
            } else {
                Ok(())
            }
        }
    }

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            enabled: true,
            initial_interval: Duration::from_millis(100),
            max_interval: Duration::from_millis(400),
            max_attempts,
        }
    }

    fn batch(sequence: u64, n: usize) -> Arc<Batch> {
        let r = resource(&[("service.name", "api")]);
        let items = (0..n).map(|i| log(&r, 9, &format!("line {}", i))).collect();
        Arc::new(Batch::seal(SignalType::Logs, sequence, items, 0))
    }

    async fn settle(stats: &ExporterStats) {
        while stats.batches_sent() + stats.batches_failed() + stats.batches_dropped() == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_until_ceiling_then_one_failure() {
        let stats = Arc::new(ExporterStats::default());
        let sender = FlakySender::new(usize::MAX, true);
        let exporter = PushExporter::spawn("otlphttp".into(), sender.clone(), policy(4), 10, stats.clone());

        exporter.consume(batch(0, 5));
        settle(&stats).await;

        assert_eq!(sender.calls(), 4);
        assert_eq!(stats.retries(), 3);
        assert_eq!(stats.batches_failed(), 1);
        assert_eq!(stats.items_failed(), 5);
        assert_eq!(stats.batches_sent(), 0);
        exporter.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failure_recovers() {
        let stats = Arc::new(ExporterStats::default());
        let sender = FlakySender::new(2, true);
        let exporter = PushExporter::spawn("otlp".into(), sender.clone(), policy(5), 10, stats.clone());

        exporter.consume(batch(0, 3));
        settle(&stats).await;

        assert_eq!(sender.calls(), 3);
        assert_eq!(stats.items_sent(), 3);
        assert_eq!(stats.batches_failed(), 0);
        exporter.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_error_not_retried() {
        let stats = Arc::new(ExporterStats::default());
        let sender = FlakySender::new(1, false);
        let exporter = PushExporter::spawn("loki".into(), sender.clone(), policy(5), 10, stats.clone());

        exporter.consume(batch(0, 2));
        settle(&stats).await;

        assert_eq!(sender.calls(), 1);
        assert_eq!(stats.batches_failed(), 1);
        assert_eq!(stats.retries(), 0);
        exporter.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_queue_drops_batch() {
        let stats = Arc::new(ExporterStats::default());
        let sender = Arc::new(FlakySender {
            failures: 0,
            transient: true,
            calls: AtomicUsize::new(0),
            hang: true,
        });
        let exporter = PushExporter::spawn("otlp".into(), sender.clone(), policy(1), 1, stats.clone());

        exporter.consume(batch(0, 1));
        // let the worker take the first batch and hang on it
        while sender.calls() == 0 {
            tokio::task::yield_now().await;
        }
        exporter.consume(batch(1, 1));
        exporter.consume(batch(2, 4));

        assert_eq!(stats.batches_dropped(), 1);
        assert_eq!(stats.items_dropped(), 4);

        // in-flight batch and the queued one are abandoned at shutdown
        exporter.shutdown(Duration::from_millis(100)).await;
        assert_eq!(stats.items_dropped(), 6);
        assert_eq!(stats.batches_sent(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_gives_queued_batches_one_attempt() {
        let stats = Arc::new(ExporterStats::default());
        let sender = FlakySender::new(usize::MAX, true);
        let exporter = PushExporter::spawn("otlp".into(), sender.clone(), policy(0), 10, stats.clone());

        exporter.consume(batch(0, 1));
        exporter.consume(batch(1, 1));
        exporter.shutdown(Duration::from_secs(5)).await;

        // first batch: interrupted mid-backoff; second: a single attempt
        assert_eq!(stats.batches_failed(), 2);
        assert!(sender.calls() >= 2);
        exporter.consume(batch(2, 1));
        assert_eq!(stats.batches_dropped(), 1);
    }
}
