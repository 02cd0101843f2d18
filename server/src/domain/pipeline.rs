//! Pipelines and the pipeline router
//!
//! One pipeline per signal type. Each owns a bounded ingest queue, its
//! processor chain, its batcher and its exporter set, all driven by a single
//! processing task. The router only composes pipelines from configuration,
//! hands ingest handles to receivers and joins the tasks on shutdown.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::core::config::{AppConfig, ComponentId};
use crate::core::constants::PIPELINE_INGEST_QUEUE_CAPACITY;

use super::admission::{AdmissionController, Reservation};
use super::batcher::{BatchSettings, Batcher};
use super::exporter::{ExporterSet, build_exporter};
use super::processor::{ProcessorChain, build_processor};
use super::signal::{Batch, SignalItem, SignalType};
use super::stats::{PipelineStats, StatsRegistry};

/// One receiver submission on its way through the ingest queue
pub struct IngestBatch {
    pub items: Vec<SignalItem>,
    /// Memory held until the items are sealed into a batch
    pub reservation: Reservation,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SubmitError {
    #[error("{0} pipeline queue is full")]
    QueueFull(SignalType),
    #[error("{0} pipeline is shut down")]
    Closed(SignalType),
}

/// Sending side of a pipeline's ingest queue
#[derive(Clone)]
pub struct PipelineHandle {
    signal: SignalType,
    tx: mpsc::Sender<IngestBatch>,
    stats: Arc<PipelineStats>,
}

impl PipelineHandle {
    pub fn signal(&self) -> SignalType {
        self.signal
    }

    /// Enqueue a submission without waiting; a full queue refuses it.
    pub fn submit(&self, items: Vec<SignalItem>, reservation: Reservation) -> Result<(), SubmitError> {
        let count = items.len();
        match self.tx.try_send(IngestBatch { items, reservation }) {
            Ok(()) => {
                self.stats.record_received(count);
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.stats.record_queue_full();
                Err(SubmitError::QueueFull(self.signal))
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(SubmitError::Closed(self.signal)),
        }
    }
}

pub struct Pipeline {
    signal: SignalType,
    rx: mpsc::Receiver<IngestBatch>,
    chain: ProcessorChain,
    batcher: Batcher,
    exporters: ExporterSet,
    admission: Arc<AdmissionController>,
    stats: Arc<PipelineStats>,
}

impl Pipeline {
    pub fn new(
        signal: SignalType,
        queue_capacity: usize,
        chain: ProcessorChain,
        batcher: Batcher,
        exporters: ExporterSet,
        admission: Arc<AdmissionController>,
        stats: Arc<PipelineStats>,
    ) -> (Self, PipelineHandle) {
        let (tx, rx) = mpsc::channel(queue_capacity.max(1));
        let handle = PipelineHandle {
            signal,
            tx,
            stats: Arc::clone(&stats),
        };
        let pipeline = Self {
            signal,
            rx,
            chain,
            batcher,
            exporters,
            admission,
            stats,
        };
        (pipeline, handle)
    }

    /// Spawn the processing task
    pub fn start(self, shutdown_rx: watch::Receiver<bool>, grace: Duration) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown_rx, grace))
    }

    async fn run(mut self, mut shutdown_rx: watch::Receiver<bool>, grace: Duration) {
        tracing::debug!(
            pipeline = %self.signal,
            stages = self.chain.len(),
            exporters = self.exporters.len(),
            "Pipeline started"
        );

        loop {
            let deadline = self.batcher.deadline(self.admission.under_pressure());
            let idle = Instant::now() + Duration::from_secs(3600);

            tokio::select! {
                biased;
                _ = shutdown_rx.wait_for(|&v| v) => break,
                // ahead of the queue so a busy queue cannot hold back an expired batch
                _ = tokio::time::sleep_until(deadline.unwrap_or(idle)), if deadline.is_some() => {
                    if let Some(batch) = self.batcher.seal() {
                        self.dispatch(batch);
                    }
                }
                received = self.rx.recv() => match received {
                    Some(submission) => self.ingest(submission),
                    None => break,
                },
            }
        }

        self.drain(grace).await;
    }

    fn ingest(&mut self, submission: IngestBatch) {
        let IngestBatch { items, reservation } = submission;
        let items = self.chain.apply(items);
        for batch in self.batcher.push(items, reservation) {
            self.dispatch(batch);
        }
    }

    fn dispatch(&self, batch: Batch) {
        self.stats.record_sealed(batch.len());
        tracing::trace!(
            pipeline = %self.signal,
            sequence = batch.sequence(),
            items = batch.len(),
            "Batch sealed"
        );
        self.exporters.dispatch(batch);
    }

    /// Drain the ingest queue, force-seal the open batch, then stop exporters
    async fn drain(mut self, grace: Duration) {
        self.rx.close();
        let mut drained = 0usize;
        while let Some(submission) = self.rx.recv().await {
            drained += submission.items.len();
            self.ingest(submission);
        }
        if let Some(batch) = self.batcher.seal() {
            self.dispatch(batch);
        }
        tracing::debug!(pipeline = %self.signal, drained, "Pipeline drained");

        self.exporters.shutdown(grace).await;
        tracing::debug!(pipeline = %self.signal, "Pipeline stopped");
    }
}

/// Ingest handles a receiver may submit to, by signal
pub type Routes = BTreeMap<SignalType, PipelineHandle>;

/// Builds every configured pipeline and owns them until they are started
pub struct PipelineRouter {
    handles: BTreeMap<SignalType, PipelineHandle>,
    receiver_routes: BTreeMap<ComponentId, Vec<SignalType>>,
    pipelines: Vec<Pipeline>,
    grace: Duration,
}

impl PipelineRouter {
    /// Resolve configuration into concrete pipelines.
    ///
    /// Exporters referenced by several pipelines get one instance per pipeline.
    pub async fn build(
        config: &AppConfig,
        admission: Arc<AdmissionController>,
        registry: &StatsRegistry,
    ) -> Result<Self> {
        let mut handles = BTreeMap::new();
        let mut pipelines = Vec::with_capacity(config.service.pipelines.len());

        for (signal, pipeline_config) in &config.service.pipelines {
            let signal = *signal;
            let stats = registry.pipeline(signal);

            let mut stages = Vec::new();
            for (id, processor) in config.stages_for(pipeline_config) {
                if let Some(stage) = build_processor(id, processor)? {
                    stages.push(stage);
                }
            }

            let mut exporters = Vec::with_capacity(pipeline_config.exporters.len());
            for id in &pipeline_config.exporters {
                let exporter_config = config
                    .exporters
                    .get(id)
                    .with_context(|| format!("Exporter '{}' is not configured", id))?;
                let exporter_stats = registry.exporter(signal, &id.to_string());
                exporters.push(
                    build_exporter(id, exporter_config, signal, exporter_stats)
                        .await
                        .with_context(|| format!("Failed to start exporter '{}' for {} pipeline", id, signal))?,
                );
            }

            let batch = config.batch_for(pipeline_config);
            let (pipeline, handle) = Pipeline::new(
                signal,
                PIPELINE_INGEST_QUEUE_CAPACITY,
                ProcessorChain::new(stages, Arc::clone(&stats)),
                Batcher::new(signal, BatchSettings::from(&batch)),
                ExporterSet::new(exporters),
                Arc::clone(&admission),
                stats,
            );
            handles.insert(signal, handle);
            pipelines.push(pipeline);
        }

        Ok(Self {
            handles,
            receiver_routes: config.receiver_routes(),
            pipelines,
            grace: config.service.shutdown_grace,
        })
    }

    pub fn handle(&self, signal: SignalType) -> Option<&PipelineHandle> {
        self.handles.get(&signal)
    }

    /// Handles of the pipelines that list `receiver`
    pub fn routes_for(&self, receiver: &ComponentId) -> Routes {
        self.receiver_routes
            .get(receiver)
            .into_iter()
            .flatten()
            .filter_map(|signal| {
                self.handles
                    .get(signal)
                    .map(|handle| (*signal, handle.clone()))
            })
            .collect()
    }

    /// Spawn every pipeline's processing task
    pub fn start(&mut self, shutdown_rx: &watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        self.pipelines
            .drain(..)
            .map(|pipeline| pipeline.start(shutdown_rx.clone(), self.grace))
            .collect()
    }
}
