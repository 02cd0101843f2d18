//! Processor chain
//!
//! Ordered transformation stages applied by a pipeline's processing task to
//! every submission before it reaches the batcher. Stages are total: a bad item
//! is passed through unmodified or dropped and counted, never fails the batch.

mod actions;
mod attributes;
mod filter;
mod resource;

use std::sync::Arc;

use anyhow::Result;

pub use attributes::AttributesProcessor;
pub use filter::FilterProcessor;
pub use resource::ResourceProcessor;

use crate::core::config::{ComponentId, ProcessorConfig};
use crate::domain::signal::SignalItem;
use crate::domain::stats::PipelineStats;

/// Result of one stage
#[derive(Debug, Default)]
pub struct StageOutput {
    pub items: Vec<SignalItem>,
    /// Items passed through unmodified because the stage failed on them
    pub failed: u64,
    /// Items removed by the stage
    pub dropped: u64,
}

impl StageOutput {
    pub fn unchanged(items: Vec<SignalItem>) -> Self {
        Self {
            items,
            failed: 0,
            dropped: 0,
        }
    }
}

/// A transformation stage
pub trait Processor: Send + Sync {
    fn name(&self) -> &str;

    fn apply(&self, items: Vec<SignalItem>) -> StageOutput;
}

/// Build the stage for a processor configuration.
///
/// `memory_limiter` and `batch` configure the admission controller and the
/// batcher, so they yield no stage.
pub fn build_processor(
    id: &ComponentId,
    config: &ProcessorConfig,
) -> Result<Option<Arc<dyn Processor>>> {
    let stage: Arc<dyn Processor> = match config {
        ProcessorConfig::MemoryLimiter(_) | ProcessorConfig::Batch(_) => return Ok(None),
        ProcessorConfig::Resource(cfg) => Arc::new(ResourceProcessor::new(id, cfg)),
        ProcessorConfig::Attributes(cfg) => Arc::new(AttributesProcessor::new(id, cfg)),
        ProcessorConfig::Filter(cfg) => Arc::new(FilterProcessor::new(id, cfg)?),
    };
    Ok(Some(stage))
}

/// Ordered stages of one pipeline
pub struct ProcessorChain {
    stages: Vec<Arc<dyn Processor>>,
    stats: Arc<PipelineStats>,
}

impl ProcessorChain {
    pub fn new(stages: Vec<Arc<dyn Processor>>, stats: Arc<PipelineStats>) -> Self {
        Self { stages, stats }
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Run `items` through every stage, in order.
    pub fn apply(&self, mut items: Vec<SignalItem>) -> Vec<SignalItem> {
        for stage in &self.stages {
            if items.is_empty() {
                break;
            }
            let out = stage.apply(items);
            if out.failed > 0 {
                tracing::debug!(
                    processor = stage.name(),
                    failed = out.failed,
                    "Items passed through after processor error"
                );
                self.stats.record_processor_errors(out.failed);
            }
            if out.dropped > 0 {
                self.stats.record_filtered(out.dropped);
            }
            items = out.items;
        }
        items
    }
}
