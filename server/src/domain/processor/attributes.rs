//! `attributes` processor: actions on item-level attributes

use crate::core::config::{AttributeActionConfig, AttributesProcessorConfig, ComponentId};
use crate::domain::signal::SignalItem;

use super::actions::apply_actions;
use super::{Processor, StageOutput};

pub struct AttributesProcessor {
    name: String,
    actions: Vec<AttributeActionConfig>,
}

impl AttributesProcessor {
    pub fn new(id: &ComponentId, config: &AttributesProcessorConfig) -> Self {
        Self {
            name: id.to_string(),
            actions: config.actions.clone(),
        }
    }
}

impl Processor for AttributesProcessor {
    fn name(&self) -> &str {
        &self.name
    }

    fn apply(&self, mut items: Vec<SignalItem>) -> StageOutput {
        let mut failed = 0;
        for item in &mut items {
            if let Err(e) = apply_actions(&self.actions, item.attributes_mut()) {
                tracing::trace!(processor = %self.name, error = %e, "Attribute action failed");
                failed += 1;
            }
        }
        StageOutput {
            items,
            failed,
            dropped: 0,
        }
    }
}
