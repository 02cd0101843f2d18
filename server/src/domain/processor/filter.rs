//! `filter` processor: drops items matching configured rules

use anyhow::{Context, Result};
use regex::Regex;

use crate::core::config::{ComponentId, FilterProcessorConfig};
use crate::domain::signal::SignalItem;

use super::{Processor, StageOutput};

pub struct FilterProcessor {
    name: String,
    metric_names: Vec<Regex>,
    span_names: Vec<Regex>,
    /// Logs below this severity are dropped; unspecified severity (0) is kept
    log_min_severity: Option<i32>,
    attributes: Vec<(String, Regex)>,
}

fn compile(patterns: &[String]) -> Result<Vec<Regex>> {
    patterns
        .iter()
        .map(|p| Regex::new(p).with_context(|| format!("invalid regex '{}'", p)))
        .collect()
}

impl FilterProcessor {
    pub fn new(id: &ComponentId, config: &FilterProcessorConfig) -> Result<Self> {
        let attributes = config
            .exclude_attributes
            .iter()
            .map(|(key, pattern)| {
                Regex::new(pattern)
                    .map(|re| (key.clone(), re))
                    .with_context(|| format!("invalid regex '{}'", pattern))
            })
            .collect::<Result<Vec<_>>>()
            .with_context(|| format!("Failed to build processor '{}'", id))?;

        Ok(Self {
            name: id.to_string(),
            metric_names: compile(&config.metrics.exclude_names)
                .with_context(|| format!("Failed to build processor '{}'", id))?,
            span_names: compile(&config.traces.exclude_names)
                .with_context(|| format!("Failed to build processor '{}'", id))?,
            log_min_severity: config
                .logs
                .min_severity
                .as_ref()
                .map(|s| s.severity_number())
                .transpose()
                .with_context(|| format!("Failed to build processor '{}'", id))?,
            attributes,
        })
    }

    fn is_noop(&self) -> bool {
        self.metric_names.is_empty()
            && self.span_names.is_empty()
            && self.log_min_severity.is_none()
            && self.attributes.is_empty()
    }

    fn excludes(&self, item: &SignalItem) -> bool {
        let by_kind = match item {
            SignalItem::Metric(m) => self.metric_names.iter().any(|re| re.is_match(&m.name)),
            SignalItem::Span(s) => self.span_names.iter().any(|re| re.is_match(&s.name)),
            SignalItem::Log(l) => self
                .log_min_severity
                .is_some_and(|min| l.severity_number > 0 && l.severity_number < min),
        };
        by_kind
            || self.attributes.iter().any(|(key, re)| {
                item.attributes()
                    .get(key)
                    .is_some_and(|v| re.is_match(&v.to_string()))
            })
    }
}

impl Processor for FilterProcessor {
    fn name(&self) -> &str {
        &self.name
    }

    fn apply(&self, items: Vec<SignalItem>) -> StageOutput {
        if self.is_noop() {
            return StageOutput::unchanged(items);
        }
        let before = items.len();
        let items: Vec<_> = items.into_iter().filter(|i| !self.excludes(i)).collect();
        StageOutput {
            dropped: (before - items.len()) as u64,
            failed: 0,
            items,
        }
    }
}
