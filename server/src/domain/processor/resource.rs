//! `resource` processor: edits resource attributes once per distinct resource

use crate::core::config::{AttributeActionConfig, ComponentId, ResourceProcessorConfig};
use crate::domain::signal::{Resource, SignalItem};

use super::actions::{ActionError, apply_actions};
use super::{Processor, StageOutput};

pub struct ResourceProcessor {
    name: String,
    actions: Vec<AttributeActionConfig>,
}

impl ResourceProcessor {
    pub fn new(id: &ComponentId, config: &ResourceProcessorConfig) -> Self {
        Self {
            name: id.to_string(),
            actions: config.attributes.clone(),
        }
    }

    fn rewrite(&self, resource: &Resource) -> Result<Resource, ActionError> {
        resource.modified(|attrs| apply_actions(&self.actions, attrs))
    }
}

impl Processor for ResourceProcessor {
    fn name(&self) -> &str {
        &self.name
    }

    fn apply(&self, mut items: Vec<SignalItem>) -> StageOutput {
        // (input, rewritten) per distinct shared resource in this submission
        let mut rewritten: Vec<(Resource, Option<Resource>)> = Vec::new();
        let mut failed = 0;

        for item in &mut items {
            let cached = rewritten
                .iter()
                .find(|(input, _)| input.ptr_eq(item.resource()))
                .map(|(_, output)| output.clone());
            let output = match cached {
                Some(output) => output,
                None => {
                    let output = match self.rewrite(item.resource()) {
                        Ok(resource) => Some(resource),
                        Err(e) => {
                            tracing::debug!(processor = %self.name, error = %e, "Resource action failed");
                            None
                        }
                    };
                    rewritten.push((item.resource().clone(), output.clone()));
                    output
                }
            };
            match output {
                Some(resource) => item.set_resource(resource),
                None => failed += 1,
            }
        }

        StageOutput {
            items,
            failed,
            dropped: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::AttributeAction;
    use crate::domain::signal::AttrValue;
    use crate::domain::signal::testing::{gauge, resource};

    fn processor(actions: Vec<AttributeActionConfig>) -> ResourceProcessor {
        let id: ComponentId = "resource".parse().unwrap();
        ResourceProcessor::new(
            &id,
            &ResourceProcessorConfig {
                attributes: actions,
            },
        )
    }

    fn upsert(key: &str, value: &str) -> AttributeActionConfig {
        AttributeActionConfig {
            key: key.to_string(),
            action: AttributeAction::Upsert,
            value: Some(AttrValue::from(value)),
            from_attribute: None,
            converted_type: None,
        }
    }

    #[test]
    fn test_enrichment_is_idempotent() {
        let p = processor(vec![upsert("deployment.environment", "development")]);
        let r = resource(&[
            ("service.name", "python-otel-app"),
            ("service.version", "1.0.0"),
        ]);
        let items = vec![gauge(&r, "active_requests_current", 3.0)];

        let once = p.apply(items).items;
        let twice = p.apply(once.clone()).items;

        assert_eq!(once, twice);
        let attrs = twice[0].resource().attributes();
        assert_eq!(attrs["deployment.environment"], AttrValue::from("development"));
        assert_eq!(attrs["service.name"], AttrValue::from("python-otel-app"));
        assert_eq!(attrs["service.version"], AttrValue::from("1.0.0"));
        // unchanged on the second pass, so the mapping is shared
        assert!(once[0].resource().ptr_eq(twice[0].resource()));
    }

    #[test]
    fn test_producer_value_overwritten_only_by_upsert() {
        let r = resource(&[("deployment.environment", "staging")]);

        let insert = processor(vec![AttributeActionConfig {
            action: AttributeAction::Insert,
            ..upsert("deployment.environment", "development")
        }]);
        let out = insert.apply(vec![gauge(&r, "m", 1.0)]).items;
        assert_eq!(
            out[0].resource().get("deployment.environment"),
            Some(&AttrValue::from("staging"))
        );

        let upsert = processor(vec![upsert("deployment.environment", "development")]);
        let out = upsert.apply(vec![gauge(&r, "m", 1.0)]).items;
        assert_eq!(
            out[0].resource().get("deployment.environment"),
            Some(&AttrValue::from("development"))
        );
    }

    #[test]
    fn test_shared_resource_rewritten_once() {
        let p = processor(vec![upsert("team", "core")]);
        let a = resource(&[("service.name", "a")]);
        let b = resource(&[("service.name", "b")]);
        let items = vec![
            gauge(&a, "m1", 1.0),
            gauge(&b, "m2", 2.0),
            gauge(&a, "m3", 3.0),
        ];

        let out = p.apply(items).items;
        assert!(out[0].resource().ptr_eq(out[2].resource()));
        assert!(!out[0].resource().ptr_eq(out[1].resource()));
        assert_eq!(out[1].resource().get("team"), Some(&AttrValue::from("core")));
    }

    #[test]
    fn test_delete_removes_key() {
        let p = processor(vec![AttributeActionConfig {
            action: AttributeAction::Delete,
            value: None,
            ..upsert("service.instance.id", "")
        }]);
        let r = resource(&[("service.instance.id", "host-1"), ("service.name", "api")]);
        let out = p.apply(vec![gauge(&r, "m", 1.0)]).items;
        assert!(out[0].resource().get("service.instance.id").is_none());
        assert!(out[0].resource().get("service.name").is_some());
    }
}
