//! `loki` exporter: Loki push API (JSON)
//!
//! Log records are grouped into streams by label set. Labels come from the
//! enabled default labels plus promoted resource and record attributes; each
//! line is a JSON document carrying the body, trace context and attributes.

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::core::config::{LokiDefaultLabels, LokiExporterConfig, LokiLabelsConfig};
use crate::domain::signal::{AttrValue, Attributes, Batch, LogRecord, SignalItem};
use crate::utils::otlp::keys;

use super::otlphttp::{header_map, http_client};
use super::push::{BatchSender, ExportError};

const TENANT_HEADER: &str = "X-Scope-OrgID";
const EXPORTER_LABEL_VALUE: &str = "OTLP";

type Labels = BTreeMap<String, String>;

#[derive(Debug, Serialize)]
pub struct PushRequest {
    pub streams: Vec<Stream>,
}

#[derive(Debug, Serialize)]
pub struct Stream {
    pub stream: Labels,
    /// `[timestamp_ns, line]` pairs
    pub values: Vec<[String; 2]>,
}

pub struct LokiSender {
    client: reqwest::Client,
    endpoint: String,
    default_labels: LokiDefaultLabels,
    promoted: LokiLabelsConfig,
}

/// Loki label names allow `[a-zA-Z0-9_]` only
fn label_name(key: &str) -> String {
    key.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

fn level_from_severity(severity_number: i32) -> Option<&'static str> {
    match severity_number {
        1..=4 => Some("trace"),
        5..=8 => Some("debug"),
        9..=12 => Some("info"),
        13..=16 => Some("warn"),
        17..=20 => Some("error"),
        21..=24 => Some("fatal"),
        _ => None,
    }
}

fn attr_json(value: &AttrValue) -> Value {
    match value {
        AttrValue::String(s) => Value::String(s.clone()),
        AttrValue::Int(i) => Value::from(*i),
        AttrValue::Double(d) => Value::from(*d),
        AttrValue::Bool(b) => Value::Bool(*b),
    }
}

fn attrs_json(attrs: &Attributes) -> Value {
    Value::Object(
        attrs
            .iter()
            .map(|(k, v)| (k.clone(), attr_json(v)))
            .collect::<Map<String, Value>>(),
    )
}

/// Event time, then observed time, then now; Loki rejects a zero timestamp
fn entry_timestamp(record: &LogRecord) -> u64 {
    if record.time_unix_nano > 0 {
        return record.time_unix_nano;
    }
    if record.observed_time_unix_nano > 0 {
        return record.observed_time_unix_nano;
    }
    chrono::Utc::now()
        .timestamp_nanos_opt()
        .and_then(|ns| u64::try_from(ns).ok())
        .unwrap_or(1)
}

impl LokiSender {
    pub fn new(config: &LokiExporterConfig) -> Result<Self> {
        let mut headers = config.headers.clone();
        if let Some(tenant) = &config.tenant_id {
            headers.insert(TENANT_HEADER.to_string(), tenant.clone());
        }
        let client = http_client(
            Duration::from_millis(config.timeout_ms),
            header_map(&headers)?,
            None,
        )?;
        Ok(Self {
            client,
            endpoint: config.endpoint.clone(),
            default_labels: config.default_labels_enabled.clone(),
            promoted: config.labels.clone(),
        })
    }

    fn labels(&self, record: &LogRecord) -> Labels {
        let mut labels = Labels::new();
        let resource = &record.resource;

        if self.default_labels.exporter {
            labels.insert("exporter".into(), EXPORTER_LABEL_VALUE.into());
        }
        if self.default_labels.job
            && let Some(name) = resource.get(keys::SERVICE_NAME)
        {
            let job = match resource.get(keys::SERVICE_NAMESPACE) {
                Some(ns) => format!("{}/{}", ns, name),
                None => name.to_string(),
            };
            labels.insert("job".into(), job);
        }
        if self.default_labels.instance
            && let Some(instance) = resource.get(keys::SERVICE_INSTANCE_ID)
        {
            labels.insert("instance".into(), instance.to_string());
        }
        if self.default_labels.level {
            let level = if record.severity_text.is_empty() {
                level_from_severity(record.severity_number).map(String::from)
            } else {
                Some(record.severity_text.to_lowercase())
            };
            if let Some(level) = level {
                labels.insert("level".into(), level);
            }
        }

        for key in &self.promoted.resource {
            if let Some(v) = resource.get(key) {
                labels.insert(label_name(key), v.to_string());
            }
        }
        for key in &self.promoted.attributes {
            if let Some(v) = record.attributes.get(key) {
                labels.insert(label_name(key), v.to_string());
            }
        }

        if labels.is_empty() {
            // Loki rejects streams without labels
            labels.insert("exporter".into(), EXPORTER_LABEL_VALUE.into());
        }
        labels
    }

    fn line(record: &LogRecord) -> String {
        let mut line = Map::new();
        if !record.body.is_empty() {
            line.insert("body".into(), Value::String(record.body.clone()));
        }
        if let Some(trace_id) = record.trace_id {
            line.insert("traceid".into(), Value::String(trace_id.to_string()));
        }
        if let Some(span_id) = record.span_id {
            line.insert("spanid".into(), Value::String(span_id.to_string()));
        }
        if !record.severity_text.is_empty() {
            line.insert(
                "severity".into(),
                Value::String(record.severity_text.clone()),
            );
        }
        if !record.attributes.is_empty() {
            line.insert("attributes".into(), attrs_json(&record.attributes));
        }
        if !record.resource.attributes().is_empty() {
            line.insert("resources".into(), attrs_json(record.resource.attributes()));
        }
        Value::Object(line).to_string()
    }

    /// Group the log records of a batch into Loki streams
    pub fn push_request(&self, batch: &Batch) -> PushRequest {
        let mut index: BTreeMap<Labels, usize> = BTreeMap::new();
        let mut streams: Vec<Stream> = Vec::new();

        for item in batch.items() {
            let SignalItem::Log(record) = item else {
                continue;
            };
            let labels = self.labels(record);
            let timestamp = entry_timestamp(record);
            let value = [timestamp.to_string(), Self::line(record)];

            match index.get(&labels) {
                Some(&i) => streams[i].values.push(value),
                None => {
                    index.insert(labels.clone(), streams.len());
                    streams.push(Stream {
                        stream: labels,
                        values: vec![value],
                    });
                }
            }
        }
        PushRequest { streams }
    }
}

#[async_trait]
impl BatchSender for LokiSender {
    async fn send(&self, batch: &Batch) -> Result<(), ExportError> {
        let request = self.push_request(batch);
        if request.streams.is_empty() {
            return Ok(());
        }

        let response = self
            .client
            .post(&self.endpoint)
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let text = response.text().await.unwrap_or_default();
        Err(ExportError::from_http_status(status, &text))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::Router;
    use axum::extract::State;
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::post;
    use parking_lot::Mutex;
    use tokio::net::TcpListener;

    use super::*;
    use crate::domain::signal::testing::{log, resource};
    use crate::domain::signal::{SignalType, SpanId, TraceId};

    fn sender(json: Value) -> LokiSender {
        let config: LokiExporterConfig = serde_json::from_value(json).unwrap();
        LokiSender::new(&config).unwrap()
    }

    fn batch(items: Vec<SignalItem>) -> Batch {
        Batch::seal(SignalType::Logs, 0, items, 0)
    }

    #[test]
    fn test_default_labels() {
        let s = sender(serde_json::json!({ "endpoint": "http://loki:3100/loki/api/v1/push" }));
        let r = resource(&[
            ("service.name", "checkout"),
            ("service.namespace", "shop"),
            ("service.instance.id", "pod-1"),
        ]);
        let SignalItem::Log(record) = log(&r, 17, "Order failed") else {
            unreachable!()
        };
        let labels = s.labels(&record);
        assert_eq!(labels["exporter"], "OTLP");
        assert_eq!(labels["job"], "shop/checkout");
        assert_eq!(labels["instance"], "pod-1");
        assert_eq!(labels["level"], "error");
    }

    #[test]
    fn test_promoted_labels_and_toggles() {
        let s = sender(serde_json::json!({
            "endpoint": "http://loki:3100/loki/api/v1/push",
            "default_labels_enabled": { "exporter": false, "instance": false, "level": false },
            "labels": { "resource": ["deployment.environment"], "attributes": ["http.route"] }
        }));
        let r = resource(&[("service.name", "api"), ("deployment.environment", "development")]);
        let mut item = log(&r, 9, "User lookup");
        item.attributes_mut()
            .insert("http.route".into(), AttrValue::from("/users"));
        let SignalItem::Log(record) = item else {
            unreachable!()
        };

        let labels = s.labels(&record);
        assert_eq!(labels.len(), 3);
        assert_eq!(labels["job"], "api");
        assert_eq!(labels["deployment_environment"], "development");
        assert_eq!(labels["http_route"], "/users");
    }

    #[test]
    fn test_empty_label_set_falls_back_to_exporter() {
        let s = sender(serde_json::json!({
            "endpoint": "http://loki:3100/loki/api/v1/push",
            "default_labels_enabled": { "exporter": false, "job": false, "instance": false, "level": false }
        }));
        let r = resource(&[]);
        let SignalItem::Log(record) = log(&r, 9, "x") else {
            unreachable!()
        };
        assert_eq!(s.labels(&record).get("exporter").map(String::as_str), Some("OTLP"));
    }

    #[test]
    fn test_streams_grouped_and_lines_structured() {
        let s = sender(serde_json::json!({ "endpoint": "http://loki:3100/loki/api/v1/push" }));
        let r = resource(&[("service.name", "api")]);
        let mut failed = log(&r, 17, "Order failed");
        if let SignalItem::Log(l) = &mut failed {
            l.trace_id = TraceId::from_bytes(&[0xab; 16]);
            l.span_id = SpanId::from_bytes(&[0xcd; 8]);
        }
        let request = s.push_request(&batch(vec![
            log(&r, 9, "User lookup"),
            failed,
            log(&r, 9, "Cache hit"),
        ]));

        assert_eq!(request.streams.len(), 2);
        assert_eq!(request.streams[0].stream["level"], "info");
        assert_eq!(request.streams[0].values.len(), 2);
        assert_eq!(request.streams[1].values.len(), 1);

        let line: Value = serde_json::from_str(&request.streams[1].values[0][1]).unwrap();
        assert_eq!(line["body"], "Order failed");
        assert_eq!(line["traceid"], "ab".repeat(16));
        assert_eq!(line["spanid"], "cd".repeat(8));
        assert_eq!(line["resources"]["service.name"], "api");
    }

    #[test]
    fn test_missing_timestamps_fall_back_to_now() {
        let s = sender(serde_json::json!({ "endpoint": "http://loki:3100/loki/api/v1/push" }));
        let r = resource(&[("service.name", "api")]);
        let mut observed = log(&r, 9, "observed only");
        let mut untimed = log(&r, 9, "no time at all");
        if let SignalItem::Log(l) = &mut observed {
            l.time_unix_nano = 0;
            l.observed_time_unix_nano = 42;
        }
        if let SignalItem::Log(l) = &mut untimed {
            l.time_unix_nano = 0;
            l.observed_time_unix_nano = 0;
        }
        let before = chrono::Utc::now().timestamp_nanos_opt().unwrap() as u64;

        let request = s.push_request(&batch(vec![observed, untimed]));
        let values = &request.streams[0].values;
        assert_eq!(values[0][0], "42");
        assert!(values[1][0].parse::<u64>().unwrap() >= before);
    }

    #[tokio::test]
    async fn test_push_sends_tenant_header() {
        let seen: Arc<Mutex<Vec<(Option<String>, Value)>>> = Arc::default();
        let app = Router::new()
            .route(
                "/loki/api/v1/push",
                post(
                    |State(seen): State<Arc<Mutex<Vec<(Option<String>, Value)>>>>,
                     headers: HeaderMap,
                     axum::Json(body): axum::Json<Value>| async move {
                        let tenant = headers
                            .get("x-scope-orgid")
                            .and_then(|v| v.to_str().ok())
                            .map(String::from);
                        seen.lock().push((tenant, body));
                        StatusCode::NO_CONTENT
                    },
                ),
            )
            .with_state(seen.clone());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await });

        let s = sender(serde_json::json!({
            "endpoint": format!("http://{}/loki/api/v1/push", addr),
            "tenant_id": "team-a"
        }));
        let r = resource(&[("service.name", "api")]);
        s.send(&batch(vec![log(&r, 9, "hello")])).await.unwrap();

        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0.as_deref(), Some("team-a"));
        assert_eq!(seen[0].1["streams"][0]["stream"]["job"], "api");
    }
}
