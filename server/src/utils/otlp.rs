//! OTLP utility functions
//!
//! Conversions between OTLP protobuf types and the signal model:
//! - Export requests into [`SignalItem`]s sharing one resource per block
//! - Sealed batches back into export requests, regrouped by resource and scope
//! - Attribute value conversion

use std::collections::HashMap;
use std::sync::Arc;

use opentelemetry_proto::tonic::collector::{
    logs::v1::ExportLogsServiceRequest, metrics::v1::ExportMetricsServiceRequest,
    trace::v1::ExportTraceServiceRequest,
};
use opentelemetry_proto::tonic::common::v1::{AnyValue, InstrumentationScope, KeyValue, any_value};
use opentelemetry_proto::tonic::logs::v1::{
    LogRecord as OtlpLogRecord, ResourceLogs, ScopeLogs,
};
use opentelemetry_proto::tonic::metrics::v1::{
    AggregationTemporality, Gauge, Histogram, HistogramDataPoint, Metric, NumberDataPoint,
    ResourceMetrics, ScopeMetrics, Sum, metric, number_data_point,
};
use opentelemetry_proto::tonic::resource::v1::Resource as OtlpResource;
use opentelemetry_proto::tonic::trace::v1::{
    ResourceSpans, ScopeSpans, Span, Status, span,
};
use thiserror::Error;

use crate::domain::signal::{
    AttrValue, Attributes, LogRecord, MetricPoint, MetricValue, Resource, Scope, SignalItem,
    SpanEvent, SpanId, SpanKind, SpanRecord, SpanStatus, StatusCode, Temporality, TraceId,
};

// ============================================================================
// SHARED ATTRIBUTE KEYS
// ============================================================================

/// Resource attribute keys the exporters derive labels from
pub mod keys {
    pub const SERVICE_NAME: &str = "service.name";
    pub const SERVICE_NAMESPACE: &str = "service.namespace";
    pub const SERVICE_INSTANCE_ID: &str = "service.instance.id";
}

#[derive(Debug, Error, PartialEq)]
pub enum ConvertError {
    #[error("span '{name}' has an invalid trace id ({len} bytes, expected 16)")]
    InvalidTraceId { name: String, len: usize },
    #[error("span '{name}' has an invalid {field} ({len} bytes, expected 8)")]
    InvalidSpanId {
        name: String,
        field: &'static str,
        len: usize,
    },
    #[error("log record has an invalid {field} ({len} bytes)")]
    InvalidLogContext { field: &'static str, len: usize },
    #[error("metric name must not be empty")]
    EmptyMetricName,
}

/// Items decoded from one export request
#[derive(Debug, Default)]
pub struct Converted {
    pub items: Vec<SignalItem>,
    /// Data points of kinds the model does not carry (summaries, exponential histograms)
    pub skipped: usize,
}

// ============================================================================
// ATTRIBUTE CONVERSION
// ============================================================================

/// Convert AnyValue to string representation
pub fn any_value_to_string(value: &AnyValue) -> String {
    match &value.value {
        Some(any_value::Value::StringValue(s)) => s.clone(),
        Some(any_value::Value::BoolValue(b)) => b.to_string(),
        Some(any_value::Value::IntValue(i)) => i.to_string(),
        Some(any_value::Value::DoubleValue(d)) => d.to_string(),
        Some(any_value::Value::ArrayValue(arr)) => {
            let values: Vec<String> = arr.values.iter().map(any_value_to_string).collect();
            serde_json::to_string(&values).unwrap_or_default()
        }
        Some(any_value::Value::KvlistValue(kvlist)) => {
            let map: HashMap<String, String> = kvlist
                .values
                .iter()
                .filter_map(|kv| {
                    kv.value
                        .as_ref()
                        .map(|v| (kv.key.clone(), any_value_to_string(v)))
                })
                .collect();
            serde_json::to_string(&map).unwrap_or_default()
        }
        Some(any_value::Value::BytesValue(b)) => hex::encode(b),
        None => String::new(),
    }
}

/// Convert AnyValue to an attribute value; complex values are flattened to strings
pub fn any_value_to_attr(value: &AnyValue) -> Option<AttrValue> {
    match &value.value {
        Some(any_value::Value::StringValue(s)) => Some(AttrValue::String(s.clone())),
        Some(any_value::Value::BoolValue(b)) => Some(AttrValue::Bool(*b)),
        Some(any_value::Value::IntValue(i)) => Some(AttrValue::Int(*i)),
        Some(any_value::Value::DoubleValue(d)) => Some(AttrValue::Double(*d)),
        Some(_) => Some(AttrValue::String(any_value_to_string(value))),
        None => None,
    }
}

fn attr_to_any_value(value: &AttrValue) -> AnyValue {
    let value = match value {
        AttrValue::String(s) => any_value::Value::StringValue(s.clone()),
        AttrValue::Int(i) => any_value::Value::IntValue(*i),
        AttrValue::Double(d) => any_value::Value::DoubleValue(*d),
        AttrValue::Bool(b) => any_value::Value::BoolValue(*b),
    };
    AnyValue { value: Some(value) }
}

fn string_value(s: &str) -> AnyValue {
    AnyValue {
        value: Some(any_value::Value::StringValue(s.to_string())),
    }
}

/// Extract attributes from a KeyValue array; entries without a value are skipped
pub fn attributes_from_otlp(kvs: &[KeyValue]) -> Attributes {
    kvs.iter()
        .filter_map(|kv| {
            kv.value
                .as_ref()
                .and_then(any_value_to_attr)
                .map(|v| (kv.key.clone(), v))
        })
        .collect()
}

pub fn attributes_to_otlp(attrs: &Attributes) -> Vec<KeyValue> {
    attrs
        .iter()
        .map(|(k, v)| KeyValue {
            key: k.clone(),
            value: Some(attr_to_any_value(v)),
        })
        .collect()
}

fn resource_from_otlp(resource: Option<&OtlpResource>) -> Resource {
    Resource::new(
        resource
            .map(|r| attributes_from_otlp(&r.attributes))
            .unwrap_or_default(),
    )
}

fn resource_to_otlp(resource: &Resource) -> OtlpResource {
    OtlpResource {
        attributes: attributes_to_otlp(resource.attributes()),
        ..Default::default()
    }
}

fn scope_from_otlp(scope: Option<&InstrumentationScope>) -> Arc<Scope> {
    Arc::new(
        scope
            .map(|s| Scope {
                name: s.name.clone(),
                version: s.version.clone(),
            })
            .unwrap_or_default(),
    )
}

fn scope_to_otlp(scope: &Scope) -> InstrumentationScope {
    InstrumentationScope {
        name: scope.name.clone(),
        version: scope.version.clone(),
        ..Default::default()
    }
}

// ============================================================================
// REQUEST -> MODEL
// ============================================================================

fn optional_span_id(bytes: &[u8], name: &str, field: &'static str) -> Result<Option<SpanId>, ConvertError> {
    if bytes.is_empty() {
        return Ok(None);
    }
    SpanId::from_bytes(bytes)
        .map(Some)
        .ok_or_else(|| ConvertError::InvalidSpanId {
            name: name.to_string(),
            field,
            len: bytes.len(),
        })
}

fn span_from_otlp(span: Span, resource: &Resource, scope: &Arc<Scope>) -> Result<SpanRecord, ConvertError> {
    let trace_id = TraceId::from_bytes(&span.trace_id).ok_or_else(|| ConvertError::InvalidTraceId {
        name: span.name.clone(),
        len: span.trace_id.len(),
    })?;
    let span_id = optional_span_id(&span.span_id, &span.name, "span id")?.ok_or_else(|| {
        ConvertError::InvalidSpanId {
            name: span.name.clone(),
            field: "span id",
            len: 0,
        }
    })?;
    let parent_span_id = optional_span_id(&span.parent_span_id, &span.name, "parent span id")?;

    let status = span
        .status
        .map(|s| SpanStatus {
            code: StatusCode::from_i32(s.code),
            message: s.message,
        })
        .unwrap_or_default();
    let events = span
        .events
        .into_iter()
        .map(|e| SpanEvent {
            attributes: attributes_from_otlp(&e.attributes),
            name: e.name,
            time_unix_nano: e.time_unix_nano,
        })
        .collect();

    Ok(SpanRecord {
        resource: resource.clone(),
        scope: Arc::clone(scope),
        trace_id,
        span_id,
        parent_span_id,
        kind: SpanKind::from_i32(span.kind),
        start_time_unix_nano: span.start_time_unix_nano,
        end_time_unix_nano: span.end_time_unix_nano,
        status,
        attributes: attributes_from_otlp(&span.attributes),
        events,
        name: span.name,
    })
}

/// Convert a trace export request into span items
pub fn spans_from_request(request: ExportTraceServiceRequest) -> Result<Converted, ConvertError> {
    let mut converted = Converted::default();
    for resource_spans in request.resource_spans {
        let resource = resource_from_otlp(resource_spans.resource.as_ref());
        for scope_spans in resource_spans.scope_spans {
            let scope = scope_from_otlp(scope_spans.scope.as_ref());
            for span in scope_spans.spans {
                converted
                    .items
                    .push(SignalItem::Span(span_from_otlp(span, &resource, &scope)?));
            }
        }
    }
    Ok(converted)
}

fn temporality_from_otlp(value: i32) -> Temporality {
    if value == AggregationTemporality::Delta as i32 {
        Temporality::Delta
    } else {
        Temporality::Cumulative
    }
}

fn temporality_to_otlp(temporality: Temporality) -> i32 {
    match temporality {
        Temporality::Delta => AggregationTemporality::Delta as i32,
        Temporality::Cumulative => AggregationTemporality::Cumulative as i32,
    }
}

fn number_value(point: &NumberDataPoint) -> Option<f64> {
    match point.value {
        Some(number_data_point::Value::AsDouble(d)) => Some(d),
        Some(number_data_point::Value::AsInt(i)) => Some(i as f64),
        None => None,
    }
}

/// Convert a metrics export request into one item per data point
pub fn metrics_from_request(request: ExportMetricsServiceRequest) -> Result<Converted, ConvertError> {
    let mut converted = Converted::default();
    for resource_metrics in request.resource_metrics {
        let resource = resource_from_otlp(resource_metrics.resource.as_ref());
        for scope_metrics in resource_metrics.scope_metrics {
            let scope = scope_from_otlp(scope_metrics.scope.as_ref());
            for metric in scope_metrics.metrics {
                if metric.name.is_empty() {
                    return Err(ConvertError::EmptyMetricName);
                }
                let point = |start: u64, time: u64, attributes: &[KeyValue], value: MetricValue| {
                    SignalItem::Metric(MetricPoint {
                        resource: resource.clone(),
                        scope: Arc::clone(&scope),
                        name: metric.name.clone(),
                        description: metric.description.clone(),
                        unit: metric.unit.clone(),
                        start_time_unix_nano: start,
                        time_unix_nano: time,
                        attributes: attributes_from_otlp(attributes),
                        value,
                    })
                };

                match &metric.data {
                    Some(metric::Data::Gauge(gauge)) => {
                        for dp in &gauge.data_points {
                            match number_value(dp) {
                                Some(v) => converted.items.push(point(
                                    dp.start_time_unix_nano,
                                    dp.time_unix_nano,
                                    &dp.attributes,
                                    MetricValue::Gauge(v),
                                )),
                                None => converted.skipped += 1,
                            }
                        }
                    }
                    Some(metric::Data::Sum(sum)) => {
                        let temporality = temporality_from_otlp(sum.aggregation_temporality);
                        for dp in &sum.data_points {
                            match number_value(dp) {
                                Some(value) => converted.items.push(point(
                                    dp.start_time_unix_nano,
                                    dp.time_unix_nano,
                                    &dp.attributes,
                                    MetricValue::Sum {
                                        value,
                                        monotonic: sum.is_monotonic,
                                        temporality,
                                    },
                                )),
                                None => converted.skipped += 1,
                            }
                        }
                    }
                    Some(metric::Data::Histogram(histogram)) => {
                        let temporality = temporality_from_otlp(histogram.aggregation_temporality);
                        for dp in &histogram.data_points {
                            converted.items.push(point(
                                dp.start_time_unix_nano,
                                dp.time_unix_nano,
                                &dp.attributes,
                                MetricValue::Histogram {
                                    count: dp.count,
                                    sum: dp.sum.unwrap_or(0.0),
                                    bounds: dp.explicit_bounds.clone(),
                                    bucket_counts: dp.bucket_counts.clone(),
                                    temporality,
                                },
                            ));
                        }
                    }
                    Some(metric::Data::ExponentialHistogram(histogram)) => {
                        converted.skipped += histogram.data_points.len();
                    }
                    Some(metric::Data::Summary(summary)) => {
                        converted.skipped += summary.data_points.len();
                    }
                    None => {}
                }
            }
        }
    }
    Ok(converted)
}

fn optional_log_id<T>(
    bytes: &[u8],
    field: &'static str,
    parse: impl Fn(&[u8]) -> Option<T>,
) -> Result<Option<T>, ConvertError> {
    if bytes.is_empty() {
        return Ok(None);
    }
    parse(bytes)
        .map(Some)
        .ok_or(ConvertError::InvalidLogContext {
            field,
            len: bytes.len(),
        })
}

/// Convert a logs export request into log items
pub fn logs_from_request(request: ExportLogsServiceRequest) -> Result<Converted, ConvertError> {
    let mut converted = Converted::default();
    for resource_logs in request.resource_logs {
        let resource = resource_from_otlp(resource_logs.resource.as_ref());
        for scope_logs in resource_logs.scope_logs {
            let scope = scope_from_otlp(scope_logs.scope.as_ref());
            for record in scope_logs.log_records {
                let trace_id = optional_log_id(&record.trace_id, "trace id", TraceId::from_bytes)?;
                let span_id = optional_log_id(&record.span_id, "span id", SpanId::from_bytes)?;
                converted.items.push(SignalItem::Log(LogRecord {
                    resource: resource.clone(),
                    scope: Arc::clone(&scope),
                    time_unix_nano: record.time_unix_nano,
                    observed_time_unix_nano: record.observed_time_unix_nano,
                    severity_number: record.severity_number,
                    body: record
                        .body
                        .as_ref()
                        .map(any_value_to_string)
                        .unwrap_or_default(),
                    attributes: attributes_from_otlp(&record.attributes),
                    severity_text: record.severity_text,
                    trace_id,
                    span_id,
                }));
            }
        }
    }
    Ok(converted)
}

// ============================================================================
// MODEL -> REQUEST
// ============================================================================

/// Consecutive items sharing a resource, split further by scope
struct ResourceGroup<'a, T> {
    resource: &'a Resource,
    scopes: Vec<(&'a Arc<Scope>, Vec<&'a T>)>,
}

fn same_resource(a: &Resource, b: &Resource) -> bool {
    a.ptr_eq(b) || a == b
}

fn same_scope(a: &Arc<Scope>, b: &Arc<Scope>) -> bool {
    Arc::ptr_eq(a, b) || a == b
}

fn group_items<'a, T: 'a>(
    items: impl IntoIterator<Item = &'a T>,
    parts: impl Fn(&'a T) -> (&'a Resource, &'a Arc<Scope>),
) -> Vec<ResourceGroup<'a, T>> {
    let mut groups: Vec<ResourceGroup<'a, T>> = Vec::new();
    for item in items {
        let (resource, scope) = parts(item);
        match groups.last_mut() {
            Some(group) if same_resource(group.resource, resource) => {
                match group.scopes.last_mut() {
                    Some((s, members)) if same_scope(s, scope) => members.push(item),
                    _ => group.scopes.push((scope, vec![item])),
                }
            }
            _ => groups.push(ResourceGroup {
                resource,
                scopes: vec![(scope, vec![item])],
            }),
        }
    }
    groups
}

fn span_to_otlp(span: &SpanRecord) -> Span {
    Span {
        trace_id: span.trace_id.as_bytes().to_vec(),
        span_id: span.span_id.as_bytes().to_vec(),
        parent_span_id: span
            .parent_span_id
            .map(|id| id.as_bytes().to_vec())
            .unwrap_or_default(),
        name: span.name.clone(),
        kind: span.kind.as_i32(),
        start_time_unix_nano: span.start_time_unix_nano,
        end_time_unix_nano: span.end_time_unix_nano,
        attributes: attributes_to_otlp(&span.attributes),
        events: span
            .events
            .iter()
            .map(|e| span::Event {
                time_unix_nano: e.time_unix_nano,
                name: e.name.clone(),
                attributes: attributes_to_otlp(&e.attributes),
                ..Default::default()
            })
            .collect(),
        status: Some(Status {
            message: span.status.message.clone(),
            code: span.status.code.as_i32(),
        }),
        ..Default::default()
    }
}

/// Build a trace export request from the span items of a batch
pub fn traces_request(items: &[SignalItem]) -> ExportTraceServiceRequest {
    let spans = items.iter().filter_map(|i| match i {
        SignalItem::Span(s) => Some(s),
        _ => None,
    });
    let resource_spans = group_items(spans, |s| (&s.resource, &s.scope))
        .into_iter()
        .map(|group| ResourceSpans {
            resource: Some(resource_to_otlp(group.resource)),
            scope_spans: group
                .scopes
                .into_iter()
                .map(|(scope, spans)| ScopeSpans {
                    scope: Some(scope_to_otlp(scope)),
                    spans: spans.into_iter().map(span_to_otlp).collect(),
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        })
        .collect();
    ExportTraceServiceRequest { resource_spans }
}

fn number_point(point: &MetricPoint, value: f64) -> NumberDataPoint {
    NumberDataPoint {
        attributes: attributes_to_otlp(&point.attributes),
        start_time_unix_nano: point.start_time_unix_nano,
        time_unix_nano: point.time_unix_nano,
        value: Some(number_data_point::Value::AsDouble(value)),
        ..Default::default()
    }
}

/// Append `point` to `metrics`, merging into the previous metric when compatible
fn push_metric_point(metrics: &mut Vec<Metric>, point: &MetricPoint) {
    if let Some(last) = metrics.last_mut()
        && last.name == point.name
        && last.unit == point.unit
    {
        let merged = match (&mut last.data, &point.value) {
            (Some(metric::Data::Gauge(g)), MetricValue::Gauge(v)) => {
                g.data_points.push(number_point(point, *v));
                true
            }
            (
                Some(metric::Data::Sum(s)),
                MetricValue::Sum {
                    value,
                    monotonic,
                    temporality,
                },
            ) if s.is_monotonic == *monotonic
                && s.aggregation_temporality == temporality_to_otlp(*temporality) =>
            {
                s.data_points.push(number_point(point, *value));
                true
            }
            (
                Some(metric::Data::Histogram(h)),
                MetricValue::Histogram { temporality, .. },
            ) if h.aggregation_temporality == temporality_to_otlp(*temporality) => {
                if let Some(dp) = histogram_point(point) {
                    h.data_points.push(dp);
                }
                true
            }
            _ => false,
        };
        if merged {
            return;
        }
    }

    let data = match &point.value {
        MetricValue::Gauge(v) => metric::Data::Gauge(Gauge {
            data_points: vec![number_point(point, *v)],
        }),
        MetricValue::Sum {
            value,
            monotonic,
            temporality,
        } => metric::Data::Sum(Sum {
            data_points: vec![number_point(point, *value)],
            aggregation_temporality: temporality_to_otlp(*temporality),
            is_monotonic: *monotonic,
        }),
        MetricValue::Histogram { temporality, .. } => metric::Data::Histogram(Histogram {
            data_points: histogram_point(point).into_iter().collect(),
            aggregation_temporality: temporality_to_otlp(*temporality),
        }),
    };
    metrics.push(Metric {
        name: point.name.clone(),
        description: point.description.clone(),
        unit: point.unit.clone(),
        data: Some(data),
        ..Default::default()
    });
}

fn histogram_point(point: &MetricPoint) -> Option<HistogramDataPoint> {
    let MetricValue::Histogram {
        count,
        sum,
        bounds,
        bucket_counts,
        ..
    } = &point.value
    else {
        return None;
    };
    Some(HistogramDataPoint {
        attributes: attributes_to_otlp(&point.attributes),
        start_time_unix_nano: point.start_time_unix_nano,
        time_unix_nano: point.time_unix_nano,
        count: *count,
        sum: Some(*sum),
        bucket_counts: bucket_counts.clone(),
        explicit_bounds: bounds.clone(),
        ..Default::default()
    })
}

/// Build a metrics export request from the metric items of a batch
pub fn metrics_request(items: &[SignalItem]) -> ExportMetricsServiceRequest {
    let points = items.iter().filter_map(|i| match i {
        SignalItem::Metric(m) => Some(m),
        _ => None,
    });
    let resource_metrics = group_items(points, |m| (&m.resource, &m.scope))
        .into_iter()
        .map(|group| ResourceMetrics {
            resource: Some(resource_to_otlp(group.resource)),
            scope_metrics: group
                .scopes
                .into_iter()
                .map(|(scope, points)| {
                    let mut metrics = Vec::new();
                    for point in points {
                        push_metric_point(&mut metrics, point);
                    }
                    ScopeMetrics {
                        scope: Some(scope_to_otlp(scope)),
                        metrics,
                        ..Default::default()
                    }
                })
                .collect(),
            ..Default::default()
        })
        .collect();
    ExportMetricsServiceRequest { resource_metrics }
}

fn log_to_otlp(record: &LogRecord) -> OtlpLogRecord {
    OtlpLogRecord {
        time_unix_nano: record.time_unix_nano,
        observed_time_unix_nano: record.observed_time_unix_nano,
        severity_number: record.severity_number,
        severity_text: record.severity_text.clone(),
        body: Some(string_value(&record.body)),
        attributes: attributes_to_otlp(&record.attributes),
        trace_id: record
            .trace_id
            .map(|id| id.as_bytes().to_vec())
            .unwrap_or_default(),
        span_id: record
            .span_id
            .map(|id| id.as_bytes().to_vec())
            .unwrap_or_default(),
        ..Default::default()
    }
}

/// Build a logs export request from the log items of a batch
pub fn logs_request(items: &[SignalItem]) -> ExportLogsServiceRequest {
    let records = items.iter().filter_map(|i| match i {
        SignalItem::Log(l) => Some(l),
        _ => None,
    });
    let resource_logs = group_items(records, |l| (&l.resource, &l.scope))
        .into_iter()
        .map(|group| ResourceLogs {
            resource: Some(resource_to_otlp(group.resource)),
            scope_logs: group
                .scopes
                .into_iter()
                .map(|(scope, records)| ScopeLogs {
                    scope: Some(scope_to_otlp(scope)),
                    log_records: records.into_iter().map(log_to_otlp).collect(),
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        })
        .collect();
    ExportLogsServiceRequest { resource_logs }
}

#[cfg(test)]
pub(crate) mod fixtures {
    //! Requests shaped like the ones an instrumented web service sends

    use super::*;

    pub fn kv(key: &str, value: &str) -> KeyValue {
        KeyValue {
            key: key.to_string(),
            value: Some(string_value(value)),
        }
    }

    pub fn service_resource() -> OtlpResource {
        OtlpResource {
            attributes: vec![
                kv("service.name", "python-otel-app"),
                kv("service.version", "1.0.0"),
                kv("service.instance.id", "host-1"),
            ],
            ..Default::default()
        }
    }

    pub fn trace_request(span_names: &[&str]) -> ExportTraceServiceRequest {
        ExportTraceServiceRequest {
            resource_spans: vec![ResourceSpans {
                resource: Some(service_resource()),
                scope_spans: vec![ScopeSpans {
                    scope: Some(InstrumentationScope {
                        name: "app".to_string(),
                        ..Default::default()
                    }),
                    spans: span_names
                        .iter()
                        .enumerate()
                        .map(|(i, name)| Span {
                            trace_id: vec![1; 16],
                            span_id: vec![i as u8 + 1; 8],
                            name: name.to_string(),
                            kind: 2,
                            start_time_unix_nano: 1_700_000_000_000_000_000,
                            end_time_unix_nano: 1_700_000_000_250_000_000,
                            attributes: vec![kv("http.route", "/users/{id}")],
                            status: Some(Status {
                                message: String::new(),
                                code: 1,
                            }),
                            ..Default::default()
                        })
                        .collect(),
                    ..Default::default()
                }],
                ..Default::default()
            }],
        }
    }

    pub fn metrics_request_fixture() -> ExportMetricsServiceRequest {
        ExportMetricsServiceRequest {
            resource_metrics: vec![ResourceMetrics {
                resource: Some(service_resource()),
                scope_metrics: vec![ScopeMetrics {
                    metrics: vec![
                        Metric {
                            name: "http_requests_custom_total".to_string(),
                            description: "Total HTTP requests".to_string(),
                            data: Some(metric::Data::Sum(Sum {
                                data_points: vec![NumberDataPoint {
                                    attributes: vec![kv("method", "GET"), kv("endpoint", "/users")],
                                    time_unix_nano: 1_700_000_000_000_000_000,
                                    value: Some(number_data_point::Value::AsInt(7)),
                                    ..Default::default()
                                }],
                                aggregation_temporality: AggregationTemporality::Cumulative as i32,
                                is_monotonic: true,
                            })),
                            ..Default::default()
                        },
                        Metric {
                            name: "http_request_duration_seconds".to_string(),
                            unit: "s".to_string(),
                            data: Some(metric::Data::Histogram(Histogram {
                                data_points: vec![HistogramDataPoint {
                                    attributes: vec![kv("method", "GET")],
                                    time_unix_nano: 1_700_000_000_000_000_000,
                                    count: 3,
                                    sum: Some(0.35),
                                    bucket_counts: vec![1, 2, 0],
                                    explicit_bounds: vec![0.1, 0.5],
                                    ..Default::default()
                                }],
                                aggregation_temporality: AggregationTemporality::Cumulative as i32,
                            })),
                            ..Default::default()
                        },
                        Metric {
                            name: "active_requests_current".to_string(),
                            data: Some(metric::Data::Gauge(Gauge {
                                data_points: vec![NumberDataPoint {
                                    value: Some(number_data_point::Value::AsDouble(2.0)),
                                    ..Default::default()
                                }],
                            })),
                            ..Default::default()
                        },
                    ],
                    ..Default::default()
                }],
                ..Default::default()
            }],
        }
    }

    pub fn logs_request_fixture(bodies: &[(i32, &str)]) -> ExportLogsServiceRequest {
        ExportLogsServiceRequest {
            resource_logs: vec![ResourceLogs {
                resource: Some(service_resource()),
                scope_logs: vec![ScopeLogs {
                    log_records: bodies
                        .iter()
                        .map(|(severity, body)| OtlpLogRecord {
                            time_unix_nano: 1_700_000_000_000_000_000,
                            severity_number: *severity,
                            severity_text: if *severity >= 17 { "ERROR" } else { "INFO" }
                                .to_string(),
                            body: Some(string_value(body)),
                            attributes: vec![kv("endpoint", "/orders")],
                            trace_id: vec![0xab; 16],
                            span_id: vec![0xcd; 8],
                            ..Default::default()
                        })
                        .collect(),
                    ..Default::default()
                }],
                ..Default::default()
            }],
        }
    }
}
