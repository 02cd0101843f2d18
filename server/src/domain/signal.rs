//! Signal model
//!
//! Typed in-memory representation of metric points, log records and spans,
//! plus the sealed [`Batch`] they are exported in. Resource and scope data is
//! reference-counted so every item decoded from the same OTLP resource block
//! shares one mapping.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Fixed per-item overhead used by size estimates
const ITEM_OVERHEAD_BYTES: usize = 96;

/// One of the three telemetry signal types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalType {
    Metrics,
    Traces,
    Logs,
}

impl SignalType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalType::Metrics => "metrics",
            SignalType::Traces => "traces",
            SignalType::Logs => "logs",
        }
    }
}

impl fmt::Display for SignalType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SignalType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "metrics" => Ok(SignalType::Metrics),
            "traces" => Ok(SignalType::Traces),
            "logs" => Ok(SignalType::Logs),
            other => Err(format!(
                "unknown signal type '{}' (expected metrics, traces or logs)",
                other
            )),
        }
    }
}

/// Attribute value
///
/// Deserializes untagged so configuration can carry plain JSON scalars.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttrValue {
    String(String),
    Int(i64),
    Double(f64),
    Bool(bool),
}

impl AttrValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            AttrValue::String(s) => Some(s),
            _ => None,
        }
    }

    fn size_bytes(&self) -> usize {
        match self {
            AttrValue::String(s) => s.len(),
            _ => 8,
        }
    }
}

impl fmt::Display for AttrValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttrValue::String(s) => f.write_str(s),
            AttrValue::Int(i) => write!(f, "{}", i),
            AttrValue::Double(d) => write!(f, "{}", d),
            AttrValue::Bool(b) => write!(f, "{}", b),
        }
    }
}

impl From<&str> for AttrValue {
    fn from(value: &str) -> Self {
        AttrValue::String(value.to_string())
    }
}

impl From<String> for AttrValue {
    fn from(value: String) -> Self {
        AttrValue::String(value)
    }
}

impl From<i64> for AttrValue {
    fn from(value: i64) -> Self {
        AttrValue::Int(value)
    }
}

impl From<f64> for AttrValue {
    fn from(value: f64) -> Self {
        AttrValue::Double(value)
    }
}

impl From<bool> for AttrValue {
    fn from(value: bool) -> Self {
        AttrValue::Bool(value)
    }
}

/// Ordered attribute map; ordering gives label sets a canonical identity
pub type Attributes = BTreeMap<String, AttrValue>;

fn attributes_size(attrs: &Attributes) -> usize {
    attrs.iter().map(|(k, v)| k.len() + v.size_bytes()).sum()
}

/// Shared, immutable resource attributes
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Resource {
    attrs: Arc<Attributes>,
}

impl Resource {
    pub fn new(attrs: Attributes) -> Self {
        Self {
            attrs: Arc::new(attrs),
        }
    }

    pub fn attributes(&self) -> &Attributes {
        &self.attrs
    }

    pub fn get(&self, key: &str) -> Option<&AttrValue> {
        self.attrs.get(key)
    }

    /// True when both handles point at the same shared mapping
    pub fn ptr_eq(&self, other: &Resource) -> bool {
        Arc::ptr_eq(&self.attrs, &other.attrs)
    }

    /// Apply `edit` to a copy of the attributes.
    ///
    /// Returns the same shared mapping when the edit changes nothing.
    pub fn modified<E>(
        &self,
        edit: impl FnOnce(&mut Attributes) -> Result<(), E>,
    ) -> Result<Resource, E> {
        let mut next = (*self.attrs).clone();
        edit(&mut next)?;
        if next == *self.attrs {
            Ok(self.clone())
        } else {
            Ok(Resource::new(next))
        }
    }

    pub fn size_bytes(&self) -> usize {
        attributes_size(&self.attrs)
    }
}

/// Instrumentation scope
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Scope {
    pub name: String,
    pub version: String,
}

/// Aggregation temporality of sums and histograms
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Temporality {
    Delta,
    Cumulative,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MetricValue {
    Gauge(f64),
    Sum {
        value: f64,
        monotonic: bool,
        temporality: Temporality,
    },
    Histogram {
        count: u64,
        sum: f64,
        bounds: Vec<f64>,
        bucket_counts: Vec<u64>,
        temporality: Temporality,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct MetricPoint {
    pub resource: Resource,
    pub scope: Arc<Scope>,
    pub name: String,
    pub description: String,
    pub unit: String,
    pub start_time_unix_nano: u64,
    pub time_unix_nano: u64,
    pub attributes: Attributes,
    pub value: MetricValue,
}

/// 16-byte trace identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TraceId([u8; 16]);

impl TraceId {
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        bytes.try_into().ok().map(TraceId)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl fmt::Display for TraceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

/// 8-byte span identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SpanId([u8; 8]);

impl SpanId {
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        bytes.try_into().ok().map(SpanId)
    }

    pub fn as_bytes(&self) -> &[u8; 8] {
        &self.0
    }
}

impl fmt::Display for SpanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LogRecord {
    pub resource: Resource,
    pub scope: Arc<Scope>,
    pub time_unix_nano: u64,
    pub observed_time_unix_nano: u64,
    pub severity_number: i32,
    pub severity_text: String,
    pub body: String,
    pub attributes: Attributes,
    pub trace_id: Option<TraceId>,
    pub span_id: Option<SpanId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpanKind {
    Unspecified,
    Internal,
    Server,
    Client,
    Producer,
    Consumer,
}

impl SpanKind {
    pub fn from_i32(value: i32) -> Self {
        match value {
            1 => SpanKind::Internal,
            2 => SpanKind::Server,
            3 => SpanKind::Client,
            4 => SpanKind::Producer,
            5 => SpanKind::Consumer,
            _ => SpanKind::Unspecified,
        }
    }

    pub fn as_i32(&self) -> i32 {
        match self {
            SpanKind::Unspecified => 0,
            SpanKind::Internal => 1,
            SpanKind::Server => 2,
            SpanKind::Client => 3,
            SpanKind::Producer => 4,
            SpanKind::Consumer => 5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StatusCode {
    #[default]
    Unset,
    Ok,
    Error,
}

impl StatusCode {
    pub fn from_i32(value: i32) -> Self {
        match value {
            1 => StatusCode::Ok,
            2 => StatusCode::Error,
            _ => StatusCode::Unset,
        }
    }

    pub fn as_i32(&self) -> i32 {
        match self {
            StatusCode::Unset => 0,
            StatusCode::Ok => 1,
            StatusCode::Error => 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct SpanStatus {
    pub code: StatusCode,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SpanEvent {
    pub name: String,
    pub time_unix_nano: u64,
    pub attributes: Attributes,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SpanRecord {
    pub resource: Resource,
    pub scope: Arc<Scope>,
    pub trace_id: TraceId,
    pub span_id: SpanId,
    pub parent_span_id: Option<SpanId>,
    pub name: String,
    pub kind: SpanKind,
    pub start_time_unix_nano: u64,
    pub end_time_unix_nano: u64,
    pub status: SpanStatus,
    pub attributes: Attributes,
    pub events: Vec<SpanEvent>,
}

/// A single unit of telemetry flowing through a pipeline
#[derive(Debug, Clone, PartialEq)]
pub enum SignalItem {
    Metric(MetricPoint),
    Log(LogRecord),
    Span(SpanRecord),
}

impl SignalItem {
    pub fn signal_type(&self) -> SignalType {
        match self {
            SignalItem::Metric(_) => SignalType::Metrics,
            SignalItem::Log(_) => SignalType::Logs,
            SignalItem::Span(_) => SignalType::Traces,
        }
    }

    pub fn resource(&self) -> &Resource {
        match self {
            SignalItem::Metric(m) => &m.resource,
            SignalItem::Log(l) => &l.resource,
            SignalItem::Span(s) => &s.resource,
        }
    }

    pub fn set_resource(&mut self, resource: Resource) {
        match self {
            SignalItem::Metric(m) => m.resource = resource,
            SignalItem::Log(l) => l.resource = resource,
            SignalItem::Span(s) => s.resource = resource,
        }
    }

    pub fn attributes(&self) -> &Attributes {
        match self {
            SignalItem::Metric(m) => &m.attributes,
            SignalItem::Log(l) => &l.attributes,
            SignalItem::Span(s) => &s.attributes,
        }
    }

    pub fn attributes_mut(&mut self) -> &mut Attributes {
        match self {
            SignalItem::Metric(m) => &mut m.attributes,
            SignalItem::Log(l) => &mut l.attributes,
            SignalItem::Span(s) => &mut s.attributes,
        }
    }

    /// Estimated in-memory size, excluding the shared resource
    pub fn size_bytes(&self) -> usize {
        let variable = match self {
            SignalItem::Metric(m) => {
                let value = match &m.value {
                    MetricValue::Histogram {
                        bounds,
                        bucket_counts,
                        ..
                    } => (bounds.len() + bucket_counts.len()) * 8,
                    _ => 16,
                };
                m.name.len() + m.description.len() + m.unit.len() + value
            }
            SignalItem::Log(l) => l.body.len() + l.severity_text.len() + 24,
            SignalItem::Span(s) => {
                let events: usize = s
                    .events
                    .iter()
                    .map(|e| e.name.len() + 8 + attributes_size(&e.attributes))
                    .sum();
                s.name.len() + s.status.message.len() + 48 + events
            }
        };
        ITEM_OVERHEAD_BYTES + variable + attributes_size(self.attributes())
    }
}

/// A sealed, immutable group of items of one signal type
#[derive(Debug)]
pub struct Batch {
    signal: SignalType,
    sequence: u64,
    items: Vec<SignalItem>,
    size_bytes: usize,
}

impl Batch {
    /// Seal `items` into a batch. Only the batcher seals.
    pub(crate) fn seal(
        signal: SignalType,
        sequence: u64,
        items: Vec<SignalItem>,
        size_bytes: usize,
    ) -> Self {
        debug_assert!(items.iter().all(|i| i.signal_type() == signal));
        Self {
            signal,
            sequence,
            items,
            size_bytes,
        }
    }

    pub fn signal(&self) -> SignalType {
        self.signal
    }

    /// Position of this batch in its pipeline's output order
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn items(&self) -> &[SignalItem] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn size_bytes(&self) -> usize {
        self.size_bytes
    }
}
