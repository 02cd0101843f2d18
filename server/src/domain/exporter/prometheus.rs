//! `prometheus` exporter: pull-based metrics endpoint
//!
//! Metric points are folded into an in-memory aggregate keyed by family name
//! and label set, then rendered in the Prometheus text exposition format on
//! every scrape of `GET /metrics`.

use std::collections::BTreeMap;
use std::fmt::Write;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use axum::Router;
use axum::extract::State;
use axum::http::header;
use axum::response::IntoResponse;
use axum::routing::get;
use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::core::config::PrometheusExporterConfig;
use crate::core::constants::PROMETHEUS_CONTENT_TYPE;
use crate::domain::signal::{Batch, MetricPoint, MetricValue, SignalItem, Temporality};
use crate::domain::stats::ExporterStats;
use crate::utils::otlp::keys;

use super::Exporter;

type Labels = BTreeMap<String, String>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FamilyKind {
    Gauge,
    Counter,
    Histogram,
}

impl FamilyKind {
    fn as_str(&self) -> &'static str {
        match self {
            FamilyKind::Gauge => "gauge",
            FamilyKind::Counter => "counter",
            FamilyKind::Histogram => "histogram",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum SeriesValue {
    Number(f64),
    Histogram {
        bounds: Vec<f64>,
        bucket_counts: Vec<u64>,
        count: u64,
        sum: f64,
    },
}

struct Series {
    value: SeriesValue,
    updated: Instant,
}

struct Family {
    kind: FamilyKind,
    help: String,
    series: BTreeMap<Labels, Series>,
}

// ============================================================================
// NAMING
// ============================================================================

/// Metric names allow `[a-zA-Z0-9_:]` and must not start with a digit
fn sanitize_metric_name(name: &str) -> String {
    let mut out: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == ':' { c } else { '_' })
        .collect();
    if out.is_empty() || out.starts_with(|c: char| c.is_ascii_digit()) {
        out.insert(0, '_');
    }
    out
}

/// Label names allow `[a-zA-Z0-9_]` and must not start with a digit
fn sanitize_label_name(name: &str) -> String {
    let mut out: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect();
    if out.is_empty() || out.starts_with(|c: char| c.is_ascii_digit()) {
        out.insert(0, '_');
    }
    out
}

fn unit_word(unit: &str) -> Option<&'static str> {
    Some(match unit {
        "d" => "days",
        "h" => "hours",
        "min" => "minutes",
        "s" => "seconds",
        "ms" => "milliseconds",
        "us" => "microseconds",
        "ns" => "nanoseconds",
        "By" => "bytes",
        "KiBy" => "kibibytes",
        "MiBy" => "mebibytes",
        "GiBy" => "gibibytes",
        "KBy" => "kilobytes",
        "MBy" => "megabytes",
        "GBy" => "gigabytes",
        "m" => "meters",
        "V" => "volts",
        "A" => "amperes",
        "J" => "joules",
        "W" => "watts",
        "g" => "grams",
        "Cel" => "celsius",
        "Hz" => "hertz",
        "%" => "percent",
        _ => return None,
    })
}

fn per_unit_word(unit: &str) -> Option<&'static str> {
    Some(match unit {
        "s" => "second",
        "min" => "minute",
        "h" => "hour",
        "d" => "day",
        "w" => "week",
        "mo" => "month",
        "y" => "year",
        _ => return None,
    })
}

/// Name suffix for a UCUM unit; annotations (`{requests}`) and `1` add nothing
fn unit_suffix(unit: &str) -> Option<String> {
    let mut stripped = String::with_capacity(unit.len());
    let mut depth = 0usize;
    for c in unit.chars() {
        match c {
            '{' => depth += 1,
            '}' => depth = depth.saturating_sub(1),
            _ if depth == 0 => stripped.push(c),
            _ => {}
        }
    }
    let unit = stripped.trim();
    if unit.is_empty() || unit == "1" {
        return None;
    }

    let word = |u: &str| unit_word(u).map(String::from).unwrap_or_else(|| sanitize_label_name(u));
    match unit.split_once('/') {
        Some((main, per)) => {
            let per = per_unit_word(per)
                .map(String::from)
                .unwrap_or_else(|| sanitize_label_name(per));
            if main.is_empty() || main == "1" {
                Some(format!("per_{}", per))
            } else {
                Some(format!("{}_per_{}", word(main), per))
            }
        }
        None => Some(word(unit)),
    }
}

fn family_kind(value: &MetricValue) -> FamilyKind {
    match value {
        MetricValue::Gauge(_) => FamilyKind::Gauge,
        MetricValue::Sum { monotonic: true, .. } => FamilyKind::Counter,
        MetricValue::Sum { .. } => FamilyKind::Gauge,
        MetricValue::Histogram { .. } => FamilyKind::Histogram,
    }
}

fn family_name(namespace: Option<&str>, point: &MetricPoint, kind: FamilyKind) -> String {
    let mut name = sanitize_metric_name(&point.name);
    if kind == FamilyKind::Counter && name.ends_with("_total") {
        name.truncate(name.len() - "_total".len());
    }
    if let Some(suffix) = unit_suffix(&point.unit)
        && !name.ends_with(&format!("_{}", suffix))
    {
        name.push('_');
        name.push_str(&suffix);
    }
    if kind == FamilyKind::Counter {
        name.push_str("_total");
    }
    match namespace {
        Some(ns) if !ns.is_empty() => format!("{}_{}", sanitize_metric_name(ns), name),
        _ => name,
    }
}

// ============================================================================
// RENDERING
// ============================================================================

fn format_value(v: f64) -> String {
    if v.is_nan() {
        "NaN".to_string()
    } else if v.is_infinite() {
        if v > 0.0 { "+Inf" } else { "-Inf" }.to_string()
    } else {
        v.to_string()
    }
}

fn escape_label_value(v: &str) -> String {
    v.replace('\\', r"\\")
        .replace('"', "\\\"")
        .replace('\n', r"\n")
}

fn escape_help(v: &str) -> String {
    v.replace('\\', r"\\").replace('\n', r"\n")
}

fn format_labels(labels: &Labels, le: Option<&str>) -> String {
    if labels.is_empty() && le.is_none() {
        return String::new();
    }
    let mut parts: Vec<String> = labels
        .iter()
        .map(|(k, v)| format!("{}=\"{}\"", k, escape_label_value(v)))
        .collect();
    if let Some(le) = le {
        parts.push(format!("le=\"{}\"", le));
    }
    format!("{{{}}}", parts.join(","))
}

// ============================================================================
// STORE
// ============================================================================

/// Aggregated metric state served to scrapers
pub struct MetricStore {
    namespace: Option<String>,
    const_labels: Labels,
    resource_labels: bool,
    expiration: Duration,
    families: Mutex<BTreeMap<String, Family>>,
}

impl MetricStore {
    pub fn new(config: &PrometheusExporterConfig) -> Self {
        Self {
            namespace: config.namespace.clone(),
            const_labels: config
                .const_labels
                .iter()
                .map(|(k, v)| (sanitize_label_name(k), v.clone()))
                .collect(),
            resource_labels: config.resource_to_telemetry_conversion.enabled,
            expiration: Duration::from_millis(config.metric_expiration_ms),
            families: Mutex::new(BTreeMap::new()),
        }
    }

    fn labels(&self, point: &MetricPoint) -> Labels {
        let mut labels = Labels::new();
        let resource = &point.resource;

        // resource identity only reaches series under resource_to_telemetry_conversion
        if self.resource_labels {
            for (k, v) in resource.attributes() {
                labels.insert(sanitize_label_name(k), v.to_string());
            }
            if let Some(name) = resource.get(keys::SERVICE_NAME) {
                let job = match resource.get(keys::SERVICE_NAMESPACE) {
                    Some(ns) => format!("{}/{}", ns, name),
                    None => name.to_string(),
                };
                labels.insert("job".into(), job);
            }
            if let Some(instance) = resource.get(keys::SERVICE_INSTANCE_ID) {
                labels.insert("instance".into(), instance.to_string());
            }
        }
        for (k, v) in &point.attributes {
            labels.insert(sanitize_label_name(k), v.to_string());
        }
        for (k, v) in &self.const_labels {
            labels.insert(k.clone(), v.clone());
        }
        labels
    }

    /// Fold one point into the aggregate. Returns false when the point
    /// conflicts with the type of an existing family.
    pub fn update(&self, point: &MetricPoint) -> bool {
        let kind = family_kind(&point.value);
        let name = family_name(self.namespace.as_deref(), point, kind);
        let labels = self.labels(point);
        let now = Instant::now();

        let mut families = self.families.lock();
        let family = families.entry(name).or_insert_with(|| Family {
            kind,
            help: point.description.clone(),
            series: BTreeMap::new(),
        });
        if family.kind != kind {
            tracing::debug!(
                metric = %point.name,
                existing = family.kind.as_str(),
                incoming = kind.as_str(),
                "Metric type conflict, point ignored"
            );
            return false;
        }
        if !point.description.is_empty() {
            family.help.clone_from(&point.description);
        }

        let previous = family.series.get(&labels).map(|s| &s.value);
        let value = match &point.value {
            MetricValue::Gauge(v) => SeriesValue::Number(*v),
            MetricValue::Sum {
                value,
                temporality: Temporality::Cumulative,
                ..
            } => SeriesValue::Number(*value),
            MetricValue::Sum {
                value,
                temporality: Temporality::Delta,
                ..
            } => match previous {
                Some(SeriesValue::Number(prev)) => SeriesValue::Number(prev + value),
                _ => SeriesValue::Number(*value),
            },
            MetricValue::Histogram {
                count,
                sum,
                bounds,
                bucket_counts,
                temporality,
            } => match (temporality, previous) {
                (
                    Temporality::Delta,
                    Some(SeriesValue::Histogram {
                        bounds: prev_bounds,
                        bucket_counts: prev_counts,
                        count: prev_count,
                        sum: prev_sum,
                    }),
                ) if prev_bounds == bounds && prev_counts.len() == bucket_counts.len() => {
                    SeriesValue::Histogram {
                        bounds: bounds.clone(),
                        bucket_counts: prev_counts
                            .iter()
                            .zip(bucket_counts)
                            .map(|(a, b)| a + b)
                            .collect(),
                        count: prev_count + count,
                        sum: prev_sum + sum,
                    }
                }
                _ => SeriesValue::Histogram {
                    bounds: bounds.clone(),
                    bucket_counts: bucket_counts.clone(),
                    count: *count,
                    sum: *sum,
                },
            },
        };
        family.series.insert(
            labels,
            Series {
                value,
                updated: now,
            },
        );
        true
    }

    /// Evict expired series, then render the rest
    pub fn render(&self) -> String {
        let now = Instant::now();
        let mut families = self.families.lock();
        families.retain(|_, family| {
            family
                .series
                .retain(|_, s| now.duration_since(s.updated) <= self.expiration);
            !family.series.is_empty()
        });

        let mut out = String::with_capacity(4096);
        for (name, family) in families.iter() {
            if !family.help.is_empty() {
                let _ = writeln!(out, "# HELP {} {}", name, escape_help(&family.help));
            }
            let _ = writeln!(out, "# TYPE {} {}", name, family.kind.as_str());

            for (labels, series) in &family.series {
                match &series.value {
                    SeriesValue::Number(v) => {
                        let _ = writeln!(out, "{}{} {}", name, format_labels(labels, None), format_value(*v));
                    }
                    SeriesValue::Histogram {
                        bounds,
                        bucket_counts,
                        count,
                        sum,
                    } => {
                        let mut cumulative = 0u64;
                        for (i, bound) in bounds.iter().enumerate() {
                            cumulative += bucket_counts.get(i).copied().unwrap_or(0);
                            let _ = writeln!(
                                out,
                                "{}_bucket{} {}",
                                name,
                                format_labels(labels, Some(&format_value(*bound))),
                                cumulative
                            );
                        }
                        let _ = writeln!(
                            out,
                            "{}_bucket{} {}",
                            name,
                            format_labels(labels, Some("+Inf")),
                            count
                        );
                        let _ = writeln!(out, "{}_sum{} {}", name, format_labels(labels, None), format_value(*sum));
                        let _ = writeln!(out, "{}_count{} {}", name, format_labels(labels, None), count);
                    }
                }
            }
        }
        out
    }
}

// ============================================================================
// EXPORTER
// ============================================================================

async fn scrape(State(store): State<Arc<MetricStore>>) -> impl IntoResponse {
    ([(header::CONTENT_TYPE, PROMETHEUS_CONTENT_TYPE)], store.render())
}

pub struct PrometheusExporter {
    name: String,
    store: Arc<MetricStore>,
    local_addr: SocketAddr,
    stop: watch::Sender<bool>,
    server: Mutex<Option<JoinHandle<()>>>,
    stats: Arc<ExporterStats>,
}

impl PrometheusExporter {
    /// Bind the scrape endpoint and start serving
    pub async fn start(
        name: String,
        config: &PrometheusExporterConfig,
        stats: Arc<ExporterStats>,
    ) -> Result<Self> {
        let store = Arc::new(MetricStore::new(config));
        let listener = TcpListener::bind(config.endpoint)
            .await
            .with_context(|| format!("Failed to bind exporter '{}' on {}", name, config.endpoint))?;
        let local_addr = listener.local_addr()?;

        let (stop, mut stop_rx) = watch::channel(false);
        let router = Router::new()
            .route("/metrics", get(scrape))
            .with_state(Arc::clone(&store));
        let server_name = name.clone();
        let server = tokio::spawn(async move {
            let result = axum::serve(listener, router)
                .with_graceful_shutdown(async move {
                    let _ = stop_rx.wait_for(|&v| v).await;
                })
                .await;
            if let Err(e) = result {
                tracing::error!(exporter = %server_name, error = %e, "Scrape server error");
            }
        });

        tracing::info!(exporter = %name, addr = %local_addr, "Prometheus endpoint listening");
        Ok(Self {
            name,
            store,
            local_addr,
            stop,
            server: Mutex::new(Some(server)),
            stats,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

#[async_trait]
impl Exporter for PrometheusExporter {
    fn name(&self) -> &str {
        &self.name
    }

    fn consume(&self, batch: Arc<Batch>) {
        let mut conflicts = 0;
        for item in batch.items() {
            if let SignalItem::Metric(point) = item
                && !self.store.update(point)
            {
                conflicts += 1;
            }
        }
        if conflicts > 0 {
            self.stats.record_failed(conflicts);
        }
        self.stats.record_sent(batch.len() - conflicts);
    }

    async fn shutdown(&self, grace: Duration) {
        self.stop.send_replace(true);
        let Some(mut server) = self.server.lock().take() else {
            return;
        };
        if tokio::time::timeout(grace, &mut server).await.is_err() {
            server.abort();
        }
    }
}
