use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use regex::Regex;
use serde::Deserialize;
use serde::de::DeserializeOwned;

use crate::domain::signal::{AttrValue, SignalType};

use super::cli::CliConfig;
use super::constants::{
    CONFIG_FILE_NAME, DEFAULT_BATCH_SEND_SIZE, DEFAULT_BATCH_TIMEOUT_MS, DEFAULT_EXPORT_QUEUE_SIZE,
    DEFAULT_EXPORT_TIMEOUT_MS, DEFAULT_HEALTH_CHECK_PATH, DEFAULT_HEALTH_CHECK_PORT,
    DEFAULT_LISTEN_IP, DEFAULT_MEMORY_CHECK_INTERVAL_MS, DEFAULT_METRIC_EXPIRATION_MS,
    DEFAULT_OTLP_GRPC_PORT, DEFAULT_OTLP_HTTP_PORT, DEFAULT_RETRY_INITIAL_INTERVAL_MS,
    DEFAULT_RETRY_MAX_ATTEMPTS, DEFAULT_RETRY_MAX_INTERVAL_MS, DEFAULT_SHUTDOWN_GRACE_MS,
    DEFAULT_SPIKE_LIMIT_PERCENT, MIB,
};

// =============================================================================
// Component Identifiers
// =============================================================================

/// Component identifier of the form `type[/name]`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ComponentId {
    kind: String,
    name: Option<String>,
}

impl ComponentId {
    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }
}

impl FromStr for ComponentId {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let (kind, name) = match s.split_once('/') {
            Some((kind, name)) => (kind, Some(name)),
            None => (s, None),
        };
        if kind.is_empty() || name.is_some_and(str::is_empty) {
            anyhow::bail!("Configuration error: invalid component id '{}'", s);
        }
        Ok(Self {
            kind: kind.to_string(),
            name: name.map(str::to_string),
        })
    }
}

impl fmt::Display for ComponentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => write!(f, "{}/{}", self.kind, name),
            None => f.write_str(&self.kind),
        }
    }
}

fn default_addr(port: u16) -> SocketAddr {
    SocketAddr::from((DEFAULT_LISTEN_IP, port))
}

// =============================================================================
// Receivers
// =============================================================================

fn default_grpc_endpoint() -> SocketAddr {
    default_addr(DEFAULT_OTLP_GRPC_PORT)
}

fn default_http_endpoint() -> SocketAddr {
    default_addr(DEFAULT_OTLP_HTTP_PORT)
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GrpcProtocolConfig {
    #[serde(default = "default_grpc_endpoint")]
    pub endpoint: SocketAddr,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HttpProtocolConfig {
    #[serde(default = "default_http_endpoint")]
    pub endpoint: SocketAddr,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OtlpProtocolsConfig {
    pub grpc: Option<GrpcProtocolConfig>,
    pub http: Option<HttpProtocolConfig>,
}

/// `otlp` receiver settings
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OtlpReceiverConfig {
    #[serde(default)]
    pub protocols: OtlpProtocolsConfig,
}

#[derive(Debug, Clone)]
pub enum ReceiverConfig {
    Otlp(OtlpReceiverConfig),
}

impl ReceiverConfig {
    fn listen_addrs(&self) -> Vec<SocketAddr> {
        match self {
            ReceiverConfig::Otlp(otlp) => otlp
                .protocols
                .grpc
                .iter()
                .map(|g| g.endpoint)
                .chain(otlp.protocols.http.iter().map(|h| h.endpoint))
                .collect(),
        }
    }
}

// =============================================================================
// Processors
// =============================================================================

fn default_check_interval_ms() -> u64 {
    DEFAULT_MEMORY_CHECK_INTERVAL_MS
}

/// `memory_limiter` settings; configures the process-wide admission controller
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MemoryLimiterConfig {
    #[serde(default = "default_check_interval_ms")]
    pub check_interval_ms: u64,
    /// Hard limit
    pub limit_mib: u64,
    /// Headroom below the hard limit; defaults to 20% of `limit_mib`
    pub spike_limit_mib: Option<u64>,
}

impl MemoryLimiterConfig {
    pub fn hard_limit_bytes(&self) -> usize {
        mib_to_bytes(self.limit_mib).unwrap_or(usize::MAX)
    }

    pub fn soft_limit_bytes(&self) -> usize {
        let spike_bytes = match self.spike_limit_mib {
            Some(mib) => mib_to_bytes(mib).unwrap_or(usize::MAX),
            None => self.hard_limit_bytes() / 100 * DEFAULT_SPIKE_LIMIT_PERCENT as usize,
        };
        self.hard_limit_bytes().saturating_sub(spike_bytes)
    }
}

/// `None` when the byte count does not fit in `usize`
fn mib_to_bytes(mib: u64) -> Option<usize> {
    usize::try_from(mib).ok()?.checked_mul(MIB)
}

fn default_send_batch_size() -> usize {
    DEFAULT_BATCH_SEND_SIZE
}

fn default_batch_timeout_ms() -> u64 {
    DEFAULT_BATCH_TIMEOUT_MS
}

/// `batch` settings
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BatchConfig {
    #[serde(default = "default_send_batch_size")]
    pub send_batch_size: usize,
    #[serde(default = "default_batch_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            send_batch_size: DEFAULT_BATCH_SEND_SIZE,
            timeout_ms: DEFAULT_BATCH_TIMEOUT_MS,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttributeAction {
    Insert,
    Update,
    Upsert,
    Delete,
    Hash,
    Convert,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConvertType {
    Int,
    Double,
    Bool,
    String,
}

/// One attribute action of a `resource` or `attributes` processor
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AttributeActionConfig {
    pub key: String,
    pub action: AttributeAction,
    pub value: Option<AttrValue>,
    /// Copy the value from another attribute instead of using `value`
    pub from_attribute: Option<String>,
    pub converted_type: Option<ConvertType>,
}

impl AttributeActionConfig {
    fn validate(&self, id: &ComponentId, resource_only: bool) -> Result<()> {
        if self.key.is_empty() {
            anyhow::bail!("Configuration error: {}: action key must not be empty", id);
        }
        match self.action {
            AttributeAction::Insert | AttributeAction::Update | AttributeAction::Upsert => {
                if self.value.is_none() && self.from_attribute.is_none() {
                    anyhow::bail!(
                        "Configuration error: {}: action on '{}' needs either value or from_attribute",
                        id,
                        self.key
                    );
                }
            }
            AttributeAction::Convert => {
                if self.converted_type.is_none() {
                    anyhow::bail!(
                        "Configuration error: {}: convert on '{}' needs converted_type",
                        id,
                        self.key
                    );
                }
            }
            AttributeAction::Delete | AttributeAction::Hash => {}
        }
        if resource_only
            && matches!(self.action, AttributeAction::Hash | AttributeAction::Convert)
        {
            anyhow::bail!(
                "Configuration error: {}: resource processors support insert, update, upsert and delete only",
                id
            );
        }
        Ok(())
    }
}

/// `resource` settings
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResourceProcessorConfig {
    #[serde(default)]
    pub attributes: Vec<AttributeActionConfig>,
}

/// `attributes` settings
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AttributesProcessorConfig {
    #[serde(default)]
    pub actions: Vec<AttributeActionConfig>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NameFilterConfig {
    /// Regexes; an item whose name matches any of them is dropped
    #[serde(default)]
    pub exclude_names: Vec<String>,
}

/// Severity threshold given as a number or a level name
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum SeverityThreshold {
    Number(i32),
    Name(String),
}

impl SeverityThreshold {
    /// Resolve to an OTLP severity number
    pub fn severity_number(&self) -> Result<i32> {
        match self {
            SeverityThreshold::Number(n) => Ok(*n),
            SeverityThreshold::Name(name) => match name.to_ascii_uppercase().as_str() {
                "TRACE" => Ok(1),
                "DEBUG" => Ok(5),
                "INFO" => Ok(9),
                "WARN" | "WARNING" => Ok(13),
                "ERROR" => Ok(17),
                "FATAL" => Ok(21),
                other => anyhow::bail!("unknown severity level '{}'", other),
            },
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LogFilterConfig {
    pub min_severity: Option<SeverityThreshold>,
}

/// `filter` settings
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FilterProcessorConfig {
    #[serde(default)]
    pub metrics: NameFilterConfig,
    #[serde(default)]
    pub traces: NameFilterConfig,
    #[serde(default)]
    pub logs: LogFilterConfig,
    /// Attribute key -> regex; an item whose attribute value matches is dropped
    #[serde(default)]
    pub exclude_attributes: BTreeMap<String, String>,
}

#[derive(Debug, Clone)]
pub enum ProcessorConfig {
    MemoryLimiter(MemoryLimiterConfig),
    Batch(BatchConfig),
    Resource(ResourceProcessorConfig),
    Attributes(AttributesProcessorConfig),
    Filter(FilterProcessorConfig),
}

impl ProcessorConfig {
    fn validate(&self, id: &ComponentId) -> Result<()> {
        match self {
            ProcessorConfig::MemoryLimiter(cfg) => {
                if cfg.limit_mib == 0 {
                    anyhow::bail!("Configuration error: {}: limit_mib must be greater than 0", id);
                }
                if mib_to_bytes(cfg.limit_mib).is_none() {
                    anyhow::bail!(
                        "Configuration error: {}: limit_mib {} is too large",
                        id,
                        cfg.limit_mib
                    );
                }
                if cfg.check_interval_ms == 0 {
                    anyhow::bail!(
                        "Configuration error: {}: check_interval_ms must be greater than 0",
                        id
                    );
                }
                if cfg.spike_limit_mib.is_some_and(|s| s >= cfg.limit_mib) {
                    anyhow::bail!(
                        "Configuration error: {}: spike_limit_mib must be smaller than limit_mib",
                        id
                    );
                }
            }
            ProcessorConfig::Batch(cfg) => {
                if cfg.send_batch_size == 0 {
                    anyhow::bail!(
                        "Configuration error: {}: send_batch_size must be greater than 0",
                        id
                    );
                }
                if cfg.timeout_ms == 0 {
                    anyhow::bail!("Configuration error: {}: timeout_ms must be greater than 0", id);
                }
            }
            ProcessorConfig::Resource(cfg) => {
                for action in &cfg.attributes {
                    action.validate(id, true)?;
                }
            }
            ProcessorConfig::Attributes(cfg) => {
                for action in &cfg.actions {
                    action.validate(id, false)?;
                }
            }
            ProcessorConfig::Filter(cfg) => {
                let patterns = cfg
                    .metrics
                    .exclude_names
                    .iter()
                    .chain(cfg.traces.exclude_names.iter())
                    .chain(cfg.exclude_attributes.values());
                for pattern in patterns {
                    Regex::new(pattern).with_context(|| {
                        format!("Configuration error: {}: invalid regex '{}'", id, pattern)
                    })?;
                }
                if let Some(threshold) = &cfg.logs.min_severity {
                    threshold
                        .severity_number()
                        .with_context(|| format!("Configuration error: {}", id))?;
                }
            }
        }
        Ok(())
    }
}

// =============================================================================
// Exporters
// =============================================================================

fn default_metric_expiration_ms() -> u64 {
    DEFAULT_METRIC_EXPIRATION_MS
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResourceToTelemetryConfig {
    #[serde(default)]
    pub enabled: bool,
}

/// `prometheus` settings
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PrometheusExporterConfig {
    pub endpoint: SocketAddr,
    pub namespace: Option<String>,
    #[serde(default)]
    pub const_labels: BTreeMap<String, String>,
    #[serde(default)]
    pub resource_to_telemetry_conversion: ResourceToTelemetryConfig,
    #[serde(default = "default_metric_expiration_ms")]
    pub metric_expiration_ms: u64,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TlsConfig {
    /// Plaintext connection
    #[serde(default)]
    pub insecure: bool,
    /// Extra CA bundle (PEM) trusted for the server certificate
    pub ca_file: Option<PathBuf>,
}

fn default_true() -> bool {
    true
}

fn default_retry_initial_interval_ms() -> u64 {
    DEFAULT_RETRY_INITIAL_INTERVAL_MS
}

fn default_retry_max_interval_ms() -> u64 {
    DEFAULT_RETRY_MAX_INTERVAL_MS
}

fn default_retry_max_attempts() -> u32 {
    DEFAULT_RETRY_MAX_ATTEMPTS
}

/// Retry policy for push exporters
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetryConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_retry_initial_interval_ms")]
    pub initial_interval_ms: u64,
    #[serde(default = "default_retry_max_interval_ms")]
    pub max_interval_ms: u64,
    /// 0 = retry until delivered or shut down
    #[serde(default = "default_retry_max_attempts")]
    pub max_attempts: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            initial_interval_ms: DEFAULT_RETRY_INITIAL_INTERVAL_MS,
            max_interval_ms: DEFAULT_RETRY_MAX_INTERVAL_MS,
            max_attempts: DEFAULT_RETRY_MAX_ATTEMPTS,
        }
    }
}

fn default_queue_size() -> usize {
    DEFAULT_EXPORT_QUEUE_SIZE
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct QueueConfig {
    #[serde(default = "default_queue_size")]
    pub queue_size: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            queue_size: DEFAULT_EXPORT_QUEUE_SIZE,
        }
    }
}

fn default_export_timeout_ms() -> u64 {
    DEFAULT_EXPORT_TIMEOUT_MS
}

/// `otlp` (gRPC) and `otlphttp` exporter settings
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OtlpExporterConfig {
    pub endpoint: String,
    #[serde(default)]
    pub tls: TlsConfig,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default = "default_export_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub retry_on_failure: RetryConfig,
    #[serde(default)]
    pub sending_queue: QueueConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LokiDefaultLabels {
    #[serde(default = "default_true")]
    pub exporter: bool,
    #[serde(default = "default_true")]
    pub job: bool,
    #[serde(default = "default_true")]
    pub instance: bool,
    #[serde(default = "default_true")]
    pub level: bool,
}

impl Default for LokiDefaultLabels {
    fn default() -> Self {
        Self {
            exporter: true,
            job: true,
            instance: true,
            level: true,
        }
    }
}

/// Attribute keys promoted to Loki stream labels
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LokiLabelsConfig {
    #[serde(default)]
    pub resource: Vec<String>,
    #[serde(default)]
    pub attributes: Vec<String>,
}

/// `loki` settings
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LokiExporterConfig {
    pub endpoint: String,
    /// Sent as `X-Scope-OrgID`
    pub tenant_id: Option<String>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default = "default_export_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub default_labels_enabled: LokiDefaultLabels,
    #[serde(default)]
    pub labels: LokiLabelsConfig,
    #[serde(default)]
    pub retry_on_failure: RetryConfig,
    #[serde(default)]
    pub sending_queue: QueueConfig,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verbosity {
    #[default]
    Basic,
    Detailed,
}

/// `debug` settings
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DebugExporterConfig {
    #[serde(default)]
    pub verbosity: Verbosity,
}

#[derive(Debug, Clone)]
pub enum ExporterConfig {
    Prometheus(PrometheusExporterConfig),
    Otlp(OtlpExporterConfig),
    OtlpHttp(OtlpExporterConfig),
    Loki(LokiExporterConfig),
    Debug(DebugExporterConfig),
}

impl ExporterConfig {
    /// Whether this exporter can sit in a pipeline of `signal`
    pub fn supports(&self, signal: SignalType) -> bool {
        match self {
            ExporterConfig::Prometheus(_) => signal == SignalType::Metrics,
            ExporterConfig::Loki(_) => signal == SignalType::Logs,
            ExporterConfig::Otlp(_) | ExporterConfig::OtlpHttp(_) | ExporterConfig::Debug(_) => {
                true
            }
        }
    }

    fn validate(&self, id: &ComponentId) -> Result<()> {
        let (endpoint, retry, queue) = match self {
            ExporterConfig::Otlp(cfg) | ExporterConfig::OtlpHttp(cfg) => {
                (&cfg.endpoint, &cfg.retry_on_failure, &cfg.sending_queue)
            }
            ExporterConfig::Loki(cfg) => (&cfg.endpoint, &cfg.retry_on_failure, &cfg.sending_queue),
            ExporterConfig::Prometheus(cfg) => {
                if cfg.metric_expiration_ms == 0 {
                    anyhow::bail!(
                        "Configuration error: {}: metric_expiration_ms must be greater than 0",
                        id
                    );
                }
                return Ok(());
            }
            ExporterConfig::Debug(_) => return Ok(()),
        };

        if endpoint.trim().is_empty() {
            anyhow::bail!("Configuration error: {}: endpoint must not be empty", id);
        }
        if matches!(self, ExporterConfig::OtlpHttp(_) | ExporterConfig::Loki(_))
            && !(endpoint.starts_with("http://") || endpoint.starts_with("https://"))
        {
            anyhow::bail!(
                "Configuration error: {}: endpoint '{}' must start with http:// or https://",
                id,
                endpoint
            );
        }
        if queue.queue_size == 0 {
            anyhow::bail!(
                "Configuration error: {}: sending_queue.queue_size must be greater than 0",
                id
            );
        }
        if retry.enabled {
            if retry.initial_interval_ms == 0 {
                anyhow::bail!(
                    "Configuration error: {}: retry_on_failure.initial_interval_ms must be greater than 0",
                    id
                );
            }
            if retry.max_interval_ms < retry.initial_interval_ms {
                anyhow::bail!(
                    "Configuration error: {}: retry_on_failure.max_interval_ms must not be smaller than initial_interval_ms",
                    id
                );
            }
        }
        Ok(())
    }
}

// =============================================================================
// Extensions
// =============================================================================

fn default_health_endpoint() -> SocketAddr {
    default_addr(DEFAULT_HEALTH_CHECK_PORT)
}

fn default_health_path() -> String {
    DEFAULT_HEALTH_CHECK_PATH.to_string()
}

/// `health_check` settings
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HealthCheckConfig {
    #[serde(default = "default_health_endpoint")]
    pub endpoint: SocketAddr,
    #[serde(default = "default_health_path")]
    pub path: String,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            endpoint: default_health_endpoint(),
            path: default_health_path(),
        }
    }
}

#[derive(Debug, Clone)]
pub enum ExtensionConfig {
    HealthCheck(HealthCheckConfig),
}

// =============================================================================
// Service
// =============================================================================

/// Pipeline section (from JSON config file)
#[derive(Debug, Default, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PipelineFileConfig {
    #[serde(default)]
    pub receivers: Vec<String>,
    #[serde(default)]
    pub processors: Vec<String>,
    #[serde(default)]
    pub exporters: Vec<String>,
}

#[derive(Debug, Default, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TelemetryMetricsFileConfig {
    pub endpoint: Option<SocketAddr>,
}

#[derive(Debug, Default, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TelemetryFileConfig {
    pub metrics: Option<TelemetryMetricsFileConfig>,
}

/// Service section (from JSON config file)
#[derive(Debug, Default, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServiceFileConfig {
    #[serde(default)]
    pub extensions: Vec<String>,
    #[serde(default)]
    pub pipelines: BTreeMap<SignalType, PipelineFileConfig>,
    pub telemetry: Option<TelemetryFileConfig>,
    pub shutdown_grace_ms: Option<u64>,
}

/// File-based configuration (JSON)
#[derive(Debug, Default, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub receivers: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub processors: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub exporters: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub extensions: BTreeMap<String, serde_json::Value>,
    pub service: Option<ServiceFileConfig>,
    #[serde(flatten)]
    pub extra: serde_json::Value,
}

impl FileConfig {
    /// Load configuration from a JSON file
    fn load_from_file(path: &Path) -> Result<Self> {
        tracing::debug!(path = %path.display(), "Loading config file");
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        tracing::trace!(config = ?config, "Parsed config file");
        Ok(config)
    }

    /// Warn about unknown fields in the config
    fn warn_unknown_fields(&self) {
        if let serde_json::Value::Object(map) = &self.extra
            && !map.is_empty()
        {
            let keys_str: String = map
                .keys()
                .map(|k| k.as_str())
                .collect::<Vec<_>>()
                .join(", ");
            tracing::warn!(
                fields = %keys_str,
                "Unknown fields in config file (possible typos)"
            );
        }
    }
}

/// Parse one component's settings; `null` means all defaults
fn parse_settings<T: DeserializeOwned>(id: &ComponentId, value: serde_json::Value) -> Result<T> {
    let value = match value {
        serde_json::Value::Null => serde_json::Value::Object(Default::default()),
        other => other,
    };
    serde_json::from_value(value)
        .with_context(|| format!("Configuration error: invalid settings for '{}'", id))
}

/// A resolved pipeline
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub signal: SignalType,
    pub receivers: Vec<ComponentId>,
    pub processors: Vec<ComponentId>,
    pub exporters: Vec<ComponentId>,
}

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub extensions: Vec<ComponentId>,
    pub pipelines: BTreeMap<SignalType, PipelineConfig>,
    /// Internal telemetry endpoint
    pub telemetry_endpoint: Option<SocketAddr>,
    pub shutdown_grace: Duration,
}

/// Final application configuration
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub receivers: BTreeMap<ComponentId, ReceiverConfig>,
    pub processors: BTreeMap<ComponentId, ProcessorConfig>,
    pub exporters: BTreeMap<ComponentId, ExporterConfig>,
    pub extensions: BTreeMap<ComponentId, ExtensionConfig>,
    pub service: ServiceConfig,
}

impl AppConfig {
    /// Load configuration from the CLI-specified path or `./otelflow.json`
    pub fn load(cli: &CliConfig) -> Result<Self> {
        tracing::debug!("Loading application configuration");
        tracing::trace!(cli = ?cli, "CLI config");

        let path = match &cli.config {
            Some(path) => path.clone(),
            None => PathBuf::from(CONFIG_FILE_NAME),
        };
        if !path.exists() {
            anyhow::bail!("Config file not found: {}", path.display());
        }

        let file_config = FileConfig::load_from_file(&path)?;
        let config = Self::from_file_config(file_config)?;
        tracing::debug!(path = %path.display(), "Config file loaded");
        Ok(config)
    }

    /// Parse and validate a JSON configuration document
    pub fn from_json(json: &str) -> Result<Self> {
        let file_config: FileConfig =
            serde_json::from_str(json).context("Failed to parse configuration")?;
        Self::from_file_config(file_config)
    }

    fn from_file_config(file_config: FileConfig) -> Result<Self> {
        file_config.warn_unknown_fields();

        let mut receivers = BTreeMap::new();
        for (key, value) in file_config.receivers {
            let id: ComponentId = key.parse()?;
            let config = match id.kind() {
                "otlp" => ReceiverConfig::Otlp(parse_settings(&id, value)?),
                other => anyhow::bail!("Configuration error: unknown receiver type '{}'", other),
            };
            receivers.insert(id, config);
        }

        let mut processors = BTreeMap::new();
        for (key, value) in file_config.processors {
            let id: ComponentId = key.parse()?;
            let config = match id.kind() {
                "memory_limiter" => ProcessorConfig::MemoryLimiter(parse_settings(&id, value)?),
                "batch" => ProcessorConfig::Batch(parse_settings(&id, value)?),
                "resource" => ProcessorConfig::Resource(parse_settings(&id, value)?),
                "attributes" => ProcessorConfig::Attributes(parse_settings(&id, value)?),
                "filter" => ProcessorConfig::Filter(parse_settings(&id, value)?),
                other => anyhow::bail!("Configuration error: unknown processor type '{}'", other),
            };
            processors.insert(id, config);
        }

        let mut exporters = BTreeMap::new();
        for (key, value) in file_config.exporters {
            let id: ComponentId = key.parse()?;
            let config = match id.kind() {
                "prometheus" => ExporterConfig::Prometheus(parse_settings(&id, value)?),
                "otlp" => ExporterConfig::Otlp(parse_settings(&id, value)?),
                "otlphttp" => ExporterConfig::OtlpHttp(parse_settings(&id, value)?),
                "loki" => ExporterConfig::Loki(parse_settings(&id, value)?),
                "debug" => ExporterConfig::Debug(parse_settings(&id, value)?),
                other => anyhow::bail!("Configuration error: unknown exporter type '{}'", other),
            };
            exporters.insert(id, config);
        }

        let mut extensions = BTreeMap::new();
        for (key, value) in file_config.extensions {
            let id: ComponentId = key.parse()?;
            let config = match id.kind() {
                "health_check" => ExtensionConfig::HealthCheck(parse_settings(&id, value)?),
                other => anyhow::bail!("Configuration error: unknown extension type '{}'", other),
            };
            extensions.insert(id, config);
        }

        let file_service = file_config.service.unwrap_or_default();
        let parse_ids = |ids: &[String]| -> Result<Vec<ComponentId>> {
            ids.iter().map(|s| s.parse()).collect()
        };
        let mut pipelines = BTreeMap::new();
        for (signal, pipeline) in &file_service.pipelines {
            pipelines.insert(
                *signal,
                PipelineConfig {
                    signal: *signal,
                    receivers: parse_ids(&pipeline.receivers)?,
                    processors: parse_ids(&pipeline.processors)?,
                    exporters: parse_ids(&pipeline.exporters)?,
                },
            );
        }

        let config = Self {
            receivers,
            processors,
            exporters,
            extensions,
            service: ServiceConfig {
                extensions: parse_ids(&file_service.extensions)?,
                pipelines,
                telemetry_endpoint: file_service
                    .telemetry
                    .and_then(|t| t.metrics)
                    .and_then(|m| m.endpoint),
                shutdown_grace: Duration::from_millis(
                    file_service
                        .shutdown_grace_ms
                        .unwrap_or(DEFAULT_SHUTDOWN_GRACE_MS),
                ),
            },
        };

        config.validate()?;
        Ok(config)
    }

    /// The memory limiter shared by all pipelines, if any pipeline lists one
    pub fn memory_limiter(&self) -> Option<&MemoryLimiterConfig> {
        self.service
            .pipelines
            .values()
            .flat_map(|p| p.processors.iter())
            .find_map(|id| match self.processors.get(id) {
                Some(ProcessorConfig::MemoryLimiter(cfg)) => Some(cfg),
                _ => None,
            })
    }

    /// Batch settings of a pipeline (defaults when it lists no `batch`)
    pub fn batch_for(&self, pipeline: &PipelineConfig) -> BatchConfig {
        pipeline
            .processors
            .iter()
            .find_map(|id| match self.processors.get(id) {
                Some(ProcessorConfig::Batch(cfg)) => Some(cfg.clone()),
                _ => None,
            })
            .unwrap_or_default()
    }

    /// Transformation stages of a pipeline, in order
    pub fn stages_for<'a>(
        &'a self,
        pipeline: &'a PipelineConfig,
    ) -> impl Iterator<Item = (&'a ComponentId, &'a ProcessorConfig)> + 'a {
        pipeline.processors.iter().filter_map(|id| {
            self.processors.get(id).and_then(|cfg| match cfg {
                ProcessorConfig::MemoryLimiter(_) | ProcessorConfig::Batch(_) => None,
                stage => Some((id, stage)),
            })
        })
    }

    /// Receivers referenced by at least one pipeline, with the signals they feed
    pub fn receiver_routes(&self) -> BTreeMap<ComponentId, Vec<SignalType>> {
        let mut routes: BTreeMap<ComponentId, Vec<SignalType>> = BTreeMap::new();
        for pipeline in self.service.pipelines.values() {
            for id in &pipeline.receivers {
                routes.entry(id.clone()).or_default().push(pipeline.signal);
            }
        }
        routes
    }

    /// Health check settings when the extension is enabled in `service`
    pub fn health_check(&self) -> Option<&HealthCheckConfig> {
        self.service
            .extensions
            .iter()
            .find_map(|id| match self.extensions.get(id) {
                Some(ExtensionConfig::HealthCheck(cfg)) => Some(cfg),
                None => None,
            })
    }

    /// Validate the configuration for consistency and correctness
    fn validate(&self) -> Result<()> {
        if self.service.pipelines.is_empty() {
            anyhow::bail!("Configuration error: service.pipelines must define at least one pipeline");
        }

        for (id, receiver) in &self.receivers {
            match receiver {
                ReceiverConfig::Otlp(otlp) => {
                    if otlp.protocols.grpc.is_none() && otlp.protocols.http.is_none() {
                        anyhow::bail!(
                            "Configuration error: {}: at least one of protocols.grpc or protocols.http is required",
                            id
                        );
                    }
                }
            }
        }
        for (id, processor) in &self.processors {
            processor.validate(id)?;
        }
        for (id, exporter) in &self.exporters {
            exporter.validate(id)?;
        }

        let mut limiter: Option<&ComponentId> = None;
        for (signal, pipeline) in &self.service.pipelines {
            if pipeline.receivers.is_empty() {
                anyhow::bail!(
                    "Configuration error: pipeline '{}' must list at least one receiver",
                    signal
                );
            }
            if pipeline.exporters.is_empty() {
                anyhow::bail!(
                    "Configuration error: pipeline '{}' must list at least one exporter",
                    signal
                );
            }
            check_unique(signal, "receivers", &pipeline.receivers)?;
            check_unique(signal, "processors", &pipeline.processors)?;
            check_unique(signal, "exporters", &pipeline.exporters)?;

            for id in &pipeline.receivers {
                if !self.receivers.contains_key(id) {
                    anyhow::bail!(
                        "Configuration error: pipeline '{}' references undefined receiver '{}'",
                        signal,
                        id
                    );
                }
            }

            let last = pipeline.processors.len().saturating_sub(1);
            for (position, id) in pipeline.processors.iter().enumerate() {
                match self.processors.get(id) {
                    None => anyhow::bail!(
                        "Configuration error: pipeline '{}' references undefined processor '{}'",
                        signal,
                        id
                    ),
                    Some(ProcessorConfig::MemoryLimiter(_)) => {
                        if position != 0 {
                            anyhow::bail!(
                                "Configuration error: pipeline '{}': '{}' must be the first processor",
                                signal,
                                id
                            );
                        }
                        match limiter {
                            Some(existing) if existing != id => anyhow::bail!(
                                "Configuration error: pipelines must share one memory limiter, found '{}' and '{}'",
                                existing,
                                id
                            ),
                            _ => limiter = Some(id),
                        }
                    }
                    Some(ProcessorConfig::Batch(_)) if position != last => anyhow::bail!(
                        "Configuration error: pipeline '{}': '{}' must be the last processor",
                        signal,
                        id
                    ),
                    Some(_) => {}
                }
            }

            for id in &pipeline.exporters {
                match self.exporters.get(id) {
                    None => anyhow::bail!(
                        "Configuration error: pipeline '{}' references undefined exporter '{}'",
                        signal,
                        id
                    ),
                    Some(exporter) if !exporter.supports(*signal) => anyhow::bail!(
                        "Configuration error: exporter '{}' does not support the {} signal",
                        id,
                        signal
                    ),
                    Some(_) => {}
                }
            }
        }

        for id in &self.service.extensions {
            if !self.extensions.contains_key(id) {
                anyhow::bail!(
                    "Configuration error: service.extensions references undefined extension '{}'",
                    id
                );
            }
        }

        if let Some(health) = self.health_check()
            && !health.path.starts_with('/')
        {
            anyhow::bail!(
                "Configuration error: health_check path '{}' must start with '/'",
                health.path
            );
        }

        self.validate_listeners()?;

        let routes = self.receiver_routes();
        for id in self.receivers.keys() {
            if !routes.contains_key(id) {
                tracing::warn!(receiver = %id, "Receiver is not used by any pipeline");
            }
        }

        Ok(())
    }

    /// Every listener the process will bind must have a distinct address
    fn validate_listeners(&self) -> Result<()> {
        let mut listeners: Vec<(SocketAddr, String)> = Vec::new();

        for id in self.receiver_routes().keys() {
            if let Some(receiver) = self.receivers.get(id) {
                for addr in receiver.listen_addrs() {
                    listeners.push((addr, format!("receiver '{}'", id)));
                }
            }
        }
        let mut prometheus: BTreeSet<&ComponentId> = BTreeSet::new();
        for pipeline in self.service.pipelines.values() {
            for id in &pipeline.exporters {
                if let Some(ExporterConfig::Prometheus(cfg)) = self.exporters.get(id)
                    && prometheus.insert(id)
                {
                    listeners.push((cfg.endpoint, format!("exporter '{}'", id)));
                }
            }
        }
        if let Some(health) = self.health_check() {
            listeners.push((health.endpoint, "extension 'health_check'".to_string()));
        }
        if let Some(endpoint) = self.service.telemetry_endpoint {
            listeners.push((endpoint, "service.telemetry.metrics".to_string()));
        }

        let mut seen: HashMap<SocketAddr, &str> = HashMap::new();
        for (addr, owner) in &listeners {
            if let Some(previous) = seen.insert(*addr, owner) {
                anyhow::bail!(
                    "Configuration error: {} and {} cannot both listen on {}",
                    previous,
                    owner,
                    addr
                );
            }
        }
        Ok(())
    }
}

fn check_unique(signal: &SignalType, section: &str, ids: &[ComponentId]) -> Result<()> {
    let mut seen = BTreeSet::new();
    for id in ids {
        if !seen.insert(id) {
            anyhow::bail!(
                "Configuration error: pipeline '{}' lists {} '{}' more than once",
                signal,
                section,
                id
            );
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    const FULL: &str = r#"{
        "receivers": { "otlp": { "protocols": {
            "grpc": { "endpoint": "0.0.0.0:4317" },
            "http": { "endpoint": "0.0.0.0:4318" } } } },
        "processors": {
            "memory_limiter": { "check_interval_ms": 1000, "limit_mib": 512, "spike_limit_mib": 128 },
            "resource": { "attributes": [
                { "key": "deployment.environment", "value": "development", "action": "upsert" } ] },
            "batch": { "send_batch_size": 1024, "timeout_ms": 1000 }
        },
        "exporters": {
            "prometheus": { "endpoint": "0.0.0.0:8889", "namespace": "otel" },
            "otlp/tempo": { "endpoint": "http://tempo:4317", "tls": { "insecure": true } },
            "loki": { "endpoint": "http://loki:3100/loki/api/v1/push" },
            "debug": {}
        },
        "extensions": { "health_check": {} },
        "service": {
            "extensions": ["health_check"],
            "pipelines": {
                "metrics": { "receivers": ["otlp"], "processors": ["memory_limiter", "resource", "batch"], "exporters": ["prometheus"] },
                "traces": { "receivers": ["otlp"], "processors": ["memory_limiter", "resource", "batch"], "exporters": ["otlp/tempo", "debug"] },
                "logs": { "receivers": ["otlp"], "processors": ["memory_limiter", "resource", "batch"], "exporters": ["loki"] }
            }
        }
    }"#;

    fn expect_error(json: &str, needle: &str) {
        let err = AppConfig::from_json(json).unwrap_err();
        let message = format!("{:#}", err);
        assert!(
            message.contains(needle),
            "expected '{}' in error: {}",
            needle,
            message
        );
    }

    #[test]
    fn test_component_id_parse() {
        let id: ComponentId = "otlp/tempo".parse().unwrap();
        assert_eq!(id.kind(), "otlp");
        assert_eq!(id.name(), Some("tempo"));
        assert_eq!(id.to_string(), "otlp/tempo");

        let id: ComponentId = "batch".parse().unwrap();
        assert_eq!(id.kind(), "batch");
        assert_eq!(id.name(), None);

        assert!("".parse::<ComponentId>().is_err());
        assert!("otlp/".parse::<ComponentId>().is_err());
    }

    #[test]
    fn test_parse_full_config() {
        let config = AppConfig::from_json(FULL).unwrap();
        assert_eq!(config.service.pipelines.len(), 3);
        assert_eq!(config.exporters.len(), 4);

        let limiter = config.memory_limiter().unwrap();
        assert_eq!(limiter.hard_limit_bytes(), 512 * MIB);
        assert_eq!(limiter.soft_limit_bytes(), 384 * MIB);

        let traces = &config.service.pipelines[&SignalType::Traces];
        let stages: Vec<String> = config
            .stages_for(traces)
            .map(|(id, _)| id.to_string())
            .collect();
        assert_eq!(stages, vec!["resource"]);
        assert_eq!(config.batch_for(traces).send_batch_size, 1024);

        let health = config.health_check().unwrap();
        assert_eq!(health.endpoint, "0.0.0.0:13133".parse().unwrap());
        assert_eq!(health.path, "/");
        assert_eq!(config.service.shutdown_grace, Duration::from_millis(5000));

        let routes = config.receiver_routes();
        let otlp: ComponentId = "otlp".parse().unwrap();
        assert_eq!(routes[&otlp].len(), 3);
    }

    #[test]
    fn test_exporter_defaults() {
        let config = AppConfig::from_json(FULL).unwrap();
        let tempo: ComponentId = "otlp/tempo".parse().unwrap();
        let ExporterConfig::Otlp(cfg) = &config.exporters[&tempo] else {
            panic!("expected otlp exporter");
        };
        assert!(cfg.tls.insecure);
        assert_eq!(cfg.sending_queue.queue_size, 1000);
        assert_eq!(cfg.retry_on_failure, RetryConfig::default());

        let loki: ComponentId = "loki".parse().unwrap();
        let ExporterConfig::Loki(cfg) = &config.exporters[&loki] else {
            panic!("expected loki exporter");
        };
        assert!(cfg.default_labels_enabled.exporter);
        assert!(cfg.default_labels_enabled.level);
    }

    #[test]
    fn test_spike_limit_defaults_to_fifth() {
        let cfg: MemoryLimiterConfig = serde_json::from_str(r#"{ "limit_mib": 100 }"#).unwrap();
        assert_eq!(cfg.check_interval_ms, 1000);
        assert_eq!(cfg.hard_limit_bytes(), 100 * MIB);
        assert_eq!(cfg.soft_limit_bytes(), 80 * MIB);
    }

    #[test]
    fn test_oversized_memory_limit_rejected() {
        let json = FULL.replace(r#""limit_mib": 512"#, r#""limit_mib": 18446744073709551615"#);
        expect_error(&json, "limit_mib 18446744073709551615 is too large");
    }

    #[test]
    fn test_batch_defaults_without_batch_processor() {
        let json = r#"{
            "receivers": { "otlp": { "protocols": { "http": {} } } },
            "exporters": { "debug": null },
            "service": { "pipelines": { "logs": { "receivers": ["otlp"], "exporters": ["debug"] } } }
        }"#;
        let config = AppConfig::from_json(json).unwrap();
        let logs = &config.service.pipelines[&SignalType::Logs];
        assert_eq!(config.batch_for(logs), BatchConfig::default());
        assert!(config.memory_limiter().is_none());
    }

    #[test]
    fn test_unknown_top_level_field_is_tolerated() {
        let json = FULL.replacen('{', r#"{ "connectors": {}, "#, 1);
        assert!(AppConfig::from_json(&json).is_ok());
    }

    #[test]
    fn test_unknown_component_field_rejected() {
        let json = FULL.replace(r#""namespace": "otel""#, r#""namespase": "otel""#);
        expect_error(&json, "invalid settings for 'prometheus'");
    }

    #[test]
    fn test_unknown_component_type_rejected() {
        let json = FULL.replace(r#""debug": {}"#, r#""kafka": {}"#);
        expect_error(&json, "unknown exporter type 'kafka'");
    }

    #[test]
    fn test_no_pipelines_rejected() {
        expect_error(r#"{ "service": {} }"#, "at least one pipeline");
    }

    #[test]
    fn test_undefined_exporter_rejected() {
        let json = FULL.replace(r#""exporters": ["loki"]"#, r#""exporters": ["loki/missing"]"#);
        expect_error(&json, "undefined exporter 'loki/missing'");
    }

    #[test]
    fn test_prometheus_outside_metrics_rejected() {
        let json = FULL.replace(
            r#""exporters": ["otlp/tempo", "debug"]"#,
            r#""exporters": ["prometheus"]"#,
        );
        expect_error(&json, "does not support the traces signal");
    }

    #[test]
    fn test_memory_limiter_must_be_first() {
        let json = FULL.replacen(
            r#""processors": ["memory_limiter", "resource", "batch"]"#,
            r#""processors": ["resource", "memory_limiter", "batch"]"#,
            1,
        );
        expect_error(&json, "must be the first processor");
    }

    #[test]
    fn test_batch_must_be_last() {
        let json = FULL.replacen(
            r#""processors": ["memory_limiter", "resource", "batch"]"#,
            r#""processors": ["memory_limiter", "batch", "resource"]"#,
            1,
        );
        expect_error(&json, "must be the last processor");
    }

    #[test]
    fn test_listener_collision_rejected() {
        let json = FULL.replace(r#""0.0.0.0:8889""#, r#""0.0.0.0:4318""#);
        expect_error(&json, "cannot both listen on 0.0.0.0:4318");
    }

    #[test]
    fn test_invalid_filter_regex_rejected() {
        let json = r#"{
            "receivers": { "otlp": { "protocols": { "grpc": {} } } },
            "processors": { "filter": { "traces": { "exclude_names": ["(unclosed"] } } },
            "exporters": { "debug": {} },
            "service": { "pipelines": { "traces": { "receivers": ["otlp"], "processors": ["filter"], "exporters": ["debug"] } } }
        }"#;
        expect_error(json, "invalid regex '(unclosed'");
    }

    #[test]
    fn test_resource_hash_action_rejected() {
        let json = FULL.replace(r#""action": "upsert""#, r#""action": "hash""#);
        expect_error(&json, "resource processors support");
    }

    #[test]
    fn test_receiver_without_protocols_rejected() {
        let json = r#"{
            "receivers": { "otlp": {} },
            "exporters": { "debug": {} },
            "service": { "pipelines": { "traces": { "receivers": ["otlp"], "exporters": ["debug"] } } }
        }"#;
        expect_error(json, "at least one of protocols.grpc or protocols.http");
    }

    #[test]
    fn test_severity_threshold_names() {
        assert_eq!(
            SeverityThreshold::Name("warn".into()).severity_number().unwrap(),
            13
        );
        assert_eq!(SeverityThreshold::Number(17).severity_number().unwrap(), 17);
        assert!(SeverityThreshold::Name("loud".into()).severity_number().is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(FULL.as_bytes()).unwrap();
        let cli = CliConfig {
            config: Some(file.path().to_path_buf()),
        };
        let config = AppConfig::load(&cli).unwrap();
        assert_eq!(config.service.pipelines.len(), 3);
    }

    #[test]
    fn test_load_missing_file() {
        let cli = CliConfig {
            config: Some(PathBuf::from("/nonexistent/otelflow.json")),
        };
        let err = AppConfig::load(&cli).unwrap_err();
        assert!(err.to_string().contains("Config file not found"));
    }
}
