// =============================================================================
// Application Identity
// =============================================================================

/// Application name in lowercase (for paths, metric prefixes and identifiers)
pub const APP_NAME_LOWER: &str = "otelflow";

// =============================================================================
// Configuration Files
// =============================================================================

/// Config file name looked up in the working directory
pub const CONFIG_FILE_NAME: &str = "otelflow.json";

/// Environment variable for config file path
pub const ENV_CONFIG: &str = "OTELFLOW_CONFIG";

/// Environment variable for log level/filter
pub const ENV_LOG: &str = "OTELFLOW_LOG";

// =============================================================================
// Receiver Defaults
// =============================================================================

/// Default listen interface for every server
pub const DEFAULT_LISTEN_IP: [u8; 4] = [0, 0, 0, 0];

/// Default OTLP/gRPC listen port
pub const DEFAULT_OTLP_GRPC_PORT: u16 = 4317;

/// Default OTLP/HTTP listen port
pub const DEFAULT_OTLP_HTTP_PORT: u16 = 4318;

/// Maximum accepted size of a single OTLP submission (16 MiB)
pub const OTLP_BODY_LIMIT: usize = 16 * 1024 * 1024;

/// Retry-After value (seconds) returned when ingestion is refused
pub const BACKPRESSURE_RETRY_AFTER_SECS: u64 = 1;

// =============================================================================
// Pipeline Defaults
// =============================================================================

/// Submissions buffered between receivers and a pipeline's processing task
pub const PIPELINE_INGEST_QUEUE_CAPACITY: usize = 256;

/// Default batch size threshold (items)
pub const DEFAULT_BATCH_SEND_SIZE: usize = 1024;

/// Default batch timeout in milliseconds
pub const DEFAULT_BATCH_TIMEOUT_MS: u64 = 1000;

/// Batch timeout divisor applied while memory usage is above the soft limit
pub const PRESSURE_TIMEOUT_DIVISOR: u32 = 4;

// =============================================================================
// Memory Limiter Defaults
// =============================================================================

/// Default interval between memory usage checks in milliseconds
pub const DEFAULT_MEMORY_CHECK_INTERVAL_MS: u64 = 1000;

/// Default spike limit as a percentage of the hard limit
pub const DEFAULT_SPIKE_LIMIT_PERCENT: u64 = 20;

/// Bytes per MiB
pub const MIB: usize = 1024 * 1024;

// =============================================================================
// Exporter Defaults
// =============================================================================

/// Default sending queue capacity (batches) for push exporters
pub const DEFAULT_EXPORT_QUEUE_SIZE: usize = 1000;

/// Default per-request export timeout in milliseconds
pub const DEFAULT_EXPORT_TIMEOUT_MS: u64 = 5000;

/// Default first retry delay in milliseconds
pub const DEFAULT_RETRY_INITIAL_INTERVAL_MS: u64 = 5000;

/// Default retry delay ceiling in milliseconds
pub const DEFAULT_RETRY_MAX_INTERVAL_MS: u64 = 30_000;

/// Default maximum delivery attempts per batch (0 = unbounded)
pub const DEFAULT_RETRY_MAX_ATTEMPTS: u32 = 5;

/// Default series expiration for the Prometheus exporter in milliseconds
pub const DEFAULT_METRIC_EXPIRATION_MS: u64 = 5 * 60 * 1000;

/// Content type of the Prometheus text exposition format
pub const PROMETHEUS_CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

// =============================================================================
// Extension Defaults
// =============================================================================

/// Default health check listen port
pub const DEFAULT_HEALTH_CHECK_PORT: u16 = 13133;

/// Default health check path
pub const DEFAULT_HEALTH_CHECK_PATH: &str = "/";

// =============================================================================
// Shutdown
// =============================================================================

/// Default grace period for in-flight exports at shutdown in milliseconds
pub const DEFAULT_SHUTDOWN_GRACE_MS: u64 = 5000;

/// Extra time allowed on top of the grace period before tasks are abandoned
pub const SHUTDOWN_TIMEOUT_MARGIN_SECS: u64 = 5;
