//! Core application

use std::future::Future;
use std::sync::Arc;

use anyhow::Result;

use crate::api::{HealthServer, HealthState, Ingest, OtlpGrpcServer, OtlpHttpServer, TelemetryServer};
use crate::core::cli::{self, CliConfig, Commands};
use crate::core::config::{AppConfig, ReceiverConfig};
use crate::core::constants::{APP_NAME_LOWER, ENV_LOG};
use crate::core::shutdown::ShutdownService;
use crate::domain::admission::MemoryLimits;
use crate::domain::{AdmissionController, PipelineRouter, StatsRegistry};

pub struct CoreApp {
    pub shutdown: ShutdownService,
    pub config: AppConfig,
    pub admission: Arc<AdmissionController>,
    pub stats: Arc<StatsRegistry>,
    pub health: HealthState,
}

impl CoreApp {
    /// Run the application with CLI argument parsing
    pub async fn run() -> Result<()> {
        dotenvy::dotenv().ok();
        Self::init_logging();

        tracing::debug!("Application starting");

        let (cli_config, command) = cli::parse();
        tracing::trace!(command = ?command, "Parsed command");

        match command {
            Some(Commands::Validate) => Self::validate(&cli_config),
            Some(Commands::Start) | None => {
                let app = Self::init(&cli_config)?;
                app.start().await
            }
        }
    }

    fn validate(cli: &CliConfig) -> Result<()> {
        let config = AppConfig::load(cli)?;
        let pipelines: Vec<String> = config
            .service
            .pipelines
            .keys()
            .map(|signal| signal.to_string())
            .collect();
        println!("Configuration OK (pipelines: {})", pipelines.join(", "));
        Ok(())
    }

    pub fn init(cli: &CliConfig) -> Result<Self> {
        let config = AppConfig::load(cli)?;
        Ok(Self::from_config(config))
    }

    pub fn from_config(config: AppConfig) -> Self {
        let limits = config.memory_limiter().map(MemoryLimits::from);
        if let Some(limits) = &limits {
            tracing::debug!(
                hard_bytes = limits.hard_bytes,
                soft_bytes = limits.soft_bytes,
                "Memory limiter enabled"
            );
        }

        Self {
            shutdown: ShutdownService::new(config.service.shutdown_grace),
            admission: AdmissionController::new(limits),
            stats: StatsRegistry::new(),
            health: HealthState::new(),
            config,
        }
    }

    fn init_logging() {
        let default_filter = format!("info,{}=info", APP_NAME_LOWER);

        let filter = std::env::var(ENV_LOG)
            .or_else(|_| std::env::var("RUST_LOG"))
            .unwrap_or(default_filter);

        tracing_subscriber::fmt()
            .with_target(false)
            .with_thread_ids(false)
            .with_level(true)
            .with_ansi(true)
            .compact()
            .with_env_filter(filter)
            .init();
    }

    /// Start every component, serve until a shutdown signal, then drain.
    pub async fn start(self) -> Result<()> {
        // Install signal handlers FIRST (before any blocking calls)
        self.shutdown.install_signal_handlers();

        if let Err(e) = self.start_components().await {
            self.shutdown.shutdown().await;
            return Err(e);
        }

        self.health.set_ready(true);
        tracing::info!(
            pipelines = self.config.service.pipelines.len(),
            "{} started",
            APP_NAME_LOWER
        );

        self.shutdown.wait().await;
        self.health.set_ready(false);
        self.shutdown.shutdown().await;

        tracing::info!("{} stopped", APP_NAME_LOWER);
        Ok(())
    }

    /// Bind every listener and spawn every task. Any bind failure is fatal.
    pub async fn start_components(&self) -> Result<()> {
        if let Some(health) = self.config.health_check() {
            let server = HealthServer::bind(health, self.health.clone()).await?;
            tracing::info!(addr = %server.local_addr()?, path = %health.path, "Health check listening");
            self.spawn_server("health_check", server.start(self.shutdown.subscribe()))
                .await;
        }

        if let Some(sampler) = self
            .admission
            .start_sampler(self.shutdown.subscribe())
        {
            self.shutdown.register(sampler).await;
        }

        let mut router =
            PipelineRouter::build(&self.config, Arc::clone(&self.admission), &self.stats).await?;
        for handle in router.start(&self.shutdown.subscribe()) {
            self.shutdown.register(handle).await;
        }

        for (id, receiver) in &self.config.receivers {
            let routes = router.routes_for(id);
            if routes.is_empty() {
                tracing::warn!(receiver = %id, "Receiver is not used by any pipeline; not started");
                continue;
            }

            let name = id.to_string();
            let ingest = Arc::new(Ingest::new(
                name.clone(),
                routes,
                Arc::clone(&self.admission),
                self.stats.receiver(&name),
            ));

            match receiver {
                ReceiverConfig::Otlp(otlp) => {
                    if let Some(grpc) = &otlp.protocols.grpc {
                        let server = OtlpGrpcServer::bind(grpc.endpoint, Arc::clone(&ingest)).await?;
                        tracing::info!(receiver = %id, addr = %server.local_addr()?, "OTLP/gRPC listening");
                        self.spawn_server("otlp_grpc", server.start(self.shutdown.subscribe()))
                            .await;
                    }
                    if let Some(http) = &otlp.protocols.http {
                        let server = OtlpHttpServer::bind(http.endpoint, Arc::clone(&ingest)).await?;
                        tracing::info!(receiver = %id, addr = %server.local_addr()?, "OTLP/HTTP listening");
                        self.spawn_server("otlp_http", server.start(self.shutdown.subscribe()))
                            .await;
                    }
                }
            }
        }

        if let Some(addr) = self.config.service.telemetry_endpoint {
            let server =
                TelemetryServer::bind(addr, Arc::clone(&self.stats), Arc::clone(&self.admission))
                    .await?;
            tracing::info!(addr = %server.local_addr()?, "Internal telemetry listening");
            self.spawn_server("telemetry", server.start(self.shutdown.subscribe()))
                .await;
        }

        tracing::debug!("Components started");
        Ok(())
    }

    async fn spawn_server<F>(&self, server: &'static str, fut: F)
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        let handle = tokio::spawn(async move {
            if let Err(e) = fut.await {
                tracing::error!(error = %e, server, "Server error");
            }
        });
        self.shutdown.register(handle).await;
    }
}
