//! Memory admission control
//!
//! One process-wide controller guards estimated in-flight memory:
//! - A single atomic byte counter, moved through RAII [`Reservation`]s held by
//!   decode buffers, pipeline queues and open batches
//! - A sampler task that re-evaluates the refusing decision every check interval
//! - Hysteresis: refusing starts above the hard limit and only stops once usage
//!   falls below the soft limit
//!
//! Receivers call [`AdmissionController::admit`], which is a lock-free read of
//! the current decision.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::core::config::MemoryLimiterConfig;

/// Limits derived from the `memory_limiter` processor configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryLimits {
    /// Refusing starts when usage exceeds this
    pub hard_bytes: usize,
    /// Refusing stops once usage drops below this; pressure is flagged above it
    pub soft_bytes: usize,
    pub check_interval: Duration,
}

impl From<&MemoryLimiterConfig> for MemoryLimits {
    fn from(config: &MemoryLimiterConfig) -> Self {
        Self {
            hard_bytes: config.hard_limit_bytes(),
            soft_bytes: config.soft_limit_bytes(),
            check_interval: Duration::from_millis(config.check_interval_ms),
        }
    }
}

/// Outcome of a threshold evaluation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionState {
    /// Below the soft limit
    Normal,
    /// At or above the soft limit but still admitting
    Pressure,
    /// Rejecting new submissions
    Refusing,
}

#[derive(Debug, Error)]
#[error("memory limit exceeded: {usage_bytes} bytes in flight (limit {limit_bytes})")]
pub struct MemoryLimitExceeded {
    pub usage_bytes: usize,
    pub limit_bytes: usize,
}

/// Process-wide memory admission controller
pub struct AdmissionController {
    usage: Arc<AtomicUsize>,
    limits: Option<MemoryLimits>,
    refusing: AtomicBool,
    pressure: AtomicBool,
    refused: AtomicU64,
    /// Serializes threshold-crossing decisions
    state: Mutex<AdmissionState>,
}

impl AdmissionController {
    pub fn new(limits: Option<MemoryLimits>) -> Arc<Self> {
        Arc::new(Self {
            usage: Arc::new(AtomicUsize::new(0)),
            limits,
            refusing: AtomicBool::new(false),
            pressure: AtomicBool::new(false),
            refused: AtomicU64::new(0),
            state: Mutex::new(AdmissionState::Normal),
        })
    }

    /// Controller that never refuses (no `memory_limiter` configured)
    pub fn unlimited() -> Arc<Self> {
        Self::new(None)
    }

    pub fn limits(&self) -> Option<MemoryLimits> {
        self.limits
    }

    /// Check whether a new submission may enter.
    pub fn admit(&self) -> Result<(), MemoryLimitExceeded> {
        if !self.refusing.load(Ordering::Acquire) {
            return Ok(());
        }
        self.refused.fetch_add(1, Ordering::Relaxed);
        Err(MemoryLimitExceeded {
            usage_bytes: self.usage(),
            limit_bytes: self.limits.map(|l| l.hard_bytes).unwrap_or(usize::MAX),
        })
    }

    /// Account `bytes` as in flight until the returned reservation drops.
    pub fn reserve(&self, bytes: usize) -> Reservation {
        self.usage.fetch_add(bytes, Ordering::AcqRel);
        Reservation {
            usage: Arc::clone(&self.usage),
            bytes,
        }
    }

    pub fn usage(&self) -> usize {
        self.usage.load(Ordering::Acquire)
    }

    pub fn is_refusing(&self) -> bool {
        self.refusing.load(Ordering::Acquire)
    }

    /// True while usage is at or above the soft limit
    pub fn under_pressure(&self) -> bool {
        self.pressure.load(Ordering::Acquire)
    }

    pub fn refused_count(&self) -> u64 {
        self.refused.load(Ordering::Relaxed)
    }

    /// Re-evaluate the thresholds against current usage.
    pub fn check(&self) -> AdmissionState {
        let Some(limits) = self.limits else {
            return AdmissionState::Normal;
        };

        let usage = self.usage();
        let mut state = self.state.lock();
        let refusing = match *state {
            AdmissionState::Refusing => usage >= limits.soft_bytes,
            _ => usage > limits.hard_bytes,
        };
        let next = if refusing {
            AdmissionState::Refusing
        } else if usage >= limits.soft_bytes {
            AdmissionState::Pressure
        } else {
            AdmissionState::Normal
        };

        if next != *state {
            match next {
                AdmissionState::Refusing => tracing::warn!(
                    usage_bytes = usage,
                    hard_limit_bytes = limits.hard_bytes,
                    "Memory limit exceeded, refusing new data"
                ),
                _ if *state == AdmissionState::Refusing => tracing::info!(
                    usage_bytes = usage,
                    soft_limit_bytes = limits.soft_bytes,
                    "Memory usage below soft limit, accepting data again"
                ),
                _ => tracing::debug!(usage_bytes = usage, state = ?next, "Memory state changed"),
            }
            *state = next;
        }

        self.refusing
            .store(next == AdmissionState::Refusing, Ordering::Release);
        self.pressure
            .store(next != AdmissionState::Normal, Ordering::Release);
        next
    }

    /// Spawn the periodic sampler. Returns `None` when no limits are configured.
    pub fn start_sampler(
        self: &Arc<Self>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) -> Option<JoinHandle<()>> {
        let limits = self.limits?;
        let controller = Arc::clone(self);

        Some(tokio::spawn(async move {
            tracing::debug!(
                hard_limit_bytes = limits.hard_bytes,
                soft_limit_bytes = limits.soft_bytes,
                interval_ms = limits.check_interval.as_millis() as u64,
                "Memory limiter started"
            );
            let mut ticker = tokio::time::interval(limits.check_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;
                    _ = shutdown_rx.wait_for(|&v| v) => break,
                    _ = ticker.tick() => {
                        controller.check();
                    }
                }
            }
            tracing::debug!("Memory limiter stopped");
        }))
    }
}

/// Bytes accounted against the controller until dropped
#[derive(Debug)]
pub struct Reservation {
    usage: Arc<AtomicUsize>,
    bytes: usize,
}

impl Reservation {
    pub fn bytes(&self) -> usize {
        self.bytes
    }

    /// Take over another reservation's bytes.
    pub fn merge(&mut self, mut other: Reservation) {
        debug_assert!(Arc::ptr_eq(&self.usage, &other.usage));
        self.bytes += std::mem::take(&mut other.bytes);
    }

    /// Give back up to `bytes` early, keeping the rest reserved.
    pub fn release(&mut self, bytes: usize) {
        let bytes = bytes.min(self.bytes);
        self.bytes -= bytes;
        self.usage.fetch_sub(bytes, Ordering::AcqRel);
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if self.bytes > 0 {
            self.usage.fetch_sub(self.bytes, Ordering::AcqRel);
        }
    }
}
