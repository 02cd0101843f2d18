//! Batcher
//!
//! Accumulates processed items into an open batch and seals it when it
//! reaches `send_batch_size` or when the timeout elapses since its first item,
//! whichever comes first. Owned and driven by one pipeline task, so seal and
//! rotate never race.

use std::time::Duration;

use tokio::time::Instant;

use crate::core::config::BatchConfig;
use crate::core::constants::PRESSURE_TIMEOUT_DIVISOR;

use super::admission::Reservation;
use super::signal::{Batch, SignalItem, SignalType};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchSettings {
    pub max_items: usize,
    pub timeout: Duration,
}

impl From<&BatchConfig> for BatchSettings {
    fn from(config: &BatchConfig) -> Self {
        Self {
            max_items: config.send_batch_size.max(1),
            timeout: Duration::from_millis(config.timeout_ms),
        }
    }
}

pub struct Batcher {
    signal: SignalType,
    settings: BatchSettings,
    items: Vec<SignalItem>,
    size_bytes: usize,
    opened_at: Option<Instant>,
    /// Memory held by the open batch
    reservation: Option<Reservation>,
    next_sequence: u64,
}

impl Batcher {
    pub fn new(signal: SignalType, settings: BatchSettings) -> Self {
        Self {
            signal,
            settings,
            items: Vec::with_capacity(settings.max_items.min(4096)),
            size_bytes: 0,
            opened_at: None,
            reservation: None,
            next_sequence: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Append items, returning every batch that filled up.
    ///
    /// A submission larger than the remaining room spills into consecutive
    /// batches; no sealed batch exceeds `max_items`.
    pub fn push(&mut self, items: Vec<SignalItem>, reservation: Reservation) -> Vec<Batch> {
        match &mut self.reservation {
            Some(held) => held.merge(reservation),
            None => self.reservation = Some(reservation),
        }

        let mut sealed = Vec::new();
        for item in items {
            if self.items.is_empty() {
                self.opened_at = Some(Instant::now());
            }
            self.size_bytes += item.size_bytes();
            self.items.push(item);
            if self.items.len() >= self.settings.max_items
                && let Some(batch) = self.take_open()
            {
                sealed.push(batch);
            }
        }

        if self.items.is_empty() {
            // everything filtered or sealed; nothing left to hold memory for
            self.reservation = None;
        }
        sealed
    }

    /// When the open batch must be sealed, if there is one
    pub fn deadline(&self, under_pressure: bool) -> Option<Instant> {
        let timeout = if under_pressure {
            self.settings.timeout / PRESSURE_TIMEOUT_DIVISOR
        } else {
            self.settings.timeout
        };
        self.opened_at.map(|opened| opened + timeout)
    }

    /// Seal the open batch and release all memory held by the batcher.
    pub fn seal(&mut self) -> Option<Batch> {
        let batch = self.take_open();
        self.reservation = None;
        batch
    }

    /// Seal the open batch, releasing only the bytes it accounted for.
    fn take_open(&mut self) -> Option<Batch> {
        if self.items.is_empty() {
            return None;
        }

        let items = std::mem::replace(
            &mut self.items,
            Vec::with_capacity(self.settings.max_items.min(4096)),
        );
        let size_bytes = std::mem::take(&mut self.size_bytes);
        self.opened_at = None;
        if let Some(reservation) = &mut self.reservation {
            reservation.release(size_bytes);
        }

        let sequence = self.next_sequence;
        self.next_sequence += 1;
        Some(Batch::seal(self.signal, sequence, items, size_bytes))
    }
}
