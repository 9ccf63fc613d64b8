//! Relay orchestrators.
//!
//! One orchestrator per role, each a [`SpoolHandler`](crate::spool::SpoolHandler)
//! driven by the spool monitor. Failures are logged and the file dropped; no
//! stage is retried.

pub mod far;
pub mod gateway;
pub mod near;

use std::sync::atomic::{AtomicU64, Ordering};

pub use far::FarRelay;
pub use gateway::{Gateway, Resolution};
pub use near::NearRelay;

/// Counters for one orchestrator's lifetime.
#[derive(Debug, Default)]
pub struct RelayStats {
    /// Inbound deliveries handled, successfully or not
    pub deliveries: AtomicU64,

    /// Descriptors handed to the transport
    pub descriptors_sent: AtomicU64,

    /// Chunk archives handed to the transport
    pub chunks_sent: AtomicU64,

    /// Cache entries created by merges. A moved directory counts once
    pub entries_merged: AtomicU64,

    pub merge_collisions: AtomicU64,

    /// Files dropped on any error
    pub failures: AtomicU64,
}

/// Point-in-time copy of [`RelayStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct StatsSnapshot {
    pub deliveries: u64,
    pub descriptors_sent: u64,
    pub chunks_sent: u64,
    pub entries_merged: u64,
    pub merge_collisions: u64,
    pub failures: u64,
}

impl RelayStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            deliveries: self.deliveries.load(Ordering::Relaxed),
            descriptors_sent: self.descriptors_sent.load(Ordering::Relaxed),
            chunks_sent: self.chunks_sent.load(Ordering::Relaxed),
            entries_merged: self.entries_merged.load(Ordering::Relaxed),
            merge_collisions: self.merge_collisions.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn log(&self) {
        let s = self.snapshot();
        tracing::debug!(
            deliveries = s.deliveries,
            descriptors_sent = s.descriptors_sent,
            chunks_sent = s.chunks_sent,
            entries_merged = s.entries_merged,
            merge_collisions = s.merge_collisions,
            failures = s.failures,
            "relay stats"
        );
    }
}
