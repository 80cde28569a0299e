use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use serde::Serialize;

use crate::consumer::{DropReason, Resolution};

/// Counters maintained by a consumer.
///
/// Counters are shared (`Arc`) between the consumer loop, its delivery
/// tasks and any external observer. They survive reconnects when the same
/// instance is handed to a [`Supervisor`](crate::consumer::Supervisor).
#[derive(Debug, Default)]
pub struct ConsumerStats {
    received: AtomicU64,
    redelivered: AtomicU64,
    acked: AtomicU64,
    requeued: AtomicU64,
    dead_lettered: AtomicU64,
    poisoned: AtomicU64,
    resolve_errors: AtomicU64,
    in_flight: AtomicU64,
    max_in_flight: AtomicU64,
    reconnects: AtomicU64,
}

/// Point-in-time copy of [`ConsumerStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ConsumerStatsSnapshot {
    pub received: u64,
    pub redelivered: u64,
    pub acked: u64,
    pub requeued: u64,
    pub dead_lettered: u64,
    pub poisoned: u64,
    pub resolve_errors: u64,
    pub in_flight: u64,
    pub max_in_flight: u64,
    pub reconnects: u64,
}

impl ConsumerStatsSnapshot {
    /// NACKs issued with `requeue = true`.
    pub fn nacked_requeue(&self) -> u64 {
        self.requeued
    }

    /// NACKs issued with `requeue = false`, poison and dead-letter alike.
    pub fn nacked_dropped(&self) -> u64 {
        self.dead_lettered + self.poisoned
    }
}

impl ConsumerStats {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn snapshot(&self) -> ConsumerStatsSnapshot {
        ConsumerStatsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            redelivered: self.redelivered.load(Ordering::Relaxed),
            acked: self.acked.load(Ordering::Relaxed),
            requeued: self.requeued.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            poisoned: self.poisoned.load(Ordering::Relaxed),
            resolve_errors: self.resolve_errors.load(Ordering::Relaxed),
            in_flight: self.in_flight.load(Ordering::Relaxed),
            max_in_flight: self.max_in_flight.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn record_received(&self, redelivered: bool) {
        self.received.fetch_add(1, Ordering::Relaxed);
        if redelivered {
            self.redelivered.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn record_resolution(&self, resolution: Resolution) {
        let counter = match resolution {
            Resolution::Acked => &self.acked,
            Resolution::NackedRequeue => &self.requeued,
            Resolution::NackedDropped(DropReason::DeadLetter) => &self.dead_lettered,
            Resolution::NackedDropped(DropReason::Poison) => &self.poisoned,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_resolve_error(&self) {
        self.resolve_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_reconnect(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
    }

    /// Mark a delivery as in flight until the guard drops.
    pub(crate) fn begin(self: &Arc<Self>) -> InFlight {
        let now = self.in_flight.fetch_add(1, Ordering::AcqRel) + 1;
        self.max_in_flight.fetch_max(now, Ordering::AcqRel);
        InFlight(Arc::clone(self))
    }
}

/// Decrements the in-flight gauge on drop, including when the delivery task
/// is aborted.
pub(crate) struct InFlight(Arc<ConsumerStats>);

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}
