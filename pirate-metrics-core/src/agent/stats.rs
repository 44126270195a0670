//! Delivery counters shared by the agent and its worker

use std::sync::atomic::{AtomicU64, Ordering};

/// Atomic counter wrapper
#[derive(Debug, Default)]
pub(crate) struct Counter(AtomicU64);

impl Counter {
    #[inline]
    pub(crate) fn add(&self, val: u64) {
        self.0.fetch_add(val, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn inc(&self) {
        self.add(1);
    }

    #[inline]
    pub(crate) fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Default)]
pub(crate) struct Stats {
    pub(crate) enqueued: Counter,
    pub(crate) dropped_overflow: Counter,
    pub(crate) delivered: Counter,
    pub(crate) records_delivered: Counter,
    pub(crate) failures: Counter,
    pub(crate) retries: Counter,
    pub(crate) abandoned: Counter,
    pub(crate) connects: Counter,
}

impl Stats {
    pub(crate) fn snapshot(&self) -> DeliveryStats {
        DeliveryStats {
            enqueued: self.enqueued.get(),
            dropped_overflow: self.dropped_overflow.get(),
            delivered: self.delivered.get(),
            records_delivered: self.records_delivered.get(),
            failures: self.failures.get(),
            retries: self.retries.get(),
            abandoned: self.abandoned.get(),
            connects: self.connects.get(),
        }
    }
}

/// Point-in-time view of an agent's delivery counters
///
/// Counters accumulate over the agent's lifetime, across worker restarts.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryStats {
    /// Metric envelopes accepted onto the queue
    pub enqueued: u64,
    /// Metric envelopes rejected because the queue was full
    pub dropped_overflow: u64,
    /// Metric envelopes the collector accepted
    pub delivered: u64,
    /// Records inside delivered envelopes
    pub records_delivered: u64,
    /// Failed transport attempts
    pub failures: u64,
    /// Envelopes put back on the queue after a failure
    pub retries: u64,
    /// Envelopes given up on: failed without retry, or discarded by stop
    pub abandoned: u64,
    /// Transports opened by workers
    pub connects: u64,
}
