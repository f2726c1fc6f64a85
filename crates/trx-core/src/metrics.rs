//! Pipeline counters.
//!
//! One shared set of atomic counters covers the device and both pump
//! paths. All writes use Relaxed ordering; these are sampling counters,
//! not synchronisation.

use std::sync::atomic::{AtomicU64, Ordering::Relaxed};
use std::sync::Arc;

use serde::Serialize;

#[derive(Default)]
pub struct TrxMetrics {
    /// Packets drained from the device receive stream.
    pub rx_packets: AtomicU64,
    /// Device restarts after a loss of timestamp monotonicity.
    pub timing_restarts: AtomicU64,
    /// Sample-buffer overruns (host reader falling behind the stream).
    pub buffer_overflows: AtomicU64,
    /// Writes swallowed by the TX alignment state machine.
    pub aligned_drops: AtomicU64,
    /// Async underflow events (counted silently).
    pub underflows: AtomicU64,
    /// Async time-error events (counted silently).
    pub time_errors: AtomicU64,
    /// Other async events (logged as they arrive).
    pub async_events: AtomicU64,
    /// Bursts carved from the receive stream.
    pub bursts_carved: AtomicU64,
    /// Outbound bursts discarded because their time had passed.
    pub bursts_stale: AtomicU64,
    /// Idle slots zero-filled on the transmit path.
    pub zero_fill_slots: AtomicU64,
    /// Latched underrun observations.
    pub underruns: AtomicU64,
    /// Latched overrun observations.
    pub overruns: AtomicU64,
}

/// Plain-struct snapshot for display and journaling.
#[derive(Debug, Clone, Serialize)]
pub struct TrxMetricsSnapshot {
    pub rx_packets: u64,
    pub timing_restarts: u64,
    pub buffer_overflows: u64,
    pub aligned_drops: u64,
    pub underflows: u64,
    pub time_errors: u64,
    pub async_events: u64,
    pub bursts_carved: u64,
    pub bursts_stale: u64,
    pub zero_fill_slots: u64,
    pub underruns: u64,
    pub overruns: u64,
}

impl TrxMetrics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn snapshot(&self) -> TrxMetricsSnapshot {
        TrxMetricsSnapshot {
            rx_packets: self.rx_packets.load(Relaxed),
            timing_restarts: self.timing_restarts.load(Relaxed),
            buffer_overflows: self.buffer_overflows.load(Relaxed),
            aligned_drops: self.aligned_drops.load(Relaxed),
            underflows: self.underflows.load(Relaxed),
            time_errors: self.time_errors.load(Relaxed),
            async_events: self.async_events.load(Relaxed),
            bursts_carved: self.bursts_carved.load(Relaxed),
            bursts_stale: self.bursts_stale.load(Relaxed),
            zero_fill_slots: self.zero_fill_slots.load(Relaxed),
            underruns: self.underruns.load(Relaxed),
            overruns: self.overruns.load(Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot() {
        let m = TrxMetrics::new();
        m.rx_packets.fetch_add(100, Relaxed);
        m.bursts_carved.fetch_add(42, Relaxed);
        let s = m.snapshot();
        assert_eq!(s.rx_packets, 100);
        assert_eq!(s.bursts_carved, 42);
        assert_eq!(s.underruns, 0);
    }
}
