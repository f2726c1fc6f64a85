//! GSM bursts and the time-ordered queues that carry them.
//!
//! Outbound bursts wait in a [`BurstQueue`] keyed by their GSM time until
//! the transmit deadline clock reaches them; inbound bursts are handed to
//! the upper layer through a bounded FIFO channel.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::sync::Condvar;

use crossbeam_channel::{Receiver, Sender};
use num_complex::Complex;

use crate::gsm_time::GsmTime;
use crate::sync::WatchdogMutex;

/// Complex baseband samples on the GSM-symbol-rate side.
pub type SignalVector = Vec<Complex<f32>>;

/// Depth of the received-burst FIFO between the RX pump and the upper
/// layer. The pump backs off well before this fills.
const FIFO_DEPTH: usize = 64;

/// A burst of symbol-rate samples tagged with its GSM time.
#[derive(Debug, Clone, PartialEq)]
pub struct Burst {
    samples: SignalVector,
    time: GsmTime,
}

impl Burst {
    pub fn new(samples: SignalVector, time: GsmTime) -> Self {
        Self { samples, time }
    }

    pub fn time(&self) -> GsmTime {
        self.time
    }

    pub fn set_time(&mut self, time: GsmTime) {
        self.time = time;
    }

    pub fn samples(&self) -> &[Complex<f32>] {
        &self.samples
    }

    pub fn into_samples(self) -> SignalVector {
        self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// FIFO channel carrying received bursts to the upper layer.
pub fn burst_fifo() -> (Sender<Burst>, Receiver<Burst>) {
    crossbeam_channel::bounded(FIFO_DEPTH)
}

/// Heap entry: modular time order, insertion order on ties.
struct Entry {
    burst: Burst,
    seq: u64,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.burst.time() == other.burst.time() && self.seq == other.seq
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.burst
            .time()
            .cmp(&other.burst.time())
            .then(self.seq.cmp(&other.seq))
    }
}

#[derive(Default)]
struct QueueState {
    heap: BinaryHeap<Reverse<Entry>>,
    next_seq: u64,
}

/// Priority queue of outbound bursts, earliest GSM time first.
///
/// All operations are atomic under one internal lock; pushes signal the
/// condvar that [`BurstQueue::next_time`] waits on.
#[derive(Default)]
pub struct BurstQueue {
    state: WatchdogMutex<QueueState>,
    write_signal: Condvar,
}

impl BurstQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, burst: Burst) {
        let mut state = self.state.lock();
        let seq = state.next_seq;
        state.next_seq += 1;
        state.heap.push(Reverse(Entry { burst, seq }));
        self.write_signal.notify_all();
    }

    pub fn len(&self) -> usize {
        self.state.lock().heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().heap.is_empty()
    }

    /// The time of the earliest queued burst. Blocks while the queue is
    /// empty; call it only when a burst is expected.
    pub fn next_time(&self) -> GsmTime {
        let mut state = self.state.lock();
        loop {
            if let Some(top) = state.heap.peek() {
                return top.0.burst.time();
            }
            state = self
                .write_signal
                .wait(state)
                .unwrap_or_else(|p| p.into_inner());
        }
    }

    /// Pop the earliest burst if its time is before `target`.
    pub fn get_stale(&self, target: GsmTime) -> Option<Burst> {
        let mut state = self.state.lock();
        let stale = matches!(state.heap.peek(), Some(top) if top.0.burst.time() < target);
        if stale {
            state.heap.pop().map(|e| e.0.burst)
        } else {
            None
        }
    }

    /// Pop the earliest burst if its time equals `target`.
    pub fn get_current(&self, target: GsmTime) -> Option<Burst> {
        let mut state = self.state.lock();
        let due = matches!(state.heap.peek(), Some(top) if top.0.burst.time() == target);
        if due {
            state.heap.pop().map(|e| e.0.burst)
        } else {
            None
        }
    }
}
