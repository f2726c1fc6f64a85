//! Software loopback backend.
//!
//! Stands in for a vendor radio behind the [`crate::driver`] traits:
//! receive packets are fabricated with hardware-style timestamps, paced
//! by the host monotonic clock at the negotiated sample rate, and
//! transmit packets are consumed and acknowledged with a burst ack. This
//! lets the full pipeline run on a host with no radio attached; hardware
//! backends implement the same traits out of tree.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender};
use num_complex::Complex;

use crate::driver::{
    AsyncEvent, AsyncEventStream, RefSource, RxError, RxMetadata, RxStream, StreamCommand,
    TimeSpec, TxMetadata, TxStream, Usrp,
};

/// Samples per fabricated receive packet.
const SIM_SPP: usize = 256;

/// Poll granularity while waiting for the sample clock to catch up.
const PACE_SLEEP: Duration = Duration::from_micros(200);

/// Nanoseconds since the process first asked. Only has to tick steadily
/// enough to pace the fabricated sample stream.
fn now_ns() -> u64 {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    EPOCH.get_or_init(Instant::now).elapsed().as_nanos() as u64
}

/// Discover the first matching loopback device. `args` uses the vendor
/// `key=value,...` form; the `type` key selects the simulated model and
/// defaults to a B200.
pub fn find(args: &str) -> Option<Box<dyn Usrp>> {
    let requested = args
        .split(',')
        .filter_map(|kv| kv.trim().split_once('='))
        .find(|(k, _)| k.trim() == "type")
        .map(|(_, v)| v.trim().to_ascii_lowercase());

    let model = match requested.as_deref() {
        None | Some("") | Some("b200") => "B200",
        Some("b210") => "B210",
        Some("b100") => "B100",
        Some("x300") => "X300",
        Some("x310") => "X310",
        Some("usrp2") | Some("n2xx") => "USRP2",
        Some("umtrx") => "UmTRX",
        Some("usrp1") => "USRP1",
        Some(_) => return None,
    };
    Some(Box::new(SimUsrp::new(format!("Sim Device {model}"))))
}

/// State shared between the device handle and its streams.
struct SimState {
    streaming: AtomicBool,
    /// Monotonic nanos at the last device-clock set.
    epoch_ns: AtomicU64,
    /// Device ticks at the epoch.
    base_ticks: AtomicU64,
    /// Next receive tick to fabricate.
    next_tick: AtomicU64,
    rx_rate_bits: AtomicU64,
    event_tx: Sender<AsyncEvent>,
    event_rx: Receiver<AsyncEvent>,
}

impl SimState {
    fn new() -> Arc<Self> {
        let (event_tx, event_rx) = crossbeam_channel::bounded(256);
        Arc::new(Self {
            streaming: AtomicBool::new(false),
            epoch_ns: AtomicU64::new(now_ns()),
            base_ticks: AtomicU64::new(0),
            next_tick: AtomicU64::new(0),
            rx_rate_bits: AtomicU64::new(1f64.to_bits()),
            event_tx,
            event_rx,
        })
    }

    fn rx_rate(&self) -> f64 {
        f64::from_bits(self.rx_rate_bits.load(Ordering::Relaxed))
    }

    /// Current device time in RX-rate ticks.
    fn now_ticks(&self) -> u64 {
        let elapsed = now_ns().saturating_sub(self.epoch_ns.load(Ordering::Relaxed));
        self.base_ticks.load(Ordering::Relaxed) + (elapsed as f64 * self.rx_rate() / 1e9) as u64
    }

    fn set_time(&self, time: TimeSpec) {
        let ticks = time.to_ticks(self.rx_rate());
        self.epoch_ns.store(now_ns(), Ordering::Relaxed);
        self.base_ticks.store(ticks, Ordering::Relaxed);
        self.next_tick.store(ticks, Ordering::Relaxed);
    }
}

pub struct SimUsrp {
    state: Arc<SimState>,
    name: String,
    master_clock: f64,
    tx_rate: f64,
    rx_rate: f64,
    tx_freq: f64,
    rx_freq: f64,
    tx_gain: f64,
    rx_gain: f64,
}

impl SimUsrp {
    fn new(name: String) -> Self {
        Self {
            state: SimState::new(),
            name,
            master_clock: 0.0,
            tx_rate: 0.0,
            rx_rate: 0.0,
            tx_freq: 0.0,
            rx_freq: 0.0,
            tx_gain: 0.0,
            rx_gain: 0.0,
        }
    }
}

impl Usrp for SimUsrp {
    fn model_name(&self) -> String {
        self.name.clone()
    }

    fn set_clock_source(&mut self, _source: RefSource) {}

    fn set_master_clock_rate(&mut self, rate: f64) {
        self.master_clock = rate;
    }

    fn master_clock_rate(&self) -> f64 {
        self.master_clock
    }

    fn set_tx_rate(&mut self, rate: f64) {
        self.tx_rate = rate;
    }

    fn set_rx_rate(&mut self, rate: f64) {
        self.rx_rate = rate;
        self.state
            .rx_rate_bits
            .store(rate.to_bits(), Ordering::Relaxed);
    }

    fn tx_rate(&self) -> f64 {
        self.tx_rate
    }

    fn rx_rate(&self) -> f64 {
        self.rx_rate
    }

    fn set_tx_freq(&mut self, freq: f64) -> f64 {
        self.tx_freq = freq;
        freq
    }

    fn set_rx_freq(&mut self, freq: f64) -> f64 {
        self.rx_freq = freq;
        freq
    }

    fn tx_freq(&self) -> f64 {
        self.tx_freq
    }

    fn rx_freq(&self) -> f64 {
        self.rx_freq
    }

    fn tx_gain_range(&self) -> (f64, f64) {
        (0.0, 89.8)
    }

    fn rx_gain_range(&self) -> (f64, f64) {
        (0.0, 76.0)
    }

    fn set_tx_gain(&mut self, gain: f64) -> f64 {
        self.tx_gain = gain.clamp(0.0, 89.8);
        self.tx_gain
    }

    fn set_rx_gain(&mut self, gain: f64) -> f64 {
        self.rx_gain = gain.clamp(0.0, 76.0);
        self.rx_gain
    }

    fn set_time_now(&mut self, time: TimeSpec) {
        self.state.set_time(time);
    }

    fn time_now(&self) -> TimeSpec {
        TimeSpec::from_ticks(self.state.now_ticks(), self.state.rx_rate())
    }

    fn tx_stream(&mut self, _format: &str) -> Box<dyn TxStream> {
        Box::new(SimTxStream {
            state: self.state.clone(),
        })
    }

    fn rx_stream(&mut self, _format: &str) -> Box<dyn RxStream> {
        Box::new(SimRxStream {
            state: self.state.clone(),
        })
    }

    fn async_event_stream(&mut self) -> Box<dyn AsyncEventStream> {
        Box::new(SimAsyncStream {
            events: self.state.event_rx.clone(),
        })
    }
}

struct SimRxStream {
    state: Arc<SimState>,
}

impl RxStream for SimRxStream {
    fn recv(
        &mut self,
        buf: &mut [Complex<i16>],
        timeout: Duration,
        _one_packet: bool,
    ) -> (usize, RxMetadata) {
        let timed_out = RxMetadata {
            time_spec: None,
            error: Some(RxError::Timeout),
        };

        if !self.state.streaming.load(Ordering::Acquire) {
            std::thread::sleep(timeout);
            return (0, timed_out);
        }

        let len = buf.len().min(SIM_SPP);
        let start = self.state.next_tick.load(Ordering::Relaxed);
        let begin = Instant::now();

        // Pace delivery: the packet exists once its last sample's time
        // has passed.
        loop {
            if !self.state.streaming.load(Ordering::Acquire) {
                return (0, timed_out);
            }
            if self.state.now_ticks() >= start + len as u64 {
                break;
            }
            if begin.elapsed() >= timeout {
                return (0, timed_out);
            }
            std::thread::sleep(PACE_SLEEP);
        }

        buf[..len].fill(Complex::new(0, 0));
        self.state.next_tick.store(start + len as u64, Ordering::Relaxed);
        (
            len,
            RxMetadata {
                time_spec: Some(TimeSpec::from_ticks(start, self.state.rx_rate())),
                error: None,
            },
        )
    }

    fn issue_stream_cmd(&mut self, cmd: StreamCommand) {
        match cmd {
            StreamCommand::StartContinuous { stream_now } => {
                if stream_now {
                    self.state
                        .next_tick
                        .store(self.state.now_ticks(), Ordering::Relaxed);
                }
                self.state.streaming.store(true, Ordering::Release);
            }
            StreamCommand::StopContinuous => {
                self.state.streaming.store(false, Ordering::Release);
            }
        }
    }

    fn max_num_samps(&self) -> usize {
        SIM_SPP
    }
}

struct SimTxStream {
    state: Arc<SimState>,
}

impl TxStream for SimTxStream {
    fn send(&mut self, buf: &[Complex<i16>], _metadata: &TxMetadata) -> usize {
        if !buf.is_empty() {
            let _ = self.state.event_tx.try_send(AsyncEvent::BurstAck);
        }
        buf.len()
    }

    fn max_num_samps(&self) -> usize {
        SIM_SPP
    }
}

struct SimAsyncStream {
    events: Receiver<AsyncEvent>,
}

impl AsyncEventStream for SimAsyncStream {
    fn recv(&mut self, timeout: Duration) -> Option<AsyncEvent> {
        self.events.recv_timeout(timeout).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_models() {
        assert!(find("").unwrap().model_name().contains("B200"));
        assert!(find("type=b100").unwrap().model_name().contains("B100"));
        assert!(find("type=umtrx").unwrap().model_name().contains("UmTRX"));
        assert!(find("type=x310, name=lab").unwrap().model_name().contains("X310"));
        assert!(find("type=frobco").is_none());
    }

    #[test]
    fn test_recv_times_out_when_stopped() {
        let mut usrp = SimUsrp::new("Sim Device B200".into());
        usrp.set_rx_rate(1_000_000.0);
        let mut stream = usrp.rx_stream("sc16");
        let mut buf = vec![Complex::new(0i16, 0); 64];
        let (n, md) = stream.recv(&mut buf, Duration::from_millis(1), true);
        assert_eq!(n, 0);
        assert_eq!(md.error, Some(RxError::Timeout));
    }

    #[test]
    fn test_packets_are_timestamped_and_monotonic() {
        let mut usrp = SimUsrp::new("Sim Device B200".into());
        usrp.set_rx_rate(1_000_000.0);
        usrp.set_time_now(TimeSpec::from_secs(0.0));
        let mut stream = usrp.rx_stream("sc16");
        stream.issue_stream_cmd(StreamCommand::StartContinuous { stream_now: true });

        let mut buf = vec![Complex::new(0i16, 0); 64];
        let mut last = 0u64;
        for i in 0..4 {
            let (n, md) = stream.recv(&mut buf, Duration::from_secs(1), true);
            assert_eq!(n, 64);
            let ticks = md.time_spec.unwrap().to_ticks(1_000_000.0);
            if i > 0 {
                assert_eq!(ticks, last + 64);
            }
            last = ticks;
        }
    }

    #[test]
    fn test_clock_reset_rebases_stream() {
        let mut usrp = SimUsrp::new("Sim Device B200".into());
        usrp.set_rx_rate(1_000_000.0);
        usrp.set_time_now(TimeSpec::from_secs(1.0));
        assert!(usrp.time_now().secs() >= 1.0);

        let mut stream = usrp.rx_stream("sc16");
        stream.issue_stream_cmd(StreamCommand::StartContinuous { stream_now: true });
        let mut buf = vec![Complex::new(0i16, 0); 16];
        let (_, md) = stream.recv(&mut buf, Duration::from_secs(1), true);
        assert!(md.time_spec.unwrap().secs() >= 1.0);
    }

    #[test]
    fn test_tx_send_acks() {
        let mut usrp = SimUsrp::new("Sim Device B200".into());
        let mut tx = usrp.tx_stream("sc16");
        let mut events = usrp.async_event_stream();

        let md = TxMetadata::default();
        assert_eq!(tx.send(&[Complex::new(1, 1); 8], &md), 8);
        assert_eq!(
            events.recv(Duration::from_millis(100)),
            Some(AsyncEvent::BurstAck)
        );
        // Zero-length signalling sends produce no ack.
        assert_eq!(tx.send(&[], &md), 0);
        assert_eq!(events.recv(Duration::from_millis(10)), None);
    }
}
