//! Timestamped device I/O.
//!
//! Wraps a [`Usrp`] handle behind the open/start/stop lifecycle. Received
//! packets are collected and aligned in an intermediate sample buffer;
//! transmit writes run through an alignment state machine that swallows a
//! warm-up window of packets whenever synchronisation is lost. Events and
//! errors such as underruns are reported asynchronously by the device and
//! received on a dedicated thread.

use std::sync::atomic::{AtomicBool, Ordering, Ordering::Relaxed};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use num_complex::Complex;
use tracing::{debug, error, info, warn};

use crate::driver::{
    AsyncEvent, RefSource, RxError, RxStream, StreamCommand, TimeSpec, TxMetadata, TxStream, Usrp,
    STREAM_FORMAT,
};
use crate::error::{Error, Result};
use crate::metrics::TrxMetrics;
use crate::sample_buf::SampleBuffer;
use crate::Timestamp;

/// GSM symbol rate, 1625/6 kHz.
pub const GSM_RATE: f64 = 1_625_000.0 / 6.0;

/// B2XX FPGA master clock rate.
const B2XX_CLOCK_RATE: f64 = 26e6;
/// Base sample rate for N2XX and X3XX devices: the minimum usable channel
/// spacing of 400 kHz does not divide their master clocks, so they run at
/// this rate and resample.
const USRP2_BASE_RATE: f64 = 390_625.0;
const B100_BASE_RATE: f64 = 400_000.0;

/// Receive sample buffer size, counted in I/Q pairs.
const SAMPLE_BUF_SZ: usize = (1 << 20) / 4;

/// Digital transmit amplitude relative to full scale.
const TX_AMPL: f64 = 0.3;

/// Full-scale DAC/ADC magnitude of the sc16 wire format.
const FULL_SCALE: f64 = 32_000.0;

/// Writes swallowed before a transmit realignment completes. Empirical
/// warm-up window: the device absorbs this many packets before resuming
/// timestamped transmission.
pub const ALIGNMENT_DROP_LIMIT: usize = 30;

/// Packets drained when restarting the receive stream.
const RESTART_FLUSH_PACKETS: usize = 50;

/// Rate tolerance accepted after negotiation, in Hz.
const RATE_OFFSET_LIMIT: f64 = 1.0;

/// Device family, parsed from the discovery name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceModel {
    Usrp1,
    Usrp2,
    B100,
    B2xx,
    X3xx,
    Umtrx,
}

impl DeviceModel {
    fn parse(name: &str) -> Option<Self> {
        if name.contains("USRP1") {
            Some(DeviceModel::Usrp1)
        } else if name.contains("B100") {
            Some(DeviceModel::B100)
        } else if name.contains("B200") || name.contains("B210") {
            Some(DeviceModel::B2xx)
        } else if name.contains("X300") || name.contains("X310") {
            Some(DeviceModel::X3xx)
        } else if name.contains("USRP2") {
            Some(DeviceModel::Usrp2)
        } else if name.contains("UmTRX") {
            Some(DeviceModel::Umtrx)
        } else {
            None
        }
    }

    fn base_rate(&self) -> f64 {
        match self {
            DeviceModel::Usrp2 | DeviceModel::X3xx => USRP2_BASE_RATE,
            DeviceModel::B100 => B100_BASE_RATE,
            DeviceModel::B2xx | DeviceModel::Umtrx => GSM_RATE,
            DeviceModel::Usrp1 => 0.0,
        }
    }
}

/// Radio-interface variant required by the negotiated sample rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDispatch {
    /// Device runs at a multiple of the GSM symbol rate.
    Normal,
    /// 64 MHz-clocked device; 65/96 resampling.
    Resamp64M,
    /// 100 MHz-clocked device; 52/75 resampling.
    Resamp100M,
}

/// Empirical TX/RX sample offsets in seconds, keyed by (model, sps),
/// measured with a loopback test. Group delay through analog components
/// and digital filters never quite matches the calculated values; these
/// absorb the residual.
const DEV_OFFSETS: &[(DeviceModel, u32, f64)] = &[
    (DeviceModel::Usrp2, 1, 1.2184e-4),
    (DeviceModel::Usrp2, 4, 8.0230e-5),
    (DeviceModel::B100, 1, 1.2104e-4),
    (DeviceModel::B100, 4, 7.9307e-5),
    (DeviceModel::B2xx, 1, 9.9692e-5),
    (DeviceModel::B2xx, 4, 6.9248e-5),
    (DeviceModel::X3xx, 1, 1.5360e-4),
    (DeviceModel::X3xx, 4, 1.1264e-4),
    (DeviceModel::Umtrx, 1, 9.9692e-5),
    (DeviceModel::Umtrx, 4, 7.3846e-5),
];

fn dev_offset(model: DeviceModel, sps: u32) -> f64 {
    for &(m, s, offset) in DEV_OFFSETS {
        if m == model && s == sps {
            return offset;
        }
    }
    warn!(?model, sps, "unsupported configuration, no timing correction applied");
    0.0
}

/// State owned by the receive path; touched only from the RX pump thread.
struct RxChain {
    stream: Box<dyn RxStream>,
    smpl_buf: SampleBuffer,
    /// Packet-sized receive scratch.
    pkt: Vec<Complex<i16>>,
    prev_ts: TimeSpec,
}

/// State owned by the transmit path; touched only from the TX pump thread.
struct TxChain {
    stream: Box<dyn TxStream>,
    drop_cnt: usize,
}

/// State visible to the async event thread.
struct Shared {
    /// TX/RX synchronisation state. Cleared with Release by the async
    /// event thread, read with Acquire by the TX write path.
    aligned: AtomicBool,
    shutdown: AtomicBool,
}

/// Shadowed tuning state.
struct RadioState {
    tx_freq: f64,
    rx_freq: f64,
    tx_gain: f64,
    rx_gain: f64,
}

pub struct Device {
    usrp: Mutex<Box<dyn Usrp>>,
    rx: Mutex<RxChain>,
    tx: Mutex<TxChain>,
    shared: Arc<Shared>,
    started: AtomicBool,
    async_thread: Mutex<Option<JoinHandle<()>>>,
    state: Mutex<RadioState>,
    metrics: Arc<TrxMetrics>,
    model: DeviceModel,
    tx_rate: f64,
    rx_rate: f64,
    ts_offset: Timestamp,
    tx_gain_range: (f64, f64),
    rx_gain_range: (f64, f64),
}

impl Device {
    /// Configure an opened device handle: parse the model, set the
    /// reference clock, negotiate sample rates, create the sc16 streamers
    /// and size the receive buffer. Returns the device plus the
    /// rate-conversion dispatch code for the radio interface above.
    ///
    /// The USRP1 is rejected: it has no hardware timestamps.
    pub fn open(mut usrp: Box<dyn Usrp>, ref_clock: RefSource, sps: u32) -> Result<(Self, RateDispatch)> {
        if sps != 1 && sps != 4 {
            return Err(Error::InvalidArgument("samples-per-symbol must be 1 or 4"));
        }

        let name = usrp.model_name();
        let model = DeviceModel::parse(&name)
            .ok_or(Error::InvalidArgument("unknown device type"))?;
        if model == DeviceModel::Usrp1 {
            error!("USRP1 is not supported: no timestamped samples");
            return Err(Error::InvalidArgument("USRP1 has no hardware timestamps"));
        }
        info!(device = %name, "using discovered device");

        usrp.set_clock_source(ref_clock);

        // B2XX is the only device where we set FPGA clocking.
        if model == DeviceModel::B2xx {
            usrp.set_master_clock_rate(B2XX_CLOCK_RATE);
            let actual = usrp.master_clock_rate();
            if (actual - B2XX_CLOCK_RATE).abs() > RATE_OFFSET_LIMIT {
                error!(requested = B2XX_CLOCK_RATE, actual, "failed to set master clock rate");
                return Err(Error::Unhandled("master clock rate differs from requested".into()));
            }
        }

        // The receive path always runs at 1 sps; only the downlink is
        // oversampled.
        let tx_rate = model.base_rate() * f64::from(sps);
        let rx_rate = tx_rate / f64::from(sps);
        usrp.set_tx_rate(tx_rate);
        usrp.set_rx_rate(rx_rate);
        let actual_tx = usrp.tx_rate();
        let actual_rx = usrp.rx_rate();
        if (actual_tx - tx_rate).abs() > RATE_OFFSET_LIMIT
            || (actual_rx - rx_rate).abs() > RATE_OFFSET_LIMIT
        {
            error!(tx = actual_tx, rx = actual_rx, "actual sample rate differs from desired rate");
            return Err(Error::Unhandled("sample rate negotiation failed".into()));
        }

        let tx_stream = usrp.tx_stream(STREAM_FORMAT);
        let rx_stream = usrp.rx_stream(STREAM_FORMAT);
        let rx_spp = rx_stream.max_num_samps();

        let offset = dev_offset(model, sps);
        let ts_offset = (offset * actual_rx).round() as Timestamp;

        // Shadow gains at mid-range.
        let tx_gain_range = usrp.tx_gain_range();
        let rx_gain_range = usrp.rx_gain_range();
        let tx_gain = usrp.set_tx_gain((tx_gain_range.0 + tx_gain_range.1) / 2.0);
        let rx_gain = usrp.set_rx_gain((rx_gain_range.0 + rx_gain_range.1) / 2.0);

        let dispatch = match model {
            DeviceModel::B100 => RateDispatch::Resamp64M,
            DeviceModel::Usrp2 | DeviceModel::X3xx => RateDispatch::Resamp100M,
            _ => RateDispatch::Normal,
        };

        info!(?model, tx_rate = actual_tx, rx_rate = actual_rx, ts_offset, "device configured");

        let device = Self {
            usrp: Mutex::new(usrp),
            rx: Mutex::new(RxChain {
                stream: rx_stream,
                smpl_buf: SampleBuffer::new(SAMPLE_BUF_SZ),
                pkt: vec![Complex::new(0, 0); rx_spp],
                prev_ts: TimeSpec::default(),
            }),
            tx: Mutex::new(TxChain {
                stream: tx_stream,
                drop_cnt: 0,
            }),
            shared: Arc::new(Shared {
                aligned: AtomicBool::new(false),
                shutdown: AtomicBool::new(false),
            }),
            started: AtomicBool::new(false),
            async_thread: Mutex::new(None),
            state: Mutex::new(RadioState {
                tx_freq: 0.0,
                rx_freq: 0.0,
                tx_gain,
                rx_gain,
            }),
            metrics: TrxMetrics::new(),
            model,
            tx_rate: actual_tx,
            rx_rate: actual_rx,
            ts_offset,
            tx_gain_range,
            rx_gain_range,
        };
        Ok((device, dispatch))
    }

    /// Stop the stream, drain stragglers, reset the device clock and
    /// start streaming again. Transmit realignment is forced.
    fn restart(
        usrp: &Mutex<Box<dyn Usrp>>,
        shared: &Shared,
        stream: &mut dyn RxStream,
        scratch: &mut [Complex<i16>],
        ts: TimeSpec,
    ) {
        stream.issue_stream_cmd(StreamCommand::StopContinuous);

        for _ in 0..RESTART_FLUSH_PACKETS {
            let (num, md) = stream.recv(scratch, Duration::from_millis(10), true);
            if num == 0 && matches!(md.error, Some(RxError::Timeout)) {
                break;
            }
        }

        usrp.lock().unwrap().set_time_now(ts);
        shared.aligned.store(false, Ordering::Release);
        stream.issue_stream_cmd(StreamCommand::StartContinuous { stream_now: true });
    }

    /// Start streaming and the async event thread. The device clock is
    /// reset to zero.
    pub fn start(&self) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            error!("device already started");
            return Err(Error::Unhandled("device already started".into()));
        }
        info!("starting device");
        self.shared.shutdown.store(false, Ordering::SeqCst);

        let mut events = self.usrp.lock().unwrap().async_event_stream();
        let shared = self.shared.clone();
        let metrics = self.metrics.clone();
        let handle = std::thread::Builder::new()
            .name("trx-async".into())
            .spawn(move || {
                while !shared.shutdown.load(Ordering::Relaxed) {
                    let Some(event) = events.recv(Duration::from_millis(100)) else {
                        continue;
                    };
                    if event == AsyncEvent::BurstAck {
                        continue;
                    }
                    // Any event short of an ack requires resynchronisation.
                    shared.aligned.store(false, Ordering::Release);
                    match event {
                        AsyncEvent::Underflow => {
                            metrics.underflows.fetch_add(1, Relaxed);
                        }
                        AsyncEvent::TimeError => {
                            metrics.time_errors.fetch_add(1, Relaxed);
                        }
                        other => {
                            metrics.async_events.fetch_add(1, Relaxed);
                            warn!(?other, "device async event");
                        }
                    }
                }
            })
            .map_err(|e| Error::Unhandled(format!("failed to spawn async event thread: {e}")))?;
        *self.async_thread.lock().unwrap() = Some(handle);

        {
            let mut rx = self.rx.lock().unwrap();
            let RxChain { stream, pkt, .. } = &mut *rx;
            Self::restart(&self.usrp, &self.shared, stream.as_mut(), pkt, TimeSpec::from_secs(0.0));
        }

        let now = self.usrp.lock().unwrap().time_now();
        info!(secs = now.secs(), "device time after reset");
        Ok(())
    }

    /// Stop streaming and join the async event thread.
    pub fn stop(&self) -> Result<()> {
        if !self.started.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        info!("stopping device");
        self.shared.shutdown.store(true, Ordering::SeqCst);
        if let Some(handle) = self.async_thread.lock().unwrap().take() {
            let _ = handle.join();
        }
        self.rx
            .lock()
            .unwrap()
            .stream
            .issue_stream_cmd(StreamCommand::StopContinuous);
        Ok(())
    }

    /// Read exactly `buf.len()` samples starting at `timestamp`, draining
    /// device packets into the sample buffer until enough have
    /// accumulated. Returns 0 on local errors; never a partial read.
    ///
    /// A backwards packet timestamp restarts the device at the previous
    /// timestamp and returns 0 for this call only; a buffer overrun is
    /// reported through `overrun` and the read continues.
    pub fn read_samples(
        &self,
        buf: &mut [Complex<i16>],
        timestamp: Timestamp,
        overrun: &mut bool,
        underrun: &mut bool,
    ) -> Result<usize> {
        let len = buf.len();
        *overrun = false;
        *underrun = false;

        // Shift read time with respect to the transmit clock.
        let timestamp = timestamp + self.ts_offset;

        let mut rx = self.rx.lock().unwrap();
        let RxChain {
            stream,
            smpl_buf,
            pkt,
            prev_ts,
        } = &mut *rx;

        if let Err(e) = smpl_buf.avail(timestamp) {
            error!(%e, "{}", smpl_buf.status());
            return Ok(0);
        }

        loop {
            match smpl_buf.avail(timestamp) {
                Ok(n) if n >= len => break,
                Ok(_) => {}
                Err(e) => {
                    error!(%e, "{}", smpl_buf.status());
                    return Ok(0);
                }
            }

            let (num, md) = stream.recv(pkt, Duration::from_millis(100), true);
            self.metrics.rx_packets.fetch_add(1, Relaxed);

            if num == 0 {
                match md.error {
                    Some(RxError::Timeout) => {
                        error!("receive timed out");
                        return Err(Error::Unrecoverable("receive timed out".into()));
                    }
                    err => {
                        debug!(?err, "device receive error");
                        continue;
                    }
                }
            }

            let Some(pkt_time) = md.time_spec else {
                error!("received packet missing timestamp");
                return Err(Error::Unrecoverable("received packet missing timestamp".into()));
            };

            if pkt_time < *prev_ts {
                error!(
                    current = pkt_time.secs(),
                    previous = prev_ts.secs(),
                    "loss of monotonic time"
                );
                self.metrics.timing_restarts.fetch_add(1, Relaxed);
                let at = *prev_ts;
                Self::restart(&self.usrp, &self.shared, stream.as_mut(), pkt, at);
                return Ok(0);
            }
            *prev_ts = pkt_time;

            let ticks = pkt_time.to_ticks(self.rx_rate);
            match smpl_buf.write(&pkt[..num], ticks) {
                Ok(_) => {}
                Err(Error::Overflow) => {
                    *overrun = true;
                    self.metrics.buffer_overflows.fetch_add(1, Relaxed);
                    debug!("{}", smpl_buf.status());
                }
                Err(e) => {
                    error!(%e, "{}", smpl_buf.status());
                    return Ok(0);
                }
            }
        }

        match smpl_buf.read(buf, timestamp) {
            Ok(n) if n == len => Ok(len),
            Ok(n) => {
                error!(read = n, requested = len, "{}", smpl_buf.status());
                Ok(0)
            }
            Err(e) => {
                error!(%e, "{}", smpl_buf.status());
                Ok(0)
            }
        }
    }

    /// Write `buf` at `timestamp`.
    ///
    /// While unaligned, the alignment state machine runs: the first call
    /// signals end-of-burst and reports an underrun, the next
    /// `ALIGNMENT_DROP_LIMIT - 2` calls claim `buf.len()` sent without
    /// touching the stream, and the final call marks start-of-burst and
    /// resumes timestamped transmission. A short send is unrecoverable.
    pub fn write_samples(
        &self,
        buf: &[Complex<i16>],
        timestamp: Timestamp,
        underrun: &mut bool,
        is_control: bool,
    ) -> Result<usize> {
        *underrun = false;

        if is_control {
            error!("control packets not supported");
            return Ok(0);
        }

        let mut md = TxMetadata {
            time_spec: Some(TimeSpec::from_ticks(timestamp, self.tx_rate)),
            start_of_burst: false,
            end_of_burst: false,
        };

        let mut tx = self.tx.lock().unwrap();

        if !self.shared.aligned.load(Ordering::Acquire) {
            tx.drop_cnt += 1;
            self.metrics.aligned_drops.fetch_add(1, Relaxed);

            if tx.drop_cnt == 1 {
                debug!("aligning transmitter: stop burst");
                *underrun = true;
                md.end_of_burst = true;
                tx.stream.send(&[], &md);
                return Ok(buf.len());
            } else if tx.drop_cnt < ALIGNMENT_DROP_LIMIT {
                debug!("aligning transmitter: packet advance");
                return Ok(buf.len());
            }
            debug!("aligning transmitter: start burst");
            md.start_of_burst = true;
            self.shared.aligned.store(true, Ordering::Release);
            tx.drop_cnt = 0;
        }

        let sent = tx.stream.send(buf, &md);
        if sent != buf.len() {
            error!(sent, requested = buf.len(), "device send timed out");
            return Err(Error::Unrecoverable("device send timed out".into()));
        }
        Ok(sent)
    }

    /// Timestamped devices need no explicit alignment step.
    pub fn update_alignment(&self, _timestamp: Timestamp) -> bool {
        true
    }

    pub fn set_tx_freq(&self, freq: f64) -> f64 {
        let actual = self.usrp.lock().unwrap().set_tx_freq(freq);
        info!(requested = freq, actual, "tuned transmitter");
        self.state.lock().unwrap().tx_freq = actual;
        actual
    }

    pub fn set_rx_freq(&self, freq: f64) -> f64 {
        let actual = self.usrp.lock().unwrap().set_rx_freq(freq);
        info!(requested = freq, actual, "tuned receiver");
        self.state.lock().unwrap().rx_freq = actual;
        actual
    }

    pub fn tx_freq(&self) -> f64 {
        self.state.lock().unwrap().tx_freq
    }

    pub fn rx_freq(&self) -> f64 {
        self.state.lock().unwrap().rx_freq
    }

    pub fn set_tx_gain(&self, gain: f64) -> f64 {
        let actual = self.usrp.lock().unwrap().set_tx_gain(gain);
        info!(gain = actual, "set TX gain");
        self.state.lock().unwrap().tx_gain = actual;
        actual
    }

    pub fn set_rx_gain(&self, gain: f64) -> f64 {
        let actual = self.usrp.lock().unwrap().set_rx_gain(gain);
        info!(gain = actual, "set RX gain");
        self.state.lock().unwrap().rx_gain = actual;
        actual
    }

    pub fn tx_gain(&self) -> f64 {
        self.state.lock().unwrap().tx_gain
    }

    pub fn rx_gain(&self) -> f64 {
        self.state.lock().unwrap().rx_gain
    }

    pub fn min_tx_gain(&self) -> f64 {
        self.tx_gain_range.0
    }

    pub fn max_tx_gain(&self) -> f64 {
        self.tx_gain_range.1
    }

    pub fn min_rx_gain(&self) -> f64 {
        self.rx_gain_range.0
    }

    pub fn max_rx_gain(&self) -> f64 {
        self.rx_gain_range.1
    }

    pub fn initial_write_timestamp(&self) -> Timestamp {
        0
    }

    pub fn initial_read_timestamp(&self) -> Timestamp {
        0
    }

    pub fn full_scale_input_value(&self) -> f64 {
        FULL_SCALE * TX_AMPL
    }

    pub fn full_scale_output_value(&self) -> f64 {
        FULL_SCALE
    }

    pub fn model(&self) -> DeviceModel {
        self.model
    }

    pub fn tx_sample_rate(&self) -> f64 {
        self.tx_rate
    }

    pub fn rx_sample_rate(&self) -> f64 {
        self.rx_rate
    }

    pub fn metrics(&self) -> Arc<TrxMetrics> {
        self.metrics.clone()
    }

    #[cfg(test)]
    fn aligned(&self) -> bool {
        self.shared.aligned.load(Ordering::Acquire)
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}
