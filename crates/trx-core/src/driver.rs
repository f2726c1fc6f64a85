//! Contract consumed from the SDR vendor runtime.
//!
//! The core drives any radio that can deliver timestamped sc16 sample
//! streams through these traits. The in-tree implementation is the
//! software loopback backend in [`crate::sim`]; hardware backends plug in
//! from outside the crate.

use std::time::Duration;

use num_complex::Complex;

use crate::Timestamp;

/// Wire format negotiated with the streamers: interleaved signed 16-bit
/// I and Q.
pub const STREAM_FORMAT: &str = "sc16";

/// Reference clock source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefSource {
    Internal,
    External,
    Gps,
}

impl RefSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            RefSource::Internal => "internal",
            RefSource::External => "external",
            RefSource::Gps => "gpsdo",
        }
    }
}

/// Device time in fractional seconds; converts to and from integer tick
/// counts at a given sample rate.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Default)]
pub struct TimeSpec {
    secs: f64,
}

impl TimeSpec {
    pub fn from_secs(secs: f64) -> Self {
        Self { secs }
    }

    pub fn from_ticks(ticks: Timestamp, rate: f64) -> Self {
        Self {
            secs: ticks as f64 / rate,
        }
    }

    pub fn to_ticks(self, rate: f64) -> Timestamp {
        (self.secs * rate).round() as Timestamp
    }

    pub fn secs(self) -> f64 {
        self.secs
    }
}

/// Error codes reported in receive-stream metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RxError {
    Timeout,
    Overflow,
    LateCommand,
    BrokenChain,
    BadPacket,
}

/// Asynchronous transmit-side events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AsyncEvent {
    BurstAck,
    Underflow,
    SeqError,
    TimeError,
    UnderflowInPacket,
    SeqErrorInBurst,
}

/// Metadata attached to each received packet.
#[derive(Debug, Clone, Copy, Default)]
pub struct RxMetadata {
    pub time_spec: Option<TimeSpec>,
    pub error: Option<RxError>,
}

/// Metadata attached to each transmitted packet.
#[derive(Debug, Clone, Copy, Default)]
pub struct TxMetadata {
    pub time_spec: Option<TimeSpec>,
    pub start_of_burst: bool,
    pub end_of_burst: bool,
}

/// Receive streamer command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamCommand {
    StartContinuous { stream_now: bool },
    StopContinuous,
}

pub trait RxStream: Send {
    /// Receive at most one packet into `buf`. Returns the sample count;
    /// zero with `metadata.error` set on failure.
    fn recv(
        &mut self,
        buf: &mut [Complex<i16>],
        timeout: Duration,
        one_packet: bool,
    ) -> (usize, RxMetadata);

    fn issue_stream_cmd(&mut self, cmd: StreamCommand);

    /// Samples per over-the-wire packet.
    fn max_num_samps(&self) -> usize;
}

pub trait TxStream: Send {
    /// Send `buf` with the given metadata; returns the number of samples
    /// the device accepted.
    fn send(&mut self, buf: &[Complex<i16>], metadata: &TxMetadata) -> usize;

    fn max_num_samps(&self) -> usize;
}

pub trait AsyncEventStream: Send {
    /// Block up to `timeout` for the next transmit-side event.
    fn recv(&mut self, timeout: Duration) -> Option<AsyncEvent>;
}

/// A discovered, opened radio: the narrow slice of the vendor multi-device
/// API the core consumes. Setters return the value the hardware actually
/// settled on.
pub trait Usrp: Send {
    /// Device tree name plus motherboard identifier, used for model
    /// detection (e.g. "B-Series Device B200").
    fn model_name(&self) -> String;

    fn set_clock_source(&mut self, source: RefSource);

    fn set_master_clock_rate(&mut self, rate: f64);
    fn master_clock_rate(&self) -> f64;

    fn set_tx_rate(&mut self, rate: f64);
    fn set_rx_rate(&mut self, rate: f64);
    fn tx_rate(&self) -> f64;
    fn rx_rate(&self) -> f64;

    fn set_tx_freq(&mut self, freq: f64) -> f64;
    fn set_rx_freq(&mut self, freq: f64) -> f64;
    fn tx_freq(&self) -> f64;
    fn rx_freq(&self) -> f64;

    /// (start, stop) of the gain range, in dB.
    fn tx_gain_range(&self) -> (f64, f64);
    fn rx_gain_range(&self) -> (f64, f64);
    fn set_tx_gain(&mut self, gain: f64) -> f64;
    fn set_rx_gain(&mut self, gain: f64) -> f64;

    fn set_time_now(&mut self, time: TimeSpec);
    fn time_now(&self) -> TimeSpec;

    fn tx_stream(&mut self, format: &str) -> Box<dyn TxStream>;
    fn rx_stream(&mut self, format: &str) -> Box<dyn RxStream>;
    fn async_event_stream(&mut self) -> Box<dyn AsyncEventStream>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_time_spec_tick_round_trip() {
        let rate = 270_833.333_333;
        let ts = TimeSpec::from_ticks(1_000_000, rate);
        assert_eq!(ts.to_ticks(rate), 1_000_000);

        let zero = TimeSpec::from_secs(0.0);
        assert_eq!(zero.to_ticks(rate), 0);
    }

    #[test]
    fn test_time_spec_ordering() {
        let a = TimeSpec::from_secs(1.0);
        let b = TimeSpec::from_secs(2.0);
        assert!(a < b);
    }

    #[test]
    fn test_ref_source_names() {
        assert_eq!(RefSource::Internal.as_str(), "internal");
        assert_eq!(RefSource::External.as_str(), "external");
        assert_eq!(RefSource::Gps.as_str(), "gpsdo");
    }
}
