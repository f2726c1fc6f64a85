//! GSM base-station transceiver core.
//!
//! The real-time pipeline between a software-defined radio front-end and
//! GSM frame-aligned bursts: timestamped sample transport, rational-rate
//! conversion, slot-aligned burst framing, and the cooperating TX/RX
//! pump threads that keep the two sides of the radio in sync.

pub mod burst;
pub mod clock;
pub mod device;
pub mod driver;
pub mod error;
pub mod gsm_time;
pub mod metrics;
pub mod radio_iface;
pub mod resamp;
pub mod sample_buf;
pub mod sim;
pub mod sync;
pub mod transceiver;

pub use burst::{Burst, BurstQueue, SignalVector};
pub use clock::RadioClock;
pub use device::{Device, DeviceModel, RateDispatch, ALIGNMENT_DROP_LIMIT, GSM_RATE};
pub use driver::{RefSource, TimeSpec, Usrp};
pub use error::{Error, Result};
pub use gsm_time::{fn_compare, fn_delta, GsmTime, HYPERFRAME};
pub use metrics::{TrxMetrics, TrxMetricsSnapshot};
pub use radio_iface::RadioInterface;
pub use resamp::Resampler;
pub use sample_buf::SampleBuffer;
pub use transceiver::Transceiver;

/// Monotonic sample count at the device sample rate. Not modular; wraps
/// only after astronomical durations.
pub type Timestamp = u64;
