//! Error taxonomy shared across the transceiver core.

use thiserror::Error;

/// Everything that can go wrong between the device stream and the burst
/// queues. Local-recovery policy lives with the callers: the device read
/// path restarts on `Timing` and keeps going on `Overflow`, while
/// `Unrecoverable` takes the pipeline down.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// A timestamp outside the live window of a sample buffer.
    #[error("requested timestamp is not valid")]
    Timestamp,
    /// Sample buffer read failure.
    #[error("sample buffer read error")]
    Read,
    /// Sample buffer write failure.
    #[error("sample buffer write error")]
    Write,
    /// A buffer write wrapped past unread data. The data is written; the
    /// reader has fallen behind.
    #[error("sample buffer overrun")]
    Overflow,
    /// Device timestamps went backwards.
    #[error("loss of monotonic device time")]
    Timing,
    /// Device failure with no recovery path short of a process restart.
    #[error("unrecoverable device error: {0}")]
    Unrecoverable(String),
    /// Device error outside the handled set.
    #[error("unhandled device error: {0}")]
    Unhandled(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
}

pub type Result<T> = std::result::Result<T, Error>;
