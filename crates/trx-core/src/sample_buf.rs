//! Timestamped circular sample buffer.
//!
//! Sits between the device's packet-sized deliveries and the host's
//! arbitrary-length, timestamp-addressed reads. Samples are interleaved
//! I/Q pairs; lengths and timestamps are counted in pairs, never bytes.

use num_complex::Complex;

use crate::error::{Error, Result};
use crate::Timestamp;

/// A fixed-capacity ring of I/Q samples with two parallel cursors: data
/// positions within the ring and the device timestamps they correspond
/// to. The live window is `[time_start, time_end)`.
pub struct SampleBuffer {
    data: Vec<Complex<i16>>,
    time_start: Timestamp,
    time_end: Timestamp,
    data_start: usize,
    data_end: usize,
}

impl SampleBuffer {
    /// `capacity` is counted in I/Q sample pairs.
    pub fn new(capacity: usize) -> Self {
        Self {
            data: vec![Complex::new(0, 0); capacity],
            time_start: 0,
            time_end: 0,
            data_start: 0,
            data_end: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Number of samples available for reading from `timestamp` on.
    pub fn avail(&self, timestamp: Timestamp) -> Result<usize> {
        if timestamp < self.time_start {
            Err(Error::Timestamp)
        } else if timestamp >= self.time_end {
            Ok(0)
        } else {
            Ok((self.time_end - timestamp) as usize)
        }
    }

    /// Copy up to `dst.len()` samples starting at `timestamp`, then
    /// advance the read window to `timestamp + dst.len()`. Fails `Read`
    /// when the request is longer than the ring or the advance would step
    /// past the end of live data.
    pub fn read(&mut self, dst: &mut [Complex<i16>], timestamp: Timestamp) -> Result<usize> {
        let len = dst.len();
        let cap = self.capacity();

        if timestamp < self.time_start {
            return Err(Error::Timestamp);
        }
        if timestamp >= self.time_end {
            return Ok(0);
        }
        if len >= cap {
            return Err(Error::Read);
        }

        let avail = (self.time_end - timestamp) as usize;
        let num = avail.min(len);
        let read_start = (self.data_start + (timestamp - self.time_start) as usize) % cap;

        if read_start + num <= cap {
            dst[..num].copy_from_slice(&self.data[read_start..read_start + num]);
        } else {
            let first = cap - read_start;
            dst[..first].copy_from_slice(&self.data[read_start..]);
            dst[first..num].copy_from_slice(&self.data[..num - first]);
        }

        self.data_start = (read_start + len) % cap;
        self.time_start = timestamp + len as Timestamp;

        if self.time_start > self.time_end {
            return Err(Error::Read);
        }
        Ok(num)
    }

    /// Write `src` at `timestamp`. The write must strictly extend the
    /// live window; it may splice across the ring seam. When the write
    /// wraps past unread data the samples are still stored and
    /// `Overflow` is returned as a warning.
    pub fn write(&mut self, src: &[Complex<i16>], timestamp: Timestamp) -> Result<usize> {
        let len = src.len();
        let cap = self.capacity();

        if len == 0 || len >= cap {
            return Err(Error::Write);
        }
        if timestamp + len as Timestamp <= self.time_end {
            return Err(Error::Timestamp);
        }

        let offset = timestamp as i64 - self.time_start as i64;
        let write_start = (self.data_start as i64 + offset).rem_euclid(cap as i64) as usize;
        let wrapped = write_start + len > cap;

        if wrapped {
            let first = cap - write_start;
            self.data[write_start..].copy_from_slice(&src[..first]);
            self.data[..len - first].copy_from_slice(&src[first..]);
        } else {
            self.data[write_start..write_start + len].copy_from_slice(src);
        }

        self.data_end = (write_start + len) % cap;
        self.time_end = timestamp + len as Timestamp;

        if wrapped && self.data_end > self.data_start {
            return Err(Error::Overflow);
        }
        if self.time_end <= self.time_start {
            return Err(Error::Write);
        }
        Ok(len)
    }

    /// Formatted internal state for error reports.
    pub fn status(&self) -> String {
        format!(
            "sample buffer: length = {}, time_start = {}, time_end = {}, data_start = {}, data_end = {}",
            self.capacity(),
            self.time_start,
            self.time_end,
            self.data_start,
            self.data_end
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn samples(range: std::ops::Range<i16>) -> Vec<Complex<i16>> {
        range.map(|i| Complex::new(i, -i)).collect()
    }

    #[test]
    fn test_write_then_read() {
        let mut buf = SampleBuffer::new(1024);
        let src = samples(0..100);
        assert_eq!(buf.write(&src, 0), Ok(100));
        assert_eq!(buf.avail(0), Ok(100));

        let mut dst = vec![Complex::new(0, 0); 100];
        assert_eq!(buf.read(&mut dst, 0), Ok(100));
        assert_eq!(dst, src);

        // The read consumed the window.
        assert_eq!(buf.avail(0), Err(Error::Timestamp));
        assert_eq!(buf.avail(100), Ok(0));
    }

    #[test]
    fn test_write_far_from_origin() {
        // A fresh ring maps ts 1000 next to its seam: the write wraps and
        // warns, but the samples are stored and fully readable.
        let mut buf = SampleBuffer::new(1024);
        let src = samples(0..100);
        assert_eq!(buf.write(&src, 1000), Err(Error::Overflow));
        assert_eq!(buf.avail(1000), Ok(100));

        let mut dst = vec![Complex::new(0, 0); 100];
        assert_eq!(buf.read(&mut dst, 1000), Ok(100));
        assert_eq!(dst, src);
        assert_eq!(buf.avail(1000), Err(Error::Timestamp));
    }

    #[test]
    fn test_avail_matches_window() {
        let mut buf = SampleBuffer::new(64);
        buf.write(&samples(0..10), 50).unwrap();
        buf.write(&samples(10..30), 60).unwrap();
        // time_end strictly increases across writes; the full window is
        // readable from its start.
        assert_eq!(buf.avail(50), Ok(30));
        assert_eq!(buf.avail(70), Ok(10));
        assert_eq!(buf.avail(80), Ok(0));
        assert_eq!(buf.avail(49), Err(Error::Timestamp));
    }

    #[test]
    fn test_write_must_extend() {
        let mut buf = SampleBuffer::new(64);
        buf.write(&samples(0..20), 0).unwrap();
        // A write entirely inside the current window is rejected.
        assert_eq!(buf.write(&samples(0..10), 5), Err(Error::Timestamp));
        // Ending exactly at time_end is not an extension either.
        assert_eq!(buf.write(&samples(0..10), 10), Err(Error::Timestamp));
        // One past is.
        assert_eq!(buf.write(&samples(0..10), 11), Ok(10));
    }

    #[test]
    fn test_length_limits() {
        let mut buf = SampleBuffer::new(8);
        assert_eq!(buf.write(&[], 0), Err(Error::Write));
        assert_eq!(buf.write(&samples(0..8), 0), Err(Error::Write));
        buf.write(&samples(0..4), 0).unwrap();
        let mut dst = vec![Complex::new(0, 0); 8];
        assert_eq!(buf.read(&mut dst, 0), Err(Error::Read));
    }

    #[test]
    fn test_wrap_read_spans_seam() {
        let mut buf = SampleBuffer::new(8);
        let first = samples(0..6);
        buf.write(&first, 0).unwrap();

        let mut dst = vec![Complex::new(0, 0); 5];
        buf.read(&mut dst, 0).unwrap();

        // This write lands at ring positions 6, 7, 0, 1, 2: data_end wraps.
        let second = samples(10..15);
        assert_eq!(buf.write(&second, 6), Ok(5));
        assert_eq!(buf.avail(5), Ok(6));

        // The live window [5, 11) spans the seam.
        let mut dst = vec![Complex::new(0, 0); 6];
        assert_eq!(buf.read(&mut dst, 5), Ok(6));
        assert_eq!(dst[0], first[5]);
        assert_eq!(&dst[1..], &second[..]);
    }

    #[test]
    fn test_overflow_is_reported_and_data_kept() {
        let mut buf = SampleBuffer::new(8);
        buf.write(&samples(0..6), 0).unwrap();
        // Nothing read yet: wrapping past data_start must flag overflow.
        let second = samples(20..26);
        assert_eq!(buf.write(&second, 6), Err(Error::Overflow));

        // The data was written regardless; the tail of the window reads
        // back the overflowing samples.
        let mut dst = vec![Complex::new(0, 0); 4];
        // Window is now [0, 12) but positions 0..4 were overwritten;
        // read the most recent samples at ts 8..12.
        buf.read(&mut dst, 8).unwrap();
        assert_eq!(&dst, &second[2..6]);
    }

    #[test]
    fn test_read_past_end_is_rejected() {
        let mut buf = SampleBuffer::new(64);
        buf.write(&samples(0..10), 0).unwrap();
        let mut dst = vec![Complex::new(0, 0); 8];
        // Starts inside the window but the advance would pass time_end.
        assert_eq!(buf.read(&mut dst, 5), Err(Error::Read));
    }

    #[test]
    fn test_status_reports_cursors() {
        let mut buf = SampleBuffer::new(16);
        buf.write(&samples(0..4), 0).unwrap();
        let s = buf.status();
        assert!(s.contains("time_end = 4"));
        assert!(s.contains("length = 16"));
    }
}
