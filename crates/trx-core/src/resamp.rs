//! Rational-rate polyphase resampler.
//!
//! Converts between the device's native rate and the GSM symbol rate for
//! radios whose master clock does not divide down to it: 96/65 for
//! 64 MHz clocking, 75/52 for 100 MHz. Each instance is stateful: the
//! last filter-length input samples are retained across calls so that
//! consecutive chunks are seamless. Instances must not be shared between
//! streams.

use std::f64::consts::PI;

use num_complex::Complex;

use crate::error::{Error, Result};

/// Prototype filter taps per polyphase branch.
const RESAMP_FILTER_LEN: usize = 16;

pub struct Resampler {
    p: usize,
    q: usize,
    filt_len: usize,
    /// One branch of `filt_len` taps per output phase, in convolution
    /// order.
    partitions: Vec<Vec<f32>>,
    /// Base input index per output phase within one block of `p` outputs.
    in_index: Vec<usize>,
    /// Branch selector per output phase.
    out_path: Vec<usize>,
    /// Last `filt_len` inputs of the previous chunk.
    history: Vec<Complex<f32>>,
}

impl Resampler {
    /// Build a resampler producing `p` output samples per `q` input
    /// samples. `cutoff` scales the filter bandwidth below the Nyquist
    /// band of the narrower side (1.0 for the full band).
    pub fn new(p: usize, q: usize, cutoff: f64) -> Result<Self> {
        if p == 0 || q == 0 {
            return Err(Error::InvalidArgument("resampling ratio must be non-zero"));
        }
        if !(cutoff > 0.0 && cutoff <= 1.0) {
            return Err(Error::InvalidArgument("filter cutoff outside (0, 1]"));
        }

        let filt_len = RESAMP_FILTER_LEN;
        let partitions = build_partitions(p, q, filt_len, cutoff);
        let in_index = (0..p).map(|i| (q * i) / p).collect();
        let out_path = (0..p).map(|i| (q * i) % p).collect();

        Ok(Self {
            p,
            q,
            filt_len,
            partitions,
            in_index,
            out_path,
            history: vec![Complex::new(0.0, 0.0); filt_len],
        })
    }

    /// History retained across calls, in input samples. Output is fully
    /// settled once this many input samples have passed through.
    pub fn filter_len(&self) -> usize {
        self.filt_len
    }

    /// Convert `src` into exactly `dst.len()` output samples. Lengths
    /// must agree with the ratio in whole blocks: `src.len()` a multiple
    /// of `q` and `src.len() * p == dst.len() * q`.
    pub fn rotate(&mut self, src: &[Complex<f32>], dst: &mut [Complex<f32>]) -> Result<()> {
        if src.is_empty() || src.len() % self.q != 0 || src.len() * self.p != dst.len() * self.q {
            return Err(Error::InvalidArgument(
                "chunk sizes do not match the resampling ratio",
            ));
        }

        // Retained history followed by this chunk; work[t] = x[t - filt_len].
        let mut work = Vec::with_capacity(self.filt_len + src.len());
        work.extend_from_slice(&self.history);
        work.extend_from_slice(src);

        for (i, out) in dst.iter_mut().enumerate() {
            let block = i / self.p;
            let phase = i % self.p;
            let start = block * self.q + self.in_index[phase] + 1;
            let taps = &self.partitions[self.out_path[phase]];

            let mut acc = Complex::new(0.0f32, 0.0);
            for (k, &tap) in taps.iter().enumerate() {
                acc += work[start + k] * tap;
            }
            *out = acc;
        }

        self.history.copy_from_slice(&work[work.len() - self.filt_len..]);
        Ok(())
    }
}

/// Windowed-sinc prototype low-pass, partitioned into `p` branches of
/// `filt_len` taps. Each branch is normalised to unit DC gain so the
/// interpolator is transparent to stationary signals.
fn build_partitions(p: usize, q: usize, filt_len: usize, cutoff: f64) -> Vec<Vec<f32>> {
    let proto_len = p * filt_len;
    let fc = cutoff / p.max(q) as f64;
    let mid = (proto_len - 1) as f64 / 2.0;

    let mut proto = vec![0f64; proto_len];
    for (i, tap) in proto.iter_mut().enumerate() {
        let x = i as f64 - mid;
        let arg = PI * fc * x;
        let sinc = if arg.abs() < 1e-12 { 1.0 } else { arg.sin() / arg };
        *tap = sinc * blackman_harris(i, proto_len);
    }

    let mut partitions = vec![vec![0f32; filt_len]; p];
    for (branch, taps) in partitions.iter_mut().enumerate() {
        for (k, tap) in taps.iter_mut().enumerate() {
            // Time-reversed within the branch for direct convolution.
            *tap = proto[branch + (filt_len - 1 - k) * p] as f32;
        }
        let sum: f32 = taps.iter().sum();
        for tap in taps.iter_mut() {
            *tap /= sum;
        }
    }
    partitions
}

/// Four-term Blackman-Harris window.
fn blackman_harris(i: usize, n: usize) -> f64 {
    const A0: f64 = 0.35875;
    const A1: f64 = 0.48829;
    const A2: f64 = 0.14128;
    const A3: f64 = 0.01168;
    let x = 2.0 * PI * i as f64 / (n - 1) as f64;
    A0 - A1 * x.cos() + A2 * (2.0 * x).cos() - A3 * (3.0 * x).cos()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ones(n: usize) -> Vec<Complex<f32>> {
        vec![Complex::new(1.0, 0.0); n]
    }

    #[test]
    fn test_ratio_mismatch_rejected() {
        let mut rs = Resampler::new(96, 65, 1.0).unwrap();
        let src = ones(65);
        let mut dst = vec![Complex::new(0.0, 0.0); 95];
        assert!(rs.rotate(&src, &mut dst).is_err());

        // Not a whole number of input blocks.
        let src = ones(64);
        let mut dst = vec![Complex::new(0.0, 0.0); 96];
        assert!(rs.rotate(&src, &mut dst).is_err());

        let mut dst = vec![Complex::new(0.0, 0.0); 96];
        assert!(rs.rotate(&ones(65), &mut dst).is_ok());
    }

    #[test]
    fn test_invalid_construction() {
        assert!(Resampler::new(0, 65, 1.0).is_err());
        assert!(Resampler::new(96, 0, 1.0).is_err());
        assert!(Resampler::new(96, 65, 0.0).is_err());
        assert!(Resampler::new(96, 65, 1.5).is_err());
    }

    #[test]
    fn test_dc_transparent_after_warmup() {
        let mut up = Resampler::new(96, 65, 1.0).unwrap();
        let src = ones(65 * 4);
        let mut dst = vec![Complex::new(0.0, 0.0); 96 * 4];

        // First chunk warms the history up; the second is settled.
        up.rotate(&src, &mut dst).unwrap();
        up.rotate(&src, &mut dst).unwrap();
        for (i, s) in dst.iter().enumerate() {
            assert!(
                (s.re - 1.0).abs() < 1e-3 && s.im.abs() < 1e-3,
                "sample {i} = {s}"
            );
        }
    }

    #[test]
    fn test_down_up_round_trip_on_stationary_input() {
        // 65/96 down then 96/65 up, as the receive and transmit paths
        // use them.
        let mut up = Resampler::new(96, 65, 0.45).unwrap();
        let mut dn = Resampler::new(65, 96, 1.0).unwrap();

        let src = ones(65 * 4);
        let mut mid = vec![Complex::new(0.0, 0.0); 96 * 4];
        let mut out = vec![Complex::new(0.0, 0.0); 65 * 4];

        for _ in 0..3 {
            up.rotate(&src, &mut mid).unwrap();
            dn.rotate(&mid, &mut out).unwrap();
        }
        for (i, s) in out.iter().enumerate() {
            assert!(
                (s.re - 1.0).abs() < 5e-3 && s.im.abs() < 5e-3,
                "sample {i} = {s}"
            );
        }
    }

    #[test]
    fn test_100m_ratio_sizes() {
        let mut dn = Resampler::new(52, 75, 1.0).unwrap();
        let src = ones(75 * 4);
        let mut dst = vec![Complex::new(0.0, 0.0); 52 * 4];
        assert!(dn.rotate(&src, &mut dst).is_ok());
        assert_eq!(dn.filter_len(), 16);
    }

    #[test]
    fn test_history_carries_across_calls() {
        // A step fed in two chunks must produce the same output as the
        // same step fed in one chunk.
        let mut a = Resampler::new(96, 65, 1.0).unwrap();
        let mut b = Resampler::new(96, 65, 1.0).unwrap();

        let src = ones(65 * 2);
        let mut whole = vec![Complex::new(0.0, 0.0); 96 * 2];
        a.rotate(&src, &mut whole).unwrap();

        let mut first = vec![Complex::new(0.0, 0.0); 96];
        let mut second = vec![Complex::new(0.0, 0.0); 96];
        b.rotate(&src[..65], &mut first).unwrap();
        b.rotate(&src[65..], &mut second).unwrap();

        for i in 0..96 {
            assert!((whole[i].re - first[i].re).abs() < 1e-6);
            assert!((whole[96 + i].re - second[i].re).abs() < 1e-6);
        }
    }
}
