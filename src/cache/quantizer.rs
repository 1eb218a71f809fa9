//! Per-page asymmetric 8-bit quantization.
//!
//! Every element is stored as one byte `q`, dequantized as
//! `zero_point + q * scale`, with `scale = (hi - lo) / 255` over the page's
//! value range `[lo, hi]`. Against f32 storage this is a 4x reduction.
//!
//! Error bound: for every element written to a page,
//! `|v - dequantize(quantize(v))| <= scale` of that page, where `scale` is the
//! page's final scale. A single quantization is within `scale / 2`; when a later
//! write widens the range, the page is requantized and the range is grown
//! geometrically (the span at least doubles), so the rounding error of all
//! earlier requantizations sums to at most another `scale / 2`.
//!
//! Supported input: finite values with `|v| <= MAX_MAGNITUDE`. Page ranges
//! then stay a small multiple of that bound, far from `f32::MAX`, so spans
//! and scales never overflow. The cache rejects anything outside it.

use serde::{Deserialize, Serialize};

/// Number of distinct quantized codes minus one.
const Q_MAX: f32 = 255.0;

/// Largest magnitude a stored element may have.
pub const MAX_MAGNITUDE: f32 = 1e30;

/// Whether `v` can be stored with the documented error bound.
#[inline]
pub fn is_supported(v: f32) -> bool {
    v.is_finite() && v.abs() <= MAX_MAGNITUDE
}

/// Quantization parameters for one half (keys or values) of a page.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QuantParams {
    /// Step between adjacent codes.
    pub scale: f32,
    /// Value represented by code 0.
    pub zero_point: f32,
}

impl QuantParams {
    /// Parameters of a page that has never been written.
    pub const EMPTY: QuantParams = QuantParams {
        scale: 0.0,
        zero_point: 0.0,
    };

    /// Parameters covering `[lo, hi]` exactly.
    pub fn for_range(lo: f32, hi: f32) -> Self {
        let span = hi - lo;
        Self {
            scale: if span > 0.0 { span / Q_MAX } else { 0.0 },
            zero_point: lo,
        }
    }

    /// Smallest representable value.
    pub fn lo(&self) -> f32 {
        self.zero_point
    }

    /// Largest representable value.
    pub fn hi(&self) -> f32 {
        self.zero_point + self.scale * Q_MAX
    }

    /// Whether every value in `[lo, hi]` is representable without clamping.
    pub fn covers(&self, lo: f32, hi: f32) -> bool {
        lo >= self.lo() && hi <= self.hi()
    }

    /// Parameters for a widened range. The span at least doubles so that the
    /// number of requantizations of any page stays logarithmic in its range.
    pub fn widened(&self, lo: f32, hi: f32, was_empty: bool) -> Self {
        if was_empty {
            return QuantParams::for_range(lo, hi);
        }
        let old_lo = self.lo();
        let old_hi = self.hi();
        let old_span = old_hi - old_lo;
        let mut new_lo = old_lo.min(lo);
        let mut new_hi = old_hi.max(hi);
        let grown = new_hi - new_lo;
        if grown < 2.0 * old_span {
            let extra = 2.0 * old_span - grown;
            if lo < old_lo {
                new_lo -= extra;
            } else {
                new_hi += extra;
            }
        }
        QuantParams::for_range(new_lo, new_hi)
    }

    /// Quantize one value.
    #[inline]
    pub fn quantize(&self, v: f32) -> u8 {
        if self.scale <= 0.0 {
            return 0;
        }
        ((v - self.zero_point) / self.scale).round().clamp(0.0, Q_MAX) as u8
    }

    /// Dequantize one code.
    #[inline]
    pub fn dequantize(&self, q: u8) -> f32 {
        self.zero_point + q as f32 * self.scale
    }
}

/// Minimum and maximum of a slice, or None when empty or non-finite.
pub fn value_range(data: &[f32]) -> Option<(f32, f32)> {
    let mut lo = f32::INFINITY;
    let mut hi = f32::NEG_INFINITY;
    for &x in data {
        if !x.is_finite() {
            return None;
        }
        lo = lo.min(x);
        hi = hi.max(x);
    }
    if data.is_empty() {
        None
    } else {
        Some((lo, hi))
    }
}

/// Quantize `data` into `out` with the given parameters.
pub fn quantize_into(out: &mut [u8], data: &[f32], params: &QuantParams) {
    for (q, &x) in out.iter_mut().zip(data.iter()) {
        *q = params.quantize(x);
    }
}

/// Dequantize `q_data`, appending to `out`.
pub fn dequantize_into(out: &mut Vec<f32>, q_data: &[u8], params: &QuantParams) {
    out.extend(q_data.iter().map(|&q| params.dequantize(q)));
}

/// Re-encode already quantized codes under new parameters.
pub fn requantize(codes: &mut [u8], from: &QuantParams, to: &QuantParams) {
    for q in codes.iter_mut() {
        *q = to.quantize(from.dequantize(*q));
    }
}
