//! Quantization: matrix scaling, fixed-point reciprocal contexts and the
//! scalar block quantizer producing run/level tokens.
//!
//! Division by the matrix entry is replaced by a 16-bit reciprocal multiply
//! with a configurable rounding bias. The fDCT feeds coefficients scaled by
//! 16 (4 fractional bits), which the quantizer removes after the multiply.

use crate::consts::ZIGZAG;

/// Fractional precision of the fixed-point reciprocals.
pub const FP_BITS: u32 = 16;
/// Extra precision bits carried by the fDCT output.
pub const AC_BITS: u32 = 4;
/// Neutral rounding bias used for DC (mandatory).
pub const BIAS_DC: u32 = 0x80;

/// Map a quality factor (0..100) to the jpeg-6b scaling percentage.
pub fn q_factor(quality: i32) -> i32 {
    if quality <= 0 {
        5000
    } else if quality < 50 {
        5000 / quality
    } else if quality < 100 {
        2 * (100 - quality)
    } else {
        0
    }
}

/// Scale a base matrix by a percentage factor, clamping entries to 1..=255.
pub fn set_quant_matrix(base: &[u8; 64], factor: i32, out: &mut [u8; 64]) {
    for i in 0..64 {
        let v = (base[i] as i32 * factor + 50) / 100;
        out[i] = v.clamp(1, 255) as u8;
    }
}

/// Scale a base matrix by the convergence loop's coarseness parameter.
///
/// `q` runs over 0..=2000 with 500 as the identity: the effective
/// percentage factor is `q / 5`, so fractional search steps move the
/// matrix smoothly. Lower `q` refines (down to all-ones), higher `q`
/// coarsens.
pub fn set_quant_matrix_search(base: &[u8; 64], q: f32, out: &mut [u8; 64]) {
    let factor = q.clamp(0.0, 2000.0) / 5.0;
    for i in 0..64 {
        let v = ((base[i] as f32 * factor + 50.0) / 100.0) as i32;
        out[i] = v.clamp(1, 255) as u8;
    }
}

/// Derive the minimum-quantizer matrix: `out = (m * (256 - tolerance)) >> 8`,
/// or all-ones when no limit is requested.
pub fn set_min_quant_matrix(m: Option<&[u8; 64]>, out: &mut [u8; 64], tolerance: i32) {
    match m {
        Some(m) => {
            for i in 0..64 {
                let v = (m[i] as i32 * (256 - tolerance)) >> 8;
                out[i] = v.clamp(1, 255) as u8;
            }
        }
        None => out.fill(1),
    }
}

/// `32 - clz(v)`, the JPEG category of a strictly positive value.
#[inline]
pub fn calc_log2(v: u32) -> u32 {
    debug_assert!(v > 0);
    u32::BITS - v.leading_zeros()
}

/// Fixed-point reciprocal quantization of a non-negative value.
#[inline]
pub fn quantize(v: u32, iquant: u32, bias: u32) -> u32 {
    ((v + bias) * iquant) >> FP_BITS >> AC_BITS
}

/// Quantizer context for one matrix: per position the matrix value, its
/// 16-bit reciprocal, the effective rounding bias and the smallest input
/// magnitude that quantizes to a nonzero index.
#[derive(Clone)]
pub struct Quantizer {
    pub quant: [u8; 64],
    pub min_quant: [u8; 64],
    pub iquant: [u16; 64],
    pub bias: [u16; 64],
    pub qthresh: [u16; 64],
}

impl Default for Quantizer {
    fn default() -> Self {
        Self {
            quant: [1; 64],
            min_quant: [1; 64],
            iquant: [0; 64],
            bias: [0; 64],
            qthresh: [0; 64],
        }
    }
}

impl Quantizer {
    /// Recompute reciprocals, biases and thresholds from `quant`.
    ///
    /// For v=1 the multiplier does not fit 16 bits, so the pair
    /// `(iquant=0xffff, bias=0x80)` is substituted; it is bit-exact over the
    /// working range. Quant values of 1 start appearing around quality 93.
    pub fn finalize(&mut self, q_bias: u32) {
        const BIAS_1: u32 = 0x80;
        const IQUANT_1: u32 = 0xffff;
        for i in 0..64 {
            let v = self.quant[i] as u32;
            let iquant = if v == 1 {
                IQUANT_1
            } else {
                ((1u32 << FP_BITS) + v / 2) / v
            };
            let bias = if v == 1 {
                BIAS_1
            } else if i == 0 {
                BIAS_DC
            } else {
                q_bias
            };
            let ibias = (((bias * v) << AC_BITS) + 128) >> 8;
            let qthresh = ((1u32 << (FP_BITS + AC_BITS)) + iquant - 1) / iquant - ibias;
            self.bias[i] = ibias as u16;
            self.iquant[i] = iquant as u16;
            self.qthresh[i] = qthresh as u16;
            debug_assert!(quantize(qthresh, iquant, ibias) > 0);
            debug_assert!(quantize(qthresh - 1, iquant, ibias) == 0);
        }
    }
}

/// Run/level token: `run` zero coefficients followed by one nonzero level,
/// with `level` packing `(mantissa << 4) | category`.
#[derive(Clone, Copy, Default)]
pub struct RunLevel {
    pub run: u16,
    pub level: u16,
}

/// Summary of one quantized block: component index, zig-zag position of the
/// last nonzero AC, number of run/level tokens and the packed DC-diff code.
#[derive(Clone, Copy, Default)]
pub struct DctCoeffs {
    pub last: u16,
    pub nb_coeffs: u16,
    pub dc_code: u16,
    pub idx: u8,
}

/// Quantize one 64-coefficient block (natural order), appending AC run/level
/// tokens to `rl` and filling `out`. Returns the signed quantized DC.
///
/// The zero test compares |v| against the precomputed threshold instead of
/// quantizing and testing the result; the two are equivalent.
pub fn quantize_block(
    input: &[i16],
    idx: u8,
    q: &Quantizer,
    out: &mut DctCoeffs,
    rl: &mut Vec<RunLevel>,
) -> i32 {
    debug_assert!(input.len() >= 64);
    let mut prev = 1usize;
    let mut nb = 0u16;
    for i in 1..64 {
        let j = ZIGZAG[i];
        let v = input[j] as i32;
        let mask = v >> 31;
        let a = ((v ^ mask) - mask) as u32;
        if a >= q.qthresh[j] as u32 {
            let u = quantize(a, q.iquant[j] as u32, q.bias[j] as u32);
            debug_assert!(u > 0);
            let n = calc_log2(u);
            let code = (u as i32 ^ mask) as u32 & ((1 << n) - 1);
            rl.push(RunLevel {
                run: (i - prev) as u16,
                level: ((code << 4) | n) as u16,
            });
            prev = i + 1;
            nb += 1;
        }
    }
    let dc0 = input[0] as i32;
    let dc = if dc0 < 0 {
        -(quantize((-dc0) as u32, q.iquant[0] as u32, q.bias[0] as u32) as i32)
    } else {
        quantize(dc0 as u32, q.iquant[0] as u32, q.bias[0] as u32) as i32
    };
    out.idx = idx;
    out.last = (prev - 1) as u16;
    out.nb_coeffs = nb;
    dc
}

/// Build the packed DC-diff code `(suffix << 4) | category` and update the
/// predictor. Negative differences use the one's-complement suffix.
pub fn generate_dc_diff_code(dc: i32, predictor: &mut i32) -> u16 {
    let diff = dc - *predictor;
    *predictor = dc;
    if diff == 0 {
        return 0;
    }
    let (n, suff) = if diff < 0 {
        let n = calc_log2((-diff) as u32);
        (n, (diff - 1) as u32 & ((1 << n) - 1))
    } else {
        let n = calc_log2(diff as u32);
        (n, diff as u32)
    };
    debug_assert!(suff & 0xf000 == 0);
    debug_assert!(n < 12);
    (n | (suff << 4)) as u16
}

/// Decode a packed `(suffix << 4) | category` value back to its signed
/// coefficient. Inverse of the amplitude encoding above.
#[inline]
pub fn code_to_coeff(code: u16) -> i32 {
    let nbits = (code & 0x0f) as u32;
    if nbits == 0 {
        return 0;
    }
    let suffix = (code >> 4) as i32;
    if (suffix as u32) < (1 << (nbits - 1)) {
        suffix - ((1 << nbits) - 1)
    } else {
        suffix
    }
}
