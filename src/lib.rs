//! # slimjpeg - quality-per-byte JPEG encoder
//!
//! slimjpeg is a baseline JPEG encoder built around the question "how do I
//! spend each output byte best", rather than around marker plumbing:
//!
//! - **Fixed-point quantization** with a tunable rounding bias
//! - **Adaptive quantization matrices**: per-subband histograms drive a
//!   rate-distortion search over each of the 64 matrix entries
//! - **Two-pass Huffman optimization**: symbol statistics from the first
//!   pass produce length-limited optimal code tables for the second
//! - **Trellis quantization**: per-block dynamic programming over
//!   alternative coefficient magnitudes under the current code tables
//! - **Size / PSNR targeting**: a secant search over a global quality
//!   scale converges on a requested byte size or distortion
//!
//! ## Usage
//!
//! ```rust,ignore
//! use slimjpeg::{encode, EncodeParam};
//!
//! let mut param = EncodeParam::new(85);
//! param.use_trellis = true;
//! let jpeg = encode(&rgb, width, height, 3 * width, &param)?;
//! ```
//!
//! Inputs are interleaved 8-bit sRGB rows; outputs are JFIF bitstreams
//! decodable by any baseline decoder. Grayscale, YCbCr 4:2:0 (plain and
//! "sharp") and 4:4:4 are supported, with automatic selection scored from
//! the image's chroma riskiness.

// Image analysis (public: useful on its own for sampling decisions)
pub mod analysis;

// Core building blocks
mod adaptive_quant;
mod bitwriter;
mod consts;
mod dct;
mod error;
mod huffman;
mod quant;
mod trellis;

// Encoder pipeline
mod color;
mod dichotomy;
mod encode;
mod headers;
mod md5;

// Bitstream inspection for requantization workflows
mod parse;

pub use encode::{compress, encode, encode_with_method, EncodeParam, TargetMode, YuvMode};
pub use error::{Error, Result};
pub use parse::{dimensions, estimate_quality, find_quantizers, Dimensions};

use consts::DEFAULT_MATRICES;
use quant::{q_factor, set_quant_matrix};

/// Generate the default quantization matrix for a quality factor, scaled
/// the libjpeg-6b way. Natural (row-major) order.
pub fn quant_matrix_for_quality(quality: i32, for_chroma: bool) -> [u8; 64] {
    let mut out = [0u8; 64];
    set_quant_matrix(
        &DEFAULT_MATRICES[for_chroma as usize],
        q_factor(quality),
        &mut out,
    );
    out
}
