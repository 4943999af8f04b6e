//! Header-only inspection of existing JPEG bitstreams.
//!
//! Enough parsing to support requantization workflows: image dimensions,
//! the first two quantization matrices, and a reverse mapping from a matrix
//! back to the closest libjpeg-style quality factor. No entropy decoding.

use crate::consts::{marker, DEFAULT_MATRICES, ZIGZAG};
use crate::quant::{q_factor, set_quant_matrix};

/// Basic frame properties read from the SOF segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dimensions {
    pub width: usize,
    pub height: usize,
    /// True when the first component uses 2x2 sampling factors.
    pub is_yuv420: bool,
}

struct MarkerScanner<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> MarkerScanner<'a> {
    fn new(data: &'a [u8]) -> Option<Self> {
        if data.len() < 4 || data[0] != 0xff || data[1] != marker::SOI {
            return None;
        }
        Some(Self { data, pos: 2 })
    }

    /// Next (marker, payload) pair, payload excluding its length field.
    fn next(&mut self) -> Option<(u8, &'a [u8])> {
        loop {
            // resynchronize on the next 0xFF, tolerating fill bytes
            while self.pos + 1 < self.data.len() && self.data[self.pos] != 0xff {
                self.pos += 1;
            }
            if self.pos + 4 > self.data.len() {
                return None;
            }
            let m = self.data[self.pos + 1];
            if m == 0xff {
                self.pos += 1; // fill byte
                continue;
            }
            self.pos += 2;
            if m == marker::EOI || m == marker::SOI || (0xd0..=0xd7).contains(&m) || m == 0x01 {
                return Some((m, &[]));
            }
            if self.pos + 2 > self.data.len() {
                return None;
            }
            let len = u16::from_be_bytes([self.data[self.pos], self.data[self.pos + 1]]) as usize;
            if len < 2 || self.pos + len > self.data.len() {
                return None;
            }
            let payload = &self.data[self.pos + 2..self.pos + len];
            self.pos += len;
            return Some((m, payload));
        }
    }
}

/// Read the frame dimensions with as little parsing as possible.
/// Returns `None` on anything that is not a well-formed JPEG prefix.
pub fn dimensions(data: &[u8]) -> Option<Dimensions> {
    let mut scan = MarkerScanner::new(data)?;
    while let Some((m, payload)) = scan.next() {
        match m {
            marker::SOF0 | marker::SOF1 | marker::SOF2 => {
                if payload.len() < 6 {
                    return None;
                }
                let height = u16::from_be_bytes([payload[1], payload[2]]) as usize;
                let width = u16::from_be_bytes([payload[3], payload[4]]) as usize;
                let nb_comps = payload[5] as usize;
                if payload.len() < 6 + 3 * nb_comps || width == 0 || height == 0 {
                    return None;
                }
                let is_yuv420 = nb_comps == 3 && payload[7] == 0x22;
                return Some(Dimensions {
                    width,
                    height,
                    is_yuv420,
                });
            }
            marker::SOS | marker::EOI => return None,
            _ => {}
        }
    }
    None
}

/// Extract the first two 8-bit quantization matrices, de-zigzagged into
/// natural order. Returns how many were found (0 on bitstream error).
/// The input may be truncated to the headers, but must start with SOI.
pub fn find_quantizers(data: &[u8], quant: &mut [[u8; 64]; 2]) -> usize {
    let mut found = 0usize;
    let Some(mut scan) = MarkerScanner::new(data) else {
        return 0;
    };
    while let Some((m, mut payload)) = scan.next() {
        match m {
            marker::DQT => {
                while !payload.is_empty() && found < 2 {
                    let precision = payload[0] >> 4;
                    let id = (payload[0] & 0x0f) as usize;
                    if precision != 0 || payload.len() < 65 {
                        return found; // 16-bit tables are not produced here
                    }
                    if id < 2 {
                        for i in 0..64 {
                            quant[id][ZIGZAG[i]] = payload[1 + i];
                        }
                        found = found.max(id + 1);
                    }
                    payload = &payload[65..];
                }
            }
            marker::SOS | marker::EOI => break,
            _ => {}
        }
    }
    found
}

/// Estimate the quality factor whose default matrix comes closest to
/// `matrix`, by L1 distance over all 64 entries.
pub fn estimate_quality(matrix: &[u8; 64], for_chroma: bool) -> i32 {
    let base = &DEFAULT_MATRICES[for_chroma as usize];
    let mut best_q = 0i32;
    let mut best_err = u32::MAX;
    for q in 1..=100 {
        let mut scaled = [0u8; 64];
        set_quant_matrix(base, q_factor(q), &mut scaled);
        let err: u32 = scaled
            .iter()
            .zip(matrix.iter())
            .map(|(&a, &b)| (a as i32 - b as i32).unsigned_abs())
            .sum();
        if err < best_err {
            best_err = err;
            best_q = q;
        }
    }
    best_q
}
