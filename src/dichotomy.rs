//! Size / PSNR convergence loop.
//!
//! When a target is requested, the whole scan runs inside a secant search
//! over a global matrix scale `q` (0..=2000, 500 = identity). Each pass
//! rescales the matrices, re-runs the adaptive analyzer, re-quantizes the
//! stored coefficients and evaluates either the projected byte size or the
//! PSNR, then steps `q` until the step size falls under the convergence
//! limit or the pass budget runs out. Non-convergence is not an error: the
//! last matrices win.

use crate::bitwriter::BitCounter;
use crate::encode::{Encoder, TargetMode};
use crate::quant::{
    code_to_coeff, generate_dc_diff_code, quantize_block, set_quant_matrix_search, DctCoeffs,
};
use crate::trellis::trellis_quantize_block;

/// Convergence is reached when |dq| falls below this limit.
const DQ_LIMIT: f32 = 20.0;
/// Maximum step allowed per pass.
const DQ_THRESH: f32 = 800.0;
/// Initial step for size searches.
const INITIAL_DQ_SIZE: f32 = 130.0;
/// PSNR gain: the first step is scaled by the dB error. A PSNR shortfall
/// (value below target) must refine the matrices, i.e. step `q` down.
const INITIAL_DQ_PSNR: f32 = 10.0;

/// Search state for either target kind.
pub(crate) struct PassStats {
    is_first: bool,
    dq: f32,
    pub(crate) q: f32,
    last_q: f32,
    value: f64,
    last_value: f64,
    pub(crate) target: f64,
    pub(crate) do_size_search: bool,
    q_lo: f32,
    q_hi: f32,
}

impl PassStats {
    pub(crate) fn new(enc: &Encoder<'_>) -> Self {
        let do_size_search = enc.target_mode == TargetMode::Size;
        let (q, dq) = if do_size_search {
            (500.0, INITIAL_DQ_SIZE)
        } else {
            // data-fit heuristic: low PSNR targets start on the coarse
            // side of the scale, high targets near the identity
            let q = 500.0 * 11.0 / (1.0 + (enc.target_value - 31.0).abs());
            (q, INITIAL_DQ_PSNR)
        };
        let q_lo = (enc.qmin * 10.0).clamp(0.0, 2000.0);
        let q_hi = (enc.qmax * 10.0).clamp(q_lo, 2000.0);
        let q = q.clamp(q_lo, q_hi);
        Self {
            is_first: true,
            dq,
            q,
            last_q: q,
            value: 0.0,
            last_value: 0.0,
            target: enc.target_value as f64,
            do_size_search,
            q_lo,
            q_hi,
        }
    }

    /// Fold in this pass's result and step `q`. Returns true once the
    /// search has converged.
    pub(crate) fn compute_next_q(&mut self, result: f32) -> bool {
        self.value = result as f64;
        if self.is_first {
            self.dq = if self.do_size_search {
                // too small an output needs finer matrices, so step down
                if self.value < self.target {
                    -self.dq
                } else {
                    self.dq
                }
            } else {
                self.dq * (self.value - self.target) as f32
            };
            self.is_first = false;
        } else if (self.value - self.last_value).abs() > 0.02 * self.value {
            let slope = (self.target - self.value) / (self.last_value - self.value);
            self.dq = (slope * (self.last_q - self.q) as f64) as f32;
        } else {
            self.dq = 0.0;
        }
        // overshoot and proximity damping
        if self.target < self.value {
            self.dq *= 0.9;
        }
        if (self.target - self.value).abs() < 0.05 * self.value {
            self.dq *= 0.7;
        }
        self.dq = self.dq.clamp(-DQ_THRESH, DQ_THRESH);
        self.last_q = self.q;
        self.last_value = self.value;
        self.q = (self.q + self.dq).clamp(0.0, 2000.0).clamp(self.q_lo, self.q_hi);
        (self.q - self.last_q).abs() < DQ_LIMIT
    }

    /// Rewind half a step after a rejected pass (minimum-PSNR violation).
    pub(crate) fn back_track(&mut self) {
        self.q = self.last_q;
        self.dq /= 2.0;
        self.q += self.dq;
    }
}

impl Encoder<'_> {
    /// Quantize every stored block, filling `coeffs` and rebuilding the
    /// run/level arena.
    pub(crate) fn store_run_levels(&mut self, coeffs: &mut [DctCoeffs]) {
        debug_assert!(self.have_coeffs && self.reuse_run_levels);
        self.reset_dcs();
        self.all_run_levels.clear();
        self.check_buffers();

        let mcu_len = self.mcu_blocks * 64;
        let mut bi = 0usize;
        for n in 0..self.mb_w * self.mb_h {
            let mut offset = n * mcu_len;
            for c in 0..self.nb_comps {
                let qi = self.quant_idx[c];
                for _ in 0..self.nb_blocks[c] {
                    let out = &mut coeffs[bi];
                    let block = &self.in_blocks[offset..offset + 64];
                    let dc = if self.use_trellis {
                        trellis_quantize_block(
                            block,
                            c as u8,
                            &self.quants[qi],
                            &self.ac_codes[qi],
                            out,
                            &mut self.all_run_levels,
                        )
                    } else {
                        quantize_block(block, c as u8, &self.quants[qi], out, &mut self.all_run_levels)
                    };
                    out.dc_code = generate_dc_diff_code(dc, &mut self.dcs[c]);
                    bi += 1;
                    offset += 64;
                }
            }
        }
    }

    /// Recount symbol statistics from the stored tokens and rebuild the
    /// optimal tables.
    pub(crate) fn store_optimal_huffman(&mut self, coeffs: &[DctCoeffs]) {
        self.stats.reset();
        let mut pos = 0usize;
        for c in coeffs {
            let qi = self.quant_idx[c.idx as usize];
            let n = c.nb_coeffs as usize;
            self.stats.add_block(qi, c, &self.all_run_levels[pos..pos + n]);
            pos += n;
        }
        self.compile_entropy_stats();
    }

    /// Fixed header-size model, in bits.
    fn header_size(&self) -> usize {
        let mut size = 0usize;
        size += 20; // APP0
        size += self.app_markers.len();
        if !self.exif.is_empty() {
            size += 8 + self.exif.len();
        }
        if !self.iccp.is_empty() {
            let chunk_size_max = 0xffff - 12 - 4;
            let num_chunks = (self.iccp.len() - 1) / chunk_size_max + 1;
            size += num_chunks * (12 + 4 + 2);
            size += self.iccp.len();
        }
        if !self.xmp.is_empty() {
            size += 2 + 2 + 29 + self.xmp.len();
        }
        let nb_matrices = if self.nb_comps == 1 { 1 } else { 2 };
        size += nb_matrices * 65 + 2; // DQT
        size += 8 + 3 * self.nb_comps + 2; // SOF
        size += 6 + 2 * self.nb_comps + 2; // SOS
        size += 2; // EOI
        for c in 0..nb_matrices {
            for htype in 0..=1usize {
                let h = &self.huffman_tables[htype * 2 + c];
                size += 2 + 3 + 16 + h.nb_syms(); // DHT
            }
        }
        size * 8
    }

    /// Count the entropy-coded bits of every stored block, including
    /// stuffing.
    fn blocks_size(&self, coeffs: &[DctCoeffs], bc: &mut BitCounter) {
        let mut pos = 0usize;
        for c in coeffs {
            let q_idx = self.quant_idx[c.idx as usize];

            let dc_len = (c.dc_code & 0x0f) as u32;
            bc.add_packed_code(self.dc_codes[q_idx][dc_len as usize]);
            if dc_len > 0 {
                bc.add_bits((c.dc_code >> 4) as u32, dc_len);
            }

            let codes = &self.ac_codes[q_idx];
            for token in &self.all_run_levels[pos..pos + c.nb_coeffs as usize] {
                let mut run = token.run as u32;
                while run & !15 != 0 {
                    bc.add_packed_code(codes[0xf0]);
                    run -= 16;
                }
                let suffix = token.level as u32;
                let nbits = suffix & 0x0f;
                let sym = ((run << 4) | nbits) as usize;
                bc.add_packed_code(codes[sym]);
                bc.add_bits(suffix >> 4, nbits);
            }
            if c.last < 63 {
                bc.add_packed_code(codes[0x00]); // EOB
            }
            pos += c.nb_coeffs as usize;
        }
    }

    /// Projected output size in bytes under the current tables.
    pub(crate) fn compute_size(&mut self, coeffs: &[DctCoeffs]) -> f32 {
        self.init_codes(false);
        let mut bc = BitCounter::new();
        self.blocks_size(coeffs, &mut bc);
        (self.header_size() + bc.size()) as f32 / 8.0
    }

    /// PSNR of the quantized stream against the stored pre-DCT
    /// coefficients (descaled by 16), summed over every sub-band.
    pub(crate) fn compute_psnr(&mut self, coeffs: &[DctCoeffs]) -> f32 {
        let mut error = 0u64;
        let mut dcs = [0i32; 3];
        let mut pos = 0usize;
        for (n, c) in coeffs.iter().enumerate() {
            let q_idx = self.quant_idx[c.idx as usize];
            let quant = &self.quants[q_idx].quant;
            let mut dq = [0i32; 64];
            let mut zz = 0usize;
            for token in &self.all_run_levels[pos..pos + c.nb_coeffs as usize] {
                zz += token.run as usize + 1;
                let j = crate::consts::ZIGZAG[zz];
                dq[j] = quant[j] as i32 * code_to_coeff(token.level);
            }
            pos += c.nb_coeffs as usize;
            dcs[c.idx as usize] += code_to_coeff(c.dc_code);
            dq[0] = dcs[c.idx as usize] * quant[0] as i32;

            let block = &self.in_blocks[n * 64..n * 64 + 64];
            for (i, &v) in block.iter().enumerate() {
                let v0 = v as i32 / 16; // fDCT output is upscaled
                let d = (v0 - dq[i]) as i64;
                error += (d * d) as u64;
            }
        }
        let nb_samples = coeffs.len() as u64 * 64;
        if error == 0 || nb_samples == 0 {
            return 99.0;
        }
        (10.0 * ((255.0f64 * 255.0 * nb_samples as f64) / error as f64).log10()) as f32
    }

    /// Emit every stored block with the final tables.
    fn final_pass_scan(&mut self, coeffs: &[DctCoeffs]) {
        let rls = std::mem::take(&mut self.all_run_levels);
        let mut pos = 0usize;
        for c in coeffs {
            self.check_buffers();
            let n = c.nb_coeffs as usize;
            self.code_block(c, &rls[pos..pos + n]);
            pos += n;
        }
        self.all_run_levels = rls;
    }

    /// The targeted encode: dichotomy over the quality scale, then the
    /// final headers and scan.
    pub(crate) fn loop_scan(&mut self) {
        debug_assert!(self.use_extra_memory && self.reuse_run_levels);

        if self.use_adaptive_quant {
            self.collect_histograms();
        } else {
            self.collect_coeffs();
        }

        // default tables are the bit-rate basis for the trellis search
        if self.use_trellis {
            self.init_codes(true);
        }

        let nb_mbs = self.mb_w * self.mb_h * self.mcu_blocks;
        let mut base_coeffs = vec![DctCoeffs::default(); nb_mbs];

        let base_quant = [self.quants[0].quant, self.quants[1].quant];
        let mut opt_quants = base_quant;

        let mut stats = PassStats::new(self);
        for pass in 0..self.passes {
            for c in 0..2 {
                set_quant_matrix_search(&base_quant[c], stats.q, &mut self.quants[c].quant);
                self.quants[c].finalize(self.q_bias);
            }
            if self.use_adaptive_quant {
                self.apply_adaptive_quant();
            }

            self.store_run_levels(&mut base_coeffs);

            if self.optimize_size && (stats.do_size_search || self.use_trellis) {
                // size estimates must use the tables the final emission
                // would use
                self.store_optimal_huffman(&base_coeffs);
                if self.use_trellis {
                    self.init_codes(true);
                }
            }

            let result = if stats.do_size_search {
                self.compute_size(&base_coeffs)
            } else {
                self.compute_psnr(&base_coeffs)
            };

            if pass > 0 && self.min_psnr > 0.0 {
                let psnr = if stats.do_size_search {
                    self.compute_psnr(&base_coeffs)
                } else {
                    result
                };
                if psnr < self.min_psnr {
                    stats.back_track();
                    continue;
                }
            }

            log::debug!("pass #{}: q={:.1} value={:.2}", pass, stats.q, result);
            for c in 0..2 {
                opt_quants[c] = self.quants[c].quant;
            }

            let within_tolerance =
                (result as f64 - stats.target).abs() <= self.tolerance as f64 * stats.target;
            if stats.compute_next_q(result) || within_tolerance {
                break;
            }
        }

        // settle on the best matrices seen and re-derive a consistent
        // token stream for them
        for c in 0..2 {
            self.quants[c].quant = opt_quants[c];
            self.quants[c].finalize(self.q_bias);
        }
        self.store_run_levels(&mut base_coeffs);
        if self.optimize_size {
            self.store_optimal_huffman(&base_coeffs);
        }

        self.write_dqt();
        self.write_sof();
        self.write_dht();
        self.write_sos();
        self.final_pass_scan(&base_coeffs);
    }
}
