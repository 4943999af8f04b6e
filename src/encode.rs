//! Encoder state, scan drivers and the public entry points.
//!
//! One encode call is one synchronous computation: colorspace layout is
//! fixed up front, MCUs stream through sampling, fDCT and quantization,
//! and the entropy-coded segment is emitted in one or two passes depending
//! on the compression method. The size/PSNR targeting loop lives in the
//! dichotomy module.

use crate::adaptive_quant::{analyse_histo, store_histo, Histo, QDELTA_MAX};
use crate::analysis::riskiness_from_rgb;
use crate::bitwriter::BitWriter;
use crate::color::{GraySampler, McuSampler, SharpYuv420Sampler, Yuv420Sampler, Yuv444Sampler};
use crate::consts::DEFAULT_MATRICES;
use crate::dct::fdct;
use crate::error::{Error, Result};
use crate::huffman::{
    build_optimal_table, standard_tables, EntropyStats, HuffmanTable, NUM_AC_SYMBOLS,
    NUM_DC_SYMBOLS,
};
use crate::quant::{
    generate_dc_diff_code, q_factor, quantize_block, set_min_quant_matrix, set_quant_matrix,
    DctCoeffs, Quantizer, RunLevel,
};
use crate::trellis::trellis_quantize_block;

/// Default quality factor.
const DEFAULT_QUALITY: i32 = 75;
/// Default AC rounding bias, leaning toward file-size reduction.
const DEFAULT_BIAS: u32 = 0x78;
/// Default adaptive-quantization caps. Chroma is kept tight: hurting it
/// for bitrate is visually more damaging than for luma.
const DEFAULT_DELTA_MAX_LUMA: i32 = 12;
const DEFAULT_DELTA_MAX_CHROMA: i32 = 1;

/// Riskiness score thresholds for automatic sampling selection.
const RISK_420: f32 = 25.0;
const RISK_SHARP_420: f32 = 75.0;

/// Colorspace / sampling decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum YuvMode {
    /// Pick 4:2:0 / sharp 4:2:0 / 4:4:4 from the image's chroma riskiness.
    #[default]
    Auto,
    /// YCbCr 4:2:0 (16x16 MCUs, box-subsampled chroma)
    Yuv420,
    /// YCbCr 4:2:0 with sharper chroma reduction
    SharpYuv420,
    /// YCbCr 4:4:4 (8x8 MCUs, full chroma)
    Yuv444,
    /// Single-component grayscale
    Gray400,
}

/// What the convergence loop aims for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TargetMode {
    /// Plain single encode at the requested quality.
    #[default]
    None,
    /// Converge on an output size in bytes.
    Size,
    /// Converge on a global PSNR in dB.
    Psnr,
}

/// Encoding parameters.
///
/// The quantization matrices are owned by the param (seeded by
/// [`EncodeParam::new`] from a quality factor) so that requantization
/// workflows can install matrices recovered from an existing bitstream.
#[derive(Clone)]
pub struct EncodeParam {
    /// Sampling decision; `Auto` scores the image first.
    pub yuv_mode: YuvMode,
    /// Use optimized Huffman tables (two-pass entropy coding).
    pub huffman_compress: bool,
    /// Adapt the quantization matrices to the image's histograms.
    pub adaptive_quantization: bool,
    /// Promote the method to trellis-based coefficient search.
    pub use_trellis: bool,
    /// AC rounding bias, 8-bit fixed point. The default 0x78 leans toward
    /// smaller files.
    pub quantization_bias: u8,
    /// Accepted for compatibility; per-block bias modulation has no
    /// observable effect in this implementation.
    pub adaptive_bias: bool,
    /// How much adaptive quantization may raise luma quantizers (0..=12).
    pub qdelta_max_luma: u8,
    /// Same cap for chroma (0..=12). Raising it can help images encoded
    /// without chroma subsampling.
    pub qdelta_max_chroma: u8,
    /// Convergence target kind.
    pub target_mode: TargetMode,
    /// Target value: bytes for size search, dB for PSNR search.
    pub target_value: f32,
    /// Maximum passes for the convergence loop.
    pub passes: u32,
    /// Relative distance to target considered close enough.
    pub tolerance: f32,
    /// Bracket for the search scale, in tenths (the scale runs 0..=2000
    /// with 500 as the identity, so the defaults 0 and 200 leave the
    /// search unconstrained).
    pub qmin: f32,
    pub qmax: f32,
    /// Reject passes whose PSNR drops below this bound (0 disables).
    pub min_psnr: f32,
    /// Raw EXIF payload (without the `Exif\0\0` prefix).
    pub exif: Vec<u8>,
    /// Raw XMP packet (without the namespace prefix).
    pub xmp: Vec<u8>,
    /// Raw ICC profile (without the `ICC_PROFILE\0` prefix).
    pub iccp: Vec<u8>,
    /// Pre-formed APP markers, written verbatim after APP0.
    pub app_markers: Vec<u8>,

    quant: [[u8; 64]; 2],
    min_quant: [Option<[u8; 64]>; 2],
    min_quant_tolerance: i32,
}

impl Default for EncodeParam {
    fn default() -> Self {
        Self::new(DEFAULT_QUALITY)
    }
}

impl EncodeParam {
    /// Parameters for a given quality factor (0..=100).
    pub fn new(quality: i32) -> Self {
        let mut p = Self {
            yuv_mode: YuvMode::Auto,
            huffman_compress: true,
            adaptive_quantization: true,
            use_trellis: false,
            quantization_bias: DEFAULT_BIAS as u8,
            adaptive_bias: false,
            qdelta_max_luma: DEFAULT_DELTA_MAX_LUMA as u8,
            qdelta_max_chroma: DEFAULT_DELTA_MAX_CHROMA as u8,
            target_mode: TargetMode::None,
            target_value: 0.0,
            passes: 10,
            tolerance: 0.01,
            qmin: 0.0,
            qmax: 200.0,
            min_psnr: 0.0,
            exif: Vec::new(),
            xmp: Vec::new(),
            iccp: Vec::new(),
            app_markers: Vec::new(),
            quant: [[0; 64]; 2],
            min_quant: [None, None],
            min_quant_tolerance: 0,
        };
        p.set_quality(quality);
        p
    }

    /// Install the default matrices scaled for `quality` (0..=100).
    pub fn set_quality(&mut self, quality: i32) {
        let f = q_factor(quality);
        set_quant_matrix(&DEFAULT_MATRICES[0], f, &mut self.quant[0]);
        set_quant_matrix(&DEFAULT_MATRICES[1], f, &mut self.quant[1]);
    }

    /// Install an explicit matrix, reduced by `100 / reduction`.
    /// `reduction ~= 100` barely reduces; `reduction ~= 1` reduces hard.
    pub fn set_quant_matrix(&mut self, idx: usize, m: &[u8; 64], reduction: i32) {
        let reduction = reduction.max(1);
        for i in 0..64 {
            let v = m[i] as i32 * 100 / reduction;
            self.quant[idx][i] = v.clamp(1, 255) as u8;
        }
    }

    /// Shrink the output by scaling both current matrices.
    pub fn set_reduction(&mut self, reduction: i32) {
        let q = self.quant;
        self.set_quant_matrix(0, &q[0], reduction);
        self.set_quant_matrix(1, &q[1], reduction);
    }

    /// Bound quantization from below by the current matrices, with a
    /// percentage of tolerated overshoot. Call after the matrices are set.
    pub fn set_limit_quantization(&mut self, limit: bool, tolerance: i32) {
        if limit {
            self.min_quant = [Some(self.quant[0]), Some(self.quant[1])];
        } else {
            self.min_quant = [None, None];
        }
        self.min_quant_tolerance = tolerance.clamp(0, 100);
    }

    /// Current quantization matrices (luma, chroma), natural order.
    pub fn quant_matrices(&self) -> &[[u8; 64]; 2] {
        &self.quant
    }

    /// Clear all metadata payloads.
    pub fn reset_metadata(&mut self) {
        self.exif.clear();
        self.xmp.clear();
        self.iccp.clear();
        self.app_markers.clear();
    }

    /// Compression method implied by the boolean surface.
    pub fn method(&self) -> u8 {
        let mut m = if self.huffman_compress { 1 } else { 0 };
        if self.adaptive_quantization {
            m += 3;
        }
        if self.use_trellis {
            if m == 4 {
                m = 7;
            } else if m == 6 {
                m = 8;
            }
        }
        m
    }
}

// =============================================================================
// Encoder
// =============================================================================

pub(crate) struct Encoder<'a> {
    pub(crate) w: usize,
    pub(crate) h: usize,
    sampler: Box<dyn McuSampler + 'a>,

    // colorspace-dependent layout
    pub(crate) nb_comps: usize,
    pub(crate) quant_idx: [usize; 3],
    pub(crate) nb_blocks: [usize; 3],
    pub(crate) block_dims: [u8; 3],
    pub(crate) block_w: usize,
    pub(crate) block_h: usize,
    pub(crate) mcu_blocks: usize,
    pub(crate) mb_w: usize,
    pub(crate) mb_h: usize,

    pub(crate) bw: BitWriter,
    pub(crate) ok: bool,

    pub(crate) exif: &'a [u8],
    pub(crate) xmp: &'a [u8],
    pub(crate) iccp: &'a [u8],
    pub(crate) app_markers: &'a [u8],

    // compression method flags
    pub(crate) optimize_size: bool,
    pub(crate) use_adaptive_quant: bool,
    pub(crate) use_extra_memory: bool,
    pub(crate) reuse_run_levels: bool,
    pub(crate) use_trellis: bool,

    pub(crate) q_bias: u32,
    pub(crate) quants: [Quantizer; 2],
    pub(crate) dcs: [i32; 3],

    // coefficient storage for methods that re-quantize without re-running
    // the fDCT
    pub(crate) in_blocks: Vec<i16>,
    pub(crate) have_coeffs: bool,

    // run/level arena for methods that re-emit without re-quantizing
    pub(crate) all_run_levels: Vec<RunLevel>,

    // tables, indexed type * 2 + chroma
    pub(crate) huffman_tables: [HuffmanTable; 4],
    pub(crate) ac_codes: [[u32; NUM_AC_SYMBOLS]; 2],
    pub(crate) dc_codes: [[u32; NUM_DC_SYMBOLS]; 2],
    pub(crate) stats: EntropyStats,

    pub(crate) qdelta_max_luma: i32,
    pub(crate) qdelta_max_chroma: i32,
    pub(crate) histos: [Histo; 2],

    // convergence targets
    pub(crate) target_mode: TargetMode,
    pub(crate) target_value: f32,
    pub(crate) passes: u32,
    pub(crate) tolerance: f32,
    pub(crate) qmin: f32,
    pub(crate) qmax: f32,
    pub(crate) min_psnr: f32,
}

impl<'a> Encoder<'a> {
    pub(crate) fn new(
        rgb: &'a [u8],
        w: usize,
        h: usize,
        stride: usize,
        param: &'a EncodeParam,
        method: u8,
    ) -> Result<Self> {
        if w == 0 || h == 0 || w > 65535 || h > 65535 || stride < 3 * w {
            return Err(Error::InvalidDimensions {
                width: w,
                height: h,
                stride,
            });
        }
        let needed = stride * (h - 1) + 3 * w;
        if rgb.len() < needed {
            return Err(Error::InvalidPixelData {
                expected: needed,
                actual: rgb.len(),
            });
        }

        let yuv_mode = match param.yuv_mode {
            YuvMode::Auto => {
                let risk = riskiness_from_rgb(rgb, w, h, stride);
                log::debug!("chroma riskiness: {:.1}", risk);
                if risk < RISK_420 {
                    YuvMode::Yuv420
                } else if risk < RISK_SHARP_420 {
                    YuvMode::SharpYuv420
                } else {
                    YuvMode::Yuv444
                }
            }
            mode => mode,
        };

        let sampler: Box<dyn McuSampler + 'a> = match yuv_mode {
            YuvMode::Yuv420 => Box::new(Yuv420Sampler::new(rgb, w, h, stride)),
            YuvMode::SharpYuv420 => Box::new(SharpYuv420Sampler::new(rgb, w, h, stride)),
            YuvMode::Yuv444 => Box::new(Yuv444Sampler::new(rgb, w, h, stride)),
            YuvMode::Gray400 => Box::new(GraySampler::new(rgb, w, h, stride)),
            YuvMode::Auto => unreachable!("auto mode resolved above"),
        };

        // component layout
        let (nb_comps, quant_idx, nb_blocks, block_dims, block_wh, mcu_blocks) = match yuv_mode {
            YuvMode::Yuv420 | YuvMode::SharpYuv420 => {
                (3, [0, 1, 1], [4, 1, 1], [0x22, 0x11, 0x11], 16, 6)
            }
            YuvMode::Yuv444 => (3, [0, 1, 1], [1, 1, 1], [0x11, 0x11, 0x11], 8, 3),
            YuvMode::Gray400 => (1, [0, 0, 0], [1, 0, 0], [0x11, 0, 0], 8, 1),
            YuvMode::Auto => unreachable!(),
        };

        let mut quants = [Quantizer::default(), Quantizer::default()];
        for c in 0..2 {
            quants[c].quant = param.quant[c];
            set_min_quant_matrix(
                param.min_quant[c].as_ref(),
                &mut quants[c].min_quant,
                param.min_quant_tolerance,
            );
        }

        let mut enc = Self {
            w,
            h,
            sampler,
            nb_comps,
            quant_idx,
            nb_blocks,
            block_dims,
            block_w: block_wh,
            block_h: block_wh,
            mcu_blocks,
            mb_w: (w + block_wh - 1) / block_wh,
            mb_h: (h + block_wh - 1) / block_wh,
            bw: BitWriter::with_size_hint(w * h / 4),
            ok: true,
            exif: &param.exif,
            xmp: &param.xmp,
            iccp: &param.iccp,
            app_markers: &param.app_markers,
            optimize_size: false,
            use_adaptive_quant: false,
            use_extra_memory: false,
            reuse_run_levels: false,
            use_trellis: false,
            q_bias: param.quantization_bias as u32,
            quants,
            dcs: [0; 3],
            in_blocks: Vec::new(),
            have_coeffs: false,
            all_run_levels: Vec::new(),
            huffman_tables: standard_tables(),
            ac_codes: [[0; NUM_AC_SYMBOLS]; 2],
            dc_codes: [[0; NUM_DC_SYMBOLS]; 2],
            stats: EntropyStats::default(),
            qdelta_max_luma: (param.qdelta_max_luma as i32).min(QDELTA_MAX),
            qdelta_max_chroma: (param.qdelta_max_chroma as i32).min(QDELTA_MAX),
            histos: [Histo::default(), Histo::default()],
            target_mode: param.target_mode,
            target_value: param.target_value,
            passes: param.passes.max(1),
            tolerance: param.tolerance,
            qmin: param.qmin,
            qmax: param.qmax,
            min_psnr: param.min_psnr,
        };
        enc.set_compression_method(method);
        Ok(enc)
    }

    fn set_compression_method(&mut self, method: u8) {
        debug_assert!(method <= 8);
        self.use_adaptive_quant = method >= 3;
        self.optimize_size = method != 0 && method != 3;
        self.use_extra_memory = matches!(method, 3 | 4 | 7);
        self.reuse_run_levels = matches!(method, 1 | 4 | 5 | 7);
        self.use_trellis = method >= 7;
        // the convergence loop re-quantizes the stored coefficients and
        // re-emits stored tokens on every pass
        if self.target_mode != TargetMode::None {
            self.use_extra_memory = true;
            self.reuse_run_levels = true;
        }
    }

    pub(crate) fn reset_dcs(&mut self) {
        self.dcs = [0; 3];
    }

    /// Reserve output room for the worst-case MCU (plus stuffing), and seed
    /// the run/level arena.
    pub(crate) fn check_buffers(&mut self) {
        self.bw.reserve_large(4096);
        if self.reuse_run_levels && self.all_run_levels.capacity() == 0 {
            self.all_run_levels.reserve(8192);
        }
    }

    /// Derive packed codes from the current tables.
    pub(crate) fn init_codes(&mut self, only_ac: bool) {
        let nb_tables = if self.nb_comps == 1 { 1 } else { 2 };
        for c in 0..nb_tables {
            let first = if only_ac { 1 } else { 0 };
            for htype in first..=1usize {
                let h = &self.huffman_tables[htype * 2 + c];
                let nb = if htype == 1 {
                    h.build_codes(&mut self.ac_codes[c])
                } else {
                    h.build_codes(&mut self.dc_codes[c])
                };
                debug_assert!(nb == h.nb_syms());
            }
        }
    }

    /// Quantize one block with the method-selected quantizer.
    #[inline]
    fn quantize_dispatch(
        &self,
        block_offset: usize,
        from_store: bool,
        tmp: &[i16],
        c: usize,
        out: &mut DctCoeffs,
        rl: &mut Vec<RunLevel>,
    ) -> i32 {
        let qi = self.quant_idx[c];
        let block = if from_store {
            &self.in_blocks[block_offset..block_offset + 64]
        } else {
            &tmp[block_offset..block_offset + 64]
        };
        if self.use_trellis {
            trellis_quantize_block(block, c as u8, &self.quants[qi], &self.ac_codes[qi], out, rl)
        } else {
            quantize_block(block, c as u8, &self.quants[qi], out, rl)
        }
    }

    /// Emit one block's DC and AC codes.
    pub(crate) fn code_block(&mut self, coeffs: &DctCoeffs, rl: &[RunLevel]) {
        let q_idx = self.quant_idx[coeffs.idx as usize];

        let dc_len = (coeffs.dc_code & 0x0f) as u32;
        self.bw.put_packed_code(self.dc_codes[q_idx][dc_len as usize]);
        if dc_len > 0 {
            self.bw.put_bits((coeffs.dc_code >> 4) as u32, dc_len);
        }

        let codes = &self.ac_codes[q_idx];
        for token in rl {
            let mut run = token.run as u32;
            while run & !15 != 0 {
                self.bw.put_packed_code(codes[0xf0]);
                run -= 16;
            }
            let suffix = token.level as u32;
            let n = suffix & 0x0f;
            let sym = ((run << 4) | n) as usize;
            self.bw.put_packed_code(codes[sym]);
            self.bw.put_bits(suffix >> 4, n);
        }
        if coeffs.last < 63 {
            self.bw.put_packed_code(codes[0x00]); // EOB
        }
    }

    // =========================================================================
    // Histogram / coefficient collection
    // =========================================================================

    /// One pass over the pixels: fDCT everywhere, histograms accumulated,
    /// and (method permitting) coefficients retained for later passes.
    pub(crate) fn collect_histograms(&mut self) {
        self.histos[0].reset();
        self.histos[1].reset();
        self.collect_blocks(true);
    }

    /// Same pass without histogramming; used when only the retained
    /// coefficients are needed.
    pub(crate) fn collect_coeffs(&mut self) {
        self.collect_blocks(false);
    }

    fn collect_blocks(&mut self, with_histo: bool) {
        let mb_x_max = self.w / self.block_w;
        let mb_y_max = self.h / self.block_h;
        let mcu_len = self.mcu_blocks * 64;
        let mut tmp = vec![0i16; mcu_len];
        for mb_y in 0..self.mb_h {
            let yclip = mb_y == mb_y_max;
            for mb_x in 0..self.mb_w {
                let clipped = yclip || mb_x == mb_x_max;
                let base = (mb_y * self.mb_w + mb_x) * mcu_len;
                if self.use_extra_memory {
                    let dst = &mut self.in_blocks[base..base + mcu_len];
                    self.sampler.sample(mb_x, mb_y, clipped, dst);
                    fdct(dst, self.mcu_blocks);
                } else {
                    self.sampler.sample(mb_x, mb_y, clipped, &mut tmp);
                    fdct(&mut tmp, self.mcu_blocks);
                }
                if with_histo {
                    let mut offset = 0usize;
                    for c in 0..self.nb_comps {
                        let qi = self.quant_idx[c];
                        let nb = self.nb_blocks[c];
                        let blocks: &[i16] = if self.use_extra_memory {
                            &self.in_blocks[base + offset..base + offset + nb * 64]
                        } else {
                            &tmp[offset..offset + nb * 64]
                        };
                        store_histo(blocks, &mut self.histos[qi], nb);
                        offset += nb * 64;
                    }
                }
            }
        }
        self.have_coeffs = self.use_extra_memory;
    }

    /// Run the matrix analyzer on each quantizer index and refresh the
    /// derived state.
    pub(crate) fn apply_adaptive_quant(&mut self) {
        let nb_tables = if self.nb_comps == 1 { 1 } else { 2 };
        for idx in (0..nb_tables).rev() {
            let qdelta_max = if idx == 0 {
                self.qdelta_max_luma
            } else {
                self.qdelta_max_chroma
            };
            analyse_histo(&self.histos[idx], &mut self.quants[idx], qdelta_max);
            self.quants[idx].finalize(self.q_bias);
        }
        // rebind the AC cost codes the trellis search reads
        self.init_codes(true);
    }

    // =========================================================================
    // Scan drivers
    // =========================================================================

    /// 1-pass scan: quantize and emit directly with the current tables.
    pub(crate) fn scan(&mut self) {
        self.reset_dcs();
        let mb_x_max = self.w / self.block_w;
        let mb_y_max = self.h / self.block_h;
        let mcu_len = self.mcu_blocks * 64;
        let mut tmp = vec![0i16; mcu_len];
        let mut rl: Vec<RunLevel> = Vec::with_capacity(64);
        for mb_y in 0..self.mb_h {
            let yclip = mb_y == mb_y_max;
            for mb_x in 0..self.mb_w {
                self.check_buffers();
                let clipped = yclip || mb_x == mb_x_max;
                if !self.have_coeffs {
                    self.sampler.sample(mb_x, mb_y, clipped, &mut tmp);
                    fdct(&mut tmp, self.mcu_blocks);
                }
                let mut offset = if self.have_coeffs {
                    (mb_y * self.mb_w + mb_x) * mcu_len
                } else {
                    0
                };
                for c in 0..self.nb_comps {
                    for _ in 0..self.nb_blocks[c] {
                        let mut coeffs = DctCoeffs::default();
                        rl.clear();
                        let from_store = self.have_coeffs;
                        let dc =
                            self.quantize_dispatch(offset, from_store, &tmp, c, &mut coeffs, &mut rl);
                        coeffs.dc_code = generate_dc_diff_code(dc, &mut self.dcs[c]);
                        self.code_block(&coeffs, &rl);
                        offset += 64;
                    }
                }
            }
        }
    }

    pub(crate) fn single_pass_scan(&mut self) {
        self.write_dht();
        self.write_sos();
        self.scan();
    }

    /// Rebuild the four tables from the accumulated frequencies.
    pub(crate) fn compile_entropy_stats(&mut self) {
        let nb_tables = if self.nb_comps == 1 { 1 } else { 2 };
        for q_idx in 0..nb_tables {
            self.huffman_tables[q_idx] =
                build_optimal_table(&self.stats.freq_dc[q_idx], NUM_DC_SYMBOLS);
            self.huffman_tables[2 + q_idx] =
                build_optimal_table(&self.stats.freq_ac[q_idx], NUM_AC_SYMBOLS);
        }
    }

    /// 2-pass scan: collect symbol statistics, build optimal tables, then
    /// re-emit either from stored tokens or by re-quantizing the image.
    pub(crate) fn multi_pass_scan(&mut self) {
        let nb_mbs = self.mb_w * self.mb_h * self.mcu_blocks;
        let mut store: Vec<DctCoeffs> = if self.reuse_run_levels {
            Vec::with_capacity(nb_mbs)
        } else {
            Vec::new()
        };

        // the default tables serve as the bit-rate basis for trellis
        if self.use_trellis {
            self.init_codes(true);
        }
        self.stats.reset();
        self.reset_dcs();
        self.all_run_levels.clear();

        let mb_x_max = self.w / self.block_w;
        let mb_y_max = self.h / self.block_h;
        let mcu_len = self.mcu_blocks * 64;
        let mut tmp = vec![0i16; mcu_len];
        let mut local_rl: Vec<RunLevel> = Vec::with_capacity(64);
        for mb_y in 0..self.mb_h {
            let yclip = mb_y == mb_y_max;
            for mb_x in 0..self.mb_w {
                self.check_buffers();
                let clipped = yclip || mb_x == mb_x_max;
                if !self.have_coeffs {
                    self.sampler.sample(mb_x, mb_y, clipped, &mut tmp);
                    fdct(&mut tmp, self.mcu_blocks);
                }
                let mut offset = if self.have_coeffs {
                    (mb_y * self.mb_w + mb_x) * mcu_len
                } else {
                    0
                };
                for c in 0..self.nb_comps {
                    let qi = self.quant_idx[c];
                    for _ in 0..self.nb_blocks[c] {
                        let mut coeffs = DctCoeffs::default();
                        let from_store = self.have_coeffs;
                        if self.reuse_run_levels {
                            let rl_start = self.all_run_levels.len();
                            let dc = {
                                let block = if from_store {
                                    &self.in_blocks[offset..offset + 64]
                                } else {
                                    &tmp[offset..offset + 64]
                                };
                                if self.use_trellis {
                                    trellis_quantize_block(
                                        block,
                                        c as u8,
                                        &self.quants[qi],
                                        &self.ac_codes[qi],
                                        &mut coeffs,
                                        &mut self.all_run_levels,
                                    )
                                } else {
                                    quantize_block(
                                        block,
                                        c as u8,
                                        &self.quants[qi],
                                        &mut coeffs,
                                        &mut self.all_run_levels,
                                    )
                                }
                            };
                            coeffs.dc_code = generate_dc_diff_code(dc, &mut self.dcs[c]);
                            self.stats
                                .add_block(qi, &coeffs, &self.all_run_levels[rl_start..]);
                            store.push(coeffs);
                        } else {
                            local_rl.clear();
                            let dc = self.quantize_dispatch(
                                offset,
                                from_store,
                                &tmp,
                                c,
                                &mut coeffs,
                                &mut local_rl,
                            );
                            coeffs.dc_code = generate_dc_diff_code(dc, &mut self.dcs[c]);
                            self.stats.add_block(qi, &coeffs, &local_rl);
                        }
                        offset += 64;
                    }
                }
            }
        }

        self.compile_entropy_stats();
        self.write_dht();
        self.write_sos();

        if !self.reuse_run_levels {
            // redo everything with the optimal tables
            self.scan();
        } else {
            // fast second pass from the saved tokens
            let rls = std::mem::take(&mut self.all_run_levels);
            let mut pos = 0usize;
            for coeffs in &store {
                self.check_buffers();
                let n = coeffs.nb_coeffs as usize;
                self.code_block(coeffs, &rls[pos..pos + n]);
                pos += n;
            }
            self.all_run_levels = rls;
        }
    }

    // =========================================================================
    // Top-level flow
    // =========================================================================

    pub(crate) fn encode_inner(&mut self) -> Result<()> {
        self.quants[0].finalize(self.q_bias);
        self.quants[1].finalize(self.q_bias);

        if self.use_extra_memory {
            self.in_blocks = vec![0i16; self.mb_w * self.mb_h * self.mcu_blocks * 64];
        }
        self.have_coeffs = false;

        // adaptive matrices for the plain (non-targeted) path; the
        // convergence loop re-runs the analyzer per pass instead
        if self.target_mode == TargetMode::None && self.use_adaptive_quant {
            self.collect_histograms();
            self.apply_adaptive_quant();
        }

        self.write_app0();
        self.write_app_markers()?;
        self.write_exif()?;
        self.write_iccp()?;
        self.write_xmp()?;

        if self.target_mode != TargetMode::None {
            self.loop_scan();
        } else {
            self.write_dqt();
            self.write_sof();
            if self.optimize_size {
                self.multi_pass_scan();
            } else {
                self.single_pass_scan();
            }
        }
        self.write_eoi();

        if !self.ok {
            return Err(Error::Internal("encoding failed"));
        }
        Ok(())
    }
}

// =============================================================================
// Public entry points
// =============================================================================

/// Encode an interleaved sRGB buffer to a JFIF bitstream.
///
/// `stride` is the distance between rows in bytes (at least `3 * width`).
/// On failure no partial output is returned.
pub fn encode(
    rgb: &[u8],
    width: usize,
    height: usize,
    stride: usize,
    param: &EncodeParam,
) -> Result<Vec<u8>> {
    encode_with_method(rgb, width, height, stride, param, param.method())
}

/// Same as [`encode`], with an explicit compression method (0..=8):
///
/// | method | Huffman opt | adaptive Q | keep coeffs | keep tokens | trellis |
/// |--------|-------------|------------|-------------|-------------|---------|
/// | 0      |             |            |             |             |         |
/// | 1      | x           |            |             | x           |         |
/// | 2      | x           |            |             |             |         |
/// | 3      |             | x          | x           |             |         |
/// | 4      | x           | x          | x           | x           |         |
/// | 5      | x           | x          |             | x           |         |
/// | 6      | x           | x          |             |             |         |
/// | 7      | x           | x          | x           | x           | x       |
/// | 8      | x           | x          |             |             | x       |
pub fn encode_with_method(
    rgb: &[u8],
    width: usize,
    height: usize,
    stride: usize,
    param: &EncodeParam,
    method: u8,
) -> Result<Vec<u8>> {
    let mut enc = Box::new(Encoder::new(rgb, width, height, stride, param, method)?);
    match enc.encode_inner() {
        Ok(()) => Ok(enc.bw.grab()),
        Err(e) => {
            enc.bw.delete_output();
            Err(e)
        }
    }
}

/// Simplest call: quality only, defaults for everything else.
pub fn compress(rgb: &[u8], width: usize, height: usize, quality: i32) -> Result<Vec<u8>> {
    let param = EncodeParam::new(quality);
    encode(rgb, width, height, 3 * width, &param)
}
