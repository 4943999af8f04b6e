//! Trellis quantization: per-block dynamic programming over alternative
//! coefficient magnitudes, minimizing `distortion + lambda * rate` against
//! the currently bound AC code lengths.
//!
//! Compared to the greedy quantizer the search can end a block earlier,
//! zero out mid-block coefficients to lengthen runs, and lower a magnitude
//! by one category. It never increases a magnitude.

use crate::consts::ZIGZAG;
use crate::quant::{calc_log2, quantize, DctCoeffs, Quantizer, RunLevel, AC_BITS};

/// Number of alternate magnitudes investigated per coefficient.
const NUM_TRELLIS_NODES: usize = 2;

const MAX_SCORE: u64 = u64::MAX;

#[derive(Clone, Copy)]
struct TrellisNode {
    code: u32,  // amplitude bits (one's complement for negatives)
    nbits: u32, // category
    score: u64,
    disto: u64,
    run: u32,
    best_prev: usize, // index into the node arena; 0 is the sink
    pos: usize,       // zig-zag position
    rank: u16,        // number of tokens on the path ending here
}

impl TrellisNode {
    fn sink() -> Self {
        Self {
            code: 0,
            nbits: 0,
            score: 0,
            disto: 0,
            run: 0,
            best_prev: 0,
            pos: 0,
            rank: 0,
        }
    }
}

/// Scan every node before `cand` for the cheapest predecessor. Returns true
/// if some reachable predecessor was found.
fn search_best_prev(
    nodes: &[TrellisNode],
    cand: &mut TrellisNode,
    disto0: &[u64; 64],
    codes: &[u32; 256],
    lambda: u64,
) -> bool {
    debug_assert!(codes[0xf0] != 0);
    let mut found = false;
    let base_disto = cand.disto + disto0[cand.pos - 1];
    for cur_idx in (0..nodes.len()).rev() {
        let cur = &nodes[cur_idx];
        if cand.pos <= cur.pos {
            continue; // candidate at the same position, not a predecessor
        }
        let run = (cand.pos - 1 - cur.pos) as u32;
        let mut bits = cand.nbits;
        bits += (run >> 4) * (codes[0xf0] & 0xff);
        let sym = (((run & 15) << 4) | cand.nbits) as usize;
        debug_assert!(codes[sym] != 0);
        bits += codes[sym] & 0xff;
        let disto = base_disto - disto0[cur.pos];
        let score = disto + lambda * bits as u64 + cur.score;
        if score < cand.score {
            cand.score = score;
            cand.disto = disto;
            cand.best_prev = cur_idx;
            cand.rank = cur.rank + 1;
            cand.run = run;
            found = true;
        }
    }
    found
}

/// Trellis-quantize one block. Same contract as
/// [`quantize_block`](crate::quant::quantize_block), plus the packed AC code
/// table the rate term is evaluated against.
pub fn trellis_quantize_block(
    input: &[i16],
    idx: u8,
    q: &Quantizer,
    codes: &[u32; 256],
    out: &mut DctCoeffs,
    rl: &mut Vec<RunLevel>,
) -> i32 {
    debug_assert!(input.len() >= 64);
    let mut nodes: Vec<TrellisNode> = Vec::with_capacity(1 + NUM_TRELLIS_NODES * 63);
    nodes.push(TrellisNode::sink());

    // disto0[i] = sum of squared magnitudes up to zig-zag position i
    let mut disto0 = [0u64; 64];
    for i in 1..64 {
        let j = ZIGZAG[i];
        let qj = (q.quant[j] as u64) << AC_BITS;
        let lambda = qj * qj / 32;
        let v0 = input[j] as i32;
        let mask = v0 >> 31;
        let big_v = ((v0 ^ mask) - mask) as u32;
        disto0[i] = (big_v as u64) * (big_v as u64) + disto0[i - 1];

        let mut v = quantize(big_v, q.iquant[j] as u32, q.bias[j] as u32);
        if v == 0 {
            continue;
        }
        let mut nbits = calc_log2(v);
        for _ in 0..NUM_TRELLIS_NODES {
            let err = big_v as i64 - v as i64 * qj as i64;
            let mut cand = TrellisNode {
                code: (v as i32 ^ mask) as u32 & ((1 << nbits) - 1),
                nbits,
                score: MAX_SCORE,
                disto: (err * err) as u64,
                run: 0,
                best_prev: 0,
                pos: i,
                rank: 0,
            };
            if search_best_prev(&nodes, &mut cand, &disto0, codes, lambda) {
                nodes.push(cand);
            }
            if nbits <= 1 {
                break;
            }
            nbits -= 1;
            v = (1 << nbits) - 1;
        }
    }

    // add the end-of-block region's distortion and pick the best tail.
    // EOB's own bit cost is identical for every tail except position 63,
    // so it is left out of the comparison.
    let mut best = 0usize; // sink: empty block
    if nodes.len() > 1 {
        let mut best_score = MAX_SCORE;
        for k in (1..nodes.len()).rev() {
            let tail = disto0[63] - disto0[nodes[k].pos];
            nodes[k].disto += tail;
            nodes[k].score += tail;
            if nodes[k].score < best_score {
                best = k;
                best_score = nodes[k].score;
            }
        }
    }

    let nz = &nodes[best];
    let nb = nz.rank as usize;
    out.idx = idx;
    out.last = nz.pos as u16;
    out.nb_coeffs = nb as u16;

    // materialize the winning path backward
    let base = rl.len();
    rl.resize(base + nb, RunLevel::default());
    let mut k = best;
    for slot in (0..nb).rev() {
        let node = &nodes[k];
        rl[base + slot] = RunLevel {
            run: node.run as u16,
            level: ((node.code << 4) | node.nbits) as u16,
        };
        k = node.best_prev;
    }

    let dc0 = input[0] as i32;
    if dc0 < 0 {
        -(quantize((-dc0) as u32, q.iquant[0] as u32, q.bias[0] as u32) as i32)
    } else {
        quantize(dc0 as u32, q.iquant[0] as u32, q.bias[0] as u32) as i32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consts::DEFAULT_MATRICES;
    use crate::huffman::standard_tables;
    use crate::quant::{code_to_coeff, q_factor, quantize_block, set_quant_matrix};

    fn quantizer(quality: i32) -> Quantizer {
        let mut q = Quantizer::default();
        set_quant_matrix(&DEFAULT_MATRICES[0], q_factor(quality), &mut q.quant);
        q.finalize(0x78);
        q
    }

    fn ac_codes() -> [u32; 256] {
        let mut codes = [0u32; 256];
        standard_tables()[2].build_codes(&mut codes);
        codes
    }

    fn test_block() -> [i16; 64] {
        let mut input = [0i16; 64];
        let mut state = 0xcafef00du32;
        for (i, v) in input.iter_mut().enumerate() {
            state = state.wrapping_mul(1664525).wrapping_add(1013904223);
            // energy concentrated in low frequencies, fDCT scale
            let row = i / 8;
            let col = i % 8;
            let damp = 1 + row + col;
            *v = (((state >> 16) as i16 % 1200) / damp as i16).clamp(-1200, 1200);
        }
        input
    }

    #[test]
    fn zero_block_stays_empty() {
        let q = quantizer(75);
        let codes = ac_codes();
        let input = [0i16; 64];
        let mut out = DctCoeffs::default();
        let mut rl = Vec::new();
        let dc = trellis_quantize_block(&input, 0, &q, &codes, &mut out, &mut rl);
        assert_eq!(dc, 0);
        assert_eq!(out.nb_coeffs, 0);
        assert_eq!(out.last, 0);
        assert!(rl.is_empty());
    }

    #[test]
    fn never_increases_magnitudes() {
        let q = quantizer(50);
        let codes = ac_codes();
        let input = test_block();

        let mut plain_out = DctCoeffs::default();
        let mut plain_rl = Vec::new();
        quantize_block(&input, 0, &q, &mut plain_out, &mut plain_rl);

        let mut tr_out = DctCoeffs::default();
        let mut tr_rl = Vec::new();
        trellis_quantize_block(&input, 0, &q, &codes, &mut tr_out, &mut tr_rl);

        // gather per-position magnitudes for both paths
        let collect = |rl: &[RunLevel]| {
            let mut mags = [0i32; 64];
            let mut pos = 0usize;
            for t in rl {
                pos += t.run as usize + 1;
                mags[pos] = code_to_coeff(t.level).abs();
            }
            mags
        };
        let plain = collect(&plain_rl);
        let tr = collect(&tr_rl);
        for i in 0..64 {
            assert!(tr[i] <= plain[i], "pos {}: {} > {}", i, tr[i], plain[i]);
        }
        assert!(tr_out.last <= plain_out.last);
        assert!(tr_out.nb_coeffs <= plain_out.nb_coeffs);
    }

    #[test]
    fn tokens_are_consistent_with_descriptor() {
        let q = quantizer(30);
        let codes = ac_codes();
        let input = test_block();
        let mut out = DctCoeffs::default();
        let mut rl = Vec::new();
        trellis_quantize_block(&input, 1, &q, &codes, &mut out, &mut rl);

        assert_eq!(out.idx, 1);
        assert_eq!(out.nb_coeffs as usize, rl.len());
        let mut pos = 0usize;
        for t in &rl {
            pos += t.run as usize + 1;
            assert!(pos < 64);
            let cat = t.level & 0x0f;
            assert!((1..=11).contains(&cat));
        }
        assert_eq!(out.last as usize, if rl.is_empty() { 0 } else { pos });
    }

    #[test]
    fn dc_matches_plain_quantizer() {
        let q = quantizer(75);
        let codes = ac_codes();
        let mut input = test_block();
        input[0] = -777;

        let mut out = DctCoeffs::default();
        let mut rl = Vec::new();
        let tr_dc = trellis_quantize_block(&input, 0, &q, &codes, &mut out, &mut rl);

        let mut out2 = DctCoeffs::default();
        let mut rl2 = Vec::new();
        let plain_dc = quantize_block(&input, 0, &q, &mut out2, &mut rl2);
        assert_eq!(tr_dc, plain_dc);
    }
}
