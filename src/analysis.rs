//! Chroma riskiness analysis for picking the sampling mode automatically.
//!
//! Downsampling chroma 2x2 is nearly free on photographic content but
//! visibly smears saturated edges (red text being the classic casualty).
//! The score below estimates how much of the image consists of sharp
//! chroma transitions; the encoder maps it to 4:2:0, sharp 4:2:0 or 4:4:4.

use imgref::ImgRef;
use rgb::RGB8;

/// Gradient magnitude (in chroma units) above which a site counts as a
/// sharp chroma edge.
const CHROMA_EDGE_THRESH: f32 = 16.0;
/// Chroma edges co-located with strong luma edges are mostly masked by the
/// luma detail; they only count at this fraction.
const MASKED_WEIGHT: f32 = 0.25;

#[inline]
fn ycbcr_f32(px: RGB8) -> (f32, f32, f32) {
    let (r, g, b) = (px.r as f32, px.g as f32, px.b as f32);
    let y = 0.299 * r + 0.587 * g + 0.114 * b;
    let cb = -0.168_736 * r - 0.331_264 * g + 0.5 * b;
    let cr = 0.5 * r - 0.418_688 * g - 0.081_312 * b;
    (y, cb, cr)
}

/// Score how risky 2x2 chroma subsampling is for this image, in 0..=100.
///
/// Sites are sampled on a grid of every other pixel; each contributes
/// according to its chroma gradient, attenuated where a strong luma
/// gradient would mask the damage anyway.
pub fn chroma_riskiness(img: ImgRef<'_, RGB8>) -> f32 {
    let (w, h) = (img.width(), img.height());
    if w < 3 || h < 3 {
        return 0.0;
    }

    let mut risky = 0.0f64;
    let mut total = 0u32;
    for y in (1..h - 1).step_by(2) {
        for x in (1..w - 1).step_by(2) {
            let (yl, cb_l, cr_l) = ycbcr_f32(img[(x - 1, y)]);
            let (yr, cb_r, cr_r) = ycbcr_f32(img[(x + 1, y)]);
            let (yt, cb_t, cr_t) = ycbcr_f32(img[(x, y - 1)]);
            let (yb, cb_b, cr_b) = ycbcr_f32(img[(x, y + 1)]);

            let luma_grad = (yr - yl).abs() + (yb - yt).abs();
            let chroma_grad = (cb_r - cb_l).abs().max((cr_r - cr_l).abs())
                + (cb_b - cb_t).abs().max((cr_b - cr_t).abs());

            if chroma_grad > CHROMA_EDGE_THRESH {
                let masked = luma_grad > 2.0 * chroma_grad;
                risky += if masked { MASKED_WEIGHT as f64 } else { 1.0 };
            }
            total += 1;
        }
    }
    if total == 0 {
        return 0.0;
    }
    // a few percent of unmasked chroma edges is already risky; saturate
    // the scale around 8% coverage
    let coverage = risky / total as f64;
    (coverage * 1250.0).min(100.0) as f32
}

/// Riskiness over a raw interleaved RGB buffer with arbitrary byte stride.
pub fn riskiness_from_rgb(rgb: &[u8], width: usize, height: usize, stride: usize) -> f32 {
    use rgb::FromSlice;
    if stride == 3 * width {
        let px = rgb[..3 * width * height].as_rgb();
        return chroma_riskiness(ImgRef::new(px, width, height));
    }
    // repack rows when the stride is not a whole number of pixels
    let mut packed = Vec::with_capacity(width * height);
    for y in 0..height {
        let row = &rgb[y * stride..y * stride + 3 * width];
        packed.extend(row.chunks_exact(3).map(|c| RGB8::new(c[0], c[1], c[2])));
    }
    chroma_riskiness(ImgRef::new(&packed, width, height))
}
