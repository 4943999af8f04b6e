//! RGB to YCbCr conversion and MCU sampling.
//!
//! A [`McuSampler`] produces the level-shifted 8x8 sample blocks of one MCU
//! for a given grid position, replicating edge pixels when the MCU sticks
//! out of the image. Four implementations cover 4:2:0, "sharp" 4:2:0,
//! 4:4:4 and single-plane grayscale.

use wide::f32x4;

// BT.601 coefficients, JFIF full-range
const R_TO_Y: f32 = 0.299;
const G_TO_Y: f32 = 0.587;
const B_TO_Y: f32 = 0.114;
const R_TO_CB: f32 = -0.168_736;
const G_TO_CB: f32 = -0.331_264;
const B_TO_CB: f32 = 0.5;
const R_TO_CR: f32 = 0.5;
const G_TO_CR: f32 = -0.418_688;
const B_TO_CR: f32 = -0.081_312;

/// Convert one RGB pixel to full-range YCbCr.
#[inline]
pub fn rgb_to_ycbcr(r: u8, g: u8, b: u8) -> (u8, u8, u8) {
    let (rf, gf, bf) = (r as f32, g as f32, b as f32);
    let y = R_TO_Y * rf + G_TO_Y * gf + B_TO_Y * bf;
    let cb = R_TO_CB * rf + G_TO_CB * gf + B_TO_CB * bf + 128.0;
    let cr = R_TO_CR * rf + G_TO_CR * gf + B_TO_CR * bf + 128.0;
    (
        y.round().clamp(0.0, 255.0) as u8,
        cb.round().clamp(0.0, 255.0) as u8,
        cr.round().clamp(0.0, 255.0) as u8,
    )
}

/// Convert four consecutive RGB pixels (12 bytes) to level-shifted luma.
#[inline]
fn luma4(px: &[u8]) -> [i16; 4] {
    let r = f32x4::from([px[0] as f32, px[3] as f32, px[6] as f32, px[9] as f32]);
    let g = f32x4::from([px[1] as f32, px[4] as f32, px[7] as f32, px[10] as f32]);
    let b = f32x4::from([px[2] as f32, px[5] as f32, px[8] as f32, px[11] as f32]);
    let y = r * f32x4::splat(R_TO_Y) + g * f32x4::splat(G_TO_Y) + b * f32x4::splat(B_TO_Y);
    let y = y.round().to_array();
    [
        y[0] as i16 - 128,
        y[1] as i16 - 128,
        y[2] as i16 - 128,
        y[3] as i16 - 128,
    ]
}

/// Fill the three 8x8 blocks (Y, Cb, Cr) of a 4:4:4 MCU from 8x8 RGB.
fn yuv444_block(rgb: &[u8], stride: usize, out: &mut [i16]) {
    debug_assert!(out.len() >= 3 * 64);
    for y in 0..8 {
        let row = &rgb[y * stride..];
        for x in 0..8 {
            let (yy, cb, cr) = rgb_to_ycbcr(row[3 * x], row[3 * x + 1], row[3 * x + 2]);
            let n = y * 8 + x;
            out[n] = yy as i16 - 128;
            out[64 + n] = cb as i16 - 128;
            out[128 + n] = cr as i16 - 128;
        }
    }
}

/// Fill the six blocks (4 Y + Cb + Cr) of a 4:2:0 MCU from 16x16 RGB.
/// Chroma is averaged over 2x2 neighborhoods before conversion.
fn yuv420_block(rgb: &[u8], stride: usize, out: &mut [i16]) {
    debug_assert!(out.len() >= 6 * 64);
    // luma: four 8x8 quadrant blocks in raster order
    for y in 0..16 {
        let row = &rgb[y * stride..];
        let (vblk, yy) = (y / 8, y % 8);
        for x4 in 0..4 {
            let quad = luma4(&row[12 * x4..]);
            let x = 4 * x4;
            let blk = vblk * 2 + x / 8;
            let base = blk * 64 + yy * 8 + (x % 8);
            out[base..base + 4].copy_from_slice(&quad);
        }
    }
    // chroma: one site per 2x2 pixels; conversion is linear, so converting
    // the averaged RGB equals averaging the converted chroma
    for cy in 0..8 {
        let row0 = &rgb[(2 * cy) * stride..];
        let row1 = &rgb[(2 * cy + 1) * stride..];
        for cx in 0..8 {
            let o = 6 * cx;
            let r = row0[o] as u32 + row0[o + 3] as u32 + row1[o] as u32 + row1[o + 3] as u32;
            let g =
                row0[o + 1] as u32 + row0[o + 4] as u32 + row1[o + 1] as u32 + row1[o + 4] as u32;
            let b =
                row0[o + 2] as u32 + row0[o + 5] as u32 + row1[o + 2] as u32 + row1[o + 5] as u32;
            let (_, cb, cr) = rgb_to_ycbcr(
                ((r + 2) / 4) as u8,
                ((g + 2) / 4) as u8,
                ((b + 2) / 4) as u8,
            );
            let n = cy * 8 + cx;
            out[4 * 64 + n] = cb as i16 - 128;
            out[5 * 64 + n] = cr as i16 - 128;
        }
    }
}

/// Fill one 8x8 luma block from 8x8 RGB (grayscale encoding).
fn luma_block(rgb: &[u8], stride: usize, out: &mut [i16]) {
    debug_assert!(out.len() >= 64);
    for y in 0..8 {
        let row = &rgb[y * stride..];
        out[y * 8..y * 8 + 4].copy_from_slice(&luma4(&row[0..]));
        out[y * 8 + 4..y * 8 + 8].copy_from_slice(&luma4(&row[12..]));
    }
}

// =============================================================================
// Edge replication
// =============================================================================

/// Replicate a partial `sub_w x sub_h` RGB block into a full `w x h` block.
fn replicate_rgb<'a>(
    rgb: &[u8],
    stride: usize,
    mut sub_w: usize,
    mut sub_h: usize,
    w: usize,
    h: usize,
    buf: &'a mut [u8],
) -> &'a [u8] {
    debug_assert!(sub_w > 0 && sub_h > 0);
    sub_w = sub_w.min(w);
    sub_h = sub_h.min(h);
    for y in 0..sub_h {
        let dst = &mut buf[y * 3 * w..(y + 1) * 3 * w];
        dst[..3 * sub_w].copy_from_slice(&rgb[y * stride..y * stride + 3 * sub_w]);
        for x in sub_w..w {
            let (head, tail) = dst.split_at_mut(3 * x);
            tail[..3].copy_from_slice(&head[3 * (sub_w - 1)..3 * sub_w]);
        }
    }
    for y in sub_h..h {
        let (head, tail) = buf.split_at_mut(y * 3 * w);
        tail[..3 * w].copy_from_slice(&head[(y - 1) * 3 * w..]);
    }
    &buf[..3 * w * h]
}

/// Replicate a partial single-channel block similarly.
fn replicate_plane<'a>(
    src: &[u8],
    stride: usize,
    mut sub_w: usize,
    mut sub_h: usize,
    w: usize,
    h: usize,
    buf: &'a mut [u8],
) -> &'a [u8] {
    debug_assert!(sub_w > 0 && sub_h > 0);
    sub_w = sub_w.min(w);
    sub_h = sub_h.min(h);
    for y in 0..sub_h {
        let dst = &mut buf[y * w..(y + 1) * w];
        dst[..sub_w].copy_from_slice(&src[y * stride..y * stride + sub_w]);
        for x in sub_w..w {
            dst[x] = dst[sub_w - 1];
        }
    }
    for y in sub_h..h {
        let (head, tail) = buf.split_at_mut(y * w);
        tail[..w].copy_from_slice(&head[(y - 1) * w..]);
    }
    &buf[..w * h]
}

fn block_average(block: &[i16]) -> i16 {
    let sum: i32 = block[..64].iter().map(|&v| v as i32).sum();
    ((sum + 32) >> 6) as i16
}

fn set_block_average(dc: i16, block: &mut [i16]) {
    block[..64].fill(dc);
}

/// Luma blocks of a clipped 4:2:0 MCU that lie fully outside the image are
/// flattened to the preceding block's average, which helps compressibility.
fn average_extra_luma(sub_w: usize, sub_h: usize, out: &mut [i16]) {
    let mut dc = block_average(&out[0..64]);
    if sub_w <= 8 {
        // block #1 is entirely replicated from block #0
        set_block_average(dc, &mut out[64..128]);
    }
    if sub_h <= 8 {
        if sub_w > 8 {
            dc = block_average(&out[64..128]);
        }
        set_block_average(dc, &mut out[128..192]);
        set_block_average(dc, &mut out[192..256]);
    } else if sub_w <= 8 {
        let dc = block_average(&out[128..192]);
        set_block_average(dc, &mut out[192..256]);
    }
}

// =============================================================================
// Samplers
// =============================================================================

/// Produces the sample blocks of one MCU at grid position `(mb_x, mb_y)`.
/// `clipped` marks MCUs that overlap the right/bottom image border.
pub trait McuSampler {
    fn sample(&mut self, mb_x: usize, mb_y: usize, clipped: bool, out: &mut [i16]);
}

/// 16x16 MCUs, chroma box-subsampled to 8x8.
pub struct Yuv420Sampler<'a> {
    rgb: &'a [u8],
    w: usize,
    h: usize,
    stride: usize,
    replicated: Box<[u8; 3 * 16 * 16]>,
}

impl<'a> Yuv420Sampler<'a> {
    pub fn new(rgb: &'a [u8], w: usize, h: usize, stride: usize) -> Self {
        Self {
            rgb,
            w,
            h,
            stride,
            replicated: Box::new([0; 3 * 16 * 16]),
        }
    }
}

impl McuSampler for Yuv420Sampler<'_> {
    fn sample(&mut self, mb_x: usize, mb_y: usize, clipped: bool, out: &mut [i16]) {
        let offset = (3 * mb_x + mb_y * self.stride) * 16;
        if clipped {
            let sub_w = self.w - mb_x * 16;
            let sub_h = self.h - mb_y * 16;
            let data = replicate_rgb(
                &self.rgb[offset..],
                self.stride,
                sub_w,
                sub_h,
                16,
                16,
                &mut self.replicated[..],
            );
            yuv420_block(data, 3 * 16, out);
            average_extra_luma(sub_w, sub_h, out);
        } else {
            yuv420_block(&self.rgb[offset..], self.stride, out);
        }
    }
}

/// 8x8 MCUs, full-resolution chroma.
pub struct Yuv444Sampler<'a> {
    rgb: &'a [u8],
    w: usize,
    h: usize,
    stride: usize,
    replicated: Box<[u8; 3 * 16 * 16]>,
}

impl<'a> Yuv444Sampler<'a> {
    pub fn new(rgb: &'a [u8], w: usize, h: usize, stride: usize) -> Self {
        Self {
            rgb,
            w,
            h,
            stride,
            replicated: Box::new([0; 3 * 16 * 16]),
        }
    }
}

impl McuSampler for Yuv444Sampler<'_> {
    fn sample(&mut self, mb_x: usize, mb_y: usize, clipped: bool, out: &mut [i16]) {
        let offset = (3 * mb_x + mb_y * self.stride) * 8;
        if clipped {
            let data = replicate_rgb(
                &self.rgb[offset..],
                self.stride,
                self.w - mb_x * 8,
                self.h - mb_y * 8,
                8,
                8,
                &mut self.replicated[..],
            );
            yuv444_block(data, 3 * 8, out);
        } else {
            yuv444_block(&self.rgb[offset..], self.stride, out);
        }
    }
}

/// 8x8 grayscale MCUs: only the luma plane is produced.
pub struct GraySampler<'a> {
    rgb: &'a [u8],
    w: usize,
    h: usize,
    stride: usize,
    replicated: Box<[u8; 3 * 16 * 16]>,
}

impl<'a> GraySampler<'a> {
    pub fn new(rgb: &'a [u8], w: usize, h: usize, stride: usize) -> Self {
        Self {
            rgb,
            w,
            h,
            stride,
            replicated: Box::new([0; 3 * 16 * 16]),
        }
    }
}

impl McuSampler for GraySampler<'_> {
    fn sample(&mut self, mb_x: usize, mb_y: usize, clipped: bool, out: &mut [i16]) {
        let offset = (3 * mb_x + mb_y * self.stride) * 8;
        if clipped {
            let data = replicate_rgb(
                &self.rgb[offset..],
                self.stride,
                self.w - mb_x * 8,
                self.h - mb_y * 8,
                8,
                8,
                &mut self.replicated[..],
            );
            luma_block(data, 3 * 8, out);
        } else {
            luma_block(&self.rgb[offset..], self.stride, out);
        }
    }
}

/// 4:2:0 with a sharper chroma reduction: the image is converted to planes
/// up front, chroma is box-downsampled and then run through one
/// bilinear-consistency correction sweep that counteracts the smoothing of
/// plain averaging.
pub struct SharpYuv420Sampler {
    y_plane: Vec<u8>,
    u_plane: Vec<u8>,
    v_plane: Vec<u8>,
    w: usize,
    h: usize,
    uv_w: usize,
    uv_h: usize,
    replicated: Box<[u8; 16 * 16]>,
}

impl SharpYuv420Sampler {
    pub fn new(rgb: &[u8], w: usize, h: usize, stride: usize) -> Self {
        let uv_w = (w + 1) / 2;
        let uv_h = (h + 1) / 2;

        let mut y_plane = vec![0u8; w * h];
        let mut cb_full = vec![0f32; w * h];
        let mut cr_full = vec![0f32; w * h];
        for y in 0..h {
            let row = &rgb[y * stride..];
            for x in 0..w {
                let (rf, gf, bf) = (
                    row[3 * x] as f32,
                    row[3 * x + 1] as f32,
                    row[3 * x + 2] as f32,
                );
                let yy = R_TO_Y * rf + G_TO_Y * gf + B_TO_Y * bf;
                y_plane[y * w + x] = yy.round().clamp(0.0, 255.0) as u8;
                cb_full[y * w + x] = R_TO_CB * rf + G_TO_CB * gf + B_TO_CB * bf + 128.0;
                cr_full[y * w + x] = R_TO_CR * rf + G_TO_CR * gf + B_TO_CR * bf + 128.0;
            }
        }

        let u_plane = Self::downsample_sharp(&cb_full, w, h, uv_w, uv_h);
        let v_plane = Self::downsample_sharp(&cr_full, w, h, uv_w, uv_h);
        Self {
            y_plane,
            u_plane,
            v_plane,
            w,
            h,
            uv_w,
            uv_h,
            replicated: Box::new([0; 16 * 16]),
        }
    }

    fn downsample_sharp(full: &[f32], w: usize, h: usize, uv_w: usize, uv_h: usize) -> Vec<u8> {
        // plain 2x2 box average first
        let mut base = vec![0f32; uv_w * uv_h];
        for cy in 0..uv_h {
            for cx in 0..uv_w {
                let x0 = 2 * cx;
                let y0 = 2 * cy;
                let x1 = (x0 + 1).min(w - 1);
                let y1 = (y0 + 1).min(h - 1);
                base[cy * uv_w + cx] = 0.25
                    * (full[y0 * w + x0] + full[y0 * w + x1] + full[y1 * w + x0]
                        + full[y1 * w + x1]);
            }
        }
        // one Jacobi sweep against the bilinear reconstruction: a site is
        // reconstructed as half itself plus an eighth of each 4-neighbor,
        // so pushing the residual back sharpens exactly what upsampling
        // will smear
        let mut out = vec![0u8; uv_w * uv_h];
        for cy in 0..uv_h {
            for cx in 0..uv_w {
                let at = |x: isize, y: isize| -> f32 {
                    let x = x.clamp(0, uv_w as isize - 1) as usize;
                    let y = y.clamp(0, uv_h as isize - 1) as usize;
                    base[y * uv_w + x]
                };
                let (x, y) = (cx as isize, cy as isize);
                let center = base[cy * uv_w + cx];
                let recon = 0.5 * center
                    + 0.125 * (at(x - 1, y) + at(x + 1, y) + at(x, y - 1) + at(x, y + 1));
                let sharp = center + (center - recon);
                out[cy * uv_w + cx] = sharp.round().clamp(0.0, 255.0) as u8;
            }
        }
        out
    }

    fn luma_samples(&mut self, mb_x: usize, mb_y: usize, clipped: bool, out: &mut [i16]) {
        let offset = (mb_x + mb_y * self.w) * 16;
        let (data, step): (&[u8], usize) = if clipped {
            (
                replicate_plane(
                    &self.y_plane[offset..],
                    self.w,
                    self.w - mb_x * 16,
                    self.h - mb_y * 16,
                    16,
                    16,
                    &mut self.replicated[..],
                ),
                16,
            )
        } else {
            (&self.y_plane[offset..], self.w)
        };
        for y in 0..16 {
            let row = &data[y * step..];
            let (vblk, yy) = (y / 8, y % 8);
            for x in 0..16 {
                let blk = vblk * 2 + x / 8;
                out[blk * 64 + yy * 8 + (x % 8)] = row[x] as i16 - 128;
            }
        }
    }

    fn chroma_samples(&mut self, mb_x: usize, mb_y: usize, clipped: bool, out: &mut [i16]) {
        for (c, plane) in [(0usize, true), (1usize, false)] {
            let plane_data: &[u8] = if plane { &self.u_plane } else { &self.v_plane };
            let offset = (mb_x + mb_y * self.uv_w) * 8;
            let (data, step): (&[u8], usize) = if clipped {
                (
                    replicate_plane(
                        &plane_data[offset..],
                        self.uv_w,
                        self.uv_w - mb_x * 8,
                        self.uv_h - mb_y * 8,
                        8,
                        8,
                        &mut self.replicated[..],
                    ),
                    8,
                )
            } else {
                (&plane_data[offset..], self.uv_w)
            };
            let base = (4 + c) * 64;
            for y in 0..8 {
                for x in 0..8 {
                    out[base + y * 8 + x] = data[y * step + x] as i16 - 128;
                }
            }
        }
    }
}

impl McuSampler for SharpYuv420Sampler {
    fn sample(&mut self, mb_x: usize, mb_y: usize, clipped: bool, out: &mut [i16]) {
        self.luma_samples(mb_x, mb_y, clipped, out);
        if clipped {
            average_extra_luma(self.w - mb_x * 16, self.h - mb_y * 16, out);
        }
        self.chroma_samples(mb_x, mb_y, clipped, out);
    }
}
