//! Convergence-loop and requantization tests.

use slimjpeg::{encode, encode_with_method, EncodeParam, TargetMode};

/// Smooth but textured image: enough detail for the size/quality relation
/// to be responsive, deterministic across runs.
fn create_textured_image(width: usize, height: usize) -> Vec<u8> {
    let mut pixels = Vec::with_capacity(width * height * 3);
    let mut state = 0x1357_9bdfu32;
    for y in 0..height {
        for x in 0..width {
            state = state.wrapping_mul(1664525).wrapping_add(1013904223);
            let noise = ((state >> 26) as i32 - 32) / 4;
            let base = ((x * 3 + y * 2) % 97) as i32 + 80;
            let r = (base + noise).clamp(0, 255) as u8;
            let g = (base + 20 - noise).clamp(0, 255) as u8;
            let b = ((base * 2) % 200 + 28) as u8;
            pixels.push(r);
            pixels.push(g);
            pixels.push(b);
        }
    }
    pixels
}

fn decode_ok(jpeg: &[u8]) -> (usize, usize) {
    let mut decoder = jpeg_decoder::Decoder::new(jpeg);
    decoder.decode().expect("decode failed");
    let info = decoder.info().unwrap();
    (info.width as usize, info.height as usize)
}

#[test]
fn size_target_converges() {
    let width = 128;
    let height = 128;
    let pixels = create_textured_image(width, height);

    let target = 5000.0f32;
    let mut param = EncodeParam::new(75);
    param.target_mode = TargetMode::Size;
    param.target_value = target;
    param.passes = 10;
    param.tolerance = 0.05;
    let jpeg = encode(&pixels, width, height, 3 * width, &param).unwrap();

    assert_eq!(decode_ok(&jpeg), (width, height));
    // converged, or settled on the last matrices: either way the result
    // must sit in the target's neighborhood for a responsive image
    let err = (jpeg.len() as f32 - target).abs();
    assert!(
        err <= 0.25 * target,
        "size {} vs target {}",
        jpeg.len(),
        target
    );
}

#[test]
fn size_targets_order_correctly() {
    let width = 96;
    let height = 96;
    let pixels = create_textured_image(width, height);

    let mut sizes = Vec::new();
    for target in [3000.0f32, 9000.0] {
        let mut param = EncodeParam::new(75);
        param.target_mode = TargetMode::Size;
        param.target_value = target;
        param.passes = 8;
        param.tolerance = 0.05;
        let jpeg = encode(&pixels, width, height, 3 * width, &param).unwrap();
        decode_ok(&jpeg);
        sizes.push(jpeg.len());
    }
    assert!(sizes[0] < sizes[1], "sizes {:?} not ordered", sizes);
}

#[test]
fn psnr_target_trades_size_for_quality() {
    let width = 96;
    let height = 96;
    let pixels = create_textured_image(width, height);

    let mut sizes = Vec::new();
    for target in [30.0f32, 40.0] {
        let mut param = EncodeParam::new(75);
        param.target_mode = TargetMode::Psnr;
        param.target_value = target;
        param.passes = 8;
        param.tolerance = 0.02;
        let jpeg = encode(&pixels, width, height, 3 * width, &param).unwrap();
        decode_ok(&jpeg);
        sizes.push(jpeg.len());
    }
    assert!(
        sizes[1] > sizes[0],
        "40 dB ({} bytes) should cost more than 30 dB ({} bytes)",
        sizes[1],
        sizes[0]
    );
}

#[test]
fn target_search_works_with_trellis() {
    let width = 64;
    let height = 64;
    let pixels = create_textured_image(width, height);

    let mut param = EncodeParam::new(75);
    param.use_trellis = true;
    param.target_mode = TargetMode::Size;
    param.target_value = 3000.0;
    param.passes = 6;
    param.tolerance = 0.1;
    let jpeg = encode(&pixels, width, height, 3 * width, &param).unwrap();
    decode_ok(&jpeg);
}

#[test]
fn requantization_recovers_quality() {
    let width = 64;
    let height = 64;
    let pixels = create_textured_image(width, height);

    // method 0 emits the quality-80 matrices untouched
    let param = EncodeParam::new(80);
    let jpeg = encode_with_method(&pixels, width, height, 3 * width, &param, 0).unwrap();

    let mut quant = [[0u8; 64]; 2];
    assert_eq!(slimjpeg::find_quantizers(&jpeg, &mut quant), 2);
    assert_eq!(slimjpeg::estimate_quality(&quant[0], false), 80);
    assert_eq!(slimjpeg::estimate_quality(&quant[1], true), 80);

    // re-encode with the recovered matrices, slightly reduced
    let mut reparam = EncodeParam::new(80);
    reparam.set_quant_matrix(0, &quant[0], 80);
    reparam.set_quant_matrix(1, &quant[1], 80);
    let again = encode(&pixels, width, height, 3 * width, &reparam).unwrap();
    decode_ok(&again);
}

#[test]
fn min_quant_bounds_adaptive_search() {
    let width = 64;
    let height = 64;
    let pixels = create_textured_image(width, height);

    let mut param = EncodeParam::new(70);
    param.set_limit_quantization(true, 0);
    let jpeg = encode(&pixels, width, height, 3 * width, &param).unwrap();
    decode_ok(&jpeg);

    // with the limit at the current matrices, the analyzer may only raise
    let mut quant = [[0u8; 64]; 2];
    assert_eq!(slimjpeg::find_quantizers(&jpeg, &mut quant), 2);
    let floor = param.quant_matrices();
    for idx in 0..2 {
        for i in 0..64 {
            assert!(
                quant[idx][i] >= floor[idx][i],
                "matrix {} entry {}: {} < floor {}",
                idx,
                i,
                quant[idx][i],
                floor[idx][i]
            );
        }
    }
}

#[test]
fn dimensions_of_own_output() {
    let width = 40;
    let height = 24;
    let pixels = create_textured_image(width, height);
    let param = EncodeParam::new(75);
    let jpeg = encode(&pixels, width, height, 3 * width, &param).unwrap();
    let dim = slimjpeg::dimensions(&jpeg).unwrap();
    assert_eq!(dim.width, width);
    assert_eq!(dim.height, height);
}
