//! End-to-end encoding tests, verified with an independent decoder.

use slimjpeg::{encode, encode_with_method, EncodeParam, YuvMode};

/// Create a uniform color test image
fn create_uniform_image(width: usize, height: usize, r: u8, g: u8, b: u8) -> Vec<u8> {
    let mut pixels = Vec::with_capacity(width * height * 3);
    for _ in 0..(width * height) {
        pixels.push(r);
        pixels.push(g);
        pixels.push(b);
    }
    pixels
}

/// Create a simple gradient test image
fn create_gradient_image(width: usize, height: usize) -> Vec<u8> {
    let mut pixels = Vec::with_capacity(width * height * 3);
    for y in 0..height {
        for x in 0..width {
            pixels.push((x * 255 / width) as u8);
            pixels.push((y * 255 / height) as u8);
            pixels.push(((x + y) * 255 / (width + height)) as u8);
        }
    }
    pixels
}

/// Deterministic noisy test image (stresses the entropy coder)
fn create_noise_image(width: usize, height: usize) -> Vec<u8> {
    let mut pixels = Vec::with_capacity(width * height * 3);
    let mut state = 0x2468aceu32;
    for _ in 0..width * height * 3 {
        state = state.wrapping_mul(1664525).wrapping_add(1013904223);
        pixels.push((state >> 24) as u8);
    }
    pixels
}

/// Top-level marker codes before the scan data, plus the final marker.
fn marker_sequence(jpeg: &[u8]) -> Vec<u8> {
    assert_eq!(&jpeg[..2], &[0xff, 0xd8], "missing SOI");
    let mut markers = vec![0xd8];
    let mut pos = 2usize;
    loop {
        assert_eq!(jpeg[pos], 0xff, "expected marker at {}", pos);
        let m = jpeg[pos + 1];
        markers.push(m);
        if m == 0xda {
            break; // entropy data follows
        }
        let len = u16::from_be_bytes([jpeg[pos + 2], jpeg[pos + 3]]) as usize;
        pos += 2 + len;
    }
    assert_eq!(&jpeg[jpeg.len() - 2..], &[0xff, 0xd9], "missing EOI");
    markers.push(0xd9);
    markers
}

/// Verify the stuffing rule over the entropy-coded segment.
fn assert_stuffing(jpeg: &[u8]) {
    // find the SOS payload start
    let mut pos = 2usize;
    loop {
        let m = jpeg[pos + 1];
        let len = u16::from_be_bytes([jpeg[pos + 2], jpeg[pos + 3]]) as usize;
        pos += 2 + len;
        if m == 0xda {
            break;
        }
    }
    let end = jpeg.len() - 2; // EOI
    while pos < end {
        if jpeg[pos] == 0xff {
            assert_eq!(jpeg[pos + 1], 0x00, "unstuffed 0xFF at offset {}", pos);
            pos += 1;
        }
        pos += 1;
    }
}

fn decode(jpeg: &[u8]) -> (Vec<u8>, jpeg_decoder::ImageInfo) {
    let mut decoder = jpeg_decoder::Decoder::new(jpeg);
    let pixels = decoder.decode().expect("decode failed");
    let info = decoder.info().expect("no image info");
    (pixels, info)
}

#[test]
fn solid_gray_roundtrip_method0() {
    let width = 16;
    let height = 16;
    let pixels = create_uniform_image(width, height, 128, 128, 128);

    let mut param = EncodeParam::new(75);
    param.yuv_mode = YuvMode::Yuv420;
    let jpeg = encode_with_method(&pixels, width, height, 3 * width, &param, 0).unwrap();

    let markers = marker_sequence(&jpeg);
    // SOI, APP0, DQT, SOF0, 4x DHT, SOS ... EOI
    assert_eq!(
        markers,
        vec![0xd8, 0xe0, 0xdb, 0xc0, 0xc4, 0xc4, 0xc4, 0xc4, 0xda, 0xd9]
    );
    assert_stuffing(&jpeg);

    let (decoded, info) = decode(&jpeg);
    assert_eq!(info.width as usize, width);
    assert_eq!(info.height as usize, height);
    let avg_luma: f64 = decoded
        .chunks_exact(3)
        .map(|p| 0.299 * p[0] as f64 + 0.587 * p[1] as f64 + 0.114 * p[2] as f64)
        .sum::<f64>()
        / (width * height) as f64;
    assert!(
        (126.0..=130.0).contains(&avg_luma),
        "avg luma {}",
        avg_luma
    );
}

#[test]
fn solid_gray_is_tiny_with_optimized_tables() {
    let width = 16;
    let height = 16;
    let pixels = create_uniform_image(width, height, 128, 128, 128);

    let mut param = EncodeParam::new(75);
    param.yuv_mode = YuvMode::Yuv420;
    let jpeg = encode_with_method(&pixels, width, height, 3 * width, &param, 4).unwrap();
    assert!(jpeg.len() < 400, "flat 16x16 took {} bytes", jpeg.len());

    let (decoded, _) = decode(&jpeg);
    let avg: f64 =
        decoded.iter().map(|&v| v as f64).sum::<f64>() / decoded.len() as f64;
    assert!((126.0..=130.0).contains(&avg), "avg {}", avg);
}

#[test]
fn red_stripes_adaptive_quantization() {
    // vertical red/black stripes with a 2-pixel period
    let width = 32;
    let height = 32;
    let mut pixels = Vec::with_capacity(width * height * 3);
    for _y in 0..height {
        for x in 0..width {
            if x % 2 == 0 {
                pixels.extend_from_slice(&[255, 0, 0]);
            } else {
                pixels.extend_from_slice(&[0, 0, 0]);
            }
        }
    }

    let mut param = EncodeParam::new(90);
    param.yuv_mode = YuvMode::Yuv444; // keep the chroma stripes intact
    let jpeg = encode_with_method(&pixels, width, height, 3 * width, &param, 4).unwrap();
    assert_stuffing(&jpeg);

    let (decoded, _) = decode(&jpeg);
    let mut red_cols = 0.0f64;
    let mut black_cols = 0.0f64;
    for y in 0..height {
        for x in 0..width {
            let r = decoded[(y * width + x) * 3] as f64;
            if x % 2 == 0 {
                red_cols += r;
            } else {
                black_cols += r;
            }
        }
    }
    red_cols /= (width * height) as f64 / 2.0;
    black_cols /= (width * height) as f64 / 2.0;
    assert!(red_cols > 128.0, "red columns average {}", red_cols);
    assert!(black_cols < 32.0, "black columns average {}", black_cols);

    // the emitted luma matrix is the analyzer's output: every delta stays
    // within the search range and the protected low-frequency corner is
    // untouched
    let mut quant = [[0u8; 64]; 2];
    assert_eq!(slimjpeg::find_quantizers(&jpeg, &mut quant), 2);
    let default_m = slimjpeg::quant_matrix_for_quality(90, false);
    for i in 0..64 {
        let d = quant[0][i] as i32 - default_m[i] as i32;
        assert!((-12..=12).contains(&d), "entry {} moved by {}", i, d);
    }
    for i in [0usize, 1, 8] {
        assert_eq!(quant[0][i], default_m[i], "protected entry {} moved", i);
    }
}

#[test]
fn gradient_roundtrip_all_methods() {
    let width = 48;
    let height = 32;
    let pixels = create_gradient_image(width, height);
    let mut sizes = Vec::new();
    for method in 0..=8 {
        let param = EncodeParam::new(80);
        let jpeg =
            encode_with_method(&pixels, width, height, 3 * width, &param, method).unwrap();
        assert_stuffing(&jpeg);
        let (decoded, info) = decode(&jpeg);
        assert_eq!(info.width as usize, width, "method {}", method);
        assert_eq!(info.height as usize, height, "method {}", method);
        assert_eq!(decoded.len(), width * height * 3, "method {}", method);
        sizes.push(jpeg.len());
    }
    // Huffman optimization must not lose to the standard tables
    assert!(sizes[2] <= sizes[0], "method 2 {} > method 0 {}", sizes[2], sizes[0]);
}

#[test]
fn noisy_image_respects_stuffing() {
    let width = 64;
    let height = 64;
    let pixels = create_noise_image(width, height);
    let param = EncodeParam::new(95);
    let jpeg = encode_with_method(&pixels, width, height, 3 * width, &param, 2).unwrap();
    assert_stuffing(&jpeg);
    let (_, info) = decode(&jpeg);
    assert_eq!(info.width as usize, width);
}

#[test]
fn grayscale_single_component() {
    let width = 24;
    let height = 24;
    let pixels = create_gradient_image(width, height);

    let mut param = EncodeParam::new(75);
    param.yuv_mode = YuvMode::Gray400;
    let jpeg = encode(&pixels, width, height, 3 * width, &param).unwrap();

    let markers = marker_sequence(&jpeg);
    let dht_count = markers.iter().filter(|&&m| m == 0xc4).count();
    assert_eq!(dht_count, 2, "grayscale needs exactly one DC + one AC table");

    let (decoded, info) = decode(&jpeg);
    assert_eq!(info.width as usize, width);
    assert_eq!(info.height as usize, height);
    assert_eq!(
        info.pixel_format,
        jpeg_decoder::PixelFormat::L8,
        "expected a single-component scan"
    );
    assert_eq!(decoded.len(), width * height);

    // one quantization matrix only
    let mut quant = [[0u8; 64]; 2];
    assert_eq!(slimjpeg::find_quantizers(&jpeg, &mut quant), 1);
}

#[test]
fn odd_dimensions_replicate_cleanly() {
    for (w, h) in [(17, 9), (1, 1), (8, 8), (33, 31), (15, 16)] {
        let pixels = create_gradient_image(w, h);
        for mode in [YuvMode::Yuv420, YuvMode::Yuv444, YuvMode::SharpYuv420] {
            let mut param = EncodeParam::new(85);
            param.yuv_mode = mode;
            let jpeg = encode(&pixels, w, h, 3 * w, &param).unwrap();
            let (decoded, info) = decode(&jpeg);
            assert_eq!(info.width as usize, w, "{:?} {}x{}", mode, w, h);
            assert_eq!(info.height as usize, h, "{:?} {}x{}", mode, w, h);
            assert_eq!(decoded.len(), w * h * 3);
        }
    }
}

#[test]
fn trellis_shrinks_or_matches_plain_quantization() {
    let width = 64;
    let height = 64;
    let pixels = create_noise_image(width, height);
    let param = EncodeParam::new(60);
    let plain = encode_with_method(&pixels, width, height, 3 * width, &param, 4).unwrap();
    let trellis = encode_with_method(&pixels, width, height, 3 * width, &param, 7).unwrap();
    assert!(
        trellis.len() <= plain.len() + plain.len() / 50,
        "trellis {} vs plain {}",
        trellis.len(),
        plain.len()
    );
    decode(&trellis);
}

#[test]
fn metadata_markers_are_embedded() {
    let width = 16;
    let height = 16;
    let pixels = create_uniform_image(width, height, 100, 150, 200);

    let mut param = EncodeParam::new(75);
    param.exif.extend_from_slice(b"II*\0stub-exif-payload");
    param.iccp = vec![0xAB; 100_000]; // forces two ICC chunks
    param.xmp.extend_from_slice(b"<x:xmpmeta>compact</x:xmpmeta>");
    let jpeg = encode(&pixels, width, height, 3 * width, &param).unwrap();

    let markers = marker_sequence(&jpeg);
    assert_eq!(markers[1], 0xe0, "APP0 first");
    let app1 = markers.iter().filter(|&&m| m == 0xe1).count();
    let app2 = markers.iter().filter(|&&m| m == 0xe2).count();
    assert_eq!(app1, 2, "EXIF + XMP");
    assert_eq!(app2, 2, "ICC profile split into two chunks");

    // prefixes land verbatim in the stream
    let find = |needle: &[u8]| jpeg.windows(needle.len()).any(|w| w == needle);
    assert!(find(b"Exif\0\0"));
    assert!(find(b"ICC_PROFILE\0"));
    assert!(find(b"http://ns.adobe.com/xap/1.0/\0"));

    decode(&jpeg);
}

#[test]
fn oversize_exif_is_rejected() {
    let width = 8;
    let height = 8;
    let pixels = create_uniform_image(width, height, 0, 0, 0);
    let mut param = EncodeParam::new(75);
    param.exif = vec![0; 70_000];
    let err = encode(&pixels, width, height, 3 * width, &param);
    assert!(err.is_err(), "oversize EXIF must fail, not truncate");
}

#[test]
fn extended_xmp_splits_with_guid() {
    let width = 8;
    let height = 8;
    let pixels = create_uniform_image(width, height, 10, 20, 30);

    let mut param = EncodeParam::new(75);
    // oversize XMP with the mandatory extension placeholder
    let mut xmp = Vec::new();
    xmp.extend_from_slice(b"<x:xmpmeta xmpNote:HasExtendedXMP=\"");
    xmp.extend_from_slice(&[b'0'; 32]);
    xmp.extend_from_slice(b"\">");
    xmp.resize(90_000, b' ');
    param.xmp = xmp;
    let jpeg = encode(&pixels, width, height, 3 * width, &param).unwrap();

    let markers = marker_sequence(&jpeg);
    let app1 = markers.iter().filter(|&&m| m == 0xe1).count();
    assert_eq!(app1, 2, "main XMP + one extension chunk");
    let find = |needle: &[u8]| jpeg.windows(needle.len()).any(|w| w == needle);
    assert!(find(b"http://ns.adobe.com/xmp/extension/\0"));
    // the placeholder GUID must have been overwritten
    assert!(!find(&[b'0'; 32]));
}

#[test]
fn missing_xmp_extension_tag_fails() {
    let width = 8;
    let height = 8;
    let pixels = create_uniform_image(width, height, 10, 20, 30);
    let mut param = EncodeParam::new(75);
    param.xmp = vec![b'x'; 90_000]; // oversize, no HasExtendedXMP tag
    assert!(encode(&pixels, width, height, 3 * width, &param).is_err());
}
