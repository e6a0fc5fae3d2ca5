//! End-to-end network runs on the fake backend with host reference kernels.

use std::io::Write;

use kiln_cli::ocr::{self, INPUT_SIDE};
use kiln_cli::{argmax, open_dispatcher, OcrConfig, OcrNetwork, OcrWeights, OCR_KERNELS};
use kiln_io::RgbImage;
use kiln_kernels::fake::{declared_kernels, reference, FakeBackend, FakeDevice};

fn assert_close(a: &[f32], b: &[f32], tol: f32) {
    assert_eq!(a.len(), b.len(), "length mismatch: {} vs {}", a.len(), b.len());
    for (i, (x, y)) in a.iter().zip(b.iter()).enumerate() {
        assert!(
            (x - y).abs() < tol,
            "element {} differs: {} vs {} (tol={})",
            i, x, y, tol
        );
    }
}

/// A dark vertical stroke on a white background.
fn digit_one() -> RgbImage {
    let mut img = RgbImage::new(INPUT_SIDE, INPUT_SIDE);
    img.pixels.fill(255);
    for y in 4..24 {
        for x in 13..16 {
            img.set_pixel(x, y, [20, 20, 20]);
        }
    }
    img
}

/// The same network computed directly with the reference functions.
fn host_scores(image: &RgbImage, w: &OcrWeights) -> Vec<f32> {
    let s = INPUT_SIDE;
    let gray = reference::gray_threshold(&image.pixels, s, s);
    let mut x = reference::convolution(&gray, s, s, 1, &w.conv1, 3, 32);
    reference::relu(&mut x);
    let x = reference::avg_pooling(&x, s, s, 2, 32);
    let mut x = reference::convolution(&x, s / 2, s / 2, 32, &w.conv2, 3, 64);
    reference::relu(&mut x);
    let x = reference::max_pooling(&x, s / 2, s / 2, 2, 64);
    let mut x = reference::multiply(&w.linear1, 256, 3136, &x, 1);
    reference::relu(&mut x);
    reference::multiply(&w.linear2, 10, 256, &x, 1)
}

#[test]
fn test_builtin_kernels_declare_all_six() {
    let names = declared_kernels(OCR_KERNELS);
    for kernel in [
        ocr::GRAY_THRESHOLD,
        ocr::CONVOLUTION,
        ocr::RELU,
        ocr::AVG_POOLING,
        ocr::MAX_POOLING,
        ocr::MULTIPLY,
    ] {
        assert!(names.iter().any(|n| n == kernel), "{} missing", kernel);
    }
    assert_eq!(names.len(), 6);
}

#[test]
fn test_network_matches_host_pipeline() {
    let device = FakeDevice::new().with_reference_kernels();
    let config = OcrConfig::default();
    let dispatcher = open_dispatcher::<FakeBackend>(&config, &device).unwrap();

    let weights = OcrWeights::synthetic(42);
    let image = digit_one();
    let expected = host_scores(&image, &weights);

    let mut network = OcrNetwork::new(dispatcher, weights);
    let prediction = network.classify(&image).unwrap();

    assert_close(&prediction.scores, &expected, 1e-3);
    assert_eq!(prediction.digit, argmax(&expected));
    assert_eq!(network.dispatcher().stats().launches, 10);
    network.close().unwrap();

    let ledger = device.ledger();
    assert_eq!(ledger.kernels_created(), 6);
    assert_eq!(ledger.live_buffers(), 0);
}

#[test]
fn test_repeated_classification_reuses_kernels() {
    let device = FakeDevice::new().with_reference_kernels();
    let dispatcher = open_dispatcher::<FakeBackend>(&OcrConfig::default(), &device).unwrap();
    let mut network = OcrNetwork::new(dispatcher, OcrWeights::synthetic(1));

    let image = digit_one();
    let first = network.classify(&image).unwrap();
    let second = network.classify(&image).unwrap();
    assert_eq!(first, second);

    let ledger = device.ledger();
    assert_eq!(ledger.kernels_created(), 6);
    assert_eq!(ledger.allocation_count(), ledger.buffer_releases());
}

#[test]
fn test_wrong_image_size_rejected() {
    let device = FakeDevice::new().with_reference_kernels();
    let dispatcher = open_dispatcher::<FakeBackend>(&OcrConfig::default(), &device).unwrap();
    let mut network = OcrNetwork::new(dispatcher, OcrWeights::synthetic(1));

    let err = network.classify(&RgbImage::new(32, 28)).unwrap_err();
    assert!(err.to_string().contains("28x28"));
    assert_eq!(device.ledger().launches(), 0);
}

#[test]
fn test_kernel_file_from_config() {
    let dir = tempfile::tempdir().unwrap();
    let kernels = dir.path().join("ocr.cl");
    std::fs::write(&kernels, OCR_KERNELS).unwrap();

    let config_path = dir.path().join("config.json");
    let mut f = std::fs::File::create(&config_path).unwrap();
    write!(
        f,
        r#"{{ "kernel_source": {:?}, "local_size": 32, "device_type": "cpu" }}"#,
        kernels.to_str().unwrap()
    )
    .unwrap();

    let config = OcrConfig::load(&config_path).unwrap();
    assert_eq!(config.local_size, 32);

    let device = FakeDevice::new().with_reference_kernels();
    let d = open_dispatcher::<FakeBackend>(&config, &device).unwrap();
    assert_eq!(d.session().local_size(), 32);
}

#[test]
fn test_missing_kernel_file_reports_path() {
    let config = OcrConfig {
        kernel_source: Some("/nonexistent/ocr.cl".into()),
        ..OcrConfig::default()
    };
    let device = FakeDevice::new();
    let err = open_dispatcher::<FakeBackend>(&config, &device).err().unwrap();
    assert!(format!("{:#}", err).contains("ocr.cl"));
}

#[test]
fn test_weights_load_checks_sizes() {
    let dir = tempfile::tempdir().unwrap();
    let config = OcrConfig { weights_dir: dir.path().to_path_buf(), ..OcrConfig::default() };
    let paths = config.weight_paths();
    for (path, &len) in paths.iter().zip(OcrWeights::SIZES.iter()) {
        let text: Vec<String> = (0..len).map(|i| format!("{}", (i % 10) as f32 * 0.01)).collect();
        std::fs::write(path, text.join(" ")).unwrap();
    }
    let weights = OcrWeights::load(&paths).unwrap();
    assert_eq!(weights.conv1.len(), 288);
    assert_eq!(weights.linear2.len(), 2560);
    assert_eq!(weights.linear2[3], 3.0f32 * 0.01);

    std::fs::write(&paths[1], "1 2 3").unwrap();
    let err = OcrWeights::load(&paths).unwrap_err();
    assert!(err.to_string().contains("expected 18432"));
}
