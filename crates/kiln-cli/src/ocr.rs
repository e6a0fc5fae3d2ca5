//! The fixed digit-recognition network.
//!
//! ```text
//! 28x28 RGB ─ gray_threshold ─ conv 1→32 k3 ─ relu ─ avg pool
//!           ─ conv 32→64 k3 ─ relu ─ max pool
//!           ─ dense 256x3136 ─ relu ─ dense 10x256 ─ argmax
//! ```

use std::path::Path;

use anyhow::{bail, Context};

use kiln_io::{weights::load_weights, RgbImage};
use kiln_kernels::{
    ComputeBackend, ConvShape, ElementwiseShape, ImageShape, KernelDispatcher, MatMulShape,
    PoolShape,
};

/// Input side length in pixels.
pub const INPUT_SIDE: usize = 28;
pub const CLASSES: usize = 10;

const KERNEL_SIZE: usize = 3;
const CONV1_OUT: usize = 32;
const CONV2_OUT: usize = 64;
const HIDDEN: usize = 256;
/// Flattened size after the second pool: 64 x 7 x 7.
const FLAT: usize = CONV2_OUT * (INPUT_SIDE / 4) * (INPUT_SIDE / 4);

pub const GRAY_THRESHOLD: &str = "kernel_gray_threshold";
pub const CONVOLUTION: &str = "kernel_convolution";
pub const RELU: &str = "kernel_relu";
pub const AVG_POOLING: &str = "kernel_avg_pooling";
pub const MAX_POOLING: &str = "kernel_max_pooling";
pub const MULTIPLY: &str = "kernel_multiply";

/// Network parameters, each flat and row-major.
#[derive(Debug, Clone, PartialEq)]
pub struct OcrWeights {
    /// 32 x 1 x 3 x 3
    pub conv1: Vec<f32>,
    /// 64 x 32 x 3 x 3
    pub conv2: Vec<f32>,
    /// 256 x 3136
    pub linear1: Vec<f32>,
    /// 10 x 256
    pub linear2: Vec<f32>,
}

impl OcrWeights {
    pub const SIZES: [usize; 4] = [
        CONV1_OUT * KERNEL_SIZE * KERNEL_SIZE,
        CONV2_OUT * CONV1_OUT * KERNEL_SIZE * KERNEL_SIZE,
        HIDDEN * FLAT,
        CLASSES * HIDDEN,
    ];

    /// Load the four weight files, checking each length.
    pub fn load(paths: &[impl AsRef<Path>; 4]) -> anyhow::Result<Self> {
        let [conv1, conv2, linear1, linear2] = paths;
        Ok(Self {
            conv1: load_weights(conv1, Self::SIZES[0])?,
            conv2: load_weights(conv2, Self::SIZES[1])?,
            linear1: load_weights(linear1, Self::SIZES[2])?,
            linear2: load_weights(linear2, Self::SIZES[3])?,
        })
    }

    /// Deterministic pseudo-random weights, for smoke runs without files.
    pub fn synthetic(seed: u64) -> Self {
        use rand::{Rng, SeedableRng};
        let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
        let mut layer = |n: usize, scale: f32| -> Vec<f32> {
            (0..n).map(|_| rng.gen_range(-scale..scale)).collect()
        };
        Self {
            conv1: layer(Self::SIZES[0], 0.5),
            conv2: layer(Self::SIZES[1], 0.1),
            linear1: layer(Self::SIZES[2], 0.02),
            linear2: layer(Self::SIZES[3], 0.1),
        }
    }
}

/// Ten class scores and the winning digit.
#[derive(Debug, Clone, PartialEq)]
pub struct Prediction {
    pub scores: Vec<f32>,
    pub digit: usize,
}

/// Index of the largest score; ties go to the lowest index.
pub fn argmax(scores: &[f32]) -> usize {
    let mut best = 0;
    for (i, &s) in scores.iter().enumerate().skip(1) {
        if s > scores[best] {
            best = i;
        }
    }
    best
}

/// The digit recognizer bound to one dispatcher.
pub struct OcrNetwork<B: ComputeBackend> {
    dispatcher: KernelDispatcher<B>,
    weights: OcrWeights,
}

impl<B: ComputeBackend> OcrNetwork<B> {
    pub fn new(dispatcher: KernelDispatcher<B>, weights: OcrWeights) -> Self {
        Self { dispatcher, weights }
    }

    pub fn dispatcher(&self) -> &KernelDispatcher<B> {
        &self.dispatcher
    }

    /// Release the device session.
    pub fn close(self) -> anyhow::Result<()> {
        self.dispatcher.close()?;
        Ok(())
    }

    /// Run the network on a 28x28 image.
    pub fn classify(&mut self, image: &RgbImage) -> anyhow::Result<Prediction> {
        if image.width != INPUT_SIDE || image.height != INPUT_SIDE {
            bail!(
                "expected a {}x{} image, got {}x{}",
                INPUT_SIDE,
                INPUT_SIDE,
                image.width,
                image.height
            );
        }
        let d = &mut self.dispatcher;
        let w = &self.weights;
        let side = INPUT_SIDE;
        let half = side / 2;

        let mut gray = vec![0.0f32; side * side];
        d.preprocess(GRAY_THRESHOLD, ImageShape { rows: side, cols: side }, &image.pixels, &mut gray)
            .context("preprocess")?;

        let conv1 = ConvShape {
            rows: side,
            cols: side,
            in_channels: 1,
            filter_size: KERNEL_SIZE,
            out_channels: CONV1_OUT,
        };
        let mut first = vec![0.0f32; conv1.output_len()];
        d.convolution(CONVOLUTION, conv1, &gray, &w.conv1, &mut first).context("conv1")?;
        d.elementwise(RELU, ElementwiseShape::flat(first.len()), &mut first).context("relu1")?;

        let pool1 = PoolShape { rows: side, cols: side, filter_size: 2, channels: CONV1_OUT };
        let mut second = vec![0.0f32; pool1.output_len()];
        d.pool(AVG_POOLING, pool1, &first, &mut second).context("avg pool")?;

        let conv2 = ConvShape {
            rows: half,
            cols: half,
            in_channels: CONV1_OUT,
            filter_size: KERNEL_SIZE,
            out_channels: CONV2_OUT,
        };
        let mut third = vec![0.0f32; conv2.output_len()];
        d.convolution(CONVOLUTION, conv2, &second, &w.conv2, &mut third).context("conv2")?;
        d.elementwise(RELU, ElementwiseShape::flat(third.len()), &mut third).context("relu2")?;

        let pool2 = PoolShape { rows: half, cols: half, filter_size: 2, channels: CONV2_OUT };
        let mut fourth = vec![0.0f32; pool2.output_len()];
        d.pool(MAX_POOLING, pool2, &third, &mut fourth).context("max pool")?;

        let dense1 = MatMulShape { left_rows: HIDDEN, left_cols: FLAT, right_rows: FLAT, right_cols: 1 };
        let mut fifth = vec![0.0f32; HIDDEN];
        d.dense_multiply(MULTIPLY, dense1, &w.linear1, &fourth, &mut fifth).context("dense1")?;
        d.elementwise(RELU, ElementwiseShape::flat(HIDDEN), &mut fifth).context("relu3")?;

        let dense2 = MatMulShape { left_rows: CLASSES, left_cols: HIDDEN, right_rows: HIDDEN, right_cols: 1 };
        let mut scores = vec![0.0f32; CLASSES];
        d.dense_multiply(MULTIPLY, dense2, &w.linear2, &fifth, &mut scores).context("dense2")?;

        let digit = argmax(&scores);
        tracing::info!("predicted digit {} (score {:.4})", digit, scores[digit]);
        Ok(Prediction { scores, digit })
    }
}
