//! Host reference versions of the OCR network kernels.
//!
//! Each function computes what the matching kernel in `kernels/ocr.cl`
//! computes over its whole range. [`FakeDevice::with_reference_kernels`]
//! registers them under the kernel names, reading arguments in the same slot
//! order the dispatcher binds them.

use super::{FakeDevice, FakeLaunch};

pub const GRAY_THRESHOLD: &str = "kernel_gray_threshold";
pub const CONVOLUTION: &str = "kernel_convolution";
pub const RELU: &str = "kernel_relu";
pub const AVG_POOLING: &str = "kernel_avg_pooling";
pub const MAX_POOLING: &str = "kernel_max_pooling";
pub const MULTIPLY: &str = "kernel_multiply";

/// Interleaved RGB → 1.0 for dark (ink) pixels, 0.0 otherwise.
pub fn gray_threshold(image: &[u8], rows: usize, cols: usize) -> Vec<f32> {
    (0..rows * cols)
        .map(|i| {
            let px = &image[3 * i..3 * i + 3];
            let sum = px[0] as u32 + px[1] as u32 + px[2] as u32;
            if sum < 3 * 128 {
                1.0
            } else {
                0.0
            }
        })
        .collect()
}

/// Same-size convolution with zero padding, filter centred on each pixel.
pub fn convolution(
    input: &[f32],
    rows: usize,
    cols: usize,
    in_channels: usize,
    filter: &[f32],
    k: usize,
    out_channels: usize,
) -> Vec<f32> {
    let half = (k / 2) as isize;
    let mut out = vec![0.0f32; out_channels * rows * cols];
    for oc in 0..out_channels {
        for r in 0..rows {
            for c in 0..cols {
                let mut acc = 0.0f32;
                for ic in 0..in_channels {
                    for kr in 0..k {
                        for kc in 0..k {
                            let y = r as isize + kr as isize - half;
                            let x = c as isize + kc as isize - half;
                            if y < 0 || x < 0 || y >= rows as isize || x >= cols as isize {
                                continue;
                            }
                            let v = input[(ic * rows + y as usize) * cols + x as usize];
                            let w = filter[((oc * in_channels + ic) * k + kr) * k + kc];
                            acc += v * w;
                        }
                    }
                }
                out[(oc * rows + r) * cols + c] = acc;
            }
        }
    }
    out
}

pub fn relu(data: &mut [f32]) {
    for v in data {
        *v = v.max(0.0);
    }
}

fn pool(input: &[f32], rows: usize, cols: usize, k: usize, channels: usize, max: bool) -> Vec<f32> {
    let (out_rows, out_cols) = (rows / 2, cols / 2);
    let mut out = vec![0.0f32; channels * out_rows * out_cols];
    for ch in 0..channels {
        for orow in 0..out_rows {
            for ocol in 0..out_cols {
                let mut acc = if max { f32::NEG_INFINITY } else { 0.0 };
                let mut n = 0usize;
                for dr in 0..k {
                    for dc in 0..k {
                        let (y, x) = (orow * 2 + dr, ocol * 2 + dc);
                        if y >= rows || x >= cols {
                            continue;
                        }
                        let v = input[(ch * rows + y) * cols + x];
                        acc = if max { acc.max(v) } else { acc + v };
                        n += 1;
                    }
                }
                if !max && n > 0 {
                    acc /= n as f32;
                }
                out[(ch * out_rows + orow) * out_cols + ocol] = acc;
            }
        }
    }
    out
}

/// Stride-2 average pooling over a `k × k` window.
pub fn avg_pooling(input: &[f32], rows: usize, cols: usize, k: usize, channels: usize) -> Vec<f32> {
    pool(input, rows, cols, k, channels, false)
}

/// Stride-2 max pooling over a `k × k` window.
pub fn max_pooling(input: &[f32], rows: usize, cols: usize, k: usize, channels: usize) -> Vec<f32> {
    pool(input, rows, cols, k, channels, true)
}

/// Row-major `(r1 × c1) · (r2 × c2)`.
pub fn multiply(left: &[f32], r1: usize, c1: usize, right: &[f32], c2: usize) -> Vec<f32> {
    let mut out = vec![0.0f32; r1 * c2];
    for i in 0..r1 {
        for j in 0..c2 {
            out[i * c2 + j] = (0..c1).map(|p| left[i * c1 + p] * right[p * c2 + j]).sum();
        }
    }
    out
}

impl FakeDevice {
    /// Register all six OCR kernels.
    pub fn with_reference_kernels(self) -> Self {
        self.kernel(GRAY_THRESHOLD, |l: &mut FakeLaunch<'_>| {
            let (rows, cols) = (l.int(1), l.int(2));
            let out = gray_threshold(l.bytes(0), rows, cols);
            l.write_f32(3, &out);
        })
        .kernel(CONVOLUTION, |l: &mut FakeLaunch<'_>| {
            let input = l.read_f32(0);
            let filter = l.read_f32(4);
            let out = convolution(&input, l.int(1), l.int(2), l.int(3), &filter, l.int(5), l.int(6));
            l.write_f32(7, &out);
        })
        .kernel(RELU, |l: &mut FakeLaunch<'_>| {
            let len = l.int(1) * l.int(2);
            let mut data = l.read_f32(0);
            relu(&mut data[..len]);
            l.write_f32(0, &data);
        })
        .kernel(AVG_POOLING, |l: &mut FakeLaunch<'_>| {
            let input = l.read_f32(0);
            let out = avg_pooling(&input, l.int(1), l.int(2), l.int(3), l.int(4));
            l.write_f32(5, &out);
        })
        .kernel(MAX_POOLING, |l: &mut FakeLaunch<'_>| {
            let input = l.read_f32(0);
            let out = max_pooling(&input, l.int(1), l.int(2), l.int(3), l.int(4));
            l.write_f32(5, &out);
        })
        .kernel(MULTIPLY, |l: &mut FakeLaunch<'_>| {
            let left = l.read_f32(0);
            let right = l.read_f32(3);
            let out = multiply(&left, l.int(1), l.int(2), &right, l.int(5));
            l.write_f32(6, &out);
        })
    }
}
