//! OpenCL integration tests. Each test returns early when no device is found.
//! Run with: cargo test -p kiln-kernels --features opencl-tests -- --nocapture

#![cfg(feature = "opencl-tests")]

use kiln_kernels::opencl::{is_opencl_available, probe};
use kiln_kernels::{
    DeviceType, DispatchError, ElementwiseShape, ErrorKind, MatMulShape, OpenClConfig,
    OpenClDispatcher, OpenClSession, PoolShape,
};

const SOURCE: &str = r#"
__kernel void kernel_relu(__global float* m, int rows, int cols) {
    int i = get_global_id(0);
    if (i < rows * cols) {
        m[i] = fmax(m[i], 0.0f);
    }
}

__kernel void kernel_multiply(__global const float* a, int r1, int c1,
                              __global const float* b, int r2, int c2,
                              __global float* out) {
    int gid = get_global_id(0);
    if (gid >= r1 * c2) return;
    int i = gid / c2;
    int j = gid % c2;
    float acc = 0.0f;
    for (int p = 0; p < c1; p++) {
        acc += a[i * c1 + p] * b[p * c2 + j];
    }
    out[gid] = acc;
}

__kernel void kernel_max_pooling(__global const float* in, int rows, int cols, int k,
                                 int channels, __global float* out) {
    int gid = get_global_id(0);
    if (gid >= channels * rows * cols) return;
    int ch = gid / (rows * cols);
    int r = (gid / cols) % rows;
    int c = gid % cols;
    if (r % 2 != 0 || c % 2 != 0) return;
    float best = -INFINITY;
    for (int dr = 0; dr < k; dr++) {
        for (int dc = 0; dc < k; dc++) {
            if (r + dr < rows && c + dc < cols) {
                best = fmax(best, in[(ch * rows + r + dr) * cols + c + dc]);
            }
        }
    }
    out[(ch * (rows / 2) + r / 2) * (cols / 2) + c / 2] = best;
}
"#;

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

fn open(local: usize) -> Option<OpenClDispatcher> {
    if !is_opencl_available() {
        eprintln!("no OpenCL platform, skipping");
        return None;
    }
    let config = OpenClConfig { device_type: DeviceType::All };
    match OpenClSession::from_source(SOURCE, local, &config) {
        Ok(session) => Some(OpenClDispatcher::new(session)),
        Err(DispatchError::NoDevice { .. }) => {
            eprintln!("no OpenCL device, skipping");
            None
        }
        Err(e) => panic!("failed to open session: {}", e),
    }
}

#[test]
fn test_probe_lists_devices() {
    if !is_opencl_available() {
        return;
    }
    let platforms = probe().unwrap();
    assert!(!platforms.is_empty());
    for p in &platforms {
        println!("{} ({})", p.name, p.version);
        for d in &p.devices {
            println!("  {} wg={} mem={}", d.name, d.max_work_group_size, d.global_mem_bytes);
        }
    }
}

#[test]
fn test_relu_in_place() {
    let Some(mut d) = open(16) else { return };
    let mut data: Vec<f32> = (0..37).map(|i| i as f32 - 18.0).collect();
    let expected: Vec<f32> = data.iter().map(|v| v.max(0.0)).collect();
    d.elementwise("kernel_relu", ElementwiseShape::flat(37), &mut data).unwrap();
    assert_close(&data, &expected, 1e-6);
    d.close().unwrap();
}

#[test]
fn test_dense_multiply() {
    let Some(mut d) = open(16) else { return };
    let shape = MatMulShape { left_rows: 2, left_cols: 3, right_rows: 3, right_cols: 2 };
    let mut out = [0.0; 4];
    d.dense_multiply(
        "kernel_multiply",
        shape,
        &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0],
        &[7.0, 8.0, 9.0, 10.0, 11.0, 12.0],
        &mut out,
    )
    .unwrap();
    assert_close(&out, &[58.0, 64.0, 139.0, 154.0], 1e-4);
}

#[test]
fn test_max_pooling() {
    let Some(mut d) = open(16) else { return };
    let input: Vec<f32> = (0..32).map(|i| i as f32).collect();
    let mut out = [0.0; 8];
    d.pool(
        "kernel_max_pooling",
        PoolShape { rows: 4, cols: 4, filter_size: 2, channels: 2 },
        &input,
        &mut out,
    )
    .unwrap();
    assert_close(&out, &[5.0, 7.0, 13.0, 15.0, 21.0, 23.0, 29.0, 31.0], 1e-6);
}

#[test]
fn test_unknown_kernel_name() {
    let Some(mut d) = open(16) else { return };
    let err = d.kernel("kernel_gelu").err().unwrap();
    assert_eq!(err.kind(), ErrorKind::Configuration);
}

#[test]
fn test_build_failure_reports_log() {
    if !is_opencl_available() {
        return;
    }
    let config = OpenClConfig { device_type: DeviceType::All };
    match OpenClSession::from_source("__kernel void broken( {", 16, &config) {
        Err(DispatchError::Build { log }) => assert!(!log.is_empty()),
        Err(DispatchError::NoDevice { .. }) => {}
        Err(e) => panic!("unexpected error {}", e),
        Ok(_) => panic!("broken source compiled"),
    }
}
