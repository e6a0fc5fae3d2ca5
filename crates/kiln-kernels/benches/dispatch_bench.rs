//! Benchmark: per-launch dispatch overhead on the fake backend.
//!
//! The fake kernels do no work, so the timings are the cost of validation,
//! kernel lookup, buffer allocation, staging and release.

use std::time::Instant;

use kiln_kernels::fake::{FakeBackend, FakeDevice, FakeLaunch};
use kiln_kernels::{
    ConvShape, DeviceSession, ElementwiseShape, KernelDispatcher, MatMulShape, PoolShape,
};

fn noop(_: &mut FakeLaunch<'_>) {}

fn time_it<F: FnMut()>(iters: usize, mut f: F) -> f64 {
    let start = Instant::now();
    for _ in 0..iters {
        f();
    }
    start.elapsed().as_secs_f64() / iters as f64
}

fn main() {
    let device = FakeDevice::new()
        .kernel("conv", noop)
        .kernel("multiply", noop)
        .kernel("pool", noop)
        .kernel("relu", noop);
    let session = DeviceSession::<FakeBackend>::from_source(&device.source(), 64, &device)
        .expect("fake session");
    let mut d = KernelDispatcher::new(session);

    println!("=== Kiln Dispatch Overhead (fake backend) ===\n");
    println!("{:<28} {:>10} {:>14}", "Launch", "Iters", "Per launch (us)");
    println!("{}", "-".repeat(54));

    let report = |name: &str, iters: usize, secs: f64| {
        println!("{:<28} {:>10} {:>14.2}", name, iters, secs * 1e6);
    };

    for &n in &[256usize, 4096, 65536] {
        let mut data = vec![1.0f32; n];
        let iters = 2000;
        let s = time_it(iters, || {
            d.elementwise("relu", ElementwiseShape::flat(n), &mut data).unwrap();
        });
        report(&format!("elementwise {}", n), iters, s);
    }

    for &n in &[16usize, 64, 256] {
        let shape = MatMulShape { left_rows: n, left_cols: n, right_rows: n, right_cols: n };
        let a = vec![0.5f32; n * n];
        let b = vec![0.25f32; n * n];
        let mut out = vec![0.0f32; n * n];
        let iters = if n <= 64 { 2000 } else { 200 };
        let s = time_it(iters, || {
            d.dense_multiply("multiply", shape, &a, &b, &mut out).unwrap();
        });
        report(&format!("dense_multiply {}x{}", n, n), iters, s);
    }

    {
        let shape = ConvShape { rows: 28, cols: 28, in_channels: 1, filter_size: 3, out_channels: 32 };
        let input = vec![0.0f32; shape.input_len()];
        let filter = vec![0.0f32; shape.filter_len()];
        let mut out = vec![0.0f32; shape.output_len()];
        let iters = 1000;
        let s = time_it(iters, || {
            d.convolution("conv", shape, &input, &filter, &mut out).unwrap();
        });
        report("convolution 1x28x28 -> 32", iters, s);

        let pool = PoolShape { rows: 28, cols: 28, filter_size: 2, channels: 32 };
        let mut pooled = vec![0.0f32; pool.output_len()];
        let s = time_it(iters, || {
            d.pool("pool", pool, &out, &mut pooled).unwrap();
        });
        report("pool 32x28x28", iters, s);
    }

    let stats = d.stats();
    println!(
        "\n{} launches, {} failures, {:.3}ms total launch time",
        stats.launches,
        stats.failures,
        stats.device_time.as_secs_f64() * 1000.0
    );
    println!("live buffers after run: {}", device.ledger().live_buffers());
}
