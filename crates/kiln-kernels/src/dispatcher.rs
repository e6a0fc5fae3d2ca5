//! Kernel dispatcher: resolves kernels by name and runs typed launches.
//!
//! Every launch is synchronous. It allocates its own device buffers, stages
//! the inputs, binds arguments, runs the kernel to completion, reads the
//! result back and releases the buffers before returning, on success and on
//! every error path.

use std::time::{Duration, Instant};

use crate::backend::{ComputeBackend, KernelArg};
use crate::buffer::DeviceBuffer;
use crate::error::Result;
use crate::launch::{
    ArgSpec, ConvShape, Convolution, DenseMultiply, Elementwise, ElementwiseShape, ImageShape,
    Launch, LaunchKind, LaunchPlan, MatMulShape, Pool, PoolShape, Preprocess, Stage,
};
use crate::session::DeviceSession;
use crate::work::WorkSize;

/// Outcome of one successful launch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchReport {
    pub kernel: String,
    pub kind: LaunchKind,
    pub work: WorkSize,
    /// Bytes staged host → device.
    pub bytes_in: usize,
    /// Bytes read back device → host.
    pub bytes_out: usize,
    /// Wall time from enqueue through read-back.
    pub elapsed: Duration,
}

/// Running totals across launches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStats {
    pub launches: u64,
    pub failures: u64,
    /// Sum of `LaunchReport::elapsed` over successful launches.
    pub device_time: Duration,
}

/// Runs typed launches against one [`DeviceSession`].
pub struct KernelDispatcher<B: ComputeBackend> {
    session: DeviceSession<B>,
    stats: DispatchStats,
}

impl<B: ComputeBackend> KernelDispatcher<B> {
    pub fn new(session: DeviceSession<B>) -> Self {
        Self { session, stats: DispatchStats::default() }
    }

    pub fn session(&self) -> &DeviceSession<B> {
        &self.session
    }

    /// Tear down the underlying session.
    pub fn close(self) -> Result<()> {
        self.session.close()
    }

    pub fn stats(&self) -> DispatchStats {
        self.stats
    }

    /// Resolve a kernel handle, compiling it on first use.
    pub fn kernel(&mut self, name: &str) -> Result<&B::Kernel> {
        self.session.kernel(name)
    }

    /// Run one launch to completion.
    pub fn launch(&mut self, kernel: &str, op: Launch<'_>) -> Result<LaunchReport> {
        let kind = op.kind();
        match self.run(kernel, op) {
            Ok(report) => {
                self.stats.launches += 1;
                self.stats.device_time += report.elapsed;
                tracing::debug!(
                    "{} [{}] global={} local={} in {:.3}ms",
                    report.kernel,
                    report.kind,
                    report.work.global,
                    report.work.local,
                    report.elapsed.as_secs_f64() * 1000.0
                );
                Ok(report)
            }
            Err(e) => {
                self.stats.failures += 1;
                tracing::debug!("{} [{}] failed: {}", kernel, kind, e);
                Err(e)
            }
        }
    }

    fn run(&mut self, name: &str, op: Launch<'_>) -> Result<LaunchReport> {
        let plan = op.plan()?;
        let slot = self.session.resolve(name)?;
        let work = WorkSize::linear(plan.kind.as_str(), plan.elements, self.session.local_size())?;
        let kind = plan.kind;

        let backend = self.session.backend();
        let kernel = self.session.kernel_at(slot);
        let (bytes_in, bytes_out, elapsed) = execute(backend, kernel, work, plan)?;

        Ok(LaunchReport { kernel: name.to_string(), kind, work, bytes_in, bytes_out, elapsed })
    }

    // ------------------------------------------------------------------------
    // Per-shape entry points
    // ------------------------------------------------------------------------

    pub fn convolution(
        &mut self,
        kernel: &str,
        shape: ConvShape,
        input: &[f32],
        filter: &[f32],
        output: &mut [f32],
    ) -> Result<LaunchReport> {
        self.launch(kernel, Launch::Convolution(Convolution { shape, input, filter, output }))
    }

    pub fn dense_multiply(
        &mut self,
        kernel: &str,
        shape: MatMulShape,
        left: &[f32],
        right: &[f32],
        output: &mut [f32],
    ) -> Result<LaunchReport> {
        self.launch(kernel, Launch::DenseMultiply(DenseMultiply { shape, left, right, output }))
    }

    pub fn pool(
        &mut self,
        kernel: &str,
        shape: PoolShape,
        input: &[f32],
        output: &mut [f32],
    ) -> Result<LaunchReport> {
        self.launch(kernel, Launch::Pool(Pool { shape, input, output }))
    }

    /// Run `kernel` over `data` in place.
    pub fn elementwise(
        &mut self,
        kernel: &str,
        shape: ElementwiseShape,
        data: &mut [f32],
    ) -> Result<LaunchReport> {
        self.launch(kernel, Launch::Elementwise(Elementwise { shape, data }))
    }

    pub fn preprocess(
        &mut self,
        kernel: &str,
        shape: ImageShape,
        image: &[u8],
        output: &mut [f32],
    ) -> Result<LaunchReport> {
        self.launch(kernel, Launch::Preprocess(Preprocess { shape, image, output }))
    }
}

/// Allocate, stage, bind, run, read back, release.
fn execute<B: ComputeBackend>(
    backend: &B,
    kernel: &B::Kernel,
    work: WorkSize,
    plan: LaunchPlan<'_>,
) -> Result<(usize, usize, Duration)> {
    let LaunchPlan { buffers: specs, args, result, output, .. } = plan;

    let mut buffers = Vec::with_capacity(specs.len());
    for spec in &specs {
        buffers.push(DeviceBuffer::alloc(backend, spec.access, spec.nbytes)?);
    }

    let mut bytes_in = 0;
    for (buf, spec) in buffers.iter().zip(&specs) {
        match spec.stage {
            Stage::None => {}
            Stage::Host(data) => {
                buf.write(data)?;
                bytes_in += data.len();
            }
            Stage::Output => {
                buf.write(&*output)?;
                bytes_in += output.len();
            }
        }
    }

    for (index, arg) in args.iter().enumerate() {
        let value = match *arg {
            ArgSpec::Buffer(i) => KernelArg::Buffer(buffers[i].raw()),
            ArgSpec::Int(v) => KernelArg::Int(v),
        };
        backend.set_arg(kernel, index as u32, value)?;
    }

    let start = Instant::now();
    backend.enqueue(kernel, work)?;
    backend.finish()?;
    buffers[result].read_into(output)?;
    let elapsed = start.elapsed();
    let bytes_out = output.len();

    for buf in buffers {
        buf.release()?;
    }
    Ok((bytes_in, bytes_out, elapsed))
}
