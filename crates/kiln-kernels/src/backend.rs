//! The device API seam.
//!
//! [`ComputeBackend`] is the narrow set of calls the session and dispatcher
//! need from a compute runtime. The OpenCL implementation lives in
//! [`crate::opencl`]; [`crate::fake`] implements it in host memory.

use crate::error::Result;
use crate::work::WorkSize;

/// Direction of a device buffer, from the kernel's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemAccess {
    ReadOnly,
    WriteOnly,
    ReadWrite,
}

/// A value bound to one kernel argument slot.
#[derive(Debug)]
pub enum KernelArg<'a, B> {
    Buffer(&'a B),
    Int(i32),
}

// Manual impls: `B` itself need not be Copy.
impl<B> Clone for KernelArg<'_, B> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<B> Copy for KernelArg<'_, B> {}

/// A compute runtime with one device, one context, one in-order queue and one
/// compiled program.
///
/// All device calls are blocking. Handle types are owned and not `Clone`, so
/// each kernel and buffer is released at most once.
pub trait ComputeBackend {
    /// Backend-specific device selection options.
    type Config;
    /// Compiled kernel handle.
    type Kernel;
    /// Device memory handle.
    type Buffer;

    /// Select a platform and device, create a context and queue, and build
    /// `source` as a single program with no options.
    ///
    /// Must not leak any handle it created when it fails partway through.
    fn open(config: &Self::Config, source: &str) -> Result<Self>
    where
        Self: Sized;

    /// Human-readable device name for logs.
    fn device_name(&self) -> String;

    /// Extract a kernel from the compiled program.
    fn create_kernel(&self, name: &str) -> Result<Self::Kernel>;

    fn create_buffer(&self, access: MemAccess, nbytes: usize) -> Result<Self::Buffer>;

    /// Blocking host → device copy of `data` to the start of `buffer`.
    fn write_buffer(&self, buffer: &Self::Buffer, data: &[u8]) -> Result<()>;

    /// Blocking device → host copy of `out.len()` bytes from the start of `buffer`.
    fn read_buffer(&self, buffer: &Self::Buffer, out: &mut [u8]) -> Result<()>;

    fn set_arg(&self, kernel: &Self::Kernel, index: u32, arg: KernelArg<'_, Self::Buffer>)
        -> Result<()>;

    /// Enqueue a 1D range. Returns once the launch is queued.
    fn enqueue(&self, kernel: &Self::Kernel, work: WorkSize) -> Result<()>;

    /// Block until every queued command has completed.
    fn finish(&self) -> Result<()>;

    fn release_buffer(&self, buffer: Self::Buffer) -> Result<()>;

    fn release_kernel(&self, kernel: Self::Kernel) -> Result<()>;

    fn release_context(&mut self) -> Result<()>;

    fn release_program(&mut self) -> Result<()>;

    fn release_queue(&mut self) -> Result<()>;
}
