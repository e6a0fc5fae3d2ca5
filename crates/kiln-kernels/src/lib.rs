//! # kiln-kernels
//!
//! OpenCL dispatch layer for small tensor networks.
//!
//! Provides:
//! - [`DeviceSession`]: one device, context, queue and compiled program, with a
//!   lazily filled kernel cache keyed by kernel name
//! - [`KernelDispatcher`]: five typed launch shapes (convolution, dense
//!   multiply, pool, in-place elementwise, preprocess) that allocate, stage,
//!   run and read back synchronously without leaking device memory
//! - [`opencl`]: the OpenCL backend, loaded at runtime (no SDK needed to build)
//! - [`fake`]: a host-memory backend for tests and benches

pub mod backend;
mod buffer;
pub mod dispatcher;
pub mod error;
pub mod fake;
pub mod launch;
pub mod opencl;
pub mod session;
pub mod work;

pub use backend::{ComputeBackend, KernelArg, MemAccess};
pub use dispatcher::{DispatchStats, KernelDispatcher, LaunchReport};
pub use error::{DispatchError, ErrorKind, PreconditionError, Result};
pub use launch::{
    ConvShape, Convolution, DenseMultiply, Elementwise, ElementwiseShape, ImageShape, Launch,
    LaunchKind, MatMulShape, Pool, PoolShape, Preprocess,
};
pub use opencl::{DeviceType, OpenClBackend, OpenClConfig};
pub use session::{DeviceSession, SessionConfig};
pub use work::WorkSize;

/// Session on the OpenCL backend.
pub type OpenClSession = DeviceSession<OpenClBackend>;

/// Dispatcher on the OpenCL backend.
pub type OpenClDispatcher = KernelDispatcher<OpenClBackend>;
