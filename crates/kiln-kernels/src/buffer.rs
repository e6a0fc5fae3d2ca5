//! Launch-scoped device memory.

use crate::backend::{ComputeBackend, MemAccess};
use crate::error::Result;

/// A device buffer that lives for exactly one launch.
///
/// Released via [`DeviceBuffer::release`] on the success path so release
/// errors surface to the caller, and via `Drop` on every other exit path.
pub struct DeviceBuffer<'b, B: ComputeBackend> {
    backend: &'b B,
    raw: Option<B::Buffer>,
    nbytes: usize,
}

impl<'b, B: ComputeBackend> DeviceBuffer<'b, B> {
    /// Allocate `nbytes` of device memory.
    pub fn alloc(backend: &'b B, access: MemAccess, nbytes: usize) -> Result<Self> {
        let raw = backend.create_buffer(access, nbytes)?;
        Ok(Self { backend, raw: Some(raw), nbytes })
    }

    /// Blocking host → device copy.
    pub fn write(&self, data: &[u8]) -> Result<()> {
        self.backend.write_buffer(self.raw(), data)
    }

    /// Blocking device → host copy into `out`.
    pub fn read_into(&self, out: &mut [u8]) -> Result<()> {
        self.backend.read_buffer(self.raw(), out)
    }

    /// Raw handle for binding as a kernel argument.
    pub fn raw(&self) -> &B::Buffer {
        // Only `release` and `drop` take the handle, and both consume `self`.
        self.raw.as_ref().expect("device buffer used after release")
    }

    /// Release now, reporting failure.
    pub fn release(mut self) -> Result<()> {
        match self.raw.take() {
            Some(raw) => self.backend.release_buffer(raw),
            None => Ok(()),
        }
    }
}

impl<B: ComputeBackend> Drop for DeviceBuffer<'_, B> {
    fn drop(&mut self) {
        if let Some(raw) = self.raw.take() {
            if let Err(e) = self.backend.release_buffer(raw) {
                tracing::warn!("failed to release {} byte device buffer: {}", self.nbytes, e);
            }
        }
    }
}
