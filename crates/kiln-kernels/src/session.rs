//! Device session: one context, queue, compiled program and kernel cache.
//!
//! A session is an owned aggregate. Independent sessions never share a queue,
//! program or cache, and all of them are released together when the session
//! is closed or dropped.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::backend::ComputeBackend;
use crate::error::{DispatchError, Result};

/// Session construction parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// File holding every kernel definition, compiled as one program.
    pub kernel_source: PathBuf,
    /// Work-group size used for every launch. Must suit the device; it is
    /// not checked against device limits.
    pub local_size: usize,
}

impl SessionConfig {
    pub fn new(kernel_source: impl Into<PathBuf>, local_size: usize) -> Self {
        Self { kernel_source: kernel_source.into(), local_size }
    }
}

// ============================================================================
// Kernel cache
// ============================================================================

struct CachedKernel<K> {
    name: String,
    kernel: K,
}

/// Name → kernel handle map. Entries are never replaced; teardown releases
/// them in insertion order.
pub(crate) struct KernelCache<K> {
    entries: Vec<CachedKernel<K>>,
    index: HashMap<String, usize>,
}

impl<K> KernelCache<K> {
    fn new() -> Self {
        Self { entries: Vec::new(), index: HashMap::new() }
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    fn insert(&mut self, name: &str, kernel: K) -> usize {
        let slot = self.entries.len();
        self.entries.push(CachedKernel { name: name.to_string(), kernel });
        self.index.insert(name.to_string(), slot);
        slot
    }

    fn get(&self, slot: usize) -> &K {
        &self.entries[slot].kernel
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|e| e.name.as_str())
    }

    fn drain(&mut self) -> Vec<CachedKernel<K>> {
        self.index.clear();
        std::mem::take(&mut self.entries)
    }
}

// ============================================================================
// Session
// ============================================================================

/// A live compute context on one device.
///
/// The backend is reachable only from inside the crate, so every kernel
/// handle lives in the cache and every buffer in a single launch:
///
/// ```compile_fail
/// use kiln_kernels::fake::{FakeBackend, FakeDevice};
/// use kiln_kernels::{ComputeBackend, DeviceSession};
///
/// let device = FakeDevice::new().kernel("k", |_| {});
/// let s = DeviceSession::<FakeBackend>::from_source(&device.source(), 64, &device).unwrap();
/// s.backend().create_kernel("k").unwrap();
/// ```
pub struct DeviceSession<B: ComputeBackend> {
    backend: B,
    local_size: usize,
    kernels: KernelCache<B::Kernel>,
    closed: bool,
}

impl<B: ComputeBackend> DeviceSession<B> {
    /// Read the kernel source file and bring up the device.
    pub fn open(config: &SessionConfig, backend_config: &B::Config) -> Result<Self> {
        let source = read_source(&config.kernel_source)?;
        tracing::debug!(
            "read {} bytes of kernel source from {}",
            source.len(),
            config.kernel_source.display()
        );
        Self::from_source(&source, config.local_size, backend_config)
    }

    /// Bring up the device from in-memory kernel source.
    pub fn from_source(source: &str, local_size: usize, backend_config: &B::Config) -> Result<Self> {
        if local_size == 0 {
            return Err(DispatchError::InvalidLocalSize(local_size));
        }
        let backend = B::open(backend_config, source)?;
        tracing::info!(
            "device session open on {} (local size {})",
            backend.device_name(),
            local_size
        );
        Ok(Self { backend, local_size, kernels: KernelCache::new(), closed: false })
    }

    pub fn local_size(&self) -> usize {
        self.local_size
    }

    pub fn device_name(&self) -> String {
        self.backend.device_name()
    }

    pub(crate) fn backend(&self) -> &B {
        &self.backend
    }

    /// Number of distinct kernels compiled so far.
    pub fn cached_kernels(&self) -> usize {
        self.kernels.len()
    }

    /// Names of compiled kernels, in first-use order.
    pub fn kernel_names(&self) -> Vec<String> {
        self.kernels.names().map(str::to_string).collect()
    }

    /// Look up `name`, extracting it from the program on first use.
    pub fn kernel(&mut self, name: &str) -> Result<&B::Kernel> {
        let slot = self.resolve(name)?;
        Ok(self.kernels.get(slot))
    }

    pub(crate) fn resolve(&mut self, name: &str) -> Result<usize> {
        if let Some(slot) = self.kernels.position(name) {
            tracing::trace!("kernel cache hit: {}", name);
            return Ok(slot);
        }
        let kernel = self.backend.create_kernel(name)?;
        tracing::debug!("compiled kernel {}", name);
        Ok(self.kernels.insert(name, kernel))
    }

    pub(crate) fn kernel_at(&self, slot: usize) -> &B::Kernel {
        self.kernels.get(slot)
    }

    /// Release context, program, queue and cached kernels, in that order.
    pub fn close(mut self) -> Result<()> {
        self.teardown()
    }

    /// Runs at most once. Keeps releasing after a failure and reports the
    /// first error.
    fn teardown(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        let mut first_err = None;
        let mut note = |r: Result<()>| {
            if let Err(e) = r {
                first_err.get_or_insert(e);
            }
        };
        note(self.backend.release_context());
        note(self.backend.release_program());
        note(self.backend.release_queue());
        for cached in self.kernels.drain() {
            note(self.backend.release_kernel(cached.kernel));
        }

        tracing::info!("device session closed");
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl<B: ComputeBackend> Drop for DeviceSession<B> {
    fn drop(&mut self) {
        if let Err(e) = self.teardown() {
            tracing::warn!("device session teardown failed: {}", e);
        }
    }
}

fn read_source(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).map_err(|source| DispatchError::KernelSource {
        path: path.to_path_buf(),
        source,
    })
}
