//! Host-memory compute backend.
//!
//! [`FakeBackend`] implements [`ComputeBackend`] without a device. Kernels are
//! Rust closures registered on a [`FakeDevice`]; buffers are byte vectors.
//! Every creation and release is recorded in a shared [`FakeLedger`] so tests
//! can check leak freedom and teardown order. Failures can be injected at
//! any device call with [`FailPoint`].

pub mod reference;

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::backend::{ComputeBackend, KernelArg, MemAccess};
use crate::error::{DispatchError, Result};
use crate::work::WorkSize;

// Error codes reported by injected failures, matching the OpenCL values.
const OUT_OF_RESOURCES: i32 = -5;
const MEM_OBJECT_ALLOCATION_FAILURE: i32 = -4;
const INVALID_VALUE: i32 = -30;
const INVALID_MEM_OBJECT: i32 = -38;
const INVALID_KERNEL_ARGS: i32 = -52;

/// Behaviour of one fake kernel.
pub type KernelFn = Arc<dyn Fn(&mut FakeLaunch<'_>) + Send + Sync>;

/// A device call that can be made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailPoint {
    /// The n-th buffer allocation on the backend (1-based).
    Allocation(usize),
    Write,
    SetArg,
    Enqueue,
    Finish,
    Read,
    ReleaseContext,
}

// ============================================================================
// Ledger
// ============================================================================

/// Lifecycle events, in the order they happened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FakeEvent {
    CreateKernel(String),
    Launch(String),
    ReleaseContext,
    ReleaseProgram,
    ReleaseQueue,
    ReleaseKernel(String),
}

#[derive(Default)]
struct LedgerState {
    kernels_created: usize,
    allocations: Vec<(MemAccess, usize)>,
    buffer_releases: usize,
    events: Vec<FakeEvent>,
}

/// Shared record of everything a fake backend did.
#[derive(Default)]
pub struct FakeLedger {
    state: Mutex<LedgerState>,
}

impl FakeLedger {
    pub fn kernels_created(&self) -> usize {
        self.state.lock().kernels_created
    }

    /// Every successful allocation as `(access, bytes)`, in order.
    pub fn allocations(&self) -> Vec<(MemAccess, usize)> {
        self.state.lock().allocations.clone()
    }

    pub fn allocation_count(&self) -> usize {
        self.state.lock().allocations.len()
    }

    pub fn buffer_releases(&self) -> usize {
        self.state.lock().buffer_releases
    }

    /// Allocated and not yet released.
    pub fn live_buffers(&self) -> usize {
        let s = self.state.lock();
        s.allocations.len() - s.buffer_releases
    }

    /// Number of kernel executions.
    pub fn launches(&self) -> usize {
        self.state
            .lock()
            .events
            .iter()
            .filter(|e| matches!(e, FakeEvent::Launch(_)))
            .count()
    }

    pub fn events(&self) -> Vec<FakeEvent> {
        self.state.lock().events.clone()
    }

    fn record(&self, event: FakeEvent) {
        self.state.lock().events.push(event);
    }
}

impl fmt::Debug for FakeLedger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = self.state.lock();
        f.debug_struct("FakeLedger")
            .field("kernels_created", &s.kernels_created)
            .field("allocations", &s.allocations.len())
            .field("buffer_releases", &s.buffer_releases)
            .field("events", &s.events.len())
            .finish()
    }
}

// ============================================================================
// Device builder
// ============================================================================

/// Configuration for [`FakeBackend`]: registered kernels and injected faults.
#[derive(Clone, Default)]
pub struct FakeDevice {
    kernels: BTreeMap<String, KernelFn>,
    build_log: Option<String>,
    no_device: bool,
    failures: Vec<FailPoint>,
    ledger: Arc<FakeLedger>,
}

impl FakeDevice {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the behaviour of kernel `name`.
    pub fn kernel<F>(mut self, name: &str, f: F) -> Self
    where
        F: Fn(&mut FakeLaunch<'_>) + Send + Sync + 'static,
    {
        self.kernels.insert(name.to_string(), Arc::new(f));
        self
    }

    /// Make program compilation fail with `log`.
    pub fn failing_build(mut self, log: &str) -> Self {
        self.build_log = Some(log.to_string());
        self
    }

    /// Report no device of the requested type.
    pub fn no_device(mut self) -> Self {
        self.no_device = true;
        self
    }

    /// Fail the first call matching `point`.
    pub fn fail_at(mut self, point: FailPoint) -> Self {
        self.failures.push(point);
        self
    }

    pub fn ledger(&self) -> Arc<FakeLedger> {
        Arc::clone(&self.ledger)
    }

    /// Kernel source declaring every registered kernel.
    pub fn source(&self) -> String {
        self.kernels
            .keys()
            .map(|name| format!("__kernel void {}(void) {{}}\n", name))
            .collect()
    }
}

impl fmt::Debug for FakeDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FakeDevice")
            .field("kernels", &self.kernels.keys().collect::<Vec<_>>())
            .field("build_log", &self.build_log)
            .field("no_device", &self.no_device)
            .field("failures", &self.failures)
            .finish()
    }
}

/// Names declared as `__kernel void <name>` in `source`.
pub fn declared_kernels(source: &str) -> Vec<String> {
    let mut names = Vec::new();
    let mut rest = source;
    while let Some(pos) = rest.find("__kernel") {
        rest = &rest[pos + "__kernel".len()..];
        let mut tokens = rest
            .split(|c: char| c.is_whitespace() || c == '(')
            .filter(|t| !t.is_empty());
        if tokens.next() == Some("void") {
            if let Some(name) = tokens.next() {
                names.push(name.to_string());
            }
        }
    }
    names
}

// ============================================================================
// Backend
// ============================================================================

#[derive(Debug, Clone, Copy)]
enum BoundArg {
    Buffer(u64),
    Int(i32),
}

#[derive(Debug, PartialEq, Eq)]
pub struct FakeKernel {
    id: u64,
    name: String,
}

impl FakeKernel {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

#[derive(Debug)]
pub struct FakeBuffer {
    id: u64,
}

#[derive(Default)]
struct State {
    next_id: u64,
    buffers: HashMap<u64, Vec<u8>>,
    args: HashMap<u64, Vec<Option<BoundArg>>>,
    pending: Vec<(u64, String, WorkSize)>,
    failures: Vec<FailPoint>,
    allocation_calls: usize,
}

impl State {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    /// Consume a matching injected failure.
    fn trip(&mut self, point: FailPoint) -> bool {
        match self.failures.iter().position(|&p| p == point) {
            Some(i) => {
                self.failures.remove(i);
                true
            }
            None => false,
        }
    }
}

/// A [`ComputeBackend`] running registered closures over host memory.
pub struct FakeBackend {
    kernels: BTreeMap<String, KernelFn>,
    declared: Vec<String>,
    ledger: Arc<FakeLedger>,
    state: Mutex<State>,
    context: bool,
    program: bool,
    queue: bool,
}

impl FakeBackend {
    pub fn ledger(&self) -> Arc<FakeLedger> {
        Arc::clone(&self.ledger)
    }

    /// Bytes currently held by live buffers.
    pub fn live_bytes(&self) -> usize {
        self.state.lock().buffers.values().map(Vec::len).sum()
    }
}

impl ComputeBackend for FakeBackend {
    type Config = FakeDevice;
    type Kernel = FakeKernel;
    type Buffer = FakeBuffer;

    fn open(config: &FakeDevice, source: &str) -> Result<Self> {
        if config.no_device {
            return Err(DispatchError::NoDevice { device_type: "fake".to_string() });
        }
        if let Some(log) = &config.build_log {
            tracing::error!("kernel program build failed:\n{}", log);
            return Err(DispatchError::Build { log: log.clone() });
        }
        Ok(Self {
            kernels: config.kernels.clone(),
            declared: declared_kernels(source),
            ledger: config.ledger(),
            state: Mutex::new(State { failures: config.failures.clone(), ..State::default() }),
            context: true,
            program: true,
            queue: true,
        })
    }

    fn device_name(&self) -> String {
        "fake device".to_string()
    }

    fn create_kernel(&self, name: &str) -> Result<FakeKernel> {
        if !self.declared.iter().any(|d| d == name) {
            return Err(DispatchError::KernelNotFound { name: name.to_string() });
        }
        let id = self.state.lock().next_id();
        {
            let mut ledger = self.ledger.state.lock();
            ledger.kernels_created += 1;
            ledger.events.push(FakeEvent::CreateKernel(name.to_string()));
        }
        Ok(FakeKernel { id, name: name.to_string() })
    }

    fn create_buffer(&self, access: MemAccess, nbytes: usize) -> Result<FakeBuffer> {
        let mut state = self.state.lock();
        state.allocation_calls += 1;
        let call = state.allocation_calls;
        if state.trip(FailPoint::Allocation(call)) {
            return Err(DispatchError::device(MEM_OBJECT_ALLOCATION_FAILURE, "clCreateBuffer"));
        }
        let id = state.next_id();
        state.buffers.insert(id, vec![0u8; nbytes]);
        self.ledger.state.lock().allocations.push((access, nbytes));
        Ok(FakeBuffer { id })
    }

    fn write_buffer(&self, buffer: &FakeBuffer, data: &[u8]) -> Result<()> {
        let mut state = self.state.lock();
        if state.trip(FailPoint::Write) {
            return Err(DispatchError::device(OUT_OF_RESOURCES, "clEnqueueWriteBuffer"));
        }
        let mem = state
            .buffers
            .get_mut(&buffer.id)
            .ok_or_else(|| DispatchError::device(INVALID_MEM_OBJECT, "clEnqueueWriteBuffer"))?;
        if data.len() > mem.len() {
            return Err(DispatchError::device(INVALID_VALUE, "clEnqueueWriteBuffer"));
        }
        mem[..data.len()].copy_from_slice(data);
        Ok(())
    }

    fn read_buffer(&self, buffer: &FakeBuffer, out: &mut [u8]) -> Result<()> {
        let mut state = self.state.lock();
        if state.trip(FailPoint::Read) {
            return Err(DispatchError::device(OUT_OF_RESOURCES, "clEnqueueReadBuffer"));
        }
        let mem = state
            .buffers
            .get(&buffer.id)
            .ok_or_else(|| DispatchError::device(INVALID_MEM_OBJECT, "clEnqueueReadBuffer"))?;
        if out.len() > mem.len() {
            return Err(DispatchError::device(INVALID_VALUE, "clEnqueueReadBuffer"));
        }
        out.copy_from_slice(&mem[..out.len()]);
        Ok(())
    }

    fn set_arg(&self, kernel: &FakeKernel, index: u32, arg: KernelArg<'_, FakeBuffer>) -> Result<()> {
        let mut state = self.state.lock();
        if state.trip(FailPoint::SetArg) {
            return Err(DispatchError::device(INVALID_VALUE, format!("clSetKernelArg({})", index)));
        }
        let bound = match arg {
            KernelArg::Buffer(buf) => BoundArg::Buffer(buf.id),
            KernelArg::Int(v) => BoundArg::Int(v),
        };
        let slots = state.args.entry(kernel.id).or_default();
        let index = index as usize;
        if slots.len() <= index {
            slots.resize(index + 1, None);
        }
        slots[index] = Some(bound);
        Ok(())
    }

    fn enqueue(&self, kernel: &FakeKernel, work: WorkSize) -> Result<()> {
        let mut state = self.state.lock();
        if state.trip(FailPoint::Enqueue) {
            return Err(DispatchError::device(OUT_OF_RESOURCES, "clEnqueueNDRangeKernel"));
        }
        let complete = state
            .args
            .get(&kernel.id)
            .map_or(false, |slots| slots.iter().all(Option::is_some));
        if !complete {
            return Err(DispatchError::device(INVALID_KERNEL_ARGS, "clEnqueueNDRangeKernel"));
        }
        state.pending.push((kernel.id, kernel.name.clone(), work));
        Ok(())
    }

    fn finish(&self) -> Result<()> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let pending = std::mem::take(&mut state.pending);
        if state.trip(FailPoint::Finish) {
            return Err(DispatchError::device(OUT_OF_RESOURCES, "clFinish"));
        }
        for (id, name, work) in pending {
            let args: Vec<BoundArg> = state.args[&id].iter().flatten().copied().collect();
            if let Some(f) = self.kernels.get(&name) {
                let mut launch = FakeLaunch { name: &name, work, args, buffers: &mut state.buffers };
                f(&mut launch);
            }
            self.ledger.record(FakeEvent::Launch(name));
        }
        Ok(())
    }

    fn release_buffer(&self, buffer: FakeBuffer) -> Result<()> {
        if self.state.lock().buffers.remove(&buffer.id).is_none() {
            return Err(DispatchError::device(INVALID_MEM_OBJECT, "clReleaseMemObject"));
        }
        self.ledger.state.lock().buffer_releases += 1;
        Ok(())
    }

    fn release_kernel(&self, kernel: FakeKernel) -> Result<()> {
        self.state.lock().args.remove(&kernel.id);
        self.ledger.record(FakeEvent::ReleaseKernel(kernel.name));
        Ok(())
    }

    fn release_context(&mut self) -> Result<()> {
        if self.state.lock().trip(FailPoint::ReleaseContext) {
            return Err(DispatchError::device(OUT_OF_RESOURCES, "clReleaseContext"));
        }
        if std::mem::take(&mut self.context) {
            self.ledger.record(FakeEvent::ReleaseContext);
        }
        Ok(())
    }

    fn release_program(&mut self) -> Result<()> {
        if std::mem::take(&mut self.program) {
            self.ledger.record(FakeEvent::ReleaseProgram);
        }
        Ok(())
    }

    fn release_queue(&mut self) -> Result<()> {
        if std::mem::take(&mut self.queue) {
            self.ledger.record(FakeEvent::ReleaseQueue);
        }
        Ok(())
    }
}

// ============================================================================
// Kernel view
// ============================================================================

/// What a fake kernel sees: its bound arguments and the launch range.
///
/// Accessors panic on a slot of the wrong kind, the way a real kernel with a
/// mismatched signature would misbehave.
pub struct FakeLaunch<'a> {
    name: &'a str,
    work: WorkSize,
    args: Vec<BoundArg>,
    buffers: &'a mut HashMap<u64, Vec<u8>>,
}

impl FakeLaunch<'_> {
    pub fn name(&self) -> &str {
        self.name
    }

    pub fn work(&self) -> WorkSize {
        self.work
    }

    pub fn arg_count(&self) -> usize {
        self.args.len()
    }

    /// Scalar argument as a `usize`; negative values clamp to 0.
    pub fn int(&self, index: usize) -> usize {
        match self.args[index] {
            BoundArg::Int(v) => v.max(0) as usize,
            BoundArg::Buffer(_) => panic!("{}: argument {} is a buffer", self.name, index),
        }
    }

    /// Raw bytes of a buffer argument.
    pub fn bytes(&self, index: usize) -> &[u8] {
        let id = self.buffer_id(index);
        &self.buffers[&id]
    }

    /// Copy of a buffer argument as `f32`s.
    pub fn read_f32(&self, index: usize) -> Vec<f32> {
        self.bytes(index)
            .chunks_exact(4)
            .map(|c| f32::from_ne_bytes([c[0], c[1], c[2], c[3]]))
            .collect()
    }

    /// Overwrite the start of a buffer argument.
    pub fn write_f32(&mut self, index: usize, values: &[f32]) {
        let id = self.buffer_id(index);
        let mem = self
            .buffers
            .get_mut(&id)
            .unwrap_or_else(|| panic!("buffer {} was released", id));
        let src: &[u8] = bytemuck::cast_slice(values);
        assert!(src.len() <= mem.len(), "{}: write past end of argument {}", self.name, index);
        mem[..src.len()].copy_from_slice(src);
    }

    fn buffer_id(&self, index: usize) -> u64 {
        match self.args[index] {
            BoundArg::Buffer(id) => id,
            BoundArg::Int(_) => panic!("{}: argument {} is a scalar", self.name, index),
        }
    }
}
