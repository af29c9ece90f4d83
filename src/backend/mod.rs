//! Device backends and the contract the core dispatches through.
//!
//! The core sees a backend as a slot allocator plus a kernel queue. A tuned
//! kernel's expression references only constants, the loop variables listed
//! in its tune result, and `GlobalIndex` reads from the input slots in
//! order; code generation from that expression is the backend's job.

pub mod cpu;
pub mod shaders;
pub mod webgpu;

use crate::error::Result;
use crate::kernel::TunedKernel;
use futures::future::BoxFuture;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

pub use cpu::CpuBackend;
pub use webgpu::WebGpuBackend;

/// Opaque handle to a device buffer. Reference counted by the backend:
/// `malloc` creates with refcount 1, `inc_ref`/`dec_ref` adjust, and
/// `dec_ref` at zero frees. Using a freed slot is a `SlotError`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Slot(pub u64);

/// Cooperative cancellation signal for kernel dispatch.
///
/// A cancelled dispatch must complete without partial writes becoming
/// visible to later steps.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    /// Fresh, un-cancelled token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    /// True once cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Device-agnostic buffer and kernel dispatch contract.
///
/// Kernel execution is asynchronous: `execute` returns a future and the
/// `*_sync` variants block on it. Within one program, dispatches must be
/// issued in emit order; the backend may run independent kernels
/// concurrently but must honor the data dependencies implied by the
/// inputs/outputs lists.
pub trait Backend: Send + Sync {
    /// Identifies the backend; used in compile-cache keys.
    fn kind(&self) -> &'static str;

    /// Allocate a slot of `byte_size` bytes, optionally initialized with
    /// `init` (which must then be exactly `byte_size` long). Refcount starts
    /// at 1.
    fn malloc(&self, byte_size: usize, init: Option<&[u8]>) -> Result<Slot>;

    /// Increment a slot's refcount.
    fn inc_ref(&self, slot: Slot) -> Result<()>;

    /// Decrement a slot's refcount, freeing at zero.
    fn dec_ref(&self, slot: Slot) -> Result<()>;

    /// Read `count` bytes starting at byte `start` (the whole slot when
    /// `count` is `None`).
    fn read(
        &self,
        slot: Slot,
        start: usize,
        count: Option<usize>,
    ) -> BoxFuture<'static, Result<Vec<u8>>>;

    /// Blocking [`Backend::read`].
    fn read_sync(&self, slot: Slot, start: usize, count: Option<usize>) -> Result<Vec<u8>> {
        pollster::block_on(self.read(slot, start, count))
    }

    /// Dispatch a tuned kernel over `inputs`, writing `outputs`.
    fn execute(
        &self,
        kernel: &TunedKernel,
        inputs: &[Slot],
        outputs: &[Slot],
        cancel: Option<&CancelToken>,
    ) -> BoxFuture<'static, Result<()>>;

    /// Blocking [`Backend::execute`].
    fn execute_sync(
        &self,
        kernel: &TunedKernel,
        inputs: &[Slot],
        outputs: &[Slot],
        cancel: Option<&CancelToken>,
    ) -> Result<()> {
        pollster::block_on(self.execute(kernel, inputs, outputs, cancel))
    }
}

static DEFAULT_BACKEND: OnceLock<Arc<dyn Backend>> = OnceLock::new();

/// The process-wide default backend (CPU unless overridden before first use).
pub fn default_backend() -> Arc<dyn Backend> {
    DEFAULT_BACKEND
        .get_or_init(|| Arc::new(CpuBackend::new()) as Arc<dyn Backend>)
        .clone()
}

/// Install the default backend. Only effective before the first
/// [`default_backend`] call.
pub fn set_default_backend(backend: Arc<dyn Backend>) {
    let _ = DEFAULT_BACKEND.set(backend);
}
