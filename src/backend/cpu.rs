//! CPU backend: a reference interpreter over tuned kernels.
//!
//! Slots are plain byte vectors; `execute` walks every output element and
//! evaluates the kernel expression with the scalar-IR interpreter. Slow but
//! exact, and the semantics other backends are tested against.

use crate::backend::{Backend, CancelToken, Slot};
use crate::error::{Error, Result};
use crate::kernel::{ReduceOp, TunedKernel, GIDX, RIDX};
use crate::{DType, Scalar};
use futures::future::BoxFuture;
use log::trace;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

struct SlotEntry {
    data: Vec<u8>,
    refs: usize,
}

/// In-process backend backed by host memory.
pub struct CpuBackend {
    slots: Mutex<HashMap<u64, SlotEntry>>,
    next_id: AtomicU64,
}

impl CpuBackend {
    /// Create an empty backend.
    pub fn new() -> Self {
        Self { slots: Mutex::new(HashMap::new()), next_id: AtomicU64::new(1) }
    }

    fn with_slot<T>(&self, slot: Slot, f: impl FnOnce(&SlotEntry) -> T) -> Result<T> {
        let slots = self.slots.lock().unwrap();
        let entry = slots
            .get(&slot.0)
            .ok_or_else(|| Error::Slot(format!("slot {} is freed or invalid", slot.0)))?;
        Ok(f(entry))
    }

    /// Number of live slots; used by lifecycle tests.
    pub fn live_slots(&self) -> usize {
        self.slots.lock().unwrap().len()
    }
}

impl Default for CpuBackend {
    fn default() -> Self {
        Self::new()
    }
}

/// Decode one element of `dtype` at element offset `idx`.
pub(crate) fn read_scalar(bytes: &[u8], idx: i64, dtype: DType) -> Scalar {
    let w = dtype.byte_width();
    let at = idx as usize * w;
    let chunk = &bytes[at..at + w];
    match dtype {
        DType::Float32 => Scalar::F32(f32::from_le_bytes(chunk.try_into().unwrap())),
        DType::Int32 => Scalar::I32(i32::from_le_bytes(chunk.try_into().unwrap())),
        DType::Uint32 => Scalar::U32(u32::from_le_bytes(chunk.try_into().unwrap())),
        DType::Bool => Scalar::Bool(chunk[0] != 0),
        DType::Complex64 => Scalar::C64(
            f32::from_le_bytes(chunk[0..4].try_into().unwrap()),
            f32::from_le_bytes(chunk[4..8].try_into().unwrap()),
        ),
    }
}

/// Encode one scalar, appending to `out`.
pub(crate) fn write_scalar(out: &mut Vec<u8>, value: Scalar) {
    match value {
        Scalar::F32(v) => out.extend_from_slice(&v.to_le_bytes()),
        Scalar::I32(v) => out.extend_from_slice(&v.to_le_bytes()),
        Scalar::U32(v) => out.extend_from_slice(&v.to_le_bytes()),
        Scalar::Bool(v) => out.push(v as u8),
        Scalar::C64(re, im) => {
            out.extend_from_slice(&re.to_le_bytes());
            out.extend_from_slice(&im.to_le_bytes());
        }
    }
}

fn reduce_init(op: ReduceOp, dtype: DType) -> Scalar {
    match (op, dtype) {
        (ReduceOp::Add, d) => Scalar::from_f64(0.0, d),
        (ReduceOp::Max, DType::Float32) => Scalar::F32(f32::NEG_INFINITY),
        (ReduceOp::Max, DType::Int32) => Scalar::I32(i32::MIN),
        (ReduceOp::Max, DType::Uint32) => Scalar::U32(0),
        (ReduceOp::Max, DType::Bool) => Scalar::Bool(false),
        (ReduceOp::Max, DType::Complex64) => {
            panic!("max reduction over complex64")
        }
    }
}

fn reduce_combine(op: ReduceOp, acc: Scalar, x: Scalar) -> Scalar {
    match (op, acc, x) {
        (ReduceOp::Add, Scalar::F32(a), Scalar::F32(b)) => Scalar::F32(a + b),
        (ReduceOp::Add, Scalar::I32(a), Scalar::I32(b)) => Scalar::I32(a.wrapping_add(b)),
        (ReduceOp::Add, Scalar::U32(a), Scalar::U32(b)) => Scalar::U32(a.wrapping_add(b)),
        (ReduceOp::Add, Scalar::Bool(a), Scalar::Bool(b)) => Scalar::Bool(a || b),
        (ReduceOp::Max, Scalar::F32(a), Scalar::F32(b)) => Scalar::F32(a.max(b)),
        (ReduceOp::Max, Scalar::I32(a), Scalar::I32(b)) => Scalar::I32(a.max(b)),
        (ReduceOp::Max, Scalar::U32(a), Scalar::U32(b)) => Scalar::U32(a.max(b)),
        (ReduceOp::Max, Scalar::Bool(a), Scalar::Bool(b)) => Scalar::Bool(a || b),
        (_, a, b) => panic!("reduction over mismatched scalars {:?}, {:?}", a, b),
    }
}

impl Backend for CpuBackend {
    fn kind(&self) -> &'static str {
        "cpu"
    }

    fn malloc(&self, byte_size: usize, init: Option<&[u8]>) -> Result<Slot> {
        let data = match init {
            Some(bytes) => {
                if bytes.len() != byte_size {
                    return Err(Error::Slot(format!(
                        "malloc of {} bytes initialized with {} bytes",
                        byte_size,
                        bytes.len()
                    )));
                }
                bytes.to_vec()
            }
            None => vec![0u8; byte_size],
        };
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.slots.lock().unwrap().insert(id, SlotEntry { data, refs: 1 });
        Ok(Slot(id))
    }

    fn inc_ref(&self, slot: Slot) -> Result<()> {
        let mut slots = self.slots.lock().unwrap();
        let entry = slots
            .get_mut(&slot.0)
            .ok_or_else(|| Error::Slot(format!("slot {} is freed or invalid", slot.0)))?;
        entry.refs += 1;
        Ok(())
    }

    fn dec_ref(&self, slot: Slot) -> Result<()> {
        let mut slots = self.slots.lock().unwrap();
        let entry = slots
            .get_mut(&slot.0)
            .ok_or_else(|| Error::Slot(format!("slot {} is freed or invalid", slot.0)))?;
        entry.refs -= 1;
        if entry.refs == 0 {
            slots.remove(&slot.0);
        }
        Ok(())
    }

    fn read(
        &self,
        slot: Slot,
        start: usize,
        count: Option<usize>,
    ) -> BoxFuture<'static, Result<Vec<u8>>> {
        let result = self.with_slot(slot, |entry| {
            let end = count.map_or(entry.data.len(), |c| start + c);
            if end > entry.data.len() {
                return Err(Error::Slot(format!(
                    "read past end of slot {} ({} > {})",
                    slot.0,
                    end,
                    entry.data.len()
                )));
            }
            Ok(entry.data[start..end].to_vec())
        });
        let result = match result {
            Ok(inner) => inner,
            Err(e) => Err(e),
        };
        Box::pin(futures::future::ready(result))
    }

    fn execute(
        &self,
        kernel: &TunedKernel,
        inputs: &[Slot],
        outputs: &[Slot],
        cancel: Option<&CancelToken>,
    ) -> BoxFuture<'static, Result<()>> {
        let result = self.run(kernel, inputs, outputs, cancel);
        Box::pin(futures::future::ready(result))
    }
}

impl CpuBackend {
    fn run(
        &self,
        kernel: &TunedKernel,
        inputs: &[Slot],
        outputs: &[Slot],
        cancel: Option<&CancelToken>,
    ) -> Result<()> {
        if inputs.len() != kernel.nargs {
            return Err(Error::Backend(format!(
                "kernel expects {} inputs, got {}",
                kernel.nargs,
                inputs.len()
            )));
        }
        trace!("cpu dispatch: size={} inputs={:?}", kernel.size, inputs);
        let input_data: Vec<Vec<u8>> = inputs
            .iter()
            .map(|&s| self.with_slot(s, |e| e.data.clone()))
            .collect::<Result<_>>()?;

        let out_dtype = kernel.out_dtype();
        let mut out = Vec::with_capacity(kernel.size * out_dtype.byte_width());
        let mut vars: HashMap<String, i64> = HashMap::new();
        let mut globals = |gid: usize, off: i64, dtype: DType| -> Scalar {
            read_scalar(&input_data[gid], off, dtype)
        };

        for gidx in 0..kernel.size as i64 {
            if cancel.is_some_and(CancelToken::is_cancelled) {
                return Err(Error::Backend("dispatch cancelled".to_string()));
            }
            vars.insert(GIDX.to_string(), gidx);
            let value = match &kernel.reduction {
                None => kernel.exp.evaluate(&vars, &mut globals),
                Some(red) => {
                    let mut acc = reduce_init(red.op, red.dtype);
                    for ridx in 0..red.size as i64 {
                        vars.insert(RIDX.to_string(), ridx);
                        let x = kernel.exp.evaluate(&vars, &mut globals);
                        acc = reduce_combine(red.op, acc, x);
                    }
                    acc
                }
            };
            write_scalar(&mut out, value);
        }

        // Commit only after the whole kernel ran, so a cancelled or failed
        // dispatch leaves no partial writes.
        let mut slots = self.slots.lock().unwrap();
        let entry = slots
            .get_mut(&outputs[0].0)
            .ok_or_else(|| Error::Slot(format!("slot {} is freed or invalid", outputs[0].0)))?;
        entry.data = out;
        Ok(())
    }
}
