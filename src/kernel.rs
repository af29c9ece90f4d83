//! Fused kernel bundles and the tuning pass that lowers them for a backend.
//!
//! A [`Kernel`] pairs an output size with a scalar expression, and optionally
//! a reduction. Tuning rewrites the expression in terms of concrete loop
//! variables and lowers every abstract [`GlobalView`](crate::alu::AluOp::GlobalView)
//! read into a physical [`GlobalIndex`](crate::alu::AluOp::GlobalIndex) read.

use crate::alu::{AluExp, AluOp};
use crate::error::Result;
use crate::DType;
use log::trace;
use std::collections::HashMap;

/// Name of the per-output-element loop variable.
pub const GIDX: &str = "gidx";
/// Name of the per-reduction-element loop variable.
pub const RIDX: &str = "ridx";

/// Accumulation operator of a reduction kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReduceOp {
    /// Sum of all reduced elements.
    Add,
    /// Maximum of all reduced elements.
    Max,
}

/// Reduction descriptor: accumulator dtype, operator, and the number of
/// elements folded into each output element.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Reduction {
    /// Accumulator dtype.
    pub dtype: DType,
    /// Accumulation operator.
    pub op: ReduceOp,
    /// Reduced element count per output element.
    pub size: usize,
}

/// A fused kernel: `exp` evaluated once per output element (elementwise), or
/// once per (output element, reduction element) pair and accumulated.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Kernel {
    /// Number of input buffers referenced by `exp`.
    pub nargs: usize,
    /// Number of output elements.
    pub size: usize,
    /// Kernel body; references inputs through `GlobalView` reads indexed by
    /// the `gidx` (and `ridx`) loop variables.
    pub exp: AluExp,
    /// Present on reduction kernels.
    pub reduction: Option<Reduction>,
}

impl Kernel {
    /// Dtype of the output buffer.
    pub fn out_dtype(&self) -> DType {
        match &self.reduction {
            Some(r) => r.dtype,
            None => self.exp.dtype(),
        }
    }

    /// Byte size of the output buffer.
    pub fn out_byte_size(&self) -> usize {
        self.size * self.out_dtype().byte_width()
    }
}

/// A kernel lowered for dispatch: the expression references only constants,
/// the loop variables listed in `vars`, and `GlobalIndex` reads from the
/// input slots in order.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TunedKernel {
    /// Number of input buffers.
    pub nargs: usize,
    /// Number of output elements.
    pub size: usize,
    /// Lowered kernel body.
    pub exp: AluExp,
    /// Present on reduction kernels.
    pub reduction: Option<Reduction>,
    /// Loop variables (name, exclusive bound) the backend must provide.
    pub vars: Vec<(String, i64)>,
}

impl TunedKernel {
    /// Dtype of the output buffer.
    pub fn out_dtype(&self) -> DType {
        match &self.reduction {
            Some(r) => r.dtype,
            None => self.exp.dtype(),
        }
    }

    /// Byte size of the output buffer.
    pub fn out_byte_size(&self) -> usize {
        self.size * self.out_dtype().byte_width()
    }
}

/// Replace every abstract `GlobalView` read by a guarded physical read.
fn lower_reads(exp: &AluExp) -> AluExp {
    exp.rewrite(&mut |e| match e.op() {
        AluOp::GlobalView { gid, tracker } => {
            let read = tracker
                .lower_read(*gid, e.dtype(), e.src())
                .unwrap_or_else(|err| panic!("kernel lowering failed: {}", err));
            Some(read)
        }
        _ => None,
    })
}

/// The null tuner: binds `gidx` (and `ridx` for reductions) directly as the
/// backend loop variables, lowers buffer reads, and re-simplifies.
///
/// Real accelerators would split the index space into `group`/`unroll`/
/// `upcast` bands here; the dispatch contract is the same either way.
pub fn tune(kernel: &Kernel) -> Result<TunedKernel> {
    let mut vars = vec![(GIDX.to_string(), kernel.size as i64)];
    let mut env: HashMap<String, AluExp> =
        [(GIDX.to_string(), AluExp::special(GIDX, kernel.size as i64))].into();
    if let Some(red) = &kernel.reduction {
        vars.push((RIDX.to_string(), red.size as i64));
        env.insert(RIDX.to_string(), AluExp::special(RIDX, red.size as i64));
    }
    let exp = lower_reads(&kernel.exp.substitute(&env)).simplified();
    debug_check_lowered(&exp, &vars);
    trace!(
        "tuned kernel: size={} reduction={:?} exp={}",
        kernel.size,
        kernel.reduction,
        exp
    );
    Ok(TunedKernel {
        nargs: kernel.nargs,
        size: kernel.size,
        exp,
        reduction: kernel.reduction.clone(),
        vars,
    })
}

/// A tuned expression must reference only declared loop variables and
/// physical reads; anything else is an internal inconsistency.
fn debug_check_lowered(exp: &AluExp, vars: &[(String, i64)]) {
    let stray = exp.collect(&|e| match e.op() {
        AluOp::GlobalView { .. } => true,
        AluOp::Special(name, _) => !vars.iter().any(|(v, _)| v == name),
        _ => false,
    });
    if let Some(bad) = stray.first() {
        panic!("tuned kernel references unlowered term: {}", bad);
    }
}
