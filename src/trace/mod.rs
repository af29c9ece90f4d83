//! Tracing interpreters and primitive dispatch.
//!
//! A process-wide (thread-local) stack of traces interprets user programs.
//! Every primitive application goes through [`bind`]: the inputs are raised
//! to the highest-level trace among them, and that trace decides whether to
//! execute immediately (eval), push tangents (JVP), split known/unknown
//! (partial evaluation), or stage an equation (jit).

pub mod jaxpr;
pub mod jit;
pub mod jvp;
pub mod partial_eval;
pub mod transpose;

use crate::error::{Error, Result};
use crate::kernel::{tune, Kernel, GIDX};
use crate::view::{unravel_alu, ShapeTracker};
use crate::{AbstractValue, Array, Scalar};
use jaxpr::{abstract_eval, CompareOp, Primitive};
use std::cell::{Cell, RefCell};
use std::rc::Rc;

pub use jaxpr::{typecheck_jaxpr, Jaxpr};
pub use jit::{jit, make_jaxpr, JitFn};
pub use jvp::{jvp, JvpTracer};
pub use partial_eval::{linearize, LinearFn, PartialEvalTracer, PartialVal};
pub use transpose::{grad, value_and_grad, vjp, VjpFn};

/// A runtime value flowing through a user program: either a concrete array
/// or a tracer belonging to some trace on the stack.
#[derive(Clone)]
pub enum Value {
    /// Concrete array (the eval trace at level 0).
    Concrete(Array),
    /// Forward-mode tracer carrying `(primal, tangent)`.
    Jvp(Rc<JvpTracer>),
    /// Partial-evaluation tracer carrying a known/unknown split.
    PartialEval(Rc<PartialEvalTracer>),
    /// Staging tracer bound to an equation output or constant.
    Jit(Rc<jit::JitTracer>),
}

impl std::fmt::Debug for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Concrete(a) => write!(f, "Concrete({:?})", a),
            Value::Jvp(t) => write!(f, "Jvp(level={}, {})", t.level, t.aval()),
            Value::PartialEval(t) => write!(f, "PartialEval(level={}, {})", t.level, t.aval()),
            Value::Jit(t) => write!(f, "Jit(level={}, {})", t.level, t.aval()),
        }
    }
}

/// The kind (and state) of one stack frame.
#[derive(Clone)]
pub(crate) enum TraceKind {
    /// Forward-mode trace.
    Jvp,
    /// Known/unknown partial evaluation.
    PartialEval,
    /// Equation staging into a Jaxpr builder.
    Jit(Rc<RefCell<jit::JaxprBuilder>>),
}

thread_local! {
    static TRACE_STACK: RefCell<Vec<TraceKind>> = const { RefCell::new(Vec::new()) };
    static DYNAMIC_LEVEL: Cell<Option<usize>> = const { Cell::new(None) };
}

/// RAII frame for a pushed trace: popping happens in `Drop`, so the frame
/// leaves the stack on every exit path, panics included.
pub(crate) struct FrameGuard {
    level: usize,
}

impl FrameGuard {
    /// The level of the pushed frame (levels start at 1; 0 is eval).
    pub(crate) fn level(&self) -> usize {
        self.level
    }
}

impl Drop for FrameGuard {
    fn drop(&mut self) {
        TRACE_STACK.with(|stack| {
            let popped = stack.borrow_mut().pop();
            debug_assert!(popped.is_some(), "trace stack underflow");
        });
    }
}

/// Push a new main trace; the returned guard pops it.
pub(crate) fn new_main(kind: TraceKind) -> FrameGuard {
    TRACE_STACK.with(|stack| {
        let mut stack = stack.borrow_mut();
        stack.push(kind);
        FrameGuard { level: stack.len() }
    })
}

/// RAII setting of the dynamic trace level used by `jit` staging.
pub(crate) struct DynamicGuard {
    prev: Option<usize>,
}

impl Drop for DynamicGuard {
    fn drop(&mut self) {
        DYNAMIC_LEVEL.with(|d| d.set(self.prev));
    }
}

/// Make `level` the dynamic trace until the guard drops: operations on
/// plain concrete values are then staged rather than evaluated.
pub(crate) fn set_dynamic(level: usize) -> DynamicGuard {
    DYNAMIC_LEVEL.with(|d| {
        let prev = d.get();
        d.set(Some(level));
        DynamicGuard { prev }
    })
}

/// The dynamic trace level, when a `jit` staging frame set one.
pub(crate) fn dynamic_level() -> Option<usize> {
    DYNAMIC_LEVEL.with(Cell::get)
}

fn frame_kind(level: usize) -> TraceKind {
    TRACE_STACK.with(|stack| {
        stack
            .borrow()
            .get(level - 1)
            .cloned()
            .unwrap_or_else(|| panic!("no trace frame at level {}", level))
    })
}

impl Value {
    /// The trace level this value belongs to (0 for concrete arrays).
    pub fn level(&self) -> usize {
        match self {
            Value::Concrete(_) => 0,
            Value::Jvp(t) => t.level,
            Value::PartialEval(t) => t.level,
            Value::Jit(t) => t.level,
        }
    }

    /// The abstract value.
    pub fn aval(&self) -> AbstractValue {
        match self {
            Value::Concrete(a) => a.aval().clone(),
            Value::Jvp(t) => t.aval(),
            Value::PartialEval(t) => t.aval(),
            Value::Jit(t) => t.aval(),
        }
    }

    /// The concrete array, if this is one.
    pub fn concrete(&self) -> Option<&Array> {
        match self {
            Value::Concrete(a) => Some(a),
            _ => None,
        }
    }

    /// The concrete array, or a type error naming the situation.
    pub fn expect_concrete(&self) -> Result<&Array> {
        self.concrete().ok_or_else(|| {
            Error::Type("a traced value leaked into a concrete-only context".to_string())
        })
    }

    /// Wrap a concrete scalar constant.
    pub fn constant(value: Scalar) -> Value {
        Value::Concrete(Array::scalar(value))
    }

    /// Wrap a concrete float32 scalar.
    pub fn scalar(value: f32) -> Value {
        Value::constant(Scalar::F32(value))
    }

    /// A value of `aval` filled with `value` (built from a broadcast of the
    /// scalar, so it stays traceable).
    pub fn full(aval: &AbstractValue, value: f64) -> Value {
        let scalar = Scalar::from_f64(value, aval.dtype);
        if aval.shape.is_scalar() {
            return Value::constant(scalar);
        }
        let shape = aval.shape.as_slice().to_vec();
        let axes: Vec<usize> = (0..shape.len()).collect();
        bind1(Primitive::Broadcast { shape, axes }, &[Value::constant(scalar)])
            .unwrap_or_else(|e| panic!("{}", e))
    }

    /// Zeros with the same abstract value as `v`.
    pub fn zeros_like(v: &Value) -> Value {
        Value::full(&v.aval(), 0.0)
    }
}

impl From<Array> for Value {
    fn from(a: Array) -> Value {
        Value::Concrete(a)
    }
}

fn kind_matches(kind: &TraceKind, value: &Value) -> bool {
    matches!(
        (kind, value),
        (TraceKind::Jvp, Value::Jvp(_))
            | (TraceKind::PartialEval, Value::PartialEval(_))
            | (TraceKind::Jit(_), Value::Jit(_))
    )
}

/// Raise `value` into the trace at `level`: unchanged if already there,
/// boxed/lifted if it comes from below, an error if it escaped from above
/// or belongs to a different trace at the same level.
fn full_raise(kind: &TraceKind, level: usize, value: &Value) -> Result<Value> {
    use std::cmp::Ordering;
    match value.level().cmp(&level) {
        Ordering::Equal => {
            if kind_matches(kind, value) {
                Ok(value.clone())
            } else {
                Err(Error::Type(format!("two different traces at level {}", level)))
            }
        }
        Ordering::Less => match kind {
            TraceKind::Jvp => Ok(jvp::lift(level, value)),
            TraceKind::PartialEval => Ok(partial_eval::lift(level, value)),
            TraceKind::Jit(builder) => jit::lift(builder, level, value),
        },
        Ordering::Greater => Err(Error::Type(format!(
            "tracer from level {} escaped into a level-{} context",
            value.level(),
            level
        ))),
    }
}

/// Apply a primitive to values, dispatching through the top trace among
/// them (or the dynamic trace, when one is set).
pub fn bind(prim: Primitive, inputs: &[Value]) -> Result<Vec<Value>> {
    let mut level = inputs.iter().map(Value::level).max().unwrap_or(0);
    if let Some(dynamic) = DYNAMIC_LEVEL.with(Cell::get) {
        level = level.max(dynamic);
    }
    if level == 0 {
        return eval_bind(&prim, inputs);
    }
    let kind = frame_kind(level);
    let raised: Vec<Value> = inputs
        .iter()
        .map(|v| full_raise(&kind, level, v))
        .collect::<Result<_>>()?;
    match kind {
        TraceKind::Jvp => jvp::process_primitive(level, &prim, &raised),
        TraceKind::PartialEval => partial_eval::process_primitive(level, &prim, &raised),
        TraceKind::Jit(builder) => jit::process_primitive(&builder, level, &prim, &raised),
    }
}

/// [`bind`] for single-output primitives.
pub fn bind1(prim: Primitive, inputs: &[Value]) -> Result<Value> {
    let mut outs = bind(prim, inputs)?;
    debug_assert_eq!(outs.len(), 1);
    Ok(outs.remove(0))
}

/// Evaluate a Jaxpr by re-binding its equations over `args`. Works under
/// any active trace, which makes it double as the inliner for `jit_call`.
pub fn eval_jaxpr(jaxpr: &Jaxpr, args: &[Value]) -> Result<Vec<Value>> {
    use jaxpr::Atom;
    if args.len() != jaxpr.in_binders.len() {
        return Err(Error::Type(format!(
            "jaxpr expects {} inputs, got {}",
            jaxpr.in_binders.len(),
            args.len()
        )));
    }
    let mut env: std::collections::HashMap<u64, Value> = jaxpr
        .in_binders
        .iter()
        .zip(args.iter())
        .map(|(b, v)| (b.id, v.clone()))
        .collect();
    let read = |env: &std::collections::HashMap<u64, Value>, atom: &Atom| -> Value {
        match atom {
            Atom::Var(v) => env
                .get(&v.id)
                .cloned()
                .unwrap_or_else(|| panic!("unbound v{} during jaxpr eval", v.id)),
            Atom::Lit(l) => Value::constant(l.value),
        }
    };
    for eqn in &jaxpr.eqns {
        let inputs: Vec<Value> = eqn.inputs.iter().map(|a| read(&env, a)).collect();
        let outs = bind(eqn.prim.clone(), &inputs)?;
        for (binder, out) in eqn.out_binders.iter().zip(outs.into_iter()) {
            env.insert(binder.id, out);
        }
    }
    Ok(jaxpr.outs.iter().map(|a| read(&env, a)).collect())
}

/// The eval path: dispatch one primitive on concrete arrays through its
/// JIT rule (the same kernel path the compiler uses) or a direct backend
/// operation.
fn eval_bind(prim: &Primitive, inputs: &[Value]) -> Result<Vec<Value>> {
    let arrays: Vec<&Array> = inputs
        .iter()
        .map(Value::expect_concrete)
        .collect::<Result<_>>()?;
    let outs = eval_primitive(prim, &arrays)?;
    Ok(outs.into_iter().map(Value::Concrete).collect())
}

/// Concrete implementation rule for one primitive.
pub(crate) fn eval_primitive(prim: &Primitive, args: &[&Array]) -> Result<Vec<Array>> {
    match prim {
        Primitive::RandomBits { shape } => {
            Ok(vec![crate::random::eval_random_bits(args[0], shape)?])
        }
        Primitive::JitCall { jaxpr, num_consts } => jit::eval_jit_call(jaxpr, *num_consts, args),
        _ => {
            let in_avals: Vec<AbstractValue> = args.iter().map(|a| a.aval().clone()).collect();
            let out_avals = abstract_eval(prim, &in_avals)?;
            let out_aval = out_avals[0].clone();
            let backend = args[0].backend().clone();

            // Each input enters the kernel as a whole-array view; the JIT
            // rule rewrites trackers and indices as the primitive requires.
            let exps: Vec<crate::alu::AluExp> = args
                .iter()
                .enumerate()
                .map(|(gid, a)| {
                    let shape = a.shape().as_slice();
                    let tracker = ShapeTracker::contiguous(shape);
                    let gidx = crate::alu::AluExp::special(GIDX, a.size().max(1) as i64);
                    let indices = unravel_alu(shape, &gidx)?;
                    crate::alu::AluExp::global_view(gid, a.dtype(), tracker, indices)
                })
                .collect::<Result<_>>()?;

            let build = jit::jit_rule(prim, &exps, &in_avals, &out_aval)?;
            let kernel = Kernel {
                nargs: args.len(),
                size: build.size,
                exp: build.exp,
                reduction: build.reduction,
            };
            let tuned = tune(&kernel)?;
            let out_slot = backend.malloc(out_aval.byte_size(), None)?;
            let input_slots: Vec<_> = args.iter().map(|a| a.slot()).collect();
            if let Err(e) = backend.execute_sync(&tuned, &input_slots, &[out_slot], None) {
                let _ = backend.dec_ref(out_slot);
                return Err(e);
            }
            Ok(vec![Array::from_parts(out_slot, out_aval, backend)])
        }
    }
}

// User-facing sugar: these panic on type errors, like the array API.
impl Value {
    fn bind_sugar(prim: Primitive, inputs: &[Value]) -> Value {
        bind1(prim, inputs).unwrap_or_else(|e| panic!("{}", e))
    }

    /// Elementwise addition.
    pub fn add(&self, other: &Value) -> Value {
        Self::bind_sugar(Primitive::Add, &[self.clone(), other.clone()])
    }

    /// Elementwise subtraction (`a + (-b)`).
    pub fn sub(&self, other: &Value) -> Value {
        self.add(&other.neg())
    }

    /// Elementwise multiplication.
    pub fn mul(&self, other: &Value) -> Value {
        Self::bind_sugar(Primitive::Mul, &[self.clone(), other.clone()])
    }

    /// Elementwise division (`a * reciprocal(b)`).
    pub fn div(&self, other: &Value) -> Value {
        self.mul(&other.reciprocal())
    }

    /// Elementwise negation.
    pub fn neg(&self) -> Value {
        Self::bind_sugar(Primitive::Neg, &[self.clone()])
    }

    /// Elementwise sine.
    pub fn sin(&self) -> Value {
        Self::bind_sugar(Primitive::Sin, &[self.clone()])
    }

    /// Elementwise cosine.
    pub fn cos(&self) -> Value {
        Self::bind_sugar(Primitive::Cos, &[self.clone()])
    }

    /// Elementwise natural exponential.
    pub fn exp(&self) -> Value {
        Self::bind_sugar(Primitive::Exp, &[self.clone()])
    }

    /// Elementwise natural logarithm.
    pub fn log(&self) -> Value {
        Self::bind_sugar(Primitive::Log, &[self.clone()])
    }

    /// Elementwise square root.
    pub fn sqrt(&self) -> Value {
        Self::bind_sugar(Primitive::Sqrt, &[self.clone()])
    }

    /// Elementwise reciprocal.
    pub fn reciprocal(&self) -> Value {
        Self::bind_sugar(Primitive::Reciprocal, &[self.clone()])
    }

    /// Sum over the given axes.
    pub fn sum(&self, axes: &[usize]) -> Value {
        let mut axes = axes.to_vec();
        axes.sort_unstable();
        Self::bind_sugar(Primitive::ReduceSum { axes }, &[self.clone()])
    }

    /// Sum over every axis, yielding a scalar.
    pub fn sum_all(&self) -> Value {
        let axes: Vec<usize> = (0..self.aval().shape.ndim()).collect();
        if axes.is_empty() {
            return self.clone();
        }
        self.sum(&axes)
    }

    /// Elementwise less-than.
    pub fn lt(&self, other: &Value) -> Value {
        Self::bind_sugar(
            Primitive::Compare { op: CompareOp::Lt },
            &[self.clone(), other.clone()],
        )
    }

    /// Elementwise equality.
    pub fn eq_(&self, other: &Value) -> Value {
        Self::bind_sugar(
            Primitive::Compare { op: CompareOp::Eq },
            &[self.clone(), other.clone()],
        )
    }

    /// Elementwise inequality.
    pub fn ne_(&self, other: &Value) -> Value {
        Self::bind_sugar(
            Primitive::Compare { op: CompareOp::Ne },
            &[self.clone(), other.clone()],
        )
    }

    /// Select from `on_true` where this (boolean) value holds, else from
    /// `on_false`.
    pub fn where_(&self, on_true: &Value, on_false: &Value) -> Value {
        Self::bind_sugar(
            Primitive::Where,
            &[self.clone(), on_true.clone(), on_false.clone()],
        )
    }

    /// Permute axes.
    pub fn transpose(&self, perm: &[usize]) -> Value {
        Self::bind_sugar(Primitive::Transpose { perm: perm.to_vec() }, &[self.clone()])
    }

    /// Reinterpret the shape.
    pub fn reshape(&self, shape: &[usize]) -> Value {
        Self::bind_sugar(Primitive::Reshape { shape: shape.to_vec() }, &[self.clone()])
    }

    /// Broadcast to `shape`, inserting the given output axes.
    pub fn broadcast(&self, shape: &[usize], axes: &[usize]) -> Value {
        Self::bind_sugar(
            Primitive::Broadcast { shape: shape.to_vec(), axes: axes.to_vec() },
            &[self.clone()],
        )
    }

    /// Broadcast to `shape` by NumPy right-alignment.
    pub fn broadcast_to(&self, shape: &[usize]) -> Value {
        let ndim = self.aval().shape.ndim();
        let axes: Vec<usize> = (0..shape.len() - ndim).collect();
        self.broadcast(shape, &axes)
    }

    /// Reverse the axes marked true.
    pub fn flip(&self, axes: &[bool]) -> Value {
        Self::bind_sugar(Primitive::Flip { axes: axes.to_vec() }, &[self.clone()])
    }
}
