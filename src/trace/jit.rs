//! JIT compilation: staging traces to Jaxprs, fusing equations into
//! kernels, and playing back compiled step programs on a backend.
//!
//! Fusion is decided by dataflow: an equation's output is *black*
//! (materialized to a device buffer) when it is a reduction, a program
//! output, or feeds two or more distinct black consumers. Everything else
//! fuses into the expression of the kernel that consumes it.

use super::jaxpr::{abstract_eval, Atom, Jaxpr, JaxprEqn, Primitive, Var};
use super::{new_main, set_dynamic, TraceKind, Value};
use crate::alu::AluExp;
use crate::backend::{default_backend, Backend, Slot};
use crate::error::{Error, Result};
use crate::kernel::{tune, Kernel, Reduction, ReduceOp, TunedKernel, GIDX, RIDX};
use crate::utils::FpHash;
use crate::view::{unravel_alu, ShapeTracker};
use crate::{AbstractValue, Array, DType};
use log::{debug, trace};
use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::rc::Rc;
use std::sync::{Arc, Mutex, OnceLock};

/// Tracer of the staging trace: its identity is the equation operand it
/// stands for.
pub struct JitTracer {
    pub(crate) level: usize,
    pub(crate) atom: Atom,
}

impl JitTracer {
    /// The abstract value.
    pub fn aval(&self) -> AbstractValue {
        self.atom.aval()
    }
}

#[derive(PartialEq, Eq, Hash)]
enum ConstKey {
    Slot(u64),
    Ptr(usize),
}

/// Accumulates equations while a function is being staged.
pub(crate) struct JaxprBuilder {
    eqns: Vec<JaxprEqn>,
    lambda_binders: Vec<Var>,
    const_vars: Vec<Var>,
    const_vals: Vec<Value>,
    const_keys: HashMap<ConstKey, Var>,
}

impl JaxprBuilder {
    fn new() -> Self {
        JaxprBuilder {
            eqns: Vec::new(),
            lambda_binders: Vec::new(),
            const_vars: Vec::new(),
            const_vals: Vec::new(),
            const_keys: HashMap::new(),
        }
    }
}

/// Box a lower-level value into the staging trace: scalars become inline
/// literals, everything else becomes a hoisted constant.
pub(crate) fn lift(
    builder: &Rc<RefCell<JaxprBuilder>>,
    level: usize,
    value: &Value,
) -> Result<Value> {
    if let Some(array) = value.concrete() {
        if array.is_scalar() {
            let lit = super::jaxpr::Lit { value: array.item() };
            return Ok(Value::Jit(Rc::new(JitTracer { level, atom: Atom::Lit(lit) })));
        }
    }
    let key = match value {
        Value::Concrete(a) => ConstKey::Slot(a.slot().0),
        Value::Jvp(t) => ConstKey::Ptr(Rc::as_ptr(t) as usize),
        Value::PartialEval(t) => ConstKey::Ptr(Rc::as_ptr(t) as usize),
        Value::Jit(t) => ConstKey::Ptr(Rc::as_ptr(t) as usize),
    };
    let mut b = builder.borrow_mut();
    let var = match b.const_keys.get(&key) {
        Some(var) => var.clone(),
        None => {
            let var = Var::fresh(value.aval());
            b.const_keys.insert(key, var.clone());
            b.const_vars.push(var.clone());
            b.const_vals.push(value.clone());
            var
        }
    };
    Ok(Value::Jit(Rc::new(JitTracer { level, atom: Atom::Var(var) })))
}

/// Stage one primitive application as an equation.
pub(crate) fn process_primitive(
    builder: &Rc<RefCell<JaxprBuilder>>,
    level: usize,
    prim: &Primitive,
    tracers: &[Value],
) -> Result<Vec<Value>> {
    let inputs: Vec<Atom> = tracers
        .iter()
        .map(|v| match v {
            Value::Jit(t) => t.atom.clone(),
            other => panic!("non-jit tracer {:?} in staging trace", other),
        })
        .collect();
    let in_avals: Vec<AbstractValue> = inputs.iter().map(Atom::aval).collect();
    let out_avals = abstract_eval(prim, &in_avals)?;
    let out_binders: Vec<Var> = out_avals.into_iter().map(Var::fresh).collect();
    builder.borrow_mut().eqns.push(JaxprEqn {
        prim: prim.clone(),
        inputs,
        out_binders: out_binders.clone(),
    });
    Ok(out_binders
        .into_iter()
        .map(|var| Value::Jit(Rc::new(JitTracer { level, atom: Atom::Var(var) })))
        .collect())
}

/// Trace `f` over abstract inputs into a Jaxpr.
///
/// Returns the Jaxpr (hoisted-constant binders first) and the constant
/// values in binder order.
pub fn make_jaxpr<F>(f: F, in_avals: &[AbstractValue]) -> Result<(Arc<Jaxpr>, Vec<Value>)>
where
    F: FnOnce(&[Value]) -> Vec<Value>,
{
    let builder = Rc::new(RefCell::new(JaxprBuilder::new()));
    let guard = new_main(TraceKind::Jit(builder.clone()));
    let level = guard.level();
    let _dynamic = set_dynamic(level);

    let args: Vec<Value> = in_avals
        .iter()
        .map(|aval| {
            let var = Var::fresh(aval.clone());
            builder.borrow_mut().lambda_binders.push(var.clone());
            Value::Jit(Rc::new(JitTracer { level, atom: Atom::Var(var) }))
        })
        .collect();
    let outs = f(&args);
    let kind = TraceKind::Jit(builder.clone());
    let out_atoms: Vec<Atom> = outs
        .iter()
        .map(|out| match super::full_raise(&kind, level, out)? {
            Value::Jit(t) => Ok(t.atom.clone()),
            other => panic!("raise into staging produced {:?}", other),
        })
        .collect::<Result<_>>()?;
    drop(kind);

    let b = builder.borrow();
    let mut in_binders = b.const_vars.clone();
    in_binders.extend(b.lambda_binders.iter().cloned());
    let jaxpr = Jaxpr { in_binders, eqns: b.eqns.clone(), outs: out_atoms };
    debug_assert!(super::typecheck_jaxpr(&jaxpr).is_ok(), "staged jaxpr fails typecheck");
    Ok((Arc::new(jaxpr), b.const_vals.clone()))
}

/// A JIT-wrapped function: traced once per input-signature, compiled once
/// per backend, cached for the process.
pub struct JitFn<F> {
    f: F,
    traced: RefCell<HashMap<Vec<AbstractValue>, (Arc<Jaxpr>, Vec<Value>)>>,
}

/// Wrap `f` for JIT execution.
///
/// Calling the wrapper with concrete arrays compiles (with fusion) and
/// runs the program; calling it with tracers stages a `jit_call` equation
/// into the outer trace.
///
/// # Examples
///
/// ```
/// # use microjax::{jit, Array, Shape, Value};
/// let f = jit(|args: &[Value]| vec![args[0].sin().mul(&args[0].cos())]);
/// let x = Value::from(Array::from_vec(vec![0.5, 1.0], Shape::new(vec![2])));
/// let y = f.call(&[x]).unwrap();
/// assert_eq!(y[0].aval().shape.as_slice(), &[2]);
/// ```
pub fn jit<F>(f: F) -> JitFn<F>
where
    F: Fn(&[Value]) -> Vec<Value>,
{
    JitFn { f, traced: RefCell::new(HashMap::new()) }
}

impl<F> JitFn<F>
where
    F: Fn(&[Value]) -> Vec<Value>,
{
    /// Invoke the wrapped function.
    pub fn call(&self, args: &[Value]) -> Result<Vec<Value>> {
        let avals: Vec<AbstractValue> = args.iter().map(Value::aval).collect();
        let cached = self.traced.borrow().get(&avals).cloned();
        let (jaxpr, consts) = match cached {
            Some(entry) => entry,
            None => {
                let entry = make_jaxpr(|xs| (self.f)(xs), &avals)?;
                // Constants captured from an enclosing trace must not
                // outlive it; only tracer-free traces are cacheable.
                if entry.1.iter().all(|v| v.level() == 0) {
                    self.traced.borrow_mut().insert(avals, entry.clone());
                }
                entry
            }
        };

        let all_concrete = super::dynamic_level().is_none()
            && args.iter().all(|v| v.level() == 0)
            && consts.iter().all(|v| v.level() == 0);
        if all_concrete {
            let const_arrays: Vec<Array> = consts
                .iter()
                .map(|v| v.expect_concrete().cloned())
                .collect::<Result<_>>()?;
            let arg_arrays: Vec<Array> = args
                .iter()
                .map(|v| v.expect_concrete().cloned())
                .collect::<Result<_>>()?;
            let backend = arg_arrays
                .first()
                .or(const_arrays.first())
                .map(|a| a.backend().clone())
                .unwrap_or_else(default_backend);
            let program = compile(&jaxpr, &const_arrays, backend)?;
            let outs = program.execute(&arg_arrays)?;
            Ok(outs.into_iter().map(Value::Concrete).collect())
        } else {
            let mut call_args = consts.clone();
            call_args.extend(args.iter().cloned());
            super::bind(
                Primitive::JitCall { jaxpr: jaxpr.clone(), num_consts: consts.len() },
                &call_args,
            )
        }
    }
}

/// Concrete eval of a `jit_call` equation.
pub(crate) fn eval_jit_call(
    jaxpr: &Arc<Jaxpr>,
    num_consts: usize,
    args: &[&Array],
) -> Result<Vec<Array>> {
    let backend = args
        .first()
        .map(|a| a.backend().clone())
        .unwrap_or_else(default_backend);
    let consts: Vec<Array> = args[..num_consts].iter().map(|a| (*a).clone()).collect();
    let rest: Vec<Array> = args[num_consts..].iter().map(|a| (*a).clone()).collect();
    let program = compile(jaxpr, &consts, backend)?;
    program.execute(&rest)
}

/// What a primitive's JIT rule produces: the kernel body, its output size,
/// and the reduction descriptor if any.
pub(crate) struct KernelBuild {
    pub exp: AluExp,
    pub size: usize,
    pub reduction: Option<Reduction>,
}

/// Rebuild `exp` with every `GlobalView` read replaced through `f`.
fn map_views(
    exp: &AluExp,
    f: &dyn Fn(usize, DType, &ShapeTracker) -> Result<AluExp>,
) -> Result<AluExp> {
    use crate::alu::AluOp;
    match exp.op() {
        AluOp::GlobalView { gid, tracker } => f(*gid, exp.dtype(), tracker),
        _ if exp.src().is_empty() => Ok(exp.clone()),
        _ => {
            let src: Vec<AluExp> = exp
                .src()
                .iter()
                .map(|s| map_views(s, f))
                .collect::<Result<_>>()?;
            Ok(exp.with_src(src))
        }
    }
}

/// The per-primitive JIT rule: build the kernel body from the inputs'
/// expressions. Each input expression reads at the logical position of its
/// own shape; the rule rebases trackers and indices as needed.
pub(crate) fn jit_rule(
    prim: &Primitive,
    inputs: &[AluExp],
    in_avals: &[AbstractValue],
    out_aval: &AbstractValue,
) -> Result<KernelBuild> {
    let out_shape = out_aval.shape.as_slice().to_vec();
    let out_size = out_aval.size();

    // Rebase one input expression onto the (broadcast) output shape.
    let rebase = |exp: &AluExp| -> Result<AluExp> {
        let gidx = AluExp::special(GIDX, out_size.max(1) as i64);
        map_views(exp, &|gid, dtype, tracker| {
            let rebased = tracker.broadcast_to(&out_shape)?;
            let indices = unravel_alu(&out_shape, &gidx)?;
            AluExp::global_view(gid, dtype, rebased, indices)
        })
    };

    // Apply a view transform, reindexing by the new logical shape.
    let view_rule = |exp: &AluExp,
                     f: &dyn Fn(&ShapeTracker) -> Result<ShapeTracker>|
     -> Result<KernelBuild> {
        let gidx = AluExp::special(GIDX, out_size.max(1) as i64);
        let exp = map_views(exp, &|gid, dtype, tracker| {
            let transformed = f(tracker)?;
            let indices = unravel_alu(&out_shape, &gidx)?;
            AluExp::global_view(gid, dtype, transformed, indices)
        })?;
        Ok(KernelBuild { exp, size: out_size, reduction: None })
    };

    match prim {
        Primitive::Add => {
            let exp = AluExp::add(rebase(&inputs[0])?, rebase(&inputs[1])?)?;
            Ok(KernelBuild { exp, size: out_size, reduction: None })
        }
        Primitive::Mul => {
            let exp = AluExp::mul(rebase(&inputs[0])?, rebase(&inputs[1])?)?;
            Ok(KernelBuild { exp, size: out_size, reduction: None })
        }
        Primitive::Neg => {
            let exp = AluExp::neg(rebase(&inputs[0])?)?;
            Ok(KernelBuild { exp, size: out_size, reduction: None })
        }
        Primitive::Sin => {
            let exp = AluExp::sin(rebase(&inputs[0])?)?;
            Ok(KernelBuild { exp, size: out_size, reduction: None })
        }
        Primitive::Cos => {
            let exp = AluExp::cos(rebase(&inputs[0])?)?;
            Ok(KernelBuild { exp, size: out_size, reduction: None })
        }
        Primitive::Exp => {
            let exp = AluExp::exp(rebase(&inputs[0])?)?;
            Ok(KernelBuild { exp, size: out_size, reduction: None })
        }
        Primitive::Log => {
            let exp = AluExp::log(rebase(&inputs[0])?)?;
            Ok(KernelBuild { exp, size: out_size, reduction: None })
        }
        Primitive::Sqrt => {
            let exp = AluExp::sqrt(rebase(&inputs[0])?)?;
            Ok(KernelBuild { exp, size: out_size, reduction: None })
        }
        Primitive::Reciprocal => {
            let exp = AluExp::reciprocal(rebase(&inputs[0])?)?;
            Ok(KernelBuild { exp, size: out_size, reduction: None })
        }
        Primitive::Compare { op } => {
            let a = rebase(&inputs[0])?;
            let b = rebase(&inputs[1])?;
            let exp = match op {
                super::jaxpr::CompareOp::Lt => AluExp::cmplt(a, b)?,
                super::jaxpr::CompareOp::Eq => AluExp::cmpeq(a, b)?,
                super::jaxpr::CompareOp::Ne => AluExp::cmpne(a, b)?,
            };
            Ok(KernelBuild { exp, size: out_size, reduction: None })
        }
        Primitive::Where => {
            let exp = AluExp::where_(
                rebase(&inputs[0])?,
                rebase(&inputs[1])?,
                rebase(&inputs[2])?,
            )?;
            Ok(KernelBuild { exp, size: out_size, reduction: None })
        }
        Primitive::ReduceSum { axes } => {
            let in_shape = in_avals[0].shape.as_slice();
            let kept: Vec<usize> =
                (0..in_shape.len()).filter(|k| !axes.contains(k)).collect();
            let kept_size: usize = kept.iter().map(|&k| in_shape[k]).product();
            let red_size: usize = axes.iter().map(|&k| in_shape[k]).product();
            let mut perm = kept.clone();
            perm.extend(axes.iter().copied());
            let gidx = AluExp::special(GIDX, kept_size.max(1) as i64);
            let ridx = AluExp::special(RIDX, red_size.max(1) as i64);
            // Kept axes ahead of reduced axes, then collapse both groups.
            let exp = map_views(&inputs[0], &|gid, dtype, tracker| {
                let reduced = tracker.permute(&perm)?.reshape(&[kept_size, red_size])?;
                AluExp::global_view(gid, dtype, reduced, vec![gidx.clone(), ridx.clone()])
            })?;
            Ok(KernelBuild {
                exp,
                size: kept_size,
                reduction: Some(Reduction {
                    dtype: out_aval.dtype,
                    op: ReduceOp::Add,
                    size: red_size.max(1),
                }),
            })
        }
        Primitive::Transpose { perm } => view_rule(&inputs[0], &|t| t.permute(perm)),
        Primitive::Reshape { shape } => view_rule(&inputs[0], &|t| t.reshape(shape)),
        Primitive::Broadcast { shape, axes } => {
            view_rule(&inputs[0], &|t| t.broadcast(shape, axes))
        }
        Primitive::Flip { axes } => view_rule(&inputs[0], &|t| t.flip(axes)),
        Primitive::RandomBits { .. } | Primitive::JitCall { .. } => Err(Error::Type(format!(
            "{} has no kernel rule",
            prim.name()
        ))),
    }
}

type ProgId = usize;

enum Step {
    Malloc { id: ProgId, byte_size: usize },
    Const { id: ProgId, index: usize },
    Execute { kernel: TunedKernel, inputs: Vec<ProgId>, output: ProgId },
    Random { id: ProgId, key: ProgId, size: usize },
    Free { id: ProgId },
}

/// A compiled Jaxpr: a linear step program over backend slots.
pub struct JitProgram {
    steps: Vec<Step>,
    consts: Vec<Array>,
    num_consts: usize,
    arg_avals: Vec<AbstractValue>,
    outputs: Vec<(ProgId, AbstractValue)>,
    backend: Arc<dyn Backend>,
}

enum VarState {
    Imm(ProgId),
    Fused { exp: AluExp, srcs: Vec<ProgId> },
}

fn gid_of(srcs: &mut Vec<ProgId>, pid: ProgId) -> usize {
    match srcs.iter().position(|&p| p == pid) {
        Some(pos) => pos,
        None => {
            srcs.push(pid);
            srcs.len() - 1
        }
    }
}

fn whole_array_view(gid: usize, aval: &AbstractValue) -> Result<AluExp> {
    let shape = aval.shape.as_slice();
    let tracker = ShapeTracker::contiguous(shape);
    let gidx = AluExp::special(GIDX, aval.size().max(1) as i64);
    let indices = unravel_alu(shape, &gidx)?;
    AluExp::global_view(gid, aval.dtype, tracker, indices)
}

static COMPILE_CACHE: OnceLock<Mutex<HashMap<(String, u64), Arc<JitProgram>>>> =
    OnceLock::new();

/// Compile a Jaxpr (with its hoisted constants) for `backend`, with
/// process-lifetime caching keyed by backend kind, program fingerprint,
/// and constant identities.
pub fn compile(
    jaxpr: &Jaxpr,
    consts: &[Array],
    backend: Arc<dyn Backend>,
) -> Result<Arc<JitProgram>> {
    let mut h = FpHash::new(17);
    h.push(jaxpr.fingerprint());
    for c in consts {
        h.push(c.slot().0);
    }
    let key = (backend.kind().to_string(), h.finish());
    let cache = COMPILE_CACHE.get_or_init(|| Mutex::new(HashMap::new()));
    if let Some(hit) = cache.lock().unwrap().get(&key) {
        trace!("compile cache hit for {:?}", key);
        return Ok(hit.clone());
    }
    let jaxpr = jaxpr.flatten().simplify();
    let program = Arc::new(emit(&jaxpr, consts, backend)?);
    cache.lock().unwrap().insert(key, program.clone());
    Ok(program)
}

fn emit(jaxpr: &Jaxpr, consts: &[Array], backend: Arc<dyn Backend>) -> Result<JitProgram> {
    let num_consts = consts.len();
    if num_consts > jaxpr.in_binders.len() {
        return Err(Error::Type("more constants than binders".to_string()));
    }

    // Dataflow analysis: find the black (materialized) equations.
    let mut out_vars: HashSet<u64> = HashSet::new();
    for out in &jaxpr.outs {
        if let Atom::Var(v) = out {
            out_vars.insert(v.id);
        }
    }
    let mut consumers: HashMap<u64, Vec<usize>> = HashMap::new();
    for (i, eqn) in jaxpr.eqns.iter().enumerate() {
        for input in &eqn.inputs {
            if let Atom::Var(v) = input {
                consumers.entry(v.id).or_default().push(i);
            }
        }
    }
    let n = jaxpr.eqns.len();
    let mut black = vec![false; n];
    let mut sinks: Vec<HashSet<usize>> = vec![HashSet::new(); n];
    for i in (0..n).rev() {
        let eqn = &jaxpr.eqns[i];
        let forced = matches!(
            eqn.prim,
            Primitive::ReduceSum { .. } | Primitive::RandomBits { .. }
        );
        let used_in_outs = eqn.out_binders.iter().any(|b| out_vars.contains(&b.id));
        let mut sink_set: HashSet<usize> = HashSet::new();
        for binder in &eqn.out_binders {
            for &c in consumers.get(&binder.id).into_iter().flatten() {
                if black[c] {
                    sink_set.insert(c);
                } else {
                    sink_set.extend(sinks[c].iter().copied());
                }
            }
        }
        black[i] = forced || used_in_outs || sink_set.len() >= 2;
        sinks[i] = if black[i] { HashSet::from([i]) } else { sink_set };
        debug!(
            "fusion: eqn {} ({}) {}",
            i,
            eqn.prim.name(),
            if black[i] { "black" } else { "fused" }
        );
    }

    // Step emission.
    let mut steps: Vec<Step> = Vec::new();
    let mut state: HashMap<u64, VarState> = HashMap::new();
    let mut next_id: ProgId = jaxpr.in_binders.len();
    let mut extra_consts: Vec<Array> = Vec::new();

    for (pid, binder) in jaxpr.in_binders.iter().enumerate() {
        state.insert(binder.id, VarState::Imm(pid));
        if pid < num_consts {
            steps.push(Step::Const { id: pid, index: pid });
        }
    }

    // Materialize a fused expression into its own buffer (used when a step
    // needs a real slot, e.g. a PRNG key).
    let mut force_imm = |var: &Var,
                         state: &mut HashMap<u64, VarState>,
                         steps: &mut Vec<Step>,
                         next_id: &mut ProgId|
     -> Result<ProgId> {
        let (exp, srcs) = match state.get(&var.id) {
            Some(VarState::Imm(pid)) => return Ok(*pid),
            Some(VarState::Fused { exp, srcs }) => (exp.clone(), srcs.clone()),
            None => panic!("unbound v{} during step emission", var.id),
        };
        let kernel = Kernel {
            nargs: srcs.len(),
            size: var.aval.size(),
            exp,
            reduction: None,
        };
        let tuned = tune(&kernel)?;
        let out = *next_id;
        *next_id += 1;
        steps.push(Step::Malloc { id: out, byte_size: var.aval.byte_size() });
        steps.push(Step::Execute { kernel: tuned, inputs: srcs, output: out });
        state.insert(var.id, VarState::Imm(out));
        Ok(out)
    };

    for (i, eqn) in jaxpr.eqns.iter().enumerate() {
        if let Primitive::RandomBits { shape } = &eqn.prim {
            let key_var = match &eqn.inputs[0] {
                Atom::Var(v) => v,
                Atom::Lit(_) => {
                    return Err(Error::Type("random_bits key cannot be a literal".to_string()))
                }
            };
            let key_pid = force_imm(key_var, &mut state, &mut steps, &mut next_id)?;
            let out = next_id;
            next_id += 1;
            let size: usize = shape.iter().product();
            steps.push(Step::Random { id: out, key: key_pid, size });
            let binder = &eqn.out_binders[0];
            state.insert(binder.id, VarState::Imm(out));
            continue;
        }

        let mut srcs: Vec<ProgId> = Vec::new();
        let mut exprs: Vec<AluExp> = Vec::with_capacity(eqn.inputs.len());
        let mut in_avals: Vec<AbstractValue> = Vec::with_capacity(eqn.inputs.len());
        for input in &eqn.inputs {
            in_avals.push(input.aval());
            match input {
                Atom::Lit(l) => exprs.push(AluExp::constant(l.value)),
                Atom::Var(v) => match state.get(&v.id) {
                    Some(VarState::Imm(pid)) => {
                        let gid = gid_of(&mut srcs, *pid);
                        exprs.push(whole_array_view(gid, &v.aval)?);
                    }
                    Some(VarState::Fused { exp, srcs: fsrcs }) => {
                        let map: HashMap<usize, usize> = fsrcs
                            .iter()
                            .enumerate()
                            .map(|(j, &pid)| (j, gid_of(&mut srcs, pid)))
                            .collect();
                        exprs.push(exp.reindex_gids(&map));
                    }
                    None => panic!("unbound v{} during step emission", v.id),
                },
            }
        }

        let binder = &eqn.out_binders[0];
        let build = jit_rule(&eqn.prim, &exprs, &in_avals, &binder.aval)?;
        if black[i] {
            let kernel = Kernel {
                nargs: srcs.len(),
                size: build.size,
                exp: build.exp,
                reduction: build.reduction,
            };
            let tuned = tune(&kernel)?;
            let out = next_id;
            next_id += 1;
            steps.push(Step::Malloc { id: out, byte_size: binder.aval.byte_size() });
            steps.push(Step::Execute { kernel: tuned, inputs: srcs, output: out });
            state.insert(binder.id, VarState::Imm(out));
        } else {
            state.insert(binder.id, VarState::Fused { exp: build.exp, srcs });
        }
    }

    // Program outputs; literal outputs become bound constants.
    let mut outputs: Vec<(ProgId, AbstractValue)> = Vec::new();
    for out in &jaxpr.outs {
        match out {
            Atom::Var(v) => match state.get(&v.id) {
                Some(VarState::Imm(pid)) => outputs.push((*pid, v.aval.clone())),
                _ => panic!("program output v{} was not materialized", v.id),
            },
            Atom::Lit(l) => {
                let array = alloc_const(&backend, l.value)?;
                let pid = next_id;
                next_id += 1;
                steps.push(Step::Const { id: pid, index: num_consts + extra_consts.len() });
                extra_consts.push(array);
                outputs.push((pid, out.aval()));
            }
        }
    }

    // Free each owned intermediate after its last use.
    let owned: HashSet<ProgId> = steps
        .iter()
        .filter_map(|s| match s {
            Step::Malloc { id, .. } | Step::Random { id, .. } => Some(*id),
            _ => None,
        })
        .collect();
    let out_ids: HashSet<ProgId> = outputs.iter().map(|(pid, _)| *pid).collect();
    let mut last_use: HashMap<ProgId, usize> = HashMap::new();
    for (idx, step) in steps.iter().enumerate() {
        match step {
            Step::Execute { inputs, output, .. } => {
                for pid in inputs {
                    last_use.insert(*pid, idx);
                }
                last_use.insert(*output, idx);
            }
            Step::Random { id, key, .. } => {
                last_use.insert(*key, idx);
                last_use.insert(*id, idx);
            }
            _ => {}
        }
    }
    let mut final_steps: Vec<Step> = Vec::with_capacity(steps.len());
    for (idx, step) in steps.into_iter().enumerate() {
        final_steps.push(step);
        let freed: Vec<ProgId> = owned
            .iter()
            .copied()
            .filter(|pid| !out_ids.contains(pid) && last_use.get(pid) == Some(&idx))
            .collect();
        for pid in freed {
            final_steps.push(Step::Free { id: pid });
        }
    }

    let mut all_consts: Vec<Array> = consts.to_vec();
    all_consts.extend(extra_consts);
    let arg_avals: Vec<AbstractValue> = jaxpr.in_binders[num_consts..]
        .iter()
        .map(|b| b.aval.clone())
        .collect();
    debug!(
        "compiled program: {} steps, {} execute",
        final_steps.len(),
        final_steps
            .iter()
            .filter(|s| matches!(s, Step::Execute { .. }))
            .count()
    );
    Ok(JitProgram {
        steps: final_steps,
        consts: all_consts,
        num_consts,
        arg_avals,
        outputs,
        backend,
    })
}

fn alloc_const(backend: &Arc<dyn Backend>, value: crate::Scalar) -> Result<Array> {
    let aval = AbstractValue::scalar(value.dtype());
    let mut bytes = Vec::with_capacity(aval.byte_size());
    crate::backend::cpu::write_scalar(&mut bytes, value);
    let slot = backend.malloc(bytes.len(), Some(&bytes))?;
    Ok(Array::from_parts(slot, aval, backend.clone()))
}

impl JitProgram {
    /// Number of kernel dispatches in the program.
    pub fn num_executes(&self) -> usize {
        self.steps
            .iter()
            .filter(|s| matches!(s, Step::Execute { .. }))
            .count()
    }

    /// Number of intermediate frees in the program.
    pub fn num_frees(&self) -> usize {
        self.steps.iter().filter(|s| matches!(s, Step::Free { .. })).count()
    }

    /// Play back the steps over `args`, returning the output arrays.
    pub fn execute(&self, args: &[Array]) -> Result<Vec<Array>> {
        if args.len() != self.arg_avals.len() {
            return Err(Error::Type(format!(
                "program expects {} arguments, got {}",
                self.arg_avals.len(),
                args.len()
            )));
        }
        for (arg, aval) in args.iter().zip(self.arg_avals.iter()) {
            if arg.aval() != aval {
                return Err(Error::Type(format!(
                    "argument {} does not match traced {}",
                    arg.aval(),
                    aval
                )));
            }
        }
        let mut slots: HashMap<ProgId, Slot> = HashMap::new();
        for (i, arg) in args.iter().enumerate() {
            slots.insert(self.num_consts + i, arg.slot());
        }
        let mut owned: HashSet<ProgId> = HashSet::new();
        let result = self.run_steps(&mut slots, &mut owned);
        if result.is_err() {
            for pid in owned.drain() {
                if let Some(slot) = slots.get(&pid) {
                    let _ = self.backend.dec_ref(*slot);
                }
            }
        }
        result?;

        let mut outs = Vec::with_capacity(self.outputs.len());
        for (pid, aval) in &self.outputs {
            let slot = *slots
                .get(pid)
                .unwrap_or_else(|| panic!("program output id {} has no slot", pid));
            if owned.remove(pid) {
                outs.push(Array::from_parts(slot, aval.clone(), self.backend.clone()));
            } else {
                self.backend.inc_ref(slot)?;
                outs.push(Array::from_parts(slot, aval.clone(), self.backend.clone()));
            }
        }
        // Anything still owned was neither freed nor returned.
        for pid in owned {
            if let Some(slot) = slots.get(&pid) {
                let _ = self.backend.dec_ref(*slot);
            }
        }
        Ok(outs)
    }

    fn run_steps(
        &self,
        slots: &mut HashMap<ProgId, Slot>,
        owned: &mut HashSet<ProgId>,
    ) -> Result<()> {
        for step in &self.steps {
            match step {
                Step::Malloc { id, byte_size } => {
                    let slot = self.backend.malloc(*byte_size, None)?;
                    slots.insert(*id, slot);
                    owned.insert(*id);
                }
                Step::Const { id, index } => {
                    slots.insert(*id, self.consts[*index].slot());
                }
                Step::Execute { kernel, inputs, output } => {
                    let in_slots: Vec<Slot> =
                        inputs.iter().map(|pid| slots[pid]).collect();
                    let out_slot = slots[output];
                    self.backend
                        .execute_sync(kernel, &in_slots, &[out_slot], None)?;
                }
                Step::Random { id, key, size } => {
                    let key_bytes = self.backend.read_sync(slots[key], 0, None)?;
                    let bytes = crate::random::bits_bytes_from_key(&key_bytes, *size)?;
                    let slot = self.backend.malloc(bytes.len(), Some(&bytes))?;
                    slots.insert(*id, slot);
                    owned.insert(*id);
                }
                Step::Free { id } => {
                    if owned.remove(id) {
                        if let Some(slot) = slots.remove(id) {
                            self.backend.dec_ref(slot)?;
                        }
                    }
                }
            }
        }
        Ok(())
    }
}
