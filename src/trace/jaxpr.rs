//! Typed equation-form IR in SSA style.
//!
//! A [`Jaxpr`] is a lambda: input binders, a list of primitive equations,
//! and output atoms. Every binder carries exactly one abstract value, and
//! [`typecheck_jaxpr`] re-derives each equation's output types from its
//! primitive's abstract-eval rule.

use crate::error::{Error, Result};
use crate::utils::FpHash;
use crate::{AbstractValue, DType, Scalar, Shape};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Comparison flavor of the `Compare` primitive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompareOp {
    /// Less-than.
    Lt,
    /// Equality.
    Eq,
    /// Inequality.
    Ne,
}

impl CompareOp {
    /// Printed primitive name.
    pub fn name(self) -> &'static str {
        match self {
            CompareOp::Lt => "lt",
            CompareOp::Eq => "eq",
            CompareOp::Ne => "ne",
        }
    }
}

/// The closed primitive set.
///
/// Parameters ride on the variant, the way the equations carry them.
#[derive(Debug, Clone)]
pub enum Primitive {
    /// Elementwise addition (broadcasting).
    Add,
    /// Elementwise multiplication (broadcasting).
    Mul,
    /// Elementwise negation.
    Neg,
    /// Elementwise sine.
    Sin,
    /// Elementwise cosine.
    Cos,
    /// Elementwise natural exponential.
    Exp,
    /// Elementwise natural logarithm.
    Log,
    /// Elementwise square root.
    Sqrt,
    /// Elementwise reciprocal.
    Reciprocal,
    /// Sum-reduction over `axes`.
    ReduceSum {
        /// Axes to reduce, strictly increasing.
        axes: Vec<usize>,
    },
    /// Elementwise comparison, yields `bool`.
    Compare {
        /// Which comparison.
        op: CompareOp,
    },
    /// Ternary select `where(cond, x, y)`.
    Where,
    /// Axis permutation.
    Transpose {
        /// `out.shape[k] = in.shape[perm[k]]`.
        perm: Vec<usize>,
    },
    /// Broadcast to `shape`; `axes` are the output positions that are new.
    /// Remaining positions map to input axes in order and may widen from 1.
    Broadcast {
        /// Output shape.
        shape: Vec<usize>,
        /// Inserted output positions.
        axes: Vec<usize>,
    },
    /// Same-size reinterpretation of the shape.
    Reshape {
        /// Output shape.
        shape: Vec<usize>,
    },
    /// Reverse the axes marked true.
    Flip {
        /// Per-axis flip flags.
        axes: Vec<bool>,
    },
    /// Counter-based uniform `uint32` bits from a PRNG key.
    RandomBits {
        /// Output shape.
        shape: Vec<usize>,
    },
    /// Call of a traced subprogram. The first `num_consts` inputs are the
    /// hoisted constants of `jaxpr`.
    JitCall {
        /// The inner program.
        jaxpr: Arc<Jaxpr>,
        /// Leading inputs that are hoisted constants.
        num_consts: usize,
    },
}

impl Primitive {
    /// Printed primitive name.
    pub fn name(&self) -> &'static str {
        match self {
            Primitive::Add => "add",
            Primitive::Mul => "mul",
            Primitive::Neg => "neg",
            Primitive::Sin => "sin",
            Primitive::Cos => "cos",
            Primitive::Exp => "exp",
            Primitive::Log => "log",
            Primitive::Sqrt => "sqrt",
            Primitive::Reciprocal => "reciprocal",
            Primitive::ReduceSum { .. } => "reduce_sum",
            Primitive::Compare { op } => op.name(),
            Primitive::Where => "where",
            Primitive::Transpose { .. } => "transpose",
            Primitive::Broadcast { .. } => "broadcast",
            Primitive::Reshape { .. } => "reshape",
            Primitive::Flip { .. } => "flip",
            Primitive::RandomBits { .. } => "random_bits",
            Primitive::JitCall { .. } => "jit_call",
        }
    }

    /// Fold the primitive (name and parameters) into a fingerprint.
    pub fn fingerprint_into(&self, h: &mut FpHash) {
        h.push_str(self.name());
        match self {
            Primitive::ReduceSum { axes } => {
                for &a in axes {
                    h.push(a as u64);
                }
            }
            Primitive::Transpose { perm } => {
                for &p in perm {
                    h.push(p as u64);
                }
            }
            Primitive::Broadcast { shape, axes } => {
                for &d in shape {
                    h.push(d as u64);
                }
                h.push(u64::MAX);
                for &a in axes {
                    h.push(a as u64);
                }
            }
            Primitive::Reshape { shape } | Primitive::RandomBits { shape } => {
                for &d in shape {
                    h.push(d as u64);
                }
            }
            Primitive::Flip { axes } => {
                for &a in axes {
                    h.push(a as u64);
                }
            }
            Primitive::JitCall { jaxpr, num_consts } => {
                h.push(jaxpr.fingerprint());
                h.push(*num_consts as u64);
            }
            _ => {}
        }
    }

    /// Equality used by CSE and tests; `JitCall` compares by fingerprint.
    pub fn same_as(&self, other: &Primitive) -> bool {
        let mut ha = FpHash::new(11);
        self.fingerprint_into(&mut ha);
        let mut hb = FpHash::new(11);
        other.fingerprint_into(&mut hb);
        ha.finish() == hb.finish()
    }
}

static VAR_COUNTER: AtomicU64 = AtomicU64::new(1);

/// A unique binder with its abstract value. Identity is the id; two `Var`s
/// with the same id are the same binder.
#[derive(Debug, Clone)]
pub struct Var {
    /// Globally unique id.
    pub id: u64,
    /// Abstract value bound by this binder.
    pub aval: AbstractValue,
}

impl Var {
    /// Allocate a fresh binder.
    pub fn fresh(aval: AbstractValue) -> Var {
        Var { id: VAR_COUNTER.fetch_add(1, Ordering::Relaxed), aval }
    }
}

impl PartialEq for Var {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Var {}

impl std::hash::Hash for Var {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

/// A scalar literal inlined into an equation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Lit {
    /// The literal value.
    pub value: Scalar,
}

impl Lit {
    /// The literal's abstract value (always scalar-shaped).
    pub fn aval(&self) -> AbstractValue {
        AbstractValue::scalar(self.value.dtype())
    }
}

/// An equation or output operand: a bound variable or an inline literal.
#[derive(Debug, Clone)]
pub enum Atom {
    /// Reference to a binder.
    Var(Var),
    /// Inline scalar literal.
    Lit(Lit),
}

impl Atom {
    /// Abstract value of the operand.
    pub fn aval(&self) -> AbstractValue {
        match self {
            Atom::Var(v) => v.aval.clone(),
            Atom::Lit(l) => l.aval(),
        }
    }
}

/// One SSA equation: `out_binders = prim(inputs)`.
#[derive(Debug, Clone)]
pub struct JaxprEqn {
    /// The primitive applied (with its parameters).
    pub prim: Primitive,
    /// Input operands.
    pub inputs: Vec<Atom>,
    /// Outputs bound by this equation.
    pub out_binders: Vec<Var>,
}

/// A typed program: `{ lambda in_binders . let eqns in ( outs ) }`.
#[derive(Debug, Clone)]
pub struct Jaxpr {
    /// Input binders (hoisted constants first when produced by tracing).
    pub in_binders: Vec<Var>,
    /// Equations in program order.
    pub eqns: Vec<JaxprEqn>,
    /// Output operands.
    pub outs: Vec<Atom>,
}

/// Shape/dtype propagation rule for one primitive application.
pub fn abstract_eval(prim: &Primitive, in_avals: &[AbstractValue]) -> Result<Vec<AbstractValue>> {
    let arity_err = |want: usize| {
        Error::Type(format!("{} expects {} inputs, got {}", prim.name(), want, in_avals.len()))
    };
    let broadcast_shapes = |avals: &[AbstractValue]| -> Result<Shape> {
        let mut shape = avals[0].shape.clone();
        for a in &avals[1..] {
            shape = shape.broadcast_with(&a.shape).ok_or_else(|| {
                Error::Type(format!(
                    "shapes {} and {} do not broadcast",
                    shape, a.shape
                ))
            })?;
        }
        Ok(shape)
    };
    match prim {
        Primitive::Add | Primitive::Mul => {
            if in_avals.len() != 2 {
                return Err(arity_err(2));
            }
            // Lenient dtype rule: the first operand decides.
            let shape = broadcast_shapes(in_avals)?;
            Ok(vec![AbstractValue::new(shape, in_avals[0].dtype)])
        }
        Primitive::Neg => {
            if in_avals.len() != 1 {
                return Err(arity_err(1));
            }
            if !in_avals[0].dtype.is_numeric() {
                return Err(Error::Type(format!("neg does not accept {}", in_avals[0].dtype)));
            }
            Ok(vec![in_avals[0].clone()])
        }
        Primitive::Sin
        | Primitive::Cos
        | Primitive::Exp
        | Primitive::Log
        | Primitive::Sqrt
        | Primitive::Reciprocal => {
            if in_avals.len() != 1 {
                return Err(arity_err(1));
            }
            if !in_avals[0].dtype.is_float() {
                return Err(Error::Type(format!(
                    "{} requires a float operand, got {}",
                    prim.name(),
                    in_avals[0].dtype
                )));
            }
            Ok(vec![in_avals[0].clone()])
        }
        Primitive::ReduceSum { axes } => {
            if in_avals.len() != 1 {
                return Err(arity_err(1));
            }
            let ndim = in_avals[0].shape.ndim();
            let mut seen = HashSet::new();
            for &a in axes {
                if a >= ndim || !seen.insert(a) {
                    return Err(Error::Type(format!(
                        "invalid reduce axes {:?} for rank {}",
                        axes, ndim
                    )));
                }
            }
            let dims: Vec<usize> = in_avals[0]
                .shape
                .as_slice()
                .iter()
                .enumerate()
                .filter(|(k, _)| !axes.contains(k))
                .map(|(_, &d)| d)
                .collect();
            Ok(vec![AbstractValue::new(Shape::new(dims), in_avals[0].dtype)])
        }
        Primitive::Compare { .. } => {
            if in_avals.len() != 2 {
                return Err(arity_err(2));
            }
            let shape = broadcast_shapes(in_avals)?;
            Ok(vec![AbstractValue::new(shape, DType::Bool)])
        }
        Primitive::Where => {
            if in_avals.len() != 3 {
                return Err(arity_err(3));
            }
            if in_avals[0].dtype != DType::Bool {
                return Err(Error::Type(format!(
                    "where condition must be bool, got {}",
                    in_avals[0].dtype
                )));
            }
            let shape = broadcast_shapes(in_avals)?;
            Ok(vec![AbstractValue::new(shape, in_avals[1].dtype)])
        }
        Primitive::Transpose { perm } => {
            if in_avals.len() != 1 {
                return Err(arity_err(1));
            }
            let shape = in_avals[0].shape.as_slice();
            if perm.len() != shape.len() || !crate::utils::is_permutation(perm) {
                return Err(Error::Type(format!(
                    "invalid permutation {:?} for rank {}",
                    perm,
                    shape.len()
                )));
            }
            let dims: Vec<usize> = perm.iter().map(|&p| shape[p]).collect();
            Ok(vec![AbstractValue::new(Shape::new(dims), in_avals[0].dtype)])
        }
        Primitive::Broadcast { shape, axes } => {
            if in_avals.len() != 1 {
                return Err(arity_err(1));
            }
            let mut seen = HashSet::new();
            for &a in axes {
                if a >= shape.len() || !seen.insert(a) {
                    return Err(Error::Type(format!(
                        "invalid broadcast axes {:?} for output rank {}",
                        axes,
                        shape.len()
                    )));
                }
            }
            let in_shape = in_avals[0].shape.as_slice();
            let kept: Vec<usize> = (0..shape.len()).filter(|k| !axes.contains(k)).collect();
            if kept.len() != in_shape.len() {
                return Err(Error::Type(format!(
                    "broadcast of {} to {:?} adding {:?}: rank mismatch",
                    in_avals[0].shape, shape, axes
                )));
            }
            for (&pos, &d) in kept.iter().zip(in_shape.iter()) {
                if d != shape[pos] && d != 1 {
                    return Err(Error::Type(format!(
                        "broadcast of {} to {:?}: axis {} has size {}",
                        in_avals[0].shape, shape, pos, d
                    )));
                }
            }
            Ok(vec![AbstractValue::new(Shape::new(shape.clone()), in_avals[0].dtype)])
        }
        Primitive::Reshape { shape } => {
            if in_avals.len() != 1 {
                return Err(arity_err(1));
            }
            let new_size: usize = shape.iter().product();
            if new_size != in_avals[0].size() {
                return Err(Error::Type(format!(
                    "cannot reshape {} to {:?}",
                    in_avals[0], shape
                )));
            }
            Ok(vec![AbstractValue::new(Shape::new(shape.clone()), in_avals[0].dtype)])
        }
        Primitive::Flip { axes } => {
            if in_avals.len() != 1 {
                return Err(arity_err(1));
            }
            if axes.len() != in_avals[0].shape.ndim() {
                return Err(Error::Type(format!(
                    "flip expects {} axis flags, got {}",
                    in_avals[0].shape.ndim(),
                    axes.len()
                )));
            }
            Ok(vec![in_avals[0].clone()])
        }
        Primitive::RandomBits { shape } => {
            if in_avals.len() != 1 {
                return Err(arity_err(1));
            }
            let key = &in_avals[0];
            if key.dtype != DType::Uint32 || key.shape.as_slice().last() != Some(&2) {
                return Err(Error::Type(format!(
                    "random_bits expects a uint32[..,2] key, got {}",
                    key
                )));
            }
            Ok(vec![AbstractValue::new(Shape::new(shape.clone()), DType::Uint32)])
        }
        Primitive::JitCall { jaxpr, num_consts } => {
            if in_avals.len() != jaxpr.in_binders.len() {
                return Err(arity_err(jaxpr.in_binders.len()));
            }
            if *num_consts > in_avals.len() {
                return Err(Error::Type("jit_call num_consts exceeds inputs".to_string()));
            }
            for (got, binder) in in_avals.iter().zip(jaxpr.in_binders.iter()) {
                if *got != binder.aval {
                    return Err(Error::Type(format!(
                        "jit_call input {} does not match binder {}",
                        got, binder.aval
                    )));
                }
            }
            Ok(jaxpr.outs.iter().map(Atom::aval).collect())
        }
    }
}

/// Verify SSA scoping and re-derive every equation's output types.
pub fn typecheck_jaxpr(jaxpr: &Jaxpr) -> Result<()> {
    let mut bound: HashSet<u64> = HashSet::new();
    for binder in &jaxpr.in_binders {
        if !bound.insert(binder.id) {
            return Err(Error::Type(format!("duplicate binder v{}", binder.id)));
        }
    }
    for eqn in &jaxpr.eqns {
        let mut in_avals = Vec::with_capacity(eqn.inputs.len());
        for input in &eqn.inputs {
            if let Atom::Var(v) = input {
                if !bound.contains(&v.id) {
                    return Err(Error::Type(format!(
                        "variable v{} used before binding",
                        v.id
                    )));
                }
            }
            in_avals.push(input.aval());
        }
        let out_avals = abstract_eval(&eqn.prim, &in_avals)?;
        if out_avals.len() != eqn.out_binders.len() {
            return Err(Error::Type(format!(
                "{} produced {} outputs, equation binds {}",
                eqn.prim.name(),
                out_avals.len(),
                eqn.out_binders.len()
            )));
        }
        for (got, binder) in out_avals.iter().zip(eqn.out_binders.iter()) {
            if *got != binder.aval {
                return Err(Error::Type(format!(
                    "{} output {} does not match binder {}",
                    eqn.prim.name(),
                    got,
                    binder.aval
                )));
            }
            if !bound.insert(binder.id) {
                return Err(Error::Type(format!("duplicate binder v{}", binder.id)));
            }
        }
    }
    for out in &jaxpr.outs {
        if let Atom::Var(v) = out {
            if !bound.contains(&v.id) {
                return Err(Error::Type(format!("output v{} is unbound", v.id)));
            }
        }
    }
    Ok(())
}

impl Jaxpr {
    /// Abstract values of the outputs.
    pub fn out_avals(&self) -> Vec<AbstractValue> {
        self.outs.iter().map(Atom::aval).collect()
    }

    /// Inline every `jit_call` equation, producing an equivalent Jaxpr with
    /// no nested calls. Binders of inlined equations are freshened.
    pub fn flatten(&self) -> Jaxpr {
        let mut eqns: Vec<JaxprEqn> = Vec::with_capacity(self.eqns.len());
        // Substitution accumulated as call outputs collapse to inner atoms.
        let mut subst: HashMap<u64, Atom> = HashMap::new();
        let resolve = |subst: &HashMap<u64, Atom>, atom: &Atom| -> Atom {
            match atom {
                Atom::Var(v) => subst.get(&v.id).cloned().unwrap_or_else(|| atom.clone()),
                Atom::Lit(_) => atom.clone(),
            }
        };
        for eqn in &self.eqns {
            let inputs: Vec<Atom> = eqn.inputs.iter().map(|a| resolve(&subst, a)).collect();
            match &eqn.prim {
                Primitive::JitCall { jaxpr, .. } => {
                    let inner = jaxpr.flatten();
                    // Map inner binders to the call-site operands, clone the
                    // body with fresh binders.
                    let mut inner_env: HashMap<u64, Atom> = HashMap::new();
                    for (binder, arg) in inner.in_binders.iter().zip(inputs.iter()) {
                        inner_env.insert(binder.id, arg.clone());
                    }
                    for inner_eqn in &inner.eqns {
                        let mapped_inputs: Vec<Atom> = inner_eqn
                            .inputs
                            .iter()
                            .map(|a| match a {
                                Atom::Var(v) => inner_env
                                    .get(&v.id)
                                    .cloned()
                                    .unwrap_or_else(|| panic!("unbound inner v{}", v.id)),
                                Atom::Lit(_) => a.clone(),
                            })
                            .collect();
                        let fresh: Vec<Var> = inner_eqn
                            .out_binders
                            .iter()
                            .map(|b| {
                                let v = Var::fresh(b.aval.clone());
                                inner_env.insert(b.id, Atom::Var(v.clone()));
                                v
                            })
                            .collect();
                        eqns.push(JaxprEqn {
                            prim: inner_eqn.prim.clone(),
                            inputs: mapped_inputs,
                            out_binders: fresh,
                        });
                    }
                    for (call_out, inner_out) in eqn.out_binders.iter().zip(inner.outs.iter()) {
                        let atom = match inner_out {
                            Atom::Var(v) => inner_env
                                .get(&v.id)
                                .cloned()
                                .unwrap_or_else(|| panic!("unbound inner out v{}", v.id)),
                            Atom::Lit(_) => inner_out.clone(),
                        };
                        subst.insert(call_out.id, atom);
                    }
                }
                _ => {
                    eqns.push(JaxprEqn {
                        prim: eqn.prim.clone(),
                        inputs,
                        out_binders: eqn.out_binders.clone(),
                    });
                }
            }
        }
        let outs: Vec<Atom> = self.outs.iter().map(|a| resolve(&subst, a)).collect();
        Jaxpr { in_binders: self.in_binders.clone(), eqns, outs }
    }

    /// Dead-code elimination, scalar constant folding, and hash-consing of
    /// identical equations. Preserves observable semantics.
    pub fn simplify(&self) -> Jaxpr {
        let mut subst: HashMap<u64, Atom> = HashMap::new();
        let mut seen: HashMap<u64, Vec<Var>> = HashMap::new();
        let mut eqns: Vec<JaxprEqn> = Vec::new();
        let resolve = |subst: &HashMap<u64, Atom>, atom: &Atom| -> Atom {
            match atom {
                Atom::Var(v) => subst.get(&v.id).cloned().unwrap_or_else(|| atom.clone()),
                Atom::Lit(_) => atom.clone(),
            }
        };
        for eqn in &self.eqns {
            let inputs: Vec<Atom> = eqn.inputs.iter().map(|a| resolve(&subst, a)).collect();
            // Scalar constant folding.
            if eqn.out_binders.len() == 1 && eqn.out_binders[0].aval.shape.is_scalar() {
                let lits: Option<Vec<Scalar>> = inputs
                    .iter()
                    .map(|a| match a {
                        Atom::Lit(l) => Some(l.value),
                        Atom::Var(_) => None,
                    })
                    .collect();
                if let Some(lits) = lits {
                    if let Some(value) = fold_scalar(&eqn.prim, &lits) {
                        subst.insert(eqn.out_binders[0].id, Atom::Lit(Lit { value }));
                        continue;
                    }
                }
            }
            // Hash-consing: an identical earlier equation supplies the value.
            let key = eqn_key(&eqn.prim, &inputs);
            if let Some(prev_outs) = seen.get(&key) {
                for (binder, prev) in eqn.out_binders.iter().zip(prev_outs.iter()) {
                    subst.insert(binder.id, Atom::Var(prev.clone()));
                }
                continue;
            }
            seen.insert(key, eqn.out_binders.clone());
            eqns.push(JaxprEqn {
                prim: eqn.prim.clone(),
                inputs,
                out_binders: eqn.out_binders.clone(),
            });
        }
        let outs: Vec<Atom> = self.outs.iter().map(|a| resolve(&subst, a)).collect();

        // Dead-code elimination, backward.
        let mut live: HashSet<u64> = outs
            .iter()
            .filter_map(|a| match a {
                Atom::Var(v) => Some(v.id),
                Atom::Lit(_) => None,
            })
            .collect();
        let mut kept: Vec<JaxprEqn> = Vec::with_capacity(eqns.len());
        for eqn in eqns.into_iter().rev() {
            if eqn.out_binders.iter().any(|b| live.contains(&b.id)) {
                for input in &eqn.inputs {
                    if let Atom::Var(v) = input {
                        live.insert(v.id);
                    }
                }
                kept.push(eqn);
            }
        }
        kept.reverse();
        Jaxpr { in_binders: self.in_binders.clone(), eqns: kept, outs }
    }

    /// Position-canonical polynomial hash of the program. Alpha-equivalent
    /// Jaxprs (same structure, different binder ids) agree.
    pub fn fingerprint(&self) -> u64 {
        let mut h = FpHash::new(7);
        let mut canon: HashMap<u64, u64> = HashMap::new();
        let mut aval_fp = |h: &mut FpHash, aval: &AbstractValue| {
            h.push(aval.dtype as u64);
            for &d in aval.shape.as_slice() {
                h.push(d as u64);
            }
            h.push(u64::MAX);
        };
        for binder in &self.in_binders {
            let idx = canon.len() as u64;
            canon.insert(binder.id, idx);
            aval_fp(&mut h, &binder.aval);
        }
        let atom_fp = |h: &mut FpHash, canon: &HashMap<u64, u64>, atom: &Atom| match atom {
            Atom::Var(v) => {
                h.push(1);
                h.push(*canon.get(&v.id).unwrap_or(&u64::MAX));
            }
            Atom::Lit(l) => {
                h.push(2);
                let mut inner = FpHash::new(3);
                inner.push(l.value.dtype() as u64);
                inner.push(l.value.as_f64().to_bits());
                h.push(inner.finish());
            }
        };
        for eqn in &self.eqns {
            eqn.prim.fingerprint_into(&mut h);
            for input in &eqn.inputs {
                atom_fp(&mut h, &canon, input);
            }
            for binder in &eqn.out_binders {
                let idx = canon.len() as u64;
                canon.insert(binder.id, idx);
                aval_fp(&mut h, &binder.aval);
            }
        }
        for out in &self.outs {
            atom_fp(&mut h, &canon, out);
        }
        h.finish()
    }

    /// Structural (alpha) equivalence.
    pub fn alpha_eq(&self, other: &Jaxpr) -> bool {
        self.fingerprint() == other.fingerprint()
    }
}

fn eqn_key(prim: &Primitive, inputs: &[Atom]) -> u64 {
    let mut h = FpHash::new(13);
    prim.fingerprint_into(&mut h);
    for input in inputs {
        match input {
            Atom::Var(v) => {
                h.push(1);
                h.push(v.id);
            }
            Atom::Lit(l) => {
                h.push(2);
                h.push(l.value.dtype() as u64);
                h.push(l.value.as_f64().to_bits());
            }
        }
    }
    h.finish()
}

/// Fold a scalar-only application to a literal, when the primitive has
/// direct scalar semantics.
fn fold_scalar(prim: &Primitive, args: &[Scalar]) -> Option<Scalar> {
    use crate::alu::AluExp;
    let consts: Vec<AluExp> = args.iter().map(|&v| AluExp::constant(v)).collect();
    let folded = match prim {
        Primitive::Add => AluExp::add(consts[0].clone(), consts[1].clone()),
        Primitive::Mul => AluExp::mul(consts[0].clone(), consts[1].clone()),
        Primitive::Neg => AluExp::neg(consts[0].clone()),
        Primitive::Sin => AluExp::sin(consts[0].clone()),
        Primitive::Cos => AluExp::cos(consts[0].clone()),
        Primitive::Exp => AluExp::exp(consts[0].clone()),
        Primitive::Log => AluExp::log(consts[0].clone()),
        Primitive::Sqrt => AluExp::sqrt(consts[0].clone()),
        Primitive::Reciprocal => AluExp::reciprocal(consts[0].clone()),
        Primitive::Compare { op } => match op {
            CompareOp::Lt => AluExp::cmplt(consts[0].clone(), consts[1].clone()),
            CompareOp::Eq => AluExp::cmpeq(consts[0].clone(), consts[1].clone()),
            CompareOp::Ne => AluExp::cmpne(consts[0].clone(), consts[1].clone()),
        },
        Primitive::Where => {
            AluExp::where_(consts[0].clone(), consts[1].clone(), consts[2].clone())
        }
        _ => return None,
    };
    folded.ok().and_then(|e| e.resolve())
}

/// Stable short name for the `i`-th binder: `a, b, …, z, aa, ab, …`.
fn binder_name(i: usize) -> String {
    let mut n = i;
    let mut name = String::new();
    loop {
        name.insert(0, (b'a' + (n % 26) as u8) as char);
        if n < 26 {
            break;
        }
        n = n / 26 - 1;
    }
    name
}

impl Jaxpr {
    fn fmt_indented(&self, f: &mut fmt::Formatter<'_>, indent: usize) -> fmt::Result {
        let pad = " ".repeat(indent);
        let mut names: HashMap<u64, String> = HashMap::new();
        for binder in &self.in_binders {
            let name = binder_name(names.len());
            names.insert(binder.id, name);
        }
        write!(f, "{}{{ lambda ", pad)?;
        for (i, binder) in self.in_binders.iter().enumerate() {
            if i > 0 {
                write!(f, " ")?;
            }
            write!(f, "{}:{}", names[&binder.id], binder.aval)?;
        }
        writeln!(f, " .")?;
        let atom_str = |names: &HashMap<u64, String>, atom: &Atom| match atom {
            Atom::Var(v) => names.get(&v.id).cloned().unwrap_or_else(|| format!("v{}", v.id)),
            Atom::Lit(l) => format!("{}", l.value),
        };
        for (i, eqn) in self.eqns.iter().enumerate() {
            if i == 0 {
                write!(f, "{}  let ", pad)?;
            } else {
                write!(f, "{}      ", pad)?;
            }
            for (k, binder) in eqn.out_binders.iter().enumerate() {
                let name = binder_name(names.len());
                names.insert(binder.id, name);
                if k > 0 {
                    write!(f, " ")?;
                }
                write!(f, "{}:{}", names[&binder.id], binder.aval)?;
            }
            write!(f, " = {}", eqn.prim.name())?;
            match &eqn.prim {
                Primitive::ReduceSum { axes } => write!(f, "[axes={:?}]", axes)?,
                Primitive::Transpose { perm } => write!(f, "[perm={:?}]", perm)?,
                Primitive::Broadcast { shape, axes } => {
                    write!(f, "[shape={:?} axes={:?}]", shape, axes)?
                }
                Primitive::Reshape { shape } => write!(f, "[shape={:?}]", shape)?,
                Primitive::Flip { axes } => write!(f, "[axes={:?}]", axes)?,
                Primitive::RandomBits { shape } => write!(f, "[shape={:?}]", shape)?,
                Primitive::JitCall { jaxpr, num_consts } => {
                    writeln!(f, "[ jaxpr=")?;
                    jaxpr.fmt_indented(f, indent + 8)?;
                    writeln!(f)?;
                    write!(f, "{}        numConsts={} ]", pad, num_consts)?;
                }
                _ => {}
            }
            for input in &eqn.inputs {
                write!(f, " {}", atom_str(&names, input))?;
            }
            writeln!(f)?;
        }
        write!(f, "{}  in ( ", pad)?;
        for (i, out) in self.outs.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", atom_str(&names, out))?;
        }
        write!(f, " ) }}")
    }
}

impl fmt::Display for Jaxpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.fmt_indented(f, 0)
    }
}
