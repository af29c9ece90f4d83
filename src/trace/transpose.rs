//! Reverse-mode automatic differentiation via Jaxpr transposition.
//!
//! [`eval_jaxpr_transposed`] walks a linear Jaxpr backwards, pulling output
//! cotangents to the inputs marked as undefined primals. Each linear
//! primitive has a transpose rule over its linear arguments; cotangents of
//! a variable used more than once accumulate by addition.

use super::jaxpr::{Atom, Jaxpr, Primitive};
use super::partial_eval::linearize;
use super::{bind, bind1, Value};
use crate::error::{Error, Result};
use crate::utils::invert_permutation;
use crate::{AbstractValue, DType, Shape};
use log::debug;
use std::collections::{HashMap, HashSet};

/// One transposition argument: a known primal value, or the sentinel for
/// an input whose cotangent is to be computed.
pub enum PrimalArg {
    /// Concrete (or traced) primal value.
    Known(Value),
    /// Undefined primal carrying only its abstract value.
    Undef(AbstractValue),
}

/// Sum the cotangent back down to `target` after broadcasting: leading
/// added axes and widened unit axes are reduced, then the result is
/// reshaped to the exact target shape.
fn unbroadcast(ct: &Value, target: &AbstractValue) -> Result<Value> {
    let ct_aval = ct.aval();
    if ct_aval.shape == target.shape {
        return Ok(ct.clone());
    }
    let ct_dims = ct_aval.shape.as_slice();
    let t_dims = target.shape.as_slice();
    let extra = ct_dims.len() - t_dims.len();
    let mut axes: Vec<usize> = (0..extra).collect();
    for (k, &t_dim) in t_dims.iter().enumerate() {
        if t_dim == 1 && ct_dims[extra + k] != 1 {
            axes.push(extra + k);
        }
    }
    let mut out = if axes.is_empty() {
        ct.clone()
    } else {
        bind1(Primitive::ReduceSum { axes }, &[ct.clone()])?
    };
    if out.aval().shape != target.shape {
        out = bind1(Primitive::Reshape { shape: t_dims.to_vec() }, &[out])?;
    }
    Ok(out)
}

/// Cotangents of one equation's inputs, given its output cotangents.
/// `None` marks a known (non-linear-path) input.
fn transpose_rule(
    prim: &Primitive,
    cts: &[Value],
    inputs: &[PrimalArg],
) -> Result<Vec<Option<Value>>> {
    let ct = &cts[0];
    match prim {
        Primitive::Add => inputs
            .iter()
            .map(|arg| match arg {
                PrimalArg::Undef(aval) => unbroadcast(ct, aval).map(Some),
                PrimalArg::Known(_) => Ok(None),
            })
            .collect(),
        Primitive::Neg => Ok(vec![Some(bind1(Primitive::Neg, &[ct.clone()])?)]),
        Primitive::Mul => match (&inputs[0], &inputs[1]) {
            (PrimalArg::Undef(aval), PrimalArg::Known(other)) => {
                let scaled = bind1(Primitive::Mul, &[ct.clone(), other.clone()])?;
                Ok(vec![Some(unbroadcast(&scaled, aval)?), None])
            }
            (PrimalArg::Known(other), PrimalArg::Undef(aval)) => {
                let scaled = bind1(Primitive::Mul, &[other.clone(), ct.clone()])?;
                Ok(vec![None, Some(unbroadcast(&scaled, aval)?)])
            }
            (PrimalArg::Undef(_), PrimalArg::Undef(_)) => Err(Error::Type(
                "mul of two linear arguments is not linear".to_string(),
            )),
            (PrimalArg::Known(_), PrimalArg::Known(_)) => {
                panic!("transpose of mul with no linear argument")
            }
        },
        Primitive::ReduceSum { axes } => {
            let in_aval = match &inputs[0] {
                PrimalArg::Undef(aval) => aval,
                PrimalArg::Known(_) => panic!("transpose of reduce_sum over a known input"),
            };
            let shape = in_aval.shape.as_slice().to_vec();
            let out = bind1(
                Primitive::Broadcast { shape, axes: axes.clone() },
                &[ct.clone()],
            )?;
            Ok(vec![Some(out)])
        }
        Primitive::Broadcast { axes, .. } => {
            let in_aval = match &inputs[0] {
                PrimalArg::Undef(aval) => aval,
                PrimalArg::Known(_) => panic!("transpose of broadcast over a known input"),
            };
            let summed = if axes.is_empty() {
                ct.clone()
            } else {
                bind1(Primitive::ReduceSum { axes: axes.clone() }, &[ct.clone()])?
            };
            // Axes that widened from 1 still need reducing.
            Ok(vec![Some(unbroadcast(&summed, in_aval)?)])
        }
        Primitive::Transpose { perm } => {
            let out = bind1(
                Primitive::Transpose { perm: invert_permutation(perm) },
                &[ct.clone()],
            )?;
            Ok(vec![Some(out)])
        }
        Primitive::Reshape { .. } => {
            let in_aval = match &inputs[0] {
                PrimalArg::Undef(aval) => aval,
                PrimalArg::Known(_) => panic!("transpose of reshape over a known input"),
            };
            let out = bind1(
                Primitive::Reshape { shape: in_aval.shape.as_slice().to_vec() },
                &[ct.clone()],
            )?;
            Ok(vec![Some(out)])
        }
        Primitive::Flip { axes } => {
            let out = bind1(Primitive::Flip { axes: axes.clone() }, &[ct.clone()])?;
            Ok(vec![Some(out)])
        }
        Primitive::Where => {
            let cond = match &inputs[0] {
                PrimalArg::Known(cond) => cond.clone(),
                PrimalArg::Undef(_) => {
                    return Err(Error::Type(
                        "where condition cannot be a linear argument".to_string(),
                    ))
                }
            };
            let zeros = Value::zeros_like(ct);
            let mut out: Vec<Option<Value>> = vec![None];
            for (k, arg) in inputs[1..].iter().enumerate() {
                match arg {
                    PrimalArg::Undef(aval) => {
                        let routed = if k == 0 {
                            bind1(
                                Primitive::Where,
                                &[cond.clone(), ct.clone(), zeros.clone()],
                            )?
                        } else {
                            bind1(
                                Primitive::Where,
                                &[cond.clone(), zeros.clone(), ct.clone()],
                            )?
                        };
                        out.push(Some(unbroadcast(&routed, aval)?));
                    }
                    PrimalArg::Known(_) => out.push(None),
                }
            }
            Ok(out)
        }
        other => Err(Error::Type(format!(
            "{} has no transpose rule (nonlinear operation in transposition)",
            other.name()
        ))),
    }
}

/// Walk `jaxpr` backwards, pulling `cotangents` from its outputs to every
/// input passed as [`PrimalArg::Undef`]. Returns one cotangent per
/// undefined input, in input order; unused ones are zero.
pub fn eval_jaxpr_transposed(
    jaxpr: &Jaxpr,
    args: &[PrimalArg],
    cotangents: &[Value],
) -> Result<Vec<Value>> {
    if args.len() != jaxpr.in_binders.len() {
        return Err(Error::Type(format!(
            "transposition expects {} arguments, got {}",
            jaxpr.in_binders.len(),
            args.len()
        )));
    }
    if cotangents.len() != jaxpr.outs.len() {
        return Err(Error::Type(format!(
            "transposition expects {} cotangents, got {}",
            jaxpr.outs.len(),
            cotangents.len()
        )));
    }

    // Forward pass: evaluate everything reachable from known inputs.
    let mut primal_env: HashMap<u64, Value> = HashMap::new();
    let mut undef: HashSet<u64> = HashSet::new();
    for (binder, arg) in jaxpr.in_binders.iter().zip(args.iter()) {
        match arg {
            PrimalArg::Known(v) => {
                primal_env.insert(binder.id, v.clone());
            }
            PrimalArg::Undef(_) => {
                undef.insert(binder.id);
            }
        }
    }
    for eqn in &jaxpr.eqns {
        let known: Option<Vec<Value>> = eqn
            .inputs
            .iter()
            .map(|atom| match atom {
                Atom::Var(v) => primal_env.get(&v.id).cloned(),
                Atom::Lit(l) => Some(Value::constant(l.value)),
            })
            .collect();
        match known {
            Some(inputs) => {
                let outs = bind(eqn.prim.clone(), &inputs)?;
                for (binder, out) in eqn.out_binders.iter().zip(outs) {
                    primal_env.insert(binder.id, out);
                }
            }
            None => {
                for binder in &eqn.out_binders {
                    undef.insert(binder.id);
                }
            }
        }
    }

    // Backward pass: accumulate cotangents into linear-path variables.
    let mut ct_env: HashMap<u64, Value> = HashMap::new();
    let write_ct = |env: &mut HashMap<u64, Value>, id: u64, ct: Value| -> Result<()> {
        match env.remove(&id) {
            Some(existing) => {
                let summed = bind1(Primitive::Add, &[existing, ct])?;
                env.insert(id, summed);
            }
            None => {
                env.insert(id, ct);
            }
        }
        Ok(())
    };
    for (out, ct) in jaxpr.outs.iter().zip(cotangents.iter()) {
        if let Atom::Var(v) = out {
            if undef.contains(&v.id) {
                write_ct(&mut ct_env, v.id, ct.clone())?;
            }
        }
    }

    for eqn in jaxpr.eqns.iter().rev() {
        if eqn.out_binders.iter().all(|b| !undef.contains(&b.id)) {
            continue;
        }
        let cts_out: Vec<Value> = eqn
            .out_binders
            .iter()
            .map(|b| {
                ct_env
                    .remove(&b.id)
                    .unwrap_or_else(|| Value::full(&b.aval, 0.0))
            })
            .collect();
        let rule_inputs: Vec<PrimalArg> = eqn
            .inputs
            .iter()
            .map(|atom| match atom {
                Atom::Var(v) => match primal_env.get(&v.id) {
                    Some(value) => PrimalArg::Known(value.clone()),
                    None => PrimalArg::Undef(v.aval.clone()),
                },
                Atom::Lit(l) => PrimalArg::Known(Value::constant(l.value)),
            })
            .collect();
        let cts_in = transpose_rule(&eqn.prim, &cts_out, &rule_inputs)?;
        debug!("transposed {}: {} input cotangents", eqn.prim.name(), cts_in.len());
        for (atom, ct_in) in eqn.inputs.iter().zip(cts_in) {
            if let (Atom::Var(v), Some(ct_in)) = (atom, ct_in) {
                if undef.contains(&v.id) {
                    write_ct(&mut ct_env, v.id, ct_in)?;
                }
            }
        }
    }

    // The unused-cotangent default is zeros of the binder's aval.
    Ok(jaxpr
        .in_binders
        .iter()
        .zip(args.iter())
        .filter_map(|(binder, arg)| match arg {
            PrimalArg::Undef(aval) => Some(
                ct_env
                    .remove(&binder.id)
                    .unwrap_or_else(|| Value::full(aval, 0.0)),
            ),
            PrimalArg::Known(_) => None,
        })
        .collect())
}

/// The pullback returned by [`vjp`].
pub struct VjpFn {
    lin: super::partial_eval::LinearFn,
}

impl VjpFn {
    /// Pull output cotangents back to input cotangents.
    pub fn call(&self, cotangents: &[Value]) -> Result<Vec<Value>> {
        let jaxpr = &self.lin.jaxpr;
        let mut args: Vec<PrimalArg> = self
            .lin
            .consts
            .iter()
            .map(|c| PrimalArg::Known(c.clone()))
            .collect();
        args.extend(
            self.lin
                .tangent_avals
                .iter()
                .map(|aval| PrimalArg::Undef(aval.clone())),
        );
        // Cotangents of staged outputs feed the transposition; constant
        // tangent outputs (e.g. zeros) absorb theirs trivially.
        if cotangents.len() != self.lin.tangent_outs.len() {
            return Err(Error::Type(format!(
                "vjp expects {} cotangents, got {}",
                self.lin.tangent_outs.len(),
                cotangents.len()
            )));
        }
        let selected: Vec<Value> = self
            .lin
            .tangent_outs
            .iter()
            .zip(cotangents.iter())
            .filter_map(|(out, ct)| match out {
                super::partial_eval::TangentOut::FromJaxpr(_) => Some(ct.clone()),
                super::partial_eval::TangentOut::Known(_) => None,
            })
            .collect();
        eval_jaxpr_transposed(jaxpr, &args, &selected)
    }
}

/// Reverse-mode split: evaluate `f` at `primals` and return the outputs
/// with a pullback of output cotangents.
pub fn vjp<F>(f: F, primals: &[Value]) -> Result<(Vec<Value>, VjpFn)>
where
    F: FnOnce(&[Value]) -> Vec<Value>,
{
    let (outs, lin) = linearize(f, primals)?;
    Ok((outs, VjpFn { lin }))
}

/// Evaluate a scalar-valued `f` and the gradient with respect to its
/// first positional argument.
pub fn value_and_grad<F>(f: F, args: &[Value]) -> Result<(Value, Value)>
where
    F: FnOnce(&[Value]) -> Value,
{
    let (outs, pullback) = vjp(move |vals| vec![f(vals)], args)?;
    let y = outs.into_iter().next().ok_or_else(|| {
        Error::Type("grad of a function with no outputs".to_string())
    })?;
    let aval = y.aval();
    if !aval.shape.is_scalar() || aval.dtype != DType::Float32 {
        return Err(Error::Type(format!(
            "grad requires a scalar float32 output, got {}",
            aval
        )));
    }
    let seed = Value::full(&AbstractValue::new(Shape::scalar(), DType::Float32), 1.0);
    let cts = pullback.call(&[seed])?;
    let grad = cts.into_iter().next().ok_or_else(|| {
        Error::Type("grad of a function with no inputs".to_string())
    })?;
    Ok((y, grad))
}

/// The gradient of a scalar-valued function with respect to its first
/// positional argument.
///
/// # Examples
///
/// ```
/// # use microjax::{grad, Value};
/// let df = grad(|args: &[Value]| args[0].mul(&args[0]).mul(&args[0]));
/// let g = df(&[Value::scalar(4.0)]).unwrap();
/// assert_eq!(g.expect_concrete().unwrap().item_f32(), 48.0);
/// ```
pub fn grad<F>(f: F) -> impl Fn(&[Value]) -> Result<Value>
where
    F: Fn(&[Value]) -> Value,
{
    move |args| value_and_grad(&f, args).map(|(_, g)| g)
}
