//! Partial evaluation: split a trace into a known part, evaluated now, and
//! an unknown part, staged into a Jaxpr for later.
//!
//! Recipes hold strong references to their input tracers and weak
//! references to their output tracers, so outputs nobody kept are
//! collected before Jaxpr assembly and show up as dead code.

use super::jaxpr::{abstract_eval, Atom, Jaxpr, JaxprEqn, Primitive, Var};
use super::jvp::jvp_flat;
use super::{bind, eval_jaxpr, new_main, TraceKind, Value};
use crate::error::{Error, Result};
use crate::utils::topo_sort;
use crate::AbstractValue;
use log::debug;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::{Rc, Weak};
use std::sync::Arc;

/// Exactly one of a known concrete value or an unknown abstract value.
#[derive(Clone)]
pub enum PartialVal {
    /// Value available during tracing.
    Known(Value),
    /// Placeholder carrying only its abstract value.
    Unknown(AbstractValue),
}

impl PartialVal {
    /// The abstract value either way.
    pub fn aval(&self) -> AbstractValue {
        match self {
            PartialVal::Known(v) => v.aval(),
            PartialVal::Unknown(aval) => aval.clone(),
        }
    }

    /// True when the value is known.
    pub fn is_known(&self) -> bool {
        matches!(self, PartialVal::Known(_))
    }
}

/// How an unknown tracer came to be.
pub(crate) enum Recipe {
    /// Argument of the traced function.
    LambdaBinding,
    /// Known value lifted into the unknown program as a hoisted constant.
    Const(Value),
    /// Output of a staged equation.
    Eqn(Rc<EqnRecipe>),
}

/// A staged equation, shared by all of its output tracers.
pub(crate) struct EqnRecipe {
    pub(crate) prim: Primitive,
    pub(crate) tracers_in: Vec<Rc<PartialEvalTracer>>,
    pub(crate) avals_out: Vec<AbstractValue>,
    /// Weak back-edges to outputs; a dead entry is an unused output.
    pub(crate) tracer_refs_out: RefCell<Vec<Weak<PartialEvalTracer>>>,
}

/// Tracer of the partial-evaluation trace.
pub struct PartialEvalTracer {
    pub(crate) level: usize,
    pub(crate) pval: PartialVal,
    pub(crate) recipe: RefCell<Option<Recipe>>,
}

impl PartialEvalTracer {
    /// The abstract value.
    pub fn aval(&self) -> AbstractValue {
        self.pval.aval()
    }

    fn known(level: usize, value: Value) -> Rc<PartialEvalTracer> {
        Rc::new(PartialEvalTracer {
            level,
            pval: PartialVal::Known(value),
            recipe: RefCell::new(None),
        })
    }
}

/// Box a lower-level value into the partial-eval trace as known.
pub(crate) fn lift(level: usize, value: &Value) -> Value {
    Value::PartialEval(PartialEvalTracer::known(level, value.clone()))
}

fn as_tracer(value: &Value) -> Rc<PartialEvalTracer> {
    match value {
        Value::PartialEval(t) => t.clone(),
        other => panic!("non-partial-eval tracer {:?} in partial-eval trace", other),
    }
}

/// Turn a known tracer into an unknown one with a `Const` recipe, lifting
/// its value into the Jaxpr-to-be. Unknown tracers pass through.
fn instantiate_const(level: usize, tracer: &Rc<PartialEvalTracer>) -> Rc<PartialEvalTracer> {
    match &tracer.pval {
        PartialVal::Unknown(_) => tracer.clone(),
        PartialVal::Known(value) => Rc::new(PartialEvalTracer {
            level,
            pval: PartialVal::Unknown(value.aval()),
            recipe: RefCell::new(Some(Recipe::Const(value.clone()))),
        }),
    }
}

/// Apply one primitive under the partial-eval trace: known-only inputs run
/// now; otherwise the application is staged as an equation recipe.
pub(crate) fn process_primitive(
    level: usize,
    prim: &Primitive,
    tracers: &[Value],
) -> Result<Vec<Value>> {
    let tracers: Vec<Rc<PartialEvalTracer>> = tracers.iter().map(as_tracer).collect();
    if tracers.iter().all(|t| t.pval.is_known()) {
        let known: Vec<Value> = tracers
            .iter()
            .map(|t| match &t.pval {
                PartialVal::Known(v) => v.clone(),
                PartialVal::Unknown(_) => unreachable!(),
            })
            .collect();
        return bind(prim.clone(), &known);
    }

    let instantiated: Vec<Rc<PartialEvalTracer>> =
        tracers.iter().map(|t| instantiate_const(level, t)).collect();
    let in_avals: Vec<AbstractValue> = instantiated.iter().map(|t| t.aval()).collect();
    let avals_out = abstract_eval(prim, &in_avals)?;

    let recipe = Rc::new(EqnRecipe {
        prim: prim.clone(),
        tracers_in: instantiated,
        avals_out: avals_out.clone(),
        tracer_refs_out: RefCell::new(Vec::new()),
    });
    let outs: Vec<Rc<PartialEvalTracer>> = avals_out
        .into_iter()
        .map(|aval| {
            Rc::new(PartialEvalTracer {
                level,
                pval: PartialVal::Unknown(aval),
                recipe: RefCell::new(Some(Recipe::Eqn(recipe.clone()))),
            })
        })
        .collect();
    *recipe.tracer_refs_out.borrow_mut() = outs.iter().map(Rc::downgrade).collect();
    Ok(outs.into_iter().map(Value::PartialEval).collect())
}

/// Assemble the Jaxpr of the unknown subgraph reaching `tracers_out`.
///
/// Returns the Jaxpr (hoisted-constant binders first) and the constant
/// values in binder order.
fn tracers_to_jaxpr(
    tracers_in: &[Rc<PartialEvalTracer>],
    tracers_out: &[Rc<PartialEvalTracer>],
) -> Result<(Jaxpr, Vec<Value>)> {
    let sorted = topo_sort(
        tracers_out,
        |t: &Rc<PartialEvalTracer>| Rc::as_ptr(t) as usize,
        |t: &Rc<PartialEvalTracer>| match &*t.recipe.borrow() {
            Some(Recipe::Eqn(eqn)) => eqn.tracers_in.clone(),
            _ => Vec::new(),
        },
    );

    let mut vars: HashMap<usize, Var> = HashMap::new();
    let mut var_for = |t: &Rc<PartialEvalTracer>, vars: &mut HashMap<usize, Var>| -> Var {
        vars.entry(Rc::as_ptr(t) as usize)
            .or_insert_with(|| Var::fresh(t.aval()))
            .clone()
    };

    let mut const_binders: Vec<Var> = Vec::new();
    let mut const_vals: Vec<Value> = Vec::new();
    let mut eqns: Vec<JaxprEqn> = Vec::new();
    let mut emitted: std::collections::HashSet<usize> = std::collections::HashSet::new();

    for tracer in &sorted {
        let recipe = tracer.recipe.borrow();
        match &*recipe {
            None => {
                return Err(Error::Type(
                    "partial-eval tracer without a recipe reached assembly".to_string(),
                ))
            }
            Some(Recipe::LambdaBinding) => {
                if !tracers_in.iter().any(|t| Rc::ptr_eq(t, tracer)) {
                    return Err(Error::Type(
                        "a traced argument escaped its transformation".to_string(),
                    ));
                }
                let _ = var_for(tracer, &mut vars);
            }
            Some(Recipe::Const(value)) => {
                let var = var_for(tracer, &mut vars);
                const_binders.push(var);
                const_vals.push(value.clone());
            }
            Some(Recipe::Eqn(eqn)) => {
                let key = Rc::as_ptr(eqn) as usize;
                if !emitted.insert(key) {
                    continue;
                }
                let inputs: Vec<Atom> = eqn
                    .tracers_in
                    .iter()
                    .map(|t| Atom::Var(var_for(t, &mut vars)))
                    .collect();
                let out_binders: Vec<Var> = eqn
                    .avals_out
                    .iter()
                    .zip(eqn.tracer_refs_out.borrow().iter())
                    .map(|(aval, weak)| match weak.upgrade() {
                        // A dead weak reference means the output was unused:
                        // bind a fresh name and let DCE drop it.
                        Some(out) => var_for(&out, &mut vars),
                        None => Var::fresh(aval.clone()),
                    })
                    .collect();
                eqns.push(JaxprEqn { prim: eqn.prim.clone(), inputs, out_binders });
            }
        }
    }

    let lambda_binders: Vec<Var> = tracers_in
        .iter()
        .map(|t| var_for(t, &mut vars))
        .collect();
    let mut in_binders = const_binders;
    in_binders.extend(lambda_binders);
    let outs: Vec<Atom> = tracers_out
        .iter()
        .map(|t| Atom::Var(var_for(t, &mut vars)))
        .collect();
    let jaxpr = Jaxpr { in_binders, eqns, outs };
    debug!(
        "partial eval assembled jaxpr: {} eqns, {} consts",
        jaxpr.eqns.len(),
        const_vals.len()
    );
    Ok((jaxpr, const_vals))
}

/// Run `f` over partial values, evaluating the known part now and staging
/// the unknown part. Returns the Jaxpr of the unknown part, the output
/// partial values, and the hoisted constants.
pub(crate) fn partial_eval_flat<F>(
    f: F,
    pvals_in: Vec<PartialVal>,
) -> Result<(Jaxpr, Vec<PartialVal>, Vec<Value>)>
where
    F: FnOnce(&[Value]) -> Result<Vec<Value>>,
{
    let guard = new_main(TraceKind::PartialEval);
    let level = guard.level();
    let tracers_in: Vec<Rc<PartialEvalTracer>> = pvals_in
        .into_iter()
        .map(|pval| {
            Rc::new(PartialEvalTracer {
                level,
                pval,
                recipe: RefCell::new(Some(Recipe::LambdaBinding)),
            })
        })
        .collect();
    let args: Vec<Value> = tracers_in.iter().map(|t| Value::PartialEval(t.clone())).collect();
    let outs = f(&args)?;
    let kind = TraceKind::PartialEval;
    let tracers_out: Vec<Rc<PartialEvalTracer>> = outs
        .iter()
        .map(|out| Ok(as_tracer(&super::full_raise(&kind, level, out)?)))
        .collect::<Result<_>>()?;
    let pvals_out: Vec<PartialVal> = tracers_out.iter().map(|t| t.pval.clone()).collect();

    let unk_in: Vec<Rc<PartialEvalTracer>> = tracers_in
        .into_iter()
        .filter(|t| !t.pval.is_known())
        .collect();
    let unk_out: Vec<Rc<PartialEvalTracer>> = tracers_out
        .into_iter()
        .filter(|t| !t.pval.is_known())
        .collect();
    let (jaxpr, consts) = tracers_to_jaxpr(&unk_in, &unk_out)?;
    Ok((jaxpr, pvals_out, consts))
}

/// How one tangent output of [`linearize`] is produced.
pub(crate) enum TangentOut {
    /// The tangent was known during tracing (e.g. a constant zero).
    Known(Value),
    /// Index into the linear Jaxpr's outputs.
    FromJaxpr(usize),
}

/// The linear map returned by [`linearize`].
pub struct LinearFn {
    pub(crate) jaxpr: Arc<Jaxpr>,
    pub(crate) consts: Vec<Value>,
    pub(crate) tangent_outs: Vec<TangentOut>,
    pub(crate) tangent_avals: Vec<AbstractValue>,
}

impl LinearFn {
    /// The staged linear program.
    pub fn jaxpr(&self) -> &Jaxpr {
        &self.jaxpr
    }

    /// Apply the linear map to tangents.
    pub fn call(&self, tangents: &[Value]) -> Result<Vec<Value>> {
        if tangents.len() != self.tangent_avals.len() {
            return Err(Error::TreeMismatch(format!(
                "linear function expects {} tangents, got {}",
                self.tangent_avals.len(),
                tangents.len()
            )));
        }
        for (t, aval) in tangents.iter().zip(self.tangent_avals.iter()) {
            if t.aval() != *aval {
                return Err(Error::Type(format!(
                    "tangent {} does not match {}",
                    t.aval(),
                    aval
                )));
            }
        }
        let mut args = self.consts.clone();
        args.extend(tangents.iter().cloned());
        let jaxpr_outs = eval_jaxpr(&self.jaxpr, &args)?;
        Ok(self
            .tangent_outs
            .iter()
            .map(|out| match out {
                TangentOut::Known(v) => v.clone(),
                TangentOut::FromJaxpr(i) => jaxpr_outs[*i].clone(),
            })
            .collect())
    }
}

/// Split `f` at `primals` into evaluated primal outputs and a staged
/// linear map on tangents.
///
/// # Examples
///
/// ```
/// # use microjax::{linearize, Value};
/// let (y, lin) = linearize(|args| vec![args[0].sin()], &[Value::scalar(3.0)]).unwrap();
/// let dy = lin.call(&[Value::scalar(1.0)]).unwrap();
/// assert!((dy[0].expect_concrete().unwrap().item_f32() - 3.0f32.cos()).abs() < 1e-6);
/// ```
pub fn linearize<F>(f: F, primals: &[Value]) -> Result<(Vec<Value>, LinearFn)>
where
    F: FnOnce(&[Value]) -> Vec<Value>,
{
    let n = primals.len();
    let mut pvals: Vec<PartialVal> =
        primals.iter().map(|p| PartialVal::Known(p.clone())).collect();
    pvals.extend(primals.iter().map(|p| PartialVal::Unknown(p.aval())));

    let (jaxpr, pvals_out, consts) = partial_eval_flat(
        move |vals: &[Value]| {
            let (p, t) = vals.split_at(n);
            let (mut outs_p, outs_t) = jvp_flat(move |args| Ok(f(args)), p, t)?;
            outs_p.extend(outs_t);
            Ok(outs_p)
        },
        pvals,
    )?;

    if pvals_out.len() % 2 != 0 {
        return Err(Error::Type("jvp returned unpaired outputs".to_string()));
    }
    let m = pvals_out.len() / 2;
    let (primal_pvals, tangent_pvals) = pvals_out.split_at(m);

    let mut primals_out = Vec::with_capacity(m);
    for pval in primal_pvals {
        match pval {
            PartialVal::Known(v) => primals_out.push(v.clone()),
            PartialVal::Unknown(aval) => {
                return Err(Error::Type(format!(
                    "primal output {} not known after partial evaluation",
                    aval
                )))
            }
        }
    }

    // Jaxpr outputs are the unknown tangent outputs, in order. The first
    // `m` unknown outputs would be primal leaks, excluded above.
    let mut jaxpr_index = 0usize;
    let tangent_outs: Vec<TangentOut> = tangent_pvals
        .iter()
        .map(|pval| match pval {
            PartialVal::Known(v) => TangentOut::Known(v.clone()),
            PartialVal::Unknown(_) => {
                let out = TangentOut::FromJaxpr(jaxpr_index);
                jaxpr_index += 1;
                out
            }
        })
        .collect();

    let tangent_avals: Vec<AbstractValue> = primals.iter().map(Value::aval).collect();
    Ok((
        primals_out,
        LinearFn {
            jaxpr: Arc::new(jaxpr),
            consts,
            tangent_outs,
            tangent_avals,
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::typecheck_jaxpr;
    use crate::{Array, Shape, Value};

    fn get(v: &Value) -> f32 {
        v.expect_concrete().unwrap().item_f32()
    }

    #[test]
    fn test_linearize_sin() {
        let (y, lin) = linearize(|args| vec![args[0].sin()], &[Value::scalar(3.0)]).unwrap();
        assert!((get(&y[0]) - 3.0f32.sin()).abs() < 1e-6);
        let dy = lin.call(&[Value::scalar(1.0)]).unwrap();
        assert!((get(&dy[0]) - 3.0f32.cos()).abs() < 1e-6);
        let dy = lin.call(&[Value::scalar(-42.0)]).unwrap();
        assert!((get(&dy[0]) + 42.0 * 3.0f32.cos()).abs() < 1e-4);
    }

    #[test]
    fn test_linearize_jaxpr_typechecks() {
        let (_, lin) = linearize(
            |args| vec![args[0].sin().mul(&args[0])],
            &[Value::scalar(2.0)],
        )
        .unwrap();
        typecheck_jaxpr(&lin.jaxpr().flatten().simplify()).unwrap();
    }

    #[test]
    fn test_linearize_is_linear() {
        let (_, lin) = linearize(
            |args| vec![args[0].mul(&args[0]).add(&args[0].sin())],
            &[Value::scalar(1.3)],
        )
        .unwrap();
        let a = 2.5f32;
        let b = -1.5f32;
        let u = 0.7f32;
        let v = 0.2f32;
        let lhs = get(&lin.call(&[Value::scalar(a * u + b * v)]).unwrap()[0]);
        let rhs = a * get(&lin.call(&[Value::scalar(u)]).unwrap()[0])
            + b * get(&lin.call(&[Value::scalar(v)]).unwrap()[0]);
        assert!((lhs - rhs).abs() < 1e-4);
    }

    #[test]
    fn test_linearize_vector_function() {
        let x = Value::from(Array::from_vec(vec![1.0, 2.0, 3.0], Shape::new(vec![3])));
        let (y, lin) = linearize(|args| vec![args[0].mul(&args[0]).sum_all()], &[x]).unwrap();
        assert_eq!(get(&y[0]), 14.0);
        let t = Value::from(Array::from_vec(vec![1.0, 0.0, 0.0], Shape::new(vec![3])));
        let dy = lin.call(&[t]).unwrap();
        // d(sum x^2) . e1 = 2 x1 = 2
        assert!((get(&dy[0]) - 2.0).abs() < 1e-5);
    }

    #[test]
    fn test_unused_output_is_dead_code() {
        // The product is computed and dropped; its recipe's weak reference
        // dies, and the jaxpr keeps only the live chain.
        let (_, lin) = linearize(
            |args| {
                let _dropped = args[0].mul(&args[0]);
                vec![args[0].sin()]
            },
            &[Value::scalar(1.0)],
        )
        .unwrap();
        let simplified = lin.jaxpr().simplify();
        typecheck_jaxpr(&simplified).unwrap();
        // Only the tangent chain for sin survives: one mul by cos(x).
        assert!(simplified.eqns.len() <= 2);
    }

    #[test]
    fn test_primal_outputs_known() {
        let (y, _) = linearize(
            |args| vec![args[0].add(&Value::scalar(1.0))],
            &[Value::scalar(4.0)],
        )
        .unwrap();
        assert_eq!(get(&y[0]), 5.0);
    }
}
