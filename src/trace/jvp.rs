//! Forward-mode automatic differentiation.
//!
//! A [`JvpTracer`] carries a `(primal, tangent)` pair with identical
//! abstract values. Each primitive's JVP rule pushes tangents forward by
//! re-binding primitives on the pair components, so rules nest under any
//! other transformation.

use super::jaxpr::Primitive;
use super::{bind1, eval_jaxpr, new_main, TraceKind, Value};
use crate::error::{Error, Result};
use crate::AbstractValue;
use std::rc::Rc;

/// Tracer of the forward-mode trace: a primal value and its tangent.
pub struct JvpTracer {
    pub(crate) level: usize,
    pub(crate) primal: Value,
    pub(crate) tangent: Value,
}

impl JvpTracer {
    /// The abstract value (shared by primal and tangent).
    pub fn aval(&self) -> AbstractValue {
        self.primal.aval()
    }
}

/// Box a lower-level value into the JVP trace with a zero tangent.
pub(crate) fn lift(level: usize, value: &Value) -> Value {
    Value::Jvp(Rc::new(JvpTracer {
        level,
        primal: value.clone(),
        tangent: Value::zeros_like(value),
    }))
}

/// Apply one primitive under the JVP trace.
pub(crate) fn process_primitive(
    level: usize,
    prim: &Primitive,
    tracers: &[Value],
) -> Result<Vec<Value>> {
    let mut primals = Vec::with_capacity(tracers.len());
    let mut tangents = Vec::with_capacity(tracers.len());
    for t in tracers {
        match t {
            Value::Jvp(t) => {
                primals.push(t.primal.clone());
                tangents.push(t.tangent.clone());
            }
            other => panic!("non-jvp tracer {:?} in jvp trace", other),
        }
    }
    let (outs_p, outs_t) = jvp_rule(prim, &primals, &tangents)?;
    debug_assert_eq!(outs_p.len(), outs_t.len());
    Ok(outs_p
        .into_iter()
        .zip(outs_t)
        .map(|(primal, tangent)| Value::Jvp(Rc::new(JvpTracer { level, primal, tangent })))
        .collect())
}

/// The tangent of a non-differentiable output is zero.
fn zero_tangents(outs: &[Value]) -> Vec<Value> {
    outs.iter().map(Value::zeros_like).collect()
}

fn jvp_rule(
    prim: &Primitive,
    p: &[Value],
    t: &[Value],
) -> Result<(Vec<Value>, Vec<Value>)> {
    match prim {
        Primitive::Add => Ok((
            vec![bind1(Primitive::Add, &[p[0].clone(), p[1].clone()])?],
            vec![bind1(Primitive::Add, &[t[0].clone(), t[1].clone()])?],
        )),
        Primitive::Mul => {
            let primal = bind1(Primitive::Mul, &[p[0].clone(), p[1].clone()])?;
            let left = bind1(Primitive::Mul, &[t[0].clone(), p[1].clone()])?;
            let right = bind1(Primitive::Mul, &[p[0].clone(), t[1].clone()])?;
            let tangent = bind1(Primitive::Add, &[left, right])?;
            Ok((vec![primal], vec![tangent]))
        }
        Primitive::Neg => Ok((
            vec![bind1(Primitive::Neg, &[p[0].clone()])?],
            vec![bind1(Primitive::Neg, &[t[0].clone()])?],
        )),
        Primitive::Sin => {
            let primal = bind1(Primitive::Sin, &[p[0].clone()])?;
            let cos = bind1(Primitive::Cos, &[p[0].clone()])?;
            let tangent = bind1(Primitive::Mul, &[cos, t[0].clone()])?;
            Ok((vec![primal], vec![tangent]))
        }
        Primitive::Cos => {
            let primal = bind1(Primitive::Cos, &[p[0].clone()])?;
            let sin = bind1(Primitive::Sin, &[p[0].clone()])?;
            let minus_sin = bind1(Primitive::Neg, &[sin])?;
            let tangent = bind1(Primitive::Mul, &[minus_sin, t[0].clone()])?;
            Ok((vec![primal], vec![tangent]))
        }
        Primitive::Exp => {
            let primal = bind1(Primitive::Exp, &[p[0].clone()])?;
            let tangent = bind1(Primitive::Mul, &[primal.clone(), t[0].clone()])?;
            Ok((vec![primal], vec![tangent]))
        }
        Primitive::Log => {
            let primal = bind1(Primitive::Log, &[p[0].clone()])?;
            let recip = bind1(Primitive::Reciprocal, &[p[0].clone()])?;
            let tangent = bind1(Primitive::Mul, &[t[0].clone(), recip])?;
            Ok((vec![primal], vec![tangent]))
        }
        Primitive::Sqrt => {
            // d sqrt(x) = t / (2 sqrt(x))
            let primal = bind1(Primitive::Sqrt, &[p[0].clone()])?;
            let twice = bind1(Primitive::Add, &[primal.clone(), primal.clone()])?;
            let recip = bind1(Primitive::Reciprocal, &[twice])?;
            let tangent = bind1(Primitive::Mul, &[t[0].clone(), recip])?;
            Ok((vec![primal], vec![tangent]))
        }
        Primitive::Reciprocal => {
            // d (1/x) = -t / x^2
            let primal = bind1(Primitive::Reciprocal, &[p[0].clone()])?;
            let sq = bind1(Primitive::Mul, &[primal.clone(), primal.clone()])?;
            let scaled = bind1(Primitive::Mul, &[t[0].clone(), sq])?;
            let tangent = bind1(Primitive::Neg, &[scaled])?;
            Ok((vec![primal], vec![tangent]))
        }
        Primitive::ReduceSum { .. }
        | Primitive::Transpose { .. }
        | Primitive::Broadcast { .. }
        | Primitive::Reshape { .. }
        | Primitive::Flip { .. } => {
            // Structural primitives are linear: the tangent follows the
            // same rearrangement.
            let primal = bind1(prim.clone(), &[p[0].clone()])?;
            let tangent = bind1(prim.clone(), &[t[0].clone()])?;
            Ok((vec![primal], vec![tangent]))
        }
        Primitive::Compare { .. } => {
            let out = bind1(prim.clone(), &[p[0].clone(), p[1].clone()])?;
            let zeros = zero_tangents(std::slice::from_ref(&out));
            Ok((vec![out], zeros))
        }
        Primitive::Where => {
            let primal =
                bind1(Primitive::Where, &[p[0].clone(), p[1].clone(), p[2].clone()])?;
            let tangent =
                bind1(Primitive::Where, &[p[0].clone(), t[1].clone(), t[2].clone()])?;
            Ok((vec![primal], vec![tangent]))
        }
        Primitive::RandomBits { .. } => {
            let out = bind1(prim.clone(), &[p[0].clone()])?;
            let zeros = zero_tangents(std::slice::from_ref(&out));
            Ok((vec![out], zeros))
        }
        Primitive::JitCall { jaxpr, .. } => {
            // Inline the callee through the tracing machinery.
            let jaxpr = jaxpr.clone();
            let (outs_p, outs_t) =
                jvp_flat(move |args| eval_jaxpr(&jaxpr, args), p, t)?;
            Ok((outs_p, outs_t))
        }
    }
}

/// Forward-mode transform over flat argument lists, fallible body.
pub(crate) fn jvp_flat<F>(
    f: F,
    primals: &[Value],
    tangents: &[Value],
) -> Result<(Vec<Value>, Vec<Value>)>
where
    F: FnOnce(&[Value]) -> Result<Vec<Value>>,
{
    if primals.len() != tangents.len() {
        return Err(Error::TreeMismatch(format!(
            "{} primals but {} tangents",
            primals.len(),
            tangents.len()
        )));
    }
    for (p, t) in primals.iter().zip(tangents.iter()) {
        if p.aval() != t.aval() {
            return Err(Error::Type(format!(
                "tangent {} does not match primal {}",
                t.aval(),
                p.aval()
            )));
        }
    }
    let guard = new_main(TraceKind::Jvp);
    let level = guard.level();
    let tracers: Vec<Value> = primals
        .iter()
        .zip(tangents.iter())
        .map(|(p, t)| {
            Value::Jvp(Rc::new(JvpTracer { level, primal: p.clone(), tangent: t.clone() }))
        })
        .collect();
    let outs = f(&tracers)?;
    let kind = TraceKind::Jvp;
    let mut outs_p = Vec::with_capacity(outs.len());
    let mut outs_t = Vec::with_capacity(outs.len());
    for out in &outs {
        match super::full_raise(&kind, level, out)? {
            Value::Jvp(t) => {
                outs_p.push(t.primal.clone());
                outs_t.push(t.tangent.clone());
            }
            other => panic!("raise into jvp produced {:?}", other),
        }
    }
    Ok((outs_p, outs_t))
}

/// Compute `f(primals)` together with the directional derivative along
/// `tangents`.
///
/// # Examples
///
/// ```
/// # use microjax::{jvp, Value};
/// let (y, dy) = jvp(
///     |args| vec![args[0].sin()],
///     &[Value::scalar(1.0)],
///     &[Value::scalar(1.0)],
/// )
/// .unwrap();
/// let y = y[0].expect_concrete().unwrap().item_f32();
/// let dy = dy[0].expect_concrete().unwrap().item_f32();
/// assert!((y - 1.0f32.sin()).abs() < 1e-6);
/// assert!((dy - 1.0f32.cos()).abs() < 1e-6);
/// ```
pub fn jvp<F>(f: F, primals: &[Value], tangents: &[Value]) -> Result<(Vec<Value>, Vec<Value>)>
where
    F: FnOnce(&[Value]) -> Vec<Value>,
{
    jvp_flat(move |args| Ok(f(args)), primals, tangents)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Array, Shape};

    fn scalar(v: f32) -> Value {
        Value::scalar(v)
    }

    fn get(v: &Value) -> f32 {
        v.expect_concrete().unwrap().item_f32()
    }

    #[test]
    fn test_jvp_mul_product_rule() {
        // f(x) = x * x, df = 2 x dx
        let (y, dy) = jvp(
            |args| vec![args[0].mul(&args[0])],
            &[scalar(3.0)],
            &[scalar(1.0)],
        )
        .unwrap();
        assert_eq!(get(&y[0]), 9.0);
        assert_eq!(get(&dy[0]), 6.0);
    }

    #[test]
    fn test_jvp_zero_tangent_stays_zero() {
        let x = Value::from(Array::from_vec(vec![1.0, 2.0, 3.0], Shape::new(vec![3])));
        let zeros = Value::zeros_like(&x);
        let (_, dy) = jvp(|args| vec![args[0].sin().mul(&args[0])], &[x], &[zeros]).unwrap();
        assert_eq!(dy[0].expect_concrete().unwrap().to_vec(), vec![0.0; 3]);
    }

    #[test]
    fn test_jvp_linearity_in_tangent() {
        let f = |args: &[Value]| vec![args[0].sin()];
        let (_, dy1) = jvp(f, &[scalar(0.7)], &[scalar(1.0)]).unwrap();
        let (_, dy3) = jvp(f, &[scalar(0.7)], &[scalar(3.0)]).unwrap();
        assert!((3.0 * get(&dy1[0]) - get(&dy3[0])).abs() < 1e-5);
    }

    #[test]
    fn test_jvp_through_reduce() {
        let x = Value::from(Array::from_vec(vec![1.0, 2.0, 3.0], Shape::new(vec![3])));
        let t = Value::from(Array::from_vec(vec![1.0, 1.0, 1.0], Shape::new(vec![3])));
        let (y, dy) = jvp(|args| vec![args[0].sum_all()], &[x], &[t]).unwrap();
        assert_eq!(get(&y[0]), 6.0);
        assert_eq!(get(&dy[0]), 3.0);
    }

    #[test]
    fn test_jvp_where_routes_tangent() {
        let (y, dy) = jvp(
            |args| {
                let cond = args[0].lt(&Value::scalar(0.0));
                vec![cond.where_(&args[0].neg(), &args[0])]
            },
            &[scalar(-2.0)],
            &[scalar(1.0)],
        )
        .unwrap();
        assert_eq!(get(&y[0]), 2.0);
        assert_eq!(get(&dy[0]), -1.0);
    }

    #[test]
    fn test_jvp_tangent_aval_mismatch() {
        let x = scalar(1.0);
        let bad = Value::from(Array::from_vec(vec![1.0, 2.0], Shape::new(vec![2])));
        assert!(jvp(|args| vec![args[0].clone()], &[x], &[bad]).is_err());
    }

    #[test]
    fn test_nested_jvp_second_derivative() {
        // d2/dx2 sin(x) = -sin(x)
        let x = 0.9f32;
        let inner = |args: &[Value]| {
            let (_, dy) = jvp(
                |inner_args| vec![inner_args[0].sin()],
                &[args[0].clone()],
                &[Value::scalar(1.0)],
            )
            .unwrap();
            vec![dy[0].clone()]
        };
        let (_, d2y) = jvp(inner, &[scalar(x)], &[scalar(1.0)]).unwrap();
        assert!((get(&d2y[0]) + x.sin()).abs() < 1e-5);
    }
}
