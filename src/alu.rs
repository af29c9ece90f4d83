//! Scalar algebraic IR used as the body of fused kernels.
//!
//! An [`AluExp`] is an immutable term over loop variables, constants, and
//! symbolic buffer reads. Constructors validate dtypes and perform local
//! peephole simplification (constant folding, algebraic identities, interval
//! tightening), so an expression is always in simplified form by
//! construction.

use crate::error::{Error, Result};
use crate::view::ShapeTracker;
use crate::{DType, Scalar};
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// Operation tag of an [`AluExp`] node.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum AluOp {
    /// Binary addition; boolean OR on `bool`.
    Add,
    /// Binary subtraction.
    Sub,
    /// Binary multiplication; boolean AND on `bool`.
    Mul,
    /// Flooring division: `Idiv(x, y) = floor(x / y)`.
    Idiv,
    /// Remainder consistent with `Idiv`: `Mod(x, y) = x - Idiv(x, y) * y`.
    Mod,
    /// Negation.
    Neg,
    /// Sine (float only).
    Sin,
    /// Cosine (float only).
    Cos,
    /// Natural exponential (float only).
    Exp,
    /// Natural logarithm (float only).
    Log,
    /// Square root (float only).
    Sqrt,
    /// Multiplicative inverse (float only).
    Reciprocal,
    /// Less-than comparison, yields `bool`.
    Cmplt,
    /// Equality comparison, yields `bool`.
    Cmpeq,
    /// Inequality comparison, yields `bool`.
    Cmpne,
    /// Ternary select: `Where(cond, a, b)`.
    Where,
    /// Literal constant.
    Const(Scalar),
    /// Named loop variable with a known exclusive upper bound.
    Special(String, i64),
    /// Abstract read from input buffer `gid` at the logical position given by
    /// the node's sources (one index expression per axis of the tracker),
    /// yielding 0 where the tracker's mask is not satisfied.
    GlobalView {
        /// Input buffer id.
        gid: usize,
        /// Logical-to-physical index mapping of the read.
        tracker: ShapeTracker,
    },
    /// Lowered read from input buffer `gid` at the physical offset given by
    /// the node's single source.
    GlobalIndex {
        /// Input buffer id.
        gid: usize,
    },
}

#[derive(Debug)]
struct AluNode {
    op: AluOp,
    dtype: DType,
    src: Vec<AluExp>,
    range: (f64, f64),
}

/// An immutable scalar expression. Cheap to clone and share; equality and
/// hashing are structural, so identical terms unify in caches.
#[derive(Debug, Clone)]
pub struct AluExp {
    node: Arc<AluNode>,
}

impl PartialEq for AluExp {
    fn eq(&self, other: &Self) -> bool {
        if Arc::ptr_eq(&self.node, &other.node) {
            return true;
        }
        self.node.op == other.node.op
            && self.node.dtype == other.node.dtype
            && self.node.src == other.node.src
    }
}

impl Eq for AluExp {}

impl Hash for AluExp {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.node.op.hash(state);
        self.node.dtype.hash(state);
        self.node.src.hash(state);
    }
}

fn float_only(op: &str, dtype: DType) -> Result<()> {
    if dtype.is_float() {
        Ok(())
    } else {
        Err(Error::Type(format!("{} requires a float operand, got {}", op, dtype)))
    }
}

fn arith_ok(op: &str, dtype: DType) -> Result<()> {
    match dtype {
        DType::Complex64 => Err(Error::Type(format!("{} does not accept complex64", op))),
        DType::Bool if !matches!(op, "add" | "mul") => {
            Err(Error::Type(format!("{} does not accept bool", op)))
        }
        _ => Ok(()),
    }
}

impl AluExp {
    fn make(op: AluOp, dtype: DType, src: Vec<AluExp>, range: (f64, f64)) -> AluExp {
        AluExp { node: Arc::new(AluNode { op, dtype, src, range }) }
    }

    /// Literal constant.
    pub fn constant(value: Scalar) -> AluExp {
        let range = match value {
            Scalar::C64(..) => (f64::NEG_INFINITY, f64::INFINITY),
            v => (v.as_f64(), v.as_f64()),
        };
        Self::make(AluOp::Const(value), value.dtype(), vec![], range)
    }

    /// Integer constant of dtype int32.
    pub fn int(value: i64) -> AluExp {
        Self::constant(Scalar::I32(value as i32))
    }

    /// Named loop variable ranging over `0..bound`, dtype int32.
    pub fn special(name: impl Into<String>, bound: i64) -> AluExp {
        let name = name.into();
        let range = (0.0, (bound - 1).max(0) as f64);
        Self::make(AluOp::Special(name, bound), DType::Int32, vec![], range)
    }

    /// Abstract read of `dtype` from input `gid` through `tracker` at the
    /// logical position `indices` (one int32 expression per tracker axis).
    pub fn global_view(
        gid: usize,
        dtype: DType,
        tracker: ShapeTracker,
        indices: Vec<AluExp>,
    ) -> Result<AluExp> {
        if indices.len() != tracker.ndim() {
            return Err(Error::Type(format!(
                "global view expects {} indices, got {}",
                tracker.ndim(),
                indices.len()
            )));
        }
        for idx in &indices {
            if idx.dtype() != DType::Int32 {
                return Err(Error::Type("global view indices must be int32".to_string()));
            }
        }
        let range = dtype_range(dtype);
        Ok(Self::make(AluOp::GlobalView { gid, tracker }, dtype, indices, range))
    }

    /// Lowered read of `dtype` from input `gid` at physical `offset`.
    pub fn global_index(gid: usize, dtype: DType, offset: AluExp) -> Result<AluExp> {
        if offset.dtype() != DType::Int32 {
            return Err(Error::Type("global index offset must be int32".to_string()));
        }
        let range = dtype_range(dtype);
        Ok(Self::make(AluOp::GlobalIndex { gid }, dtype, vec![offset], range))
    }

    /// Addition. Boolean OR on `bool` operands.
    pub fn add(a: AluExp, b: AluExp) -> Result<AluExp> {
        arith_ok("add", a.dtype())?;
        if let (Some(x), Some(y)) = (a.resolve(), b.resolve()) {
            return Ok(Self::constant(scalar_add(x, y)));
        }
        if a.is_const_zero() {
            return Ok(b);
        }
        if b.is_const_zero() {
            return Ok(a);
        }
        let range = (a.min() + b.min(), a.max() + b.max());
        Ok(Self::make(AluOp::Add, a.dtype(), vec![a, b], range))
    }

    /// Subtraction.
    pub fn sub(a: AluExp, b: AluExp) -> Result<AluExp> {
        arith_ok("sub", a.dtype())?;
        if let (Some(x), Some(y)) = (a.resolve(), b.resolve()) {
            return Ok(Self::constant(scalar_sub(x, y)));
        }
        if b.is_const_zero() {
            return Ok(a);
        }
        let range = (a.min() - b.max(), a.max() - b.min());
        Ok(Self::make(AluOp::Sub, a.dtype(), vec![a, b], range))
    }

    /// Multiplication. Boolean AND on `bool` operands.
    pub fn mul(a: AluExp, b: AluExp) -> Result<AluExp> {
        arith_ok("mul", a.dtype())?;
        if let (Some(x), Some(y)) = (a.resolve(), b.resolve()) {
            return Ok(Self::constant(scalar_mul(x, y)));
        }
        if a.is_const_one() {
            return Ok(b);
        }
        if b.is_const_one() {
            return Ok(a);
        }
        if a.is_const_zero() {
            return Ok(a);
        }
        if b.is_const_zero() {
            return Ok(b);
        }
        let range = interval_mul(a.interval(), b.interval());
        Ok(Self::make(AluOp::Mul, a.dtype(), vec![a, b], range))
    }

    /// Flooring division.
    pub fn idiv(a: AluExp, b: AluExp) -> Result<AluExp> {
        arith_ok("idiv", a.dtype())?;
        if let (Some(x), Some(y)) = (a.resolve(), b.resolve()) {
            return Ok(Self::constant(scalar_idiv(x, y)));
        }
        if b.is_const_one() {
            return Ok(a);
        }
        let range = interval_idiv(a.interval(), b.interval());
        Ok(Self::make(AluOp::Idiv, a.dtype(), vec![a, b], range))
    }

    /// Remainder consistent with flooring division.
    pub fn modulo(a: AluExp, b: AluExp) -> Result<AluExp> {
        arith_ok("mod", a.dtype())?;
        if let (Some(x), Some(y)) = (a.resolve(), b.resolve()) {
            return Ok(Self::constant(scalar_mod(x, y)));
        }
        if b.is_const_one() {
            return Ok(Self::constant(Scalar::from_f64(0.0, a.dtype())));
        }
        // x mod c for x already within [0, c) is x itself.
        if let Some(c) = b.resolve() {
            let c = c.as_f64();
            if c > 0.0 && a.min() >= 0.0 && a.max() < c {
                return Ok(a);
            }
        }
        let range = interval_mod(a.interval(), b.interval());
        Ok(Self::make(AluOp::Mod, a.dtype(), vec![a, b], range))
    }

    /// Negation.
    pub fn neg(a: AluExp) -> Result<AluExp> {
        arith_ok("neg", a.dtype())?;
        if a.dtype() == DType::Bool {
            return Err(Error::Type("neg does not accept bool".to_string()));
        }
        if let Some(x) = a.resolve() {
            return Ok(Self::constant(scalar_neg(x)));
        }
        // Double negation cancels.
        if a.node.op == AluOp::Neg {
            return Ok(a.node.src[0].clone());
        }
        let range = (-a.max(), -a.min());
        Ok(Self::make(AluOp::Neg, a.dtype(), vec![a], range))
    }

    fn float_unary(op: AluOp, name: &str, a: AluExp, range: (f64, f64)) -> Result<AluExp> {
        float_only(name, a.dtype())?;
        if let Some(x) = a.resolve() {
            return Ok(Self::constant(scalar_unary(&op, x)));
        }
        let dtype = a.dtype();
        Ok(Self::make(op, dtype, vec![a], range))
    }

    /// Sine.
    pub fn sin(a: AluExp) -> Result<AluExp> {
        Self::float_unary(AluOp::Sin, "sin", a, (-1.0, 1.0))
    }

    /// Cosine.
    pub fn cos(a: AluExp) -> Result<AluExp> {
        Self::float_unary(AluOp::Cos, "cos", a, (-1.0, 1.0))
    }

    /// Natural exponential.
    pub fn exp(a: AluExp) -> Result<AluExp> {
        let range = (a.min().exp(), a.max().exp());
        Self::float_unary(AluOp::Exp, "exp", a, range)
    }

    /// Natural logarithm.
    pub fn log(a: AluExp) -> Result<AluExp> {
        let range = if a.min() > 0.0 {
            (a.min().ln(), a.max().ln())
        } else {
            (f64::NEG_INFINITY, a.max().max(0.0).ln())
        };
        Self::float_unary(AluOp::Log, "log", a, range)
    }

    /// Square root.
    pub fn sqrt(a: AluExp) -> Result<AluExp> {
        let range = (a.min().max(0.0).sqrt(), a.max().max(0.0).sqrt());
        Self::float_unary(AluOp::Sqrt, "sqrt", a, range)
    }

    /// Multiplicative inverse.
    pub fn reciprocal(a: AluExp) -> Result<AluExp> {
        let range = if a.min() > 0.0 || a.max() < 0.0 {
            let lo = 1.0 / a.max();
            let hi = 1.0 / a.min();
            (lo.min(hi), lo.max(hi))
        } else {
            (f64::NEG_INFINITY, f64::INFINITY)
        };
        Self::float_unary(AluOp::Reciprocal, "reciprocal", a, range)
    }

    fn compare(op: AluOp, a: AluExp, b: AluExp) -> Result<AluExp> {
        if a.dtype() == DType::Complex64 {
            return Err(Error::Type("comparisons do not accept complex64".to_string()));
        }
        if let (Some(x), Some(y)) = (a.resolve(), b.resolve()) {
            let v = match op {
                AluOp::Cmplt => x.as_f64() < y.as_f64(),
                AluOp::Cmpeq => x == y,
                AluOp::Cmpne => x != y,
                _ => unreachable!(),
            };
            return Ok(Self::constant(Scalar::Bool(v)));
        }
        // Identical terms compare trivially.
        if a == b {
            let v = match op {
                AluOp::Cmplt | AluOp::Cmpne => false,
                AluOp::Cmpeq => true,
                _ => unreachable!(),
            };
            return Ok(Self::constant(Scalar::Bool(v)));
        }
        // Interval tightening.
        if op == AluOp::Cmplt {
            if a.max() < b.min() {
                return Ok(Self::constant(Scalar::Bool(true)));
            }
            if a.min() >= b.max() {
                return Ok(Self::constant(Scalar::Bool(false)));
            }
        }
        Ok(Self::make(op, DType::Bool, vec![a, b], (0.0, 1.0)))
    }

    /// Less-than comparison.
    pub fn cmplt(a: AluExp, b: AluExp) -> Result<AluExp> {
        Self::compare(AluOp::Cmplt, a, b)
    }

    /// Equality comparison.
    pub fn cmpeq(a: AluExp, b: AluExp) -> Result<AluExp> {
        Self::compare(AluOp::Cmpeq, a, b)
    }

    /// Inequality comparison.
    pub fn cmpne(a: AluExp, b: AluExp) -> Result<AluExp> {
        Self::compare(AluOp::Cmpne, a, b)
    }

    /// Ternary select. `cond` must be boolean; the result carries the dtype
    /// of the first branch.
    pub fn where_(cond: AluExp, a: AluExp, b: AluExp) -> Result<AluExp> {
        if cond.dtype() != DType::Bool {
            return Err(Error::Type(format!(
                "where condition must be bool, got {}",
                cond.dtype()
            )));
        }
        if let Some(Scalar::Bool(c)) = cond.resolve() {
            return Ok(if c { a } else { b });
        }
        if a == b {
            return Ok(a);
        }
        let range = (a.min().min(b.min()), a.max().max(b.max()));
        let dtype = a.dtype();
        Ok(Self::make(AluOp::Where, dtype, vec![cond, a, b], range))
    }

    /// Boolean conjunction, encoded as `Mul`.
    pub fn and(a: AluExp, b: AluExp) -> Result<AluExp> {
        Self::mul(a, b)
    }

    /// The operation tag.
    pub fn op(&self) -> &AluOp {
        &self.node.op
    }

    /// The dtype of the expression.
    pub fn dtype(&self) -> DType {
        self.node.dtype
    }

    /// The child expressions.
    pub fn src(&self) -> &[AluExp] {
        &self.node.src
    }

    /// Lower bound of the expression's value set.
    pub fn min(&self) -> f64 {
        self.node.range.0
    }

    /// Upper bound of the expression's value set.
    pub fn max(&self) -> f64 {
        self.node.range.1
    }

    fn interval(&self) -> (f64, f64) {
        self.node.range
    }

    /// The literal value iff this is a `Const` node.
    pub fn resolve(&self) -> Option<Scalar> {
        match self.node.op {
            AluOp::Const(v) => Some(v),
            _ => None,
        }
    }

    fn is_const_zero(&self) -> bool {
        self.resolve().is_some_and(|v| v.is_zero())
    }

    fn is_const_one(&self) -> bool {
        self.resolve().is_some_and(|v| v.is_one())
    }

    /// Rebuild a node with (possibly) new children, re-running constructor
    /// simplification. Children must keep their dtypes; a violation is an
    /// internal bug.
    fn rebuild(&self, src: Vec<AluExp>) -> AluExp {
        let out = match &self.node.op {
            AluOp::Const(_) | AluOp::Special(..) => Ok(self.clone()),
            AluOp::Add => Self::add(src[0].clone(), src[1].clone()),
            AluOp::Sub => Self::sub(src[0].clone(), src[1].clone()),
            AluOp::Mul => Self::mul(src[0].clone(), src[1].clone()),
            AluOp::Idiv => Self::idiv(src[0].clone(), src[1].clone()),
            AluOp::Mod => Self::modulo(src[0].clone(), src[1].clone()),
            AluOp::Neg => Self::neg(src[0].clone()),
            AluOp::Sin => Self::sin(src[0].clone()),
            AluOp::Cos => Self::cos(src[0].clone()),
            AluOp::Exp => Self::exp(src[0].clone()),
            AluOp::Log => Self::log(src[0].clone()),
            AluOp::Sqrt => Self::sqrt(src[0].clone()),
            AluOp::Reciprocal => Self::reciprocal(src[0].clone()),
            AluOp::Cmplt => Self::cmplt(src[0].clone(), src[1].clone()),
            AluOp::Cmpeq => Self::cmpeq(src[0].clone(), src[1].clone()),
            AluOp::Cmpne => Self::cmpne(src[0].clone(), src[1].clone()),
            AluOp::Where => Self::where_(src[0].clone(), src[1].clone(), src[2].clone()),
            AluOp::GlobalView { gid, tracker } => {
                Self::global_view(*gid, self.node.dtype, tracker.clone(), src)
            }
            AluOp::GlobalIndex { gid } => {
                Self::global_index(*gid, self.node.dtype, src[0].clone())
            }
        };
        match out {
            Ok(e) => e,
            Err(e) => panic!("rewrite changed operand dtypes: {}", e),
        }
    }

    /// Rebuild this node over new children, re-running constructor
    /// simplification.
    pub(crate) fn with_src(&self, src: Vec<AluExp>) -> AluExp {
        self.rebuild(src)
    }

    /// Replace every `Special(name, _)` that appears in `env` by its mapped
    /// expression, recursing through the term.
    pub fn substitute(&self, env: &HashMap<String, AluExp>) -> AluExp {
        if let AluOp::Special(name, _) = &self.node.op {
            if let Some(repl) = env.get(name) {
                return repl.clone();
            }
        }
        if self.node.src.is_empty() {
            return self.clone();
        }
        let src: Vec<AluExp> = self.node.src.iter().map(|s| s.substitute(env)).collect();
        if src == self.node.src {
            return self.clone();
        }
        self.rebuild(src)
    }

    /// Bottom-up rewrite to fixpoint. `f` returns a replacement term or
    /// `None` to leave a node unchanged.
    pub fn rewrite(&self, f: &mut dyn FnMut(&AluExp) -> Option<AluExp>) -> AluExp {
        let mut current = if self.node.src.is_empty() {
            self.clone()
        } else {
            let src: Vec<AluExp> = self.node.src.iter().map(|s| s.rewrite(f)).collect();
            if src == self.node.src {
                self.clone()
            } else {
                self.rebuild(src)
            }
        };
        while let Some(next) = f(&current) {
            if next == current {
                break;
            }
            current = next.rewrite(f);
        }
        current
    }

    /// Enumerate subterms matching `pred`, in preorder.
    pub fn collect(&self, pred: &dyn Fn(&AluExp) -> bool) -> Vec<AluExp> {
        let mut out = Vec::new();
        self.collect_into(pred, &mut out);
        out
    }

    fn collect_into(&self, pred: &dyn Fn(&AluExp) -> bool, out: &mut Vec<AluExp>) {
        if pred(self) {
            out.push(self.clone());
        }
        for s in &self.node.src {
            s.collect_into(pred, out);
        }
    }

    /// Re-run constructor simplification over the whole term.
    pub fn simplified(&self) -> AluExp {
        self.rewrite(&mut |_| None)
    }

    /// Renumber buffer ids of `GlobalView`/`GlobalIndex` reads in one pass
    /// (the map may be a permutation, so this must not re-visit rewrites).
    pub fn reindex_gids(&self, map: &HashMap<usize, usize>) -> AluExp {
        let src: Vec<AluExp> = self.node.src.iter().map(|s| s.reindex_gids(map)).collect();
        match &self.node.op {
            AluOp::GlobalView { gid, tracker } => {
                let new_gid = map.get(gid).copied().unwrap_or(*gid);
                AluExp::make(
                    AluOp::GlobalView { gid: new_gid, tracker: tracker.clone() },
                    self.node.dtype,
                    src,
                    self.node.range,
                )
            }
            AluOp::GlobalIndex { gid } => {
                let new_gid = map.get(gid).copied().unwrap_or(*gid);
                AluExp::make(
                    AluOp::GlobalIndex { gid: new_gid },
                    self.node.dtype,
                    src,
                    self.node.range,
                )
            }
            _ if src == self.node.src => self.clone(),
            _ => self.rebuild(src),
        }
    }

    /// Evaluate the expression. `vars` binds `Special` names; `globals`
    /// resolves buffer reads as `(gid, element_offset, dtype) -> Scalar`.
    ///
    /// This is the reference semantics used by the CPU backend and by
    /// property tests.
    pub fn evaluate(
        &self,
        vars: &HashMap<String, i64>,
        globals: &mut dyn FnMut(usize, i64, DType) -> Scalar,
    ) -> Scalar {
        match &self.node.op {
            AluOp::Const(v) => *v,
            AluOp::Special(name, _) => {
                let v = *vars
                    .get(name)
                    .unwrap_or_else(|| panic!("unbound loop variable {}", name));
                Scalar::I32(v as i32)
            }
            AluOp::Add => scalar_add(
                self.node.src[0].evaluate(vars, globals),
                self.node.src[1].evaluate(vars, globals),
            ),
            AluOp::Sub => scalar_sub(
                self.node.src[0].evaluate(vars, globals),
                self.node.src[1].evaluate(vars, globals),
            ),
            AluOp::Mul => scalar_mul(
                self.node.src[0].evaluate(vars, globals),
                self.node.src[1].evaluate(vars, globals),
            ),
            AluOp::Idiv => scalar_idiv(
                self.node.src[0].evaluate(vars, globals),
                self.node.src[1].evaluate(vars, globals),
            ),
            AluOp::Mod => scalar_mod(
                self.node.src[0].evaluate(vars, globals),
                self.node.src[1].evaluate(vars, globals),
            ),
            op @ (AluOp::Neg
            | AluOp::Sin
            | AluOp::Cos
            | AluOp::Exp
            | AluOp::Log
            | AluOp::Sqrt
            | AluOp::Reciprocal) => {
                let x = self.node.src[0].evaluate(vars, globals);
                if *op == AluOp::Neg {
                    scalar_neg(x)
                } else {
                    scalar_unary(op, x)
                }
            }
            op @ (AluOp::Cmplt | AluOp::Cmpeq | AluOp::Cmpne) => {
                let x = self.node.src[0].evaluate(vars, globals);
                let y = self.node.src[1].evaluate(vars, globals);
                Scalar::Bool(match op {
                    AluOp::Cmplt => x.as_f64() < y.as_f64(),
                    AluOp::Cmpeq => x == y,
                    AluOp::Cmpne => x != y,
                    _ => unreachable!(),
                })
            }
            AluOp::Where => {
                let cond = self.node.src[0].evaluate(vars, globals);
                if matches!(cond, Scalar::Bool(true)) {
                    self.node.src[1].evaluate(vars, globals)
                } else {
                    self.node.src[2].evaluate(vars, globals)
                }
            }
            AluOp::GlobalView { gid, tracker } => {
                let idx: Vec<i64> = self
                    .node
                    .src
                    .iter()
                    .map(|e| match e.evaluate(vars, globals) {
                        Scalar::I32(v) => v as i64,
                        other => panic!("non-integer index {:?}", other),
                    })
                    .collect();
                let (offset, valid) = tracker.locate(&idx);
                if valid {
                    globals(*gid, offset, self.node.dtype)
                } else {
                    Scalar::from_f64(0.0, self.node.dtype)
                }
            }
            AluOp::GlobalIndex { gid } => {
                let offset = match self.node.src[0].evaluate(vars, globals) {
                    Scalar::I32(v) => v as i64,
                    other => panic!("non-integer offset {:?}", other),
                };
                globals(*gid, offset, self.node.dtype)
            }
        }
    }
}

fn dtype_range(dtype: DType) -> (f64, f64) {
    match dtype {
        DType::Bool => (0.0, 1.0),
        _ => (f64::NEG_INFINITY, f64::INFINITY),
    }
}

fn interval_mul(a: (f64, f64), b: (f64, f64)) -> (f64, f64) {
    let candidates = [a.0 * b.0, a.0 * b.1, a.1 * b.0, a.1 * b.1];
    let lo = candidates.iter().cloned().fold(f64::INFINITY, f64::min);
    let hi = candidates.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    if lo.is_nan() || hi.is_nan() {
        (f64::NEG_INFINITY, f64::INFINITY)
    } else {
        (lo, hi)
    }
}

fn interval_idiv(a: (f64, f64), b: (f64, f64)) -> (f64, f64) {
    if b.0 > 0.0 || b.1 < 0.0 {
        let candidates = [
            (a.0 / b.0).floor(),
            (a.0 / b.1).floor(),
            (a.1 / b.0).floor(),
            (a.1 / b.1).floor(),
        ];
        let lo = candidates.iter().cloned().fold(f64::INFINITY, f64::min);
        let hi = candidates.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        if lo.is_nan() || hi.is_nan() {
            (f64::NEG_INFINITY, f64::INFINITY)
        } else {
            (lo, hi)
        }
    } else {
        (f64::NEG_INFINITY, f64::INFINITY)
    }
}

fn interval_mod(a: (f64, f64), b: (f64, f64)) -> (f64, f64) {
    if b.0 > 0.0 && b.1.is_finite() {
        let hi = b.1 - 1.0;
        if a.0 >= 0.0 {
            (0.0, hi.min(a.1))
        } else {
            (0.0, hi)
        }
    } else {
        (f64::NEG_INFINITY, f64::INFINITY)
    }
}

fn scalar_add(a: Scalar, b: Scalar) -> Scalar {
    match (a, b) {
        (Scalar::F32(x), Scalar::F32(y)) => Scalar::F32(x + y),
        (Scalar::I32(x), Scalar::I32(y)) => Scalar::I32(x.wrapping_add(y)),
        (Scalar::U32(x), Scalar::U32(y)) => Scalar::U32(x.wrapping_add(y)),
        (Scalar::Bool(x), Scalar::Bool(y)) => Scalar::Bool(x || y),
        (a, b) => panic!("add on mismatched scalars {:?}, {:?}", a, b),
    }
}

fn scalar_sub(a: Scalar, b: Scalar) -> Scalar {
    match (a, b) {
        (Scalar::F32(x), Scalar::F32(y)) => Scalar::F32(x - y),
        (Scalar::I32(x), Scalar::I32(y)) => Scalar::I32(x.wrapping_sub(y)),
        (Scalar::U32(x), Scalar::U32(y)) => Scalar::U32(x.wrapping_sub(y)),
        (a, b) => panic!("sub on mismatched scalars {:?}, {:?}", a, b),
    }
}

fn scalar_mul(a: Scalar, b: Scalar) -> Scalar {
    match (a, b) {
        (Scalar::F32(x), Scalar::F32(y)) => Scalar::F32(x * y),
        (Scalar::I32(x), Scalar::I32(y)) => Scalar::I32(x.wrapping_mul(y)),
        (Scalar::U32(x), Scalar::U32(y)) => Scalar::U32(x.wrapping_mul(y)),
        (Scalar::Bool(x), Scalar::Bool(y)) => Scalar::Bool(x && y),
        (a, b) => panic!("mul on mismatched scalars {:?}, {:?}", a, b),
    }
}

fn scalar_neg(a: Scalar) -> Scalar {
    match a {
        Scalar::F32(x) => Scalar::F32(-x),
        Scalar::I32(x) => Scalar::I32(x.wrapping_neg()),
        Scalar::U32(x) => Scalar::U32(x.wrapping_neg()),
        other => panic!("neg on {:?}", other),
    }
}

fn floor_div_i32(x: i32, y: i32) -> i32 {
    let q = x.wrapping_div(y);
    let r = x.wrapping_rem(y);
    if r != 0 && (r < 0) != (y < 0) {
        q - 1
    } else {
        q
    }
}

fn scalar_idiv(a: Scalar, b: Scalar) -> Scalar {
    match (a, b) {
        (Scalar::F32(x), Scalar::F32(y)) => Scalar::F32((x / y).floor()),
        (Scalar::I32(x), Scalar::I32(y)) => Scalar::I32(floor_div_i32(x, y)),
        (Scalar::U32(x), Scalar::U32(y)) => Scalar::U32(x / y),
        (a, b) => panic!("idiv on mismatched scalars {:?}, {:?}", a, b),
    }
}

fn scalar_mod(a: Scalar, b: Scalar) -> Scalar {
    match (a, b) {
        (Scalar::F32(x), Scalar::F32(y)) => Scalar::F32(x - (x / y).floor() * y),
        (Scalar::I32(x), Scalar::I32(y)) => Scalar::I32(x.wrapping_sub(floor_div_i32(x, y).wrapping_mul(y))),
        (Scalar::U32(x), Scalar::U32(y)) => Scalar::U32(x % y),
        (a, b) => panic!("mod on mismatched scalars {:?}, {:?}", a, b),
    }
}

fn scalar_unary(op: &AluOp, a: Scalar) -> Scalar {
    let x = match a {
        Scalar::F32(x) => x,
        other => panic!("float unary on {:?}", other),
    };
    Scalar::F32(match op {
        AluOp::Sin => x.sin(),
        AluOp::Cos => x.cos(),
        AluOp::Exp => x.exp(),
        AluOp::Log => x.ln(),
        AluOp::Sqrt => x.sqrt(),
        AluOp::Reciprocal => 1.0 / x,
        other => panic!("not a float unary: {:?}", other),
    })
}

impl fmt::Display for AluExp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.node.op {
            AluOp::Const(v) => write!(f, "{}", v),
            AluOp::Special(name, bound) => write!(f, "{}<{}", name, bound),
            AluOp::Add => write!(f, "({}+{})", self.node.src[0], self.node.src[1]),
            AluOp::Sub => write!(f, "({}-{})", self.node.src[0], self.node.src[1]),
            AluOp::Mul => write!(f, "({}*{})", self.node.src[0], self.node.src[1]),
            AluOp::Idiv => write!(f, "({}//{})", self.node.src[0], self.node.src[1]),
            AluOp::Mod => write!(f, "({}%{})", self.node.src[0], self.node.src[1]),
            AluOp::Neg => write!(f, "(-{})", self.node.src[0]),
            AluOp::Sin => write!(f, "sin({})", self.node.src[0]),
            AluOp::Cos => write!(f, "cos({})", self.node.src[0]),
            AluOp::Exp => write!(f, "exp({})", self.node.src[0]),
            AluOp::Log => write!(f, "log({})", self.node.src[0]),
            AluOp::Sqrt => write!(f, "sqrt({})", self.node.src[0]),
            AluOp::Reciprocal => write!(f, "recip({})", self.node.src[0]),
            AluOp::Cmplt => write!(f, "({}<{})", self.node.src[0], self.node.src[1]),
            AluOp::Cmpeq => write!(f, "({}=={})", self.node.src[0], self.node.src[1]),
            AluOp::Cmpne => write!(f, "({}!={})", self.node.src[0], self.node.src[1]),
            AluOp::Where => write!(
                f,
                "where({},{},{})",
                self.node.src[0], self.node.src[1], self.node.src[2]
            ),
            AluOp::GlobalView { gid, .. } => {
                write!(f, "gview{}[", gid)?;
                for (i, idx) in self.node.src.iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "{}", idx)?;
                }
                write!(f, "]")
            }
            AluOp::GlobalIndex { gid } => write!(f, "gbuf{}[{}]", gid, self.node.src[0]),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn f32c(v: f32) -> AluExp {
        AluExp::constant(Scalar::F32(v))
    }

    #[test]
    fn test_constant_folding() {
        let e = AluExp::add(f32c(2.0), f32c(3.0)).unwrap();
        assert_eq!(e.resolve(), Some(Scalar::F32(5.0)));
        let e = AluExp::mul(AluExp::int(6), AluExp::int(7)).unwrap();
        assert_eq!(e.resolve(), Some(Scalar::I32(42)));
        let e = AluExp::sin(f32c(0.0)).unwrap();
        assert_eq!(e.resolve(), Some(Scalar::F32(0.0)));
    }

    #[test]
    fn test_identities() {
        let x = AluExp::special("i", 10);
        let e = AluExp::add(x.clone(), AluExp::int(0)).unwrap();
        assert_eq!(e, x);
        let e = AluExp::mul(AluExp::int(1), x.clone()).unwrap();
        assert_eq!(e, x);
        let e = AluExp::mul(x.clone(), AluExp::int(0)).unwrap();
        assert_eq!(e.resolve(), Some(Scalar::I32(0)));
        let e = AluExp::where_(AluExp::constant(Scalar::Bool(true)), x.clone(), AluExp::int(9))
            .unwrap();
        assert_eq!(e, x);
        let e = AluExp::where_(AluExp::constant(Scalar::Bool(false)), AluExp::int(9), x.clone())
            .unwrap();
        assert_eq!(e, x);
    }

    #[test]
    fn test_self_comparisons() {
        let x = AluExp::special("i", 10);
        assert_eq!(
            AluExp::cmplt(x.clone(), x.clone()).unwrap().resolve(),
            Some(Scalar::Bool(false))
        );
        assert_eq!(
            AluExp::cmpeq(x.clone(), x.clone()).unwrap().resolve(),
            Some(Scalar::Bool(true))
        );
    }

    #[test]
    fn test_double_neg() {
        let x = AluExp::special("i", 10);
        let minus = AluExp::sub(AluExp::int(0), x.clone()).unwrap();
        let e = AluExp::neg(AluExp::neg(minus.clone()).unwrap()).unwrap();
        assert_eq!(e, minus);
    }

    #[test]
    fn test_interval_tightening() {
        // i in [0, 9], so i < 10 is always true and i < 0 is always false.
        let i = AluExp::special("i", 10);
        let e = AluExp::cmplt(i.clone(), AluExp::int(10)).unwrap();
        assert_eq!(e.resolve(), Some(Scalar::Bool(true)));
        let e = AluExp::cmplt(i.clone(), AluExp::int(0)).unwrap();
        assert_eq!(e.resolve(), Some(Scalar::Bool(false)));
        // i < 5 stays symbolic.
        let e = AluExp::cmplt(i, AluExp::int(5)).unwrap();
        assert_eq!(e.resolve(), None);
    }

    #[test]
    fn test_min_max_propagation() {
        let i = AluExp::special("i", 10);
        let j = AluExp::special("j", 4);
        let e = AluExp::add(
            AluExp::mul(i, AluExp::int(4)).unwrap(),
            j,
        )
        .unwrap();
        assert_eq!(e.min(), 0.0);
        assert_eq!(e.max(), 39.0);
    }

    #[test]
    fn test_mod_elision() {
        // j in [0, 3]; j mod 4 is j.
        let j = AluExp::special("j", 4);
        let e = AluExp::modulo(j.clone(), AluExp::int(4)).unwrap();
        assert_eq!(e, j);
    }

    #[test]
    fn test_dtype_checks() {
        assert!(AluExp::sin(AluExp::int(1)).is_err());
        assert!(AluExp::where_(AluExp::int(1), AluExp::int(2), AluExp::int(3)).is_err());
        assert!(AluExp::add(
            AluExp::constant(Scalar::C64(1.0, 0.0)),
            AluExp::constant(Scalar::C64(0.0, 1.0))
        )
        .is_err());
        let cmp = AluExp::cmplt(AluExp::special("i", 3), AluExp::int(1)).unwrap();
        assert_eq!(cmp.dtype(), DType::Bool);
    }

    #[test]
    fn test_substitute() {
        let i = AluExp::special("i", 10);
        let e = AluExp::add(i.clone(), AluExp::int(1)).unwrap();
        let env: HashMap<String, AluExp> = [("i".to_string(), AluExp::int(41))].into();
        let out = e.substitute(&env);
        assert_eq!(out.resolve(), Some(Scalar::I32(42)));
    }

    #[test]
    fn test_substitute_composition_disjoint() {
        let i = AluExp::special("i", 10);
        let j = AluExp::special("j", 10);
        let e = AluExp::add(i, j).unwrap();
        let s1: HashMap<String, AluExp> = [("i".to_string(), AluExp::int(1))].into();
        let s2: HashMap<String, AluExp> = [("j".to_string(), AluExp::int(2))].into();
        let mut both = s1.clone();
        both.extend(s2.clone());
        assert_eq!(e.substitute(&s1).substitute(&s2), e.substitute(&both));
    }

    #[test]
    fn test_rewrite_fixpoint() {
        // Rewrite every sin into cos; the result must contain no sin.
        let x = AluExp::sin(AluExp::mul(f32c(2.0), f32c(0.5)).unwrap());
        let x = AluExp::add(x.unwrap(), f32c(0.0)).unwrap();
        let out = x.rewrite(&mut |e| match e.op() {
            AluOp::Sin => Some(AluExp::cos(e.src()[0].clone()).unwrap()),
            _ => None,
        });
        assert!(out.collect(&|e| matches!(e.op(), AluOp::Sin)).is_empty());
    }

    #[test]
    fn test_simplify_idempotent() {
        let i = AluExp::special("i", 7);
        let e = AluExp::add(
            AluExp::mul(i.clone(), AluExp::int(3)).unwrap(),
            AluExp::modulo(i, AluExp::int(5)).unwrap(),
        )
        .unwrap();
        let once = e.simplified();
        let twice = once.simplified();
        assert_eq!(once, twice);
    }

    #[test]
    fn test_evaluate_semantics() {
        let vars: HashMap<String, i64> = [("i".to_string(), 7i64)].into();
        let mut no_globals = |_: usize, _: i64, _: DType| -> Scalar { panic!("no globals") };
        let i = AluExp::special("i", 10);
        // floor division and matching remainder
        let d = AluExp::idiv(i.clone(), AluExp::int(3)).unwrap();
        assert_eq!(d.evaluate(&vars, &mut no_globals), Scalar::I32(2));
        let m = AluExp::modulo(i, AluExp::int(3)).unwrap();
        assert_eq!(m.evaluate(&vars, &mut no_globals), Scalar::I32(1));
        // boolean add is OR, mul is AND
        let t = AluExp::constant(Scalar::Bool(true));
        let fa = AluExp::constant(Scalar::Bool(false));
        assert_eq!(
            AluExp::add(t.clone(), fa.clone()).unwrap().resolve(),
            Some(Scalar::Bool(true))
        );
        assert_eq!(AluExp::mul(t, fa).unwrap().resolve(), Some(Scalar::Bool(false)));
    }

    #[test]
    fn test_reindex_gids_swap() {
        use crate::view::ShapeTracker;
        let view = |gid: usize| {
            AluExp::global_view(
                gid,
                DType::Float32,
                ShapeTracker::contiguous(&[4]),
                vec![AluExp::special("gidx", 4)],
            )
            .unwrap()
        };
        let e = AluExp::add(view(0), view(1)).unwrap();
        let map: HashMap<usize, usize> = [(0, 1), (1, 0)].into();
        let swapped = e.reindex_gids(&map);
        let gids: Vec<usize> = swapped
            .collect(&|s| matches!(s.op(), AluOp::GlobalView { .. }))
            .iter()
            .map(|s| match s.op() {
                AluOp::GlobalView { gid, .. } => *gid,
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(gids, vec![1, 0]);
    }

    #[test]
    fn test_structural_equality_and_hash() {
        use std::collections::HashSet;
        let a = AluExp::add(AluExp::special("i", 4), AluExp::int(2)).unwrap();
        let b = AluExp::add(AluExp::special("i", 4), AluExp::int(2)).unwrap();
        assert_eq!(a, b);
        let mut set = HashSet::new();
        set.insert(a);
        assert!(set.contains(&b));
    }
}
