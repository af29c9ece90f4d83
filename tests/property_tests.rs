//! Property-based tests for the scalar IR, the view algebra, and the
//! differentiation transformations.

use microjax::alu::AluExp;
use microjax::view::{unravel_alu, ShapeTracker};
use microjax::{jvp, linearize, Array, DType, Scalar, Shape, Value};
use proptest::prelude::*;
use proptest::strategy::ValueTree;
use std::collections::HashMap;

// ---- generators ------------------------------------------------------------

/// Generate a small shape (1-3 dimensions, each 1-5 elements).
fn arb_shape() -> impl Strategy<Value = Vec<usize>> {
    prop::collection::vec(1usize..=5, 1..=3)
}

/// Generate an integer scalar expression over the loop variable `i < 16`,
/// with bounded depth.
fn arb_int_exp() -> impl Strategy<Value = AluExp> {
    let leaf = prop_oneof![
        (-20i64..20).prop_map(AluExp::int),
        Just(AluExp::special("i", 16)),
    ];
    leaf.prop_recursive(3, 24, 2, |inner| {
        (inner.clone(), inner, 0u8..5).prop_map(|(a, b, op)| match op {
            0 => AluExp::add(a, b).unwrap(),
            1 => AluExp::sub(a, b).unwrap(),
            2 => AluExp::mul(a, b).unwrap(),
            3 => AluExp::idiv(a, AluExp::int(3)).unwrap(),
            _ => AluExp::modulo(a, AluExp::int(7)).unwrap(),
        })
    })
}

fn arb_array(shape: Vec<usize>) -> impl Strategy<Value = Array> {
    let size: usize = shape.iter().product();
    prop::collection::vec(-4.0f32..4.0, size)
        .prop_map(move |data| Array::from_vec(data, Shape::new(shape.clone())))
}

// ---- scalar IR -------------------------------------------------------------

/// Every subterm's interval stays inside i32, so wrapping arithmetic and
/// real-valued interval analysis agree.
fn no_overflow(e: &AluExp) -> bool {
    e.collect(&|_| true)
        .iter()
        .all(|sub| sub.min() >= i32::MIN as f64 && sub.max() <= i32::MAX as f64)
}

proptest! {
    #[test]
    fn prop_simplify_idempotent(e in arb_int_exp()) {
        let once = e.simplified();
        let twice = once.simplified();
        prop_assert_eq!(once, twice);
    }

    #[test]
    fn prop_simplified_evaluates_equal(e in arb_int_exp(), i in 0i64..16) {
        prop_assume!(no_overflow(&e));
        let vars: HashMap<String, i64> = [("i".to_string(), i)].into();
        let mut no_globals = |_: usize, _: i64, _: DType| -> Scalar { panic!() };
        let plain = e.evaluate(&vars, &mut no_globals);
        let simplified = e.simplified().evaluate(&vars, &mut no_globals);
        prop_assert_eq!(plain, simplified);
    }

    #[test]
    fn prop_interval_contains_value(e in arb_int_exp(), i in 0i64..16) {
        prop_assume!(no_overflow(&e));
        let vars: HashMap<String, i64> = [("i".to_string(), i)].into();
        let mut no_globals = |_: usize, _: i64, _: DType| -> Scalar { panic!() };
        if let Scalar::I32(v) = e.evaluate(&vars, &mut no_globals) {
            prop_assert!(e.min() <= v as f64 && v as f64 <= e.max(),
                "value {} outside [{}, {}] for {}", v, e.min(), e.max(), e);
        }
    }

    #[test]
    fn prop_substitution_composes(e in arb_int_exp(), a in -9i64..9, b in -9i64..9) {
        // Disjoint domains: sigma1 maps i, sigma2 maps j (absent from e).
        let s1: HashMap<String, AluExp> = [("i".to_string(), AluExp::int(a))].into();
        let s2: HashMap<String, AluExp> = [("j".to_string(), AluExp::int(b))].into();
        let mut composed = s1.clone();
        composed.extend(s2.clone());
        prop_assert_eq!(
            e.substitute(&s1).substitute(&s2),
            e.substitute(&composed)
        );
    }
}

// ---- view algebra ----------------------------------------------------------

fn unravel_host(shape: &[usize], flat: i64) -> Vec<i64> {
    let mut out = vec![0i64; shape.len()];
    let mut rest = flat;
    for k in (0..shape.len()).rev() {
        out[k] = rest % shape[k] as i64;
        rest /= shape[k] as i64;
    }
    out
}

/// The symbolic lowering and the host-side walk must agree on every index.
fn assert_lowering_matches(tracker: &ShapeTracker) {
    let shape = tracker.shape().to_vec();
    let size = tracker.size();
    if size == 0 {
        return;
    }
    let gidx = AluExp::special("gidx", size as i64);
    let indices = unravel_alu(&shape, &gidx).unwrap();
    let (off_exp, valid_exp) = tracker.to_alu(&indices).unwrap();
    let mut no_globals = |_: usize, _: i64, _: DType| -> Scalar { panic!() };
    for flat in 0..size as i64 {
        let vars: HashMap<String, i64> = [("gidx".to_string(), flat)].into();
        let idx = unravel_host(&shape, flat);
        let (want_off, want_valid) = tracker.locate(&idx);
        let got_valid =
            matches!(valid_exp.evaluate(&vars, &mut no_globals), Scalar::Bool(true));
        assert_eq!(got_valid, want_valid);
        if want_valid {
            let got_off = match off_exp.evaluate(&vars, &mut no_globals) {
                Scalar::I32(v) => v as i64,
                other => panic!("{:?}", other),
            };
            assert_eq!(got_off, want_off);
        }
    }
}

proptest! {
    #[test]
    fn prop_tracker_ops_lower_consistently(
        shape in arb_shape(),
        flips in prop::collection::vec(any::<bool>(), 3),
        pad in 0usize..2,
    ) {
        let mut tracker = ShapeTracker::contiguous(&shape);
        let flips: Vec<bool> = flips.into_iter().take(shape.len()).collect();
        if flips.len() == shape.len() {
            tracker = tracker.flip(&flips).unwrap();
        }
        let widths: Vec<(usize, usize)> =
            tracker.shape().iter().map(|_| (pad, 0)).collect();
        tracker = tracker.pad(&widths).unwrap();
        let flat: Vec<usize> = vec![tracker.size()];
        let reshaped = tracker.reshape(&flat).unwrap();
        assert_lowering_matches(&tracker);
        assert_lowering_matches(&reshaped);
    }

    #[test]
    fn prop_reshape_identity_offsets(shape in arb_shape()) {
        // A same-shape reshape leaves the physical mapping untouched.
        let tracker = ShapeTracker::contiguous(&shape)
            .permute(&invert(&shape))
            .unwrap();
        let same = tracker.reshape(&tracker.shape().to_vec()).unwrap();
        let size = tracker.size();
        for flat in 0..size as i64 {
            let idx = unravel_host(tracker.shape(), flat);
            assert_eq!(tracker.locate(&idx), same.locate(&idx));
        }
    }
}

fn invert(shape: &[usize]) -> Vec<usize> {
    (0..shape.len()).rev().collect()
}

// ---- transformations -------------------------------------------------------

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn prop_jvp_zero_tangent(shape in arb_shape(), seed in 0u64..50) {
        let shape_clone = shape.clone();
        let runner = move |x: Array| {
            let x = Value::from(x);
            let zeros = Value::zeros_like(&x);
            let (_, t) = jvp(
                |args| vec![args[0].sin().mul(&args[0]).add(&args[0].exp())],
                &[x],
                &[zeros],
            )
            .unwrap();
            t[0].expect_concrete().unwrap().to_vec()
        };
        let size: usize = shape_clone.iter().product();
        let data: Vec<f32> = (0..size).map(|i| ((i as u64 + seed) % 7) as f32 * 0.3).collect();
        let tangent = runner(Array::from_vec(data, Shape::new(shape)));
        prop_assert!(tangent.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn prop_linearize_is_linear(x in -2.0f32..2.0, u in -2.0f32..2.0, v in -2.0f32..2.0) {
        let (_, lin) = linearize(
            |args| vec![args[0].mul(&args[0]).add(&args[0].cos())],
            &[Value::scalar(x)],
        )
        .unwrap();
        let at = |t: f32| {
            lin.call(&[Value::scalar(t)]).unwrap()[0]
                .expect_concrete()
                .unwrap()
                .item_f32()
        };
        let lhs = at(2.0 * u + 3.0 * v);
        let rhs = 2.0 * at(u) + 3.0 * at(v);
        prop_assert!((lhs - rhs).abs() < 1e-3, "{} vs {}", lhs, rhs);
    }

    #[test]
    fn prop_jit_matches_eager(shape in arb_shape(), seed in 0u64..20) {
        let size: usize = shape.iter().product();
        let data: Vec<f32> = (0..size)
            .map(|i| 0.1 + ((i as u64 + seed) % 11) as f32 * 0.17)
            .collect();
        let f = |args: &[Value]| vec![args[0].sin().mul(&args[0]).sum_all()];
        let x = Value::from(Array::from_vec(data.clone(), Shape::new(shape.clone())));
        let eager = f(std::slice::from_ref(&x));
        let eager = eager[0].expect_concrete().unwrap().to_vec();

        let jitted = microjax::jit(f);
        let out = jitted.call(&[x]).unwrap();
        let compiled = out[0].expect_concrete().unwrap().to_vec();
        for (a, b) in eager.iter().zip(compiled.iter()) {
            prop_assert!((a - b).abs() < 1e-4, "{} vs {}", a, b);
        }
    }
}

#[test]
fn test_arb_array_sanity() {
    // Keep the array generator honest (and exercised) without proptest.
    let strategy = arb_array(vec![2, 2]);
    let mut runner = proptest::test_runner::TestRunner::default();
    let tree = strategy.new_tree(&mut runner).unwrap();
    let array = tree.current();
    assert_eq!(array.shape().as_slice(), &[2, 2]);
}
