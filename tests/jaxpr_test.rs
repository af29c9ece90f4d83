//! Jaxpr construction, typechecking, and the stable text format.

use microjax::{
    jit, make_jaxpr, typecheck_jaxpr, AbstractValue, DType, Shape, Value,
};

fn f32_aval(dims: &[usize]) -> AbstractValue {
    AbstractValue::new(Shape::new(dims.to_vec()), DType::Float32)
}

#[test]
fn test_golden_pretty_print() {
    let (jaxpr, consts) = make_jaxpr(
        |args| vec![args[0].add(&Value::scalar(2.0)).mul(&args[0])],
        &[f32_aval(&[2, 3])],
    )
    .unwrap();
    assert!(consts.is_empty());
    let expected = "\
{ lambda a:float32[2,3] .
  let b:float32[2,3] = add a 2
      c:float32[2,3] = mul b a
  in ( c ) }";
    assert_eq!(jaxpr.to_string(), expected);
}

#[test]
fn test_typecheck_after_flatten_simplify() {
    let functions: Vec<Box<dyn Fn(&[Value]) -> Vec<Value>>> = vec![
        Box::new(|args| vec![args[0].sin().mul(&args[0].cos())]),
        Box::new(|args| vec![args[0].sum(&[0]), args[0].neg()]),
        Box::new(|args| {
            let t = args[0].transpose(&[1, 0]);
            vec![t.reshape(&[6]).sum_all()]
        }),
        Box::new(|args| {
            let probs = args[0].exp();
            vec![probs.div(&probs.sum_all().broadcast(&[2, 3], &[0, 1]))]
        }),
    ];
    for f in functions {
        let (jaxpr, _) = make_jaxpr(|xs| f(xs), &[f32_aval(&[2, 3])]).unwrap();
        typecheck_jaxpr(&jaxpr.flatten().simplify()).unwrap();
    }
}

#[test]
fn test_simplify_preserves_semantics() {
    let (jaxpr, _) = make_jaxpr(
        |args| {
            // Duplicate work for CSE plus a dead value for DCE.
            let a = args[0].sin();
            let b = args[0].sin();
            let _dead = args[0].exp();
            vec![a.add(&b)]
        },
        &[f32_aval(&[4])],
    )
    .unwrap();
    let simplified = jaxpr.simplify();
    assert!(simplified.eqns.len() < jaxpr.eqns.len());

    let x = Value::from(microjax::Array::from_vec(
        vec![0.1, 0.2, 0.3, 0.4],
        Shape::new(vec![4]),
    ));
    let full = microjax::trace::eval_jaxpr(&jaxpr, std::slice::from_ref(&x)).unwrap();
    let lean = microjax::trace::eval_jaxpr(&simplified, &[x]).unwrap();
    assert_eq!(
        full[0].expect_concrete().unwrap().to_vec(),
        lean[0].expect_concrete().unwrap().to_vec()
    );
}

#[test]
fn test_jit_idempotence_structural() {
    // jit(jit(f)) flattens to the same program as jit(f).
    let f = |args: &[Value]| vec![args[0].sin().add(&args[0])];
    let (plain, _) = make_jaxpr(f, &[f32_aval(&[4])]).unwrap();

    let inner = jit(f);
    let (nested, _) = make_jaxpr(move |args| inner.call(args).unwrap(), &[f32_aval(&[4])])
        .unwrap();
    assert!(nested
        .eqns
        .iter()
        .any(|e| e.prim.name() == "jit_call"));

    let flat = nested.flatten().simplify();
    assert!(flat.alpha_eq(&plain.flatten().simplify()));
}

#[test]
fn test_nested_jit_call_prints_nested_block() {
    let inner = jit(|args: &[Value]| vec![args[0].neg()]);
    let (jaxpr, _) = make_jaxpr(
        move |args| inner.call(args).unwrap(),
        &[f32_aval(&[2])],
    )
    .unwrap();
    let printed = jaxpr.to_string();
    assert!(printed.contains("jit_call[ jaxpr="));
    assert!(printed.contains("numConsts=0 ]"));
    assert!(printed.contains("neg"));
}

#[test]
fn test_binder_names_roll_over() {
    // 30 equations walk the name sequence past `z` into `aa`, `ab`, ...
    let (jaxpr, _) = make_jaxpr(
        |args| {
            let mut v = args[0].clone();
            for _ in 0..30 {
                v = v.neg();
            }
            vec![v]
        },
        &[f32_aval(&[2])],
    )
    .unwrap();
    let printed = jaxpr.to_string();
    assert!(printed.contains("aa:float32[2]"));
}

#[test]
fn test_fingerprint_distinguishes_params() {
    let (sum0, _) = make_jaxpr(|args| vec![args[0].sum(&[0])], &[f32_aval(&[2, 3])]).unwrap();
    let (sum1, _) = make_jaxpr(|args| vec![args[0].sum(&[1])], &[f32_aval(&[2, 3])]).unwrap();
    assert!(!sum0.alpha_eq(&sum1));
}

#[test]
fn test_captured_array_becomes_const_binder() {
    let weights = Value::from(microjax::Array::from_vec(
        vec![1.0, 2.0, 3.0],
        Shape::new(vec![3]),
    ));
    let (jaxpr, consts) = make_jaxpr(
        move |args| vec![args[0].mul(&weights)],
        &[f32_aval(&[3])],
    )
    .unwrap();
    assert_eq!(consts.len(), 1);
    assert_eq!(jaxpr.in_binders.len(), 2);
    typecheck_jaxpr(&jaxpr).unwrap();
}
