//! JIT compilation: fusion decisions, semantic preservation, caching.

use microjax::backend::default_backend;
use microjax::trace::jit::compile;
use microjax::{jit, make_jaxpr, AbstractValue, Array, DType, Shape, Value};

fn f32_aval(dims: &[usize]) -> AbstractValue {
    AbstractValue::new(Shape::new(dims.to_vec()), DType::Float32)
}

fn vec_value(data: Vec<f32>, dims: &[usize]) -> Value {
    Value::from(Array::from_vec(data, Shape::new(dims.to_vec())))
}

#[test]
fn test_fused_reduction_is_one_kernel() {
    // sum(sin(x) * cos(x), axis 0): sin, cos, mul fuse into the reduction.
    let (jaxpr, _) = make_jaxpr(
        |args| vec![args[0].sin().mul(&args[0].cos()).sum(&[0])],
        &[f32_aval(&[6, 7])],
    )
    .unwrap();
    let program = compile(&jaxpr, &[], default_backend()).unwrap();
    assert_eq!(program.num_executes(), 1);

    let data: Vec<f32> = (0..42).map(|i| (i as f32) * 0.1).collect();
    let x = Array::from_vec(data.clone(), Shape::new(vec![6, 7]));
    let out = program.execute(&[x]).unwrap();
    let got = out[0].to_vec();
    for (j, g) in got.iter().enumerate() {
        let want: f32 = (0..6)
            .map(|i| {
                let v = data[i * 7 + j];
                v.sin() * v.cos()
            })
            .sum();
        assert!((g - want).abs() < 1e-4, "column {}: {} vs {}", j, g, want);
    }
}

#[test]
fn test_jit_preserves_semantics_elementwise() {
    let f = |args: &[Value]| {
        vec![args[0]
            .exp()
            .add(&args[0].sin())
            .mul(&args[0])
            .sub(&args[0].sqrt())]
    };
    let data = vec![0.5f32, 1.0, 2.0, 3.5];
    let eager = f(&[vec_value(data.clone(), &[4])]);
    let eager = eager[0].expect_concrete().unwrap().to_vec();

    let jitted = jit(f);
    let out = jitted.call(&[vec_value(data, &[4])]).unwrap();
    let compiled = out[0].expect_concrete().unwrap().to_vec();

    for (a, b) in eager.iter().zip(compiled.iter()) {
        assert!((a - b).abs() < 1e-5, "{} vs {}", a, b);
    }
}

#[test]
fn test_jit_idempotence_observable() {
    let f = |args: &[Value]| vec![args[0].sin().mul(&args[0])];
    let once = jit(f);
    let twice_inner = jit(f);
    let twice = jit(move |args: &[Value]| twice_inner.call(args).unwrap());

    let x = vec_value(vec![0.2, 0.4, 0.6], &[3]);
    let a = once.call(std::slice::from_ref(&x)).unwrap();
    let b = twice.call(&[x]).unwrap();
    assert_eq!(
        a[0].expect_concrete().unwrap().to_vec(),
        b[0].expect_concrete().unwrap().to_vec()
    );
}

#[test]
fn test_multi_output_forces_materialization() {
    let (jaxpr, _) = make_jaxpr(
        |args| {
            let z = args[0].sin();
            vec![z.sum(&[0]), z.mul(&args[0]).sum(&[0])]
        },
        &[f32_aval(&[8])],
    )
    .unwrap();
    let program = compile(&jaxpr, &[], default_backend()).unwrap();
    // sin(x) feeds two reductions, so it materializes: three kernels.
    assert_eq!(program.num_executes(), 3);
    // The materialized intermediate is freed after its last consumer.
    assert!(program.num_frees() >= 1);
}

#[test]
fn test_view_chain_fuses_to_one_kernel() {
    let (jaxpr, _) = make_jaxpr(
        |args| {
            vec![args[0]
                .transpose(&[1, 0])
                .reshape(&[12])
                .flip(&[true])
                .sum_all()]
        },
        &[f32_aval(&[3, 4])],
    )
    .unwrap();
    let program = compile(&jaxpr, &[], default_backend()).unwrap();
    assert_eq!(program.num_executes(), 1);

    let data: Vec<f32> = (0..12).map(|i| i as f32).collect();
    let out = program.execute(&[Array::from_vec(data, Shape::new(vec![3, 4]))]).unwrap();
    assert_eq!(out[0].to_vec(), vec![66.0]);
}

#[test]
fn test_broadcast_inputs_fuse() {
    // Row + column broadcast into one elementwise kernel.
    let (jaxpr, _) = make_jaxpr(
        |args| vec![args[0].add(&args[1]).sum_all()],
        &[f32_aval(&[3, 1]), f32_aval(&[1, 4])],
    )
    .unwrap();
    let program = compile(&jaxpr, &[], default_backend()).unwrap();
    assert_eq!(program.num_executes(), 1);

    let col = Array::from_vec(vec![1.0, 2.0, 3.0], Shape::new(vec![3, 1]));
    let row = Array::from_vec(vec![10.0, 20.0, 30.0, 40.0], Shape::new(vec![1, 4]));
    let out = program.execute(&[col, row]).unwrap();
    // sum over all (i,j) of (col_i + row_j) = 4*6 + 3*100
    assert_eq!(out[0].to_vec(), vec![324.0]);
}

#[test]
fn test_program_output_passthrough() {
    let (jaxpr, _) = make_jaxpr(
        |args| vec![args[0].clone(), args[0].neg()],
        &[f32_aval(&[2])],
    )
    .unwrap();
    let program = compile(&jaxpr, &[], default_backend()).unwrap();
    let x = Array::from_vec(vec![1.0, -2.0], Shape::new(vec![2]));
    let out = program.execute(&[x]).unwrap();
    assert_eq!(out[0].to_vec(), vec![1.0, -2.0]);
    assert_eq!(out[1].to_vec(), vec![-1.0, 2.0]);
}

#[test]
fn test_compile_cache_reuse() {
    let (jaxpr, _) = make_jaxpr(|args| vec![args[0].exp()], &[f32_aval(&[5])]).unwrap();
    let backend = default_backend();
    let p1 = compile(&jaxpr, &[], backend.clone()).unwrap();
    let p2 = compile(&jaxpr, &[], backend).unwrap();
    assert!(std::sync::Arc::ptr_eq(&p1, &p2));
}

#[test]
fn test_jit_with_random_bits() {
    let f = jit(|args: &[Value]| {
        let bits = microjax::random::bits(&args[0], &[4]).unwrap();
        vec![bits]
    });
    let key = Value::from(microjax::random::key(99));
    let a = f.call(std::slice::from_ref(&key)).unwrap();
    let b = f.call(&[key]).unwrap();
    assert_eq!(
        a[0].expect_concrete().unwrap().to_u32_vec(),
        b[0].expect_concrete().unwrap().to_u32_vec()
    );
}

#[test]
fn test_grad_of_jit() {
    let inner = jit(|args: &[Value]| vec![args[0].mul(&args[0]).mul(&args[0])]);
    let df = microjax::grad(move |args: &[Value]| {
        inner.call(args).unwrap().remove(0)
    });
    let g = df(&[Value::scalar(4.0)]).unwrap();
    assert_eq!(g.expect_concrete().unwrap().item_f32(), 48.0);
}

#[test]
fn test_jit_of_grad() {
    let df = microjax::grad(|args: &[Value]| args[0].mul(&args[0]).mul(&args[0]));
    let jitted = jit(move |args: &[Value]| vec![df(args).unwrap()]);
    let g = jitted.call(&[Value::scalar(5.0)]).unwrap();
    assert_eq!(g[0].expect_concrete().unwrap().item_f32(), 75.0);
}
