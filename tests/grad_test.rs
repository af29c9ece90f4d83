//! End-to-end tests for the differentiation transformations.

use microjax::{
    grad, jvp, linearize, linearize_tree, value_and_grad, vjp, Array, Shape, Tree, Value,
};

fn scalar(v: f32) -> Value {
    Value::scalar(v)
}

fn get(v: &Value) -> f32 {
    v.expect_concrete().unwrap().item_f32()
}

fn vec_value(data: Vec<f32>) -> Value {
    let shape = Shape::new(vec![data.len()]);
    Value::from(Array::from_vec(data, shape))
}

#[test]
fn test_scalar_gradient_of_cube() {
    let df = grad(|args: &[Value]| args[0].mul(&args[0]).mul(&args[0]));
    assert_eq!(get(&df(&[scalar(4.0)]).unwrap()), 48.0);
    assert_eq!(get(&df(&[scalar(5.0)]).unwrap()), 75.0);
    assert_eq!(get(&df(&[scalar(0.0)]).unwrap()), 0.0);
    assert_eq!(get(&df(&[scalar(-4.0)]).unwrap()), 48.0);
}

#[test]
fn test_second_order_derivative() {
    let f = |args: &[Value]| args[0].cos().sin();
    let df = grad(f);
    let g = get(&df(&[scalar(3.0)]).unwrap());
    assert!((g - (-0.077432003)).abs() < 1e-6, "first derivative was {}", g);

    let ddf = grad(move |args: &[Value]| df(args).unwrap());
    let gg = get(&ddf(&[scalar(3.0)]).unwrap());
    assert!((gg - 0.559854311).abs() < 1e-4, "second derivative was {}", gg);
}

#[test]
fn test_linearize_sin_scalar() {
    let (y, lin) = linearize(|args| vec![args[0].sin()], &[scalar(3.0)]).unwrap();
    assert!((get(&y[0]) - 3.0f32.sin()).abs() < 1e-6);
    let dy = lin.call(&[scalar(1.0)]).unwrap();
    assert!((get(&dy[0]) - 3.0f32.cos()).abs() < 1e-6);
    let dy = lin.call(&[scalar(-42.0)]).unwrap();
    assert!((get(&dy[0]) - (-42.0 * 3.0f32.cos())).abs() < 1e-4);
}

#[test]
fn test_tree_structured_linearize() {
    // {a, b} -> {r1: a*a + b, r2: b}
    let f = |tree: &Tree| {
        let a = tree.leaf_at("a");
        let b = tree.leaf_at("b");
        Tree::dict([("r1", a.mul(a).add(b)), ("r2", b.clone())])
    };
    let primals = Tree::dict([("a", scalar(1.0)), ("b", scalar(2.0))]);
    let (y, lin) = linearize_tree(f, &primals).unwrap();
    assert_eq!(get(y.leaf_at("r1")), 3.0);
    assert_eq!(get(y.leaf_at("r2")), 2.0);

    let tangents = Tree::dict([("a", scalar(1.0)), ("b", scalar(0.0))]);
    let dy = lin.call(&tangents).unwrap();
    assert_eq!(get(dy.leaf_at("r1")), 2.0);
    assert_eq!(get(dy.leaf_at("r2")), 0.0);
}

#[test]
fn test_jvp_with_zero_tangent_is_zero() {
    let x = vec_value(vec![0.3, -1.7, 2.2, 5.0]);
    let zeros = Value::zeros_like(&x);
    let (_, tangents) = jvp(
        |args| vec![args[0].sin().mul(&args[0]).exp()],
        &[x],
        &[zeros],
    )
    .unwrap();
    assert_eq!(
        tangents[0].expect_concrete().unwrap().to_vec(),
        vec![0.0, 0.0, 0.0, 0.0]
    );
}

#[test]
fn test_linearize_linearity() {
    let (_, lin) = linearize(
        |args| vec![args[0].mul(&args[0]).add(&args[0].sin())],
        &[scalar(0.8)],
    )
    .unwrap();
    let (a, b, u, v) = (2.0f32, -3.0f32, 0.4f32, 1.1f32);
    let combined = get(&lin.call(&[scalar(a * u + b * v)]).unwrap()[0]);
    let separate = a * get(&lin.call(&[scalar(u)]).unwrap()[0])
        + b * get(&lin.call(&[scalar(v)]).unwrap()[0]);
    assert!((combined - separate).abs() < 1e-4);
}

#[test]
fn test_vjp_jvp_duality() {
    // <vjp(f,x)(ybar), u> == <ybar, jvp(f,x,u)>
    let f = |args: &[Value]| vec![args[0].sin().mul(&args[0])];
    let x_data = vec![0.9f32, -0.4, 1.8];
    let u_data = vec![0.2f32, 0.5, -1.0];
    let ybar_data = vec![1.5f32, -0.3, 0.8];

    let (_, tangents) = jvp(
        f,
        &[vec_value(x_data.clone())],
        &[vec_value(u_data.clone())],
    )
    .unwrap();
    let jvp_out = tangents[0].expect_concrete().unwrap().to_vec();
    let rhs: f32 = ybar_data.iter().zip(jvp_out.iter()).map(|(a, b)| a * b).sum();

    let (_, pullback) = vjp(f, &[vec_value(x_data)]).unwrap();
    let cts = pullback.call(&[vec_value(ybar_data)]).unwrap();
    let ct = cts[0].expect_concrete().unwrap().to_vec();
    let lhs: f32 = ct.iter().zip(u_data.iter()).map(|(a, b)| a * b).sum();

    assert!((lhs - rhs).abs() < 1e-4, "duality broke: {} vs {}", lhs, rhs);
}

#[test]
fn test_grad_with_reductions_and_broadcast() {
    // f(x) = sum((x - mean(x))^2) over a vector, via broadcasted ops.
    let x = vec_value(vec![1.0, 2.0, 3.0, 4.0]);
    let (y, g) = value_and_grad(
        |args| {
            let n = Value::scalar(4.0);
            let mean = args[0].sum_all().div(&n).broadcast(&[4], &[0]);
            let centered = args[0].sub(&mean);
            centered.mul(&centered).sum_all()
        },
        &[x],
    )
    .unwrap();
    assert!((get(&y) - 5.0).abs() < 1e-5);
    let grads = g.expect_concrete().unwrap().to_vec();
    let want = [-3.0f32, -1.0, 1.0, 3.0]; // 2 (x - mean)
    for (got, want) in grads.iter().zip(want.iter()) {
        assert!((got - want).abs() < 1e-5, "{} vs {}", got, want);
    }
}

#[test]
fn test_grad_rejects_vector_output() {
    let x = vec_value(vec![1.0, 2.0]);
    assert!(value_and_grad(|args| args[0].neg(), &[x]).is_err());
}

#[test]
fn test_gradient_descent_converges() {
    // Minimize (x - 3)^2 by plain gradient steps.
    let df = grad(|args: &[Value]| {
        let delta = args[0].sub(&Value::scalar(3.0));
        delta.mul(&delta)
    });
    let mut x = 0.0f32;
    for _ in 0..50 {
        let g = get(&df(&[scalar(x)]).unwrap());
        x -= 0.2 * g;
    }
    assert!((x - 3.0).abs() < 1e-3);
}
