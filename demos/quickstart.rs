//! Quick tour: arrays, gradients, and jit.

use microjax::{grad, jit, linearize, random, Array, Shape, Value};

fn main() {
    // Arrays are eager by default.
    let x = Value::from(Array::from_vec(vec![1.0, 2.0, 3.0], Shape::new(vec![3])));
    let y = x.sin().mul(&x);
    println!("sin(x) * x = {:?}", y.expect_concrete().unwrap().to_vec());

    // Gradients of scalar-valued functions.
    let df = grad(|args: &[Value]| args[0].mul(&args[0]).mul(&args[0]));
    let g = df(&[Value::scalar(4.0)]).unwrap();
    println!("d/dx x^3 at 4 = {}", g.expect_concrete().unwrap().item_f32());

    // Linearize once, apply the linear map many times.
    let (y0, lin) = linearize(|args| vec![args[0].sin()], &[Value::scalar(3.0)]).unwrap();
    println!(
        "sin(3) = {}, dsin(3) . 1 = {}",
        y0[0].expect_concrete().unwrap().item_f32(),
        lin.call(&[Value::scalar(1.0)]).unwrap()[0]
            .expect_concrete()
            .unwrap()
            .item_f32()
    );

    // jit fuses the whole expression into one kernel.
    let f = jit(|args: &[Value]| vec![args[0].sin().mul(&args[0].cos()).sum_all()]);
    let big = Value::from(Array::from_vec(
        (0..1000).map(|i| i as f32 * 0.01).collect(),
        Shape::new(vec![1000]),
    ));
    let out = f.call(&[big]).unwrap();
    println!("fused sum = {}", out[0].expect_concrete().unwrap().item_f32());

    // Splittable PRNG keys.
    let key = random::key(42);
    let samples = random::uniform(&key, &[5]).unwrap();
    println!("uniform(key, 5) = {:?}", samples.to_vec());
}
