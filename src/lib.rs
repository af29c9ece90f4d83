//! # microjax
//!
//! A tracing autodiff and JIT kernel-fusion core for NumPy-style arrays,
//! modeled after JAX and running on CPU or WebGPU.
//!
//! ## Key Features
//!
//! - **Function transformations**: `jvp`, `linearize`, `vjp`, `grad`, `jit`
//!   compose over ordinary Rust closures on [`Value`]s.
//! - **Typed IR**: traced programs become [`trace::Jaxpr`]s with a stable
//!   text format, typechecking, flattening, and simplification.
//! - **Kernel fusion**: `jit` schedules traced programs as fused kernels,
//!   with fusion gates decided by dataflow analysis.
//! - **View algebra**: broadcast, reshape, permute, pad, shrink, and flip
//!   compose as zero-copy views over device buffers.
//! - **Pluggable backends**: a reference CPU interpreter and a WebGPU
//!   compute backend behind one slot-and-kernel contract.
//!
//! ## Quick Start
//!
//! ```
//! use microjax::{grad, Value};
//!
//! // d/dx x^3 at 4 is 48
//! let df = grad(|args: &[Value]| args[0].mul(&args[0]).mul(&args[0]));
//! let g = df(&[Value::scalar(4.0)]).unwrap();
//! assert_eq!(g.expect_concrete().unwrap().item_f32(), 48.0);
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod alu;
mod array;
pub mod backend;
mod dtype;
mod error;
pub mod kernel;
pub mod random;
mod shape;
pub mod trace;
pub mod tree;
pub mod utils;
pub mod view;

// Public exports
pub use array::Array;
pub use dtype::{DType, Scalar};
pub use error::{Error, Result};
pub use shape::{AbstractValue, Shape};
pub use trace::{
    grad, jit, jvp, linearize, make_jaxpr, typecheck_jaxpr, value_and_grad, vjp, Jaxpr, Value,
};
pub use tree::{jvp_tree, linearize_tree, Tree, TreeDef};
