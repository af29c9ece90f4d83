//! WGSL code generation from tuned kernels.
//!
//! A tuned kernel's expression references only constants, declared loop
//! variables, and `GlobalIndex` reads, so it renders directly into a single
//! compute shader: one thread per output element, with an inner loop for
//! reductions.

use crate::alu::{AluExp, AluOp};
use crate::kernel::{ReduceOp, TunedKernel, GIDX, RIDX};
use crate::{DType, Scalar};
use std::collections::HashMap;
use std::fmt::Write;

/// WGSL element type for a storage buffer of `dtype`.
///
/// Booleans are not host-shareable in WGSL; kernels with boolean buffers
/// stay on the CPU backend.
pub fn wgsl_type(dtype: DType) -> Option<&'static str> {
    match dtype {
        DType::Float32 => Some("f32"),
        DType::Int32 => Some("i32"),
        DType::Uint32 => Some("u32"),
        DType::Bool | DType::Complex64 => None,
    }
}

fn render_scalar(value: Scalar) -> String {
    match value {
        Scalar::F32(v) => {
            if v == f32::INFINITY {
                "3.4028235e38".to_string()
            } else if v == f32::NEG_INFINITY {
                "-3.4028235e38".to_string()
            } else {
                format!("{:?}", v)
            }
        }
        Scalar::I32(v) => format!("{}", v),
        Scalar::U32(v) => format!("{}u", v),
        Scalar::Bool(v) => format!("{}", v),
        Scalar::C64(..) => panic!("complex64 constant in a shader"),
    }
}

fn render_exp(e: &AluExp) -> String {
    let src = e.src();
    match e.op() {
        AluOp::Const(v) => render_scalar(*v),
        AluOp::Special(name, _) => name.clone(),
        AluOp::Add => format!("({} + {})", render_exp(&src[0]), render_exp(&src[1])),
        AluOp::Sub => format!("({} - {})", render_exp(&src[0]), render_exp(&src[1])),
        AluOp::Mul => format!("({} * {})", render_exp(&src[0]), render_exp(&src[1])),
        AluOp::Idiv => {
            if e.dtype().is_float() {
                format!("floor({} / {})", render_exp(&src[0]), render_exp(&src[1]))
            } else {
                // Index arithmetic is nonnegative, where truncating and
                // flooring division agree.
                format!("({} / {})", render_exp(&src[0]), render_exp(&src[1]))
            }
        }
        AluOp::Mod => {
            if e.dtype().is_float() {
                let a = render_exp(&src[0]);
                let b = render_exp(&src[1]);
                format!("({a} - floor({a} / {b}) * {b})")
            } else {
                format!("({} % {})", render_exp(&src[0]), render_exp(&src[1]))
            }
        }
        AluOp::Neg => format!("(-{})", render_exp(&src[0])),
        AluOp::Sin => format!("sin({})", render_exp(&src[0])),
        AluOp::Cos => format!("cos({})", render_exp(&src[0])),
        AluOp::Exp => format!("exp({})", render_exp(&src[0])),
        AluOp::Log => format!("log({})", render_exp(&src[0])),
        AluOp::Sqrt => format!("sqrt({})", render_exp(&src[0])),
        AluOp::Reciprocal => format!("(1.0 / {})", render_exp(&src[0])),
        AluOp::Cmplt => format!("({} < {})", render_exp(&src[0]), render_exp(&src[1])),
        AluOp::Cmpeq => format!("({} == {})", render_exp(&src[0]), render_exp(&src[1])),
        AluOp::Cmpne => format!("({} != {})", render_exp(&src[0]), render_exp(&src[1])),
        AluOp::Where => format!(
            "select({}, {}, {})",
            render_exp(&src[2]),
            render_exp(&src[1]),
            render_exp(&src[0])
        ),
        AluOp::GlobalIndex { gid } => {
            // Clamp so the lane stays in bounds even when a validity select
            // discards the value; WGSL evaluates both select operands.
            format!(
                "in{g}[u32(clamp({off}, 0, i32(arrayLength(&in{g})) - 1))]",
                g = gid,
                off = render_exp(&src[0])
            )
        }
        AluOp::GlobalView { .. } => panic!("untuned global view in a shader"),
    }
}

/// Dtypes of the input buffers, recovered from the lowered reads. Unused
/// inputs default to float32.
fn input_dtypes(kernel: &TunedKernel) -> Vec<DType> {
    let mut map: HashMap<usize, DType> = HashMap::new();
    for read in kernel.exp.collect(&|e| matches!(e.op(), AluOp::GlobalIndex { .. })) {
        if let AluOp::GlobalIndex { gid } = read.op() {
            map.insert(*gid, read.dtype());
        }
    }
    (0..kernel.nargs).map(|g| map.get(&g).copied().unwrap_or(DType::Float32)).collect()
}

/// Render a tuned kernel to a WGSL compute shader with entry point `main`.
///
/// Returns `None` when a buffer dtype is not host-shareable on WebGPU.
pub fn kernel_shader(kernel: &TunedKernel) -> Option<String> {
    let out_ty = wgsl_type(kernel.out_dtype())?;
    let in_tys: Vec<&str> = input_dtypes(kernel)
        .into_iter()
        .map(wgsl_type)
        .collect::<Option<_>>()?;

    let mut s = String::new();
    for (g, ty) in in_tys.iter().enumerate() {
        writeln!(
            s,
            "@group(0) @binding({}) var<storage, read> in{}: array<{}>;",
            g, g, ty
        )
        .unwrap();
    }
    writeln!(
        s,
        "@group(0) @binding({}) var<storage, read_write> out0: array<{}>;",
        kernel.nargs, out_ty
    )
    .unwrap();
    writeln!(s).unwrap();
    writeln!(s, "@compute @workgroup_size(256)").unwrap();
    writeln!(s, "fn main(@builtin(global_invocation_id) global_id: vec3<u32>) {{").unwrap();
    writeln!(s, "    let {} = i32(global_id.x);", GIDX).unwrap();
    writeln!(s, "    if ({} >= {}) {{ return; }}", GIDX, kernel.size).unwrap();
    let body = render_exp(&kernel.exp);
    match &kernel.reduction {
        None => {
            writeln!(s, "    out0[{}] = {};", GIDX, body).unwrap();
        }
        Some(red) => {
            let init = match (red.op, red.dtype) {
                (ReduceOp::Add, DType::Float32) => "0.0",
                (ReduceOp::Add, DType::Int32) => "0",
                (ReduceOp::Add, DType::Uint32) => "0u",
                (ReduceOp::Max, DType::Float32) => "-3.4028235e38",
                (ReduceOp::Max, DType::Int32) => "-2147483648",
                (ReduceOp::Max, DType::Uint32) => "0u",
                _ => return None,
            };
            writeln!(s, "    var acc: {} = {};", out_ty, init).unwrap();
            writeln!(
                s,
                "    for (var {r}: i32 = 0; {r} < {}; {r} = {r} + 1) {{",
                red.size,
                r = RIDX
            )
            .unwrap();
            match red.op {
                ReduceOp::Add => writeln!(s, "        acc = acc + {};", body).unwrap(),
                ReduceOp::Max => writeln!(s, "        acc = max(acc, {});", body).unwrap(),
            }
            writeln!(s, "    }}").unwrap();
            writeln!(s, "    out0[{}] = acc;", GIDX).unwrap();
        }
    }
    writeln!(s, "}}").unwrap();
    Some(s)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::{tune, Kernel, Reduction};
    use crate::view::{unravel_alu, ShapeTracker};

    fn gview(gid: usize, shape: &[usize]) -> AluExp {
        let tracker = ShapeTracker::contiguous(shape);
        let gidx = AluExp::special(GIDX, tracker.size() as i64);
        let indices = unravel_alu(shape, &gidx).unwrap();
        AluExp::global_view(gid, DType::Float32, tracker, indices).unwrap()
    }

    #[test]
    fn test_elementwise_shader_shape() {
        let exp = AluExp::mul(gview(0, &[8]), gview(1, &[8])).unwrap();
        let tuned = tune(&Kernel { nargs: 2, size: 8, exp, reduction: None }).unwrap();
        let shader = kernel_shader(&tuned).unwrap();
        assert!(shader.contains("@binding(0) var<storage, read> in0: array<f32>"));
        assert!(shader.contains("@binding(2) var<storage, read_write> out0: array<f32>"));
        assert!(shader.contains("if (gidx >= 8) { return; }"));
        assert!(!shader.contains("ridx"));
    }

    #[test]
    fn test_reduction_shader_loop() {
        let tracker = ShapeTracker::contiguous(&[4, 8]);
        let exp = AluExp::global_view(
            0,
            DType::Float32,
            tracker,
            vec![AluExp::special(GIDX, 4), AluExp::special(RIDX, 8)],
        )
        .unwrap();
        let tuned = tune(&Kernel {
            nargs: 1,
            size: 4,
            exp,
            reduction: Some(Reduction { dtype: DType::Float32, op: ReduceOp::Add, size: 8 }),
        })
        .unwrap();
        let shader = kernel_shader(&tuned).unwrap();
        assert!(shader.contains("var acc: f32 = 0.0;"));
        assert!(shader.contains("for (var ridx: i32 = 0; ridx < 8;"));
        assert!(shader.contains("acc = acc + "));
    }

    #[test]
    fn test_bool_buffers_rejected() {
        let exp = AluExp::cmplt(gview(0, &[4]), gview(1, &[4])).unwrap();
        let tuned = tune(&Kernel { nargs: 2, size: 4, exp, reduction: None }).unwrap();
        assert!(kernel_shader(&tuned).is_none());
    }

    #[test]
    fn test_float_constant_renders_with_decimal() {
        assert_eq!(render_scalar(Scalar::F32(2.0)), "2.0");
        assert_eq!(render_scalar(Scalar::U32(3)), "3u");
    }
}
