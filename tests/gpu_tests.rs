//! WebGPU backend tests. Skipped silently when no adapter is available.

use microjax::backend::{Backend, WebGpuBackend};
use microjax::trace::jit::compile;
use microjax::{make_jaxpr, AbstractValue, DType, Shape, Value};
use std::sync::Arc;

fn gpu_backend() -> Option<Arc<dyn Backend>> {
    WebGpuBackend::new().ok().map(|b| Arc::new(b) as Arc<dyn Backend>)
}

fn f32_aval(dims: &[usize]) -> AbstractValue {
    AbstractValue::new(Shape::new(dims.to_vec()), DType::Float32)
}

#[test]
fn test_gpu_slot_roundtrip() {
    let Some(backend) = gpu_backend() else { return };
    let data: Vec<f32> = (0..64).map(|i| i as f32).collect();
    let slot = backend
        .malloc(data.len() * 4, Some(bytemuck::cast_slice(&data)))
        .unwrap();
    let bytes = backend.read_sync(slot, 0, None).unwrap();
    let back: Vec<f32> = bytemuck::cast_slice(&bytes).to_vec();
    assert_eq!(back, data);
    backend.dec_ref(slot).unwrap();
}

#[test]
fn test_gpu_fused_program_matches_cpu() {
    let Some(backend) = gpu_backend() else { return };
    let (jaxpr, _) = make_jaxpr(
        |args| vec![args[0].sin().mul(&args[0].cos()).sum(&[0])],
        &[f32_aval(&[8, 4])],
    )
    .unwrap();

    let data: Vec<f32> = (0..32).map(|i| (i as f32) * 0.21 - 3.0).collect();

    let cpu_program = compile(&jaxpr, &[], microjax::backend::default_backend()).unwrap();
    let cpu_x = microjax::Array::from_vec(data.clone(), Shape::new(vec![8, 4]));
    let want = cpu_program.execute(&[cpu_x]).unwrap()[0].to_vec();

    let gpu_program = compile(&jaxpr, &[], backend.clone()).unwrap();
    assert_eq!(gpu_program.num_executes(), 1);
    let slot = backend
        .malloc(data.len() * 4, Some(bytemuck::cast_slice(&data)))
        .unwrap();
    let gpu_x = gpu_array(slot, &[8, 4], backend.clone());
    let got = gpu_program.execute(&[gpu_x]).unwrap()[0].to_vec();

    for (g, w) in got.iter().zip(want.iter()) {
        assert!((g - w).abs() < 1e-4, "{} vs {}", g, w);
    }
}

fn gpu_array(
    slot: microjax::backend::Slot,
    dims: &[usize],
    backend: Arc<dyn Backend>,
) -> microjax::Array {
    // Wrap an externally created slot; the Array takes the reference over.
    microjax::Array::adopt(slot, f32_aval(dims), backend)
}

#[test]
fn test_gpu_elementwise_chain() {
    let Some(backend) = gpu_backend() else { return };
    let (jaxpr, _) = make_jaxpr(
        |args: &[Value]| vec![args[0].exp().add(&args[0].neg())],
        &[f32_aval(&[256])],
    )
    .unwrap();
    let program = compile(&jaxpr, &[], backend.clone()).unwrap();
    assert_eq!(program.num_executes(), 1);

    let data: Vec<f32> = (0..256).map(|i| (i as f32) * 0.01).collect();
    let slot = backend
        .malloc(data.len() * 4, Some(bytemuck::cast_slice(&data)))
        .unwrap();
    let x = gpu_array(slot, &[256], backend);
    let got = program.execute(&[x]).unwrap()[0].to_vec();
    for (g, x) in got.iter().zip(data.iter()) {
        assert!((g - (x.exp() - x)).abs() < 1e-3);
    }
}
