//! WebGPU backend implementation.
//!
//! Slots are `wgpu` storage buffers in a refcounted table; kernels are
//! compiled from tuned expressions to WGSL (see [`crate::backend::shaders`])
//! and dispatched one workgroup-grid per kernel. The device is acquired
//! lazily, once per process, when the first backend is constructed.

use crate::backend::{shaders, Backend, CancelToken, Slot};
use crate::error::{Error, Result};
use crate::kernel::TunedKernel;
use futures::future::BoxFuture;
use log::{debug, trace};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, OnceLock};

/// Device and queue shared by every [`WebGpuBackend`] in the process.
pub struct GpuDevice {
    /// Logical device handle.
    pub device: wgpu::Device,
    /// Submission queue.
    pub queue: wgpu::Queue,
}

static GPU_DEVICE: OnceLock<Option<GpuDevice>> = OnceLock::new();

fn acquire_device() -> Option<GpuDevice> {
    pollster::block_on(async {
        let adapter = wgpu::Instance::default()
            .request_adapter(&wgpu::RequestAdapterOptions::default())
            .await?;
        debug!("webgpu adapter: {}", adapter.get_info().name);
        let (device, queue) = adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: Some("microjax device"),
                    ..Default::default()
                },
                None,
            )
            .await
            .ok()?;
        Some(GpuDevice { device, queue })
    })
}

/// The process-wide GPU device, if this machine has a usable adapter.
/// The first call performs the (blocking) adapter and device request;
/// later calls reuse the outcome, including a failed one.
pub fn gpu_device() -> Option<&'static GpuDevice> {
    GPU_DEVICE.get_or_init(acquire_device).as_ref()
}

struct GpuSlotEntry {
    buffer: wgpu::Buffer,
    byte_size: usize,
    refs: usize,
}

/// Backend dispatching tuned kernels as WGSL compute shaders.
pub struct WebGpuBackend {
    gpu: &'static GpuDevice,
    slots: Mutex<HashMap<u64, GpuSlotEntry>>,
    next_id: AtomicU64,
}

impl WebGpuBackend {
    /// Create a backend, acquiring the shared device on first use.
    ///
    /// Fails when the machine has no usable WebGPU adapter.
    ///
    /// # Examples
    ///
    /// ```rust,no_run
    /// use microjax::backend::WebGpuBackend;
    ///
    /// if let Ok(backend) = WebGpuBackend::new() {
    ///     // dispatch kernels through `backend`
    ///     let _ = backend;
    /// }
    /// ```
    pub fn new() -> Result<WebGpuBackend> {
        let gpu = gpu_device().ok_or_else(|| {
            Error::Backend("no usable WebGPU adapter on this machine".to_string())
        })?;
        Ok(WebGpuBackend {
            gpu,
            slots: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        })
    }

    /// True when a WebGPU device can be (or already was) acquired.
    pub fn available() -> bool {
        gpu_device().is_some()
    }

    fn entry_err(slot: Slot) -> Error {
        Error::Slot(format!("slot {} is freed or invalid", slot.0))
    }
}

impl Backend for WebGpuBackend {
    fn kind(&self) -> &'static str {
        "webgpu"
    }

    fn malloc(&self, byte_size: usize, init: Option<&[u8]>) -> Result<Slot> {
        // Storage bindings want 4-byte alignment.
        let padded = byte_size.next_multiple_of(4).max(4);
        let usage = wgpu::BufferUsages::STORAGE
            | wgpu::BufferUsages::COPY_DST
            | wgpu::BufferUsages::COPY_SRC;
        let buffer = match init {
            Some(bytes) => {
                if bytes.len() != byte_size {
                    return Err(Error::Slot(format!(
                        "malloc of {} bytes initialized with {} bytes",
                        byte_size,
                        bytes.len()
                    )));
                }
                let mut padded_bytes = bytes.to_vec();
                padded_bytes.resize(padded, 0);
                use wgpu::util::DeviceExt;
                self.gpu.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
                    label: Some("microjax slot"),
                    contents: &padded_bytes,
                    usage,
                })
            }
            None => self.gpu.device.create_buffer(&wgpu::BufferDescriptor {
                label: Some("microjax slot"),
                size: padded as u64,
                usage,
                mapped_at_creation: false,
            }),
        };
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.slots
            .lock()
            .unwrap()
            .insert(id, GpuSlotEntry { buffer, byte_size, refs: 1 });
        trace!("webgpu malloc slot {} ({} bytes)", id, byte_size);
        Ok(Slot(id))
    }

    fn inc_ref(&self, slot: Slot) -> Result<()> {
        let mut slots = self.slots.lock().unwrap();
        let entry = slots.get_mut(&slot.0).ok_or_else(|| Self::entry_err(slot))?;
        entry.refs += 1;
        Ok(())
    }

    fn dec_ref(&self, slot: Slot) -> Result<()> {
        let mut slots = self.slots.lock().unwrap();
        let entry = slots.get_mut(&slot.0).ok_or_else(|| Self::entry_err(slot))?;
        entry.refs -= 1;
        if entry.refs == 0 {
            slots.remove(&slot.0);
        }
        Ok(())
    }

    fn read(
        &self,
        slot: Slot,
        start: usize,
        count: Option<usize>,
    ) -> BoxFuture<'static, Result<Vec<u8>>> {
        let result = self.read_now(slot, start, count);
        Box::pin(futures::future::ready(result))
    }

    fn execute(
        &self,
        kernel: &TunedKernel,
        inputs: &[Slot],
        outputs: &[Slot],
        cancel: Option<&CancelToken>,
    ) -> BoxFuture<'static, Result<()>> {
        // Work is recorded and submitted before the future resolves; the
        // queue wait keeps frees of consumed slots safe afterwards.
        let result = self.dispatch(kernel, inputs, outputs, cancel);
        Box::pin(futures::future::ready(result))
    }
}

impl WebGpuBackend {
    fn read_now(&self, slot: Slot, start: usize, count: Option<usize>) -> Result<Vec<u8>> {
        let slots = self.slots.lock().unwrap();
        let entry = slots.get(&slot.0).ok_or_else(|| Self::entry_err(slot))?;
        let end = count.map_or(entry.byte_size, |c| start + c);
        if end > entry.byte_size {
            return Err(Error::Slot(format!(
                "read past end of slot {} ({} > {})",
                slot.0, end, entry.byte_size
            )));
        }
        let byte_len = (end - start).next_multiple_of(4) as u64;

        let staging = self.gpu.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("microjax staging (read)"),
            size: byte_len,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let mut encoder = self
            .gpu
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("microjax read encoder"),
            });
        encoder.copy_buffer_to_buffer(&entry.buffer, start as u64, &staging, 0, byte_len);
        self.gpu.queue.submit(Some(encoder.finish()));

        let slice = staging.slice(..);
        let (tx, rx) = futures::channel::oneshot::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = tx.send(result);
        });
        self.gpu.device.poll(wgpu::Maintain::Wait);
        pollster::block_on(rx)
            .map_err(|_| Error::Backend("buffer map callback dropped".to_string()))?
            .map_err(|e| Error::Backend(format!("buffer map failed: {:?}", e)))?;

        let data = slice.get_mapped_range();
        let mut out = data.to_vec();
        drop(data);
        staging.unmap();
        out.truncate(end - start);
        Ok(out)
    }

    fn dispatch(
        &self,
        kernel: &TunedKernel,
        inputs: &[Slot],
        outputs: &[Slot],
        cancel: Option<&CancelToken>,
    ) -> Result<()> {
        if inputs.len() != kernel.nargs {
            return Err(Error::Backend(format!(
                "kernel expects {} inputs, got {}",
                kernel.nargs,
                inputs.len()
            )));
        }
        if cancel.is_some_and(CancelToken::is_cancelled) {
            return Err(Error::Backend("dispatch cancelled".to_string()));
        }
        let shader_code = shaders::kernel_shader(kernel).ok_or_else(|| {
            Error::Backend(format!(
                "dtype {} is not dispatchable on webgpu",
                kernel.out_dtype()
            ))
        })?;
        debug!("webgpu dispatch: size={} nargs={}", kernel.size, kernel.nargs);

        let device = &self.gpu.device;
        let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("microjax kernel"),
            source: wgpu::ShaderSource::Wgsl(shader_code.into()),
        });

        let mut layout_entries = Vec::with_capacity(kernel.nargs + 1);
        for binding in 0..=kernel.nargs as u32 {
            layout_entries.push(wgpu::BindGroupLayoutEntry {
                binding,
                visibility: wgpu::ShaderStages::COMPUTE,
                ty: wgpu::BindingType::Buffer {
                    ty: wgpu::BufferBindingType::Storage {
                        read_only: (binding as usize) < kernel.nargs,
                    },
                    has_dynamic_offset: false,
                    min_binding_size: None,
                },
                count: None,
            });
        }
        let bind_group_layout =
            device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some("microjax kernel layout"),
                entries: &layout_entries,
            });
        let pipeline_layout =
            device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some("microjax kernel pipeline layout"),
                bind_group_layouts: &[&bind_group_layout],
                push_constant_ranges: &[],
            });
        let pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some("microjax kernel pipeline"),
            layout: Some(&pipeline_layout),
            module: &shader,
            entry_point: "main",
            compilation_options: Default::default(),
            cache: None,
        });

        let slots = self.slots.lock().unwrap();
        let mut group_entries = Vec::with_capacity(kernel.nargs + 1);
        for (binding, slot) in inputs.iter().chain(outputs.iter().take(1)).enumerate() {
            let entry = slots.get(&slot.0).ok_or_else(|| Self::entry_err(*slot))?;
            group_entries.push(wgpu::BindGroupEntry {
                binding: binding as u32,
                resource: entry.buffer.as_entire_binding(),
            });
        }
        let bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("microjax kernel bind group"),
            layout: &bind_group_layout,
            entries: &group_entries,
        });

        let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("microjax kernel encoder"),
        });
        {
            let mut cpass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("microjax kernel pass"),
                timestamp_writes: None,
            });
            cpass.set_pipeline(&pipeline);
            cpass.set_bind_group(0, &bind_group, &[]);
            let workgroups = (kernel.size as u32).div_ceil(256);
            cpass.dispatch_workgroups(workgroups.max(1), 1, 1);
        }
        // A cancellation that lands before submission drops the work whole.
        if cancel.is_some_and(CancelToken::is_cancelled) {
            return Err(Error::Backend("dispatch cancelled".to_string()));
        }
        self.gpu.queue.submit(Some(encoder.finish()));
        self.gpu.device.poll(wgpu::Maintain::Wait);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_availability_query_is_stable() {
        // Whatever the answer, asking twice must agree (the acquisition
        // outcome is cached for the process).
        assert_eq!(WebGpuBackend::available(), WebGpuBackend::available());
    }

    #[test]
    fn test_roundtrip_when_available() {
        let Ok(backend) = WebGpuBackend::new() else { return };
        let data: Vec<f32> = vec![1.0, 2.0, 3.0, 4.0];
        let slot = backend
            .malloc(16, Some(bytemuck::cast_slice(&data)))
            .unwrap();
        let bytes = backend.read_sync(slot, 0, None).unwrap();
        let back: Vec<f32> = bytemuck::cast_slice(&bytes).to_vec();
        assert_eq!(back, data);
        backend.dec_ref(slot).unwrap();
    }
}
