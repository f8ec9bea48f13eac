// src/calc/gpu.rs
// wgpu backend for the compute layer. Kernel arguments map to bind group 0:
// every buffer argument becomes a read-write storage binding at its argument
// index and every scalar a 4-byte uniform at its index, so the WGSL rendition
// of the kernels declares the same bindings in the same order.
// RELEVANT FILES:src/calc/mod.rs,src/calc/software.rs,src/strategy/fat_bvh.rs

use std::any::Any;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use once_cell::sync::OnceCell;
use wgpu::util::DeviceExt;

use crate::calc::{
    Arg, Buffer, BufferHandle, BufferKind, Device, DeviceSpec, Event, EventHandle, Executable,
    Function, KernelSource, Platform,
};
use crate::error::{Error, Result};

static SHARED: OnceCell<Arc<WgpuDevice>> = OnceCell::new();

fn backends_from_env() -> wgpu::Backends {
    if let Ok(s) = std::env::var("WGPU_BACKENDS").or_else(|_| std::env::var("WGPU_BACKEND")) {
        let s = s.to_lowercase();
        if s.contains("metal") {
            return wgpu::Backends::METAL;
        }
        if s.contains("vulkan") {
            return wgpu::Backends::VULKAN;
        }
        if s.contains("dx12") {
            return wgpu::Backends::DX12;
        }
        if s.contains("gl") {
            return wgpu::Backends::GL;
        }
    }
    wgpu::Backends::all()
}

pub struct WgpuDevice {
    device: Arc<wgpu::Device>,
    queue: Arc<wgpu::Queue>,
}

impl WgpuDevice {
    pub fn new() -> Result<Self> {
        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor {
            backends: backends_from_env(),
            ..Default::default()
        });

        let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::HighPerformance,
            compatible_surface: None,
            force_fallback_adapter: false,
        }))
        .ok_or_else(|| Error::device("no suitable GPU adapter"))?;

        let info = adapter.get_info();
        log::info!("ray intersector device: {} ({:?})", info.name, info.backend);

        let mut limits = adapter.limits();
        limits = limits.using_resolution(wgpu::Limits::downlevel_defaults());

        let (device, queue) = pollster::block_on(adapter.request_device(
            &wgpu::DeviceDescriptor {
                required_features: wgpu::Features::empty(),
                required_limits: limits,
                label: Some("rayforge-device"),
            },
            None,
        ))
        .map_err(|e| Error::device(format!("request_device failed: {e}")))?;

        Ok(Self {
            device: Arc::new(device),
            queue: Arc::new(queue),
        })
    }

    /// Wrap an existing device/queue pair, for embedding into a renderer
    /// that already owns its wgpu context.
    pub fn from_handles(device: Arc<wgpu::Device>, queue: Arc<wgpu::Queue>) -> Self {
        Self { device, queue }
    }

    /// Process-wide shared device, created on first use.
    pub fn shared() -> Result<Arc<WgpuDevice>> {
        SHARED
            .get_or_try_init(|| WgpuDevice::new().map(Arc::new))
            .map(Arc::clone)
    }
}

struct WgpuBuffer {
    buffer: wgpu::Buffer,
}

impl Buffer for WgpuBuffer {
    fn size(&self) -> u64 {
        self.buffer.size()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

struct WgpuEvent {
    device: Arc<wgpu::Device>,
    submission: wgpu::SubmissionIndex,
}

impl Event for WgpuEvent {
    fn wait(&self) -> Result<()> {
        self.device
            .poll(wgpu::Maintain::WaitForSubmissionIndex(self.submission.clone()));
        Ok(())
    }
}

struct WgpuExecutable {
    device: Arc<wgpu::Device>,
    queue: Arc<wgpu::Queue>,
    module: Arc<wgpu::ShaderModule>,
}

impl Executable for WgpuExecutable {
    fn create_function(&self, name: &str) -> Result<Box<dyn Function>> {
        Ok(Box::new(WgpuFunction {
            device: Arc::clone(&self.device),
            queue: Arc::clone(&self.queue),
            module: Arc::clone(&self.module),
            entry: name.to_string(),
            args: Mutex::new(BTreeMap::new()),
        }))
    }
}

enum StoredArg {
    Buffer(BufferHandle),
    U32(u32),
}

struct WgpuFunction {
    device: Arc<wgpu::Device>,
    queue: Arc<wgpu::Queue>,
    module: Arc<wgpu::ShaderModule>,
    entry: String,
    args: Mutex<BTreeMap<u32, StoredArg>>,
}

impl Function for WgpuFunction {
    fn set_arg(&self, index: u32, arg: Arg<'_>) -> Result<()> {
        let stored = match arg {
            Arg::Buffer(handle) => {
                // Reject handles from another backend at bind time rather
                // than at dispatch.
                if handle.as_any().downcast_ref::<WgpuBuffer>().is_none() {
                    return Err(Error::device("buffer was created by a different backend"));
                }
                StoredArg::Buffer(Arc::clone(handle))
            }
            Arg::U32(value) => StoredArg::U32(value),
        };
        self.args
            .lock()
            .map_err(|_| Error::device("kernel argument mutex poisoned"))?
            .insert(index, stored);
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl WgpuFunction {
    fn dispatch(&self, global_size: u64, local_size: u64) -> Result<wgpu::SubmissionIndex> {
        let args = self
            .args
            .lock()
            .map_err(|_| Error::device("kernel argument mutex poisoned"))?;

        // Scalars become little one-shot uniform buffers; keep them alive
        // until the submit below.
        let mut uniforms: Vec<(u32, wgpu::Buffer)> = Vec::new();
        let mut layout_entries: Vec<wgpu::BindGroupLayoutEntry> = Vec::new();
        for (&index, arg) in args.iter() {
            let ty = match arg {
                StoredArg::Buffer(_) => wgpu::BufferBindingType::Storage { read_only: false },
                StoredArg::U32(value) => {
                    uniforms.push((
                        index,
                        self.device
                            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                                label: Some("kernel-scalar"),
                                contents: &value.to_le_bytes(),
                                usage: wgpu::BufferUsages::UNIFORM,
                            }),
                    ));
                    wgpu::BufferBindingType::Uniform
                }
            };
            layout_entries.push(wgpu::BindGroupLayoutEntry {
                binding: index,
                visibility: wgpu::ShaderStages::COMPUTE,
                ty: wgpu::BindingType::Buffer {
                    ty,
                    has_dynamic_offset: false,
                    min_binding_size: None,
                },
                count: None,
            });
        }

        let mut bind_entries: Vec<wgpu::BindGroupEntry> = Vec::new();
        for (&index, arg) in args.iter() {
            match arg {
                StoredArg::Buffer(handle) => {
                    let buffer = handle
                        .as_any()
                        .downcast_ref::<WgpuBuffer>()
                        .ok_or_else(|| Error::device("buffer was created by a different backend"))?;
                    bind_entries.push(wgpu::BindGroupEntry {
                        binding: index,
                        resource: buffer.buffer.as_entire_binding(),
                    });
                }
                StoredArg::U32(_) => {
                    let uniform = uniforms
                        .iter()
                        .find(|(i, _)| *i == index)
                        .map(|(_, b)| b)
                        .expect("uniform created above");
                    bind_entries.push(wgpu::BindGroupEntry {
                        binding: index,
                        resource: uniform.as_entire_binding(),
                    });
                }
            }
        }

        let bgl = self
            .device
            .create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some("kernel-args"),
                entries: &layout_entries,
            });
        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("kernel-args"),
            layout: &bgl,
            entries: &bind_entries,
        });

        let pipeline_layout = self
            .device
            .create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some("kernel-pipeline-layout"),
                bind_group_layouts: &[&bgl],
                push_constant_ranges: &[],
            });
        let pipeline = self
            .device
            .create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some("kernel-pipeline"),
                layout: Some(&pipeline_layout),
                module: &self.module,
                entry_point: &self.entry,
            });

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("kernel-dispatch"),
            });
        {
            let mut cpass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some(self.entry.as_str()),
                ..Default::default()
            });
            cpass.set_pipeline(&pipeline);
            cpass.set_bind_group(0, &bind_group, &[]);
            cpass.dispatch_workgroups((global_size / local_size) as u32, 1, 1);
        }

        Ok(self.queue.submit([encoder.finish()]))
    }
}

impl Device for WgpuDevice {
    fn spec(&self) -> DeviceSpec {
        DeviceSpec {
            max_alloc_size: self.device.limits().max_buffer_size,
        }
    }

    fn platform(&self) -> Platform {
        Platform::Wgpu
    }

    fn compile_executable(&self, source: &KernelSource) -> Result<Box<dyn Executable>> {
        let text = match source {
            KernelSource::File(path) => std::fs::read_to_string(path)?,
            KernelSource::Embedded(text) => text.to_string(),
            KernelSource::Builtin => {
                return Err(Error::compile(
                    "the wgpu backend has no built-in kernels; provide WGSL source",
                ))
            }
        };

        let module = self
            .device
            .create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some("rayforge-kernels"),
                source: wgpu::ShaderSource::Wgsl(text.into()),
            });

        Ok(Box::new(WgpuExecutable {
            device: Arc::clone(&self.device),
            queue: Arc::clone(&self.queue),
            module: Arc::new(module),
        }))
    }

    fn create_buffer(&self, size: u64, _kind: BufferKind) -> Result<BufferHandle> {
        let buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("rayforge-buffer"),
            size,
            usage: wgpu::BufferUsages::STORAGE
                | wgpu::BufferUsages::COPY_DST
                | wgpu::BufferUsages::COPY_SRC,
            mapped_at_creation: false,
        });
        Ok(Arc::new(WgpuBuffer { buffer }))
    }

    fn create_buffer_with_data(&self, _kind: BufferKind, data: &[u8]) -> Result<BufferHandle> {
        let buffer = self
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("rayforge-buffer"),
                contents: data,
                usage: wgpu::BufferUsages::STORAGE
                    | wgpu::BufferUsages::COPY_DST
                    | wgpu::BufferUsages::COPY_SRC,
            });
        Ok(Arc::new(WgpuBuffer { buffer }))
    }

    fn read_buffer(&self, buffer: &BufferHandle, offset: u64, out: &mut [u8]) -> Result<()> {
        let buffer = buffer
            .as_any()
            .downcast_ref::<WgpuBuffer>()
            .ok_or_else(|| Error::device("buffer was created by a different backend"))?;
        if out.len() % wgpu::COPY_BUFFER_ALIGNMENT as usize != 0 {
            return Err(Error::device("readback size must be 4-byte aligned"));
        }

        let staging = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("rayforge-readback"),
            size: out.len() as u64,
            usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
            mapped_at_creation: false,
        });

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("rayforge-readback"),
            });
        encoder.copy_buffer_to_buffer(&buffer.buffer, offset, &staging, 0, out.len() as u64);
        self.queue.submit([encoder.finish()]);

        let slice = staging.slice(..);
        let (tx, rx) = std::sync::mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |res| {
            let _ = tx.send(res);
        });
        self.device.poll(wgpu::Maintain::Wait);
        rx.recv()
            .map_err(|_| Error::device("map_async channel closed"))?
            .map_err(|e| Error::device(format!("readback mapping failed: {e:?}")))?;

        out.copy_from_slice(&slice.get_mapped_range());
        staging.unmap();
        Ok(())
    }

    fn execute(
        &self,
        func: &dyn Function,
        _queue: u32,
        global_size: u64,
        local_size: u64,
    ) -> Result<EventHandle> {
        // wgpu exposes a single submission queue; the queue index is kept
        // for interface parity and submission order provides the ordering.
        let func = func
            .as_any()
            .downcast_ref::<WgpuFunction>()
            .ok_or_else(|| Error::device("function was created by a different backend"))?;
        if local_size == 0 || global_size % local_size != 0 {
            return Err(Error::device("global size must be a multiple of local size"));
        }

        let submission = func.dispatch(global_size, local_size)?;
        Ok(Box::new(WgpuEvent {
            device: Arc::clone(&self.device),
            submission,
        }))
    }

    fn finish(&self, _queue: u32) -> Result<()> {
        self.device.poll(wgpu::Maintain::Wait);
        Ok(())
    }
}
