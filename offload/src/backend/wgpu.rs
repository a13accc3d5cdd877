//! GPU backend on wgpu.
//!
//! Platforms are wgpu backends (Vulkan, Metal, DX12, GL). Buffer slot `i`
//! is storage binding `i` of group 0, scalar slot `i` a 16-byte uniform at
//! binding `i`; local scratch lives in the shader's workgroup variables and
//! takes no binding. wgpu has a single queue per device, so every per-kernel
//! queue submits to it.

use std::borrow::Cow;
use std::sync::Arc;

use offload_types::{AccessMode, DeviceSelector, DeviceType, Dialect, Platform, ScalarValue, WorkShape};
use pollster::block_on;
use tracing::{debug, info, warn};
use wgpu::{
    Backends, BindGroupDescriptor, BindGroupEntry, BindGroupLayoutDescriptor, BindGroupLayoutEntry,
    BindingResource, BindingType, BufferBindingType, BufferDescriptor, BufferUsages,
    CommandEncoderDescriptor, ComputePassDescriptor, ComputePipelineDescriptor, DeviceDescriptor,
    ErrorFilter, InstanceDescriptor, Maintain, MapMode, PipelineCompilationOptions,
    PipelineLayoutDescriptor, ShaderModuleDescriptor, ShaderSource, ShaderStages,
};

use super::{Backend, DeviceInfo, KernelArg, SlotKind};
use crate::program::{wgsl_entry_points, ProgramImage};
use crate::{spirv, Error, Result};

const UNIFORM_SIZE: u64 = 16;

pub struct WgpuBackend {
    instance: wgpu::Instance,
}

impl WgpuBackend {
    pub fn new() -> Self {
        let instance = wgpu::Instance::new(InstanceDescriptor {
            backends: Backends::all(),
            ..Default::default()
        });
        Self { instance }
    }
}

impl Default for WgpuBackend {
    fn default() -> Self {
        Self::new()
    }
}

fn platform_backends(platform: Platform) -> Option<Backends> {
    match platform {
        Platform::Vulkan => Some(Backends::VULKAN),
        Platform::Metal => Some(Backends::METAL),
        Platform::Dx12 => Some(Backends::DX12),
        Platform::Gl => Some(Backends::GL),
        Platform::OpenCl | Platform::Host => None,
    }
}

fn adapter_type(info: &wgpu::AdapterInfo) -> DeviceType {
    match info.device_type {
        wgpu::DeviceType::DiscreteGpu | wgpu::DeviceType::IntegratedGpu | wgpu::DeviceType::VirtualGpu => {
            DeviceType::Gpu
        }
        wgpu::DeviceType::Cpu => DeviceType::Cpu,
        wgpu::DeviceType::Other => DeviceType::Accelerator,
    }
}

pub struct WgpuContext {
    device: Arc<wgpu::Device>,
    queue: Arc<wgpu::Queue>,
    limits: wgpu::Limits,
}

impl WgpuContext {
    fn capture<T>(&self, filter: ErrorFilter, f: impl FnOnce() -> T) -> (T, Option<wgpu::Error>) {
        self.device.push_error_scope(filter);
        let value = f();
        let error = block_on(self.device.pop_error_scope());
        (value, error)
    }

    fn wait(&self) {
        self.device.poll(Maintain::Wait);
    }
}

pub struct WgpuQueue {
    label: String,
    queue: Arc<wgpu::Queue>,
}

impl WgpuQueue {
    pub fn label(&self) -> &str {
        &self.label
    }
}

pub struct WgpuProgram {
    module: wgpu::ShaderModule,
    entry_points: Vec<String>,
}

pub struct WgpuBuffer {
    label: String,
    bytes: usize,
    buffer: Arc<wgpu::Buffer>,
    // present when the kernel writes the buffer
    staging: Option<wgpu::Buffer>,
}

pub struct WgpuKernel {
    name: String,
    pipeline: wgpu::ComputePipeline,
    layout: wgpu::BindGroupLayout,
    slots: Vec<SlotKind>,
    uniforms: Vec<Option<wgpu::Buffer>>,
    storage: Vec<Option<Arc<wgpu::Buffer>>>,
    scalars: Vec<Option<ScalarValue>>,
    bound: Vec<bool>,
}

fn padded(bytes: usize) -> u64 {
    (bytes as u64).div_ceil(wgpu::COPY_BUFFER_ALIGNMENT) * wgpu::COPY_BUFFER_ALIGNMENT
}

impl Backend for WgpuBackend {
    type Context = WgpuContext;
    type Queue = WgpuQueue;
    type Program = WgpuProgram;
    type Kernel = WgpuKernel;
    type Buffer = WgpuBuffer;

    fn name(&self) -> &'static str {
        "wgpu"
    }

    fn accepts(&self, dialect: Dialect) -> bool {
        matches!(dialect, Dialect::Wgsl | Dialect::SpirV)
    }

    fn resolve_device(&self, selector: &DeviceSelector) -> Result<(WgpuContext, DeviceInfo)> {
        let mut platforms = Vec::new();
        for &platform in selector.platforms() {
            let Some(backends) = platform_backends(platform) else {
                continue;
            };
            let adapters = self.instance.enumerate_adapters(backends);
            debug!(?platform, adapters = adapters.len(), "platform probed");
            if !adapters.is_empty() {
                platforms.push((platform, adapters));
            }
        }

        let (platform, adapters) = platforms
            .into_iter()
            .nth(selector.platform_index)
            .ok_or(Error::NoPlatformAvailable)?;
        let adapter = adapters
            .into_iter()
            .filter(|a| selector.device_type == DeviceType::Any || adapter_type(&a.get_info()) == selector.device_type)
            .nth(selector.device_index)
            .ok_or(Error::NoDeviceAvailable)?;

        let adapter_info = adapter.get_info();
        let limits = adapter.limits();
        let (device, queue) = block_on(adapter.request_device(
            &DeviceDescriptor {
                label: Some("offload"),
                required_features: wgpu::Features::empty(),
                required_limits: limits.clone(),
            },
            None,
        ))
        .map_err(|e| Error::Device(e.to_string()))?;
        device.on_uncaptured_error(Box::new(|e| warn!(error = %e, "uncaptured wgpu error")));
        info!(adapter = %adapter_info.name, backend = ?adapter_info.backend, "wgpu device created");

        let info = DeviceInfo {
            platform,
            name: adapter_info.name.clone(),
            device_type: adapter_type(&adapter_info),
        };
        let context = WgpuContext {
            device: Arc::new(device),
            queue: Arc::new(queue),
            limits,
        };
        Ok((context, info))
    }

    fn create_queue(&self, context: &WgpuContext, label: &str) -> Result<WgpuQueue> {
        Ok(WgpuQueue {
            label: label.to_string(),
            queue: Arc::clone(&context.queue),
        })
    }

    fn build_program(&self, context: &WgpuContext, image: &ProgramImage) -> Result<WgpuProgram> {
        let (source, entry_points) = match image.dialect {
            Dialect::Wgsl => {
                let text = image.text()?;
                (ShaderSource::Wgsl(Cow::Owned(text.to_string())), wgsl_entry_points(text))
            }
            Dialect::SpirV => {
                let module = spirv::parse(&image.bytes)?;
                (
                    ShaderSource::SpirV(Cow::Owned(module.words().to_vec())),
                    module.entry_point_names(),
                )
            }
            other => {
                return Err(Error::BuildFailed(format!(
                    "wgpu cannot build {other:?} programs"
                )))
            }
        };

        let label = image.path.display().to_string();
        let (module, error) = context.capture(ErrorFilter::Validation, || {
            context.device.create_shader_module(ShaderModuleDescriptor {
                label: Some(&label),
                source,
            })
        });
        if let Some(e) = error {
            return Err(Error::BuildFailed(e.to_string()));
        }
        Ok(WgpuProgram { module, entry_points })
    }

    fn entry_points(&self, program: &WgpuProgram) -> Vec<String> {
        program.entry_points.clone()
    }

    fn create_kernel(
        &self,
        context: &WgpuContext,
        program: &WgpuProgram,
        name: &str,
        slots: &[SlotKind],
    ) -> Result<WgpuKernel> {
        let fail = |reason: String| Error::KernelCreation {
            name: name.to_string(),
            reason,
        };

        let local_bytes: usize = slots
            .iter()
            .map(|s| match s {
                SlotKind::Local { bytes } => *bytes,
                _ => 0,
            })
            .sum();
        let local_limit = context.limits.max_compute_workgroup_storage_size as usize;
        if local_bytes > local_limit {
            return Err(fail(format!(
                "{local_bytes} bytes of local scratch exceed the device limit of {local_limit}"
            )));
        }

        let entries: Vec<BindGroupLayoutEntry> = slots
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| {
                let ty = match slot {
                    SlotKind::Buffer { access } => BufferBindingType::Storage {
                        read_only: !access.kernel_writes(),
                    },
                    SlotKind::Scalar { .. } => BufferBindingType::Uniform,
                    SlotKind::Local { .. } => return None,
                };
                Some(BindGroupLayoutEntry {
                    binding: i as u32,
                    visibility: ShaderStages::COMPUTE,
                    ty: BindingType::Buffer {
                        ty,
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                })
            })
            .collect();

        let ((layout, pipeline), error) = context.capture(ErrorFilter::Validation, || {
            let layout = context.device.create_bind_group_layout(&BindGroupLayoutDescriptor {
                label: Some(name),
                entries: &entries,
            });
            let pipeline_layout = context.device.create_pipeline_layout(&PipelineLayoutDescriptor {
                label: Some(name),
                bind_group_layouts: &[&layout],
                push_constant_ranges: &[],
            });
            let pipeline = context.device.create_compute_pipeline(&ComputePipelineDescriptor {
                label: Some(name),
                layout: Some(&pipeline_layout),
                module: &program.module,
                entry_point: name,
                compilation_options: PipelineCompilationOptions::default(),
            });
            (layout, pipeline)
        });
        if let Some(e) = error {
            return Err(fail(e.to_string()));
        }

        let uniforms = slots
            .iter()
            .enumerate()
            .map(|(i, slot)| match slot {
                SlotKind::Scalar { .. } => Some(context.device.create_buffer(&BufferDescriptor {
                    label: Some(&format!("{name}#{i}")),
                    size: UNIFORM_SIZE,
                    usage: BufferUsages::UNIFORM | BufferUsages::COPY_DST,
                    mapped_at_creation: false,
                })),
                _ => None,
            })
            .collect();

        Ok(WgpuKernel {
            name: name.to_string(),
            pipeline,
            layout,
            slots: slots.to_vec(),
            uniforms,
            storage: vec![None; slots.len()],
            scalars: vec![None; slots.len()],
            bound: vec![false; slots.len()],
        })
    }

    fn create_buffer(&self, context: &WgpuContext, label: &str, bytes: usize, access: AccessMode) -> Result<WgpuBuffer> {
        let fail = |reason: String| Error::Allocation {
            name: label.to_string(),
            bytes,
            reason,
        };
        let size = padded(bytes);
        if bytes == 0 {
            return Err(fail("zero-sized allocation".into()));
        }
        let limit = (context.limits.max_storage_buffer_binding_size as u64).min(context.limits.max_buffer_size);
        if size > limit {
            return Err(fail(format!("device limit is {limit} bytes")));
        }

        let ((buffer, staging), error) = context.capture(ErrorFilter::OutOfMemory, || {
            let buffer = context.device.create_buffer(&BufferDescriptor {
                label: Some(label),
                size,
                usage: BufferUsages::STORAGE | BufferUsages::COPY_DST | BufferUsages::COPY_SRC,
                mapped_at_creation: false,
            });
            let staging = access.kernel_writes().then(|| {
                context.device.create_buffer(&BufferDescriptor {
                    label: Some(&format!("{label} staging")),
                    size,
                    usage: BufferUsages::COPY_DST | BufferUsages::MAP_READ,
                    mapped_at_creation: false,
                })
            });
            (buffer, staging)
        });
        if let Some(e) = error {
            return Err(fail(e.to_string()));
        }

        Ok(WgpuBuffer {
            label: label.to_string(),
            bytes,
            buffer: Arc::new(buffer),
            staging,
        })
    }

    fn write_buffer(&self, context: &WgpuContext, queue: &WgpuQueue, buffer: &mut WgpuBuffer, data: &[u8]) -> Result<()> {
        if data.len() != buffer.bytes {
            return Err(Error::Transfer {
                buffer: buffer.label.clone(),
                reason: format!("{} bytes written to a {}-byte buffer", data.len(), buffer.bytes),
            });
        }
        let size = padded(buffer.bytes) as usize;
        if size == data.len() {
            queue.queue.write_buffer(&buffer.buffer, 0, data);
        } else {
            let mut tail = data.to_vec();
            tail.resize(size, 0);
            queue.queue.write_buffer(&buffer.buffer, 0, &tail);
        }
        queue.queue.submit(std::iter::empty());
        context.wait();
        Ok(())
    }

    fn read_buffer(&self, context: &WgpuContext, queue: &WgpuQueue, buffer: &WgpuBuffer, out: &mut [u8]) -> Result<()> {
        let fail = |reason: String| Error::Transfer {
            buffer: buffer.label.clone(),
            reason,
        };
        if out.len() != buffer.bytes {
            return Err(fail(format!("{}-byte buffer read into {} bytes", buffer.bytes, out.len())));
        }
        let staging = buffer
            .staging
            .as_ref()
            .ok_or_else(|| fail("kernel-read-only buffers are never downloaded".into()))?;

        let mut encoder = context.device.create_command_encoder(&CommandEncoderDescriptor {
            label: Some("download"),
        });
        encoder.copy_buffer_to_buffer(&buffer.buffer, 0, staging, 0, padded(buffer.bytes));
        queue.queue.submit(Some(encoder.finish()));

        let slice = staging.slice(..);
        let (tx, rx) = crossbeam_channel::bounded(1);
        slice.map_async(MapMode::Read, move |result| {
            let _ = tx.send(result);
        });
        context.wait();
        rx.recv()
            .map_err(|e| fail(e.to_string()))?
            .map_err(|e| fail(e.to_string()))?;

        {
            let view = slice.get_mapped_range();
            out.copy_from_slice(&view[..buffer.bytes]);
        }
        staging.unmap();
        Ok(())
    }

    fn set_arg(&self, kernel: &mut WgpuKernel, slot: usize, arg: KernelArg<'_, Self>) -> Result<()> {
        if slot >= kernel.slots.len() {
            return Err(Error::Bind {
                kernel: kernel.name.clone(),
                slot,
                reason: format!("kernel has {} slot(s)", kernel.slots.len()),
            });
        }
        match arg {
            KernelArg::Buffer(buffer) => kernel.storage[slot] = Some(Arc::clone(&buffer.buffer)),
            KernelArg::Scalar(value) => kernel.scalars[slot] = Some(value),
            KernelArg::Local(_) => {}
        }
        kernel.bound[slot] = true;
        Ok(())
    }

    fn dispatch(&self, context: &WgpuContext, queue: &WgpuQueue, kernel: &mut WgpuKernel, work: &WorkShape) -> Result<()> {
        let fail = |reason: String| Error::Dispatch {
            kernel: kernel.name.clone(),
            reason,
        };
        if let Some(slot) = kernel.bound.iter().position(|b| !b) {
            return Err(fail(format!("slot {slot} is not bound")));
        }
        let groups = work.groups();
        let max = context.limits.max_compute_workgroups_per_dimension;
        if groups.iter().any(|&g| g > max) {
            return Err(fail(format!("{groups:?} workgroups exceed the per-dimension limit of {max}")));
        }

        let mut entries = Vec::with_capacity(kernel.slots.len());
        for (i, slot) in kernel.slots.iter().enumerate() {
            match slot {
                SlotKind::Buffer { .. } => {
                    let Some(buffer) = kernel.storage[i].as_deref() else {
                        return Err(fail(format!("slot {i} has no buffer")));
                    };
                    entries.push(BindGroupEntry {
                        binding: i as u32,
                        resource: BindingResource::Buffer(buffer.as_entire_buffer_binding()),
                    });
                }
                SlotKind::Scalar { .. } => {
                    let (Some(uniform), Some(value)) = (kernel.uniforms[i].as_ref(), kernel.scalars[i]) else {
                        return Err(fail(format!("slot {i} has no scalar")));
                    };
                    let mut bytes = value.to_le_bytes();
                    bytes.resize(UNIFORM_SIZE as usize, 0);
                    queue.queue.write_buffer(uniform, 0, &bytes);
                    entries.push(BindGroupEntry {
                        binding: i as u32,
                        resource: BindingResource::Buffer(uniform.as_entire_buffer_binding()),
                    });
                }
                SlotKind::Local { .. } => {}
            }
        }

        let ((), error) = context.capture(ErrorFilter::Validation, || {
            let bind_group = context.device.create_bind_group(&BindGroupDescriptor {
                label: Some(&kernel.name),
                layout: &kernel.layout,
                entries: &entries,
            });
            let mut encoder = context.device.create_command_encoder(&CommandEncoderDescriptor {
                label: Some(&kernel.name),
            });
            {
                let mut pass = encoder.begin_compute_pass(&ComputePassDescriptor {
                    label: Some(&kernel.name),
                    timestamp_writes: None,
                });
                pass.set_pipeline(&kernel.pipeline);
                pass.set_bind_group(0, &bind_group, &[]);
                pass.dispatch_workgroups(groups[0], groups[1], groups[2]);
            }
            queue.queue.submit(Some(encoder.finish()));
            context.wait();
        });
        if let Some(e) = error {
            return Err(fail(e.to_string()));
        }
        debug!(kernel = %kernel.name, ?groups, queue = %queue.label, "wgpu dispatch complete");
        Ok(())
    }
}
