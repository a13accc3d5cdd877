//! Native OpenCL backend through `opencl3`.

use std::ptr;

use offload_types::{AccessMode, DeviceSelector, DeviceType, Dialect, Platform, ScalarValue, WorkShape};
use opencl3::command_queue::CommandQueue;
use opencl3::context::Context;
use opencl3::device::{
    Device, CL_DEVICE_TYPE_ACCELERATOR, CL_DEVICE_TYPE_ALL, CL_DEVICE_TYPE_CPU, CL_DEVICE_TYPE_GPU,
};
use opencl3::error_codes::{ClError, CL_INVALID_BINARY};
use opencl3::kernel::Kernel;
use opencl3::memory::{Buffer, ClMem, CL_MEM_READ_ONLY, CL_MEM_READ_WRITE, CL_MEM_WRITE_ONLY};
use opencl3::platform::get_platforms;
use opencl3::program::Program;
use opencl3::types::{cl_device_type, cl_mem_flags, CL_BLOCKING};
use tracing::{debug, info};

use super::{Backend, DeviceInfo, KernelArg, SlotKind};
use crate::program::ProgramImage;
use crate::{Error, Result};

#[derive(Default)]
pub struct OpenClBackend;

impl OpenClBackend {
    pub fn new() -> Self {
        Self
    }
}

fn cl_device_type(device_type: DeviceType) -> cl_device_type {
    match device_type {
        DeviceType::Any => CL_DEVICE_TYPE_ALL,
        DeviceType::Gpu => CL_DEVICE_TYPE_GPU,
        DeviceType::Cpu => CL_DEVICE_TYPE_CPU,
        DeviceType::Accelerator => CL_DEVICE_TYPE_ACCELERATOR,
    }
}

fn device_type_of(device: &Device) -> DeviceType {
    match device.dev_type() {
        Ok(t) if t & CL_DEVICE_TYPE_GPU != 0 => DeviceType::Gpu,
        Ok(t) if t & CL_DEVICE_TYPE_CPU != 0 => DeviceType::Cpu,
        Ok(t) if t & CL_DEVICE_TYPE_ACCELERATOR != 0 => DeviceType::Accelerator,
        _ => DeviceType::Any,
    }
}

pub struct OpenClContext {
    context: Context,
    device: Device,
}

pub struct OpenClQueue {
    label: String,
    queue: CommandQueue,
}

pub struct OpenClProgram {
    program: Program,
}

pub struct OpenClKernel {
    name: String,
    kernel: Kernel,
    slots: Vec<SlotKind>,
    bound: Vec<bool>,
}

pub struct OpenClBuffer {
    label: String,
    bytes: usize,
    mem: Buffer<u8>,
}

fn mem_flags(access: AccessMode) -> cl_mem_flags {
    match access {
        AccessMode::ReadOnly | AccessMode::HostWrite => CL_MEM_READ_ONLY,
        AccessMode::ReadWrite => CL_MEM_READ_WRITE,
        AccessMode::WriteOnly => CL_MEM_WRITE_ONLY,
    }
}

impl Backend for OpenClBackend {
    type Context = OpenClContext;
    type Queue = OpenClQueue;
    type Program = OpenClProgram;
    type Kernel = OpenClKernel;
    type Buffer = OpenClBuffer;

    fn name(&self) -> &'static str {
        "opencl"
    }

    fn accepts(&self, dialect: Dialect) -> bool {
        matches!(dialect, Dialect::OpenClC | Dialect::ClBinary)
    }

    fn resolve_device(&self, selector: &DeviceSelector) -> Result<(OpenClContext, DeviceInfo)> {
        if !selector.allows(Platform::OpenCl) {
            return Err(Error::NoPlatformAvailable);
        }
        let platforms = get_platforms().map_err(|e| Error::Device(e.to_string()))?;
        let platform = platforms
            .get(selector.platform_index)
            .ok_or(Error::NoPlatformAvailable)?;
        let ids = platform
            .get_devices(cl_device_type(selector.device_type))
            .unwrap_or_default();
        let id = *ids.get(selector.device_index).ok_or(Error::NoDeviceAvailable)?;

        let device = Device::new(id);
        let name = device.name().unwrap_or_default();
        let context = Context::from_device(&device).map_err(|e| Error::Device(e.to_string()))?;
        info!(platform = %platform.name().unwrap_or_default(), device = %name, "OpenCL context created");

        let info = DeviceInfo {
            platform: Platform::OpenCl,
            name,
            device_type: device_type_of(&device),
        };
        Ok((OpenClContext { context, device }, info))
    }

    fn create_queue(&self, context: &OpenClContext, label: &str) -> Result<OpenClQueue> {
        let queue = CommandQueue::create_default_with_properties(&context.context, 0, 0)
            .map_err(|e| Error::Device(format!("command queue for `{label}`: {e}")))?;
        Ok(OpenClQueue {
            label: label.to_string(),
            queue,
        })
    }

    fn build_program(&self, context: &OpenClContext, image: &ProgramImage) -> Result<OpenClProgram> {
        let mut program = match image.dialect {
            Dialect::OpenClC => Program::create_from_source(&context.context, image.text()?)
                .map_err(|e| Error::BuildFailed(e.to_string()))?,
            Dialect::ClBinary => {
                let devices = [context.device.id()];
                let binaries: [&[u8]; 1] = [&image.bytes];
                unsafe { Program::create_from_binary(&context.context, &devices, &binaries) }.map_err(
                    |e: ClError| {
                        if e.0 == CL_INVALID_BINARY {
                            Error::InvalidBinary(e.to_string())
                        } else {
                            Error::BuildFailed(e.to_string())
                        }
                    },
                )?
            }
            other => {
                return Err(Error::BuildFailed(format!(
                    "OpenCL cannot build {other:?} programs"
                )))
            }
        };

        if let Err(e) = program.build(context.context.devices(), &image.build_options) {
            let log = program
                .get_build_log(context.device.id())
                .unwrap_or_default();
            debug!(build_log = %log, "OpenCL build log");
            return Err(if e.0 == CL_INVALID_BINARY {
                Error::InvalidBinary(e.to_string())
            } else {
                Error::BuildFailed(e.to_string())
            });
        }
        Ok(OpenClProgram { program })
    }

    fn entry_points(&self, program: &OpenClProgram) -> Vec<String> {
        program
            .program
            .get_kernel_names()
            .unwrap_or_default()
            .split(';')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    }

    fn create_kernel(
        &self,
        _context: &OpenClContext,
        program: &OpenClProgram,
        name: &str,
        slots: &[SlotKind],
    ) -> Result<OpenClKernel> {
        let kernel = Kernel::create(&program.program, name).map_err(|e| Error::KernelCreation {
            name: name.to_string(),
            reason: e.to_string(),
        })?;
        Ok(OpenClKernel {
            name: name.to_string(),
            kernel,
            slots: slots.to_vec(),
            bound: vec![false; slots.len()],
        })
    }

    fn create_buffer(&self, context: &OpenClContext, label: &str, bytes: usize, access: AccessMode) -> Result<OpenClBuffer> {
        if bytes == 0 {
            return Err(Error::Allocation {
                name: label.to_string(),
                bytes,
                reason: "zero-sized allocation".into(),
            });
        }
        let mem = unsafe { Buffer::<u8>::create(&context.context, mem_flags(access), bytes, ptr::null_mut()) }
            .map_err(|e| Error::Allocation {
                name: label.to_string(),
                bytes,
                reason: e.to_string(),
            })?;
        Ok(OpenClBuffer {
            label: label.to_string(),
            bytes,
            mem,
        })
    }

    fn write_buffer(&self, _context: &OpenClContext, queue: &OpenClQueue, buffer: &mut OpenClBuffer, data: &[u8]) -> Result<()> {
        if data.len() != buffer.bytes {
            return Err(Error::Transfer {
                buffer: buffer.label.clone(),
                reason: format!("{} bytes written to a {}-byte buffer", data.len(), buffer.bytes),
            });
        }
        unsafe { queue.queue.enqueue_write_buffer(&mut buffer.mem, CL_BLOCKING, 0, data, &[]) }
            .map_err(|e| Error::Transfer {
                buffer: buffer.label.clone(),
                reason: e.to_string(),
            })?;
        Ok(())
    }

    fn read_buffer(&self, _context: &OpenClContext, queue: &OpenClQueue, buffer: &OpenClBuffer, out: &mut [u8]) -> Result<()> {
        if out.len() != buffer.bytes {
            return Err(Error::Transfer {
                buffer: buffer.label.clone(),
                reason: format!("{}-byte buffer read into {} bytes", buffer.bytes, out.len()),
            });
        }
        unsafe { queue.queue.enqueue_read_buffer(&buffer.mem, CL_BLOCKING, 0, out, &[]) }
            .map_err(|e| Error::Transfer {
                buffer: buffer.label.clone(),
                reason: e.to_string(),
            })?;
        Ok(())
    }

    fn set_arg(&self, kernel: &mut OpenClKernel, slot: usize, arg: KernelArg<'_, Self>) -> Result<()> {
        if slot >= kernel.slots.len() {
            return Err(Error::Bind {
                kernel: kernel.name.clone(),
                slot,
                reason: format!("kernel has {} slot(s)", kernel.slots.len()),
            });
        }
        let index = slot as u32;
        let k = &kernel.kernel;
        let result = unsafe {
            match arg {
                KernelArg::Buffer(buffer) => k.set_arg(index, &buffer.mem.get()),
                KernelArg::Scalar(ScalarValue::I32(v)) => k.set_arg(index, &v),
                KernelArg::Scalar(ScalarValue::U32(v)) => k.set_arg(index, &v),
                KernelArg::Scalar(ScalarValue::F32(v)) => k.set_arg(index, &v),
                KernelArg::Scalar(ScalarValue::I64(v)) => k.set_arg(index, &v),
                KernelArg::Scalar(ScalarValue::U64(v)) => k.set_arg(index, &v),
                KernelArg::Scalar(ScalarValue::F64(v)) => k.set_arg(index, &v),
                KernelArg::Local(bytes) => k.set_arg_local_buffer(index, bytes),
            }
        };
        result.map_err(|e| Error::Bind {
            kernel: kernel.name.clone(),
            slot,
            reason: e.to_string(),
        })?;
        kernel.bound[slot] = true;
        Ok(())
    }

    fn dispatch(&self, _context: &OpenClContext, queue: &OpenClQueue, kernel: &mut OpenClKernel, work: &WorkShape) -> Result<()> {
        let fail = |reason: String| Error::Dispatch {
            kernel: kernel.name.clone(),
            reason,
        };
        if let Some(slot) = kernel.bound.iter().position(|b| !b) {
            return Err(fail(format!("slot {slot} is not bound")));
        }
        let global = work.global.clone();
        let local = work.local.clone();
        let local_ptr = local.as_ref().map_or(ptr::null(), |l| l.as_ptr());
        let event = unsafe {
            queue.queue.enqueue_nd_range_kernel(
                kernel.kernel.get(),
                global.len() as u32,
                ptr::null(),
                global.as_ptr(),
                local_ptr,
                &[],
            )
        }
        .map_err(|e| fail(e.to_string()))?;
        event.wait().map_err(|e| fail(e.to_string()))?;
        queue.queue.finish().map_err(|e| fail(e.to_string()))?;
        debug!(kernel = %kernel.name, queue = %queue.label, ?global, "OpenCL dispatch complete");
        Ok(())
    }
}
