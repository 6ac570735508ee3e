//! wgpu backend
//!
//! Platforms are wgpu backends (Vulkan, Metal, DX12, GL) and devices are
//! the adapters each one reports. Opening a device creates one
//! `wgpu::Device` and queue shared by [`WgpuCompute`] and the
//! [`PointRasterizer`], so dual-owned buffers are single allocations that
//! both sides bind directly.
//!
//! wgpu orders all submissions on one queue by itself. Acquire and release
//! are therefore ownership flags on the shared buffer, checked by both
//! sides, and the drain/finish barriers block on `Device::poll`.

use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{debug, info};
use wgpu::util::DeviceExt;
use winit::window::Window;

use super::{
    Accelerator, ArgKind, BufferHandle, ComputeBackend, DeviceInfo, DeviceKind, KernelArg,
    KernelHandle, KernelInfo, PlatformInfo, ProgramHandle,
};
use crate::error::BackendError;
use crate::render::PointRasterizer;
use crate::simulation::program::{compile_wgsl, reflect_entry_point, BuildLog, EntryPointLayout};
use crate::wgpu_utils::{read_buffer, wait_idle, UniformBuffer};

/// Device and queue of an opened adapter.
#[derive(Clone)]
pub struct GpuContext {
    pub device: Arc<wgpu::Device>,
    pub queue: Arc<wgpu::Queue>,
}

/// A rasterizer vertex buffer that kernels may also bind.
#[derive(Clone)]
pub struct InteropBuffer {
    buffer: Arc<wgpu::Buffer>,
    label: Arc<str>,
    acquired: Arc<AtomicBool>,
}

impl InteropBuffer {
    pub fn new(buffer: wgpu::Buffer, label: &str) -> Self {
        Self {
            buffer: Arc::new(buffer),
            label: label.into(),
            acquired: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn buffer(&self) -> &wgpu::Buffer {
        &self.buffer
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn is_acquired(&self) -> bool {
        self.acquired.load(Ordering::Acquire)
    }

    /// Fails with an ownership violation while the compute engine holds it.
    pub fn ensure_released(&self, message: &str) -> Result<(), BackendError> {
        if self.is_acquired() {
            return Err(BackendError::OwnershipViolation {
                buffer: self.label.to_string(),
                message: message.to_string(),
            });
        }
        Ok(())
    }

    fn set_acquired(&self, acquired: bool) -> Result<(), BackendError> {
        if self.acquired.swap(acquired, Ordering::AcqRel) == acquired {
            return Err(BackendError::OwnershipViolation {
                buffer: self.label.to_string(),
                message: if acquired {
                    "already acquired".to_string()
                } else {
                    "released without acquisition".to_string()
                },
            });
        }
        Ok(())
    }
}

const PLATFORMS: [(wgpu::Backends, &str); 4] = [
    (wgpu::Backends::VULKAN, "Vulkan"),
    (wgpu::Backends::METAL, "Metal"),
    (wgpu::Backends::DX12, "DirectX 12"),
    (wgpu::Backends::GL, "OpenGL"),
];

fn device_kind(device_type: wgpu::DeviceType) -> DeviceKind {
    match device_type {
        wgpu::DeviceType::DiscreteGpu => DeviceKind::DiscreteGpu,
        wgpu::DeviceType::IntegratedGpu => DeviceKind::IntegratedGpu,
        wgpu::DeviceType::VirtualGpu => DeviceKind::VirtualGpu,
        wgpu::DeviceType::Cpu => DeviceKind::Cpu,
        wgpu::DeviceType::Other => DeviceKind::Other,
    }
}

/// Enumerates adapters that can present to one window.
pub struct WgpuAccelerator {
    instance: wgpu::Instance,
    surface: Option<wgpu::Surface<'static>>,
    backends: wgpu::Backends,
    size: (u32, u32),
    adapters: HashMap<(usize, usize), wgpu::Adapter>,
}

impl WgpuAccelerator {
    pub fn new(window: Arc<Window>, backends: wgpu::Backends) -> Result<Self, BackendError> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends,
            ..Default::default()
        });
        let size = window.inner_size();
        let surface = instance
            .create_surface(window)
            .map_err(|e| BackendError::call("create surface", e.to_string()))?;

        Ok(Self {
            instance,
            surface: Some(surface),
            backends,
            size: (size.width.max(1), size.height.max(1)),
            adapters: HashMap::new(),
        })
    }
}

impl Accelerator for WgpuAccelerator {
    type Shared = InteropBuffer;
    type Compute = WgpuCompute;
    type Raster = PointRasterizer;

    fn platforms(&mut self) -> Result<Vec<PlatformInfo>, BackendError> {
        Ok(PLATFORMS
            .iter()
            .enumerate()
            .filter(|(_, (backend, _))| self.backends.contains(*backend))
            .map(|(index, (_, name))| PlatformInfo {
                index,
                name: name.to_string(),
            })
            .collect())
    }

    fn devices(&mut self, platform: &PlatformInfo) -> Result<Vec<DeviceInfo>, BackendError> {
        let (backend, _) = PLATFORMS.get(platform.index).ok_or(BackendError::InvalidHandle {
            kind: "platform",
            index: platform.index,
        })?;
        let surface = self
            .surface
            .as_ref()
            .ok_or_else(|| BackendError::call("enumerate devices", "window surface already in use"))?;

        let mut devices = Vec::new();
        for (index, adapter) in self.instance.enumerate_adapters(*backend).into_iter().enumerate() {
            let info = adapter.get_info();
            devices.push(DeviceInfo {
                platform: platform.index,
                index,
                name: info.name.clone(),
                vendor: format!("{:#06x} {}", info.vendor, info.driver),
                kind: device_kind(info.device_type),
                interop: adapter.is_surface_supported(surface),
            });
            self.adapters.insert((platform.index, index), adapter);
        }
        Ok(devices)
    }

    fn open(&mut self, device: &DeviceInfo) -> Result<(WgpuCompute, PointRasterizer), BackendError> {
        let adapter = self
            .adapters
            .get(&(device.platform, device.index))
            .ok_or(BackendError::InvalidHandle {
                kind: "device",
                index: device.index,
            })?;

        let (gpu_device, queue) = pollster::block_on(adapter.request_device(&wgpu::DeviceDescriptor {
            label: Some("Universe Device"),
            required_features: wgpu::Features::empty(),
            required_limits: wgpu::Limits {
                max_storage_buffers_per_shader_stage: 6,
                max_texture_dimension_2d: adapter.limits().max_texture_dimension_2d,
                ..wgpu::Limits::downlevel_defaults()
            },
            memory_hints: wgpu::MemoryHints::default(),
            trace: wgpu::Trace::Off,
        }))
        .map_err(|e| BackendError::call("request device", e.to_string()))?;

        let surface = self
            .surface
            .take()
            .ok_or_else(|| BackendError::call("open device", "window surface already in use"))?;
        let context = GpuContext {
            device: Arc::new(gpu_device),
            queue: Arc::new(queue),
        };
        let raster = PointRasterizer::new(context.clone(), surface, adapter, self.size.0, self.size.1)?;
        info!("Opened {} ({:?})", device.name, adapter.get_info().backend);

        Ok((WgpuCompute::new(device.clone(), context), raster))
    }
}

/// Uniform behind a scalar kernel argument.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
struct StepUniform {
    value: f32,
    global_size: u32,
    _pad: [u32; 2],
}

struct GpuProgram {
    module: wgpu::ShaderModule,
    reflection: naga::Module,
    options: String,
}

struct GpuKernel {
    pipeline: wgpu::ComputePipeline,
    layout: EntryPointLayout,
    args: Vec<Option<KernelArg>>,
    scalars: HashMap<usize, UniformBuffer<StepUniform>>,
    bind_group: Option<(Vec<BufferHandle>, wgpu::BindGroup)>,
}

enum GpuBuffer {
    Owned { label: String, buffer: wgpu::Buffer },
    Shared(InteropBuffer),
}

impl GpuBuffer {
    fn buffer(&self) -> &wgpu::Buffer {
        match self {
            GpuBuffer::Owned { buffer, .. } => buffer,
            GpuBuffer::Shared(shared) => shared.buffer(),
        }
    }
}

/// Compute engine on an opened wgpu device.
pub struct WgpuCompute {
    info: DeviceInfo,
    context: GpuContext,
    programs: Vec<Option<GpuProgram>>,
    kernels: Vec<Option<(ProgramHandle, GpuKernel)>>,
    buffers: Vec<Option<GpuBuffer>>,
}

impl WgpuCompute {
    pub fn new(info: DeviceInfo, context: GpuContext) -> Self {
        Self {
            info,
            context,
            programs: Vec::new(),
            kernels: Vec::new(),
            buffers: Vec::new(),
        }
    }

    pub fn context(&self) -> &GpuContext {
        &self.context
    }

    fn buffer(&self, handle: BufferHandle) -> Result<&GpuBuffer, BackendError> {
        self.buffers
            .get(handle.0)
            .and_then(Option::as_ref)
            .ok_or(BackendError::InvalidHandle {
                kind: "buffer",
                index: handle.0,
            })
    }

    fn shared(&self, handle: BufferHandle) -> Result<&InteropBuffer, BackendError> {
        match self.buffer(handle)? {
            GpuBuffer::Shared(shared) => Ok(shared),
            GpuBuffer::Owned { label, .. } => Err(BackendError::call(
                "interop",
                format!("{label} is not a shared buffer"),
            )),
        }
    }

    fn program(&self, handle: ProgramHandle) -> Result<&GpuProgram, BackendError> {
        self.programs
            .get(handle.0)
            .and_then(Option::as_ref)
            .ok_or(BackendError::InvalidHandle {
                kind: "program",
                index: handle.0,
            })
    }

    fn kernel_mut(&mut self, handle: KernelHandle) -> Result<&mut GpuKernel, BackendError> {
        match self.kernels.get_mut(handle.index).and_then(Option::as_mut) {
            Some((program, kernel)) if *program == handle.program => Ok(kernel),
            _ => Err(BackendError::InvalidHandle {
                kind: "kernel",
                index: handle.index,
            }),
        }
    }

    fn validated<T>(&self, create: impl FnOnce(&wgpu::Device) -> T) -> Result<T, String> {
        validation_scope(&self.context.device, create)
    }
}

/// Runs `create` inside a validation error scope.
fn validation_scope<T>(
    device: &wgpu::Device,
    create: impl FnOnce(&wgpu::Device) -> T,
) -> Result<T, String> {
    device.push_error_scope(wgpu::ErrorFilter::Validation);
    let value = create(device);
    match pollster::block_on(device.pop_error_scope()) {
        Some(error) => Err(error.to_string()),
        None => Ok(value),
    }
}

/// Fails when `len` bytes cannot be bound as a single storage buffer.
pub(crate) fn check_storage_size(
    label: &str,
    len: usize,
    limits: &wgpu::Limits,
) -> Result<(), BackendError> {
    let max = u64::from(limits.max_storage_buffer_binding_size);
    if len as u64 > max {
        return Err(BackendError::call(
            "create buffer",
            format!("{label} needs {len} bytes but the device binds at most {max}"),
        ));
    }
    Ok(())
}

/// Workgroups covering `global_size` items, within the device's dispatch limit.
fn workgroup_count(
    global_size: u32,
    workgroup: u32,
    limits: &wgpu::Limits,
) -> Result<u32, BackendError> {
    let groups = global_size.div_ceil(workgroup.max(1));
    let max = limits.max_compute_workgroups_per_dimension;
    if groups > max {
        return Err(BackendError::call(
            "enqueue kernel",
            format!("{global_size} items need {groups} workgroups but the device allows {max}"),
        ));
    }
    Ok(groups)
}

impl ComputeBackend for WgpuCompute {
    type Shared = InteropBuffer;

    fn device(&self) -> &DeviceInfo {
        &self.info
    }

    fn build_program(&mut self, source: &str, options: &str) -> Result<ProgramHandle, BuildLog> {
        let reflection = compile_wgsl(source).map_err(|log| BuildLog::failure(options, log))?;
        let module = self
            .validated(|device| {
                device.create_shader_module(wgpu::ShaderModuleDescriptor {
                    label: Some("Universe Kernel"),
                    source: wgpu::ShaderSource::Wgsl(Cow::Owned(source.to_string())),
                })
            })
            .map_err(|log| BuildLog::failure(options, log))?;

        let handle = ProgramHandle(self.programs.len());
        self.programs.push(Some(GpuProgram {
            module,
            reflection,
            options: options.to_string(),
        }));
        Ok(handle)
    }

    fn build_log(&self, program: ProgramHandle) -> Result<BuildLog, BackendError> {
        let program = self.program(program)?;
        Ok(BuildLog::success(&program.options))
    }

    fn create_kernel(
        &mut self,
        program: ProgramHandle,
        entry_point: &str,
    ) -> Result<Option<KernelInfo>, BackendError> {
        let built = self.program(program)?;
        let Some(layout) = reflect_entry_point(&built.reflection, entry_point) else {
            return Ok(None);
        };

        let pipeline = self
            .validated(|device| {
                device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                    label: Some(entry_point),
                    layout: None,
                    module: &built.module,
                    entry_point: Some(entry_point),
                    compilation_options: Default::default(),
                    cache: None,
                })
            })
            .map_err(|e| BackendError::call("create compute pipeline", e))?;

        let initial = StepUniform {
            value: 0.0,
            global_size: 0,
            _pad: [0; 2],
        };
        let scalars = layout
            .slots()
            .iter()
            .enumerate()
            .filter(|(_, kind)| **kind == ArgKind::Scalar)
            .map(|(slot, _)| (slot, UniformBuffer::new(&self.context.device, &initial)))
            .collect();

        let slots = layout.slots();
        let handle = KernelHandle {
            index: self.kernels.len(),
            program,
        };
        self.kernels.push(Some((
            program,
            GpuKernel {
                pipeline,
                args: vec![None; slots.len()],
                layout,
                scalars,
                bind_group: None,
            },
        )));
        Ok(Some(KernelInfo { handle, slots }))
    }

    fn release_program(&mut self, program: ProgramHandle) -> Result<(), BackendError> {
        self.program(program)?;
        self.programs[program.0] = None;
        for slot in &mut self.kernels {
            if matches!(slot, Some((owner, _)) if *owner == program) {
                *slot = None;
            }
        }
        Ok(())
    }

    fn create_buffer(&mut self, label: &str, bytes: &[u8]) -> Result<BufferHandle, BackendError> {
        check_storage_size(label, bytes.len(), &self.context.device.limits())?;
        let buffer = self
            .context
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some(label),
                contents: bytes,
                usage: wgpu::BufferUsages::STORAGE
                    | wgpu::BufferUsages::COPY_DST
                    | wgpu::BufferUsages::COPY_SRC,
            });
        let handle = BufferHandle(self.buffers.len());
        self.buffers.push(Some(GpuBuffer::Owned {
            label: label.to_string(),
            buffer,
        }));
        Ok(handle)
    }

    fn write_buffer(&mut self, handle: BufferHandle, bytes: &[u8]) -> Result<(), BackendError> {
        let buffer = self.buffer(handle)?;
        if let GpuBuffer::Shared(shared) = buffer {
            if !shared.is_acquired() {
                return Err(BackendError::OwnershipViolation {
                    buffer: shared.label().to_string(),
                    message: "compute write without acquisition".to_string(),
                });
            }
        }
        if buffer.buffer().size() != bytes.len() as u64 {
            return Err(BackendError::call(
                "write buffer",
                format!("buffer holds {} bytes, got {}", buffer.buffer().size(), bytes.len()),
            ));
        }
        self.context.queue.write_buffer(buffer.buffer(), 0, bytes);
        Ok(())
    }

    fn release_buffer(&mut self, handle: BufferHandle) -> Result<(), BackendError> {
        if let GpuBuffer::Shared(shared) = self.buffer(handle)? {
            shared.ensure_released("released while acquired")?;
        }
        self.buffers[handle.0] = None;
        for (_, kernel) in self.kernels.iter_mut().flatten() {
            if matches!(&kernel.bind_group, Some((bound, _)) if bound.contains(&handle)) {
                kernel.bind_group = None;
            }
        }
        Ok(())
    }

    fn register_shared(
        &mut self,
        _label: &str,
        shared: InteropBuffer,
    ) -> Result<BufferHandle, BackendError> {
        let handle = BufferHandle(self.buffers.len());
        self.buffers.push(Some(GpuBuffer::Shared(shared)));
        Ok(handle)
    }

    fn acquire_shared(&mut self, handle: BufferHandle) -> Result<(), BackendError> {
        self.shared(handle)?.set_acquired(true)
    }

    fn release_shared(&mut self, handle: BufferHandle) -> Result<(), BackendError> {
        self.shared(handle)?.set_acquired(false)
    }

    fn set_arg(
        &mut self,
        kernel: KernelHandle,
        index: u32,
        arg: KernelArg,
    ) -> Result<(), BackendError> {
        if let KernelArg::Buffer(buffer) = arg {
            self.buffer(buffer)?;
        }
        let gpu_kernel = self.kernel_mut(kernel)?;
        let arity = gpu_kernel.args.len();
        let expected = gpu_kernel
            .layout
            .bindings
            .get(index as usize)
            .map(|(_, kind)| *kind)
            .ok_or(BackendError::InvalidArgIndex { index, arity })?;
        if expected != arg.kind() {
            return Err(BackendError::ArgumentKindMismatch {
                index,
                expected: expected.as_str(),
                actual: arg.kind().as_str(),
            });
        }
        gpu_kernel.args[index as usize] = Some(arg);
        Ok(())
    }

    fn enqueue(&mut self, kernel: KernelHandle, global_size: u32) -> Result<(), BackendError> {
        let args: Vec<KernelArg> = self
            .kernel_mut(kernel)?
            .args
            .iter()
            .enumerate()
            .map(|(index, arg)| arg.ok_or(BackendError::MissingArgument { index: index as u32 }))
            .collect::<Result<_, _>>()?;

        let mut bound = Vec::new();
        for arg in &args {
            if let KernelArg::Buffer(handle) = arg {
                if let GpuBuffer::Shared(shared) = self.buffer(*handle)? {
                    if !shared.is_acquired() {
                        return Err(BackendError::OwnershipViolation {
                            buffer: shared.label().to_string(),
                            message: "kernel launched on a buffer the rasterizer owns".to_string(),
                        });
                    }
                }
                bound.push(*handle);
            }
        }

        let context = self.context.clone();
        let needs_bind_group = !matches!(
            &self.kernel_mut(kernel)?.bind_group,
            Some((cached, _)) if *cached == bound
        );
        if needs_bind_group {
            let gpu_kernel = self.kernels[kernel.index]
                .as_ref()
                .map(|(_, k)| k)
                .ok_or(BackendError::InvalidHandle {
                    kind: "kernel",
                    index: kernel.index,
                })?;
            let mut entries = Vec::with_capacity(args.len());
            for (slot, arg) in args.iter().enumerate() {
                let binding = gpu_kernel.layout.bindings[slot].0;
                let resource = match arg {
                    KernelArg::Buffer(handle) => self.buffer(*handle)?.buffer().as_entire_binding(),
                    KernelArg::Scalar(_) => gpu_kernel
                        .scalars
                        .get(&slot)
                        .ok_or(BackendError::MissingArgument { index: slot as u32 })?
                        .binding_resource(),
                };
                entries.push(wgpu::BindGroupEntry { binding, resource });
            }
            let bind_group = validation_scope(&context.device, |device| {
                device.create_bind_group(&wgpu::BindGroupDescriptor {
                    label: Some("Kernel Bind Group"),
                    layout: &gpu_kernel.pipeline.get_bind_group_layout(0),
                    entries: &entries,
                })
            })
            .map_err(|message| BackendError::call("create bind group", message))?;
            debug!("Rebuilt bind group for kernel {}", kernel.index);
            self.kernel_mut(kernel)?.bind_group = Some((bound, bind_group));
        }

        let gpu_kernel = self.kernel_mut(kernel)?;
        for (slot, arg) in args.iter().enumerate() {
            if let (KernelArg::Scalar(value), Some(uniform)) = (arg, gpu_kernel.scalars.get_mut(&slot)) {
                uniform.update_content(
                    &context.queue,
                    &StepUniform {
                        value: *value,
                        global_size,
                        _pad: [0; 2],
                    },
                );
            }
        }

        let Some((_, bind_group)) = gpu_kernel.bind_group.as_ref() else {
            return Err(BackendError::call("enqueue kernel", "no bind group"));
        };
        let groups = workgroup_count(
            global_size,
            gpu_kernel.layout.workgroup_size[0],
            &context.device.limits(),
        )?;
        let commands = validation_scope(&context.device, |device| {
            let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("Kernel Encoder"),
            });
            {
                let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                    label: Some("Kernel Pass"),
                    timestamp_writes: None,
                });
                pass.set_pipeline(&gpu_kernel.pipeline);
                pass.set_bind_group(0, bind_group, &[]);
                pass.dispatch_workgroups(groups, 1, 1);
            }
            encoder.finish()
        })
        .map_err(|message| BackendError::call("enqueue kernel", message))?;
        context.queue.submit(std::iter::once(commands));
        Ok(())
    }

    fn finish(&mut self) -> Result<(), BackendError> {
        wait_idle(&self.context.device, "finish compute queue")
    }

    fn read_buffer(&mut self, handle: BufferHandle) -> Result<Vec<u8>, BackendError> {
        let buffer = self.buffer(handle)?.buffer();
        read_buffer(&self.context.device, &self.context.queue, buffer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_size_limit() {
        let limits = wgpu::Limits::downlevel_defaults();
        let max = limits.max_storage_buffer_binding_size as usize;
        assert!(check_storage_size("position", max, &limits).is_ok());
        let err = check_storage_size("position", max + 16, &limits).unwrap_err();
        assert!(err.to_string().contains("position needs"));
    }

    #[test]
    fn test_workgroup_count_rounds_up_within_limit() {
        let limits = wgpu::Limits::downlevel_defaults();
        assert_eq!(workgroup_count(3, 64, &limits).unwrap(), 1);
        assert_eq!(workgroup_count(129, 64, &limits).unwrap(), 3);
        assert_eq!(workgroup_count(10, 0, &limits).unwrap(), 10);

        let most = limits.max_compute_workgroups_per_dimension * 64;
        assert_eq!(
            workgroup_count(most, 64, &limits).unwrap(),
            limits.max_compute_workgroups_per_dimension
        );
        assert!(workgroup_count(most + 1, 64, &limits).is_err());
    }
}
