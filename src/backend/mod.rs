//! Accelerator and rasterizer boundaries
//!
//! The simulation core never talks to a graphics API directly. It drives
//! three traits:
//!
//! - [`Accelerator`] enumerates platforms and devices and opens one device,
//!   yielding a compute engine and a rasterizer that share its context.
//! - [`ComputeBackend`] compiles programs, owns compute-side buffers and
//!   runs kernels.
//! - [`Rasterizer`] owns drawable buffers and draws them as points.
//!
//! All handles are plain indices into arenas owned by the backend that
//! issued them, so dropping the backend releases everything at once.

use std::fmt;

use crate::error::BackendError;
use crate::simulation::program::BuildLog;

pub mod recording;
pub mod wgpu_backend;

/// One accelerator platform (a driver stack exposing devices).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlatformInfo {
    pub index: usize,
    pub name: String,
}

/// Broad device category reported by the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceKind {
    DiscreteGpu,
    IntegratedGpu,
    VirtualGpu,
    Cpu,
    Other,
}

impl DeviceKind {
    pub fn is_gpu(&self) -> bool {
        matches!(
            self,
            DeviceKind::DiscreteGpu | DeviceKind::IntegratedGpu | DeviceKind::VirtualGpu
        )
    }
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceKind::DiscreteGpu => write!(f, "Discrete GPU"),
            DeviceKind::IntegratedGpu => write!(f, "Integrated GPU"),
            DeviceKind::VirtualGpu => write!(f, "Virtual GPU"),
            DeviceKind::Cpu => write!(f, "CPU"),
            DeviceKind::Other => write!(f, "Other"),
        }
    }
}

/// A device as reported by enumeration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub platform: usize,
    pub index: usize,
    pub name: String,
    pub vendor: String,
    pub kind: DeviceKind,
    /// Whether this device can share memory with the rasterizer.
    pub interop: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProgramHandle(pub usize);

/// A kernel entry point; remembers the program that owns it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KernelHandle {
    pub index: usize,
    pub program: ProgramHandle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferHandle(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RasterBufferId(pub usize);

/// What a kernel argument slot accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgKind {
    Buffer,
    Scalar,
}

impl ArgKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ArgKind::Buffer => "buffer",
            ArgKind::Scalar => "scalar",
        }
    }
}

/// A value bound to a kernel argument slot.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum KernelArg {
    Buffer(BufferHandle),
    Scalar(f32),
}

impl KernelArg {
    pub fn kind(&self) -> ArgKind {
        match self {
            KernelArg::Buffer(_) => ArgKind::Buffer,
            KernelArg::Scalar(_) => ArgKind::Scalar,
        }
    }
}

/// What the backend learned about a kernel when it created it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelInfo {
    pub handle: KernelHandle,
    /// Argument kinds in slot order; the length is the kernel's arity.
    pub slots: Vec<ArgKind>,
}

impl KernelInfo {
    pub fn arity(&self) -> usize {
        self.slots.len()
    }
}

/// Enumerates and opens devices.
pub trait Accelerator {
    type Shared;
    type Compute: ComputeBackend<Shared = Self::Shared>;
    type Raster: Rasterizer<Shared = Self::Shared>;

    fn platforms(&mut self) -> Result<Vec<PlatformInfo>, BackendError>;

    fn devices(&mut self, platform: &PlatformInfo) -> Result<Vec<DeviceInfo>, BackendError>;

    /// Creates the shared context on `device`.
    fn open(&mut self, device: &DeviceInfo) -> Result<(Self::Compute, Self::Raster), BackendError>;
}

/// The compute side of an opened device.
pub trait ComputeBackend {
    /// Interop handle exported by the rasterizer of the same context.
    type Shared;

    fn device(&self) -> &DeviceInfo;

    /// Compiles kernel source for this device. The error value is the
    /// backend's build log.
    fn build_program(&mut self, source: &str, options: &str) -> Result<ProgramHandle, BuildLog>;

    /// Build log of a successfully built program.
    fn build_log(&self, program: ProgramHandle) -> Result<BuildLog, BackendError>;

    /// Looks up a compute entry point. `Ok(None)` when the program has no
    /// such entry point.
    fn create_kernel(
        &mut self,
        program: ProgramHandle,
        entry_point: &str,
    ) -> Result<Option<KernelInfo>, BackendError>;

    /// Drops a program and every kernel created from it.
    fn release_program(&mut self, program: ProgramHandle) -> Result<(), BackendError>;

    /// Allocates a compute-only buffer holding `bytes`.
    fn create_buffer(&mut self, label: &str, bytes: &[u8]) -> Result<BufferHandle, BackendError>;

    fn write_buffer(&mut self, buffer: BufferHandle, bytes: &[u8]) -> Result<(), BackendError>;

    fn release_buffer(&mut self, buffer: BufferHandle) -> Result<(), BackendError>;

    /// Wraps a rasterizer buffer so kernels can use it. Starts owned by the
    /// rasterizer.
    fn register_shared(
        &mut self,
        label: &str,
        shared: Self::Shared,
    ) -> Result<BufferHandle, BackendError>;

    /// Moves a shared buffer from rasterizer to compute ownership.
    fn acquire_shared(&mut self, buffer: BufferHandle) -> Result<(), BackendError>;

    /// Moves a shared buffer back to the rasterizer.
    fn release_shared(&mut self, buffer: BufferHandle) -> Result<(), BackendError>;

    fn set_arg(
        &mut self,
        kernel: KernelHandle,
        index: u32,
        arg: KernelArg,
    ) -> Result<(), BackendError>;

    /// Runs `kernel` over exactly `global_size` work-items.
    fn enqueue(&mut self, kernel: KernelHandle, global_size: u32) -> Result<(), BackendError>;

    /// Blocks until all submitted compute work has completed.
    fn finish(&mut self) -> Result<(), BackendError>;

    /// Copies a buffer back to the host. Blocking.
    fn read_buffer(&mut self, buffer: BufferHandle) -> Result<Vec<u8>, BackendError>;
}

/// The drawing side of an opened device.
pub trait Rasterizer {
    type Shared;

    fn create_shared_buffer(
        &mut self,
        label: &str,
        bytes: &[u8],
    ) -> Result<RasterBufferId, BackendError>;

    /// Interop handle for `id`, consumed by [`ComputeBackend::register_shared`].
    fn export_shared(&self, id: RasterBufferId) -> Result<Self::Shared, BackendError>;

    /// Raw copy into an existing drawable buffer; never reallocates.
    fn write_shared_buffer(&mut self, id: RasterBufferId, bytes: &[u8]) -> Result<(), BackendError>;

    fn destroy_shared_buffer(&mut self, id: RasterBufferId) -> Result<(), BackendError>;

    /// Drains every pending draw command.
    fn finish(&mut self) -> Result<(), BackendError>;

    /// Draws `particle_count` points sourced from `buffers` in attribute order.
    fn draw(&mut self, buffers: &[RasterBufferId], particle_count: u32) -> Result<(), BackendError>;

    fn update_viewport(&mut self, width: u32, height: u32);
}
