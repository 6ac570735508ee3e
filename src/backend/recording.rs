//! Host-memory backend that journals every boundary call
//!
//! Nothing here touches a GPU. Kernels are compiled and reflected with the
//! same WGSL front end as the wgpu backend but never executed; buffers are
//! plain byte vectors, and dual-owned buffers are shared between the
//! rasterizer and the compute side so a raw copy by one is visible to the
//! other. The ownership protocol is enforced: drawing or copying into an
//! acquired buffer, double acquisition, and launching a kernel over a shared
//! buffer that was not acquired all fail.
//!
//! Every call is appended to a [`Journal`] shared by both sides, and any
//! operation can be made to fail through [`Faults`], which is what the
//! protocol tests are written against.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use log::debug;

use super::{
    Accelerator, ArgKind, BufferHandle, ComputeBackend, DeviceInfo, DeviceKind, KernelArg,
    KernelHandle, KernelInfo, PlatformInfo, ProgramHandle, RasterBufferId, Rasterizer,
};
use crate::error::BackendError;
use crate::simulation::program::{compile_wgsl, reflect_entry_point, BuildLog, EntryPointLayout};

/// One journaled boundary call.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    DeviceOpened { name: String },
    ProgramBuilt { program: ProgramHandle },
    ProgramReleased { program: ProgramHandle },
    KernelCreated { kernel: KernelHandle },
    BufferCreated { buffer: BufferHandle, size: usize },
    BufferWritten { buffer: BufferHandle, size: usize },
    BufferReleased { buffer: BufferHandle },
    SharedRegistered { buffer: BufferHandle },
    Acquired { buffer: BufferHandle },
    Released { buffer: BufferHandle },
    ArgSet { kernel: KernelHandle, index: u32, arg: KernelArg },
    Enqueued { kernel: KernelHandle, global_size: u32 },
    ComputeFinished,
    RasterBufferCreated { id: RasterBufferId, size: usize },
    RasterBufferWritten { id: RasterBufferId, size: usize },
    RasterBufferDestroyed { id: RasterBufferId },
    RasterFinished,
    Drawn { buffers: Vec<RasterBufferId>, particle_count: u32 },
    ViewportUpdated { width: u32, height: u32 },
}

/// Shared, append-only call log.
#[derive(Debug, Clone, Default)]
pub struct Journal(Rc<RefCell<Vec<Event>>>);

impl Journal {
    pub fn events(&self) -> Vec<Event> {
        self.0.borrow().clone()
    }

    pub fn clear(&self) {
        self.0.borrow_mut().clear();
    }

    pub fn len(&self) -> usize {
        self.0.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.borrow().is_empty()
    }

    /// Number of events matching `predicate`.
    pub fn count(&self, predicate: impl Fn(&Event) -> bool) -> usize {
        self.0.borrow().iter().filter(|event| predicate(event)).count()
    }

    fn push(&self, event: Event) {
        self.0.borrow_mut().push(event);
    }
}

/// Operations that can be made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    Open,
    CreateBuffer,
    WriteBuffer,
    RegisterShared,
    Acquire,
    Release,
    SetArg,
    Enqueue,
    ComputeFinish,
    ReadBuffer,
    CreateRasterBuffer,
    WriteRasterBuffer,
    RasterFinish,
    Draw,
}

#[derive(Debug, Clone, Copy)]
struct FaultRule {
    skip: usize,
    remaining: Option<usize>,
}

/// Fault injection plan shared by every object of one accelerator.
#[derive(Debug, Clone, Default)]
pub struct Faults(Rc<RefCell<HashMap<Op, FaultRule>>>);

impl Faults {
    /// Fails every call to `op` until cleared.
    pub fn fail_always(&self, op: Op) {
        self.insert(op, 0, None);
    }

    /// Fails the next call to `op` only.
    pub fn fail_once(&self, op: Op) {
        self.insert(op, 0, Some(1));
    }

    /// Fails the `n`th call (1-based) to `op` from now on, once.
    pub fn fail_nth(&self, op: Op, n: usize) {
        self.insert(op, n.saturating_sub(1), Some(1));
    }

    pub fn clear(&self, op: Op) {
        self.0.borrow_mut().remove(&op);
    }

    pub fn clear_all(&self) {
        self.0.borrow_mut().clear();
    }

    fn insert(&self, op: Op, skip: usize, remaining: Option<usize>) {
        self.0
            .borrow_mut()
            .insert(op, FaultRule { skip, remaining });
    }

    fn check(&self, op: Op, operation: &'static str) -> Result<(), BackendError> {
        let mut rules = self.0.borrow_mut();
        let Some(rule) = rules.get_mut(&op) else {
            return Ok(());
        };
        if rule.skip > 0 {
            rule.skip -= 1;
            return Ok(());
        }
        match rule.remaining {
            Some(0) => Ok(()),
            Some(ref mut left) => {
                *left -= 1;
                Err(BackendError::call(operation, "injected fault"))
            }
            None => Err(BackendError::call(operation, "injected fault")),
        }
    }
}

/// A device offered by a recorded platform.
#[derive(Debug, Clone)]
pub struct DeviceSpec {
    pub name: String,
    pub kind: DeviceKind,
    pub interop: bool,
}

impl DeviceSpec {
    pub fn new(name: &str, kind: DeviceKind) -> Self {
        Self {
            name: name.to_string(),
            kind,
            interop: true,
        }
    }

    /// A device that cannot share buffers with the rasterizer.
    pub fn isolated(name: &str, kind: DeviceKind) -> Self {
        Self {
            interop: false,
            ..Self::new(name, kind)
        }
    }
}

#[derive(Debug, Clone)]
struct RecordedPlatform {
    name: String,
    devices: Vec<DeviceSpec>,
    broken: bool,
}

/// Accelerator whose platforms and devices are declared up front.
#[derive(Debug, Default)]
pub struct RecordingAccelerator {
    platforms: Vec<RecordedPlatform>,
    journal: Journal,
    faults: Faults,
}

impl RecordingAccelerator {
    /// An accelerator with no platforms at all.
    pub fn new() -> Self {
        Self::default()
    }

    /// One platform with one discrete GPU.
    pub fn single_gpu() -> Self {
        Self::new().with_platform(
            "Recording",
            vec![DeviceSpec::new("Recording GPU", DeviceKind::DiscreteGpu)],
        )
    }

    pub fn with_platform(mut self, name: &str, devices: Vec<DeviceSpec>) -> Self {
        self.platforms.push(RecordedPlatform {
            name: name.to_string(),
            devices,
            broken: false,
        });
        self
    }

    /// A platform whose device enumeration always fails.
    pub fn with_broken_platform(mut self, name: &str) -> Self {
        self.platforms.push(RecordedPlatform {
            name: name.to_string(),
            devices: Vec::new(),
            broken: true,
        });
        self
    }

    pub fn journal(&self) -> Journal {
        self.journal.clone()
    }

    pub fn faults(&self) -> Faults {
        self.faults.clone()
    }
}

impl Accelerator for RecordingAccelerator {
    type Shared = SharedMemory;
    type Compute = RecordingCompute;
    type Raster = RecordingRasterizer;

    fn platforms(&mut self) -> Result<Vec<PlatformInfo>, BackendError> {
        Ok(self
            .platforms
            .iter()
            .enumerate()
            .map(|(index, platform)| PlatformInfo {
                index,
                name: platform.name.clone(),
            })
            .collect())
    }

    fn devices(&mut self, platform: &PlatformInfo) -> Result<Vec<DeviceInfo>, BackendError> {
        let recorded = self
            .platforms
            .get(platform.index)
            .ok_or(BackendError::InvalidHandle {
                kind: "platform",
                index: platform.index,
            })?;
        if recorded.broken {
            return Err(BackendError::call(
                "enumerate devices",
                format!("platform {} did not respond", recorded.name),
            ));
        }

        Ok(recorded
            .devices
            .iter()
            .enumerate()
            .map(|(index, spec)| DeviceInfo {
                platform: platform.index,
                index,
                name: spec.name.clone(),
                vendor: recorded.name.clone(),
                kind: spec.kind,
                interop: spec.interop,
            })
            .collect())
    }

    fn open(&mut self, device: &DeviceInfo) -> Result<(RecordingCompute, RecordingRasterizer), BackendError> {
        self.faults.check(Op::Open, "open device")?;
        let known = self
            .platforms
            .get(device.platform)
            .and_then(|platform| platform.devices.get(device.index))
            .is_some_and(|spec| spec.name == device.name);
        if !known {
            return Err(BackendError::InvalidHandle {
                kind: "device",
                index: device.index,
            });
        }

        self.journal.push(Event::DeviceOpened {
            name: device.name.clone(),
        });
        let compute = RecordingCompute {
            device: device.clone(),
            journal: self.journal.clone(),
            faults: self.faults.clone(),
            programs: Vec::new(),
            kernels: Vec::new(),
            buffers: Vec::new(),
        };
        let raster = RecordingRasterizer {
            journal: self.journal.clone(),
            faults: self.faults.clone(),
            buffers: Vec::new(),
            viewport: (0, 0),
        };
        Ok((compute, raster))
    }
}

#[derive(Debug)]
struct SharedSlot {
    label: String,
    bytes: Vec<u8>,
    acquired: bool,
}

/// A dual-owned allocation visible to both sides.
#[derive(Debug, Clone)]
pub struct SharedMemory(Rc<RefCell<SharedSlot>>);

impl SharedMemory {
    pub fn bytes(&self) -> Vec<u8> {
        self.0.borrow().bytes.clone()
    }

    pub fn is_acquired(&self) -> bool {
        self.0.borrow().acquired
    }
}

#[derive(Debug)]
struct RecordedProgram {
    options: String,
    module: naga::Module,
}

#[derive(Debug)]
struct RecordedKernel {
    layout: EntryPointLayout,
    args: Vec<Option<KernelArg>>,
}

#[derive(Debug)]
enum ComputeSlot {
    Owned { label: String, bytes: Vec<u8> },
    Shared(SharedMemory),
}

/// Compute side of a recorded device.
#[derive(Debug)]
pub struct RecordingCompute {
    device: DeviceInfo,
    journal: Journal,
    faults: Faults,
    programs: Vec<Option<RecordedProgram>>,
    kernels: Vec<Option<RecordedKernel>>,
    buffers: Vec<Option<ComputeSlot>>,
}

impl RecordingCompute {
    /// Number of live buffers, compute-only and shared.
    pub fn live_buffers(&self) -> usize {
        self.buffers.iter().filter(|slot| slot.is_some()).count()
    }

    /// Current arguments of a kernel, by slot.
    pub fn kernel_args(&self, kernel: KernelHandle) -> Option<Vec<Option<KernelArg>>> {
        self.kernels
            .get(kernel.index)
            .and_then(Option::as_ref)
            .map(|k| k.args.clone())
    }

    fn slot(&self, buffer: BufferHandle) -> Result<&ComputeSlot, BackendError> {
        self.buffers
            .get(buffer.0)
            .and_then(Option::as_ref)
            .ok_or(BackendError::InvalidHandle {
                kind: "buffer",
                index: buffer.0,
            })
    }

    fn shared(&self, buffer: BufferHandle) -> Result<&SharedMemory, BackendError> {
        match self.slot(buffer)? {
            ComputeSlot::Shared(memory) => Ok(memory),
            ComputeSlot::Owned { label, .. } => Err(BackendError::call(
                "interop",
                format!("{label} is not a shared buffer"),
            )),
        }
    }

    fn kernel_mut(&mut self, kernel: KernelHandle) -> Result<&mut RecordedKernel, BackendError> {
        let live_program = self
            .programs
            .get(kernel.program.0)
            .is_some_and(Option::is_some);
        match self.kernels.get_mut(kernel.index).and_then(Option::as_mut) {
            Some(recorded) if live_program => Ok(recorded),
            _ => Err(BackendError::InvalidHandle {
                kind: "kernel",
                index: kernel.index,
            }),
        }
    }
}

impl ComputeBackend for RecordingCompute {
    type Shared = SharedMemory;

    fn device(&self) -> &DeviceInfo {
        &self.device
    }

    fn build_program(&mut self, source: &str, options: &str) -> Result<ProgramHandle, BuildLog> {
        let module = compile_wgsl(source).map_err(|diagnostics| BuildLog::failure(options, diagnostics))?;
        let program = ProgramHandle(self.programs.len());
        self.programs.push(Some(RecordedProgram {
            options: options.to_string(),
            module,
        }));
        self.journal.push(Event::ProgramBuilt { program });
        Ok(program)
    }

    fn build_log(&self, program: ProgramHandle) -> Result<BuildLog, BackendError> {
        let recorded = self
            .programs
            .get(program.0)
            .and_then(Option::as_ref)
            .ok_or(BackendError::InvalidHandle {
                kind: "program",
                index: program.0,
            })?;
        let mut log = BuildLog::success(&recorded.options);
        log.log = format!(
            "{} entry point(s) validated",
            recorded.module.entry_points.len()
        );
        Ok(log)
    }

    fn create_kernel(
        &mut self,
        program: ProgramHandle,
        entry_point: &str,
    ) -> Result<Option<KernelInfo>, BackendError> {
        let recorded = self
            .programs
            .get(program.0)
            .and_then(Option::as_ref)
            .ok_or(BackendError::InvalidHandle {
                kind: "program",
                index: program.0,
            })?;
        let Some(layout) = reflect_entry_point(&recorded.module, entry_point) else {
            return Ok(None);
        };

        let handle = KernelHandle {
            index: self.kernels.len(),
            program,
        };
        let slots = layout.slots();
        self.kernels.push(Some(RecordedKernel {
            args: vec![None; slots.len()],
            layout,
        }));
        self.journal.push(Event::KernelCreated { kernel: handle });
        Ok(Some(KernelInfo { handle, slots }))
    }

    fn release_program(&mut self, program: ProgramHandle) -> Result<(), BackendError> {
        let slot = self
            .programs
            .get_mut(program.0)
            .ok_or(BackendError::InvalidHandle {
                kind: "program",
                index: program.0,
            })?;
        if slot.take().is_none() {
            return Err(BackendError::InvalidHandle {
                kind: "program",
                index: program.0,
            });
        }
        self.journal.push(Event::ProgramReleased { program });
        Ok(())
    }

    fn create_buffer(&mut self, label: &str, bytes: &[u8]) -> Result<BufferHandle, BackendError> {
        self.faults.check(Op::CreateBuffer, "create buffer")?;
        let buffer = BufferHandle(self.buffers.len());
        self.buffers.push(Some(ComputeSlot::Owned {
            label: label.to_string(),
            bytes: bytes.to_vec(),
        }));
        self.journal.push(Event::BufferCreated {
            buffer,
            size: bytes.len(),
        });
        Ok(buffer)
    }

    fn write_buffer(&mut self, buffer: BufferHandle, bytes: &[u8]) -> Result<(), BackendError> {
        self.faults.check(Op::WriteBuffer, "write buffer")?;
        match self
            .buffers
            .get_mut(buffer.0)
            .and_then(Option::as_mut)
        {
            Some(ComputeSlot::Owned { label, bytes: stored }) => {
                if stored.len() != bytes.len() {
                    return Err(BackendError::call(
                        "write buffer",
                        format!("{label} holds {} bytes, got {}", stored.len(), bytes.len()),
                    ));
                }
                stored.copy_from_slice(bytes);
            }
            Some(ComputeSlot::Shared(memory)) => {
                let mut slot = memory.0.borrow_mut();
                if !slot.acquired {
                    return Err(BackendError::OwnershipViolation {
                        buffer: slot.label.clone(),
                        message: "compute write without acquisition".to_string(),
                    });
                }
                if slot.bytes.len() != bytes.len() {
                    return Err(BackendError::call("write buffer", "size differs"));
                }
                slot.bytes.copy_from_slice(bytes);
            }
            None => {
                return Err(BackendError::InvalidHandle {
                    kind: "buffer",
                    index: buffer.0,
                })
            }
        }
        self.journal.push(Event::BufferWritten {
            buffer,
            size: bytes.len(),
        });
        Ok(())
    }

    fn release_buffer(&mut self, buffer: BufferHandle) -> Result<(), BackendError> {
        let slot = self
            .buffers
            .get_mut(buffer.0)
            .and_then(Option::take)
            .ok_or(BackendError::InvalidHandle {
                kind: "buffer",
                index: buffer.0,
            })?;
        if let ComputeSlot::Shared(memory) = &slot {
            if memory.is_acquired() {
                let label = memory.0.borrow().label.clone();
                self.buffers[buffer.0] = Some(slot);
                return Err(BackendError::OwnershipViolation {
                    buffer: label,
                    message: "released while acquired".to_string(),
                });
            }
        }
        self.journal.push(Event::BufferReleased { buffer });
        Ok(())
    }

    fn register_shared(
        &mut self,
        _label: &str,
        shared: SharedMemory,
    ) -> Result<BufferHandle, BackendError> {
        self.faults.check(Op::RegisterShared, "register shared buffer")?;
        let buffer = BufferHandle(self.buffers.len());
        self.buffers.push(Some(ComputeSlot::Shared(shared)));
        self.journal.push(Event::SharedRegistered { buffer });
        Ok(buffer)
    }

    fn acquire_shared(&mut self, buffer: BufferHandle) -> Result<(), BackendError> {
        self.faults.check(Op::Acquire, "acquire shared buffer")?;
        let memory = self.shared(buffer)?;
        let mut slot = memory.0.borrow_mut();
        if slot.acquired {
            return Err(BackendError::OwnershipViolation {
                buffer: slot.label.clone(),
                message: "already acquired".to_string(),
            });
        }
        slot.acquired = true;
        drop(slot);
        self.journal.push(Event::Acquired { buffer });
        Ok(())
    }

    fn release_shared(&mut self, buffer: BufferHandle) -> Result<(), BackendError> {
        self.faults.check(Op::Release, "release shared buffer")?;
        let memory = self.shared(buffer)?;
        let mut slot = memory.0.borrow_mut();
        if !slot.acquired {
            return Err(BackendError::OwnershipViolation {
                buffer: slot.label.clone(),
                message: "released without acquisition".to_string(),
            });
        }
        slot.acquired = false;
        drop(slot);
        self.journal.push(Event::Released { buffer });
        Ok(())
    }

    fn set_arg(
        &mut self,
        kernel: KernelHandle,
        index: u32,
        arg: KernelArg,
    ) -> Result<(), BackendError> {
        self.faults.check(Op::SetArg, "set kernel argument")?;
        if let KernelArg::Buffer(buffer) = arg {
            self.slot(buffer)?;
        }
        let recorded = self.kernel_mut(kernel)?;
        let arity = recorded.args.len();
        let expected = recorded
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
        recorded.args[index as usize] = Some(arg);
        self.journal.push(Event::ArgSet { kernel, index, arg });
        Ok(())
    }

    fn enqueue(&mut self, kernel: KernelHandle, global_size: u32) -> Result<(), BackendError> {
        self.faults.check(Op::Enqueue, "enqueue kernel")?;
        let args = self.kernel_mut(kernel)?.args.clone();
        for (index, arg) in args.iter().enumerate() {
            match arg {
                None => return Err(BackendError::MissingArgument { index: index as u32 }),
                Some(KernelArg::Buffer(buffer)) => {
                    if let ComputeSlot::Shared(memory) = self.slot(*buffer)? {
                        if !memory.is_acquired() {
                            return Err(BackendError::OwnershipViolation {
                                buffer: memory.0.borrow().label.clone(),
                                message: "kernel launched on a buffer the rasterizer owns"
                                    .to_string(),
                            });
                        }
                    }
                }
                Some(KernelArg::Scalar(_)) => {}
            }
        }
        debug!("recording launch of kernel {} over {global_size} items", kernel.index);
        self.journal.push(Event::Enqueued {
            kernel,
            global_size,
        });
        Ok(())
    }

    fn finish(&mut self) -> Result<(), BackendError> {
        self.faults.check(Op::ComputeFinish, "finish compute queue")?;
        self.journal.push(Event::ComputeFinished);
        Ok(())
    }

    fn read_buffer(&mut self, buffer: BufferHandle) -> Result<Vec<u8>, BackendError> {
        self.faults.check(Op::ReadBuffer, "read buffer")?;
        Ok(match self.slot(buffer)? {
            ComputeSlot::Owned { bytes, .. } => bytes.clone(),
            ComputeSlot::Shared(memory) => memory.bytes(),
        })
    }
}

/// Rasterizer side of a recorded device.
#[derive(Debug)]
pub struct RecordingRasterizer {
    journal: Journal,
    faults: Faults,
    buffers: Vec<Option<SharedMemory>>,
    viewport: (u32, u32),
}

impl RecordingRasterizer {
    pub fn viewport(&self) -> (u32, u32) {
        self.viewport
    }

    pub fn live_buffers(&self) -> usize {
        self.buffers.iter().filter(|slot| slot.is_some()).count()
    }

    /// Contents of a drawable buffer as the rasterizer would draw them.
    pub fn contents(&self, id: RasterBufferId) -> Option<Vec<u8>> {
        self.buffers
            .get(id.0)
            .and_then(Option::as_ref)
            .map(SharedMemory::bytes)
    }

    fn memory(&self, id: RasterBufferId) -> Result<&SharedMemory, BackendError> {
        self.buffers
            .get(id.0)
            .and_then(Option::as_ref)
            .ok_or(BackendError::InvalidHandle {
                kind: "raster buffer",
                index: id.0,
            })
    }
}

impl Rasterizer for RecordingRasterizer {
    type Shared = SharedMemory;

    fn create_shared_buffer(
        &mut self,
        label: &str,
        bytes: &[u8],
    ) -> Result<RasterBufferId, BackendError> {
        self.faults.check(Op::CreateRasterBuffer, "create vertex buffer")?;
        let id = RasterBufferId(self.buffers.len());
        self.buffers.push(Some(SharedMemory(Rc::new(RefCell::new(SharedSlot {
            label: label.to_string(),
            bytes: bytes.to_vec(),
            acquired: false,
        })))));
        self.journal.push(Event::RasterBufferCreated {
            id,
            size: bytes.len(),
        });
        Ok(id)
    }

    fn export_shared(&self, id: RasterBufferId) -> Result<SharedMemory, BackendError> {
        self.memory(id).cloned()
    }

    fn write_shared_buffer(&mut self, id: RasterBufferId, bytes: &[u8]) -> Result<(), BackendError> {
        self.faults.check(Op::WriteRasterBuffer, "write vertex buffer")?;
        let memory = self.memory(id)?;
        let mut slot = memory.0.borrow_mut();
        if slot.acquired {
            return Err(BackendError::OwnershipViolation {
                buffer: slot.label.clone(),
                message: "raw copy while the compute engine owns the buffer".to_string(),
            });
        }
        if slot.bytes.len() != bytes.len() {
            return Err(BackendError::call(
                "write vertex buffer",
                format!("{} holds {} bytes, got {}", slot.label, slot.bytes.len(), bytes.len()),
            ));
        }
        slot.bytes.copy_from_slice(bytes);
        drop(slot);
        self.journal.push(Event::RasterBufferWritten {
            id,
            size: bytes.len(),
        });
        Ok(())
    }

    fn destroy_shared_buffer(&mut self, id: RasterBufferId) -> Result<(), BackendError> {
        let memory = self.memory(id)?;
        if memory.is_acquired() {
            return Err(BackendError::OwnershipViolation {
                buffer: memory.0.borrow().label.clone(),
                message: "destroyed while acquired".to_string(),
            });
        }
        self.buffers[id.0] = None;
        self.journal.push(Event::RasterBufferDestroyed { id });
        Ok(())
    }

    fn finish(&mut self) -> Result<(), BackendError> {
        self.faults.check(Op::RasterFinish, "finish draw queue")?;
        self.journal.push(Event::RasterFinished);
        Ok(())
    }

    fn draw(&mut self, buffers: &[RasterBufferId], particle_count: u32) -> Result<(), BackendError> {
        self.faults.check(Op::Draw, "draw points")?;
        for id in buffers {
            let memory = self.memory(*id)?;
            if memory.is_acquired() {
                return Err(BackendError::OwnershipViolation {
                    buffer: memory.0.borrow().label.clone(),
                    message: "drawn while the compute engine owns it".to_string(),
                });
            }
        }
        self.journal.push(Event::Drawn {
            buffers: buffers.to_vec(),
            particle_count,
        });
        Ok(())
    }

    fn update_viewport(&mut self, width: u32, height: u32) {
        self.viewport = (width, height);
        self.journal.push(Event::ViewportUpdated { width, height });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open() -> (RecordingAccelerator, RecordingCompute, RecordingRasterizer) {
        let mut accelerator = RecordingAccelerator::single_gpu();
        let platform = accelerator.platforms().unwrap().remove(0);
        let device = accelerator.devices(&platform).unwrap().remove(0);
        let (compute, raster) = accelerator.open(&device).unwrap();
        (accelerator, compute, raster)
    }

    #[test]
    fn test_raster_writes_are_visible_to_compute() {
        let (_accelerator, mut compute, mut raster) = open();
        let id = raster.create_shared_buffer("position", &[0u8; 8]).unwrap();
        let buffer = compute
            .register_shared("position", raster.export_shared(id).unwrap())
            .unwrap();

        raster.write_shared_buffer(id, &[7u8; 8]).unwrap();
        assert_eq!(compute.read_buffer(buffer).unwrap(), vec![7u8; 8]);
    }

    #[test]
    fn test_acquired_buffer_cannot_be_drawn_or_copied() {
        let (_accelerator, mut compute, mut raster) = open();
        let id = raster.create_shared_buffer("color", &[0u8; 16]).unwrap();
        let buffer = compute
            .register_shared("color", raster.export_shared(id).unwrap())
            .unwrap();

        compute.acquire_shared(buffer).unwrap();
        assert!(matches!(
            raster.draw(&[id], 1),
            Err(BackendError::OwnershipViolation { .. })
        ));
        assert!(raster.write_shared_buffer(id, &[1u8; 16]).is_err());
        assert!(compute.acquire_shared(buffer).is_err());

        compute.release_shared(buffer).unwrap();
        raster.draw(&[id], 1).unwrap();
        assert!(compute.release_shared(buffer).is_err());
    }

    #[test]
    fn test_fault_plan_counts_calls() {
        let faults = Faults::default();
        faults.fail_nth(Op::Acquire, 2);
        assert!(faults.check(Op::Acquire, "acquire").is_ok());
        assert!(faults.check(Op::Acquire, "acquire").is_err());
        assert!(faults.check(Op::Acquire, "acquire").is_ok());

        faults.fail_always(Op::Draw);
        assert!(faults.check(Op::Draw, "draw").is_err());
        assert!(faults.check(Op::Draw, "draw").is_err());
        faults.clear(Op::Draw);
        assert!(faults.check(Op::Draw, "draw").is_ok());
    }

    #[test]
    fn test_broken_platform_reports_error() {
        let mut accelerator = RecordingAccelerator::new().with_broken_platform("Flaky");
        let platform = accelerator.platforms().unwrap().remove(0);
        assert!(accelerator.devices(&platform).is_err());
    }

    #[test]
    fn test_unknown_device_cannot_be_opened() {
        let mut accelerator = RecordingAccelerator::single_gpu();
        let bogus = DeviceInfo {
            platform: 0,
            index: 3,
            name: "Missing".into(),
            vendor: String::new(),
            kind: DeviceKind::Cpu,
            interop: true,
        };
        assert!(accelerator.open(&bogus).is_err());
    }

    #[test]
    fn test_kernel_args_are_checked_against_layout() {
        let (_accelerator, mut compute, _raster) = open();
        let source = "@group(0) @binding(0) var<storage, read_write> data: array<f32>;\n\
                      struct P { dt: f32 }\n\
                      @group(0) @binding(1) var<uniform> p: P;\n\
                      @compute @workgroup_size(1) fn step(@builtin(global_invocation_id) id: vec3<u32>) {\n\
                          data[id.x] = data[id.x] + p.dt;\n\
                      }\n";
        let program = compute.build_program(source, "").unwrap();
        let info = compute.create_kernel(program, "step").unwrap().unwrap();
        assert_eq!(info.slots, vec![ArgKind::Buffer, ArgKind::Scalar]);

        let buffer = compute.create_buffer("data", &[0u8; 4]).unwrap();
        assert!(matches!(
            compute.set_arg(info.handle, 0, KernelArg::Scalar(1.0)),
            Err(BackendError::ArgumentKindMismatch { index: 0, .. })
        ));
        assert!(matches!(
            compute.set_arg(info.handle, 2, KernelArg::Scalar(1.0)),
            Err(BackendError::InvalidArgIndex { index: 2, arity: 2 })
        ));
        compute.set_arg(info.handle, 0, KernelArg::Buffer(buffer)).unwrap();
        assert!(matches!(
            compute.enqueue(info.handle, 1),
            Err(BackendError::MissingArgument { index: 1 })
        ));
        compute.set_arg(info.handle, 1, KernelArg::Scalar(0.5)).unwrap();
        compute.enqueue(info.handle, 1).unwrap();

        compute.release_program(program).unwrap();
        assert!(compute.enqueue(info.handle, 1).is_err());
    }
}
