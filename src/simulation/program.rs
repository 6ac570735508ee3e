//! Program builder
//!
//! Compiles kernel source against the opened device and resolves the
//! simulation kernel inside it. Both shipped backends consume WGSL; the
//! front-end checks and binding reflection here are shared by them so the
//! build log and the reflected arity are identical whichever backend runs.

use std::fmt;

use log::{debug, error, info};

use crate::backend::{ArgKind, ComputeBackend, KernelHandle, ProgramHandle};
use crate::error::{SimResult, SimulationError};
use crate::simulation::particles::FieldName;
use crate::simulation::registry::BufferRole;

/// The particle kernel shipped with the crate.
pub const PARTICLE_KERNEL: &str = include_str!("shaders/particles.wgsl");

/// Entry point of [`PARTICLE_KERNEL`].
pub const PARTICLE_ENTRY_POINT: &str = "universe";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildStatus {
    Success,
    Error,
}

impl fmt::Display for BuildStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BuildStatus::Success => write!(f, "success"),
            BuildStatus::Error => write!(f, "error"),
        }
    }
}

/// Status, options and diagnostic text of one build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildLog {
    pub status: BuildStatus,
    pub options: String,
    pub log: String,
}

impl BuildLog {
    pub fn success(options: &str) -> Self {
        Self {
            status: BuildStatus::Success,
            options: options.to_string(),
            log: String::new(),
        }
    }

    pub fn failure(options: &str, log: impl Into<String>) -> Self {
        let mut log = log.into();
        if log.trim().is_empty() {
            log = "build failed without diagnostics".to_string();
        }
        Self {
            status: BuildStatus::Error,
            options: options.to_string(),
            log,
        }
    }
}

/// Named compile-time constants, prepended to the kernel as WGSL `const`s.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BuildOptions {
    constants: Vec<(String, f32)>,
}

impl BuildOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces a constant.
    pub fn define(mut self, name: &str, value: f32) -> Self {
        match self.constants.iter_mut().find(|(n, _)| n == name) {
            Some(entry) => entry.1 = value,
            None => self.constants.push((name.to_string(), value)),
        }
        self
    }

    pub fn constants(&self) -> &[(String, f32)] {
        &self.constants
    }

    /// WGSL declarations for every constant.
    pub fn prelude(&self) -> String {
        self.constants
            .iter()
            .map(|(name, value)| format!("const {name}: f32 = {value:?};\n"))
            .collect()
    }

    /// `source` with the prelude in front of it.
    pub fn apply(&self, source: &str) -> String {
        format!("{}{}", self.prelude(), source)
    }

    fn non_finite(&self) -> Option<&str> {
        self.constants
            .iter()
            .find(|(_, value)| !value.is_finite())
            .map(|(name, _)| name.as_str())
    }
}

impl fmt::Display for BuildOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (name, value)) in self.constants.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            write!(f, "-D {name}={value:?}")?;
        }
        Ok(())
    }
}

/// One position in a kernel's argument list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelParam {
    Field(FieldName),
    Timestep,
}

impl KernelParam {
    pub fn kind(&self) -> ArgKind {
        match self {
            KernelParam::Field(_) => ArgKind::Buffer,
            KernelParam::Timestep => ArgKind::Scalar,
        }
    }
}

/// The argument list the host binds, in slot order.
///
/// Dual-owned fields come first, then compute-only fields, then exactly one
/// trailing timestep. Changing the order means changing the kernel too.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelSignature {
    entry_point: String,
    params: Vec<KernelParam>,
}

impl KernelSignature {
    pub fn new(entry_point: &str, params: Vec<KernelParam>) -> SimResult<Self> {
        let signature = Self {
            entry_point: entry_point.to_string(),
            params,
        };
        signature.check_order()?;
        Ok(signature)
    }

    /// Signature of [`PARTICLE_KERNEL`].
    pub fn particles() -> Self {
        Self {
            entry_point: PARTICLE_ENTRY_POINT.to_string(),
            params: vec![
                KernelParam::Field(FieldName::Position),
                KernelParam::Field(FieldName::Color),
                KernelParam::Field(FieldName::Mass),
                KernelParam::Field(FieldName::Velocity),
                KernelParam::Field(FieldName::InitialPosition),
                KernelParam::Field(FieldName::InitialVelocity),
                KernelParam::Timestep,
            ],
        }
    }

    pub fn entry_point(&self) -> &str {
        &self.entry_point
    }

    pub fn params(&self) -> &[KernelParam] {
        &self.params
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    /// Fields bound by this signature, in slot order.
    pub fn fields(&self) -> impl Iterator<Item = FieldName> + '_ {
        self.params.iter().filter_map(|param| match param {
            KernelParam::Field(field) => Some(*field),
            KernelParam::Timestep => None,
        })
    }

    fn check_order(&self) -> SimResult<()> {
        let bad = |reason: &str| {
            Err(SimulationError::InvalidSignature {
                entry_point: self.entry_point.clone(),
                reason: reason.to_string(),
            })
        };

        if self.params.last() != Some(&KernelParam::Timestep) {
            return bad("the timestep must be the last argument");
        }
        let fields: Vec<FieldName> = self.fields().collect();
        if fields.len() + 1 != self.params.len() {
            return bad("only one timestep argument is allowed");
        }
        if let Some(first_compute) = fields
            .iter()
            .position(|field| field.role() == BufferRole::ComputeOnly)
        {
            if fields[first_compute..]
                .iter()
                .any(|field| field.role() == BufferRole::DualOwned)
            {
                return bad("dual-owned buffers must precede compute-only buffers");
            }
        }
        for (i, field) in fields.iter().enumerate() {
            if fields[..i].contains(field) {
                return bad("a field may only be bound once");
            }
        }
        Ok(())
    }
}

/// A program built for one device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Program {
    pub handle: ProgramHandle,
    pub log: BuildLog,
}

/// A named entry point with the argument list it was checked against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Kernel {
    pub handle: KernelHandle,
    pub signature: KernelSignature,
}

impl Kernel {
    pub fn arity(&self) -> usize {
        self.signature.len()
    }
}

/// Compiles `source` (with `options` applied) on the backend's device.
///
/// On failure the backend's status, options and log are logged before
/// [`SimulationError::BuildFailed`] is returned.
pub fn build<C: ComputeBackend>(
    compute: &mut C,
    source: &str,
    options: &BuildOptions,
) -> SimResult<Program> {
    let option_string = options.to_string();
    info!(
        "Building program for {} ({} bytes of source)",
        compute.device().name,
        source.len()
    );

    if let Some(name) = options.non_finite() {
        let log = BuildLog::failure(
            &option_string,
            format!("constant {name} is not a finite number"),
        );
        report_failure(&log);
        return Err(SimulationError::BuildFailed { log });
    }

    match compute.build_program(&options.apply(source), &option_string) {
        Ok(handle) => {
            let log = compute.build_log(handle)?;
            info!("Build status: {}", log.status);
            debug!("Build options: {}", log.options);
            if !log.log.is_empty() {
                debug!("Build log:\n{}", log.log);
            }
            Ok(Program { handle, log })
        }
        Err(log) => {
            let log = if log.log.trim().is_empty() {
                BuildLog::failure(&log.options, "build failed without diagnostics")
            } else {
                log
            };
            report_failure(&log);
            Err(SimulationError::BuildFailed { log })
        }
    }
}

fn report_failure(log: &BuildLog) {
    error!("Build status: {}", log.status);
    error!("Build options: {}", log.options);
    error!("Build log:\n{}", log.log);
}

/// Resolves `signature`'s entry point in `program` and checks the kernel's
/// declared arguments against it, slot by slot.
pub fn create_kernel<C: ComputeBackend>(
    compute: &mut C,
    program: &Program,
    signature: &KernelSignature,
) -> SimResult<Kernel> {
    let info = compute
        .create_kernel(program.handle, signature.entry_point())?
        .ok_or_else(|| SimulationError::KernelNotFound(signature.entry_point().to_string()))?;

    if info.arity() != signature.len() {
        return Err(SimulationError::ArityMismatch {
            entry_point: signature.entry_point().to_string(),
            declared: info.arity(),
            bound: signature.len(),
        });
    }
    for (index, (declared, param)) in info.slots.iter().zip(signature.params()).enumerate() {
        if *declared != param.kind() {
            return Err(SimulationError::InvalidSignature {
                entry_point: signature.entry_point().to_string(),
                reason: format!(
                    "slot {index} is a {} in the kernel but the host binds a {}",
                    declared.as_str(),
                    param.kind().as_str()
                ),
            });
        }
    }

    info!(
        "Kernel `{}` ready with {} arguments",
        signature.entry_point(),
        info.arity()
    );
    Ok(Kernel {
        handle: info.handle,
        signature: signature.clone(),
    })
}

/// Parses and validates WGSL, returning the module or printable diagnostics.
pub fn compile_wgsl(source: &str) -> Result<naga::Module, String> {
    use naga::valid::{Capabilities, ValidationFlags, Validator};

    let module = naga::front::wgsl::parse_str(source).map_err(|e| e.emit_to_string(source))?;

    let mut validator = Validator::new(ValidationFlags::all(), Capabilities::all());
    validator
        .validate(&module)
        .map_err(|e| format!("Validation error: {:?}", e))?;

    Ok(module)
}

/// Group 0 bindings of a compute entry point, sorted by binding number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryPointLayout {
    pub workgroup_size: [u32; 3],
    pub bindings: Vec<(u32, ArgKind)>,
}

impl EntryPointLayout {
    pub fn slots(&self) -> Vec<ArgKind> {
        self.bindings.iter().map(|(_, kind)| *kind).collect()
    }
}

/// Finds compute entry point `name` in `module`. Uniform bindings are
/// scalar slots, everything else is a buffer slot.
pub fn reflect_entry_point(module: &naga::Module, name: &str) -> Option<EntryPointLayout> {
    let entry = module
        .entry_points
        .iter()
        .find(|ep| ep.name == name && ep.stage == naga::ShaderStage::Compute)?;

    let mut bindings: Vec<(u32, ArgKind)> = module
        .global_variables
        .iter()
        .filter_map(|(_, var)| {
            let binding = var.binding.as_ref()?;
            if binding.group != 0 {
                return None;
            }
            let kind = match var.space {
                naga::AddressSpace::Uniform => ArgKind::Scalar,
                _ => ArgKind::Buffer,
            };
            Some((binding.binding, kind))
        })
        .collect();
    bindings.sort_by_key(|(binding, _)| *binding);

    Some(EntryPointLayout {
        workgroup_size: entry.workgroup_size,
        bindings,
    })
}

/// Build options for [`PARTICLE_KERNEL`].
pub fn particle_kernel_options(
    gravitational_constant: f32,
    softening: f32,
    escape_radius: f32,
) -> BuildOptions {
    BuildOptions::new()
        .define("G", gravitational_constant)
        .define("SOFTENING", softening)
        .define("ESCAPE_RADIUS", escape_radius)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn default_options() -> BuildOptions {
        particle_kernel_options(6.674e-11, 0.01, 4.0)
    }

    #[test]
    fn test_particle_kernel_validates() {
        let source = default_options().apply(PARTICLE_KERNEL);
        if let Err(diagnostics) = compile_wgsl(&source) {
            panic!("particle kernel failed to validate:\n{diagnostics}");
        }
    }

    #[test]
    fn test_particle_kernel_matches_signature() {
        let module = compile_wgsl(&default_options().apply(PARTICLE_KERNEL)).unwrap();
        let layout = reflect_entry_point(&module, PARTICLE_ENTRY_POINT).unwrap();
        let signature = KernelSignature::particles();

        assert_eq!(layout.bindings.len(), signature.len());
        let expected: Vec<ArgKind> = signature.params().iter().map(|p| p.kind()).collect();
        assert_eq!(layout.slots(), expected);
        for (slot, (binding, _)) in layout.bindings.iter().enumerate() {
            assert_eq!(*binding as usize, slot);
        }
    }

    #[test]
    fn test_kernel_without_constants_fails_with_diagnostics() {
        let err = compile_wgsl(PARTICLE_KERNEL).unwrap_err();
        assert!(!err.is_empty());
    }

    #[test]
    fn test_reflect_unknown_entry_point() {
        let module = compile_wgsl(&default_options().apply(PARTICLE_KERNEL)).unwrap();
        assert!(reflect_entry_point(&module, "vortex").is_none());
    }

    #[test]
    fn test_options_render_as_consts() {
        let options = BuildOptions::new().define("G", 2.0).define("SOFTENING", 0.5);
        assert_eq!(
            options.prelude(),
            "const G: f32 = 2.0;\nconst SOFTENING: f32 = 0.5;\n"
        );
        assert_eq!(options.to_string(), "-D G=2.0 -D SOFTENING=0.5");

        let replaced = options.define("G", 3.0);
        assert_eq!(replaced.constants().len(), 2);
        assert_eq!(replaced.constants()[0], ("G".to_string(), 3.0));
    }

    #[test]
    fn test_signature_order_is_checked() {
        let timestep_first = KernelSignature::new(
            "k",
            vec![KernelParam::Timestep, KernelParam::Field(FieldName::Position)],
        );
        assert!(matches!(
            timestep_first,
            Err(SimulationError::InvalidSignature { .. })
        ));

        let compute_before_dual = KernelSignature::new(
            "k",
            vec![
                KernelParam::Field(FieldName::Velocity),
                KernelParam::Field(FieldName::Position),
                KernelParam::Timestep,
            ],
        );
        assert!(compute_before_dual.is_err());

        let duplicate = KernelSignature::new(
            "k",
            vec![
                KernelParam::Field(FieldName::Position),
                KernelParam::Field(FieldName::Position),
                KernelParam::Timestep,
            ],
        );
        assert!(duplicate.is_err());

        let ok = KernelSignature::new(
            "k",
            vec![
                KernelParam::Field(FieldName::Position),
                KernelParam::Field(FieldName::Velocity),
                KernelParam::Timestep,
            ],
        );
        assert!(ok.is_ok());
        assert!(KernelSignature::new("k", KernelSignature::particles().params().to_vec()).is_ok());
    }

    #[test]
    fn test_empty_failure_log_gets_text() {
        let log = BuildLog::failure("-D G=1.0", "   ");
        assert_eq!(log.status, BuildStatus::Error);
        assert!(!log.log.trim().is_empty());
    }
}
