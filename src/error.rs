//! Error types for the Universe simulator.
//!
//! Two layers: [`BackendError`] is what a single native call on the
//! accelerator or rasterizer boundary reports, [`SimulationError`] is the
//! session-level taxonomy callers act on (retry the next frame, or stop).

use thiserror::Error;

use crate::simulation::dispatch::CycleState;
use crate::simulation::particles::FieldName;
use crate::simulation::program::BuildLog;

/// Session result type alias.
pub type SimResult<T> = Result<T, SimulationError>;

/// A failed call on the accelerator or rasterizer boundary.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BackendError {
    /// The native call itself reported failure.
    #[error("{operation} failed: {message}")]
    Call {
        operation: &'static str,
        message: String,
    },

    /// A handle that was never issued, or has been released.
    #[error("invalid {kind} handle {index}")]
    InvalidHandle { kind: &'static str, index: usize },

    /// Argument slot outside the kernel's declared arity.
    #[error("argument index {index} out of range for kernel with {arity} arguments")]
    InvalidArgIndex { index: u32, arity: usize },

    /// A buffer bound to a scalar slot or the other way round.
    #[error("argument {index} expects {expected}, got {actual}")]
    ArgumentKindMismatch {
        index: u32,
        expected: &'static str,
        actual: &'static str,
    },

    /// Enqueue attempted with an unbound argument slot.
    #[error("argument {index} was never bound")]
    MissingArgument { index: u32 },

    /// A shared buffer was touched by the side that does not own it.
    #[error("ownership violation on {buffer}: {message}")]
    OwnershipViolation { buffer: String, message: String },
}

impl BackendError {
    pub fn call(operation: &'static str, message: impl Into<String>) -> Self {
        BackendError::Call {
            operation,
            message: message.into(),
        }
    }
}

/// Session-level errors.
#[derive(Error, Debug)]
pub enum SimulationError {
    /// A single platform could not be enumerated; the rest were still tried.
    #[error("enumeration of platform {platform} failed: {source}")]
    EnumerationFailure {
        platform: String,
        #[source]
        source: BackendError,
    },

    /// The accelerator runtime exposes no platform at all.
    #[error("no accelerator platform found")]
    NoPlatformFound,

    /// Enumeration produced no usable device.
    #[error("no accelerator device found: {0}")]
    NoDeviceFound(String),

    /// Opening the selected device failed.
    #[error("failed to open device {device}: {source}")]
    DeviceOpen {
        device: String,
        #[source]
        source: BackendError,
    },

    /// Kernel source did not compile; the log carries the diagnostics.
    #[error("program build failed ({})", .log.status)]
    BuildFailed { log: BuildLog },

    /// The compiled program has no compute entry point with this name.
    #[error("kernel entry point `{0}` not found")]
    KernelNotFound(String),

    /// The kernel's declared argument list does not match what the host binds.
    #[error("kernel `{entry_point}` declares {declared} arguments, host binds {bound}")]
    ArityMismatch {
        entry_point: String,
        declared: usize,
        bound: usize,
    },

    /// The host's argument list disagrees with the kernel or breaks the
    /// dual-owned, compute-only, timestep ordering.
    #[error("invalid signature for kernel `{entry_point}`: {reason}")]
    InvalidSignature { entry_point: String, reason: String },

    /// A dual-owned buffer cannot change size after creation.
    #[error("size mismatch on {field}: buffer holds {expected} bytes, got {actual}")]
    SizeMismatch {
        field: FieldName,
        expected: u64,
        actual: u64,
    },

    /// A field was re-registered under a different role.
    #[error("{field} is registered as {registered}, not {requested}")]
    RoleMismatch {
        field: FieldName,
        registered: &'static str,
        requested: &'static str,
    },

    /// Parallel particle arrays of unequal length.
    #[error("particle arrays disagree: {field} has {actual} entries, expected {expected}")]
    FieldLengthMismatch {
        field: FieldName,
        expected: usize,
        actual: usize,
    },

    /// A particle field must hold at least one particle.
    #[error("particle field is empty")]
    EmptyField,

    /// Timesteps must be positive and finite.
    #[error("invalid timestep {0}")]
    InvalidTimestep(f32),

    /// `step` or `render` before `load_particles`.
    #[error("no particles loaded")]
    NotLoaded,

    /// The named field has no registered buffer.
    #[error("{0} has no registered buffer")]
    UnknownField(FieldName),

    /// A step was issued while the previous cycle had not returned to idle.
    #[error("dispatch cycle already in progress ({0})")]
    CycleInProgress(CycleState),

    /// A native call failed mid-cycle. Buffers were released before this
    /// was returned, so the caller may retry on the next frame.
    #[error("dispatch failed while {phase}: {source}")]
    DispatchFailure {
        phase: CycleState,
        #[source]
        source: BackendError,
    },

    /// Shared buffers could not be handed back to the rasterizer.
    #[error("{count} shared buffer(s) stuck in compute ownership: {source}")]
    StuckBuffers {
        count: usize,
        #[source]
        source: BackendError,
    },

    /// Any other boundary failure outside a dispatch cycle.
    #[error(transparent)]
    Backend(#[from] BackendError),
}

impl SimulationError {
    /// Whether the session is unusable after this error.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SimulationError::NoPlatformFound
                | SimulationError::NoDeviceFound(_)
                | SimulationError::DeviceOpen { .. }
                | SimulationError::BuildFailed { .. }
                | SimulationError::KernelNotFound(_)
                | SimulationError::ArityMismatch { .. }
                | SimulationError::InvalidSignature { .. }
                | SimulationError::StuckBuffers { .. }
        )
    }
}

/// Malformed configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {key}: {reason}")]
    InvalidValue {
        key: &'static str,
        value: String,
        reason: String,
    },

    #[error("failed to read kernel source {path}: {source}")]
    KernelSource {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulation::program::BuildStatus;

    #[test]
    fn test_fatal_classification() {
        let log = BuildLog {
            status: BuildStatus::Error,
            options: String::new(),
            log: "error".into(),
        };
        assert!(SimulationError::BuildFailed { log }.is_fatal());
        assert!(SimulationError::NoPlatformFound.is_fatal());

        let dispatch = SimulationError::DispatchFailure {
            phase: CycleState::Executing,
            source: BackendError::call("enqueue", "lost"),
        };
        assert!(!dispatch.is_fatal());

        let size = SimulationError::SizeMismatch {
            field: FieldName::Position,
            expected: 48,
            actual: 64,
        };
        assert!(!size.is_fatal());
    }

    #[test]
    fn test_display_includes_context() {
        let err = SimulationError::DispatchFailure {
            phase: CycleState::Bound,
            source: BackendError::InvalidArgIndex { index: 9, arity: 7 },
        };
        let text = err.to_string();
        assert!(text.contains("bound"));
        assert!(text.contains("argument index 9"));
    }
}
