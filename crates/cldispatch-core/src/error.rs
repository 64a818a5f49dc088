//! Error types for dispatch operations

use std::fmt;

/// Result type for dispatch operations
pub type Result<T> = std::result::Result<T, DispatchError>;

/// Errors surfaced by the dispatch layer.
///
/// Every error is terminal to the current dispatch session; nothing is retried
/// internally.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// The driver reported no compute platforms
    #[error("no compute platform found; check the compute runtime installation")]
    NoPlatformFound,

    /// The chosen platform exposes no devices
    #[error("platform '{platform}' exposes no compute devices")]
    NoDeviceFound { platform: String },

    /// Caller-supplied index outside the enumerated list
    #[error("invalid {what} selection: index {index} but only {available} available")]
    InvalidSelection {
        what: &'static str,
        index: usize,
        available: usize,
    },

    /// The owning context was released (or never existed)
    #[error("{operation} requires a live context")]
    ContextRequired { operation: &'static str },

    /// A resource was used with a context (or device) it does not belong to
    #[error("{operation}: resource belongs to a different context")]
    ContextMismatch { operation: &'static str },

    /// Program build failed; `log` is the verbatim compiler output
    #[error("program build failed:\n{log}")]
    BuildFailed { log: String },

    /// Entry point does not exist in the built program
    #[error("kernel '{name}' not found in program (available: {available:?})")]
    KernelNotFound { name: String, available: Vec<String> },

    /// The device could not satisfy an allocation request
    #[error("allocation of {requested} bytes failed: {reason}")]
    AllocationFailed { requested: usize, reason: String },

    /// Transfer range exceeds the buffer's fixed capacity
    #[error("transfer out of bounds: offset {offset} + size {size} > buffer size {buffer_size}")]
    BoundsViolation {
        offset: usize,
        size: usize,
        buffer_size: usize,
    },

    /// Argument slot beyond the kernel's declared arity
    #[error("kernel '{kernel}' takes {arity} arguments; position {position} is invalid")]
    InvalidArgumentPosition {
        kernel: String,
        position: usize,
        arity: usize,
    },

    /// Value layout disagrees with the slot's declared type
    #[error("type mismatch in {site}: expected {expected}, got {actual}")]
    TypeMismatch {
        site: String,
        expected: String,
        actual: String,
    },

    /// Index space dimensionality differs from what the kernel indexes
    #[error("kernel '{kernel}' expects a {expected}-D index space, got {actual}-D")]
    DimensionMismatch {
        kernel: String,
        expected: usize,
        actual: usize,
    },

    /// Submission attempted with an argument slot left unbound
    #[error("kernel '{kernel}' argument {position} is unbound")]
    UnboundArgument { kernel: String, position: usize },

    /// Zero-sized or otherwise unusable index space
    #[error("invalid index space: {0}")]
    InvalidIndexSpace(String),

    /// Deferred transfer redeemed without a covering drain barrier
    #[error("deferred transfer #{sequence} on queue {queue} is not covered by a drain barrier")]
    TransferPending { queue: u64, sequence: u64 },

    /// Host operands do not describe consistent shapes
    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),

    /// Dispatch configuration could not be parsed
    #[error("invalid dispatch configuration: {0}")]
    InvalidConfig(String),

    /// Error code or message from the underlying compute runtime
    #[error("{operation} failed: {message}")]
    Driver { operation: &'static str, message: String },
}

impl DispatchError {
    /// Create a build failure carrying a diagnostic log
    pub fn build_failed(log: impl Into<String>) -> Self {
        Self::BuildFailed { log: log.into() }
    }

    /// Create a runtime error tagged with the failing operation
    pub fn driver(operation: &'static str, message: impl fmt::Display) -> Self {
        Self::Driver {
            operation,
            message: message.to_string(),
        }
    }

    /// Create a type mismatch error
    pub fn type_mismatch(site: impl Into<String>, expected: impl fmt::Display, actual: impl fmt::Display) -> Self {
        Self::TypeMismatch {
            site: site.into(),
            expected: expected.to_string(),
            actual: actual.to_string(),
        }
    }

    /// Create an allocation failure
    pub fn allocation_failed(requested: usize, reason: impl Into<String>) -> Self {
        Self::AllocationFailed {
            requested,
            reason: reason.into(),
        }
    }

    /// Build log for `BuildFailed`, `None` for every other variant
    pub fn build_log(&self) -> Option<&str> {
        match self {
            Self::BuildFailed { log } => Some(log),
            _ => None,
        }
    }
}
