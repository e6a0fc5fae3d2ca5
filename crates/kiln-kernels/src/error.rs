//! Error types for device sessions and kernel launches.
//!
//! Every failure is classified by [`ErrorKind`] so callers can tell a broken
//! setup (bad kernel file, unknown kernel name) from a device fault
//! (allocation, enqueue, drain) or from a shape they passed in wrong.

use std::path::PathBuf;

/// Coarse classification of a [`DispatchError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Session setup or kernel lookup failed. Retrying the same call won't help.
    Configuration,
    /// A device API call failed mid-operation. The session may still be usable.
    Device,
    /// The caller passed shapes or slices that violate a launch contract.
    Precondition,
}

/// Dispatch-layer errors.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("failed to read kernel source '{}': {source}", path.display())]
    KernelSource {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("OpenCL runtime not available: {0}")]
    LibraryUnavailable(String),

    #[error("no compute platform found")]
    NoPlatform,

    #[error("no {device_type} device found on the selected platform")]
    NoDevice { device_type: String },

    #[error("kernel program failed to build:\n{log}")]
    Build { log: String },

    #[error("kernel '{name}' not found in compiled program")]
    KernelNotFound { name: String },

    #[error("local work-group size must be positive, got {0}")]
    InvalidLocalSize(usize),

    #[error("device call {call} failed with code {code}")]
    Device { code: i32, call: String },

    #[error(transparent)]
    Precondition(#[from] PreconditionError),
}

impl DispatchError {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            DispatchError::KernelSource { .. }
            | DispatchError::LibraryUnavailable(_)
            | DispatchError::NoPlatform
            | DispatchError::NoDevice { .. }
            | DispatchError::Build { .. }
            | DispatchError::KernelNotFound { .. }
            | DispatchError::InvalidLocalSize(_) => ErrorKind::Configuration,
            DispatchError::Device { .. } => ErrorKind::Device,
            DispatchError::Precondition(_) => ErrorKind::Precondition,
        }
    }

    pub(crate) fn device(code: i32, call: impl Into<String>) -> Self {
        DispatchError::Device { code, call: call.into() }
    }
}

/// Launch contract violations, detected before any device work happens.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PreconditionError {
    #[error("{op}: every shape dimension must be positive")]
    EmptyShape { op: &'static str },

    #[error("{arg}: expected {expected} elements, got {actual}")]
    LengthMismatch {
        arg: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("dense multiply: left has {left_cols} columns but right has {right_rows} rows")]
    InnerDimMismatch { left_cols: usize, right_rows: usize },

    #[error("pool: rows and cols must be even, got {rows}x{cols}")]
    OddPoolDims { rows: usize, cols: usize },

    #[error("{arg} = {value} does not fit in a kernel int argument")]
    DimOverflow { arg: &'static str, value: usize },

    #[error("{op}: element count overflows usize")]
    WorkOverflow { op: &'static str },
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, DispatchError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kinds() {
        assert_eq!(DispatchError::NoPlatform.kind(), ErrorKind::Configuration);
        assert_eq!(
            DispatchError::KernelNotFound { name: "k".into() }.kind(),
            ErrorKind::Configuration
        );
        assert_eq!(DispatchError::device(-5, "clCreateBuffer").kind(), ErrorKind::Device);
        let pre: DispatchError = PreconditionError::OddPoolDims { rows: 3, cols: 4 }.into();
        assert_eq!(pre.kind(), ErrorKind::Precondition);
    }

    #[test]
    fn test_display() {
        let e = DispatchError::device(-4, "clCreateBuffer(96 bytes)");
        assert_eq!(e.to_string(), "device call clCreateBuffer(96 bytes) failed with code -4");

        let e: DispatchError = PreconditionError::LengthMismatch {
            arg: "filter",
            expected: 9,
            actual: 8,
        }
        .into();
        assert_eq!(e.to_string(), "filter: expected 9 elements, got 8");
    }
}
