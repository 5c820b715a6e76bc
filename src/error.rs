//! Error types for the dispatch pipeline.
//!
//! Every stage of the pipeline reports failure to its caller through
//! [`DispatchError`].  Nothing in the library terminates the process;
//! the binary decides what a failure means.  Errors raised by wgpu are
//! rendered to strings at the boundary so that the error type stays
//! `Send + Sync` and independent of the backend's own error types.

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias using [`DispatchError`].
pub type Result<T> = std::result::Result<T, DispatchError>;

/// Errors that can occur while discovering a device, building a program
/// or dispatching a kernel.
#[derive(Error, Debug)]
pub enum DispatchError {
    /// No platform exposes a usable adapter, or the query itself failed.
    #[error("device discovery failed: {0}")]
    Discovery(String),

    /// No device of the preferred kind nor of the fallback kind exists.
    #[error("no device found (preferred {preferred}, fallback {fallback})")]
    DeviceNotFound {
        /// Kind requested by the caller
        preferred: crate::DeviceKind,
        /// Kind tried after the preferred kind came up empty
        fallback: crate::DeviceKind,
    },

    /// Context or queue creation failed.
    #[error("failed to create compute session: {0}")]
    SessionCreation(String),

    /// The session was used after `close`.
    #[error("compute session is closed")]
    SessionClosed,

    /// Program compilation failed.  `log` holds the build diagnostics.
    #[error("program build failed:\n{log}")]
    Build {
        /// Bounded diagnostic text, never empty
        log: String,
    },

    /// The built program has no compute entry point with this name.
    #[error("entry point '{name}' not found (available: {available:?})")]
    EntryPointNotFound {
        /// Requested entry point
        name: String,
        /// Compute entry points the program does declare
        available: Vec<String>,
    },

    /// The entry point exists but uses resources the launcher cannot bind.
    #[error("kernel '{name}' is not supported: {reason}")]
    UnsupportedKernel {
        /// Entry point name
        name: String,
        /// What the launcher rejected
        reason: String,
    },

    /// Binding a single positional argument failed.
    #[error("cannot bind argument {index}: {reason}")]
    ArgumentBind {
        /// Positional index of the offending argument
        index: u32,
        /// Why the binding was rejected
        reason: String,
    },

    /// The device could not satisfy a buffer allocation.
    #[error("failed to allocate {size} bytes: {reason}")]
    Allocation {
        /// Requested size in bytes
        size: u64,
        /// Device-side reason
        reason: String,
    },

    /// Submitting a kernel for execution failed.
    #[error("failed to enqueue kernel '{kernel}': {reason}")]
    Enqueue {
        /// Entry point name
        kernel: String,
        /// What went wrong
        reason: String,
    },

    /// Copying device memory back to the host failed.
    #[error("result transfer failed: {0}")]
    Transfer(String),

    /// A configuration defect, such as a tile that does not divide the grid.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The kernel source could not be loaded.
    #[error("failed to load kernel source {path:?}: {source}")]
    SourceLoad {
        /// Path that was requested
        path: PathBuf,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// Host data does not match the declared matrix shape.
    #[error("shape mismatch: expected {expected} elements, got {got}")]
    Shape {
        /// Element count implied by the shape
        expected: usize,
        /// Element count supplied
        got: usize,
    },
}

impl DispatchError {
    /// Construct an [`DispatchError::ArgumentBind`] for `index`.
    pub(crate) fn bind(index: u32, reason: impl Into<String>) -> Self {
        Self::ArgumentBind {
            index,
            reason: reason.into(),
        }
    }

    /// Construct an [`DispatchError::Enqueue`] for `kernel`.
    pub(crate) fn enqueue(kernel: &str, reason: impl Into<String>) -> Self {
        Self::Enqueue {
            kernel: kernel.to_string(),
            reason: reason.into(),
        }
    }

    /// Returns the build diagnostics if this is a build failure.
    pub fn build_log(&self) -> Option<&str> {
        match self {
            Self::Build { log } => Some(log),
            _ => None,
        }
    }
}
