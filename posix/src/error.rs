//! Error types
//!
//! Failures are split into two classes:
//! - **Recoverable errors**: reported to the requesting process as errno-style
//!   results (mapping collisions, missing children, permission checks, ...)
//! - **Fatal errors** ([`Error::Kernel`]): unexpected failures of the
//!   capability transport. The operation that hit one is abandoned and the
//!   error is propagated to its caller without any partial-state recovery.

use alloc::string::String;

/// Failure codes reported by the microkernel's capability calls.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelError {
    #[error("target range is already mapped")]
    AlreadyExists,

    #[error("kernel is out of memory")]
    NoMemory,

    #[error("bad descriptor")]
    BadDescriptor,

    #[error("illegal arguments")]
    IllegalArguments,

    #[error("memory fault")]
    Fault,

    #[error("thread was terminated")]
    ThreadTerminated,

    #[error("kernel error {0}")]
    Other(i32),
}

/// Reasons the executable loader can reject an image.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadError {
    #[error("executable not found")]
    NotFound,

    #[error("permission denied")]
    AccessDenied,

    #[error("bad executable format")]
    BadFormat,
}

/// All errors produced by the subsystem core.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    // ── Recoverable errors ──────────────────────────────────────────

    #[error("address range is already mapped")]
    AlreadyMapped,

    #[error("out of memory")]
    OutOfMemory,

    #[error("no such file descriptor")]
    NoSuchFile,

    #[error("no child processes")]
    NoChildProcesses,

    #[error("no such child process: {pid}")]
    NoSuchChild { pid: i32 },

    #[error("interrupted")]
    Interrupted,

    #[error("insufficient permissions")]
    InsufficientPermissions,

    #[error("illegal arguments")]
    IllegalArguments,

    #[error("exec failed: {0}")]
    Load(#[from] LoadError),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Fatal errors ────────────────────────────────────────────────

    #[error("fatal kernel error: {0}")]
    Kernel(#[from] KernelError),
}

impl Error {
    /// Whether this error belongs to the hard-failure class.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Kernel(_))
    }
}

/// Result type for subsystem operations
pub type Result<T> = core::result::Result<T, Error>;
