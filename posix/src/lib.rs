//! POSIX Personality Core
//!
//! Process and resource management for a userspace POSIX server running on
//! top of a capability-based microkernel. The microkernel executes threads
//! and owns physical memory; this crate gives those threads POSIX
//! semantics.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────┐
//! │           request dispatcher / loader / procfs        │
//! ├───────────────────────────────────────────────────────┤
//! │  subsystem ── process (lifecycle, hull, job control)  │
//! │      │            │            │            │         │
//! │     vm          signal       files          fs        │
//! │      │            │            │                      │
//! │      └────────────┴─ generation / sync ───────────────│
//! └───────────────────────┬───────────────────────────────┘
//!                         │
//!              platform::Microkernel
//! ```
//!
//! # Modules
//!
//! - `vm`: per-process region map with copy-on-write and splitting
//! - `signal`: signal queues, handler table and delivery frames
//! - `generation`: execution epochs with drain barriers
//! - `process`: lifecycle, pid hulls and job control
//! - `files` / `fs`: descriptor table and filesystem view
//! - `platform`: traits for the external collaborators
//! - `sync`: cooperative wait primitives

#![cfg_attr(not(any(test, feature = "std")), no_std)]

extern crate alloc;

pub mod config;
pub mod error;
pub mod files;
pub mod fs;
pub mod generation;
pub mod platform;
pub mod process;
pub mod signal;
pub mod subsystem;
pub mod sync;
pub mod vm;

// Re-exports for convenience
pub use config::{ServerConfig, PAGE_SIZE};
pub use error::{Error, KernelError, LoadError, Result};
pub use generation::Generation;
pub use platform::{Handle, MapFlags, Microkernel, UniqueHandle};
pub use process::{
    ControllingTerminalState, Pid, PidHull, Process, ProcessGroup, TerminalSession,
    TerminationState, WaitFlags, WaitResult,
};
pub use signal::{SignalContext, SignalInfo, SignalItem};
pub use subsystem::{Platform, Subsystem};
pub use sync::{Bell, CancellationToken, WorkBarrier, WorkGuard};
pub use vm::VmContext;
