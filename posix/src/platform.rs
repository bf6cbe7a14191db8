//! External collaborators.
//!
//! The core never talks to the microkernel, the executable loader, procfs or
//! the request dispatcher directly. It consumes them through the traits in
//! this module so that a server binary can plug in the real transport and
//! tests can plug in a simulation.

use alloc::boxed::Box;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;

use async_trait::async_trait;
use bitflags::bitflags;

use crate::error::{KernelError, Result};
use crate::fs::ViewPath;
use crate::generation::Generation;
use crate::process::{Pid, Process};
use crate::vm::VmContext;

/// Result of a raw capability call.
pub type KernelResult<T> = core::result::Result<T, KernelError>;

/// Opaque capability handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Handle(pub u64);

impl Handle {
    /// The null handle
    pub const NULL: Handle = Handle(0);

    /// Check if this is the null handle
    pub fn is_null(&self) -> bool {
        self.0 == 0
    }
}

/// A capability handle owned by this server; closed when dropped.
pub struct UniqueHandle {
    handle: Handle,
    kernel: Arc<dyn Microkernel>,
}

impl UniqueHandle {
    /// Take ownership of `handle`.
    pub fn new(kernel: Arc<dyn Microkernel>, handle: Handle) -> Self {
        Self { handle, kernel }
    }

    /// Get the raw handle
    pub fn handle(&self) -> Handle {
        self.handle
    }

    /// Duplicate the capability into a new owned handle.
    pub fn dup(&self) -> KernelResult<UniqueHandle> {
        let handle = self.kernel.duplicate(self.handle)?;
        Ok(UniqueHandle::new(self.kernel.clone(), handle))
    }

    /// Give up ownership without closing the handle.
    pub fn release(mut self) -> Handle {
        core::mem::replace(&mut self.handle, Handle::NULL)
    }
}

impl Drop for UniqueHandle {
    fn drop(&mut self) {
        if self.handle.is_null() {
            return;
        }
        if let Err(e) = self.kernel.close(self.handle) {
            log::warn!("[POSIX] Failed to close handle {:?}: {}", self.handle, e);
        }
    }
}

impl fmt::Debug for UniqueHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("UniqueHandle").field(&self.handle.0).finish()
    }
}

bitflags! {
    /// Mapping flags passed to the kernel and recorded per region.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct MapFlags: u32 {
        /// Pages are readable.
        const PROT_READ = 0x0001;
        /// Pages are writable.
        const PROT_WRITE = 0x0002;
        /// Pages are executable.
        const PROT_EXECUTE = 0x0004;
        /// Map exactly at the hint, replacing existing mappings.
        const FIXED = 0x0010;
        /// Map exactly at the hint, failing if anything is mapped there.
        const FIXED_NO_REPLACE = 0x0020;
        /// Do not fault in backing memory eagerly.
        const DONT_REQUIRE_BACKING = 0x0100;
        /// Write-combining caching mode.
        const CACHE_WRITE_COMBINE = 0x0200;
    }
}

impl MapFlags {
    /// All permission bits.
    pub const PROTECTION: MapFlags = MapFlags::PROT_READ
        .union(MapFlags::PROT_WRITE)
        .union(MapFlags::PROT_EXECUTE);

    /// Bits that only steer placement and are not recorded per region.
    pub const PLACEMENT: MapFlags = MapFlags::FIXED.union(MapFlags::FIXED_NO_REPLACE);
}

/// Register sets that can be loaded from and stored to a thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RegisterSet {
    /// Instruction and stack pointer, in that order.
    Program,
    /// General purpose registers.
    General,
    /// The register image used for signal frames (`mcontext` layout).
    Signal,
    /// SIMD / floating point state.
    Simd,
}

/// Direction of a descriptor transfer between universes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferDirection {
    /// From this server into the target universe.
    Out,
    /// From the target universe into this server.
    In,
}

/// CPU time statistics of a thread.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ThreadStats {
    /// Time spent in user mode (nanoseconds).
    pub user_time: u64,
}

/// Capability transport of the microkernel.
///
/// Every method corresponds to one kernel call. Only `protect_memory` and
/// the thread memory accessors are asynchronous round trips.
#[async_trait(?Send)]
pub trait Microkernel {
    /// Create an empty address space.
    fn create_space(&self) -> KernelResult<Handle>;

    /// Create an isolation domain for descriptors.
    fn create_universe(&self) -> KernelResult<Handle>;

    /// Allocate a memory object of `size` bytes.
    fn allocate_memory(&self, size: u64) -> KernelResult<Handle>;

    /// The universal zero-filled memory object.
    fn zero_memory(&self) -> Handle;

    /// Create a copy-on-write view of `source` starting at `offset`.
    fn copy_on_write(&self, source: Handle, offset: u64, size: u64) -> KernelResult<Handle>;

    /// Fork a copy-on-write view into an independent copy-on-write view.
    fn fork_memory(&self, copy_view: Handle) -> KernelResult<Handle>;

    /// Map `view` into `space`. Returns the address of the mapping.
    fn map_memory(
        &self,
        view: Handle,
        space: Handle,
        hint: Option<u64>,
        offset: u64,
        size: u64,
        flags: MapFlags,
    ) -> KernelResult<u64>;

    /// Unmap a page range.
    fn unmap_memory(&self, space: Handle, address: u64, size: u64) -> KernelResult<()>;

    /// Change the permissions of a page range.
    async fn protect_memory(
        &self,
        space: Handle,
        address: u64,
        size: u64,
        flags: MapFlags,
    ) -> KernelResult<()>;

    /// Duplicate a handle.
    fn duplicate(&self, handle: Handle) -> KernelResult<Handle>;

    /// Close a handle owned by this server.
    fn close(&self, handle: Handle) -> KernelResult<()>;

    /// Transfer a descriptor into (or out of) `universe`.
    fn transfer_descriptor(
        &self,
        handle: Handle,
        universe: Handle,
        direction: TransferDirection,
    ) -> KernelResult<Handle>;

    /// Close a descriptor that lives in `universe`.
    fn close_descriptor(&self, universe: Handle, handle: Handle) -> KernelResult<()>;

    /// Create a thread in `space`.
    fn create_thread(
        &self,
        universe: Handle,
        space: Handle,
        ip: u64,
        sp: u64,
        stopped: bool,
    ) -> KernelResult<Handle>;

    /// Kill a thread.
    fn kill_thread(&self, thread: Handle) -> KernelResult<()>;

    /// Resume a stopped thread.
    fn resume_thread(&self, thread: Handle) -> KernelResult<()>;

    /// Size in bytes of a register set image.
    fn register_set_size(&self, set: RegisterSet) -> usize;

    /// Load a register set image.
    fn load_registers(&self, thread: Handle, set: RegisterSet) -> KernelResult<Vec<u8>>;

    /// Store a register set image.
    fn store_registers(&self, thread: Handle, set: RegisterSet, image: &[u8]) -> KernelResult<()>;

    /// Read from the address space of `thread`.
    async fn read_memory(&self, thread: Handle, address: u64, length: usize)
        -> KernelResult<Vec<u8>>;

    /// Write into the address space of `thread`.
    async fn write_memory(&self, thread: Handle, address: u64, data: &[u8]) -> KernelResult<()>;

    /// Query CPU time statistics.
    fn thread_stats(&self, thread: Handle) -> KernelResult<ThreadStats>;
}

/// Input of the executable loader.
pub struct ExecRequest<'a> {
    pub root: &'a ViewPath,
    pub work_dir: &'a ViewPath,
    pub path: &'a str,
    pub args: Vec<String>,
    pub env: Vec<String>,
    /// Address space the image is built in.
    pub vm: &'a Arc<VmContext>,
    pub universe: Handle,
    pub mbus_lane: Handle,
    pub process: &'a Arc<Process>,
}

/// Output of the executable loader.
#[derive(Debug)]
pub struct ExecResult {
    /// Stopped main thread of the new image.
    pub thread: UniqueHandle,
    pub aux_begin: u64,
    pub aux_end: u64,
}

/// Executable loading pipeline.
#[async_trait(?Send)]
pub trait Loader {
    async fn execute(&self, request: ExecRequest<'_>) -> Result<ExecResult>;
}

/// An open file as far as the core is concerned.
#[async_trait(?Send)]
pub trait File {
    /// Lane that is handed to clients for passthrough requests.
    fn passthrough_lane(&self) -> Handle;

    /// Obtain a fresh memory view of the file contents.
    async fn access_memory(&self) -> Result<UniqueHandle>;
}

/// A `/proc/<pid>` directory.
pub trait ProcDirectory {
    fn unlink_self(&self);
}

/// Creates per-process procfs directories.
pub trait Procfs {
    fn create_proc_directory(&self, pid: Pid) -> Box<dyn ProcDirectory>;
}

/// Per-process request endpoint.
///
/// A fresh `serve` future is spawned for every generation. It must stop once
/// the generation's cancellation token fires, and it must account in-flight
/// requests with [`Generation::begin_request`].
#[async_trait(?Send)]
pub trait ServiceEndpoint {
    async fn serve(&self, process: Arc<Process>, generation: Arc<Generation>);
}
