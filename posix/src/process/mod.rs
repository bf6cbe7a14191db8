//! Process Management
//!
//! A [`Process`] aggregates the contexts that make up a POSIX process
//! (address space, filesystem view, descriptor table, signal state), its
//! current [`Generation`], its place in the process tree and its job
//! control membership.
//!
//! - `lifecycle`: init, fork, clone, exec, terminate and wait
//! - `hull`: permanent pid identities and the pid registry
//! - `jobctl`: process groups, sessions and controlling terminals

mod hull;
mod jobctl;
mod lifecycle;

pub use hull::{PidHull, PidRegistry};
pub use jobctl::{ControllingTerminalState, ProcessGroup, TerminalSession};

use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::string::String;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::fmt;

use bitflags::bitflags;
use spin::Mutex;

use crate::error::{Error, Result};
use crate::files::FileContext;
use crate::fs::FsContext;
use crate::generation::Generation;
use crate::platform::{Handle, Microkernel, ProcDirectory, UniqueHandle};
use crate::signal::{SignalContext, UNBLOCKABLE};
use crate::subsystem::Subsystem;
use crate::sync::{Bell, CancellationToken};
use crate::vm::VmContext;

/// Process ID type
pub type Pid = i32;

/// How a process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TerminationState {
    /// Still running
    #[default]
    Running,
    /// Exited with the given status code
    ByExit(i32),
    /// Killed by the given signal
    BySignal(u8),
}

/// State change a parent can be notified about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NotifyType {
    #[default]
    None,
    Terminated,
}

/// Accumulated CPU time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ResourceUsage {
    /// User-mode time in nanoseconds
    pub user_time: u64,
}

/// Real and effective user and group ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Credentials {
    pub uid: u32,
    pub euid: u32,
    pub gid: u32,
    pub egid: u32,
}

/// Alternate signal stack (sigaltstack).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AltStack {
    pub sp: u64,
    pub size: u64,
    pub enabled: bool,
}

bitflags! {
    /// Options of `wait`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct WaitFlags: u32 {
        /// WNOHANG
        const NON_BLOCKING = 1 << 0;
        /// WEXITED
        const EXITED = 1 << 1;
        /// WNOWAIT
        const LEAVE_ZOMBIE = 1 << 2;
    }
}

/// A reaped (or peeked) child.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitResult {
    pub pid: Pid,
    pub uid: u32,
    pub state: TerminationState,
    pub stats: ResourceUsage,
}

/// Contexts held by a live process.
#[derive(Clone)]
pub(crate) struct Contexts {
    pub vm: Arc<VmContext>,
    pub fs: Arc<FsContext>,
    pub files: Arc<FileContext>,
    pub signals: Arc<SignalContext>,
}

struct ProcessInner {
    parent: Weak<Process>,
    children: Vec<Arc<Process>>,
    /// Terminated children waiting to be reaped.
    notify_queue: VecDeque<Arc<Process>>,

    vm: Option<Arc<VmContext>>,
    fs: Option<Arc<FsContext>>,
    files: Option<Arc<FileContext>>,
    signals: Option<Arc<SignalContext>>,
    generation: Option<Arc<Generation>>,
    thread: Option<UniqueHandle>,

    state: TerminationState,
    terminating: bool,
    notify_type: NotifyType,
    generation_usage: ResourceUsage,
    children_usage: ResourceUsage,

    signal_mask: u64,
    alt_stack: AltStack,
    parent_death_signal: Option<u8>,
    credentials: Credentials,

    name: String,
    path: String,
    aux_begin: u64,
    aux_end: u64,
    did_execute: bool,

    pgid: Option<Pid>,
    procfs_dir: Option<Box<dyn ProcDirectory>>,
}

/// A POSIX process.
pub struct Process {
    hull: Arc<PidHull>,
    subsystem: Arc<Subsystem>,
    inner: Mutex<ProcessInner>,
    notify_bell: Bell,
    notify_type_change: Bell,
}

impl Process {
    fn new(subsystem: &Arc<Subsystem>, hull: Arc<PidHull>, parent: Weak<Process>) -> Self {
        Self {
            hull,
            subsystem: subsystem.clone(),
            inner: Mutex::new(ProcessInner {
                parent,
                children: Vec::new(),
                notify_queue: VecDeque::new(),
                vm: None,
                fs: None,
                files: None,
                signals: None,
                generation: None,
                thread: None,
                state: TerminationState::Running,
                terminating: false,
                notify_type: NotifyType::None,
                generation_usage: ResourceUsage::default(),
                children_usage: ResourceUsage::default(),
                signal_mask: 0,
                alt_stack: AltStack::default(),
                parent_death_signal: None,
                credentials: Credentials::default(),
                name: String::new(),
                path: String::new(),
                aux_begin: 0,
                aux_end: 0,
                did_execute: false,
                pgid: None,
                procfs_dir: None,
            }),
            notify_bell: Bell::new(),
            notify_type_change: Bell::new(),
        }
    }

    // ─── Identity ───────────────────────────────────────────────────

    pub fn pid(&self) -> Pid {
        self.hull.pid()
    }

    pub fn hull(&self) -> &Arc<PidHull> {
        &self.hull
    }

    pub fn subsystem(&self) -> &Arc<Subsystem> {
        &self.subsystem
    }

    pub(crate) fn kernel(&self) -> &Arc<dyn Microkernel> {
        self.subsystem.kernel()
    }

    pub fn name(&self) -> String {
        self.inner.lock().name.clone()
    }

    pub fn path(&self) -> String {
        self.inner.lock().path.clone()
    }

    pub fn credentials(&self) -> Credentials {
        self.inner.lock().credentials
    }

    pub fn set_credentials(&self, credentials: Credentials) {
        self.inner.lock().credentials = credentials;
    }

    pub fn uid(&self) -> u32 {
        self.inner.lock().credentials.uid
    }

    // ─── Process tree ───────────────────────────────────────────────

    pub fn parent(&self) -> Option<Arc<Process>> {
        self.inner.lock().parent.upgrade()
    }

    /// Children in creation order, including unreaped zombies.
    pub fn children(&self) -> Vec<Arc<Process>> {
        self.inner.lock().children.clone()
    }

    pub fn has_child(&self, pid: Pid) -> bool {
        self.inner
            .lock()
            .children
            .iter()
            .any(|child| child.pid() == pid)
    }

    /// Look up any live process by pid.
    pub fn find_process(&self, pid: Pid) -> Option<Arc<Process>> {
        self.subsystem.registry().find_process(pid)
    }

    // ─── Contexts ───────────────────────────────────────────────────

    pub fn vm_context(&self) -> Option<Arc<VmContext>> {
        self.inner.lock().vm.clone()
    }

    pub fn fs_context(&self) -> Option<Arc<FsContext>> {
        self.inner.lock().fs.clone()
    }

    pub fn file_context(&self) -> Option<Arc<FileContext>> {
        self.inner.lock().files.clone()
    }

    pub fn signal_context(&self) -> Option<Arc<SignalContext>> {
        self.inner.lock().signals.clone()
    }

    /// The generation of the running image.
    pub fn generation(&self) -> Option<Arc<Generation>> {
        self.inner.lock().generation.clone()
    }

    pub fn thread_handle(&self) -> Option<Handle> {
        self.inner.lock().thread.as_ref().map(UniqueHandle::handle)
    }

    /// All four contexts, or `IllegalArguments` once the process terminated.
    pub(crate) fn contexts(&self) -> Result<Contexts> {
        let inner = self.inner.lock();
        match (&inner.vm, &inner.fs, &inner.files, &inner.signals) {
            (Some(vm), Some(fs), Some(files), Some(signals)) => Ok(Contexts {
                vm: vm.clone(),
                fs: fs.clone(),
                files: files.clone(),
                signals: signals.clone(),
            }),
            _ => Err(Error::IllegalArguments),
        }
    }

    // ─── Termination status ─────────────────────────────────────────

    pub fn termination_state(&self) -> TerminationState {
        self.inner.lock().state
    }

    pub fn notify_type(&self) -> NotifyType {
        self.inner.lock().notify_type
    }

    /// Wait for the next change of [`Process::notify_type`]. Returns `false`
    /// on cancellation.
    pub async fn await_notify_type_change(&self, token: &CancellationToken) -> bool {
        self.notify_type_change.wait(token).await
    }

    /// CPU time of this process's images.
    pub fn generation_usage(&self) -> ResourceUsage {
        self.inner.lock().generation_usage
    }

    /// CPU time of reaped children.
    pub fn children_usage(&self) -> ResourceUsage {
        self.inner.lock().children_usage
    }

    // ─── Signal state ───────────────────────────────────────────────

    pub fn signal_mask(&self) -> u64 {
        self.inner.lock().signal_mask
    }

    /// Install a new signal mask. SIGKILL and SIGSTOP cannot be blocked.
    pub fn set_signal_mask(&self, mask: u64) {
        self.inner.lock().signal_mask = mask & !UNBLOCKABLE;
    }

    pub fn alt_stack(&self) -> AltStack {
        self.inner.lock().alt_stack
    }

    pub fn set_alt_stack(&self, sp: u64, size: u64, enabled: bool) {
        self.inner.lock().alt_stack = AltStack { sp, size, enabled };
    }

    pub fn is_on_alt_stack(&self, sp: u64) -> bool {
        let alt = self.inner.lock().alt_stack;
        sp.checked_sub(alt.sp).is_some_and(|offset| offset < alt.size)
    }

    pub fn parent_death_signal(&self) -> Option<u8> {
        self.inner.lock().parent_death_signal
    }

    /// Signal raised in this process when its parent terminates
    /// (PR_SET_PDEATHSIG).
    pub fn set_parent_death_signal(&self, sn: Option<u8>) {
        self.inner.lock().parent_death_signal = sn;
    }

    // ─── Image ──────────────────────────────────────────────────────

    /// Auxiliary vector bounds reported by the loader.
    pub fn aux_bounds(&self) -> (u64, u64) {
        let inner = self.inner.lock();
        (inner.aux_begin, inner.aux_end)
    }

    /// Whether the current image was loaded by init or exec (as opposed to
    /// being inherited through fork).
    pub fn did_execute(&self) -> bool {
        self.inner.lock().did_execute
    }

    // ─── Job control ────────────────────────────────────────────────

    pub fn pgid(&self) -> Option<Pid> {
        self.inner.lock().pgid
    }

    pub(crate) fn set_group_id(&self, pgid: Option<Pid>) -> Option<Pid> {
        core::mem::replace(&mut self.inner.lock().pgid, pgid)
    }

    pub fn process_group(&self) -> Option<Arc<ProcessGroup>> {
        let pgid = self.pgid()?;
        self.subsystem.registry().find_process_group(pgid)
    }

    pub fn session(&self) -> Option<Arc<TerminalSession>> {
        self.process_group()?.session()
    }

    /// Leave the current process group, if any.
    pub fn leave_process_group(&self) {
        if let Some(group) = self.process_group() {
            group.drop_process(self);
        }
    }
}

/// Last component of `path`.
fn base_name(path: &str) -> String {
    String::from(path.rsplit('/').next().unwrap_or(path))
}

impl fmt::Debug for Process {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Process")
            .field("pid", &self.pid())
            .field("name", &inner.name)
            .field("state", &inner.state)
            .field("children", &inner.children.len())
            .finish()
    }
}

impl Drop for Process {
    fn drop(&mut self) {
        if self.subsystem.config().log_cleanup {
            log::debug!("[POSIX PROC] Process {} is destructed", self.pid());
        }
    }
}
