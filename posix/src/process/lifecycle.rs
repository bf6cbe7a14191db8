//! Process lifecycle: init, fork, clone, exec, terminate and wait.
//!
//! Exec and terminate are the two operations that end a [`Generation`].
//! Both kill the running thread first, then retire the generation and only
//! touch the process's contexts once every signal delivery and request that
//! was started against the old image has finished.

use alloc::string::String;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;

use super::jobctl::TerminalSession;
use super::{
    base_name, AltStack, NotifyType, Pid, PidHull, Process, TerminationState, WaitFlags,
    WaitResult,
};
use crate::config::INIT_PID;
use crate::error::{Error, Result};
use crate::files::FileContext;
use crate::fs::{FsContext, ViewPath};
use crate::generation::Generation;
use crate::platform::{ExecRequest, UniqueHandle};
use crate::signal::{SignalContext, SignalDisposition, SignalFlags, SignalInfo, SIGCHLD};
use crate::subsystem::Subsystem;
use crate::sync::CancellationToken;
use crate::vm::VmContext;

impl Process {
    /// Create and start the init process (pid 1) from the executable at
    /// `path`.
    ///
    /// Init leads its own session and process group. If the loader fails,
    /// nothing is started and the error is returned.
    pub async fn init(subsystem: &Arc<Subsystem>, path: &str) -> Result<Arc<Process>> {
        let config = subsystem.config();
        let kernel = subsystem.kernel().clone();

        let hull = PidHull::new(subsystem.registry(), INIT_PID);
        let process = Arc::new(Process::new(subsystem, hull, Weak::new()));

        let vm = VmContext::create(kernel.clone(), config.log_cleanup)?;
        let fs = FsContext::create(ViewPath::new(config.root_path.clone()), config.default_umask);
        let files = FileContext::create(kernel.clone(), subsystem.mbus_lane(), config)?;
        let signals = SignalContext::create();
        {
            let mut inner = process.inner.lock();
            inner.vm = Some(vm.clone());
            inner.fs = Some(fs.clone());
            inner.files = Some(files.clone());
            inner.signals = Some(signals);
            inner.name = base_name(path);
            inner.path = String::from(path);
        }
        process.hull.initialize_process(&process);
        TerminalSession::initialize_new_session(&process)?;

        let root = fs.root();
        let work_dir = fs.working_directory();
        let loaded = subsystem
            .loader()
            .execute(ExecRequest {
                root: &root,
                work_dir: &work_dir,
                path,
                args: alloc::vec![String::from(path)],
                env: Vec::new(),
                vm: &vm,
                universe: files.universe(),
                mbus_lane: files.client_mbus_lane(),
                process: &process,
            })
            .await;
        let loaded = match loaded {
            Ok(loaded) => loaded,
            Err(e) => {
                log::error!("[POSIX PROC] Failed to load init from {}: {}", path, e);
                process.leave_process_group();
                return Err(e);
            }
        };

        let thread = loaded.thread.handle();
        let generation = Generation::new(config.log_cleanup);
        let procfs_dir = subsystem.procfs().create_proc_directory(process.pid());
        {
            let mut inner = process.inner.lock();
            inner.thread = Some(loaded.thread);
            inner.aux_begin = loaded.aux_begin;
            inner.aux_end = loaded.aux_end;
            inner.did_execute = true;
            inner.generation = Some(generation.clone());
            inner.procfs_dir = Some(procfs_dir);
        }

        kernel.resume_thread(thread)?;
        subsystem.spawn_serve(process.clone(), generation);

        log::info!("[POSIX PROC] Started init process from {}", path);
        Ok(process)
    }

    /// Duplicate `original` into a new child process.
    ///
    /// The address space is cloned copy-on-write; the filesystem view,
    /// descriptor table and handler table are copied. The child's thread is
    /// created stopped: the caller transfers the register state and then
    /// calls [`Process::resume`].
    pub fn fork(original: &Arc<Process>) -> Result<Arc<Process>> {
        let contexts = original.contexts()?;
        let vm = VmContext::clone(&contexts.vm)?;
        let fs = FsContext::clone(&contexts.fs);
        let files = FileContext::clone(&contexts.files)?;
        let signals = SignalContext::clone(&contexts.signals);

        let kernel = original.kernel().clone();
        let thread = UniqueHandle::new(
            kernel.clone(),
            kernel.create_thread(files.universe(), vm.space(), 0, 0, true)?,
        );

        let process = Self::spawn_child(original, vm, fs, files, signals, thread)?;
        log::debug!(
            "[POSIX PROC] Process {} forked into {}",
            original.pid(),
            process.pid()
        );
        Ok(process)
    }

    /// Create a thread-style child of `original` that shares all of its
    /// contexts. The new thread starts stopped at `ip` with stack `sp`.
    pub fn clone(original: &Arc<Process>, ip: u64, sp: u64) -> Result<Arc<Process>> {
        let contexts = original.contexts()?;

        let kernel = original.kernel().clone();
        let thread = UniqueHandle::new(
            kernel.clone(),
            kernel.create_thread(contexts.files.universe(), contexts.vm.space(), ip, sp, true)?,
        );

        let process = Self::spawn_child(
            original,
            contexts.vm,
            contexts.fs,
            contexts.files,
            contexts.signals,
            thread,
        )?;
        log::debug!(
            "[POSIX PROC] Process {} cloned into {}",
            original.pid(),
            process.pid()
        );
        Ok(process)
    }

    /// Shared tail of fork and clone.
    fn spawn_child(
        original: &Arc<Process>,
        vm: Arc<VmContext>,
        fs: Arc<FsContext>,
        files: Arc<FileContext>,
        signals: Arc<SignalContext>,
        thread: UniqueHandle,
    ) -> Result<Arc<Process>> {
        let subsystem = original.subsystem.clone();
        let hull = PidHull::new(subsystem.registry(), subsystem.allocate_pid());
        let process = Arc::new(Process::new(&subsystem, hull, Arc::downgrade(original)));

        let generation = Generation::new(subsystem.config().log_cleanup);
        {
            let source = original.inner.lock();
            let mut inner = process.inner.lock();
            inner.vm = Some(vm);
            inner.fs = Some(fs);
            inner.files = Some(files);
            inner.signals = Some(signals);
            inner.thread = Some(thread);
            inner.generation = Some(generation.clone());
            inner.name = source.name.clone();
            inner.path = source.path.clone();
            inner.signal_mask = source.signal_mask;
            inner.alt_stack = source.alt_stack;
            inner.credentials = source.credentials;
            inner.aux_begin = source.aux_begin;
            inner.aux_end = source.aux_end;
            inner.did_execute = false;
        }

        process.hull.initialize_process(&process);
        if let Some(group) = original.process_group() {
            group.reassociate_process(&process);
        }
        original.inner.lock().children.push(process.clone());

        let procfs_dir = subsystem.procfs().create_proc_directory(process.pid());
        process.inner.lock().procfs_dir = Some(procfs_dir);

        subsystem.spawn_serve(process.clone(), generation);
        Ok(process)
    }

    /// Resume the (stopped) main thread.
    pub fn resume(&self) -> Result<()> {
        let thread = self.thread_handle().ok_or(Error::IllegalArguments)?;
        self.kernel().resume_thread(thread)?;
        Ok(())
    }

    /// Replace the program image of `process` with the executable at `path`.
    ///
    /// The new image is built in a fresh address space, so a loader failure
    /// is returned with the old image still running. Past that point the old
    /// thread is killed and the old generation is retired; the new image
    /// starts under a new generation once everything in flight against the
    /// old one has drained.
    ///
    /// A request that execs its own process must drop its request guard
    /// before calling this.
    pub async fn exec(
        process: &Arc<Process>,
        path: &str,
        args: Vec<String>,
        env: Vec<String>,
    ) -> Result<()> {
        let contexts = process.contexts()?;
        let subsystem = process.subsystem.clone();
        let config = subsystem.config();
        let kernel = subsystem.kernel().clone();

        let exec_vm = VmContext::create(kernel.clone(), config.log_cleanup)?;
        let root = contexts.fs.root();
        let work_dir = contexts.fs.working_directory();
        let loaded = subsystem
            .loader()
            .execute(ExecRequest {
                root: &root,
                work_dir: &work_dir,
                path,
                args,
                env,
                vm: &exec_vm,
                universe: contexts.files.universe(),
                mbus_lane: contexts.files.client_mbus_lane(),
                process,
            })
            .await?;

        // Kill the old thread. The exec cannot be rolled back from here on.
        if let Some(thread) = process.thread_handle() {
            kernel.kill_thread(thread)?;
        }
        if let Some(previous) = process.generation() {
            previous.retire().await;
        }

        contexts.files.close_on_exec()?;
        contexts.signals.reset_handlers();

        let thread = loaded.thread.handle();
        let generation = Generation::new(config.log_cleanup);
        let released = {
            let mut inner = process.inner.lock();
            inner.name = base_name(path);
            inner.path = String::from(path);
            inner.aux_begin = loaded.aux_begin;
            inner.aux_end = loaded.aux_end;
            inner.alt_stack = AltStack::default();
            inner.did_execute = true;
            (
                inner.thread.replace(loaded.thread),
                inner.vm.replace(exec_vm),
                inner.generation.replace(generation.clone()),
            )
        };
        drop(released);

        kernel.resume_thread(thread)?;
        subsystem.spawn_serve(process.clone(), generation);

        log::info!("[POSIX PROC] Process {} executed {}", process.pid(), path);
        Ok(())
    }

    /// Terminate this process.
    ///
    /// Retires the current generation, releases all contexts, hands the
    /// children to the topmost ancestor and notifies the parent. Terminating
    /// twice is a no-op; the process without a parent (init) cannot be
    /// terminated.
    ///
    /// A signal delivery or request that terminates its own process must
    /// drop its guard before calling this.
    pub async fn terminate(self: &Arc<Self>, state: TerminationState) -> Result<()> {
        let parent = {
            let mut inner = self.inner.lock();
            let Some(parent) = inner.parent.upgrade() else {
                return Err(Error::IllegalArguments);
            };
            if inner.terminating {
                return Ok(());
            }
            inner.terminating = true;
            parent
        };

        let kernel = self.kernel().clone();
        let thread = self.thread_handle();
        if let Some(thread) = thread {
            kernel.kill_thread(thread)?;
        }
        if let Some(generation) = self.generation() {
            generation.retire().await;
        }

        if let Some(thread) = thread {
            let stats = kernel.thread_stats(thread)?;
            self.inner.lock().generation_usage.user_time += stats.user_time;
        }

        let released = {
            let mut inner = self.inner.lock();
            (
                inner.thread.take(),
                inner.vm.take(),
                inner.fs.take(),
                inner.files.take(),
                inner.signals.take(),
                inner.generation.take(),
            )
        };
        drop(released);

        self.reparent_children(&parent);

        {
            let mut inner = self.inner.lock();
            debug_assert_eq!(inner.notify_type, NotifyType::None);
            inner.notify_type = NotifyType::Terminated;
            inner.state = state;
        }
        self.notify_type_change.raise();

        let parent_signals = parent.signal_context();
        let wants_status = parent_signals.as_ref().map_or(true, |signals| {
            let handler = signals.handler(SIGCHLD);
            handler.disposition != SignalDisposition::Ignore
                && !handler.flags.contains(SignalFlags::NO_CHILD_WAIT)
        });
        if wants_status {
            parent.inner.lock().notify_queue.push_back(self.clone());
        } else {
            self.retire();
        }
        parent.notify_bell.raise();

        if let Some(signals) = parent_signals {
            signals.issue_signal(SIGCHLD, SignalInfo::user(self.pid()));
        }

        log::info!("[POSIX PROC] Process {} terminated: {:?}", self.pid(), state);
        Ok(())
    }

    /// Move all children, and any zombies not yet reaped, to the topmost
    /// ancestor of `parent`.
    fn reparent_children(&self, parent: &Arc<Process>) {
        let mut reaper = parent.clone();
        while let Some(next) = reaper.parent() {
            reaper = next;
        }

        let (children, zombies) = {
            let mut inner = self.inner.lock();
            (
                core::mem::take(&mut inner.children),
                core::mem::take(&mut inner.notify_queue),
            )
        };
        if children.is_empty() {
            return;
        }

        for child in &children {
            child.inner.lock().parent = Arc::downgrade(&reaper);
            let Some(sn) = child.parent_death_signal() else {
                continue;
            };
            if let Some(signals) = child.signal_context() {
                signals.issue_signal(sn, SignalInfo::user(self.pid()));
            }
        }

        log::debug!(
            "[POSIX PROC] Reparenting {} children of process {} to {}",
            children.len(),
            self.pid(),
            reaper.pid()
        );
        let has_zombies = !zombies.is_empty();
        {
            let mut inner = reaper.inner.lock();
            inner.children.extend(children);
            inner.notify_queue.extend(zombies);
        }
        if has_zombies {
            reaper.notify_bell.raise();
        }
    }

    /// Detach a terminated process from its parent and its process group.
    fn retire(&self) {
        let (procfs_dir, usage) = {
            let mut inner = self.inner.lock();
            let usage = inner.generation_usage.user_time + inner.children_usage.user_time;
            (inner.procfs_dir.take(), usage)
        };
        if let Some(dir) = procfs_dir {
            dir.unlink_self();
        }

        if let Some(parent) = self.parent() {
            let removed = {
                let mut inner = parent.inner.lock();
                inner.children_usage.user_time += usage;
                inner
                    .children
                    .iter()
                    .position(|child| core::ptr::eq(Arc::as_ptr(child), self))
                    .map(|index| inner.children.remove(index))
            };
            drop(removed);
        }

        self.leave_process_group();
    }

    /// Wait for a child to terminate.
    ///
    /// `pid == -1` matches any child, a positive `pid` one specific child.
    /// `flags` must contain [`WaitFlags::EXITED`]. Returns `Ok(None)` if
    /// [`WaitFlags::NON_BLOCKING`] is set and no child has terminated yet.
    pub async fn wait(
        &self,
        pid: Pid,
        flags: WaitFlags,
        token: &CancellationToken,
    ) -> Result<Option<WaitResult>> {
        if pid != -1 && pid <= 0 {
            return Err(Error::IllegalArguments);
        }
        if !flags.contains(WaitFlags::EXITED) {
            return Err(Error::IllegalArguments);
        }

        {
            let inner = self.inner.lock();
            if inner.children.is_empty() {
                return Err(Error::NoChildProcesses);
            }
            if pid > 0 && !inner.children.iter().any(|child| child.pid() == pid) {
                return Err(Error::NoSuchChild { pid });
            }
        }

        loop {
            let bell_seq = self.notify_bell.sequence();

            let found = {
                let mut inner = self.inner.lock();
                let index = inner
                    .notify_queue
                    .iter()
                    .position(|zombie| pid == -1 || zombie.pid() == pid);
                index.and_then(|index| {
                    if flags.contains(WaitFlags::LEAVE_ZOMBIE) {
                        inner.notify_queue.get(index).cloned().map(|zombie| (zombie, false))
                    } else {
                        inner.notify_queue.remove(index).map(|zombie| (zombie, true))
                    }
                })
            };

            if let Some((zombie, reap)) = found {
                let result = {
                    let inner = zombie.inner.lock();
                    WaitResult {
                        pid: zombie.pid(),
                        uid: inner.credentials.uid,
                        state: inner.state,
                        stats: inner.generation_usage,
                    }
                };
                if reap {
                    zombie.retire();
                }
                return Ok(Some(result));
            }

            if flags.contains(WaitFlags::NON_BLOCKING) {
                return Ok(None);
            }
            if !self.notify_bell.wait_since(bell_seq, token).await {
                return Err(Error::Interrupted);
            }
            if self.inner.lock().children.is_empty() {
                return Err(Error::NoChildProcesses);
            }
        }
    }

    /// Deliver the lowest-numbered pending, unblocked signal.
    ///
    /// Runs under `generation`'s signal barrier so that exec and terminate
    /// wait for it. Returns whether a signal was taken. Nothing happens once
    /// `generation` is terminating.
    pub async fn deliver_signal(self: &Arc<Self>, generation: &Arc<Generation>) -> Result<bool> {
        let Some(guard) = generation.begin_signal_delivery() else {
            return Ok(false);
        };
        let Some(signals) = self.signal_context() else {
            return Ok(false);
        };

        let token = generation.cancellation();
        let Some(item) = signals.fetch_signal(!self.signal_mask(), true, &token).await else {
            return Ok(false);
        };

        if self.subsystem.config().log_signals {
            log::debug!(
                "[POSIX SIG] Delivering signal {} to process {}",
                item.signal_number,
                self.pid()
            );
        }

        signals
            .determine_and_raise_context(item, self, Some(guard))
            .await?;
        Ok(true)
    }

    /// Return from a signal handler of the current thread.
    pub async fn restore_signal_context(&self) -> Result<()> {
        let thread = self.thread_handle().ok_or(Error::IllegalArguments)?;
        let signals = self.signal_context().ok_or(Error::IllegalArguments)?;
        signals.restore_context(thread, self).await
    }

    /// Move this process into process group `pgid` (setpgid).
    ///
    /// `pgid == 0` or the own pid makes the process lead a new group in its
    /// session. Otherwise the group must exist and belong to the caller's
    /// session.
    pub fn join_process_group(self: &Arc<Self>, pgid: Pid) -> Result<()> {
        if pgid < 0 {
            return Err(Error::IllegalArguments);
        }
        let session = self.session().ok_or(Error::IllegalArguments)?;

        if pgid == 0 || pgid == self.pid() {
            if self.pgid() == Some(self.pid()) {
                return Ok(());
            }
            if let Some(group) = session.process_group_by_id(self.pid()) {
                group.reassociate_process(self);
                return Ok(());
            }
            if session.session_id() == self.pid() {
                return Err(Error::InsufficientPermissions);
            }
            session.spawn_process_group(self)?;
            return Ok(());
        }

        match session.process_group_by_id(pgid) {
            Some(group) => {
                group.reassociate_process(self);
                Ok(())
            }
            None if self.subsystem.registry().find_process_group(pgid).is_some() => {
                Err(Error::InsufficientPermissions)
            }
            None => Err(Error::IllegalArguments),
        }
    }
}
