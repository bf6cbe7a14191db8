//! Pid Hulls
//!
//! A [`PidHull`] is the permanent identity behind a pid. The process, the
//! process group and the terminal session that use a pid all refer to the
//! same hull; the hull only points back at them weakly. Exec keeps the hull,
//! fork and clone create a new one.
//!
//! The [`PidRegistry`] maps pids to live hulls and owns the terminal
//! sessions, which in turn own their process groups. Hulls refer to the
//! registry weakly, so the sessions it owns never keep it alive.

use alloc::collections::BTreeMap;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::fmt;

use hashbrown::HashMap;
use spin::Mutex;

use super::jobctl::{ProcessGroup, TerminalSession};
use super::{Pid, Process};

/// Pid-indexed lookup of hulls plus the session arena.
#[derive(Default)]
pub struct PidRegistry {
    hulls: Mutex<HashMap<Pid, Weak<PidHull>>>,
    sessions: Mutex<BTreeMap<Pid, Arc<TerminalSession>>>,
}

impl PidRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn register(&self, hull: &Arc<PidHull>) {
        let mut hulls = self.hulls.lock();
        let previous = hulls.insert(hull.pid, Arc::downgrade(hull));
        assert!(
            previous.map_or(true, |weak| weak.strong_count() == 0),
            "pid {} registered twice",
            hull.pid
        );
    }

    fn unregister(&self, pid: Pid) {
        let mut hulls = self.hulls.lock();
        if hulls.get(&pid).is_some_and(|weak| weak.strong_count() == 0) {
            hulls.remove(&pid);
        }
    }

    /// The live hull for `pid`.
    pub fn lookup(&self, pid: Pid) -> Option<Arc<PidHull>> {
        let hulls = self.hulls.lock();
        hulls.get(&pid).and_then(Weak::upgrade)
    }

    pub fn contains(&self, pid: Pid) -> bool {
        self.lookup(pid).is_some()
    }

    pub fn find_process(&self, pid: Pid) -> Option<Arc<Process>> {
        self.lookup(pid)?.process()
    }

    pub fn find_process_group(&self, pid: Pid) -> Option<Arc<ProcessGroup>> {
        self.lookup(pid)?.process_group()
    }

    pub fn find_session(&self, pid: Pid) -> Option<Arc<TerminalSession>> {
        self.sessions.lock().get(&pid).cloned()
    }

    /// Pids with a live hull, in ascending order.
    pub fn pids(&self) -> Vec<Pid> {
        let mut pids: Vec<Pid> = self
            .hulls
            .lock()
            .iter()
            .filter(|(_, weak)| weak.strong_count() > 0)
            .map(|(&pid, _)| pid)
            .collect();
        pids.sort_unstable();
        pids
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().len()
    }

    pub(crate) fn insert_session(&self, session: Arc<TerminalSession>) {
        let previous = self.sessions.lock().insert(session.session_id(), session);
        assert!(previous.is_none(), "session registered twice");
    }

    /// Remove a session from the arena and unbind its controlling terminal.
    pub(crate) fn destroy_session(&self, sid: Pid) {
        let session = self.sessions.lock().remove(&sid);
        if let Some(session) = session {
            if let Some(terminal) = session.controlling_terminal() {
                terminal.drop_session(&session);
            }
            log::debug!("[POSIX JOB] Session {} destroyed", sid);
        }
    }
}

impl fmt::Debug for PidRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PidRegistry")
            .field("pids", &self.pids())
            .field("sessions", &self.session_count())
            .finish()
    }
}

/// Permanent identity record of one pid.
pub struct PidHull {
    pid: Pid,
    registry: Weak<PidRegistry>,
    process: Mutex<Weak<Process>>,
    group: Mutex<Weak<ProcessGroup>>,
    session: Mutex<Weak<TerminalSession>>,
}

impl PidHull {
    /// Claim `pid`.
    ///
    /// # Panics
    ///
    /// Panics if another live hull already owns `pid`.
    pub fn new(registry: &Arc<PidRegistry>, pid: Pid) -> Arc<Self> {
        let hull = Arc::new(Self {
            pid,
            registry: Arc::downgrade(registry),
            process: Mutex::new(Weak::new()),
            group: Mutex::new(Weak::new()),
            session: Mutex::new(Weak::new()),
        });
        registry.register(&hull);
        hull
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// The registry this pid was claimed in, while it is still alive.
    pub fn registry(&self) -> Option<Arc<PidRegistry>> {
        self.registry.upgrade()
    }

    pub fn process(&self) -> Option<Arc<Process>> {
        self.process.lock().upgrade()
    }

    pub fn process_group(&self) -> Option<Arc<ProcessGroup>> {
        self.group.lock().upgrade()
    }

    pub fn terminal_session(&self) -> Option<Arc<TerminalSession>> {
        self.session.lock().upgrade()
    }

    pub(crate) fn initialize_process(&self, process: &Arc<Process>) {
        *self.process.lock() = Arc::downgrade(process);
    }

    pub(crate) fn initialize_process_group(&self, group: &Arc<ProcessGroup>) {
        *self.group.lock() = Arc::downgrade(group);
    }

    pub(crate) fn initialize_terminal_session(&self, session: &Arc<TerminalSession>) {
        *self.session.lock() = Arc::downgrade(session);
    }
}

impl fmt::Debug for PidHull {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PidHull").field("pid", &self.pid).finish()
    }
}

impl Drop for PidHull {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.unregister(self.pid);
        }
    }
}
