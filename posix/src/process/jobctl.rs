//! Job Control
//!
//! Sessions, process groups and controlling terminals.
//!
//! Ownership flows downward: the pid registry owns sessions, a session owns
//! its groups, and a group lists its members without owning them. Every
//! upward link (process to group, group to session, session to terminal)
//! is a pid lookup or a weak reference. A group disappears with its last
//! member and a session with its last group; a dying session unbinds its
//! controlling terminal first.

use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::fmt;

use spin::Mutex;

use super::hull::PidHull;
use super::{Pid, Process};
use crate::error::{Error, Result};
use crate::signal::SignalInfo;

// ═══════════════════════════════════════════════════════════════════════
// Process groups
// ═══════════════════════════════════════════════════════════════════════

pub struct ProcessGroup {
    hull: Arc<PidHull>,
    session_id: Pid,
    members: Mutex<Vec<Weak<Process>>>,
}

impl ProcessGroup {
    /// Process group id (the leader's pid).
    pub fn pgid(&self) -> Pid {
        self.hull.pid()
    }

    pub fn hull(&self) -> &Arc<PidHull> {
        &self.hull
    }

    pub fn session_id(&self) -> Pid {
        self.session_id
    }

    pub fn session(&self) -> Option<Arc<TerminalSession>> {
        self.hull.registry()?.find_session(self.session_id)
    }

    /// Live members in join order.
    pub fn members(&self) -> Vec<Arc<Process>> {
        self.members
            .lock()
            .iter()
            .filter_map(Weak::upgrade)
            .collect()
    }

    pub fn contains(&self, process: &Process) -> bool {
        self.members
            .lock()
            .iter()
            .any(|member| core::ptr::eq(member.as_ptr(), process))
    }

    /// Move `process` into this group, leaving its previous group.
    pub fn reassociate_process(self: &Arc<Self>, process: &Arc<Process>) {
        let previous = process.set_group_id(Some(self.pgid()));
        if previous == Some(self.pgid()) {
            return;
        }

        if let Some(old) = previous.and_then(|pgid| self.hull.registry()?.find_process_group(pgid)) {
            old.remove_member(process);
        }
        self.members.lock().push(Arc::downgrade(process));

        log::debug!(
            "[POSIX JOB] Process {} joined group {}",
            process.pid(),
            self.pgid()
        );
    }

    /// Remove `process` from this group.
    ///
    /// # Panics
    ///
    /// Panics if `process` is not a member.
    pub fn drop_process(&self, process: &Process) {
        assert_eq!(
            process.pgid(),
            Some(self.pgid()),
            "process {} is not in group {}",
            process.pid(),
            self.pgid()
        );
        process.set_group_id(None);
        self.remove_member(process);
    }

    fn remove_member(&self, process: &Process) {
        let now_empty = {
            let mut members = self.members.lock();
            members.retain(|member| {
                member.strong_count() > 0 && !core::ptr::eq(member.as_ptr(), process)
            });
            members.is_empty()
        };

        if now_empty {
            log::debug!("[POSIX JOB] Group {} is empty", self.pgid());
            if let Some(session) = self.session() {
                session.drop_group(self.pgid());
            }
        }
    }

    /// Raise `sn` in every member.
    pub fn issue_signal_to_group(&self, sn: u8, info: SignalInfo) {
        for member in self.members() {
            if let Some(signals) = member.signal_context() {
                signals.issue_signal(sn, info);
            }
        }
    }
}

impl fmt::Debug for ProcessGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessGroup")
            .field("pgid", &self.pgid())
            .field("session", &self.session_id)
            .field("members", &self.members.lock().len())
            .finish()
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Terminal sessions
// ═══════════════════════════════════════════════════════════════════════

struct SessionInner {
    groups: Vec<Arc<ProcessGroup>>,
    foreground: Option<Pid>,
    controlling_terminal: Weak<ControllingTerminalState>,
}

pub struct TerminalSession {
    hull: Arc<PidHull>,
    inner: Mutex<SessionInner>,
}

impl TerminalSession {
    /// Make `leader` the leader of a new session and of a new foreground
    /// group inside it (setsid).
    ///
    /// Fails with `InsufficientPermissions` if `leader` already leads a
    /// group or session.
    pub fn initialize_new_session(leader: &Arc<Process>) -> Result<Arc<TerminalSession>> {
        let hull = leader.hull().clone();
        if hull.process_group().is_some() || hull.terminal_session().is_some() {
            return Err(Error::InsufficientPermissions);
        }

        let session = Arc::new(TerminalSession {
            hull: hull.clone(),
            inner: Mutex::new(SessionInner {
                groups: Vec::new(),
                foreground: None,
                controlling_terminal: Weak::new(),
            }),
        });
        hull.initialize_terminal_session(&session);
        leader.subsystem().registry().insert_session(session.clone());

        let group = session.spawn_process_group(leader)?;
        session.inner.lock().foreground = Some(group.pgid());

        log::debug!("[POSIX JOB] Process {} leads a new session", leader.pid());
        Ok(session)
    }

    /// Create a new group led by `leader` in this session.
    pub fn spawn_process_group(self: &Arc<Self>, leader: &Arc<Process>) -> Result<Arc<ProcessGroup>> {
        let hull = leader.hull().clone();
        if hull.process_group().is_some() {
            return Err(Error::InsufficientPermissions);
        }

        let group = Arc::new(ProcessGroup {
            hull: hull.clone(),
            session_id: self.session_id(),
            members: Mutex::new(Vec::new()),
        });
        hull.initialize_process_group(&group);
        self.inner.lock().groups.push(group.clone());
        group.reassociate_process(leader);
        Ok(group)
    }

    /// Session id (the leader's pid).
    pub fn session_id(&self) -> Pid {
        self.hull.pid()
    }

    pub fn process_group_by_id(&self, pgid: Pid) -> Option<Arc<ProcessGroup>> {
        self.inner
            .lock()
            .groups
            .iter()
            .find(|group| group.pgid() == pgid)
            .cloned()
    }

    pub fn groups(&self) -> Vec<Arc<ProcessGroup>> {
        self.inner.lock().groups.clone()
    }

    pub fn foreground_group(&self) -> Option<Arc<ProcessGroup>> {
        let pgid = self.inner.lock().foreground?;
        self.process_group_by_id(pgid)
    }

    /// Select the group that receives terminal-generated signals.
    pub fn set_foreground_group(&self, group: &ProcessGroup) -> Result<()> {
        if group.session_id() != self.session_id() {
            return Err(Error::InsufficientPermissions);
        }
        self.inner.lock().foreground = Some(group.pgid());
        Ok(())
    }

    pub fn controlling_terminal(&self) -> Option<Arc<ControllingTerminalState>> {
        self.inner.lock().controlling_terminal.upgrade()
    }

    pub(crate) fn drop_group(&self, pgid: Pid) {
        let (removed, now_empty) = {
            let mut inner = self.inner.lock();
            if inner.foreground == Some(pgid) {
                inner.foreground = None;
            }
            let removed = inner
                .groups
                .iter()
                .position(|group| group.pgid() == pgid)
                .map(|index| inner.groups.remove(index));
            (removed, inner.groups.is_empty())
        };
        drop(removed);

        if now_empty {
            if let Some(registry) = self.hull.registry() {
                registry.destroy_session(self.session_id());
            }
        }
    }
}

impl fmt::Debug for TerminalSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("TerminalSession")
            .field("sid", &self.session_id())
            .field("groups", &inner.groups.len())
            .field("foreground", &inner.foreground)
            .finish()
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Controlling terminals
// ═══════════════════════════════════════════════════════════════════════

/// Session binding of one terminal device.
#[derive(Default)]
pub struct ControllingTerminalState {
    session: Mutex<Weak<TerminalSession>>,
}

impl ControllingTerminalState {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn session(&self) -> Option<Arc<TerminalSession>> {
        self.session.lock().upgrade()
    }

    /// Bind this terminal to the session led by `process` (TIOCSCTTY).
    pub fn assign_session_of(self: &Arc<Self>, process: &Process) -> Result<()> {
        let group = process.process_group().ok_or(Error::IllegalArguments)?;
        let session = group.session().ok_or(Error::IllegalArguments)?;
        if session.session_id() != process.pid() {
            return Err(Error::IllegalArguments);
        }
        if self.session().is_some() {
            return Err(Error::InsufficientPermissions);
        }

        {
            let mut inner = session.inner.lock();
            if inner.controlling_terminal.strong_count() > 0 {
                return Err(Error::InsufficientPermissions);
            }
            inner.controlling_terminal = Arc::downgrade(self);
        }
        *self.session.lock() = Arc::downgrade(&session);

        log::debug!(
            "[POSIX JOB] Session {} acquired a controlling terminal",
            session.session_id()
        );
        Ok(())
    }

    /// Unbind `session` from this terminal.
    pub fn drop_session(&self, session: &TerminalSession) {
        {
            let mut current = self.session.lock();
            debug_assert!(core::ptr::eq(current.as_ptr(), session));
            *current = Weak::new();
        }
        session.inner.lock().controlling_terminal = Weak::new();
    }

    /// Raise `sn` in the foreground group of the bound session, if any.
    pub fn issue_signal_to_foreground_group(&self, sn: u8, info: SignalInfo) {
        let Some(session) = self.session() else {
            return;
        };
        let Some(group) = session.foreground_group() else {
            return;
        };
        group.issue_signal_to_group(sn, info);
    }
}

impl fmt::Debug for ControllingTerminalState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ControllingTerminalState")
            .field("session", &self.session().map(|s| s.session_id()))
            .finish()
    }
}
