//! Signal State
//!
//! Per-process signal handler table and pending-signal queues.
//!
//! Every signal number owns a FIFO queue of [`SignalItem`]s. A slot is
//! *pending* while its queue is non-empty; the active set mirrors this with
//! one bit per slot. A global sequence counter is bumped on every raise so
//! that pollers can tell whether anything happened since a given point.
//!
//! Delivery (turning a fetched item into a handler invocation on the target
//! thread) lives in `delivery`; the register-level frame layout per
//! architecture lives in `frame`.

mod delivery;
pub mod frame;
mod info;

pub use delivery::SignalHandling;
pub use frame::{NativeAbi, SignalAbi};
pub use info::{SigInfo, SignalInfo, SI_TIMER, SI_USER};

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec::Vec;

use bitflags::bitflags;
use spin::Mutex;

use crate::sync::{Bell, CancellationToken};

// ─── Signal numbers (Linux) ─────────────────────────────────────────

pub const SIGHUP: u8 = 1;
pub const SIGINT: u8 = 2;
pub const SIGQUIT: u8 = 3;
pub const SIGILL: u8 = 4;
pub const SIGTRAP: u8 = 5;
pub const SIGABRT: u8 = 6;
pub const SIGBUS: u8 = 7;
pub const SIGFPE: u8 = 8;
pub const SIGKILL: u8 = 9;
pub const SIGUSR1: u8 = 10;
pub const SIGSEGV: u8 = 11;
pub const SIGUSR2: u8 = 12;
pub const SIGPIPE: u8 = 13;
pub const SIGALRM: u8 = 14;
pub const SIGTERM: u8 = 15;
pub const SIGSTKFLT: u8 = 16;
pub const SIGCHLD: u8 = 17;
pub const SIGCONT: u8 = 18;
pub const SIGSTOP: u8 = 19;
pub const SIGTSTP: u8 = 20;
pub const SIGTTIN: u8 = 21;
pub const SIGTTOU: u8 = 22;
pub const SIGURG: u8 = 23;
pub const SIGXCPU: u8 = 24;
pub const SIGXFSZ: u8 = 25;
pub const SIGVTALRM: u8 = 26;
pub const SIGPROF: u8 = 27;
pub const SIGWINCH: u8 = 28;
pub const SIGIO: u8 = 29;
pub const SIGPWR: u8 = 30;
pub const SIGSYS: u8 = 31;

/// Number of signal slots.
pub const NSIG: usize = 64;

/// Bit of signal `sn` in a signal set.
pub const fn sigmask(sn: u8) -> u64 {
    1u64 << (sn - 1)
}

/// Signals that can be neither blocked nor caught.
pub const UNBLOCKABLE: u64 = sigmask(SIGKILL) | sigmask(SIGSTOP);

fn slot_index(sn: u8) -> usize {
    assert!(
        sn >= 1 && usize::from(sn) <= NSIG,
        "signal number {} out of range",
        sn
    );
    usize::from(sn) - 1
}

// ─── Handler table ──────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SignalDisposition {
    /// SIG_DFL
    #[default]
    Default,
    /// SIG_IGN
    Ignore,
    /// A user handler is installed.
    Handle,
}

bitflags! {
    /// Per-handler flags (`SA_*`).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct SignalFlags: u32 {
        /// SA_RESETHAND
        const ONCE = 1 << 0;
        /// SA_NODEFER
        const REENTRANT = 1 << 1;
        /// SA_SIGINFO
        const INFO = 1 << 2;
        /// SA_ONSTACK
        const ON_STACK = 1 << 3;
        /// SA_NOCLDWAIT
        const NO_CHILD_WAIT = 1 << 4;
    }
}

/// Per-signal action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SignalHandler {
    pub disposition: SignalDisposition,
    pub handler_ip: u64,
    pub restorer_ip: u64,
    pub flags: SignalFlags,
    /// Additional signals blocked while the handler runs.
    pub mask: u64,
}

impl SignalHandler {
    /// Handler that runs `handler_ip` and returns through `restorer_ip`.
    pub fn handle(handler_ip: u64, restorer_ip: u64, flags: SignalFlags, mask: u64) -> Self {
        Self {
            disposition: SignalDisposition::Handle,
            handler_ip,
            restorer_ip,
            flags,
            mask,
        }
    }

    pub fn ignore() -> Self {
        Self {
            disposition: SignalDisposition::Ignore,
            ..Self::default()
        }
    }
}

/// One raised occurrence of a signal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalItem {
    pub signal_number: u8,
    pub info: SignalInfo,
}

// ─── Signal context ─────────────────────────────────────────────────

#[derive(Default)]
struct SignalSlot {
    /// Sequence number of the most recent raise.
    raise_seq: u64,
    queue: VecDeque<SignalItem>,
}

struct SignalState {
    current_seq: u64,
    active_set: u64,
    handlers: [SignalHandler; NSIG],
    slots: Vec<SignalSlot>,
}

impl SignalState {
    fn new(handlers: [SignalHandler; NSIG]) -> Self {
        Self {
            current_seq: 1,
            active_set: 0,
            handlers,
            slots: (0..NSIG).map(|_| SignalSlot::default()).collect(),
        }
    }

    /// Pop the lowest-numbered pending item whose bit is in `mask`.
    fn take_pending(&mut self, mask: u64) -> Option<SignalItem> {
        let ready = self.active_set & mask;
        if ready == 0 {
            return None;
        }
        let index = ready.trailing_zeros() as usize;
        let slot = &mut self.slots[index];
        let item = slot.queue.pop_front();
        debug_assert!(item.is_some());
        if slot.queue.is_empty() {
            self.active_set &= !(1u64 << index);
        }
        item
    }
}

/// Signal handler table and pending queues of one process (or of a group of
/// threads created with `clone`).
pub struct SignalContext {
    state: Mutex<SignalState>,
    bell: Bell,
}

impl SignalContext {
    /// Every signal with its default disposition, nothing pending.
    pub fn create() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(SignalState::new([SignalHandler::default(); NSIG])),
            bell: Bell::new(),
        })
    }

    /// Copy of the handler table; pending signals are not inherited.
    pub fn clone(original: &SignalContext) -> Arc<Self> {
        let handlers = original.state.lock().handlers;
        Arc::new(Self {
            state: Mutex::new(SignalState::new(handlers)),
            bell: Bell::new(),
        })
    }

    /// Reset every installed handler to the default disposition (exec).
    ///
    /// Ignored signals stay ignored and pending signals stay pending.
    pub fn reset_handlers(&self) {
        let mut state = self.state.lock();
        for handler in state.handlers.iter_mut() {
            if handler.disposition == SignalDisposition::Handle {
                handler.disposition = SignalDisposition::Default;
            }
        }
    }

    pub fn handler(&self, sn: u8) -> SignalHandler {
        self.state.lock().handlers[slot_index(sn)]
    }

    /// Install `handler` for `sn` and return the previous one.
    pub fn change_handler(&self, sn: u8, handler: SignalHandler) -> SignalHandler {
        let index = slot_index(sn);
        core::mem::replace(&mut self.state.lock().handlers[index], handler)
    }

    /// Queue a new occurrence of `sn` and wake waiters.
    pub fn issue_signal(&self, sn: u8, info: SignalInfo) {
        let index = slot_index(sn);
        {
            let mut state = self.state.lock();
            state.current_seq += 1;
            let seq = state.current_seq;
            let slot = &mut state.slots[index];
            slot.raise_seq = seq;
            slot.queue.push_back(SignalItem {
                signal_number: sn,
                info,
            });
            state.active_set |= 1u64 << index;
        }
        self.bell.raise();
    }

    /// Current sequence number and active set.
    pub fn check_signal(&self) -> (u64, u64) {
        let state = self.state.lock();
        (state.current_seq, state.active_set)
    }

    /// Wait until something was raised after `in_seq` and a signal in `mask`
    /// is active.
    ///
    /// Returns the current sequence number and the set of signals raised
    /// after `in_seq`. Queues are not consumed. On cancellation the current
    /// state is returned as-is.
    pub async fn poll_signal(
        &self,
        in_seq: u64,
        mask: u64,
        token: &CancellationToken,
    ) -> (u64, u64) {
        debug_assert!(in_seq <= self.state.lock().current_seq);

        loop {
            let bell_seq = self.bell.sequence();
            if self.state.lock().current_seq != in_seq || token.is_cancelled() {
                break;
            }
            self.bell.wait_since(bell_seq, token).await;
        }

        loop {
            let bell_seq = self.bell.sequence();
            if self.state.lock().active_set & mask != 0 || token.is_cancelled() {
                break;
            }
            self.bell.wait_since(bell_seq, token).await;
        }

        let state = self.state.lock();
        let edges = state
            .slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.raise_seq > in_seq)
            .fold(0u64, |edges, (index, _)| edges | (1u64 << index));
        (state.current_seq, edges)
    }

    /// Dequeue the lowest-numbered pending signal in `mask`.
    ///
    /// With `non_block` this returns `None` right away if nothing is
    /// pending; otherwise it waits for a raise. Cancellation yields `None`.
    pub async fn fetch_signal(
        &self,
        mask: u64,
        non_block: bool,
        token: &CancellationToken,
    ) -> Option<SignalItem> {
        loop {
            let bell_seq = self.bell.sequence();
            if let Some(item) = self.state.lock().take_pending(mask) {
                return Some(item);
            }
            if non_block {
                return None;
            }
            if !self.bell.wait_since(bell_seq, token).await {
                return None;
            }
        }
    }

    /// Number of queued occurrences of `sn`.
    pub fn pending_count(&self, sn: u8) -> usize {
        self.state.lock().slots[slot_index(sn)].queue.len()
    }
}

impl core::fmt::Debug for SignalContext {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let (seq, active) = self.check_signal();
        f.debug_struct("SignalContext")
            .field("seq", &seq)
            .field("active_set", &format_args!("{:#x}", active))
            .finish()
    }
}
