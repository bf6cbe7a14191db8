//! Cooperative synchronization primitives.
//!
//! All suspension points of the core are built from the three primitives in
//! this module:
//!
//! - [`CancellationToken`]: advisory cancellation observed at the next wake-up
//! - [`Bell`]: a recurring event that wakes every current waiter
//! - [`WorkBarrier`]: an outstanding-work counter with a one-shot "drained"
//!   notification once it has been closed
//!
//! None of them block the executing thread; waiting is done by returning
//! `Poll::Pending` with the waker registered.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use core::task::{Poll, Waker};

use futures_util::future::poll_fn;
use spin::Mutex;

/// List of wakers waiting on one condition.
#[derive(Default)]
struct WaitQueue {
    wakers: Mutex<Vec<Waker>>,
}

impl WaitQueue {
    const fn new() -> Self {
        Self {
            wakers: Mutex::new(Vec::new()),
        }
    }

    fn register(&self, waker: &Waker) {
        let mut wakers = self.wakers.lock();
        if !wakers.iter().any(|w| w.will_wake(waker)) {
            wakers.push(waker.clone());
        }
    }

    fn wake_all(&self) {
        let wakers = core::mem::take(&mut *self.wakers.lock());
        for waker in wakers {
            waker.wake();
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Cancellation
// ═══════════════════════════════════════════════════════════════════════

#[derive(Default)]
struct TokenState {
    cancelled: AtomicBool,
    waiters: WaitQueue,
}

/// Advisory cancellation token.
///
/// Clones share the same state. Cancelling never unwinds a waiter; every
/// pending wait observes the token on its next wake-up and returns an
/// "interrupted" outcome.
#[derive(Clone, Default)]
pub struct CancellationToken {
    state: Arc<TokenState>,
}

impl CancellationToken {
    /// Create a token that has not been cancelled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation and wake every waiter.
    pub fn cancel(&self) {
        if !self.state.cancelled.swap(true, Ordering::AcqRel) {
            self.state.waiters.wake_all();
        }
    }

    /// Check whether cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.state.cancelled.load(Ordering::Acquire)
    }

    /// Register `waker` to be woken on cancellation.
    pub fn register(&self, waker: &Waker) {
        self.state.waiters.register(waker);
    }

    /// Resolve once cancellation is requested.
    pub async fn cancelled(&self) {
        poll_fn(|cx| {
            if self.is_cancelled() {
                return Poll::Ready(());
            }
            self.register(cx.waker());
            if self.is_cancelled() {
                Poll::Ready(())
            } else {
                Poll::Pending
            }
        })
        .await
    }
}

impl core::fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("CancellationToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Bell
// ═══════════════════════════════════════════════════════════════════════

/// Recurring event.
///
/// A waiter is released by the first `raise` that happens after it started
/// waiting.
pub struct Bell {
    seq: AtomicU64,
    waiters: WaitQueue,
}

impl Bell {
    pub const fn new() -> Self {
        Self {
            seq: AtomicU64::new(0),
            waiters: WaitQueue::new(),
        }
    }

    /// Wake every current waiter.
    pub fn raise(&self) {
        self.seq.fetch_add(1, Ordering::AcqRel);
        self.waiters.wake_all();
    }

    /// Number of raises so far.
    pub fn sequence(&self) -> u64 {
        self.seq.load(Ordering::Acquire)
    }

    /// Wait for the next raise. Returns `false` if `token` was cancelled first.
    pub async fn wait(&self, token: &CancellationToken) -> bool {
        let seq = self.sequence();
        self.wait_since(seq, token).await
    }

    /// Wait until the bell was raised after sequence `seq`.
    pub async fn wait_since(&self, seq: u64, token: &CancellationToken) -> bool {
        poll_fn(|cx| {
            if self.sequence() != seq {
                return Poll::Ready(true);
            }
            if token.is_cancelled() {
                return Poll::Ready(false);
            }
            self.waiters.register(cx.waker());
            token.register(cx.waker());

            if self.sequence() != seq {
                Poll::Ready(true)
            } else if token.is_cancelled() {
                Poll::Ready(false)
            } else {
                Poll::Pending
            }
        })
        .await
    }
}

impl Default for Bell {
    fn default() -> Self {
        Self::new()
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Work barrier
// ═══════════════════════════════════════════════════════════════════════

#[derive(Default)]
struct BarrierState {
    outstanding: AtomicUsize,
    closed: AtomicBool,
    waiters: WaitQueue,
}

impl BarrierState {
    fn is_drained(&self) -> bool {
        self.closed.load(Ordering::Acquire) && self.outstanding.load(Ordering::Acquire) == 0
    }
}

/// Counts outstanding units of work and fires once after it is closed and
/// the count reaches zero.
#[derive(Default)]
pub struct WorkBarrier {
    state: Arc<BarrierState>,
}

impl WorkBarrier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a unit of work. Refused once the barrier is closed.
    pub fn enter(&self) -> Option<WorkGuard> {
        if self.state.closed.load(Ordering::Acquire) {
            return None;
        }
        self.state.outstanding.fetch_add(1, Ordering::AcqRel);
        Some(WorkGuard {
            state: self.state.clone(),
        })
    }

    /// Forbid new work. The barrier drains once current work completes.
    pub fn close(&self) {
        self.state.closed.store(true, Ordering::Release);
        if self.state.is_drained() {
            self.state.waiters.wake_all();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.state.closed.load(Ordering::Acquire)
    }

    /// Number of units of work still running.
    pub fn outstanding(&self) -> usize {
        self.state.outstanding.load(Ordering::Acquire)
    }

    pub fn is_drained(&self) -> bool {
        self.state.is_drained()
    }

    /// Resolve once the barrier is closed and no work is outstanding.
    pub async fn drained(&self) {
        poll_fn(|cx| {
            if self.state.is_drained() {
                return Poll::Ready(());
            }
            self.state.waiters.register(cx.waker());
            if self.state.is_drained() {
                Poll::Ready(())
            } else {
                Poll::Pending
            }
        })
        .await
    }
}

/// One unit of outstanding work. Completes when dropped.
pub struct WorkGuard {
    state: Arc<BarrierState>,
}

impl Drop for WorkGuard {
    fn drop(&mut self) {
        let previous = self.state.outstanding.fetch_sub(1, Ordering::AcqRel);
        if previous == 1 && self.state.closed.load(Ordering::Acquire) {
            self.state.waiters.wake_all();
        }
    }
}
