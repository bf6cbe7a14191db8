//! Execution generations.
//!
//! A [`Generation`] stands for one program image running in a process. It
//! is replaced on exec and dropped on terminate. Asynchronous work that
//! touches the process on behalf of an image (signal delivery, request
//! serving) registers with the generation's barriers; retiring the
//! generation cancels it and then waits for both barriers to drain, so
//! nothing started against the old image can still run once the image is
//! replaced or released.

use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, Ordering};

use crate::sync::{CancellationToken, WorkBarrier, WorkGuard};

pub struct Generation {
    cancel_serve: CancellationToken,
    in_termination: AtomicBool,
    signals: WorkBarrier,
    requests: WorkBarrier,
    log_cleanup: bool,
}

impl Generation {
    pub fn new(log_cleanup: bool) -> Arc<Self> {
        Arc::new(Self {
            cancel_serve: CancellationToken::new(),
            in_termination: AtomicBool::new(false),
            signals: WorkBarrier::new(),
            requests: WorkBarrier::new(),
            log_cleanup,
        })
    }

    /// Token that fires once this generation starts retiring.
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel_serve.clone()
    }

    pub fn is_in_termination(&self) -> bool {
        self.in_termination.load(Ordering::Acquire)
    }

    /// Register an in-flight signal delivery.
    ///
    /// Returns `None` once the generation is terminating.
    pub fn begin_signal_delivery(&self) -> Option<WorkGuard> {
        if self.is_in_termination() {
            return None;
        }
        self.signals.enter()
    }

    /// Register an in-flight request.
    ///
    /// A request that ends up replacing or terminating its own process must
    /// drop its guard first, since exec and terminate wait for all guards.
    pub fn begin_request(&self) -> Option<WorkGuard> {
        if self.is_in_termination() {
            return None;
        }
        self.requests.enter()
    }

    pub fn outstanding_signal_deliveries(&self) -> usize {
        self.signals.outstanding()
    }

    pub fn outstanding_requests(&self) -> usize {
        self.requests.outstanding()
    }

    /// Mark the generation as terminating, cancel it and wait until no
    /// signal delivery and no request is in flight anymore.
    pub async fn retire(&self) {
        self.in_termination.store(true, Ordering::Release);
        self.cancel_serve.cancel();
        self.signals.close();
        self.requests.close();

        self.signals.drained().await;
        self.requests.drained().await;
    }

    /// Whether `retire` has completed.
    pub fn is_drained(&self) -> bool {
        self.signals.is_drained() && self.requests.is_drained()
    }
}

impl core::fmt::Debug for Generation {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Generation")
            .field("in_termination", &self.is_in_termination())
            .field("signals", &self.signals.outstanding())
            .field("requests", &self.requests.outstanding())
            .finish()
    }
}

impl Drop for Generation {
    fn drop(&mut self) {
        if self.log_cleanup {
            log::debug!("[POSIX PROC] Generation is destructed");
        }
    }
}
