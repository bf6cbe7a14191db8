//! Signal delivery
//!
//! Turning a fetched [`SignalItem`] into an effect on the target process:
//!
//! 1. `determine_handling` consults the handler table (and applies
//!    `SA_RESETHAND`).
//! 2. `raise_context` discards ignored signals, terminates the process for
//!    fatal ones, and otherwise builds a signal frame on the thread's stack
//!    and redirects the thread into the handler.
//! 3. `restore_context` undoes step 2 once the handler returns through its
//!    restorer.

use alloc::sync::Arc;
use alloc::vec::Vec;

use bytemuck::Zeroable;

use super::frame::{self, FrameLayout, HandlerCall, NativeAbi, SavedContext, SignalAbi};
use super::info::SigInfo;
use super::{
    sigmask, slot_index, SignalContext, SignalDisposition, SignalFlags, SignalHandler,
    SignalItem, SIGCHLD, SIGCONT, SIGSTOP, SIGTSTP, SIGTTIN, SIGTTOU, SIGURG, SIGWINCH,
};
use crate::error::{KernelError, Result};
use crate::platform::{Handle, RegisterSet};
use crate::process::{Process, TerminationState};
use crate::sync::WorkGuard;

/// Outcome of consulting the handler table for one item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignalHandling {
    pub handler: SignalHandler,
    pub ignored: bool,
    pub killed: bool,
}

/// Signals whose default action is to do nothing.
fn ignored_by_default(sn: u8) -> bool {
    match sn {
        SIGCHLD | SIGURG | SIGWINCH => true,
        SIGSTOP | SIGTSTP | SIGTTIN | SIGTTOU | SIGCONT => {
            log::debug!(
                "[POSIX SIG] Stop/continue default action for signal {} is not implemented, ignoring",
                sn
            );
            true
        }
        _ => false,
    }
}

impl SignalContext {
    /// Decide what raising `item` does.
    pub fn determine_handling(&self, item: &SignalItem) -> SignalHandling {
        let index = slot_index(item.signal_number);
        let handler = {
            let mut state = self.state.lock();
            let handler = state.handlers[index];
            if handler.flags.contains(SignalFlags::ONCE) {
                state.handlers[index].disposition = SignalDisposition::Default;
            }
            handler
        };

        let mut handling = SignalHandling {
            handler,
            ignored: false,
            killed: false,
        };
        match handler.disposition {
            SignalDisposition::Default => {
                if ignored_by_default(item.signal_number) {
                    handling.ignored = true;
                } else {
                    handling.killed = true;
                }
            }
            SignalDisposition::Ignore => handling.ignored = true,
            SignalDisposition::Handle => {}
        }
        handling
    }

    /// Carry out `handling` for `item` on `process`.
    pub async fn raise_context(
        &self,
        item: SignalItem,
        process: &Arc<Process>,
        handling: SignalHandling,
    ) -> Result<()> {
        self.raise_context_with::<NativeAbi>(item, process, handling)
            .await
    }

    pub(crate) async fn raise_context_with<A: SignalAbi>(
        &self,
        item: SignalItem,
        process: &Arc<Process>,
        handling: SignalHandling,
    ) -> Result<()> {
        let sn = item.signal_number;
        if handling.ignored {
            return Ok(());
        }

        if handling.killed {
            log::info!(
                "[POSIX SIG] Process {} killed as the result of signal {}",
                process.pid(),
                sn
            );
            return process.terminate(TerminationState::BySignal(sn)).await;
        }

        let kernel = process.kernel();
        let thread = process
            .thread_handle()
            .ok_or(KernelError::ThreadTerminated)?;
        let log_signals = process.subsystem().config().log_signals;

        let image = kernel.load_registers(thread, RegisterSet::Signal)?;
        let mut gregs: Vec<u64> = bytemuck::pod_collect_to_vec(&image);
        gregs.resize(A::GREG_COUNT, 0);
        let simd = kernel.load_registers(thread, RegisterSet::Simd)?;

        let old_mask = process.signal_mask();

        // siginfo is only filled in when the handler asked for it.
        let info = if handling.handler.flags.contains(SignalFlags::INFO) {
            item.info.compile(sn)
        } else {
            SigInfo::zeroed()
        };

        let mut thread_sp = A::stack_pointer(&gregs);
        if handling.handler.flags.contains(SignalFlags::ON_STACK) {
            let alt = process.alt_stack();
            if alt.enabled && !process.is_on_alt_stack(thread_sp) {
                thread_sp = alt.sp.checked_add(alt.size).ok_or(KernelError::Fault)?;
            }
        }

        // The stack values are client-controlled.
        let layout = FrameLayout::of::<A>();
        let total = (layout.size + simd.len()) as u64;
        let frame = FrameLayout::place::<A>(thread_sp, total).ok_or(KernelError::Fault)?;

        let saved = SavedContext {
            gregs: gregs.clone(),
            sigmask: old_mask,
            fpregs: frame + layout.size as u64,
        };
        let bytes = frame::encode_frame::<A>(&layout, &saved, handling.handler.restorer_ip, &info);
        kernel.write_memory(thread, frame, &bytes).await?;
        kernel
            .write_memory(thread, frame + layout.size as u64, &simd)
            .await?;

        if log_signals {
            log::debug!("[POSIX SIG] Saving pre-signal stack to {:#x}", frame);
            log::debug!(
                "[POSIX SIG] Calling signal handler at {:#x}",
                handling.handler.handler_ip
            );
        }

        A::enter_handler(
            &mut gregs,
            &HandlerCall {
                handler_ip: handling.handler.handler_ip,
                restorer_ip: handling.handler.restorer_ip,
                args: [
                    u64::from(sn),
                    frame + layout.info as u64,
                    frame + layout.ucontext as u64,
                ],
                stack_pointer: frame,
            },
        );

        let mut handler_mask = old_mask | handling.handler.mask;
        if !handling.handler.flags.contains(SignalFlags::REENTRANT) {
            handler_mask |= sigmask(sn);
        }
        process.set_signal_mask(handler_mask);
        kernel.store_registers(thread, RegisterSet::Signal, bytemuck::cast_slice(&gregs))?;
        Ok(())
    }

    /// `determine_handling` followed by `raise_context`. Returns whether the
    /// process was killed.
    ///
    /// `delivery` is the caller's signal-delivery guard, if any. Termination
    /// waits for every delivery to drain, so the guard is released before a
    /// killing signal is acted on and after the frame is written otherwise.
    pub async fn determine_and_raise_context(
        &self,
        item: SignalItem,
        process: &Arc<Process>,
        delivery: Option<WorkGuard>,
    ) -> Result<bool> {
        let handling = self.determine_handling(&item);
        if handling.killed {
            drop(delivery);
            self.raise_context(item, process, handling).await?;
        } else {
            self.raise_context(item, process, handling).await?;
            drop(delivery);
        }
        Ok(handling.killed)
    }

    /// Return from a signal handler: reload the frame the thread's stack
    /// pointer refers to and restore registers and signal mask.
    ///
    /// Must be called at most once per delivered frame.
    pub async fn restore_context(&self, thread: Handle, process: &Process) -> Result<()> {
        self.restore_context_with::<NativeAbi>(thread, process)
            .await
    }

    pub(crate) async fn restore_context_with<A: SignalAbi>(
        &self,
        thread: Handle,
        process: &Process,
    ) -> Result<()> {
        let kernel = process.kernel();
        let program: Vec<u64> =
            bytemuck::pod_collect_to_vec(&kernel.load_registers(thread, RegisterSet::Program)?);
        let sp = *program.get(1).ok_or(KernelError::IllegalArguments)?;
        let layout = FrameLayout::of::<A>();
        let frame = sp.checked_sub(A::CALL_MISALIGN).ok_or(KernelError::Fault)?;
        let simd_at = frame
            .checked_add(layout.size as u64)
            .ok_or(KernelError::Fault)?;

        if process.subsystem().config().log_signals {
            log::debug!("[POSIX SIG] Restoring post-signal stack from {:#x}", frame);
        }

        let simd_size = kernel.register_set_size(RegisterSet::Simd);
        let bytes = kernel.read_memory(thread, frame, layout.size).await?;
        let simd = kernel.read_memory(thread, simd_at, simd_size).await?;
        let (saved, _) = frame::decode_frame::<A>(&layout, &bytes);

        process.set_signal_mask(saved.sigmask);
        kernel.store_registers(
            thread,
            RegisterSet::Signal,
            bytemuck::cast_slice(&saved.gregs),
        )?;
        kernel.store_registers(thread, RegisterSet::Simd, &simd)?;
        Ok(())
    }
}
