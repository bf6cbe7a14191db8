//! Signal frame layout per architecture.
//!
//! A signal frame mirrors Linux' `rt_sigframe`:
//!
//! ```text
//! frame ─► [return address]        (x86_64 only; others return via a register)
//!          ucontext
//!            uc_flags, uc_link, uc_stack
//!            mcontext: gregs[], fpregs pointer
//!            uc_sigmask (1024 bits)
//!          siginfo_t               (128 bytes)
//! frame + size ─► SIMD state       (opaque kernel image)
//! ```
//!
//! The general register image is the kernel's `Signal` register set, which
//! matches the `mcontext` register array of the architecture.

use alloc::vec;
use alloc::vec::Vec;

use super::info::SigInfo;

/// Arguments used to redirect a thread into a signal handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandlerCall {
    pub handler_ip: u64,
    pub restorer_ip: u64,
    /// Signal number, siginfo pointer, ucontext pointer.
    pub args: [u64; 3],
    pub stack_pointer: u64,
}

/// Register-level signal ABI of one architecture.
pub trait SignalAbi {
    /// Number of 64-bit words in the `Signal` register image.
    const GREG_COUNT: usize;
    /// Bytes below the stack pointer the interrupted code may still use.
    const RED_ZONE: u64;
    /// Offset of the stack pointer from 16-byte alignment at function entry.
    const CALL_MISALIGN: u64;
    /// Whether the handler returns by popping a return address off the stack.
    const RETURN_SLOT: bool;

    fn stack_pointer(gregs: &[u64]) -> u64;

    fn instruction_pointer(gregs: &[u64]) -> u64;

    /// Rewrite `gregs` so that the thread enters the handler.
    fn enter_handler(gregs: &mut [u64], call: &HandlerCall);
}

/// System V x86_64, glibc `REG_*` order.
pub struct X86_64;

impl X86_64 {
    pub const REG_RDI: usize = 8;
    pub const REG_RSI: usize = 9;
    pub const REG_RDX: usize = 12;
    pub const REG_RAX: usize = 13;
    pub const REG_RSP: usize = 15;
    pub const REG_RIP: usize = 16;
}

impl SignalAbi for X86_64 {
    const GREG_COUNT: usize = 23;
    const RED_ZONE: u64 = 128;
    const CALL_MISALIGN: u64 = 8;
    const RETURN_SLOT: bool = true;

    fn stack_pointer(gregs: &[u64]) -> u64 {
        gregs[Self::REG_RSP]
    }

    fn instruction_pointer(gregs: &[u64]) -> u64 {
        gregs[Self::REG_RIP]
    }

    fn enter_handler(gregs: &mut [u64], call: &HandlerCall) {
        gregs[Self::REG_RDI] = call.args[0];
        gregs[Self::REG_RSI] = call.args[1];
        gregs[Self::REG_RDX] = call.args[2];
        // Number of vector registers used by a variadic call.
        gregs[Self::REG_RAX] = 0;
        gregs[Self::REG_RIP] = call.handler_ip;
        gregs[Self::REG_RSP] = call.stack_pointer;
    }
}

/// AArch64: `regs[31]`, `sp`, `pc`, `pstate`.
pub struct Aarch64;

impl Aarch64 {
    pub const REG_LR: usize = 30;
    pub const REG_SP: usize = 31;
    pub const REG_PC: usize = 32;
}

impl SignalAbi for Aarch64 {
    const GREG_COUNT: usize = 34;
    const RED_ZONE: u64 = 0;
    const CALL_MISALIGN: u64 = 0;
    const RETURN_SLOT: bool = false;

    fn stack_pointer(gregs: &[u64]) -> u64 {
        gregs[Self::REG_SP]
    }

    fn instruction_pointer(gregs: &[u64]) -> u64 {
        gregs[Self::REG_PC]
    }

    fn enter_handler(gregs: &mut [u64], call: &HandlerCall) {
        gregs[..3].copy_from_slice(&call.args);
        gregs[Self::REG_LR] = call.restorer_ip;
        gregs[Self::REG_PC] = call.handler_ip;
        gregs[Self::REG_SP] = call.stack_pointer;
    }
}

/// RISC-V 64, glibc `REG_*` order.
pub struct Riscv64;

impl Riscv64 {
    pub const REG_PC: usize = 0;
    pub const REG_RA: usize = 1;
    pub const REG_SP: usize = 2;
    pub const REG_A0: usize = 10;
}

impl SignalAbi for Riscv64 {
    const GREG_COUNT: usize = 32;
    const RED_ZONE: u64 = 0;
    const CALL_MISALIGN: u64 = 0;
    const RETURN_SLOT: bool = false;

    fn stack_pointer(gregs: &[u64]) -> u64 {
        gregs[Self::REG_SP]
    }

    fn instruction_pointer(gregs: &[u64]) -> u64 {
        gregs[Self::REG_PC]
    }

    fn enter_handler(gregs: &mut [u64], call: &HandlerCall) {
        gregs[Self::REG_A0..Self::REG_A0 + 3].copy_from_slice(&call.args);
        gregs[Self::REG_RA] = call.restorer_ip;
        gregs[Self::REG_PC] = call.handler_ip;
        gregs[Self::REG_SP] = call.stack_pointer;
    }
}

#[cfg(target_arch = "aarch64")]
pub type NativeAbi = Aarch64;
#[cfg(target_arch = "riscv64")]
pub type NativeAbi = Riscv64;
#[cfg(not(any(target_arch = "aarch64", target_arch = "riscv64")))]
pub type NativeAbi = X86_64;

// ─── Frame layout ───────────────────────────────────────────────────

/// uc_flags, uc_link, uc_stack { ss_sp, ss_flags, ss_size }
const UCONTEXT_HEADER_WORDS: usize = 5;
/// 1024-bit `sigset_t`.
const SIGMASK_WORDS: usize = 16;
const SIGINFO_WORDS: usize = core::mem::size_of::<SigInfo>() / 8;

/// Byte offsets inside a signal frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameLayout {
    pub ucontext: usize,
    pub gregs: usize,
    pub fpregs: usize,
    pub sigmask: usize,
    pub info: usize,
    /// Total size, a multiple of 16 bytes.
    pub size: usize,
}

impl FrameLayout {
    pub fn of<A: SignalAbi>() -> Self {
        let mut word = usize::from(A::RETURN_SLOT);
        let ucontext = word;
        word += UCONTEXT_HEADER_WORDS;
        let gregs = word;
        word += A::GREG_COUNT;
        let fpregs = word;
        word += 1;
        let sigmask = word;
        word += SIGMASK_WORDS;
        word += word % 2;
        let info = word;
        word += SIGINFO_WORDS;
        word += word % 2;

        Self {
            ucontext: ucontext * 8,
            gregs: gregs * 8,
            fpregs: fpregs * 8,
            sigmask: sigmask * 8,
            info: info * 8,
            size: word * 8,
        }
    }

    /// Frame address for a frame of `total` bytes below `stack_pointer`.
    ///
    /// `None` if the stack pointer is too close to zero to hold the frame.
    pub fn place<A: SignalAbi>(stack_pointer: u64, total: u64) -> Option<u64> {
        let nsp = stack_pointer.checked_sub(A::RED_ZONE)?;
        (nsp.checked_sub(total)? & !15).checked_sub(A::CALL_MISALIGN)
    }
}

/// Register state saved in a frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SavedContext {
    pub gregs: Vec<u64>,
    /// Signal mask to restore on return.
    pub sigmask: u64,
    /// Address of the SIMD image.
    pub fpregs: u64,
}

/// Serialize a frame. `gregs` must hold `A::GREG_COUNT` words.
pub fn encode_frame<A: SignalAbi>(
    layout: &FrameLayout,
    saved: &SavedContext,
    restorer_ip: u64,
    info: &SigInfo,
) -> Vec<u8> {
    let mut words = vec![0u64; layout.size / 8];
    if A::RETURN_SLOT {
        words[0] = restorer_ip;
    }
    let gregs = layout.gregs / 8;
    words[gregs..gregs + A::GREG_COUNT].copy_from_slice(&saved.gregs[..A::GREG_COUNT]);
    words[layout.fpregs / 8] = saved.fpregs;
    words[layout.sigmask / 8] = saved.sigmask;

    let mut bytes: Vec<u8> = bytemuck::cast_slice(&words).to_vec();
    bytes[layout.info..layout.info + SIGINFO_WORDS * 8].copy_from_slice(bytemuck::bytes_of(info));
    bytes
}

/// Parse a frame written by [`encode_frame`].
pub fn decode_frame<A: SignalAbi>(layout: &FrameLayout, bytes: &[u8]) -> (SavedContext, SigInfo) {
    let words: Vec<u64> = bytemuck::pod_collect_to_vec(&bytes[..layout.size]);
    let gregs = layout.gregs / 8;
    let saved = SavedContext {
        gregs: words[gregs..gregs + A::GREG_COUNT].to_vec(),
        sigmask: words[layout.sigmask / 8],
        fpregs: words[layout.fpregs / 8],
    };
    let info: SigInfo =
        bytemuck::pod_read_unaligned(&bytes[layout.info..layout.info + SIGINFO_WORDS * 8]);
    (saved, info)
}
