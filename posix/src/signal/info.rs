//! Signal payloads and their `siginfo_t` encoding.

use bytemuck::{Pod, Zeroable};

use crate::process::Pid;

/// `si_code` of signals sent by `kill()`.
pub const SI_USER: i32 = 0;
/// `si_code` of POSIX timer expirations.
pub const SI_TIMER: i32 = -2;

/// Source-specific payload carried by a raised signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalInfo {
    /// Raised by a process (kill, SIGCHLD, parent death, job control).
    User { pid: Pid, uid: u32 },
    /// Raised by an expiring timer.
    Timer { timer_id: i32 },
}

impl SignalInfo {
    /// Payload of a signal sent by `pid` on behalf of root.
    pub fn user(pid: Pid) -> Self {
        SignalInfo::User { pid, uid: 0 }
    }

    /// Encode this payload as the platform `siginfo_t`.
    pub fn compile(&self, signal_number: u8) -> SigInfo {
        let mut si = SigInfo::zeroed();
        si.si_signo = i32::from(signal_number);
        match *self {
            SignalInfo::User { pid, uid } => {
                si.si_code = SI_USER;
                si.fields[0] = pid as u32;
                si.fields[1] = uid;
            }
            SignalInfo::Timer { timer_id } => {
                si.si_code = SI_TIMER;
                si.fields[0] = timer_id as u32;
            }
        }
        si
    }
}

/// 64-bit Linux `siginfo_t` (128 bytes).
///
/// The union starts at byte 16; for `SI_USER` it holds `si_pid` then
/// `si_uid`, for `SI_TIMER` it holds `si_timerid`.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct SigInfo {
    pub si_signo: i32,
    pub si_errno: i32,
    pub si_code: i32,
    _pad: i32,
    pub fields: [u32; 28],
}

impl SigInfo {
    pub fn pid(&self) -> Pid {
        self.fields[0] as Pid
    }

    pub fn uid(&self) -> u32 {
        self.fields[1]
    }

    pub fn timer_id(&self) -> i32 {
        self.fields[0] as i32
    }
}

const _: () = assert!(core::mem::size_of::<SigInfo>() == 128);
