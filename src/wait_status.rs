use crate::kernel_metadata::{ptrace_event_name, signal_name};
use crate::kernel_supplement::PTRACE_EVENT_STOP;
use libc::{SIGSTOP, SIGTRAP};
use libc::{WEXITSTATUS, WIFEXITED, WIFSIGNALED, WIFSTOPPED, WSTOPSIG, WTERMSIG};
use std::fmt::{self, Debug, Display, Formatter};

/// The broad classification of a waitpid status.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum WaitType {
    /// Task exited normally.
    Exit,
    /// Task exited due to a fatal signal.
    FatalSignal,
    /// Task is in a signal-delivery-stop.
    SignalStop,
    /// Task is in a group-stop. Requires PTRACE_SEIZE, otherwise these
    /// show up as SignalStop.
    GroupStop,
    /// Task is in a syscall-stop (PTRACE_SYSCALL + PTRACE_O_TRACESYSGOOD).
    SyscallStop,
    /// Task is in a PTRACE_EVENT stop other than PTRACE_EVENT_STOP.
    PtraceEvent,
}

/// A waitpid status word, with accessors for every packing the kernel
/// uses. The raw representation is kept so synthesized statuses can be
/// compared against real ones bit for bit.
#[derive(Copy, Clone, Default, Eq, PartialEq)]
pub struct WaitStatus {
    status: i32,
}

impl WaitStatus {
    pub fn new(status: i32) -> WaitStatus {
        WaitStatus { status }
    }

    pub fn get(&self) -> i32 {
        self.status
    }

    pub fn wait_type(&self) -> WaitType {
        if self.exit_code().is_some() {
            return WaitType::Exit;
        }
        if self.fatal_sig().is_some() {
            return WaitType::FatalSignal;
        }
        if self.stop_sig().is_some() {
            return WaitType::SignalStop;
        }
        if self.group_stop_sig().is_some() {
            return WaitType::GroupStop;
        }
        if self.is_syscall() {
            return WaitType::SyscallStop;
        }
        if self.ptrace_event().is_some() {
            return WaitType::PtraceEvent;
        }
        fatal!("Status {:#x} not understood", self.status);
    }

    /// Whether the status reports any kind of ptrace-stop.
    pub fn is_stopped(&self) -> bool {
        WIFSTOPPED(self.status)
    }

    pub fn exit_code(&self) -> Option<i32> {
        if WIFEXITED(self.status) {
            Some(WEXITSTATUS(self.status))
        } else {
            None
        }
    }

    pub fn fatal_sig(&self) -> Option<i32> {
        if WIFSIGNALED(self.status) {
            let sig = WTERMSIG(self.status);
            if sig > 0 {
                return Some(sig);
            }
        }
        None
    }

    /// The stopping signal, for a signal-delivery-stop. A zero signal
    /// (rare, but seen after PTRACE_INTERRUPT) maps to SIGSTOP.
    pub fn stop_sig(&self) -> Option<i32> {
        if !WIFSTOPPED(self.status) || (self.status >> 16) & 0xff != 0 {
            return None;
        }
        let mut sig = WSTOPSIG(self.status);
        if sig == SIGTRAP | 0x80 {
            // A syscall-stop under PTRACE_O_TRACESYSGOOD, not a signal.
            return None;
        }
        sig &= !0x80;
        if sig != 0 {
            Some(sig)
        } else {
            Some(SIGSTOP)
        }
    }

    pub fn group_stop_sig(&self) -> Option<i32> {
        if !WIFSTOPPED(self.status)
            || (self.status >> 16) & 0xff != PTRACE_EVENT_STOP as i32
        {
            return None;
        }
        let sig = WSTOPSIG(self.status) & !0x80;
        if sig != 0 {
            Some(sig)
        } else {
            Some(SIGSTOP)
        }
    }

    pub fn is_syscall(&self) -> bool {
        if self.ptrace_event().is_some() || !WIFSTOPPED(self.status) {
            return false;
        }
        WSTOPSIG(self.status) == SIGTRAP | 0x80
    }

    /// The ptrace event, if any. PTRACE_EVENT_STOP is reported through
    /// `group_stop_sig` instead.
    pub fn ptrace_event(&self) -> Option<u32> {
        let event = ((self.status >> 16) & 0xff) as u32;
        if event == 0 || event == PTRACE_EVENT_STOP {
            None
        } else {
            Some(event)
        }
    }

    /// The signal in any stopped status, with the TRACESYSGOOD bit
    /// stripped, or None for exit statuses.
    pub fn ptrace_signal(&self) -> Option<i32> {
        if WIFSTOPPED(self.status) {
            Some(WSTOPSIG(self.status) & 0x7f)
        } else {
            None
        }
    }

    pub fn for_exit_code(code: i32) -> WaitStatus {
        debug_assert!((0..0x100).contains(&code));
        WaitStatus { status: code << 8 }
    }

    pub fn for_fatal_sig(sig: i32) -> WaitStatus {
        debug_assert!((1..0x80).contains(&sig));
        WaitStatus { status: sig }
    }

    pub fn for_stop_sig(sig: i32) -> WaitStatus {
        debug_assert!((1..0x80).contains(&sig));
        WaitStatus {
            status: (sig << 8) | 0x7f,
        }
    }

    pub fn for_syscall() -> WaitStatus {
        WaitStatus {
            status: (((SIGTRAP | 0x80) << 8) | 0x7f),
        }
    }

    pub fn for_ptrace_event(event: u32) -> WaitStatus {
        debug_assert!((1..0x100).contains(&(event as i32)));
        WaitStatus {
            status: ((event as i32) << 16) | (SIGTRAP << 8) | 0x7f,
        }
    }
}

impl Display for WaitStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.status)?;
        match self.wait_type() {
            WaitType::Exit => write!(f, " (EXIT-{})", self.exit_code().unwrap()),
            WaitType::FatalSignal => {
                write!(f, " (FATAL-{})", signal_name(self.fatal_sig().unwrap()))
            }
            WaitType::SignalStop => write!(f, " (STOP-{})", signal_name(self.stop_sig().unwrap())),
            WaitType::GroupStop => write!(
                f,
                " (GROUP-STOP-{})",
                signal_name(self.group_stop_sig().unwrap())
            ),
            WaitType::SyscallStop => write!(f, " (SYSCALL)"),
            WaitType::PtraceEvent => {
                write!(f, " ({})", ptrace_event_name(self.ptrace_event().unwrap()))
            }
        }
    }
}

impl Debug for WaitStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel_supplement::PTRACE_EVENT_EXIT;

    #[test]
    fn stop_sig_round_trip() {
        let status = WaitStatus::for_stop_sig(libc::SIGUSR1);
        assert_eq!(WaitType::SignalStop, status.wait_type());
        assert_eq!(Some(libc::SIGUSR1), status.stop_sig());
        assert_eq!(None, status.ptrace_event());
        assert_eq!(None, status.exit_code());
    }

    #[test]
    fn ptrace_event_round_trip() {
        let status = WaitStatus::for_ptrace_event(PTRACE_EVENT_EXIT);
        assert_eq!(WaitType::PtraceEvent, status.wait_type());
        assert_eq!(Some(PTRACE_EVENT_EXIT), status.ptrace_event());
        assert_eq!(None, status.stop_sig());
        // The synthesized exit status the wait loop forges must decode
        // as a PTRACE_EVENT_EXIT stop.
        let forged = WaitStatus::new((PTRACE_EVENT_EXIT as i32) << 16 | 0x857f);
        assert_eq!(Some(PTRACE_EVENT_EXIT), forged.ptrace_event());
    }

    #[test]
    fn syscall_stop_is_not_a_signal() {
        let status = WaitStatus::for_syscall();
        assert_eq!(WaitType::SyscallStop, status.wait_type());
        assert!(status.is_syscall());
        assert_eq!(None, status.stop_sig());
    }

    #[test]
    fn group_stop_requires_event_stop_bits() {
        let status = WaitStatus::new(((PTRACE_EVENT_STOP as i32) << 16) | (libc::SIGSTOP << 8) | 0x7f);
        assert_eq!(WaitType::GroupStop, status.wait_type());
        assert_eq!(Some(libc::SIGSTOP), status.group_stop_sig());
        assert_eq!(None, status.stop_sig());
    }

    #[test]
    fn exit_statuses() {
        assert_eq!(Some(0), WaitStatus::for_exit_code(0).exit_code());
        assert_eq!(
            Some(libc::SIGKILL),
            WaitStatus::for_fatal_sig(libc::SIGKILL).fatal_sig()
        );
    }

    #[test]
    fn interrupt_zero_signal_maps_to_sigstop() {
        // Seen via PTRACE_INTERRUPT: stopped status with signal 0.
        let status = WaitStatus::new(0x7f);
        assert_eq!(Some(libc::SIGSTOP), status.stop_sig());
    }
}
