//! The resume engine and wait loop: the single entry point that lets the
//! tracee run, the blocking wait with deadline/interrupt escalation, and
//! the register normalization applied after every stop.

use super::{
    is_signal_triggered_by_ptrace_interrupt, ResumeRequest, Task, TicksRequest, WaitRequest,
    MAX_TICKS_REQUEST, UNLIMITED_TICKS_PERIOD,
};
use crate::address_space::BreakpointType;
use crate::kernel_abi::is_sigreturn;
use crate::kernel_metadata::ptrace_req_name;
use crate::kernel_supplement::{
    set_siginfo_fd, PTRACE_EVENT_EXEC, PTRACE_EVENT_EXIT, PTRACE_GETREGS, PTRACE_GETSIGINFO,
    PTRACE_INTERRUPT, PTRACE_SETREGS, POLL_IN,
};
use crate::log::{LogDebug, LogWarn};
use crate::perf_counters::TIME_SLICE_SIGNAL;
use crate::registers::{Registers, X86_CANONICAL_FLAGS, X86_TF_FLAG};
use crate::remote_ptr::RemotePtr;
use crate::sig::Sig;
use crate::task::ptrace::PtraceData;
use crate::ticks::Ticks;
use crate::util::{errno, is_zombie_process, u8_slice, u8_slice_mut};
use crate::wait_status::WaitStatus;
use libc::{itimerval, pid_t, siginfo_t, timeval, EINTR, SIGTRAP, WNOHANG, WSTOPPED, __WALL};
use std::mem::zeroed;

/// The status did_waitpid sees when we synthesize a PTRACE_EVENT_EXIT
/// for a task that died without reporting one.
pub const PTRACE_EXIT_WAIT_STATUS: i32 = ((PTRACE_EVENT_EXIT as i32) << 16) | 0x857f;

/// The SIGALRM handler needs to do nothing except exist: its delivery
/// breaks waitpid out with EINTR.
pub extern "C" fn handle_alarm_signal(_sig: libc::c_int) {}

fn to_timeval(t: f64) -> timeval {
    let tv_sec = t.floor() as libc::time_t;
    let tv_usec = ((t - tv_sec as f64) * 1_000_000.0).floor() as libc::suseconds_t;
    timeval { tv_sec, tv_usec }
}

/// Whether the current stop is a syscall exit whose registers must be
/// normalized. sigreturn-family exits restore registers from the signal
/// frame and must be left alone.
fn is_in_non_sigreturn_exit_syscall(t: &Task) -> bool {
    if !t.wait_status.is_syscall() {
        return false;
    }
    let arch = t.registers.arch();
    !is_sigreturn(t.registers.original_syscallno() as i32, arch)
}

/// Normalize the registers the way the kernel's syscall paths leave them
/// nondeterministic:
///   - x86-64: 'syscall' copies RFLAGS to R11 (clear TF there) and the
///     return address to RCX (force -1); EFLAGS to the canonical value.
///   - x86: SYSENTER mangles EFLAGS nondeterministically under VMware;
///     force the canonical value.
fn fixup_syscall_registers(registers: &mut Registers) {
    match registers.arch() {
        crate::kernel_abi::SupportedArch::X64 => {
            let r11 = registers.r11();
            registers.set_r11(r11 & !X86_TF_FLAG);
            registers.set_cx(usize::MAX);
            registers.set_flags(X86_CANONICAL_FLAGS);
        }
        crate::kernel_abi::SupportedArch::X86 => {
            registers.set_flags(X86_CANONICAL_FLAGS);
        }
    }
}

impl Task {
    /// Flush any lazily modified registers back into the tracee.
    pub fn flush_regs(&mut self) {
        if self.registers_dirty {
            ed_assert!(self, self.is_stopped);
            let ptrace_regs = self.registers.get_ptrace();
            self.ptrace_if_alive(
                PTRACE_SETREGS,
                RemotePtr::null(),
                PtraceData::ReadFrom(u8_slice(&ptrace_regs)),
            );
            self.registers_dirty = false;
        }
    }

    /// Resume execution `how`, delivering `sig` if given. With
    /// ResumeWait, block until the next stop is committed. All tracee
    /// execution goes through here.
    pub fn resume_execution(
        &mut self,
        how: ResumeRequest,
        wait_how: WaitRequest,
        tick_period: TicksRequest,
        sig: Option<Sig>,
    ) {
        // Always reprogramming the counter on ticked resumes, and always
        // to a nonzero period, keeps counting behavior identical between
        // recording and replay.
        match tick_period {
            TicksRequest::ResumeNoTicks => (),
            TicksRequest::ResumeUnlimitedTicks => {
                self.hpc.reset(UNLIMITED_TICKS_PERIOD);
            }
            TicksRequest::ResumeWithTicksRequest(period) => {
                ed_assert!(self, period <= MAX_TICKS_REQUEST);
                self.hpc.reset(std::cmp::max(1, period));
            }
        }

        log!(
            LogDebug,
            "resuming execution of {} with {}{} tick_period {:?}",
            self.tid,
            ptrace_req_name(how as u32),
            match sig {
                Some(s) => format!(", signal {}", s),
                None => String::new(),
            },
            tick_period
        );
        self.address_of_last_execution_resume = self.ip();
        self.how_last_execution_resumed = how;
        self.set_debug_status(0);

        self.flush_regs();

        let mut wait_ret: pid_t = 0;
        if self.session().is_recording() {
            // A stopped task can be woken by a SIGKILL and advance to
            // its PTRACE_EVENT_EXIT stop just before we send the
            // continuation request, in which case the continuation would
            // let it run straight to exit and we would never get to
            // clean up robust futexes etc. Probe for that with a
            // non-blocking waitpid. The race is only narrowed, not
            // closed: the SIGKILL can still land between this waitpid
            // and the ptrace below.
            let mut raw_status: i32 = 0;
            wait_ret =
                unsafe { libc::waitpid(self.tid, &mut raw_status, WNOHANG | __WALL | WSTOPPED) };
            ed_assert!(
                self,
                wait_ret >= 0,
                "waitpid({}, NOHANG) failed with {}",
                self.tid,
                wait_ret
            );
            let status = WaitStatus::new(raw_status);
            if wait_ret == self.tid {
                // Some SIGKILLed children don't even report the exit
                // event; both shapes are expected here.
                ed_assert!(
                    self,
                    status.ptrace_event() == Some(PTRACE_EVENT_EXIT)
                        || status.fatal_sig() == Some(libc::SIGKILL),
                    "got {}",
                    status
                );
            } else {
                ed_assert!(
                    self,
                    wait_ret == 0,
                    "waitpid({}, NOHANG) failed with {}",
                    self.tid,
                    wait_ret
                );
            }
        }

        if wait_ret == self.tid {
            // wait() will see this and report the ptrace-exit event.
            log!(LogDebug, "Task {} exited unexpectedly", self.tid);
            self.detected_unexpected_exit = true;
        } else {
            match sig {
                None => {
                    self.ptrace_if_alive(how as u32, RemotePtr::null(), PtraceData::None);
                }
                Some(sig) => {
                    self.ptrace_if_alive(
                        how as u32,
                        RemotePtr::null(),
                        PtraceData::ReadWord(sig.as_raw() as usize),
                    );
                }
            }
        }

        self.is_stopped = false;
        self.extra_registers_known = false;
        if wait_how == WaitRequest::ResumeWait {
            self.wait(None);
        }
    }

    /// Block until the tracee reaches a new ptrace-stop, then commit it
    /// via did_waitpid. Only a recording session may pass a deadline;
    /// when it elapses, a SIGALRM breaks waitpid out and the tracee is
    /// PTRACE_INTERRUPTed.
    pub fn wait(&mut self, interrupt_after_elapsed: Option<f64>) {
        log!(LogDebug, "going into blocking waitpid({}) ...", self.tid);
        ed_assert!(self, !self.unstable, "Don't wait for unstable tasks");
        ed_assert!(
            self,
            self.session().is_recording() || interrupt_after_elapsed.is_none()
        );

        if self.detected_unexpected_exit {
            log!(
                LogDebug,
                "Unexpected (SIGKILL) exit was detected; reporting it now"
            );
            self.detected_unexpected_exit = false;
            self.did_waitpid(WaitStatus::new(PTRACE_EXIT_WAIT_STATUS), None);
            return;
        }

        let mut status: i32 = 0;
        let mut sent_wait_interrupt = false;
        let mut ret: pid_t;
        loop {
            if let Some(elapsed) = interrupt_after_elapsed {
                let timer = itimerval {
                    it_interval: timeval {
                        tv_sec: 0,
                        tv_usec: 0,
                    },
                    it_value: to_timeval(elapsed),
                };
                unsafe { libc::setitimer(libc::ITIMER_REAL, &timer, std::ptr::null_mut()) };
            }
            ret = unsafe { libc::waitpid(self.tid, &mut status, __WALL) };
            if interrupt_after_elapsed.is_some() {
                let timer: itimerval = unsafe { zeroed() };
                unsafe { libc::setitimer(libc::ITIMER_REAL, &timer, std::ptr::null_mut()) };
            }
            if ret >= 0 || errno() != EINTR {
                // waitpid was not interrupted by the alarm.
                break;
            }

            if is_zombie_process(self.real_tgid()) {
                // The process is dead. Stop waiting on it now or we
                // might block forever: the waitpid does not always
                // return for zombie group leaders.
                // XXX this could leave unreaped zombies lying around.
                status = PTRACE_EXIT_WAIT_STATUS;
                ret = self.tid;
                break;
            }

            if !sent_wait_interrupt {
                self.ptrace_if_alive(PTRACE_INTERRUPT, RemotePtr::null(), PtraceData::None);
                sent_wait_interrupt = true;
            }
        }

        if ret >= 0 && !WaitStatus::new(status).is_stopped() {
            // A non-stopping status should only ever follow a
            // PTRACE_EXIT_EVENT we processed, and then we'd have killed
            // the task rather than wait again. Rare kernel bugs skip the
            // exit event; paper over them by synthesizing it.
            ed_assert!(
                self,
                !self.seen_ptrace_exit_event,
                "A PTRACE_EXIT_EVENT was observed for this task, but somehow forgotten"
            );
            status = PTRACE_EXIT_WAIT_STATUS;
        }

        log!(
            LogDebug,
            "  waitpid({}) returns {}; status {:#x}",
            self.tid,
            ret,
            status
        );
        ed_assert!(
            self,
            self.tid == ret,
            "waitpid({}) failed with {}",
            self.tid,
            ret
        );

        let wstatus = WaitStatus::new(status);
        // If some other ptrace-stop raced with our PTRACE_INTERRUPT, let
        // the other event win: we only want to interrupt tracees stuck
        // in userspace. A plain interrupt stop is converted into a
        // synthetic time-slice-expired trap so the upper layer treats it
        // as an ordinary scheduling event.
        if sent_wait_interrupt
            && wstatus
                .group_stop_sig()
                .map_or(false, is_signal_triggered_by_ptrace_interrupt)
        {
            log!(LogWarn, "Forced to PTRACE_INTERRUPT tracee");
            if self.session().is_recording() {
                self.session().expire_timeslice();
            }
            let forged_status = WaitStatus::for_stop_sig(TIME_SLICE_SIGNAL);
            let mut si: siginfo_t = unsafe { zeroed() };
            si.si_signo = TIME_SLICE_SIGNAL;
            si.si_code = POLL_IN;
            set_siginfo_fd(&mut si, self.hpc.ticks_interrupt_fd());
            self.did_waitpid(forged_status, Some(&si));
            return;
        }

        if sent_wait_interrupt {
            log!(LogWarn, "  PTRACE_INTERRUPT raced with another event {:#x}", status);
        }
        self.did_waitpid(wstatus, None);
    }

    /// Non-blocking wait: commit a pending stop if there is one.
    pub fn try_wait(&mut self) -> bool {
        let mut status: i32 = 0;
        let ret = unsafe { libc::waitpid(self.tid, &mut status, WNOHANG | __WALL | WSTOPPED) };
        log!(
            LogDebug,
            "waitpid({}, NOHANG) returns {}, status {:#x}",
            self.tid,
            ret,
            status
        );
        ed_assert!(
            self,
            ret >= 0,
            "waitpid({}, NOHANG) failed with {}",
            self.tid,
            ret
        );
        if ret == self.tid {
            self.did_waitpid(WaitStatus::new(status), None);
            return true;
        }
        false
    }

    /// Commit a wait status: account ticks, refresh the register cache,
    /// capture the siginfo, and apply every post-stop register fixup.
    /// Call this whenever a waitpid returned activity for this task.
    pub fn did_waitpid(&mut self, mut status: WaitStatus, override_siginfo: Option<&siginfo_t>) {
        // Stop the counter ASAP so nothing we do to the stopped tracee
        // generates spurious ticks.
        let more_ticks: Ticks = self.hpc.read_ticks();
        self.hpc.stop_counting();
        self.ticks += more_ticks;
        self.session().accumulate_ticks_processed(more_ticks);

        log!(LogDebug, "  (refreshing register cache)");
        let original_syscallno = self.registers.original_syscallno();
        // Skip reading registers immediately after a PTRACE_EVENT_EXEC:
        // the architecture may just have changed and the cache doesn't
        // know the new one yet.
        if status.ptrace_event() != Some(PTRACE_EVENT_EXEC) {
            let mut ptrace_regs: crate::registers::X64UserRegs = Default::default();
            if self.ptrace_if_alive(
                PTRACE_GETREGS,
                RemotePtr::null(),
                PtraceData::WriteInto(u8_slice_mut(&mut ptrace_regs)),
            ) {
                self.registers.set_from_ptrace(&ptrace_regs);
                self.registers_dirty = false;
            } else {
                log!(LogDebug, "Unexpected process death for {}", self.tid);
                status = WaitStatus::new(PTRACE_EXIT_WAIT_STATUS);
            }
        }
        if status.stop_sig().is_some() {
            match override_siginfo {
                Some(si) => self.pending_siginfo = *si,
                None => {
                    let mut local_siginfo: siginfo_t = unsafe { zeroed() };
                    if self.ptrace_if_alive(
                        PTRACE_GETSIGINFO,
                        RemotePtr::null(),
                        PtraceData::WriteInto(u8_slice_mut(&mut local_siginfo)),
                    ) {
                        self.pending_siginfo = local_siginfo;
                    } else {
                        log!(LogDebug, "Unexpected process death for {}", self.tid);
                        status = WaitStatus::new(PTRACE_EXIT_WAIT_STATUS);
                    }
                }
            }
        }

        self.is_stopped = true;
        self.wait_status = status;
        if status.ptrace_event() == Some(PTRACE_EVENT_EXIT) {
            self.seen_ptrace_exit_event = true;
        }

        let mut need_to_set_regs = false;
        // The TF bit must never leak into recorded state.
        if self.registers.singlestep_flag() {
            self.registers.clear_singlestep_flag();
            need_to_set_regs = true;
        }

        // When we resume at a breakpoint and it fires immediately, the
        // kernel resets the original syscall number to -1. Undo that so
        // resume-at-a-breakpoint is observably a no-op; the replay
        // timeline depends on it.
        if self
            .vm()
            .get_breakpoint_type_at_addr(self.address_of_last_execution_resume)
            != BreakpointType::BkptNone
            && self.stop_sig() == Some(SIGTRAP)
            && self.ptrace_event().is_none()
        {
            let arch = self.arch();
            ed_assert!(
                self,
                self.ip()
                    == self
                        .address_of_last_execution_resume
                        .increment_by_bkpt_insn_length(arch)
            );
            ed_assert_eq!(self, more_ticks, 0);
            self.registers.set_original_syscallno(original_syscallno);
            need_to_set_regs = true;
        }

        if is_in_non_sigreturn_exit_syscall(self) {
            fixup_syscall_registers(&mut self.registers);
            need_to_set_regs = true;
        }

        if need_to_set_regs {
            self.registers_dirty = true;
            self.flush_regs();
        }
    }

    /// Drive the tracee to its next syscall trap, skipping seccomp
    /// events. Used by the remote-syscall facility, so signals observed
    /// here cannot be processed; ignorable ones are skipped, anything
    /// else is deferred with a warning for the layer above.
    pub fn advance_syscall(&mut self) {
        loop {
            self.resume_execution(
                ResumeRequest::ResumeSyscall,
                WaitRequest::ResumeWait,
                TicksRequest::ResumeNoTicks,
                None,
            );
            if self.is_ptrace_seccomp_event() {
                continue;
            }
            if self.is_dying() {
                return;
            }
            ed_assert!(self, self.ptrace_event().is_none());
            match self.pending_sig() {
                None => break,
                Some(sig) => {
                    if is_ignored_while_advancing(sig) {
                        continue;
                    }
                    log!(
                        LogWarn,
                        "Pending signal {} interrupted a remote syscall; suppressing it",
                        crate::kernel_metadata::signal_name(sig)
                    );
                }
            }
        }
    }

    /// Finish a syscall whose entry the tracer emulated: single-step
    /// past the syscall instruction, then put the registers back. The
    /// instruction after the syscall will execute twice, so unless it is
    /// known idempotent a guard breakpoint makes the extra execution
    /// side-effect free.
    pub fn finish_emulated_syscall(&mut self) {
        let r = *self.regs_ref();
        let ip = r.ip();
        let known_idempotent_insn_after_syscall = self.is_in_retrace_page();

        if !known_idempotent_insn_after_syscall {
            let ok = self
                .vm()
                .add_breakpoint(self, ip, crate::address_space::BreakpointType::BkptInternal);
            ed_assert!(self, ok, "Can't add breakpoint???");
        }
        // ResumeNoTicks: the instruction following a syscall insn could
        // be a conditional branch, and counting it would skew ticks.
        self.resume_execution(
            ResumeRequest::ResumeSysemuSinglestep,
            WaitRequest::ResumeWait,
            TicksRequest::ResumeNoTicks,
            None,
        );
        if !known_idempotent_insn_after_syscall {
            // The breakpoint raises SIGTRAP; replay-ignored signals can
            // show up too.
            ed_assert!(
                self,
                self.pending_sig() == Some(SIGTRAP)
                    || self
                        .pending_sig()
                        .map_or(false, is_ignored_while_advancing),
                "PENDING SIG IS {:?}",
                self.pending_sig()
            );
            self.vm()
                .remove_breakpoint(self, ip, crate::address_space::BreakpointType::BkptInternal);
        }
        self.set_regs(&r);
        self.flush_regs();
        self.wait_status = WaitStatus::default();
    }

    /// Abandon the syscall the tracee has entered so it can be
    /// restarted later: hijack it into a harmless gettid, drive that to
    /// completion, and rewind the registers to just before the original
    /// trap.
    pub fn exit_syscall_and_prepare_restart(&mut self) {
        let mut r = *self.regs_ref();
        let syscallno = r.original_syscallno();
        let arch = r.arch();
        r.set_original_syscallno(crate::kernel_abi::syscall_number_for_gettid(arch) as isize);
        self.set_regs(&r);
        // This exits the hijacked gettid; now the tracee is ready to
        // restart the original call.
        self.advance_syscall();

        r.set_original_syscallno(-1);
        r.set_syscallno(syscallno);
        r.set_ip(r.ip() - crate::kernel_abi::syscall_instruction_length(arch));
        self.set_regs(&r);
        self.flush_regs();
    }
}

/// Signals that can safely be skipped while the tracer is driving the
/// tracee through injected or emulated syscalls.
fn is_ignored_while_advancing(sig: i32) -> bool {
    matches!(sig, libc::SIGCHLD | libc::SIGWINCH) || sig == TIME_SLICE_SIGNAL
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel_abi::{x64, x86, SupportedArch};
    use crate::kernel_supplement::PTRACE_EVENT_EXIT;
    use std::rc::Weak;

    #[test]
    fn syscall_exit_register_normalization_x64() {
        let mut regs = Registers::new(SupportedArch::X64);
        regs.set_r11(X86_CANONICAL_FLAGS | X86_TF_FLAG);
        regs.set_cx(0x7f00_1234_5678);
        regs.set_flags(0x346);
        fixup_syscall_registers(&mut regs);
        assert_eq!(0, regs.r11() & X86_TF_FLAG);
        assert_eq!(usize::MAX, regs.cx());
        assert_eq!(X86_CANONICAL_FLAGS, regs.flags());
    }

    #[test]
    fn syscall_exit_register_normalization_x86() {
        let mut regs = Registers::new(SupportedArch::X86);
        regs.set_flags(0x200346);
        fixup_syscall_registers(&mut regs);
        assert_eq!(X86_CANONICAL_FLAGS, regs.flags() & 0xfff);
    }

    #[test]
    fn sigreturn_exits_are_left_alone() {
        let mut t = crate::task::Task::new(Weak::new(), 1, 1, 1, SupportedArch::X64);
        t.wait_status = WaitStatus::for_syscall();
        t.registers.set_original_syscallno(x64::MMAP as isize);
        assert!(is_in_non_sigreturn_exit_syscall(&t));
        t.registers
            .set_original_syscallno(x64::RT_SIGRETURN as isize);
        assert!(!is_in_non_sigreturn_exit_syscall(&t));
        // Not a syscall stop at all: nothing to normalize.
        t.wait_status = WaitStatus::for_stop_sig(libc::SIGUSR1);
        t.registers.set_original_syscallno(x64::MMAP as isize);
        assert!(!is_in_non_sigreturn_exit_syscall(&t));

        let mut t32 = crate::task::Task::new(Weak::new(), 1, 1, 2, SupportedArch::X86);
        t32.wait_status = WaitStatus::for_syscall();
        t32.registers
            .set_original_syscallno(x86::SIGRETURN as isize);
        assert!(!is_in_non_sigreturn_exit_syscall(&t32));
    }

    #[test]
    fn synthesized_exit_status_decodes_as_exit_event() {
        let status = WaitStatus::new(PTRACE_EXIT_WAIT_STATUS);
        assert_eq!(Some(PTRACE_EVENT_EXIT), status.ptrace_event());
        assert!(status.is_stopped());
    }
}
