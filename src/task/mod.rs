//! The per-tracee control object. A Task drives one traced thread
//! through its execution one ptrace-stop at a time and maintains the
//! tracer-side shadow of that thread's observable kernel state.
//!
//! The implementation is split by concern:
//!   - `ptrace`: the typed ptrace wrappers (fallible / fatal / alive-checking)
//!   - `memory`: remote memory I/O via the mem fd with ptrace fallback
//!   - `resume`: resume_execution, the wait loop, and post-stop register
//!     normalization
//!   - `debug_regs`: hardware watchpoint programming and trap decoding
//!   - `syscallbuf`: setup and teardown of the shared syscall buffer
//!   - `exit_hooks`: shadow-state updates after syscall exits
//!   - `lifecycle`: spawn, clone, exec rebinding, destruction

mod debug_regs;
mod exit_hooks;
mod lifecycle;
mod memory;
mod ptrace;
mod resume;
mod syscallbuf;

pub use debug_regs::TrapReasons;
pub use memory::{read_mem, read_val_mem, write_mem, write_val_mem};
pub use ptrace::PtraceData;

use crate::address_space::AddressSpaceSharedPtr;
use crate::extra_registers::ExtraRegisters;
use crate::fd_table::FdTableSharedPtr;
use crate::kernel_abi::{user_desc, SupportedArch};
use crate::kernel_supplement::{PTRACE_EVENT_CLONE, PTRACE_EVENT_FORK, PTRACE_EVENT_VFORK};
use crate::log::{LogDebug, LogWarn};
use crate::perf_counters::PerfCounters;
use crate::preload_interface::syscallbuf_hdr;
use crate::registers::{Registers, X86_CANONICAL_FLAGS, X86_TF_FLAG};
use crate::remote_code_ptr::RemoteCodePtr;
use crate::remote_ptr::{RemotePtr, Void};
use crate::scoped_fd::ScopedFd;
use crate::session::{SessionSharedPtr, SessionSharedWeakPtr};
use crate::thread_group::ThreadGroupSharedPtr;
use crate::ticks::Ticks;
use crate::trace_stream::FrameTime;
use crate::wait_status::WaitStatus;
use bitflags::bitflags;
use libc::{pid_t, siginfo_t, ENOSYS};
use nix::fcntl::OFlag;
use nix::sys::stat::{lstat, stat, FileStat};
use std::cell::RefCell;
use std::ffi::{OsStr, OsString};
use std::mem::zeroed;
use std::rc::{Rc, Weak};

pub type TaskSharedPtr = Rc<RefCell<Task>>;
pub type TaskSharedWeakPtr = Weak<RefCell<Task>>;

use crate::kernel_supplement::{
    PTRACE_CONT, PTRACE_SINGLESTEP, PTRACE_SYSCALL, PTRACE_SYSEMU, PTRACE_SYSEMU_SINGLESTEP,
};

/// Ways to resume execution; see the ptrace manual for the semantics.
/// A dedicated type rather than raw requests, because PTRACE_SYSEMU* are
/// not part of the official API and confusing the arguments would be
/// easy.
#[repr(u32)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ResumeRequest {
    ResumeCont = PTRACE_CONT,
    ResumeSinglestep = PTRACE_SINGLESTEP,
    ResumeSyscall = PTRACE_SYSCALL,
    ResumeSysemu = PTRACE_SYSEMU,
    ResumeSysemuSinglestep = PTRACE_SYSEMU_SINGLESTEP,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum WaitRequest {
    /// Block in waitpid until the tracee reaches its next stop.
    ResumeWait,
    /// Return immediately after issuing the continuation.
    ResumeNonblocking,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TicksRequest {
    /// Don't reprogram the counter; used for throwaway instructions
    /// where a tick would pollute the count.
    ResumeNoTicks,
    ResumeUnlimitedTicks,
    /// Interrupt after this many retired conditional branches. Must be
    /// at most MAX_TICKS_REQUEST; zero is rounded up to one.
    ResumeWithTicksRequest(Ticks),
}

pub const MAX_TICKS_REQUEST: Ticks = 2_000_000_000;

/// The cap used when the caller wants "unlimited": large enough to never
/// fire during a timeslice, small enough for every PMU.
pub const UNLIMITED_TICKS_PERIOD: Ticks = 0xffff_ffff;

bitflags! {
    /// How a clone child relates to its parent. `empty()` is fork
    /// semantics: copies of everything, new thread group.
    pub struct CloneFlags: u32 {
        /// Child shares the parent's thread group.
        const CLONE_SHARE_THREAD_GROUP = 1 << 0;
        /// Child shares the parent's address space.
        const CLONE_SHARE_VM = 1 << 1;
        /// Child shares the parent's fd table.
        const CLONE_SHARE_FILES = 1 << 2;
        /// Kernel clears and notifies the tid futex on task exit.
        const CLONE_CLEARTID = 1 << 3;
        /// The clone's `tls` argument carries a thread area to install.
        const CLONE_SET_TLS = 1 << 4;
    }
}

bitflags! {
    pub struct WriteFlags: u32 {
        /// This write plants or removes a breakpoint; watchpoint value
        /// tracking must ignore it.
        const IS_BREAKPOINT_RELATED = 1 << 0;
    }
}

pub fn clone_flags_to_task_flags(flags_arg: usize) -> CloneFlags {
    let mut flags = CloneFlags::empty();
    if flags_arg & libc::CLONE_THREAD as usize != 0 {
        flags |= CloneFlags::CLONE_SHARE_THREAD_GROUP;
    }
    if flags_arg & libc::CLONE_VM as usize != 0 {
        flags |= CloneFlags::CLONE_SHARE_VM;
    }
    if flags_arg & libc::CLONE_FILES as usize != 0 {
        flags |= CloneFlags::CLONE_SHARE_FILES;
    }
    if flags_arg & libc::CLONE_CHILD_CLEARTID as usize != 0 {
        flags |= CloneFlags::CLONE_CLEARTID;
    }
    if flags_arg & libc::CLONE_SETTLS as usize != 0 {
        flags |= CloneFlags::CLONE_SET_TLS;
    }
    flags
}

pub fn is_singlestep_resume(how: ResumeRequest) -> bool {
    how == ResumeRequest::ResumeSinglestep || how == ResumeRequest::ResumeSysemuSinglestep
}

pub fn is_signal_triggered_by_ptrace_interrupt(sig: i32) -> bool {
    // The docs only promise SIGTRAP, but SIGSTOP and 0 are both seen in
    // the wild at interrupt stops.
    matches!(sig, libc::SIGTRAP | libc::SIGSTOP | 0)
}

/// Everything needed to recreate an identical task in another session
/// (checkpointing).
#[derive(Clone)]
pub struct CapturedState {
    pub ticks: Ticks,
    pub regs: Registers,
    pub extra_regs: ExtraRegisters,
    pub prname: OsString,
    pub thread_areas: Vec<user_desc>,
    pub syscallbuf_child: RemotePtr<syscallbuf_hdr>,
    pub syscallbuf_data: Vec<u8>,
    pub num_syscallbuf_bytes: usize,
    pub scratch_ptr: RemotePtr<Void>,
    pub scratch_size: usize,
    pub top_of_stack: RemotePtr<Void>,
    pub rec_tid: pid_t,
    pub serial: u32,
    pub desched_fd_child: i32,
    pub wait_status: WaitStatus,
}

pub struct Task {
    /// True when any assumption about the status of this task has been
    /// invalidated and must be re-established with a waitpid(). Only
    /// applies to dying tasks, usually after a group-wide fatal signal.
    pub unstable: bool,
    /// exit() or exit_group() with one task was called, so the exit can
    /// be treated as stable.
    pub stable_exit: bool,

    /// Address and size of the private scratch page used to redirect
    /// may-block syscall outparams.
    pub scratch_ptr: RemotePtr<Void>,
    pub scratch_size: usize,

    /// Perf fd in the tracee that generates desched events; -1 until the
    /// syscall buffer is initialized.
    pub desched_fd_child: i32,

    pub hpc: PerfCounters,

    /// The real tid of the tracee.
    pub tid: pid_t,
    /// The tid the tracee had when recorded; equals `tid` while
    /// recording.
    pub rec_tid: pid_t,

    /// Tracee-side pointer to the shared syscall buffer; null until
    /// init_buffers.
    pub syscallbuf_child: RemotePtr<syscallbuf_hdr>,
    /// Tracer-side mapping of the same memory; null until init_buffers.
    pub syscallbuf_hdr: *mut syscallbuf_hdr,
    pub num_syscallbuf_bytes: usize,
    /// Tracee-side array telling the preload library which fds must not
    /// be buffered.
    pub syscallbuf_fds_disabled_child: RemotePtr<u8>,
    /// Breakpoint table advertised by the preload library.
    pub stopping_breakpoint_table: RemoteCodePtr,
    pub stopping_breakpoint_table_entry_size: usize,

    serial: u32,
    pub(crate) as_: Option<AddressSpaceSharedPtr>,
    pub(crate) fds: Option<FdTableSharedPtr>,
    pub(crate) tg: Option<ThreadGroupSharedPtr>,
    pub(crate) prname: OsString,
    pub(crate) ticks: Ticks,
    /// When `is_stopped`, the tracee's registers.
    pub(crate) registers: Registers,
    pub(crate) address_of_last_execution_resume: RemoteCodePtr,
    pub(crate) how_last_execution_resumed: ResumeRequest,
    pub(crate) is_stopped: bool,
    /// A PTRACE_EVENT_EXIT raced with a resume issued while stopped
    /// (SIGKILL); the next wait must synthesize the exit stop.
    pub(crate) detected_unexpected_exit: bool,
    pub(crate) registers_dirty: bool,
    pub(crate) extra_registers: ExtraRegisters,
    pub(crate) extra_registers_known: bool,
    session_: SessionSharedWeakPtr,
    /// Thread areas installed by set_thread_area or CLONE_SETTLS, keyed
    /// by entry_number; last write wins.
    pub(crate) thread_areas_: Vec<user_desc>,
    /// The `stack` argument passed to clone(); for threads, the top of
    /// the user-allocated stack.
    pub(crate) top_of_stack: RemotePtr<Void>,
    pub(crate) wait_status: WaitStatus,
    pub(crate) pending_siginfo: siginfo_t,
    pub(crate) seen_ptrace_exit_event: bool,
    pub(crate) weak_self: TaskSharedWeakPtr,
}

impl Task {
    pub(crate) fn new(
        session: SessionSharedWeakPtr,
        tid: pid_t,
        rec_tid: pid_t,
        serial: u32,
        arch: SupportedArch,
    ) -> Task {
        let adjusted_rec_tid = if rec_tid > 0 { rec_tid } else { tid };
        Task {
            unstable: false,
            stable_exit: false,
            scratch_ptr: RemotePtr::null(),
            scratch_size: 0,
            desched_fd_child: -1,
            hpc: PerfCounters::new(tid),
            tid,
            rec_tid: adjusted_rec_tid,
            syscallbuf_child: RemotePtr::null(),
            syscallbuf_hdr: std::ptr::null_mut(),
            num_syscallbuf_bytes: 0,
            syscallbuf_fds_disabled_child: RemotePtr::null(),
            stopping_breakpoint_table: RemoteCodePtr::null(),
            stopping_breakpoint_table_entry_size: 0,
            serial,
            as_: None,
            fds: None,
            tg: None,
            prname: "???".into(),
            ticks: 0,
            registers: Registers::new(arch),
            address_of_last_execution_resume: RemoteCodePtr::null(),
            how_last_execution_resumed: ResumeRequest::ResumeCont,
            is_stopped: false,
            detected_unexpected_exit: false,
            registers_dirty: false,
            extra_registers: ExtraRegisters::new(arch),
            extra_registers_known: false,
            session_: session,
            thread_areas_: Vec::new(),
            top_of_stack: RemotePtr::null(),
            wait_status: WaitStatus::default(),
            pending_siginfo: unsafe { zeroed() },
            seen_ptrace_exit_event: false,
            weak_self: Weak::new(),
        }
    }

    pub fn weak_self_ptr(&self) -> TaskSharedWeakPtr {
        self.weak_self.clone()
    }

    pub fn serial(&self) -> u32 {
        self.serial
    }

    pub fn session(&self) -> SessionSharedPtr {
        self.session_.upgrade().unwrap()
    }

    pub fn vm(&self) -> AddressSpaceSharedPtr {
        self.as_.as_ref().unwrap().clone()
    }

    pub fn fd_table(&self) -> FdTableSharedPtr {
        self.fds.as_ref().unwrap().clone()
    }

    pub fn thread_group(&self) -> ThreadGroupSharedPtr {
        self.tg.as_ref().unwrap().clone()
    }

    /// The recorded thread-group id.
    pub fn tgid(&self) -> pid_t {
        self.thread_group().tgid
    }

    /// The live kernel thread-group id.
    pub fn real_tgid(&self) -> pid_t {
        // During construction the thread group may not be bound yet; the
        // task itself is the leader then.
        match &self.tg {
            Some(tg) => tg.real_tgid,
            None => self.tid,
        }
    }

    pub fn arch(&self) -> SupportedArch {
        self.registers.arch()
    }

    pub fn ip(&self) -> RemoteCodePtr {
        self.registers.ip()
    }

    pub fn is_running(&self) -> bool {
        !self.is_stopped
    }

    pub fn is_dying(&self) -> bool {
        self.seen_ptrace_exit_event || self.detected_unexpected_exit
    }

    /// Total ticks ever executed by this task.
    pub fn tick_count(&self) -> Ticks {
        self.ticks
    }

    /// Called after the first exec, when the session first reaches a
    /// consistent state; flush anything affected by how the child was
    /// set up.
    pub fn flush_inconsistent_state(&mut self) {
        self.ticks = 0;
    }

    pub fn regs_ref(&self) -> &Registers {
        ed_assert!(self, self.is_stopped);
        &self.registers
    }

    pub fn regs_mut(&mut self) -> &mut Registers {
        ed_assert!(self, self.is_stopped);
        self.registers_dirty = true;
        &mut self.registers
    }

    /// Set the registers. Lazy: the flush happens before the next
    /// resume, or explicitly via flush_regs().
    pub fn set_regs(&mut self, regs: &Registers) {
        ed_assert!(self, self.is_stopped);
        self.registers = *regs;
        self.registers_dirty = true;
    }

    /// The extended register bank, refreshed from the tracee on first
    /// use after every stop.
    pub fn extra_regs(&mut self) -> &ExtraRegisters {
        if !self.extra_registers_known {
            ed_assert!(self, self.is_stopped);
            let layout = crate::util::xsave_native_layout();
            let arch = self.arch();
            if layout.supported {
                let mut data = vec![0u8; layout.area_size];
                let mut vec = libc::iovec {
                    iov_base: data.as_mut_ptr() as *mut libc::c_void,
                    iov_len: data.len(),
                };
                self.xptrace(
                    crate::kernel_supplement::PTRACE_GETREGSET,
                    RemotePtr::new(crate::kernel_supplement::NT_X86_XSTATE as usize),
                    PtraceData::WriteInto(crate::util::u8_slice_mut(&mut vec)),
                );
                data.truncate(vec.iov_len);
                self.extra_registers
                    .set_to_raw_data(crate::extra_registers::Format::XSave, data);
            } else {
                // No XSAVE: fall back to the legacy fp area, which is
                // layout-compatible with the start of an XSAVE area.
                let (request, size) = match arch {
                    SupportedArch::X86 => (
                        crate::kernel_supplement::PTRACE_GETFPXREGS,
                        512usize,
                    ),
                    SupportedArch::X64 => (
                        crate::kernel_supplement::PTRACE_GETFPREGS,
                        512usize,
                    ),
                };
                let mut data = vec![0u8; size];
                self.xptrace(
                    request,
                    RemotePtr::null(),
                    PtraceData::WriteInto(&mut data),
                );
                self.extra_registers
                    .set_to_raw_data(crate::extra_registers::Format::XSave, data);
            }
            self.extra_registers.set_arch(arch);
            self.extra_registers_known = true;
        }
        &self.extra_registers
    }

    pub fn set_extra_regs(&mut self, regs: &ExtraRegisters) {
        ed_assert!(self, !regs.is_empty(), "Trying to set empty ExtraRegisters");
        self.extra_registers = regs.clone();
        self.extra_registers_known = true;

        let layout = crate::util::xsave_native_layout();
        match self.extra_registers.format() {
            crate::extra_registers::Format::XSave => {
                if layout.supported {
                    let mut vec = libc::iovec {
                        iov_base: self.extra_registers.data_mut().as_mut_ptr()
                            as *mut libc::c_void,
                        iov_len: self.extra_registers.data().len(),
                    };
                    self.ptrace_if_alive(
                        crate::kernel_supplement::PTRACE_SETREGSET,
                        RemotePtr::new(crate::kernel_supplement::NT_X86_XSTATE as usize),
                        PtraceData::ReadFrom(crate::util::u8_slice(&vec)),
                    );
                } else {
                    let request = match self.arch() {
                        SupportedArch::X86 => crate::kernel_supplement::PTRACE_SETFPXREGS,
                        SupportedArch::X64 => crate::kernel_supplement::PTRACE_SETFPREGS,
                    };
                    let data: Vec<u8> = self.extra_registers.data().to_vec();
                    self.ptrace_if_alive(request, RemotePtr::null(), PtraceData::ReadFrom(&data));
                }
            }
            crate::extra_registers::Format::None => {
                ed_assert!(self, false, "Unexpected ExtraRegisters format");
            }
        }
    }

    pub fn status(&self) -> WaitStatus {
        self.wait_status
    }

    pub fn set_status(&mut self, status: WaitStatus) {
        self.wait_status = status;
    }

    pub fn clear_wait_status(&mut self) {
        self.wait_status = WaitStatus::default();
    }

    pub fn ptrace_event(&self) -> Option<u32> {
        self.wait_status.ptrace_event()
    }

    pub fn stop_sig(&self) -> Option<i32> {
        self.wait_status.stop_sig()
    }

    /// The signal pending at the current stop, with syscall-stop and
    /// ptrace-event SIGTRAPs filtered out.
    pub fn pending_sig(&self) -> Option<i32> {
        if self.wait_status.get() == 0 {
            return None;
        }
        match self.wait_status.ptrace_signal() {
            None => None,
            Some(libc::SIGTRAP) => {
                if self.wait_status.is_syscall() || self.ptrace_event().is_some() {
                    None
                } else {
                    Some(libc::SIGTRAP)
                }
            }
            Some(sig) if sig == 0 => None,
            Some(sig) => Some(sig),
        }
    }

    /// The siginfo at the current signal-stop. Not meaningful unless
    /// this is actually a signal stop.
    pub fn get_siginfo(&self) -> &siginfo_t {
        &self.pending_siginfo
    }

    pub fn is_ptrace_seccomp_event(&self) -> bool {
        matches!(
            self.ptrace_event(),
            Some(crate::kernel_supplement::PTRACE_EVENT_SECCOMP)
                | Some(crate::kernel_supplement::PTRACE_EVENT_SECCOMP_OBSOLETE)
        )
    }

    /// The task name, as prctl(PR_GET_NAME) would report it.
    pub fn name(&self) -> &OsStr {
        &self.prname
    }

    pub fn thread_areas(&self) -> &[user_desc] {
        &self.thread_areas_
    }

    /// Upsert a TLS descriptor by entry number.
    pub fn upsert_thread_area(&mut self, desc: user_desc) {
        for t in &mut self.thread_areas_ {
            if t.entry_number == desc.entry_number {
                *t = desc;
                return;
            }
        }
        self.thread_areas_.push(desc);
    }

    /// The tracee completed a set_thread_area(); mirror the descriptor.
    pub fn set_thread_area(&mut self, tls: RemotePtr<user_desc>) {
        let desc = read_val_mem(self, tls, None);
        self.upsert_thread_area(desc);
    }

    /// The tracee completed prctl(PR_SET_NAME); read the 16-byte name
    /// out of its memory.
    pub fn update_prname(&mut self, child_addr: RemotePtr<Void>) {
        use std::os::unix::ffi::OsStrExt;
        let mut bytes = [0u8; 16];
        self.read_bytes_helper(RemotePtr::cast(child_addr), &mut bytes, None);
        bytes[15] = 0;
        let len = bytes.iter().position(|&b| b == 0).unwrap();
        self.prname = OsStr::from_bytes(&bytes[..len]).to_owned();
    }

    /// Whether the IP sits in the retrace stub page.
    pub fn is_in_retrace_page(&self) -> bool {
        let p = self.ip().to_data_ptr::<Void>();
        crate::address_space::AddressSpace::retrace_page_start() <= p
            && p < crate::address_space::AddressSpace::retrace_page_end()
    }

    /// Syscalls have observable side effects on registers. Normalize the
    /// cached registers as if a syscall had just returned; covers kernel
    /// SYSCALL/SYSENTER entry-path nondeterminism and virtualized
    /// environments.
    pub fn canonicalize_regs(&mut self, syscall_arch: SupportedArch) {
        ed_assert!(self, self.is_stopped);

        match self.registers.arch() {
            SupportedArch::X64 => {
                match syscall_arch {
                    SupportedArch::X86 => {
                        // The int $0x80 compatibility path clears r8-r11.
                        self.registers.set_r8(0);
                        self.registers.set_r9(0);
                        self.registers.set_r10(0);
                        self.registers.set_r11(0);
                    }
                    SupportedArch::X64 => {
                        // 'syscall' copies RFLAGS into R11 on entry; if we
                        // single-stepped into the instruction TF is set
                        // there, and whether we single-stepped must not be
                        // observable. Clearing only TF (rather than all of
                        // R11) keeps the operation idempotent.
                        let r11 = self.registers.r11();
                        self.registers.set_r11(r11 & !X86_TF_FLAG);
                        // 'syscall' also copies the return address to RCX,
                        // and the kernel usually resets it to -1 during
                        // syscall execution - but not always. Force -1 so
                        // record and replay can't diverge on it.
                        self.registers.set_cx(usize::MAX);
                    }
                }
                // Failed execve()s have been observed clearing all flags.
                // Reset to the canonical value so everything's consistent.
                self.registers.set_flags(X86_CANONICAL_FLAGS);
            }
            SupportedArch::X86 => {
                // The SYSENTER path modifies EBP and EFLAGS on entry, and
                // under VMware the EFLAGS changes are nondeterministic.
                // Cover that up.
                self.registers.set_flags(X86_CANONICAL_FLAGS);
            }
        }

        self.registers_dirty = true;
    }

    /// Make the cached registers look like a syscall entry just
    /// happened, applying the same normalization recording would see.
    pub fn emulate_syscall_entry(&mut self, regs: &Registers) {
        let mut r = *regs;
        if r.arch() == SupportedArch::X64 {
            let flags = r.flags();
            r.set_r11(flags);
        }
        self.set_regs(&r);
        let arch = r.arch();
        self.canonicalize_regs(arch);
    }

    /// Assuming the IP is just past a breakpoint instruction, back it up
    /// onto the breakpoint.
    pub fn move_ip_before_breakpoint(&mut self) {
        let mut r = *self.regs_ref();
        let arch = self.arch();
        r.set_ip(r.ip().decrement_by_bkpt_insn_length(arch));
        self.set_regs(&r);
    }

    /// Whether the stop is at a clone/fork event, extracting the new
    /// tid. Returns false when the clone needs to be resumed (e.g.
    /// spurious EAGAIN under load).
    pub fn clone_syscall_is_complete(&mut self, new_pid: &mut Option<pid_t>) -> bool {
        if let Some(event) = self.ptrace_event() {
            if event == PTRACE_EVENT_CLONE
                || event == PTRACE_EVENT_FORK
                || event == PTRACE_EVENT_VFORK
            {
                *new_pid = Some(self.get_ptrace_eventmsg_pid());
                return true;
            }
            ed_assert!(self, false, "Unexpected ptrace event {}", event);
        }

        // EAGAIN from fork under load; the caller retries. ENOMEM is
        // propagated the same way.
        let result = self.regs_ref().syscall_result_signed();
        ed_assert!(
            self,
            self.regs_ref().syscall_may_restart()
                || result == -(ENOSYS as isize)
                || result == -(libc::EAGAIN as isize)
                || result == -(libc::ENOMEM as isize),
            "Unexpected task status {} (syscall result {})",
            self.status(),
            result
        );
        false
    }

    pub fn trace_time(&self) -> FrameTime {
        self.session().trace_stream().time()
    }

    pub fn trace_dir(&self) -> OsString {
        self.session().trace_stream().dir().to_owned()
    }

    // --- /proc/<tid>/fd helpers ----------------------------------------

    pub fn stat_fd(&self, fd: i32) -> FileStat {
        let path = format!("/proc/{}/fd/{}", self.tid, fd);
        let res = stat(path.as_str());
        ed_assert!(self, res.is_ok());
        res.unwrap()
    }

    pub fn lstat_fd(&self, fd: i32) -> FileStat {
        let path = format!("/proc/{}/fd/{}", self.tid, fd);
        let res = lstat(path.as_str());
        ed_assert!(self, res.is_ok());
        res.unwrap()
    }

    pub fn open_fd(&self, fd: i32, flags: OFlag) -> ScopedFd {
        let path = format!("/proc/{}/fd/{}", self.tid, fd);
        ScopedFd::open_path(path.as_str(), flags)
    }

    pub fn file_name_of_fd(&self, fd: i32) -> OsString {
        let path = format!("/proc/{}/fd/{}", self.tid, fd);
        match nix::fcntl::readlink(path.as_str()) {
            Ok(name) => name,
            Err(_) => OsString::new(),
        }
    }

    /// Dump a short description of the task state for diagnostics.
    pub fn log_state(&self) {
        log!(
            LogDebug,
            "  {:?}(tid:{} rec_tid:{} status:{}{})",
            self.prname,
            self.tid,
            self.rec_tid,
            self.wait_status,
            if self.unstable { " UNSTABLE" } else { "" }
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel_supplement::PTRACE_EVENT_EXIT;

    fn detached_task() -> Task {
        // A task with no session or tracee behind it; good enough for
        // the pure bookkeeping paths.
        Task::new(Weak::new(), 1000, 1000, 1, SupportedArch::X64)
    }

    #[test]
    fn clone_flag_mapping() {
        let flags = clone_flags_to_task_flags(
            (libc::CLONE_VM | libc::CLONE_THREAD | libc::CLONE_FILES | libc::CLONE_SETTLS)
                as usize,
        );
        assert!(flags.contains(CloneFlags::CLONE_SHARE_VM));
        assert!(flags.contains(CloneFlags::CLONE_SHARE_THREAD_GROUP));
        assert!(flags.contains(CloneFlags::CLONE_SHARE_FILES));
        assert!(flags.contains(CloneFlags::CLONE_SET_TLS));
        assert!(!flags.contains(CloneFlags::CLONE_CLEARTID));
        assert_eq!(CloneFlags::empty(), clone_flags_to_task_flags(libc::SIGCHLD as usize));
    }

    #[test]
    fn interrupt_signal_set() {
        assert!(is_signal_triggered_by_ptrace_interrupt(libc::SIGTRAP));
        assert!(is_signal_triggered_by_ptrace_interrupt(libc::SIGSTOP));
        assert!(is_signal_triggered_by_ptrace_interrupt(0));
        assert!(!is_signal_triggered_by_ptrace_interrupt(libc::SIGUSR1));
    }

    #[test]
    fn thread_area_upsert_is_keyed_by_entry_number() {
        let mut t = detached_task();
        t.upsert_thread_area(user_desc {
            entry_number: 12,
            base_addr: 0x1000,
            ..Default::default()
        });
        t.upsert_thread_area(user_desc {
            entry_number: 13,
            base_addr: 0x2000,
            ..Default::default()
        });
        // Last write wins for the same entry.
        t.upsert_thread_area(user_desc {
            entry_number: 12,
            base_addr: 0x3000,
            ..Default::default()
        });
        assert_eq!(2, t.thread_areas().len());
        let entry12 = t
            .thread_areas()
            .iter()
            .find(|d| d.entry_number == 12)
            .unwrap();
        assert_eq!(0x3000, entry12.base_addr);
    }

    #[test]
    fn pending_sig_filters_traps() {
        let mut t = detached_task();
        assert_eq!(None, t.pending_sig());

        t.set_status(WaitStatus::for_stop_sig(libc::SIGUSR1));
        assert_eq!(Some(libc::SIGUSR1), t.pending_sig());

        // A syscall-stop is not a pending signal.
        t.set_status(WaitStatus::for_syscall());
        assert_eq!(None, t.pending_sig());

        // Neither is the SIGTRAP carried by a ptrace event.
        t.set_status(WaitStatus::for_ptrace_event(PTRACE_EVENT_EXIT));
        assert_eq!(None, t.pending_sig());

        t.set_status(WaitStatus::for_stop_sig(libc::SIGTRAP));
        assert_eq!(Some(libc::SIGTRAP), t.pending_sig());
    }

    #[test]
    fn canonicalized_registers_are_deterministic() {
        let mut t = detached_task();
        t.is_stopped = true;
        t.registers.set_flags(X86_CANONICAL_FLAGS | X86_TF_FLAG);
        t.registers.set_r11(0x41414141 | X86_TF_FLAG);
        t.registers.set_cx(0xdeadbeef);
        t.canonicalize_regs(SupportedArch::X64);
        assert_eq!(X86_CANONICAL_FLAGS, t.registers.flags());
        assert_eq!(0, t.registers.r11() & X86_TF_FLAG);
        assert_eq!(usize::MAX, t.registers.cx());
        // Idempotent: a second pass changes nothing.
        let snapshot = t.registers;
        t.canonicalize_regs(SupportedArch::X64);
        assert_eq!(snapshot, t.registers);
    }

    #[test]
    fn dying_flags() {
        let mut t = detached_task();
        assert!(!t.is_dying());
        t.detected_unexpected_exit = true;
        assert!(t.is_dying());
        t.detected_unexpected_exit = false;
        t.seen_ptrace_exit_event = true;
        assert!(t.is_dying());
    }
}

impl Drop for Task {
    fn drop(&mut self) {
        if self.unstable {
            // The zombie may be leaked for the tracer's lifetime;
            // destroy() already skipped the reap.
            log!(LogWarn, "{} dropped while unstable", self.tid);
        }
    }
}
