//! Task lifecycle: spawning the root tracee, attaching metadata to
//! clone/fork children, rebinding across exec, checkpoint-style copies
//! into other sessions, and teardown.

use super::{
    clone_flags_to_task_flags, CapturedState, CloneFlags, ResumeRequest, Task, TaskSharedPtr,
    TicksRequest, WaitRequest,
};
use crate::auto_remote_syscalls::{AutoRemoteSyscalls, AutoRestoreMem};
use crate::fd_table::FdTable;
use crate::file_monitor::{MagicSaveDataMonitor, PreserveFileMonitor, StdioMonitor};
use crate::kernel_abi::{
    syscall_number_for_execve, syscall_number_for_prctl, syscall_number_for_set_thread_area,
    Architecture, CloneParameterOrdering, CloneTLSType, SupportedArch, NATIVE_ARCH,
};
use crate::kernel_mapping::KernelMapping;
use crate::kernel_supplement::{PTRACE_GETREGS, PTRACE_O_EXITKILL, PTRACE_O_TRACECLONE,
    PTRACE_O_TRACEEXEC, PTRACE_O_TRACEEXIT, PTRACE_O_TRACEFORK, PTRACE_O_TRACESECCOMP,
    PTRACE_O_TRACESYSGOOD, PTRACE_O_TRACEVFORK, PTRACE_O_TRACEVFORKDONE, PTRACE_DETACH,
    PTRACE_SEIZE,
};
use crate::log::{LogDebug, LogWarn};
use crate::preload_interface::{
    syscallbuf_hdr, RETRACE_MAGIC_SAVE_DATA_FD, RETRACE_RESERVED_ROOT_DIR_FD,
    RETRACE_RESERVED_SOCKET_FD,
};
use crate::registers::X64UserRegs;
use crate::remote_ptr::{RemotePtr, Void};
use crate::scoped_fd::ScopedFd;
use crate::seccomp_filter::SeccompFilter;
use crate::session::{Session, SessionSharedPtr};
use crate::task::ptrace::PtraceData;
use crate::task::write_val_mem;
use crate::util::{errno, set_cpu_affinity, to_cstr_array, to_cstring_array, u8_slice_mut};
use libc::{pid_t, ECHILD, EINVAL, ESRCH, SIGSTOP};
use memoffset::offset_of;
use nix::sys::mman::{MapFlags, ProtFlags};
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::sys::socket::{socketpair, AddressFamily, SockFlag, SockType};
use std::cell::RefCell;
use std::ffi::OsStr;
use std::mem::size_of;
use std::os::unix::ffi::OsStrExt;
use std::rc::Rc;

fn spawned_child_fatal_error(msg: &str) -> ! {
    let err = crate::kernel_metadata::errno_name(errno());
    let full = format!("{} ({})\n", msg, err);
    unsafe {
        libc::write(
            libc::STDERR_FILENO,
            full.as_ptr() as *const libc::c_void,
            full.len(),
        );
        libc::_exit(1);
    }
}

/// Runs in the freshly forked child: cut off every source of
/// nondeterminism the tracee could reach directly, and plant the
/// reserved fds.
fn set_up_process(session: &Session, sock: &ScopedFd) {
    let fd = unsafe {
        libc::open(
            b"/dev/null\0".as_ptr() as *const libc::c_char,
            libc::O_WRONLY | libc::O_CLOEXEC,
        )
    };
    if fd < 0 {
        spawned_child_fatal_error("error opening /dev/null");
    }
    if RETRACE_MAGIC_SAVE_DATA_FD != unsafe { libc::dup2(fd, RETRACE_MAGIC_SAVE_DATA_FD) } {
        spawned_child_fatal_error("error duping to RETRACE_MAGIC_SAVE_DATA_FD");
    }

    let fd = unsafe {
        libc::open(
            b"/\0".as_ptr() as *const libc::c_char,
            libc::O_PATH | libc::O_DIRECTORY | libc::O_CLOEXEC,
        )
    };
    if fd < 0 {
        spawned_child_fatal_error("error opening root directory");
    }
    if RETRACE_RESERVED_ROOT_DIR_FD != unsafe { libc::dup2(fd, RETRACE_RESERVED_ROOT_DIR_FD) } {
        spawned_child_fatal_error("error duping to RETRACE_RESERVED_ROOT_DIR_FD");
    }

    // dup2 clears O_CLOEXEC: the socket must survive the exec so fds can
    // be passed back for the program's whole lifetime.
    if RETRACE_RESERVED_SOCKET_FD != unsafe { libc::dup2(sock.as_raw(), RETRACE_RESERVED_SOCKET_FD) }
    {
        spawned_child_fatal_error("error duping to RETRACE_RESERVED_SOCKET_FD");
    }

    if session.is_replaying() {
        // The replayed tasks and their descendants silently reap any
        // terminating children.
        unsafe { libc::signal(libc::SIGCHLD, libc::SIG_IGN) };

        // If the tracer dies, don't let orphaned replay tracees drag the
        // system down.
        if unsafe { libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL) } < 0 {
            spawned_child_fatal_error("Couldn't set parent-death signal");
        }

        // A separate session keeps the terminal from signaling the
        // replayed processes (SIGINT/SIGTSTP/SIGWINCH).
        unsafe { libc::setsid() };
    }

    // rdtsc must trap so the tick stream stays deterministic.
    if unsafe { libc::prctl(libc::PR_SET_TSC, libc::PR_TSC_SIGSEGV, 0, 0, 0) } < 0 {
        spawned_child_fatal_error("error setting up prctl(PR_SET_TSC)");
    }

    if unsafe { libc::prctl(libc::PR_SET_NO_NEW_PRIVS, 1, 0, 0, 0) } < 0 {
        spawned_child_fatal_error(
            "prctl(NO_NEW_PRIVS) failed, SECCOMP_FILTER is not available: your kernel is too old",
        );
    }
}

/// Must run in the tracee after the tracer has seized it: a seccomp
/// filter without a ptracer in place would kill the process.
fn set_up_seccomp_filter(session: &Session) {
    let mut filter = SeccompFilter::new();
    if session.is_recording() && session.use_syscall_buffer() {
        for ip in [
            crate::address_space::AddressSpace::ip_in_untraced_syscall(),
            crate::address_space::AddressSpace::ip_in_untraced_replayed_syscall(),
            crate::address_space::AddressSpace::ip_in_privileged_untraced_syscall(),
        ] {
            debug_assert_eq!(ip.as_usize(), ip.as_usize() as u32 as usize);
            filter.allow_syscalls_from_callsite(ip);
        }
    }
    // Everything else traps. Installing the filter even when buffering
    // is disabled keeps ptrace-event behavior identical whether or not
    // the tracee installs its own filters.
    filter.trace();

    if filter.install().is_err() {
        spawned_child_fatal_error(
            "prctl(SECCOMP) failed, SECCOMP_FILTER is not available: your kernel is too old",
        );
    }
    // Anything that happens from this point on gets filtered!
}

fn setup_fd_table(fds: &FdTable) {
    fds.add_monitor(
        libc::STDOUT_FILENO,
        Rc::new(RefCell::new(StdioMonitor::new(libc::STDOUT_FILENO))),
    );
    fds.add_monitor(
        libc::STDERR_FILENO,
        Rc::new(RefCell::new(StdioMonitor::new(libc::STDERR_FILENO))),
    );
    fds.add_monitor(
        RETRACE_MAGIC_SAVE_DATA_FD,
        Rc::new(RefCell::new(MagicSaveDataMonitor::new())),
    );
    fds.add_monitor(
        RETRACE_RESERVED_ROOT_DIR_FD,
        Rc::new(RefCell::new(PreserveFileMonitor::new())),
    );
    fds.add_monitor(
        RETRACE_RESERVED_SOCKET_FD,
        Rc::new(RefCell::new(PreserveFileMonitor::new())),
    );
}

impl Task {
    /// Fork and exec the initial tracee, drive it to its first SIGSTOP,
    /// and return its Task. The child raises SIGSTOP once its fds and
    /// prctls are arranged, installs the seccomp filter after we have
    /// seized it, retires a few branches so the tick counter provably
    /// works, and execs.
    pub fn spawn(session: &SessionSharedPtr, rec_tid: pid_t) -> TaskSharedPtr {
        debug_assert_eq!(session.task_count(), 0);

        let trace = session.trace_stream();
        if let Some(cpu) = trace
            .bound_to_cpu()
            .or(crate::flags::Flags::get().bind_cpu)
        {
            // Bind the tracer to the tracee's CPU too; helper threads
            // already exist, tracees don't yet, and sharing the CPU
            // helps performance.
            set_cpu_affinity(cpu);
        }

        let (sock_parent, sock_child) = match socketpair(
            AddressFamily::Unix,
            SockType::Stream,
            None,
            SockFlag::SOCK_CLOEXEC,
        ) {
            Ok((a, b)) => (ScopedFd::from_raw(a), ScopedFd::from_raw(b)),
            Err(_) => fatal!("socketpair() failed"),
        };

        let exe = trace.initial_exe().to_owned();
        let argv = to_cstring_array(trace.initial_argv());
        let envp = to_cstring_array(trace.initial_envp());
        let cwd = trace.initial_cwd().to_owned();

        let mut tid: pid_t;
        loop {
            tid = unsafe { libc::fork() };
            // fork() can fail with EAGAIN due to temporary load issues.
            if tid >= 0 || errno() != libc::EAGAIN {
                break;
            }
        }
        if tid < 0 {
            fatal!("Failed to fork for {:?}", exe);
        }

        if tid == 0 {
            // Resolve relative paths the same way the recording did.
            let cwd_c = std::ffi::CString::new(cwd.as_bytes()).unwrap();
            unsafe { libc::chdir(cwd_c.as_ptr()) };
            set_up_process(session, &sock_child);
            // After the SIGSTOP handshake replay emulates almost all
            // syscalls, so everything above must run for real first.
            unsafe { libc::kill(libc::getpid(), SIGSTOP) };

            // This code must run after the tracer has taken control.
            set_up_seccomp_filter(session);

            // Retire some conditional branches so the tick counter is
            // provably nonzero at the first trap.
            let start = (rand::random::<u32>() % 5) as i32;
            let mut sum: i32 = 0;
            for i in start..start + 5 {
                sum += i;
            }
            unsafe {
                libc::syscall(
                    libc::SYS_write,
                    -1i32,
                    &sum as *const i32,
                    size_of::<i32>(),
                );
            }

            let exe_c = std::ffi::CString::new(exe.as_bytes()).unwrap();
            let argv_ptrs: Vec<*const libc::c_char> = to_cstr_array(&argv)
                .iter()
                .map(|c| c.as_ptr())
                .chain(std::iter::once(std::ptr::null()))
                .collect();
            let envp_ptrs: Vec<*const libc::c_char> = to_cstr_array(&envp)
                .iter()
                .map(|c| c.as_ptr())
                .chain(std::iter::once(std::ptr::null()))
                .collect();
            unsafe {
                libc::execvpe(exe_c.as_ptr(), argv_ptrs.as_ptr(), envp_ptrs.as_ptr());
                // That failed; try the file directly.
                libc::execve(exe_c.as_ptr(), argv_ptrs.as_ptr(), envp_ptrs.as_ptr());
            }
            match errno() {
                libc::ENOENT => spawned_child_fatal_error("execve failed: file not found"),
                _ => spawned_child_fatal_error("execve failed"),
            }
        }

        // The SIGALRM handler's only job is to make waitpid return
        // EINTR; no SA_RESTART.
        let sa = SigAction::new(
            SigHandler::Handler(crate::task::resume::handle_alarm_signal),
            SaFlags::empty(),
            SigSet::empty(),
        );
        unsafe { sigaction(Signal::SIGALRM, &sa) }.unwrap();

        // Keep the window between fork and SEIZE minimal: until
        // PTRACE_O_EXITKILL is set, a tracer crash leaks the stopped
        // child.
        let mut options = PTRACE_O_TRACESYSGOOD
            | PTRACE_O_TRACEFORK
            | PTRACE_O_TRACEVFORK
            | PTRACE_O_TRACECLONE
            | PTRACE_O_TRACEEXEC
            | PTRACE_O_TRACEVFORKDONE
            | PTRACE_O_TRACEEXIT
            | PTRACE_O_EXITKILL
            | PTRACE_O_TRACESECCOMP;
        crate::util::clear_errno();
        let mut ret = unsafe {
            libc::ptrace(
                PTRACE_SEIZE,
                tid,
                std::ptr::null_mut::<libc::c_void>(),
                options as usize,
            )
        };
        if ret < 0 && errno() == EINVAL {
            // PTRACE_O_EXITKILL appeared in 3.8; it only hardens
            // cleanup, so tolerate its absence.
            options &= !PTRACE_O_EXITKILL;
            ret = unsafe {
                libc::ptrace(
                    PTRACE_SEIZE,
                    tid,
                    std::ptr::null_mut::<libc::c_void>(),
                    options as usize,
                )
            };
        }
        if ret != 0 {
            // The child may have died already, but its exit code is
            // unreaped so the kill cannot hit a recycled pid.
            let err = errno();
            unsafe { libc::kill(tid, libc::SIGKILL) };
            fatal!("PTRACE_SEIZE failed for tid {} with errno {}", tid, err);
        }

        session.set_tracee_socket(sock_parent);

        let t = Task::new(
            session.weak_self_ptr(),
            tid,
            rec_tid,
            session.next_task_serial(),
            NATIVE_ARCH,
        );
        let rc_t: TaskSharedPtr = Rc::new(RefCell::new(t));
        let weak = Rc::downgrade(&rc_t);
        rc_t.borrow_mut().weak_self = weak.clone();

        {
            let mut t = rc_t.borrow_mut();
            let tg = session.create_tg(tid, t.rec_tid);
            tg.insert_task(weak.clone());
            t.tg = Some(tg);
            let vm = session.create_vm(&t, Some(trace.initial_exe()), 0);
            t.as_ = Some(vm);
            let fds = FdTable::create();
            fds.insert_task(weak.clone());
            setup_fd_table(&fds);
            t.fds = Some(fds);
            if session.use_syscall_buffer() {
                t.vm().set_syscallbuf_enabled(true);
            }
        }
        session.on_create(rc_t.clone());

        // PTRACE_SEIZE is racy by design: nothing stops the tracee
        // before its first stop. We depend on starting from a known
        // location, so run the child forward until the SIGSTOP it
        // raised at the handshake point is observed.
        {
            let mut t = rc_t.borrow_mut();
            loop {
                t.wait(None);
                if t.stop_sig() == Some(SIGSTOP) {
                    break;
                }
                t.resume_execution(
                    ResumeRequest::ResumeCont,
                    WaitRequest::ResumeNonblocking,
                    TicksRequest::ResumeUnlimitedTicks,
                    None,
                );
            }
            t.clear_wait_status();
            t.open_mem_fd();
        }

        rc_t
    }

    /// Attach Task metadata to a fresh clone/fork child the kernel just
    /// reported. Shares or copies each aggregate per `flags`, waits for
    /// the child's initial stop, and for fork children in the same
    /// session unshares the CoW-inherited syscall buffer.
    pub fn clone_task(
        &mut self,
        flags: CloneFlags,
        stack: RemotePtr<Void>,
        tls: RemotePtr<Void>,
        _cleartid_addr: RemotePtr<i32>,
        new_tid: pid_t,
        new_rec_tid: Option<pid_t>,
        new_serial: u32,
        other_session: Option<SessionSharedPtr>,
    ) -> TaskSharedPtr {
        let same_session = other_session.is_none();
        let sess = other_session.unwrap_or_else(|| self.session());

        let child = Task::new(
            Rc::downgrade(&sess),
            new_tid,
            new_rec_tid.unwrap_or(0),
            new_serial,
            self.arch(),
        );
        let rc_child: TaskSharedPtr = Rc::new(RefCell::new(child));
        let weak = Rc::downgrade(&rc_child);
        rc_child.borrow_mut().weak_self = weak.clone();

        {
            let mut child = rc_child.borrow_mut();

            if flags.contains(CloneFlags::CLONE_SHARE_THREAD_GROUP) {
                child.tg = self.tg.clone();
            } else {
                child.tg = Some(sess.create_tg(new_tid, child.rec_tid));
            }
            child.thread_group().insert_task(weak.clone());

            if flags.contains(CloneFlags::CLONE_SHARE_VM) {
                child.as_ = self.as_.clone();
                if !stack.is_null() {
                    let last_stack_byte = stack - 1usize;
                    if let Some(mapping) = child.vm().mapping_of(last_stack_byte) {
                        if !mapping.is_heap() {
                            log!(
                                LogDebug,
                                "mapping stack for {} at {}",
                                new_tid,
                                mapping
                            );
                            child.vm().map(
                                mapping.start(),
                                mapping.size(),
                                mapping.prot(),
                                mapping.flags(),
                                mapping.file_offset_bytes(),
                                OsStr::new("[stack]"),
                                mapping.device(),
                                mapping.inode(),
                            );
                        }
                    }
                }
            } else {
                child.as_ = Some(sess.clone_vm(&child, self.as_.as_ref().unwrap()));
            }

            child.stopping_breakpoint_table = self.stopping_breakpoint_table;
            child.stopping_breakpoint_table_entry_size =
                self.stopping_breakpoint_table_entry_size;
            child.syscallbuf_fds_disabled_child = self.syscallbuf_fds_disabled_child;

            // FdTable is either shared or copied, so the contents of
            // syscallbuf_fds_disabled_child stay valid either way.
            if flags.contains(CloneFlags::CLONE_SHARE_FILES) {
                child.fds = self.fds.clone();
            } else {
                child.fds = Some(self.fd_table().clone_table());
            }
            child.fd_table().insert_task(weak.clone());

            child.top_of_stack = stack;
            // Clone children, thread and fork both, inherit the parent
            // prname.
            child.prname = self.prname.clone();

            // wait() before anything that might need ptrace access to
            // the child's memory.
            child.wait(None);

            child.open_mem_fd_if_needed();
            child.thread_areas_ = self.thread_areas_.clone();
            if flags.contains(CloneFlags::CLONE_SET_TLS) {
                let arch = child.arch();
                arch_function!(set_thread_area_from_clone_arch, arch, &mut child, tls);
            }

            child.vm().insert_task(weak.clone());
        }
        sess.on_create(rc_child.clone());

        if !flags.contains(CloneFlags::CLONE_SHARE_VM) && same_session {
            {
                let mut child = rc_child.borrow_mut();
                self.vm().did_fork_into(&mut child);
            }

            if !self.syscallbuf_child.is_null() {
                let syscallbuf_child = self.syscallbuf_child;
                let num_syscallbuf_bytes = self.num_syscallbuf_bytes;
                let mut child = rc_child.borrow_mut();
                // The fork CoW-inherited the parent's syscallbuf
                // mapping, but parent and child must not share it.
                // Remap the child's range as fresh anonymous memory and
                // lock the buffer so the child's preload library
                // reinitializes before using it. When the child never
                // runs a pthread_atfork handler (vfork, raw SYS_fork)
                // the buffer stays locked forever; rare and harmless.
                let prot = ProtFlags::PROT_READ | ProtFlags::PROT_WRITE;
                let map_flags =
                    MapFlags::MAP_PRIVATE | MapFlags::MAP_FIXED | MapFlags::MAP_ANONYMOUS;
                {
                    let mut remote = AutoRemoteSyscalls::new(&mut child);
                    remote.infallible_mmap_syscall(
                        RemotePtr::cast(syscallbuf_child),
                        num_syscallbuf_bytes,
                        prot,
                        map_flags,
                        -1,
                        0,
                    );
                }
                child.vm().map(
                    RemotePtr::cast(syscallbuf_child),
                    num_syscallbuf_bytes,
                    prot,
                    map_flags,
                    0,
                    OsStr::new(""),
                    KernelMapping::NO_DEVICE,
                    KernelMapping::NO_INODE,
                );
                let locked_addr: RemotePtr<u8> = RemotePtr::new(
                    syscallbuf_child.as_usize() + offset_of!(syscallbuf_hdr, locked),
                );
                write_val_mem(&mut child, locked_addr, &1u8, None);
            }
        }

        rc_child
    }

    /// The tracee has just performed a successful execve(); rebind to a
    /// fresh address space and fd table, and update the register cache
    /// for the possibly-changed architecture.
    pub fn post_exec(&mut self, a: SupportedArch, exe_file: &OsStr) {
        // From here on the replay address-space layout will (should!)
        // match the recording.
        self.session().post_exec();

        let weak = self.weak_self_ptr();
        self.vm().erase_task(&weak);
        self.fd_table().erase_task(&weak);

        self.registers.set_arch(a);
        self.extra_registers.set_arch(a);
        self.extra_registers.reset();
        self.extra_registers_known = false;

        // Read registers now that the architecture is known.
        let mut ptrace_regs: X64UserRegs = Default::default();
        self.ptrace_if_alive(
            PTRACE_GETREGS,
            RemotePtr::null(),
            PtraceData::WriteInto(u8_slice_mut(&mut ptrace_regs)),
        );
        self.registers.set_from_ptrace(&ptrace_regs);
        // Rewrite the syscall number to execve *for the new arch*:
        // otherwise the old arch's number gets interpreted as whatever
        // it means in the new arch, with hilarious results.
        self.registers
            .set_original_syscallno(syscall_number_for_execve(a) as isize);
        self.registers_dirty = true;
        self.flush_regs();

        self.syscallbuf_child = RemotePtr::null();
        self.syscallbuf_fds_disabled_child = RemotePtr::null();
        self.num_syscallbuf_bytes = 0;
        self.stopping_breakpoint_table = crate::remote_code_ptr::RemoteCodePtr::null();
        self.stopping_breakpoint_table_entry_size = 0;
        self.thread_areas_.clear();
        self.thread_group().set_execed();

        let exec_count = self.vm().uid().exec_count + 1;
        let session = self.session();
        let new_vm = session.create_vm(self, Some(exe_file), exec_count);
        if session.use_syscall_buffer() {
            new_vm.set_syscallbuf_enabled(true);
        }
        self.as_ = Some(new_vm);
        // Barely documented, but the kernel unshares the fd table on
        // exec.
        let new_fds = self.fd_table().clone_table();
        new_fds.insert_task(weak);
        self.fds = Some(new_fds);

        self.prname = prname_from_exe_image(exe_file).to_owned();
    }

    /// The execve() syscall has fully exited; remote syscalls are safe
    /// again.
    pub fn post_exec_syscall(&mut self) {
        let arch = self.arch();
        self.canonicalize_regs(arch);
        let vm = self.vm();
        vm.post_exec_syscall(self);
    }

    pub fn execed(&self) -> bool {
        self.thread_group().execed()
    }

    /// Detach from the tracee and tear the Task down. For the last task
    /// of a thread group in a non-recording session, reap the zombie so
    /// it doesn't accumulate.
    pub fn destroy(&mut self) {
        log!(
            LogDebug,
            "task {} (rec: {}) is dying ...",
            self.tid,
            self.rec_tid
        );

        // The mem fd must stay valid: futex-wait operations during
        // detach still need it after PTRACE_DETACH.
        ed_assert!(self, self.vm().mem_fd_is_open());

        self.fallible_ptrace(PTRACE_DETACH, RemotePtr::null(), PtraceData::None);

        if self.unstable {
            log!(
                LogWarn,
                "{} is unstable; not blocking on its termination",
                self.tid
            );
            // Will probably leak a zombie for the tracer's lifetime;
            // waiting risks hanging forever.
        } else {
            ed_assert!(self, self.seen_ptrace_exit_event);

            if self.thread_group().task_set_is_empty() && !self.session().is_recording() {
                // Reap the zombie.
                let ret = unsafe {
                    libc::waitpid(self.thread_group().real_tgid, std::ptr::null_mut(), libc::__WALL)
                };
                if ret == -1 {
                    ed_assert!(self, errno() == ECHILD || errno() == ESRCH);
                } else {
                    ed_assert_eq!(self, ret, self.thread_group().real_tgid);
                }
            }
        }

        self.destroy_local_buffers();

        let weak = self.weak_self_ptr();
        let tid = self.tid;
        self.thread_group().erase_task(&weak);
        self.vm().erase_task(&weak);
        self.fd_table().erase_task(&weak);
        self.session().on_destroy(tid);

        log!(LogDebug, "  dead");
    }

    // --- checkpoint-style duplication ----------------------------------

    /// Everything needed to make an identical task elsewhere.
    pub fn capture_state(&mut self) -> CapturedState {
        let mut syscallbuf_data = Vec::new();
        if !self.syscallbuf_hdr.is_null() {
            let mut data_size = self.syscallbuf_data_size();
            let locked = unsafe { (*self.syscallbuf_hdr).locked };
            if locked != 0 {
                // An incomplete record may sit beyond num_rec_bytes and
                // its size is unknowable; capture the whole buffer.
                data_size = self.num_syscallbuf_bytes;
            }
            syscallbuf_data = vec![0u8; data_size];
            unsafe {
                std::ptr::copy_nonoverlapping(
                    self.syscallbuf_hdr as *const u8,
                    syscallbuf_data.as_mut_ptr(),
                    data_size,
                );
            }
        }
        CapturedState {
            ticks: self.ticks,
            regs: *self.regs_ref(),
            extra_regs: self.extra_regs().clone(),
            prname: self.prname.clone(),
            thread_areas: self.thread_areas_.clone(),
            syscallbuf_child: self.syscallbuf_child,
            syscallbuf_data,
            num_syscallbuf_bytes: self.num_syscallbuf_bytes,
            scratch_ptr: self.scratch_ptr,
            scratch_size: self.scratch_size,
            top_of_stack: self.top_of_stack,
            rec_tid: self.rec_tid,
            serial: self.serial,
            desched_fd_child: self.desched_fd_child,
            wait_status: self.wait_status,
        }
    }

    /// Make this task an identical copy of the captured one in every way
    /// relevant to replay. This task must have been created by
    /// os_fork_into/os_clone_into.
    pub fn copy_state(&mut self, state: &CapturedState) {
        self.set_regs(&state.regs);
        self.set_extra_regs(&state.extra_regs);
        {
            let mut remote = AutoRemoteSyscalls::new(self);
            let arch = remote.arch();
            {
                let mut prname: [u8; 16] = [0; 16];
                let bytes = state.prname.as_bytes();
                let len = bytes.len().min(15);
                prname[..len].copy_from_slice(&bytes[..len]);
                let mut remote_prname = AutoRestoreMem::push_bytes(&mut remote, &prname);
                let addr = remote_prname.get().unwrap();
                log!(LogDebug, "    setting name to {:?}", state.prname);
                remote_prname.infallible_syscall(
                    syscall_number_for_prctl(arch),
                    &[libc::PR_SET_NAME as usize, addr.as_usize()],
                );
                remote_prname.task_mut().update_prname(addr);
            }

            copy_tls(state, &mut remote);
            remote.task_mut().thread_areas_ = state.thread_areas.clone();

            ed_assert!(
                remote.task(),
                remote.task().syscallbuf_child.is_null(),
                "Syscallbuf should not already be initialized in clone"
            );
            if !state.syscallbuf_child.is_null() {
                // The syscallbuf is a shared segment, so the fork didn't
                // copy it usefully: unmap the inherited view, create a
                // fresh segment, and map it in both processes at the
                // same place.
                remote.task_mut().num_syscallbuf_bytes = state.num_syscallbuf_bytes;
                remote.task_mut().desched_fd_child = state.desched_fd_child;

                crate::task::syscallbuf::init_syscall_buffer(
                    &mut remote,
                    RemotePtr::cast(state.syscallbuf_child),
                );
                ed_assert_eq!(
                    remote.task(),
                    state.syscallbuf_child,
                    remote.task().syscallbuf_child
                );
                // Copy the old contents so consistency checks line up.
                unsafe {
                    std::ptr::copy_nonoverlapping(
                        state.syscallbuf_data.as_ptr(),
                        remote.task().syscallbuf_hdr as *mut u8,
                        state.syscallbuf_data.len(),
                    );
                }
            }
        }
        // The scratch buffer is a private mapping; the CoW copy made by
        // forking the address space has exactly the semantics we want.
        self.scratch_ptr = state.scratch_ptr;
        self.scratch_size = state.scratch_size;

        // Whatever the source's last wait status was is what ours would
        // have been.
        self.wait_status = state.wait_status;
        self.ticks = state.ticks;
    }

    /// Fork this task into `session` at the OS level and return the
    /// child's Task.
    pub fn os_fork_into(&mut self, session: SessionSharedPtr) -> TaskSharedPtr {
        let rec_tid = self.rec_tid;
        let serial = self.serial;
        let child;
        {
            let mut remote = AutoRemoteSyscalls::new(self);
            child = os_clone(
                &mut remote,
                Some(session),
                rec_tid,
                serial,
                // The CLEARTID futex setup is done later in copy_state;
                // SETTID flags are unnecessary because the fork copies
                // the earlier setup with the address space.
                libc::SIGCHLD as usize,
                RemotePtr::null(),
                RemotePtr::null(),
                RemotePtr::null(),
                RemotePtr::null(),
            );
            // The fork child inherited our register fudging, so undo it
            // there too even though it never made a syscall itself.
            remote.restore_state_to(&mut child.borrow_mut());
        }
        child
    }

    /// Clone a thread into `task_leader`'s process to recreate the
    /// captured task while restoring a checkpoint.
    pub fn os_clone_into(
        state: &CapturedState,
        remote: &mut AutoRemoteSyscalls,
    ) -> TaskSharedPtr {
        os_clone(
            remote,
            None,
            state.rec_tid,
            state.serial,
            // The SIGHAND/SYSVSEM flags are technically unnecessary
            // (those are emulated in the tracee) but glibc uses them,
            // and matching glibc stays clear of kernel bugs. CLONE_SETTLS
            // is handled later in copy_state.
            (libc::CLONE_VM
                | libc::CLONE_FS
                | libc::CLONE_FILES
                | libc::CLONE_SIGHAND
                | libc::CLONE_THREAD
                | libc::CLONE_SYSVSEM) as usize,
            state.top_of_stack,
            RemotePtr::null(),
            RemotePtr::null(),
            RemotePtr::null(),
        )
    }
}

fn prname_from_exe_image(exe_image: &OsStr) -> &OsStr {
    let bytes = exe_image.as_bytes();
    debug_assert!(!bytes.is_empty());
    let pos = bytes.iter().rposition(|&b| b == b'/').map_or(0, |p| p + 1);
    OsStr::from_bytes(&bytes[pos..])
}

fn set_thread_area_from_clone_arch<Arch: Architecture>(t: &mut Task, tls: RemotePtr<Void>) {
    if Arch::CLONE_TLS_TYPE == CloneTLSType::UserDescPointer {
        t.set_thread_area(RemotePtr::cast(tls));
    }
}

fn copy_tls_arch<Arch: Architecture>(state: &CapturedState, remote: &mut AutoRemoteSyscalls) {
    if Arch::CLONE_TLS_TYPE != CloneTLSType::UserDescPointer {
        return;
    }
    let arch = remote.arch();
    for area in &state.thread_areas {
        let mut remote_tls =
            AutoRestoreMem::push_bytes(remote, crate::util::u8_slice(area));
        let addr = remote_tls.get().unwrap();
        log!(LogDebug, "    setting tls {}", addr);
        remote_tls.infallible_syscall(
            syscall_number_for_set_thread_area(arch),
            &[addr.as_usize()],
        );
    }
}

fn copy_tls(state: &CapturedState, remote: &mut AutoRemoteSyscalls) {
    let arch = remote.arch();
    arch_function!(copy_tls_arch, arch, state, remote)
}

fn perform_remote_clone_arch<Arch: Architecture>(
    remote: &mut AutoRemoteSyscalls,
    base_flags: usize,
    stack: RemotePtr<Void>,
    ptid: RemotePtr<i32>,
    tls: RemotePtr<Void>,
    ctid: RemotePtr<i32>,
) -> isize {
    match Arch::CLONE_PARAMETER_ORDERING {
        CloneParameterOrdering::FlagsStackParentTLSChild => remote.syscall(
            Arch::CLONE,
            &[
                base_flags,
                stack.as_usize(),
                ptid.as_usize(),
                tls.as_usize(),
                ctid.as_usize(),
            ],
        ),
        CloneParameterOrdering::FlagsStackParentChildTLS => remote.syscall(
            Arch::CLONE,
            &[
                base_flags,
                stack.as_usize(),
                ptid.as_usize(),
                ctid.as_usize(),
                tls.as_usize(),
            ],
        ),
    }
}

fn perform_remote_clone(
    remote: &mut AutoRemoteSyscalls,
    base_flags: usize,
    stack: RemotePtr<Void>,
    ptid: RemotePtr<i32>,
    tls: RemotePtr<Void>,
    ctid: RemotePtr<i32>,
) -> isize {
    let arch = remote.arch();
    arch_function!(
        perform_remote_clone_arch,
        arch,
        remote,
        base_flags,
        stack,
        ptid,
        tls,
        ctid
    )
}

/// Make the OS-level clone call in the tracee and attach Task metadata
/// to the new child, retrying transient EAGAIN failures.
fn os_clone(
    remote: &mut AutoRemoteSyscalls,
    session: Option<SessionSharedPtr>,
    rec_child_tid: pid_t,
    new_serial: u32,
    base_flags: usize,
    stack: RemotePtr<Void>,
    ptid: RemotePtr<i32>,
    tls: RemotePtr<Void>,
    ctid: RemotePtr<i32>,
) -> TaskSharedPtr {
    perform_remote_clone(remote, base_flags, stack, ptid, tls, ctid);
    let mut new_tid: Option<pid_t> = None;
    while !remote.task_mut().clone_syscall_is_complete(&mut new_tid) {
        // clone can fail with EAGAIN under load; just retry until it
        // goes through.
        if remote.task().regs_ref().syscall_result_signed() == -(libc::EAGAIN as isize) {
            perform_remote_clone(remote, base_flags, stack, ptid, tls, ctid);
        } else {
            remote.task_mut().resume_execution(
                ResumeRequest::ResumeSyscall,
                WaitRequest::ResumeWait,
                TicksRequest::ResumeNoTicks,
                None,
            );
        }
    }
    let new_tid = new_tid.unwrap();

    // Drive the parent out of its syscall too.
    remote.task_mut().resume_execution(
        ResumeRequest::ResumeSyscall,
        WaitRequest::ResumeWait,
        TicksRequest::ResumeNoTicks,
        None,
    );

    remote.task_mut().clone_task(
        clone_flags_to_task_flags(base_flags),
        stack,
        tls,
        ctid,
        new_tid,
        Some(rec_child_tid),
        new_serial,
        session,
    )
}
