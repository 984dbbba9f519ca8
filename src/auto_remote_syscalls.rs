//! Scoped injection of syscalls into a stopped tracee.
//!
//! An AutoRemoteSyscalls takes custody of a task at a ptrace-stop, saves
//! its complete register state, and guarantees that on every exit path -
//! including errors and tracee death - the registers are restored and
//! the tracee is back at the same logical stop it started at.
//! AutoRestoreMem stacks data into the tracee (below its stack pointer)
//! with the same scoped-restore guarantee.

use crate::kernel_abi::{Architecture, SupportedArch};
use crate::log::{LogDebug, LogWarn};
use crate::registers::Registers;
use crate::remote_code_ptr::RemoteCodePtr;
use crate::remote_ptr::{RemotePtr, Void};
use crate::scoped_fd::ScopedFd;
use crate::task::{ResumeRequest, Task, TicksRequest, WaitRequest, WriteFlags};
use nix::sys::mman::{MapFlags, ProtFlags};
use nix::sys::socket::{recvmsg, ControlMessageOwned, MsgFlags, UnixAddr};
use std::ffi::CStr;
use std::io::IoSliceMut;
use std::mem::size_of;
use std::ops::{Deref, DerefMut};

/// The syscall instruction for the tracee's ABI.
fn syscall_instruction_bytes(arch: SupportedArch) -> &'static [u8] {
    match arch {
        SupportedArch::X86 => &[0xcd, 0x80],
        SupportedArch::X64 => &[0x0f, 0x05],
    }
}

pub struct AutoRemoteSyscalls<'a> {
    t: &'a mut Task,
    initial_regs: Registers,
    /// Where the syscall instruction we use lives.
    syscall_ip: RemoteCodePtr,
    /// Original bytes at syscall_ip when we had to plant the
    /// instruction ourselves (no stub page mapped yet).
    replaced_bytes: Vec<u8>,
    /// Stack of tracee-memory scratch allocations; restored in reverse.
    pending_sp: RemotePtr<Void>,
}

impl<'a> AutoRemoteSyscalls<'a> {
    pub fn new(t: &'a mut Task) -> AutoRemoteSyscalls<'a> {
        ed_assert!(t, t.is_stopped);
        let initial_regs = *t.regs_ref();
        let arch = initial_regs.arch();
        let pending_sp = initial_regs.sp();

        let mut this = AutoRemoteSyscalls {
            t,
            initial_regs,
            syscall_ip: RemoteCodePtr::null(),
            replaced_bytes: Vec::new(),
            pending_sp,
        };
        if this.t.vm().has_retrace_page_mapped() {
            this.syscall_ip = crate::address_space::AddressSpace::traced_syscall_ip();
        } else {
            // No stub page yet (early in spawn, before the preload
            // library runs); plant a syscall instruction at the current
            // IP and put the original bytes back when we're done.
            let ip = this.initial_regs.ip();
            let insn = syscall_instruction_bytes(arch);
            let mut saved = vec![0u8; insn.len()];
            this.t
                .read_bytes_helper(ip.to_data_ptr::<Void>(), &mut saved, None);
            this.t.write_bytes_helper(
                ip.to_data_ptr::<Void>(),
                insn,
                None,
                WriteFlags::IS_BREAKPOINT_RELATED,
            );
            this.replaced_bytes = saved;
            this.syscall_ip = ip;
        }
        this
    }

    pub fn task(&self) -> &Task {
        self.t
    }

    pub fn task_mut(&mut self) -> &mut Task {
        self.t
    }

    pub fn arch(&self) -> SupportedArch {
        self.initial_regs.arch()
    }

    pub fn initial_regs(&self) -> &Registers {
        &self.initial_regs
    }

    /// The registers that will be restored when this scope ends;
    /// modifying them changes what the tracee sees afterwards (e.g. a
    /// forged syscall result).
    pub fn initial_regs_mut(&mut self) -> &mut Registers {
        &mut self.initial_regs
    }

    /// Inject one syscall and return its raw result. ESRCH-shaped
    /// failures (the tracee died under us) surface as -ESRCH.
    pub fn syscall(&mut self, syscallno: u32, args: &[usize]) -> isize {
        ed_assert!(self.t, args.len() <= 6);
        let mut callregs = self.initial_regs;
        callregs.set_ip(self.syscall_ip);
        callregs.set_sp(self.pending_sp);
        callregs.set_syscallno(syscallno as isize);
        for (i, arg) in args.iter().enumerate() {
            callregs.set_arg(i + 1, *arg);
        }
        self.t.set_regs(&callregs);

        self.t.advance_syscall();
        if self.t.is_dying() {
            log!(
                LogDebug,
                "Tracee {} died mid-remote-syscall",
                self.t.tid
            );
            return -(libc::ESRCH as isize);
        }
        ed_assert_eq!(
            self.t,
            self.t.regs_ref().original_syscallno(),
            syscallno as isize,
            "Should be entering the syscall we injected"
        );

        // Now drive it through to the exit stop.
        self.t.resume_execution(
            ResumeRequest::ResumeSyscall,
            WaitRequest::ResumeWait,
            TicksRequest::ResumeNoTicks,
            None,
        );
        if self.t.is_dying() {
            return -(libc::ESRCH as isize);
        }
        self.t.regs_ref().syscall_result_signed()
    }

    /// Like `syscall` but any failure result is fatal.
    pub fn infallible_syscall(&mut self, syscallno: u32, args: &[usize]) -> isize {
        let result = self.syscall(syscallno, args);
        if result < 0 && result > -4096 {
            fatal!(
                "Remote syscall {} in {} failed with errno {}",
                crate::kernel_metadata::syscall_name(syscallno as i32, self.arch()),
                self.t.tid,
                crate::kernel_metadata::errno_name((-result) as i32)
            );
        }
        result
    }

    /// Inject the right mmap for the tracee's ABI; mmap2 on x86 takes
    /// the offset in pages.
    pub fn infallible_mmap_syscall(
        &mut self,
        addr: RemotePtr<Void>,
        length: usize,
        prot: ProtFlags,
        flags: MapFlags,
        child_fd: i32,
        offset_bytes: u64,
    ) -> RemotePtr<Void> {
        let arch = self.arch();
        let syscallno = crate::kernel_abi::syscall_number_for_mmap(arch);
        let offset_arg = match arch {
            SupportedArch::X86 => (offset_bytes / crate::util::page_size() as u64) as usize,
            SupportedArch::X64 => offset_bytes as usize,
        };
        let ret = self.infallible_syscall(
            syscallno,
            &[
                addr.as_usize(),
                length,
                prot.bits() as usize,
                flags.bits() as usize,
                child_fd as usize,
                offset_arg,
            ],
        );
        let mapped = RemotePtr::new(ret as usize);
        if !addr.is_null() && flags.contains(MapFlags::MAP_FIXED) {
            ed_assert_eq!(self.t, addr, mapped, "MAP_FIXED at {} but mapped at {}", addr, mapped);
        }
        mapped
    }

    /// Receive from the tracee the fd it knows as `child_fd`, via
    /// SCM_RIGHTS over the reserved socketpair. The child does the
    /// sendmsg; we do the recvmsg.
    pub fn retrieve_fd(&mut self, child_fd: i32) -> ScopedFd {
        let arch = self.arch();
        let sock = self.t.session().tracee_socket_raw();
        let sent = arch_function!(child_sendmsg, arch, self, child_fd);
        if !sent {
            log!(LogWarn, "Failed to send fd {} from tracee {}", child_fd, self.t.tid);
            return ScopedFd::new();
        }

        let mut byte = [0u8; 1];
        let mut iov = [IoSliceMut::new(&mut byte)];
        let mut cmsgspace = nix::cmsg_space!([std::os::unix::io::RawFd; 1]);
        let mut received = ScopedFd::new();
        match recvmsg::<UnixAddr>(sock, &mut iov, Some(&mut cmsgspace), MsgFlags::empty()) {
            Ok(msg) => {
                for cmsg in msg.cmsgs() {
                    if let ControlMessageOwned::ScmRights(fds) = cmsg {
                        if let Some(fd) = fds.first() {
                            received = ScopedFd::from_raw(*fd);
                        }
                    }
                }
            }
            Err(_) => {
                log!(LogWarn, "recvmsg from tracee {} failed", self.t.tid);
            }
        }
        received
    }

    /// Undo our register and memory fudging in `t`, which must be a
    /// fresh fork of the task this object drives (the fork inherited the
    /// fudged state without ever making a syscall itself).
    pub fn restore_state_to(&self, t: &mut Task) {
        if !self.replaced_bytes.is_empty() {
            t.write_bytes_helper(
                self.syscall_ip.to_data_ptr::<Void>(),
                &self.replaced_bytes,
                None,
                WriteFlags::IS_BREAKPOINT_RELATED,
            );
        }
        t.set_regs(&self.initial_regs);
        t.flush_regs();
    }
}

impl<'a> Drop for AutoRemoteSyscalls<'a> {
    fn drop(&mut self) {
        if self.t.is_dying() {
            // Nothing to restore into; the task is on its way out.
            return;
        }
        if !self.replaced_bytes.is_empty() {
            let ip = self.syscall_ip;
            let bytes = std::mem::take(&mut self.replaced_bytes);
            self.t.write_bytes_helper(
                ip.to_data_ptr::<Void>(),
                &bytes,
                None,
                WriteFlags::IS_BREAKPOINT_RELATED,
            );
        }
        let regs = self.initial_regs;
        self.t.set_regs(&regs);
        self.t.flush_regs();
    }
}

// --- tracee-side sendmsg construction ----------------------------------

#[repr(C)]
#[derive(Copy, Clone, Default)]
struct msghdr_arch<P: Copy + Default> {
    msg_name: P,
    msg_namelen: u32,
    msg_iov: P,
    msg_iovlen: P,
    msg_control: P,
    msg_controllen: P,
    msg_flags: i32,
}

#[repr(C)]
#[derive(Copy, Clone, Default)]
struct cmsghdr_arch<P: Copy + Default> {
    cmsg_len: P,
    cmsg_level: i32,
    cmsg_type: i32,
}

#[repr(C)]
#[derive(Copy, Clone, Default)]
struct iovec_arch<P: Copy + Default> {
    iov_base: P,
    iov_len: P,
}

/// Assemble, in tracee stack memory, a msghdr carrying one dummy byte
/// and an SCM_RIGHTS cmsg with `child_fd`, then have the tracee
/// sendmsg() it through its end of the reserved socketpair.
fn child_sendmsg<Arch: Architecture>(remote: &mut AutoRemoteSyscalls, child_fd: i32) -> bool {
    let word = Arch::usize_to_word;

    let cmsg_header = size_of::<cmsghdr_arch<Arch::unsigned_word>>();
    let cmsg_align = size_of::<Arch::unsigned_word>();
    let cmsg_len = cmsg_header + size_of::<i32>();
    let cmsg_space = (cmsg_len + cmsg_align - 1) & !(cmsg_align - 1);

    // Block layout: [msghdr][iovec][1 data byte + pad][cmsg buffer].
    let msghdr_size = size_of::<msghdr_arch<Arch::unsigned_word>>();
    let iovec_size = size_of::<iovec_arch<Arch::unsigned_word>>();
    let data_offset = msghdr_size + iovec_size;
    let cmsg_offset = (data_offset + 1 + cmsg_align - 1) & !(cmsg_align - 1);
    let total = cmsg_offset + cmsg_space;

    let mut block = vec![0u8; total];
    {
        let mut mem = AutoRestoreMem::push_bytes(remote, &block);
        let base = match mem.get() {
            Some(addr) => addr,
            None => return false,
        };

        let msg = msghdr_arch::<Arch::unsigned_word> {
            msg_name: word(0),
            msg_namelen: 0,
            msg_iov: word(base.as_usize() + msghdr_size),
            msg_iovlen: word(1),
            msg_control: word(base.as_usize() + cmsg_offset),
            msg_controllen: word(cmsg_len),
            msg_flags: 0,
        };
        let iov = iovec_arch::<Arch::unsigned_word> {
            iov_base: word(base.as_usize() + data_offset),
            iov_len: word(1),
        };
        let cmsg = cmsghdr_arch::<Arch::unsigned_word> {
            cmsg_len: word(cmsg_len),
            cmsg_level: libc::SOL_SOCKET,
            cmsg_type: libc::SCM_RIGHTS,
        };

        block[..msghdr_size].copy_from_slice(crate::util::u8_slice(&msg));
        block[msghdr_size..data_offset].copy_from_slice(crate::util::u8_slice(&iov));
        block[data_offset] = b'F';
        block[cmsg_offset..cmsg_offset + cmsg_header]
            .copy_from_slice(crate::util::u8_slice(&cmsg));
        block[cmsg_offset + cmsg_header..cmsg_offset + cmsg_len]
            .copy_from_slice(&child_fd.to_ne_bytes());

        mem.task_mut().write_bytes(base, &block);

        let sock_fd = crate::preload_interface::RETRACE_RESERVED_SOCKET_FD as usize;
        let sent = if Arch::SENDMSG != crate::kernel_abi::INVALID_SYSCALL {
            mem.syscall(Arch::SENDMSG, &[sock_fd, base.as_usize(), 0])
        } else {
            // x86 multiplexes through socketcall(SYS_SENDMSG, argsptr);
            // the three sendmsg args sit in front of the block we just
            // wrote... push them as another stack allocation.
            let args = [
                Arch::usize_to_word(sock_fd),
                Arch::usize_to_word(base.as_usize()),
                Arch::usize_to_word(0),
            ];
            let mut args_bytes = Vec::new();
            for a in &args {
                args_bytes.extend_from_slice(crate::util::u8_slice(a));
            }
            let mut args_mem = AutoRestoreMem::push_bytes(&mut mem, &args_bytes);
            let args_addr = match args_mem.get() {
                Some(a) => a,
                None => return false,
            };
            args_mem.syscall(
                Arch::SOCKETCALL,
                &[
                    crate::kernel_abi::x86::SYS_SENDMSG as usize,
                    args_addr.as_usize(),
                ],
            )
        };
        sent == 1
    }
}

/// A scoped allocation in the tracee: bytes below the stack pointer are
/// saved, replaced, and restored when the scope ends. Allocations nest.
pub struct AutoRestoreMem<'a, 'b> {
    remote: &'a mut AutoRemoteSyscalls<'b>,
    addr: Option<RemotePtr<Void>>,
    saved: Vec<u8>,
    len: usize,
}

impl<'a, 'b> AutoRestoreMem<'a, 'b> {
    pub fn push_bytes(
        remote: &'a mut AutoRemoteSyscalls<'b>,
        data: &[u8],
    ) -> AutoRestoreMem<'a, 'b> {
        Self::push_internal(remote, Some(data), data.len())
    }

    /// Push a NUL-terminated string.
    pub fn push_cstr(
        remote: &'a mut AutoRemoteSyscalls<'b>,
        s: &CStr,
    ) -> AutoRestoreMem<'a, 'b> {
        Self::push_bytes(remote, s.to_bytes_with_nul())
    }

    fn push_internal(
        remote: &'a mut AutoRemoteSyscalls<'b>,
        data: Option<&[u8]>,
        num_bytes: usize,
    ) -> AutoRestoreMem<'a, 'b> {
        // Keep the tracee stack pointer word-aligned.
        let word = size_of::<usize>();
        let len = (num_bytes + word - 1) & !(word - 1);
        let addr = remote.pending_sp - len;

        let mut saved = vec![0u8; len];
        let mut ok = true;
        remote
            .t
            .read_bytes_helper(addr, &mut saved, Some(&mut ok));
        if ok {
            if let Some(data) = data {
                remote
                    .t
                    .write_bytes_helper(addr, data, Some(&mut ok), WriteFlags::empty());
            }
        }
        let addr = if ok { Some(addr) } else { None };
        if let Some(a) = addr {
            remote.pending_sp = a;
        }
        AutoRestoreMem {
            addr,
            saved,
            len,
            remote,
        }
    }

    /// The tracee address of the allocation, or None if the tracee
    /// could not be written (dying).
    pub fn get(&self) -> Option<RemotePtr<Void>> {
        self.addr
    }
}

impl<'a, 'b> Drop for AutoRestoreMem<'a, 'b> {
    fn drop(&mut self) {
        if let Some(addr) = self.addr {
            let saved = std::mem::take(&mut self.saved);
            self.remote
                .t
                .write_bytes_helper(addr, &saved, None, WriteFlags::empty());
            self.remote.pending_sp = addr + self.len;
        }
    }
}

impl<'a, 'b> Deref for AutoRestoreMem<'a, 'b> {
    type Target = AutoRemoteSyscalls<'b>;

    fn deref(&self) -> &Self::Target {
        self.remote
    }
}

impl<'a, 'b> DerefMut for AutoRestoreMem<'a, 'b> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.remote
    }
}
