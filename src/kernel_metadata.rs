//! Human-readable names for kernel quantities, for diagnostics only.

use crate::kernel_abi::SupportedArch;
use crate::kernel_supplement::*;

pub fn signal_name(sig: i32) -> String {
    match sig {
        libc::SIGHUP => "SIGHUP".into(),
        libc::SIGINT => "SIGINT".into(),
        libc::SIGQUIT => "SIGQUIT".into(),
        libc::SIGILL => "SIGILL".into(),
        libc::SIGTRAP => "SIGTRAP".into(),
        libc::SIGABRT => "SIGABRT".into(),
        libc::SIGBUS => "SIGBUS".into(),
        libc::SIGFPE => "SIGFPE".into(),
        libc::SIGKILL => "SIGKILL".into(),
        libc::SIGUSR1 => "SIGUSR1".into(),
        libc::SIGSEGV => "SIGSEGV".into(),
        libc::SIGUSR2 => "SIGUSR2".into(),
        libc::SIGPIPE => "SIGPIPE".into(),
        libc::SIGALRM => "SIGALRM".into(),
        libc::SIGTERM => "SIGTERM".into(),
        libc::SIGSTKFLT => "SIGSTKFLT".into(),
        libc::SIGCHLD => "SIGCHLD".into(),
        libc::SIGCONT => "SIGCONT".into(),
        libc::SIGSTOP => "SIGSTOP".into(),
        libc::SIGTSTP => "SIGTSTP".into(),
        libc::SIGTTIN => "SIGTTIN".into(),
        libc::SIGTTOU => "SIGTTOU".into(),
        libc::SIGURG => "SIGURG".into(),
        libc::SIGXCPU => "SIGXCPU".into(),
        libc::SIGXFSZ => "SIGXFSZ".into(),
        libc::SIGVTALRM => "SIGVTALRM".into(),
        libc::SIGPROF => "SIGPROF".into(),
        libc::SIGWINCH => "SIGWINCH".into(),
        libc::SIGIO => "SIGIO".into(),
        libc::SIGPWR => "SIGPWR".into(),
        libc::SIGSYS => "SIGSYS".into(),
        _ if sig >= libc::SIGRTMIN() && sig <= libc::SIGRTMAX() => {
            format!("SIGRT{}", sig - libc::SIGRTMIN())
        }
        _ => format!("signal({})", sig),
    }
}

pub fn errno_name(err: i32) -> String {
    match err {
        0 => "SUCCESS".into(),
        libc::EPERM => "EPERM".into(),
        libc::ENOENT => "ENOENT".into(),
        libc::ESRCH => "ESRCH".into(),
        libc::EINTR => "EINTR".into(),
        libc::EIO => "EIO".into(),
        libc::ENXIO => "ENXIO".into(),
        libc::E2BIG => "E2BIG".into(),
        libc::ENOEXEC => "ENOEXEC".into(),
        libc::EBADF => "EBADF".into(),
        libc::ECHILD => "ECHILD".into(),
        libc::EAGAIN => "EAGAIN".into(),
        libc::ENOMEM => "ENOMEM".into(),
        libc::EACCES => "EACCES".into(),
        libc::EFAULT => "EFAULT".into(),
        libc::EBUSY => "EBUSY".into(),
        libc::EEXIST => "EEXIST".into(),
        libc::ENODEV => "ENODEV".into(),
        libc::ENOTDIR => "ENOTDIR".into(),
        libc::EISDIR => "EISDIR".into(),
        libc::EINVAL => "EINVAL".into(),
        libc::ENFILE => "ENFILE".into(),
        libc::EMFILE => "EMFILE".into(),
        libc::ENOSPC => "ENOSPC".into(),
        libc::ESPIPE => "ESPIPE".into(),
        libc::EROFS => "EROFS".into(),
        libc::EPIPE => "EPIPE".into(),
        libc::ERANGE => "ERANGE".into(),
        libc::ENOSYS => "ENOSYS".into(),
        libc::ETIMEDOUT => "ETIMEDOUT".into(),
        _ => format!("errno({})", err),
    }
}

pub fn ptrace_req_name(request: u32) -> String {
    match request {
        PTRACE_TRACEME => "PTRACE_TRACEME".into(),
        PTRACE_PEEKDATA => "PTRACE_PEEKDATA".into(),
        PTRACE_PEEKUSER => "PTRACE_PEEKUSER".into(),
        PTRACE_POKEDATA => "PTRACE_POKEDATA".into(),
        PTRACE_POKEUSER => "PTRACE_POKEUSER".into(),
        PTRACE_CONT => "PTRACE_CONT".into(),
        PTRACE_KILL => "PTRACE_KILL".into(),
        PTRACE_SINGLESTEP => "PTRACE_SINGLESTEP".into(),
        PTRACE_GETREGS => "PTRACE_GETREGS".into(),
        PTRACE_SETREGS => "PTRACE_SETREGS".into(),
        PTRACE_GETFPREGS => "PTRACE_GETFPREGS".into(),
        PTRACE_SETFPREGS => "PTRACE_SETFPREGS".into(),
        PTRACE_ATTACH => "PTRACE_ATTACH".into(),
        PTRACE_DETACH => "PTRACE_DETACH".into(),
        PTRACE_GETFPXREGS => "PTRACE_GETFPXREGS".into(),
        PTRACE_SETFPXREGS => "PTRACE_SETFPXREGS".into(),
        PTRACE_SYSCALL => "PTRACE_SYSCALL".into(),
        PTRACE_SYSEMU => "PTRACE_SYSEMU".into(),
        PTRACE_SYSEMU_SINGLESTEP => "PTRACE_SYSEMU_SINGLESTEP".into(),
        PTRACE_SETOPTIONS => "PTRACE_SETOPTIONS".into(),
        PTRACE_GETEVENTMSG => "PTRACE_GETEVENTMSG".into(),
        PTRACE_GETSIGINFO => "PTRACE_GETSIGINFO".into(),
        PTRACE_SETSIGINFO => "PTRACE_SETSIGINFO".into(),
        PTRACE_GETREGSET => "PTRACE_GETREGSET".into(),
        PTRACE_SETREGSET => "PTRACE_SETREGSET".into(),
        PTRACE_SEIZE => "PTRACE_SEIZE".into(),
        PTRACE_INTERRUPT => "PTRACE_INTERRUPT".into(),
        PTRACE_LISTEN => "PTRACE_LISTEN".into(),
        _ => format!("PTRACE_REQUEST({})", request),
    }
}

pub fn ptrace_event_name(event: u32) -> String {
    match event {
        PTRACE_EVENT_FORK => "PTRACE_EVENT_FORK".into(),
        PTRACE_EVENT_VFORK => "PTRACE_EVENT_VFORK".into(),
        PTRACE_EVENT_CLONE => "PTRACE_EVENT_CLONE".into(),
        PTRACE_EVENT_EXEC => "PTRACE_EVENT_EXEC".into(),
        PTRACE_EVENT_VFORK_DONE => "PTRACE_EVENT_VFORK_DONE".into(),
        PTRACE_EVENT_EXIT => "PTRACE_EVENT_EXIT".into(),
        PTRACE_EVENT_SECCOMP => "PTRACE_EVENT_SECCOMP".into(),
        PTRACE_EVENT_SECCOMP_OBSOLETE => "PTRACE_EVENT_SECCOMP_OBSOLETE".into(),
        PTRACE_EVENT_STOP => "PTRACE_EVENT_STOP".into(),
        _ => format!("PTRACE_EVENT({})", event),
    }
}

/// Names for the syscalls retrace itself reasons about. Anything else is
/// reported numerically; full tables are not worth carrying for
/// diagnostics.
pub fn syscall_name(syscall: i32, arch: SupportedArch) -> String {
    use crate::kernel_abi::{x64, x86};
    let name = match arch {
        SupportedArch::X64 => match syscall as u32 {
            x64::MMAP => Some("mmap"),
            x64::MPROTECT => Some("mprotect"),
            x64::MUNMAP => Some("munmap"),
            x64::MREMAP => Some("mremap"),
            x64::MADVISE => Some("madvise"),
            x64::BRK => Some("brk"),
            x64::CLOSE => Some("close"),
            x64::DUP => Some("dup"),
            x64::DUP2 => Some("dup2"),
            x64::DUP3 => Some("dup3"),
            x64::FCNTL => Some("fcntl"),
            x64::WRITE => Some("write"),
            x64::WRITEV => Some("writev"),
            x64::PRCTL => Some("prctl"),
            x64::OPENAT => Some("openat"),
            x64::EXECVE => Some("execve"),
            x64::CLONE => Some("clone"),
            x64::UNSHARE => Some("unshare"),
            x64::SHMDT => Some("shmdt"),
            x64::GETTID => Some("gettid"),
            x64::RT_SIGRETURN => Some("rt_sigreturn"),
            x64::SENDMSG => Some("sendmsg"),
            _ => None,
        },
        SupportedArch::X86 => match syscall as u32 {
            x86::MMAP => Some("mmap"),
            x86::MMAP2 => Some("mmap2"),
            x86::MPROTECT => Some("mprotect"),
            x86::MUNMAP => Some("munmap"),
            x86::MREMAP => Some("mremap"),
            x86::MADVISE => Some("madvise"),
            x86::BRK => Some("brk"),
            x86::CLOSE => Some("close"),
            x86::DUP => Some("dup"),
            x86::DUP2 => Some("dup2"),
            x86::DUP3 => Some("dup3"),
            x86::FCNTL => Some("fcntl"),
            x86::FCNTL64 => Some("fcntl64"),
            x86::WRITE => Some("write"),
            x86::WRITEV => Some("writev"),
            x86::PRCTL => Some("prctl"),
            x86::OPENAT => Some("openat"),
            x86::EXECVE => Some("execve"),
            x86::CLONE => Some("clone"),
            x86::UNSHARE => Some("unshare"),
            x86::IPC => Some("ipc"),
            x86::GETTID => Some("gettid"),
            x86::SIGRETURN => Some("sigreturn"),
            x86::RT_SIGRETURN => Some("rt_sigreturn"),
            x86::SET_THREAD_AREA => Some("set_thread_area"),
            _ => None,
        },
    };
    match name {
        Some(n) => n.to_owned(),
        None => format!("syscall({})", syscall),
    }
}
