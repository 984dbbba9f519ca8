//! Tracee ABI dispatch. Operations whose shape differs by tracee CPU mode
//! (syscall numbers, clone parameter ordering, iovec layout) live in one
//! module per architecture exposing the same names; callers select the
//! right one per call by matching the current `SupportedArch`, usually via
//! the `arch_function!` macro.

use crate::remote_ptr::{RemotePtr, Void};

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SupportedArch {
    X86,
    X64,
}

#[cfg(target_arch = "x86_64")]
pub const NATIVE_ARCH: SupportedArch = SupportedArch::X64;
#[cfg(target_arch = "x86")]
pub const NATIVE_ARCH: SupportedArch = SupportedArch::X86;

/// Marker for syscalls an architecture does not have. Never equal to a
/// real syscall number.
pub const INVALID_SYSCALL: u32 = u32::MAX;

/// Both the `syscall`/`int $0x80`/`sysenter` instructions are two bytes.
pub fn syscall_instruction_length(_arch: SupportedArch) -> usize {
    2
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum CloneTLSType {
    /// The `tls` argument to clone() points at a struct user_desc (x86).
    UserDescPointer,
    /// The `tls` argument is the raw TLS base address (x86-64).
    PthreadStructurePointer,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum CloneParameterOrdering {
    /// flags, stack, parent_tid, tls, child_tid (x86).
    FlagsStackParentTLSChild,
    /// flags, stack, parent_tid, child_tid, tls (x86-64).
    FlagsStackParentChildTLS,
}

/// fcntl operations the exit hooks care about; identical on both arches.
pub const F_DUPFD: usize = 0;
pub const F_DUPFD_CLOEXEC: usize = 1030;

/// The TLS descriptor passed to set_thread_area()/clone(). The struct is
/// word-size independent; the flags bitfield is kept packed.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct user_desc {
    pub entry_number: u32,
    pub base_addr: u32,
    pub limit: u32,
    pub flags: u32,
}

pub mod x64 {
    use super::INVALID_SYSCALL;

    pub const READ: u32 = 0;
    pub const WRITE: u32 = 1;
    pub const CLOSE: u32 = 3;
    pub const MMAP: u32 = 9;
    pub const MPROTECT: u32 = 10;
    pub const MUNMAP: u32 = 11;
    pub const BRK: u32 = 12;
    pub const RT_SIGRETURN: u32 = 15;
    pub const IOCTL: u32 = 16;
    pub const PWRITE64: u32 = 18;
    pub const WRITEV: u32 = 20;
    pub const MREMAP: u32 = 25;
    pub const MADVISE: u32 = 28;
    pub const DUP: u32 = 32;
    pub const DUP2: u32 = 33;
    pub const SENDMSG: u32 = 46;
    pub const CLONE: u32 = 56;
    pub const FORK: u32 = 57;
    pub const EXECVE: u32 = 59;
    pub const SHMDT: u32 = 67;
    pub const FCNTL: u32 = 72;
    pub const FTRUNCATE: u32 = 77;
    pub const PRCTL: u32 = 157;
    pub const ARCH_PRCTL: u32 = 158;
    pub const GETTID: u32 = 186;
    pub const SET_THREAD_AREA: u32 = 205;
    pub const OPENAT: u32 = 257;
    pub const UNSHARE: u32 = 272;
    pub const DUP3: u32 = 292;
    pub const PWRITEV: u32 = 296;

    pub const MMAP2: u32 = INVALID_SYSCALL;
    pub const FCNTL64: u32 = INVALID_SYSCALL;
    pub const IPC: u32 = INVALID_SYSCALL;
    pub const SIGRETURN: u32 = INVALID_SYSCALL;
    pub const SOCKETCALL: u32 = INVALID_SYSCALL;
}

pub mod x86 {
    use super::INVALID_SYSCALL;

    pub const FORK: u32 = 2;
    pub const READ: u32 = 3;
    pub const WRITE: u32 = 4;
    pub const CLOSE: u32 = 6;
    pub const EXECVE: u32 = 11;
    pub const DUP: u32 = 41;
    pub const BRK: u32 = 45;
    pub const IOCTL: u32 = 54;
    pub const FCNTL: u32 = 55;
    pub const DUP2: u32 = 63;
    pub const MMAP: u32 = 90;
    pub const MUNMAP: u32 = 91;
    pub const FTRUNCATE: u32 = 93;
    pub const SOCKETCALL: u32 = 102;
    pub const IPC: u32 = 117;
    pub const SIGRETURN: u32 = 119;
    pub const CLONE: u32 = 120;
    pub const MPROTECT: u32 = 125;
    pub const WRITEV: u32 = 146;
    pub const MREMAP: u32 = 163;
    pub const PRCTL: u32 = 172;
    pub const RT_SIGRETURN: u32 = 173;
    pub const PWRITE64: u32 = 181;
    pub const MMAP2: u32 = 192;
    pub const MADVISE: u32 = 219;
    pub const FCNTL64: u32 = 221;
    pub const GETTID: u32 = 224;
    pub const SET_THREAD_AREA: u32 = 243;
    pub const OPENAT: u32 = 295;
    pub const UNSHARE: u32 = 310;
    pub const DUP3: u32 = 330;
    pub const PWRITEV: u32 = 334;

    pub const SHMDT: u32 = INVALID_SYSCALL;
    pub const SENDMSG: u32 = INVALID_SYSCALL;
    pub const ARCH_PRCTL: u32 = INVALID_SYSCALL;

    /// socketcall() multiplexer code for sendmsg.
    pub const SYS_SENDMSG: u32 = 16;
}

/// The per-architecture constants and wire-struct layouts, for code that
/// is generic over the tracee ABI.
pub trait Architecture: 'static {
    const ARCH: SupportedArch;
    const CLONE_TLS_TYPE: CloneTLSType;
    const CLONE_PARAMETER_ORDERING: CloneParameterOrdering;

    const MMAP: u32;
    const MMAP2: u32;
    const MPROTECT: u32;
    const MREMAP: u32;
    const MUNMAP: u32;
    const MADVISE: u32;
    const BRK: u32;
    const SHMDT: u32;
    const IPC: u32;
    const SET_THREAD_AREA: u32;
    const PRCTL: u32;
    const DUP: u32;
    const DUP2: u32;
    const DUP3: u32;
    const FCNTL: u32;
    const FCNTL64: u32;
    const CLOSE: u32;
    const UNSHARE: u32;
    const WRITE: u32;
    const WRITEV: u32;
    const PWRITE64: u32;
    const PWRITEV: u32;
    const CLONE: u32;
    const SENDMSG: u32;
    const SOCKETCALL: u32;

    /// struct iovec in this ABI.
    type iovec: Copy + Default + 'static;
    /// The pointer-sized unsigned word of this ABI.
    type unsigned_word: Copy + Default + 'static;

    fn iovec_parts(io: Self::iovec) -> (RemotePtr<Void>, usize);
    fn usize_to_word(v: usize) -> Self::unsigned_word;
    fn word_to_usize(w: Self::unsigned_word) -> usize;
}

pub struct X86Arch;
pub struct X64Arch;

#[repr(C)]
#[derive(Copy, Clone, Default)]
pub struct iovec_x86 {
    pub iov_base: u32,
    pub iov_len: u32,
}

#[repr(C)]
#[derive(Copy, Clone, Default)]
pub struct iovec_x64 {
    pub iov_base: u64,
    pub iov_len: u64,
}

impl Architecture for X86Arch {
    const ARCH: SupportedArch = SupportedArch::X86;
    const CLONE_TLS_TYPE: CloneTLSType = CloneTLSType::UserDescPointer;
    const CLONE_PARAMETER_ORDERING: CloneParameterOrdering =
        CloneParameterOrdering::FlagsStackParentTLSChild;

    const MMAP: u32 = x86::MMAP;
    const MMAP2: u32 = x86::MMAP2;
    const MPROTECT: u32 = x86::MPROTECT;
    const MREMAP: u32 = x86::MREMAP;
    const MUNMAP: u32 = x86::MUNMAP;
    const MADVISE: u32 = x86::MADVISE;
    const BRK: u32 = x86::BRK;
    const SHMDT: u32 = x86::SHMDT;
    const IPC: u32 = x86::IPC;
    const SET_THREAD_AREA: u32 = x86::SET_THREAD_AREA;
    const PRCTL: u32 = x86::PRCTL;
    const DUP: u32 = x86::DUP;
    const DUP2: u32 = x86::DUP2;
    const DUP3: u32 = x86::DUP3;
    const FCNTL: u32 = x86::FCNTL;
    const FCNTL64: u32 = x86::FCNTL64;
    const CLOSE: u32 = x86::CLOSE;
    const UNSHARE: u32 = x86::UNSHARE;
    const WRITE: u32 = x86::WRITE;
    const WRITEV: u32 = x86::WRITEV;
    const PWRITE64: u32 = x86::PWRITE64;
    const PWRITEV: u32 = x86::PWRITEV;
    const CLONE: u32 = x86::CLONE;
    const SENDMSG: u32 = x86::SENDMSG;
    const SOCKETCALL: u32 = x86::SOCKETCALL;

    type iovec = iovec_x86;
    type unsigned_word = u32;

    fn iovec_parts(io: iovec_x86) -> (RemotePtr<Void>, usize) {
        (RemotePtr::new(io.iov_base as usize), io.iov_len as usize)
    }

    fn usize_to_word(v: usize) -> u32 {
        v as u32
    }

    fn word_to_usize(w: u32) -> usize {
        w as usize
    }
}

impl Architecture for X64Arch {
    const ARCH: SupportedArch = SupportedArch::X64;
    const CLONE_TLS_TYPE: CloneTLSType = CloneTLSType::PthreadStructurePointer;
    const CLONE_PARAMETER_ORDERING: CloneParameterOrdering =
        CloneParameterOrdering::FlagsStackParentChildTLS;

    const MMAP: u32 = x64::MMAP;
    const MMAP2: u32 = x64::MMAP2;
    const MPROTECT: u32 = x64::MPROTECT;
    const MREMAP: u32 = x64::MREMAP;
    const MUNMAP: u32 = x64::MUNMAP;
    const MADVISE: u32 = x64::MADVISE;
    const BRK: u32 = x64::BRK;
    const SHMDT: u32 = x64::SHMDT;
    const IPC: u32 = x64::IPC;
    const SET_THREAD_AREA: u32 = x64::SET_THREAD_AREA;
    const PRCTL: u32 = x64::PRCTL;
    const DUP: u32 = x64::DUP;
    const DUP2: u32 = x64::DUP2;
    const DUP3: u32 = x64::DUP3;
    const FCNTL: u32 = x64::FCNTL;
    const FCNTL64: u32 = x64::FCNTL64;
    const CLOSE: u32 = x64::CLOSE;
    const UNSHARE: u32 = x64::UNSHARE;
    const WRITE: u32 = x64::WRITE;
    const WRITEV: u32 = x64::WRITEV;
    const PWRITE64: u32 = x64::PWRITE64;
    const PWRITEV: u32 = x64::PWRITEV;
    const CLONE: u32 = x64::CLONE;
    const SENDMSG: u32 = x64::SENDMSG;
    const SOCKETCALL: u32 = x64::SOCKETCALL;

    type iovec = iovec_x64;
    type unsigned_word = u64;

    fn iovec_parts(io: iovec_x64) -> (RemotePtr<Void>, usize) {
        (RemotePtr::new(io.iov_base as usize), io.iov_len as usize)
    }

    fn usize_to_word(v: usize) -> u64 {
        v as u64
    }

    fn word_to_usize(w: u64) -> usize {
        w as usize
    }
}

/// Invoke `$func::<Arch>($args...)` for the architecture selected by
/// `$arch`.
macro_rules! arch_function {
    ($func:ident, $arch:expr $(, $args:expr)* $(,)?) => {
        match $arch {
            crate::kernel_abi::SupportedArch::X86 => {
                $func::<crate::kernel_abi::X86Arch>($($args),*)
            }
            crate::kernel_abi::SupportedArch::X64 => {
                $func::<crate::kernel_abi::X64Arch>($($args),*)
            }
        }
    };
}

pub fn syscall_number_for_openat(arch: SupportedArch) -> u32 {
    match arch {
        SupportedArch::X86 => x86::OPENAT,
        SupportedArch::X64 => x64::OPENAT,
    }
}

pub fn syscall_number_for_close(arch: SupportedArch) -> u32 {
    match arch {
        SupportedArch::X86 => x86::CLOSE,
        SupportedArch::X64 => x64::CLOSE,
    }
}

pub fn syscall_number_for_mmap(arch: SupportedArch) -> u32 {
    match arch {
        SupportedArch::X86 => x86::MMAP2,
        SupportedArch::X64 => x64::MMAP,
    }
}

pub fn syscall_number_for_munmap(arch: SupportedArch) -> u32 {
    match arch {
        SupportedArch::X86 => x86::MUNMAP,
        SupportedArch::X64 => x64::MUNMAP,
    }
}

pub fn syscall_number_for_mprotect(arch: SupportedArch) -> u32 {
    match arch {
        SupportedArch::X86 => x86::MPROTECT,
        SupportedArch::X64 => x64::MPROTECT,
    }
}

pub fn syscall_number_for_ftruncate(arch: SupportedArch) -> u32 {
    match arch {
        SupportedArch::X86 => x86::FTRUNCATE,
        SupportedArch::X64 => x64::FTRUNCATE,
    }
}

pub fn syscall_number_for_gettid(arch: SupportedArch) -> u32 {
    match arch {
        SupportedArch::X86 => x86::GETTID,
        SupportedArch::X64 => x64::GETTID,
    }
}

pub fn syscall_number_for_execve(arch: SupportedArch) -> u32 {
    match arch {
        SupportedArch::X86 => x86::EXECVE,
        SupportedArch::X64 => x64::EXECVE,
    }
}

pub fn syscall_number_for_prctl(arch: SupportedArch) -> u32 {
    match arch {
        SupportedArch::X86 => x86::PRCTL,
        SupportedArch::X64 => x64::PRCTL,
    }
}

pub fn syscall_number_for_set_thread_area(arch: SupportedArch) -> u32 {
    match arch {
        SupportedArch::X86 => x86::SET_THREAD_AREA,
        SupportedArch::X64 => x64::SET_THREAD_AREA,
    }
}

pub fn is_mprotect_syscall(syscall: i32, arch: SupportedArch) -> bool {
    syscall as u32 == syscall_number_for_mprotect(arch)
}

/// sigreturn and rt_sigreturn restore registers from the kernel-built
/// signal frame and therefore must never be register-normalized.
pub fn is_sigreturn(syscall: i32, arch: SupportedArch) -> bool {
    let sys = syscall as u32;
    match arch {
        SupportedArch::X86 => sys == x86::SIGRETURN || sys == x86::RT_SIGRETURN,
        SupportedArch::X64 => sys == x64::RT_SIGRETURN,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sigreturn_family() {
        assert!(is_sigreturn(x86::SIGRETURN as i32, SupportedArch::X86));
        assert!(is_sigreturn(x86::RT_SIGRETURN as i32, SupportedArch::X86));
        assert!(is_sigreturn(x64::RT_SIGRETURN as i32, SupportedArch::X64));
        assert!(!is_sigreturn(x64::MMAP as i32, SupportedArch::X64));
        // The x86 sigreturn number means something else entirely on x86-64.
        assert!(!is_sigreturn(x86::SIGRETURN as i32, SupportedArch::X64));
    }

    #[test]
    fn mmap_selection_prefers_mmap2_on_x86() {
        assert_eq!(x86::MMAP2, syscall_number_for_mmap(SupportedArch::X86));
        assert_eq!(x64::MMAP, syscall_number_for_mmap(SupportedArch::X64));
    }

    #[test]
    fn absent_syscalls_never_match() {
        assert_eq!(INVALID_SYSCALL, x64::IPC);
        assert_eq!(INVALID_SYSCALL, x86::SHMDT);
        assert_ne!(x64::SHMDT, x86::SHMDT);
    }
}
