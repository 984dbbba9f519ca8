//! The general-purpose register bank of a tracee, cached tracer-side.
//!
//! The tracer is always a 64-bit process; a 32-bit tracee's registers
//! still arrive from PTRACE_GETREGS in the native 64-bit layout, so the
//! conversions both ways live here.

use crate::kernel_abi::SupportedArch;
use crate::remote_code_ptr::RemoteCodePtr;
use crate::remote_ptr::{RemotePtr, Void};
use std::fmt::{self, Debug, Formatter};

/// The x86 trap flag; never allowed to leak into recorded state.
pub const X86_TF_FLAG: usize = 0x100;

/// EFLAGS after "xor reg,reg": ZF+PF+IF+reserved. The value registers are
/// normalized to at syscall exits.
pub const X86_CANONICAL_FLAGS: usize = 0x246;

/// struct user_regs_struct for 32-bit x86.
#[repr(C)]
#[derive(Copy, Clone, Default, Eq, PartialEq)]
pub struct X86UserRegs {
    pub ebx: u32,
    pub ecx: u32,
    pub edx: u32,
    pub esi: u32,
    pub edi: u32,
    pub ebp: u32,
    pub eax: u32,
    pub xds: u32,
    pub xes: u32,
    pub xfs: u32,
    pub xgs: u32,
    pub orig_eax: u32,
    pub eip: u32,
    pub xcs: u32,
    pub eflags: u32,
    pub esp: u32,
    pub xss: u32,
}

/// struct user_regs_struct for x86-64; identical layout to the native
/// one PTRACE_GETREGS fills in.
#[repr(C)]
#[derive(Copy, Clone, Default, Eq, PartialEq)]
pub struct X64UserRegs {
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub rbp: u64,
    pub rbx: u64,
    pub r11: u64,
    pub r10: u64,
    pub r9: u64,
    pub r8: u64,
    pub rax: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub orig_rax: u64,
    pub rip: u64,
    pub cs: u64,
    pub eflags: u64,
    pub rsp: u64,
    pub ss: u64,
    pub fs_base: u64,
    pub gs_base: u64,
    pub ds: u64,
    pub es: u64,
    pub fs: u64,
    pub gs: u64,
}

static_assertions::const_assert_eq!(
    std::mem::size_of::<X64UserRegs>(),
    std::mem::size_of::<libc::user_regs_struct>()
);

#[derive(Copy, Clone, Eq, PartialEq)]
enum RegsRepr {
    X86(X86UserRegs),
    X64(X64UserRegs),
}

#[derive(Copy, Clone, Eq, PartialEq)]
pub struct Registers {
    repr: RegsRepr,
}

impl Registers {
    pub fn new(arch: SupportedArch) -> Registers {
        let repr = match arch {
            SupportedArch::X86 => RegsRepr::X86(Default::default()),
            SupportedArch::X64 => RegsRepr::X64(Default::default()),
        };
        Registers { repr }
    }

    pub fn arch(&self) -> SupportedArch {
        match self.repr {
            RegsRepr::X86(_) => SupportedArch::X86,
            RegsRepr::X64(_) => SupportedArch::X64,
        }
    }

    /// Change the architecture, discarding all register values.
    pub fn set_arch(&mut self, arch: SupportedArch) {
        if arch != self.arch() {
            *self = Registers::new(arch);
        }
    }

    /// Refill from the native-layout struct PTRACE_GETREGS produced. For
    /// a 32-bit tracee the values arrive zero-extended in the 64-bit
    /// slots.
    pub fn set_from_ptrace(&mut self, native: &X64UserRegs) {
        match &mut self.repr {
            RegsRepr::X64(r) => *r = *native,
            RegsRepr::X86(r) => *r = x86_from_native(native),
        }
    }

    /// Produce the native-layout struct PTRACE_SETREGS expects.
    pub fn get_ptrace(&self) -> X64UserRegs {
        match &self.repr {
            RegsRepr::X64(r) => *r,
            RegsRepr::X86(r) => native_from_x86(r),
        }
    }

    pub fn ip(&self) -> RemoteCodePtr {
        match &self.repr {
            RegsRepr::X86(r) => RemoteCodePtr::new(r.eip as usize),
            RegsRepr::X64(r) => RemoteCodePtr::new(r.rip as usize),
        }
    }

    pub fn set_ip(&mut self, addr: RemoteCodePtr) {
        match &mut self.repr {
            RegsRepr::X86(r) => r.eip = addr.as_usize() as u32,
            RegsRepr::X64(r) => r.rip = addr.as_usize() as u64,
        }
    }

    pub fn sp(&self) -> RemotePtr<Void> {
        match &self.repr {
            RegsRepr::X86(r) => RemotePtr::new(r.esp as usize),
            RegsRepr::X64(r) => RemotePtr::new(r.rsp as usize),
        }
    }

    pub fn set_sp(&mut self, addr: RemotePtr<Void>) {
        match &mut self.repr {
            RegsRepr::X86(r) => r.esp = addr.as_usize() as u32,
            RegsRepr::X64(r) => r.rsp = addr.as_usize() as u64,
        }
    }

    pub fn flags(&self) -> usize {
        match &self.repr {
            RegsRepr::X86(r) => r.eflags as usize,
            RegsRepr::X64(r) => r.eflags as usize,
        }
    }

    pub fn set_flags(&mut self, value: usize) {
        match &mut self.repr {
            RegsRepr::X86(r) => r.eflags = value as u32,
            RegsRepr::X64(r) => r.eflags = value as u64,
        }
    }

    pub fn singlestep_flag(&self) -> bool {
        self.flags() & X86_TF_FLAG != 0
    }

    pub fn clear_singlestep_flag(&mut self) {
        let flags = self.flags();
        self.set_flags(flags & !X86_TF_FLAG);
    }

    /// The syscall number for the current or most recent syscall
    /// (rax/eax at entry).
    pub fn syscallno(&self) -> isize {
        match &self.repr {
            RegsRepr::X86(r) => r.eax as i32 as isize,
            RegsRepr::X64(r) => r.rax as i64 as isize,
        }
    }

    pub fn set_syscallno(&mut self, syscallno: isize) {
        match &mut self.repr {
            RegsRepr::X86(r) => r.eax = syscallno as u32,
            RegsRepr::X64(r) => r.rax = syscallno as u64,
        }
    }

    /// The syscall number as the kernel remembers it across the syscall
    /// (orig_rax/orig_eax); -1 outside syscalls.
    pub fn original_syscallno(&self) -> isize {
        match &self.repr {
            RegsRepr::X86(r) => r.orig_eax as i32 as isize,
            RegsRepr::X64(r) => r.orig_rax as i64 as isize,
        }
    }

    pub fn set_original_syscallno(&mut self, syscallno: isize) {
        match &mut self.repr {
            RegsRepr::X86(r) => r.orig_eax = syscallno as u32,
            RegsRepr::X64(r) => r.orig_rax = syscallno as u64,
        }
    }

    pub fn syscall_result(&self) -> usize {
        match &self.repr {
            RegsRepr::X86(r) => r.eax as usize,
            RegsRepr::X64(r) => r.rax as usize,
        }
    }

    pub fn syscall_result_signed(&self) -> isize {
        match &self.repr {
            RegsRepr::X86(r) => r.eax as i32 as isize,
            RegsRepr::X64(r) => r.rax as i64 as isize,
        }
    }

    pub fn set_syscall_result(&mut self, result: usize) {
        match &mut self.repr {
            RegsRepr::X86(r) => r.eax = result as u32,
            RegsRepr::X64(r) => r.rax = result as u64,
        }
    }

    pub fn set_syscall_result_from_remote_ptr<T>(&mut self, result: RemotePtr<T>) {
        self.set_syscall_result(result.as_usize());
    }

    /// A failed syscall leaves -errno in the result register; errno
    /// values fit in the last page of the address space.
    pub fn syscall_failed(&self) -> bool {
        let result = self.syscall_result_signed();
        -4096 < result && result < 0
    }

    pub fn syscall_may_restart(&self) -> bool {
        matches!(
            -self.syscall_result_signed(),
            // ERESTARTSYS | ERESTARTNOINTR | ERESTARTNOHAND | ERESTART_RESTARTBLOCK
            512 | 513 | 514 | 516
        )
    }

    pub fn arg1(&self) -> usize {
        match &self.repr {
            RegsRepr::X86(r) => r.ebx as usize,
            RegsRepr::X64(r) => r.rdi as usize,
        }
    }

    pub fn arg1_signed(&self) -> isize {
        match &self.repr {
            RegsRepr::X86(r) => r.ebx as i32 as isize,
            RegsRepr::X64(r) => r.rdi as i64 as isize,
        }
    }

    pub fn set_arg1(&mut self, value: usize) {
        match &mut self.repr {
            RegsRepr::X86(r) => r.ebx = value as u32,
            RegsRepr::X64(r) => r.rdi = value as u64,
        }
    }

    pub fn arg2(&self) -> usize {
        match &self.repr {
            RegsRepr::X86(r) => r.ecx as usize,
            RegsRepr::X64(r) => r.rsi as usize,
        }
    }

    pub fn arg2_signed(&self) -> isize {
        match &self.repr {
            RegsRepr::X86(r) => r.ecx as i32 as isize,
            RegsRepr::X64(r) => r.rsi as i64 as isize,
        }
    }

    pub fn set_arg2(&mut self, value: usize) {
        match &mut self.repr {
            RegsRepr::X86(r) => r.ecx = value as u32,
            RegsRepr::X64(r) => r.rsi = value as u64,
        }
    }

    pub fn arg3(&self) -> usize {
        match &self.repr {
            RegsRepr::X86(r) => r.edx as usize,
            RegsRepr::X64(r) => r.rdx as usize,
        }
    }

    pub fn arg3_signed(&self) -> isize {
        match &self.repr {
            RegsRepr::X86(r) => r.edx as i32 as isize,
            RegsRepr::X64(r) => r.rdx as i64 as isize,
        }
    }

    pub fn set_arg3(&mut self, value: usize) {
        match &mut self.repr {
            RegsRepr::X86(r) => r.edx = value as u32,
            RegsRepr::X64(r) => r.rdx = value as u64,
        }
    }

    pub fn arg4(&self) -> usize {
        match &self.repr {
            RegsRepr::X86(r) => r.esi as usize,
            RegsRepr::X64(r) => r.r10 as usize,
        }
    }

    pub fn arg4_signed(&self) -> isize {
        match &self.repr {
            RegsRepr::X86(r) => r.esi as i32 as isize,
            RegsRepr::X64(r) => r.r10 as i64 as isize,
        }
    }

    pub fn set_arg4(&mut self, value: usize) {
        match &mut self.repr {
            RegsRepr::X86(r) => r.esi = value as u32,
            RegsRepr::X64(r) => r.r10 = value as u64,
        }
    }

    pub fn arg5(&self) -> usize {
        match &self.repr {
            RegsRepr::X86(r) => r.edi as usize,
            RegsRepr::X64(r) => r.r8 as usize,
        }
    }

    pub fn set_arg5(&mut self, value: usize) {
        match &mut self.repr {
            RegsRepr::X86(r) => r.edi = value as u32,
            RegsRepr::X64(r) => r.r8 = value as u64,
        }
    }

    pub fn arg6(&self) -> usize {
        match &self.repr {
            RegsRepr::X86(r) => r.ebp as usize,
            RegsRepr::X64(r) => r.r9 as usize,
        }
    }

    pub fn set_arg6(&mut self, value: usize) {
        match &mut self.repr {
            RegsRepr::X86(r) => r.ebp = value as u32,
            RegsRepr::X64(r) => r.r9 = value as u64,
        }
    }

    pub fn arg(&self, index: usize) -> usize {
        match index {
            1 => self.arg1(),
            2 => self.arg2(),
            3 => self.arg3(),
            4 => self.arg4(),
            5 => self.arg5(),
            6 => self.arg6(),
            _ => fatal!("Argument index {} out of range", index),
        }
    }

    pub fn set_arg(&mut self, index: usize, value: usize) {
        match index {
            1 => self.set_arg1(value),
            2 => self.set_arg2(value),
            3 => self.set_arg3(value),
            4 => self.set_arg4(value),
            5 => self.set_arg5(value),
            6 => self.set_arg6(value),
            _ => fatal!("Argument index {} out of range", index),
        }
    }

    /// cx is where the `syscall` instruction stashes the return address;
    /// ecx doubles as arg2 on x86 but the normalization paths need the
    /// raw register.
    pub fn cx(&self) -> usize {
        match &self.repr {
            RegsRepr::X86(r) => r.ecx as usize,
            RegsRepr::X64(r) => r.rcx as usize,
        }
    }

    pub fn set_cx(&mut self, value: usize) {
        match &mut self.repr {
            RegsRepr::X86(r) => r.ecx = value as u32,
            RegsRepr::X64(r) => r.rcx = value as u64,
        }
    }

    pub fn r11(&self) -> usize {
        match &self.repr {
            RegsRepr::X86(_) => fatal!("r11 is not an x86 register"),
            RegsRepr::X64(r) => r.r11 as usize,
        }
    }

    pub fn set_r11(&mut self, value: usize) {
        match &mut self.repr {
            RegsRepr::X86(_) => fatal!("r11 is not an x86 register"),
            RegsRepr::X64(r) => r.r11 = value as u64,
        }
    }

    pub fn set_r8(&mut self, value: usize) {
        match &mut self.repr {
            RegsRepr::X86(_) => fatal!("r8 is not an x86 register"),
            RegsRepr::X64(r) => r.r8 = value as u64,
        }
    }

    pub fn set_r9(&mut self, value: usize) {
        match &mut self.repr {
            RegsRepr::X86(_) => fatal!("r9 is not an x86 register"),
            RegsRepr::X64(r) => r.r9 = value as u64,
        }
    }

    pub fn set_r10(&mut self, value: usize) {
        match &mut self.repr {
            RegsRepr::X86(_) => fatal!("r10 is not an x86 register"),
            RegsRepr::X64(r) => r.r10 = value as u64,
        }
    }

    /// The code segment selector, used to sniff whether a tracee has
    /// switched between 32- and 64-bit mode behind our back.
    pub fn cs(&self) -> usize {
        match &self.repr {
            RegsRepr::X86(r) => r.xcs as usize,
            RegsRepr::X64(r) => r.cs as usize,
        }
    }
}

fn x86_from_native(n: &X64UserRegs) -> X86UserRegs {
    X86UserRegs {
        ebx: n.rbx as u32,
        ecx: n.rcx as u32,
        edx: n.rdx as u32,
        esi: n.rsi as u32,
        edi: n.rdi as u32,
        ebp: n.rbp as u32,
        eax: n.rax as u32,
        xds: n.ds as u32,
        xes: n.es as u32,
        xfs: n.fs as u32,
        xgs: n.gs as u32,
        orig_eax: n.orig_rax as u32,
        eip: n.rip as u32,
        xcs: n.cs as u32,
        eflags: n.eflags as u32,
        esp: n.rsp as u32,
        xss: n.ss as u32,
    }
}

fn native_from_x86(r: &X86UserRegs) -> X64UserRegs {
    X64UserRegs {
        rbx: r.ebx as u64,
        rcx: r.ecx as u64,
        rdx: r.edx as u64,
        rsi: r.esi as u64,
        rdi: r.edi as u64,
        rbp: r.ebp as u64,
        rax: r.eax as i32 as i64 as u64,
        ds: r.xds as u64,
        es: r.xes as u64,
        fs: r.xfs as u64,
        gs: r.xgs as u64,
        orig_rax: r.orig_eax as i32 as i64 as u64,
        rip: r.eip as u64,
        cs: r.xcs as u64,
        eflags: r.eflags as u64,
        rsp: r.esp as u64,
        ss: r.xss as u64,
        ..Default::default()
    }
}

impl Debug for Registers {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{ ip:{} args:({:#x},{:#x},{:#x},{:#x},{:#x},{:#x}) orig_syscall:{} syscall_result:{:#x} flags:{:#x} }}",
            self.ip(),
            self.arg1(),
            self.arg2(),
            self.arg3(),
            self.arg4(),
            self.arg5(),
            self.arg6(),
            self.original_syscallno(),
            self.syscall_result(),
            self.flags()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn singlestep_flag_manipulation() {
        let mut r = Registers::new(SupportedArch::X64);
        r.set_flags(X86_CANONICAL_FLAGS | X86_TF_FLAG);
        assert!(r.singlestep_flag());
        r.clear_singlestep_flag();
        assert!(!r.singlestep_flag());
        assert_eq!(X86_CANONICAL_FLAGS, r.flags());
    }

    #[test]
    fn syscall_failure_detection() {
        let mut r = Registers::new(SupportedArch::X64);
        r.set_syscall_result(-(libc::ENOMEM as isize) as usize);
        assert!(r.syscall_failed());
        r.set_syscall_result(0);
        assert!(!r.syscall_failed());
        // A large address-like result is not a failure.
        r.set_syscall_result(0x7f00_0000_0000);
        assert!(!r.syscall_failed());
    }

    #[test]
    fn restart_errnos() {
        let mut r = Registers::new(SupportedArch::X64);
        for e in [512isize, 513, 514, 516] {
            r.set_syscall_result(-e as usize);
            assert!(r.syscall_may_restart(), "ERESTART value {}", e);
        }
        r.set_syscall_result(-515isize as usize);
        assert!(!r.syscall_may_restart());
    }

    #[test]
    fn x86_round_trip_through_native_layout() {
        let mut r = Registers::new(SupportedArch::X86);
        r.set_ip(RemoteCodePtr::new(0x0804_8000));
        r.set_arg1(7);
        r.set_original_syscallno(-1);
        let native = r.get_ptrace();
        let mut s = Registers::new(SupportedArch::X86);
        s.set_from_ptrace(&native);
        assert_eq!(r, s);
        assert_eq!(-1, s.original_syscallno());
    }

    #[test]
    fn original_syscallno_sign_extends_on_x86() {
        let mut r = Registers::new(SupportedArch::X86);
        r.set_original_syscallno(-1);
        assert_eq!(-1, r.original_syscallno());
    }
}
