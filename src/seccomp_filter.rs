//! Builder for the seccomp-bpf program installed in every tracee:
//! syscalls issued from the allow-listed untraced callsites pass straight
//! through; everything else generates a PTRACE_EVENT_SECCOMP trap.

use crate::kernel_supplement::{SECCOMP_DATA_IP_OFFSET, SECCOMP_RET_ALLOW, SECCOMP_RET_TRACE};
use crate::remote_code_ptr::RemoteCodePtr;
use libc::{sock_filter, sock_fprog};

const BPF_LD: u16 = 0x00;
const BPF_W: u16 = 0x00;
const BPF_ABS: u16 = 0x20;
const BPF_JMP: u16 = 0x05;
const BPF_JEQ: u16 = 0x10;
const BPF_K: u16 = 0x00;
const BPF_RET: u16 = 0x06;

fn stmt(code: u16, k: u32) -> sock_filter {
    sock_filter {
        code,
        jt: 0,
        jf: 0,
        k,
    }
}

fn jump(code: u16, k: u32, jt: u8, jf: u8) -> sock_filter {
    sock_filter { code, jt, jf, k }
}

pub struct SeccompFilter {
    pub filters: Vec<sock_filter>,
}

impl SeccompFilter {
    pub fn new() -> SeccompFilter {
        SeccompFilter {
            filters: Vec::new(),
        }
    }

    /// Allow any syscall whose low 32 bits of instruction pointer equal
    /// `ip`. The stub page sits below 4GB precisely so this comparison
    /// is sufficient.
    pub fn allow_syscalls_from_callsite(&mut self, ip: RemoteCodePtr) {
        let addr = ip.register_value();
        debug_assert_eq!(addr, addr as u32 as usize);
        self.filters
            .push(stmt(BPF_LD | BPF_W | BPF_ABS, SECCOMP_DATA_IP_OFFSET));
        self.filters.push(jump(BPF_JMP | BPF_JEQ | BPF_K, addr as u32, 0, 1));
        self.filters.push(stmt(BPF_RET | BPF_K, SECCOMP_RET_ALLOW));
    }

    /// Everything not allowed above traps to the tracer.
    pub fn trace(&mut self) {
        self.filters.push(stmt(BPF_RET | BPF_K, SECCOMP_RET_TRACE));
    }

    /// Install into the calling process. Must run in the tracee, after
    /// the tracer has attached and NO_NEW_PRIVS is set.
    pub fn install(&self) -> Result<(), ()> {
        let prog = sock_fprog {
            len: self.filters.len() as u16,
            filter: self.filters.as_ptr() as *mut sock_filter,
        };
        let ret = unsafe {
            libc::prctl(
                libc::PR_SET_SECCOMP,
                libc::SECCOMP_MODE_FILTER,
                &prog as *const sock_fprog,
                0,
                0,
            )
        };
        if ret < 0 {
            return Err(());
        }
        Ok(())
    }
}

impl Default for SeccompFilter {
    fn default() -> Self {
        SeccompFilter::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn callsite_allowance_is_three_instructions() {
        let mut f = SeccompFilter::new();
        f.allow_syscalls_from_callsite(RemoteCodePtr::new(0x70000006));
        f.trace();
        assert_eq!(4, f.filters.len());
        // Load of the IP word, then the comparison, then the verdicts.
        assert_eq!(BPF_LD | BPF_W | BPF_ABS, f.filters[0].code);
        assert_eq!(SECCOMP_DATA_IP_OFFSET, f.filters[0].k);
        assert_eq!(0x70000006, f.filters[1].k);
        assert_eq!(SECCOMP_RET_ALLOW, f.filters[2].k);
        assert_eq!(SECCOMP_RET_TRACE, f.filters[3].k);
    }
}
