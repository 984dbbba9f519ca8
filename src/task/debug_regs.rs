//! x86 hardware debug register programming (DR0-DR3/DR7) and DR6
//! decoding into the reasons a SIGTRAP fired.

use super::{is_singlestep_resume, Task};
use crate::address_space::{AddressSpace, DebugStatus, WatchConfig};
use crate::kernel_supplement::{PTRACE_PEEKUSER, PTRACE_POKEUSER};
use crate::remote_ptr::RemotePtr;
use crate::task::ptrace::PtraceData;
use crate::util::{clear_errno, errno, is_kernel_trap};
use libc::{ESRCH, SIGTRAP};
use memoffset::offset_of;

const NUM_X86_DEBUG_REGS: usize = 8;
const NUM_X86_WATCHPOINTS: usize = 4;

/// Why a SIGTRAP was delivered. More than one can be true at once.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct TrapReasons {
    pub singlestep: bool,
    pub watchpoint: bool,
    pub breakpoint: bool,
}

fn dr_user_word_offset(i: usize) -> usize {
    debug_assert!(i < NUM_X86_DEBUG_REGS);
    offset_of!(libc::user, u_debugreg) + std::mem::size_of::<usize>() * i
}

/// DR7 length-field encoding.
fn num_bytes_to_dr_len(num_bytes: usize) -> usize {
    match num_bytes {
        1 => 0b00,
        2 => 0b01,
        4 => 0b11,
        8 => 0b10,
        _ => fatal!("Unsupported watchpoint size {}", num_bytes),
    }
}

/// Pack local-enable, type and length bits for the given slots.
fn dr7_packed(regs: &[WatchConfig]) -> usize {
    let mut dr7: usize = 0;
    for (i, reg) in regs.iter().enumerate() {
        // Local enable for slot i.
        dr7 |= 1 << (i * 2);
        dr7 |= (reg.type_ as usize) << (16 + i * 4);
        dr7 |= num_bytes_to_dr_len(reg.num_bytes) << (18 + i * 4);
    }
    dr7
}

impl Task {
    /// The debug status register (DR6). Cleared in resume_execution, so
    /// it only ever reflects events since the last resume.
    pub fn debug_status(&self) -> usize {
        clear_errno();
        let status = self.fallible_ptrace(
            PTRACE_PEEKUSER,
            RemotePtr::new(dr_user_word_offset(6)),
            PtraceData::None,
        );
        if errno() != 0 {
            return 0;
        }
        status as usize
    }

    pub fn set_debug_status(&self, status: usize) {
        self.set_debug_reg(6, status);
    }

    pub fn get_debug_reg(&self, regno: usize) -> usize {
        clear_errno();
        let result = self.fallible_ptrace(
            PTRACE_PEEKUSER,
            RemotePtr::new(dr_user_word_offset(regno)),
            PtraceData::None,
        );
        if errno() == ESRCH {
            return 0;
        }
        result as usize
    }

    pub fn set_debug_reg(&self, regno: usize, value: usize) -> bool {
        clear_errno();
        self.fallible_ptrace(
            PTRACE_POKEUSER,
            RemotePtr::new(dr_user_word_offset(regno)),
            PtraceData::ReadWord(value),
        );
        errno() == 0 || errno() == ESRCH
    }

    /// Program the hardware watchpoints to exactly `regs`. Atomic from
    /// the tracee's point of view: either every slot is programmed and
    /// true is returned, or no watchpoint is enabled and false is
    /// returned.
    pub fn set_debug_regs(&self, regs: &[WatchConfig]) -> bool {
        // Reset the debug status, and clear DR7 before touching the
        // address slots so a failure can never leave a partial set
        // enabled.
        self.ptrace_if_alive(
            PTRACE_POKEUSER,
            RemotePtr::new(dr_user_word_offset(6)),
            PtraceData::ReadWord(0),
        );
        self.ptrace_if_alive(
            PTRACE_POKEUSER,
            RemotePtr::new(dr_user_word_offset(7)),
            PtraceData::ReadWord(0),
        );
        if regs.len() > NUM_X86_WATCHPOINTS {
            return false;
        }

        for (dr, reg) in regs.iter().enumerate() {
            clear_errno();
            self.fallible_ptrace(
                PTRACE_POKEUSER,
                RemotePtr::new(dr_user_word_offset(dr)),
                PtraceData::ReadWord(reg.addr.as_usize()),
            );
            if errno() != 0 {
                return false;
            }
        }
        // The operation succeeds iff this final DR7 write does.
        clear_errno();
        self.fallible_ptrace(
            PTRACE_POKEUSER,
            RemotePtr::new(dr_user_word_offset(7)),
            PtraceData::ReadWord(dr7_packed(regs)),
        );
        errno() == 0
    }

    /// Determine why this SIGTRAP occurred. Reads the debug status but
    /// does not consume it.
    pub fn compute_trap_reasons(&mut self) -> TrapReasons {
        ed_assert_eq!(self, self.stop_sig(), Some(SIGTRAP));
        let mut reasons = TrapReasons::default();
        let status = self.debug_status();
        reasons.singlestep = status & DebugStatus::DsSingleStep as usize != 0;

        // Under some hypervisors (observed in VMware) single-stepping
        // does not trigger watchpoints, so watched values are rechecked
        // here. Write-watchpoints detect their value changed; read/exec
        // watchpoints stay broken in that configuration.
        if status & (DebugStatus::DsWatchpointAny as usize | DebugStatus::DsSingleStep as usize)
            != 0
        {
            self.vm().notify_watchpoint_fired(status);
        }
        if is_singlestep_resume(self.how_last_execution_resumed) {
            let vm = self.vm();
            vm.update_watchpoint_values(self);
        }
        reasons.watchpoint = self.vm().has_any_watchpoint_changes()
            || status & DebugStatus::DsWatchpointAny as usize != 0;

        // If a breakpoint fired, this is where it sat.
        let arch = self.arch();
        let ip_at_breakpoint = self.ip().decrement_by_bkpt_insn_length(arch);

        // Don't trust siginfo to report a breakpoint when a singlestep
        // or watchpoint triggered.
        if reasons.singlestep {
            let addr = self.address_of_last_execution_resume;
            reasons.breakpoint = AddressSpace::is_breakpoint_instruction(self, addr);
            if reasons.breakpoint {
                ed_assert_eq!(self, addr, ip_at_breakpoint);
            }
        } else if reasons.watchpoint {
            // Watchpoint state is completely accurate when we didn't
            // singlestep. The only way the trapping instruction is also
            // a breakpoint is an EXEC watchpoint on the breakpoint
            // address.
            reasons.breakpoint = self.vm().has_exec_watchpoint_fired(ip_at_breakpoint)
                && AddressSpace::is_breakpoint_instruction(self, ip_at_breakpoint);
        } else {
            let si = *self.get_siginfo();
            ed_assert_eq!(self, SIGTRAP, si.si_signo, "expected SIGTRAP, got {:?}", si.si_signo);
            reasons.breakpoint = is_kernel_trap(si.si_code);
            if reasons.breakpoint {
                ed_assert!(
                    self,
                    AddressSpace::is_breakpoint_instruction(self, ip_at_breakpoint),
                    "expected breakpoint at {}",
                    ip_at_breakpoint
                );
            }
        }
        reasons
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address_space::WatchType;

    #[test]
    fn dr7_packing_single_write_watchpoint() {
        let configs = [WatchConfig {
            addr: RemotePtr::new(0x1000),
            num_bytes: 4,
            type_: WatchType::WatchWrite,
        }];
        let dr7 = dr7_packed(&configs);
        // Slot 0 local enable.
        assert_eq!(1, dr7 & 0x3);
        // Type 01 (write) in bits 16-17, length 11 (4 bytes) in 18-19.
        assert_eq!(0b1101, (dr7 >> 16) & 0xf);
    }

    #[test]
    fn dr7_packing_four_slots() {
        let mk = |addr: usize, ty: WatchType, n: usize| WatchConfig {
            addr: RemotePtr::new(addr),
            num_bytes: n,
            type_: ty,
        };
        let configs = [
            mk(0x1000, WatchType::WatchExec, 1),
            mk(0x2000, WatchType::WatchWrite, 2),
            mk(0x3000, WatchType::WatchReadWrite, 4),
            mk(0x4000, WatchType::WatchReadWrite, 8),
        ];
        let dr7 = dr7_packed(&configs);
        // All four local-enable bits.
        assert_eq!(0b01010101, dr7 & 0xff);
        // Slot 0: exec, 1 byte => 0000.
        assert_eq!(0b0000, (dr7 >> 16) & 0xf);
        // Slot 1: write (01), 2 bytes (01) => 0101.
        assert_eq!(0b0101, (dr7 >> 20) & 0xf);
        // Slot 2: rw (11), 4 bytes (11) => 1111.
        assert_eq!(0b1111, (dr7 >> 24) & 0xf);
        // Slot 3: rw (11), 8 bytes (10) => 1011.
        assert_eq!(0b1011, (dr7 >> 28) & 0xf);
    }

    #[test]
    fn dr_len_encodings() {
        assert_eq!(0b00, num_bytes_to_dr_len(1));
        assert_eq!(0b01, num_bytes_to_dr_len(2));
        assert_eq!(0b11, num_bytes_to_dr_len(4));
        assert_eq!(0b10, num_bytes_to_dr_len(8));
    }
}
