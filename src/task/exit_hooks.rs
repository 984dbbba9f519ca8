//! Shadow-state side effects of completed syscalls: after every
//! syscall-exit stop the upper layer calls `on_syscall_exit`, and the
//! AddressSpace/FdTable/Task mirrors are brought in line with what the
//! kernel just did. No ptrace traffic happens here.

use super::{read_mem, Task};
use crate::file_monitor;
use crate::kernel_abi::{Architecture, F_DUPFD, F_DUPFD_CLOEXEC};
use crate::kernel_supplement::SHMDT;
use crate::log::LogDebug;
use crate::registers::Registers;
use crate::remote_ptr::{RemotePtr, Void};
use nix::sys::mman::ProtFlags;
use std::cmp::min;

fn process_shmdt(t: &mut Task, addr: RemotePtr<Void>) {
    let mapping = match t.vm().mapping_of(addr) {
        Some(m) => m,
        None => {
            ed_assert!(t, false, "shmdt of unmapped address {}", addr);
            return;
        }
    };
    ed_assert_eq!(t, mapping.start(), addr);
    let size = mapping.end() - addr;
    t.vm().unmap(addr, size);
}

fn on_syscall_exit_arch<Arch: Architecture>(t: &mut Task, sys: i32, regs: &Registers) {
    t.session().accumulate_syscall_performed();

    // mprotect can change the protection of a prefix of its range before
    // failing; it must be replayed into the shadow even on failure.
    if regs.syscall_failed() && !crate::kernel_abi::is_mprotect_syscall(sys, regs.arch()) {
        return;
    }

    let sys = sys as u32;

    if sys == Arch::BRK || sys == Arch::MMAP || sys == Arch::MMAP2 {
        log!(
            LogDebug,
            "(brk/mmap/mmap2 will receive / has received direct processing)"
        );
        return;
    }

    if sys == Arch::MPROTECT {
        let addr: RemotePtr<Void> = regs.arg1().into();
        let num_bytes = regs.arg2();
        let prot = regs.arg3_signed() as i32;
        let prot_flags = ProtFlags::from_bits(prot).unwrap_or_else(|| {
            fatal!("Unrecognized mprotect prot {:#x}", prot);
        });
        t.vm().protect(addr, num_bytes, prot_flags);
        return;
    }

    if sys == Arch::MREMAP {
        let old_addr: RemotePtr<Void> = regs.arg1().into();
        let old_num_bytes = regs.arg2();
        let new_addr: RemotePtr<Void> = regs.syscall_result().into();
        let new_num_bytes = regs.arg3();
        t.vm().remap(old_addr, old_num_bytes, new_addr, new_num_bytes);
        return;
    }

    if sys == Arch::MUNMAP {
        let addr: RemotePtr<Void> = regs.arg1().into();
        let num_bytes = regs.arg2();
        t.vm().unmap(addr, num_bytes);
        return;
    }

    if sys == Arch::SHMDT {
        return process_shmdt(t, regs.arg1().into());
    }

    if sys == Arch::MADVISE {
        let addr: RemotePtr<Void> = regs.arg1().into();
        let num_bytes = regs.arg2();
        let advice = regs.arg3() as i32;
        return t.vm().advise(addr, num_bytes, advice);
    }

    if sys == Arch::IPC {
        // The x86 ipc() multiplexer: only shmdt matters here.
        if regs.arg1() as u32 == SHMDT {
            return process_shmdt(t, regs.arg5().into());
        }
        return;
    }

    if sys == Arch::SET_THREAD_AREA {
        t.set_thread_area(regs.arg1().into());
        return;
    }

    if sys == Arch::PRCTL {
        if regs.arg1_signed() as i32 == libc::PR_SET_NAME {
            t.update_prname(regs.arg2().into());
        }
        return;
    }

    if sys == Arch::DUP || sys == Arch::DUP2 || sys == Arch::DUP3 {
        t.fd_table()
            .did_dup(regs.arg1() as i32, regs.syscall_result() as i32);
        return;
    }

    if sys == Arch::FCNTL || sys == Arch::FCNTL64 {
        if regs.arg2() == F_DUPFD || regs.arg2() == F_DUPFD_CLOEXEC {
            t.fd_table()
                .did_dup(regs.arg1() as i32, regs.syscall_result() as i32);
        }
        return;
    }

    if sys == Arch::CLOSE {
        t.fd_table().did_close(regs.arg1() as i32);
        return;
    }

    if sys == Arch::UNSHARE {
        if regs.arg1() & libc::CLONE_FILES as usize != 0 {
            let weak = t.weak_self_ptr();
            let old_table = t.fd_table();
            old_table.erase_task(&weak);
            let new_table = old_table.clone_table();
            new_table.insert_task(weak);
            t.fds = Some(new_table);
        }
        return;
    }

    if sys == Arch::WRITE || sys == Arch::PWRITE64 {
        let fd = regs.arg1_signed() as i32;
        let mut ranges: Vec<file_monitor::Range> = Vec::new();
        let amount = regs.syscall_result_signed();
        if amount > 0 {
            ranges.push(file_monitor::Range::new(regs.arg2().into(), amount as usize));
        }
        let table = t.fd_table();
        table.did_write(t, fd, ranges);
        return;
    }

    if sys == Arch::WRITEV || sys == Arch::PWRITEV {
        let fd = regs.arg1_signed() as i32;
        let iovecs: Vec<Arch::iovec> =
            read_mem(t, RemotePtr::new(regs.arg2()), regs.arg3(), None);
        let mut written = regs.syscall_result_signed();
        ed_assert!(t, written >= 0);
        let mut ranges: Vec<file_monitor::Range> = Vec::new();
        for v in iovecs {
            let (base, len) = Arch::iovec_parts(v);
            let amount = min(written, len as isize);
            if amount > 0 {
                ranges.push(file_monitor::Range::new(base, amount as usize));
                written -= amount;
            }
        }
        let table = t.fd_table();
        table.did_write(t, fd, ranges);
    }
}

impl Task {
    /// Apply the shadow-state effects of a completed syscall. `regs` is
    /// passed explicitly rather than read from the task: callers may be
    /// replaying recorded registers that differ from the live ones.
    pub fn on_syscall_exit(&mut self, syscallno: i32, regs: &Registers) {
        let arch = regs.arch();
        arch_function!(on_syscall_exit_arch, arch, self, syscallno, regs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address_space::AddressSpace;
    use crate::fd_table::FdTable;
    use crate::file_monitor::PreserveFileMonitor;
    use crate::kernel_abi::{x64, SupportedArch};
    use crate::kernel_mapping::KernelMapping;
    use crate::session::{Session, SessionKind};
    use crate::task::Task;
    use crate::trace_stream::TraceStream;
    use nix::sys::mman::MapFlags;
    use std::cell::RefCell;
    use std::ffi::OsStr;
    use std::rc::Rc;

    fn shadow_task() -> Task {
        let trace = TraceStream::new(
            "/tmp/trace".into(),
            None,
            "/bin/true".into(),
            vec!["/bin/true".into()],
            vec![],
            "/".into(),
        );
        let session = Session::new(SessionKind::Recording, trace);
        let mut t = Task::new(session.weak_self_ptr(), 500, 500, 1, SupportedArch::X64);
        t.as_ = Some(Rc::new(AddressSpace::new(OsStr::new("/bin/true"), 500, 0)));
        t.fds = Some(FdTable::create());
        // Keep the session alive for the duration of the test.
        std::mem::forget(session);
        t
    }

    fn map_anon(t: &Task, start: usize, len: usize) {
        t.vm().map(
            RemotePtr::new(start),
            len,
            ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
            MapFlags::MAP_PRIVATE | MapFlags::MAP_ANONYMOUS,
            0,
            OsStr::new(""),
            KernelMapping::NO_DEVICE,
            KernelMapping::NO_INODE,
        );
    }

    fn syscall_regs(sys: u32, args: &[usize], result: usize) -> Registers {
        let mut regs = Registers::new(SupportedArch::X64);
        regs.set_original_syscallno(sys as isize);
        for (i, a) in args.iter().enumerate() {
            regs.set_arg(i + 1, *a);
        }
        regs.set_syscall_result(result);
        regs
    }

    #[test]
    fn munmap_updates_shadow() {
        let mut t = shadow_task();
        map_anon(&t, 0x10000, 0x4000);
        let regs = syscall_regs(x64::MUNMAP, &[0x11000, 0x1000], 0);
        t.on_syscall_exit(x64::MUNMAP as i32, &regs);
        assert!(t.vm().has_mapping(RemotePtr::new(0x10000)));
        assert!(!t.vm().has_mapping(RemotePtr::new(0x11000)));
        assert!(t.vm().has_mapping(RemotePtr::new(0x12000)));
    }

    #[test]
    fn failed_mprotect_is_still_replayed() {
        let mut t = shadow_task();
        map_anon(&t, 0x20000, 0x2000);
        // mprotect can apply to a prefix before failing, so even a
        // failed call reaches the shadow.
        let mut regs = syscall_regs(
            x64::MPROTECT,
            &[0x20000, 0x1000, ProtFlags::PROT_READ.bits() as usize],
            0,
        );
        regs.set_syscall_result(-(libc::ENOMEM as isize) as usize);
        t.on_syscall_exit(x64::MPROTECT as i32, &regs);
        let m = t.vm().mapping_of(RemotePtr::new(0x20000)).unwrap();
        assert_eq!(ProtFlags::PROT_READ, m.prot());
    }

    #[test]
    fn failed_munmap_is_ignored() {
        let mut t = shadow_task();
        map_anon(&t, 0x30000, 0x1000);
        let mut regs = syscall_regs(x64::MUNMAP, &[0x30000, 0x1000], 0);
        regs.set_syscall_result(-(libc::EINVAL as isize) as usize);
        t.on_syscall_exit(x64::MUNMAP as i32, &regs);
        assert!(t.vm().has_mapping(RemotePtr::new(0x30000)));
    }

    #[test]
    fn mremap_moves_shadow_mapping() {
        let mut t = shadow_task();
        map_anon(&t, 0x40000, 0x2000);
        let mut regs = syscall_regs(x64::MREMAP, &[0x40000, 0x2000, 0x4000], 0);
        regs.set_syscall_result(0x50000);
        t.on_syscall_exit(x64::MREMAP as i32, &regs);
        assert!(!t.vm().has_mapping(RemotePtr::new(0x40000)));
        let m = t.vm().mapping_of(RemotePtr::new(0x50000)).unwrap();
        assert_eq!(0x4000, m.size());
    }

    #[test]
    fn dup_and_close_update_fd_shadow() {
        let mut t = shadow_task();
        t.fd_table().add_monitor(
            5,
            Rc::new(RefCell::new(crate::file_monitor::StdioMonitor::new(5))),
        );

        let regs = syscall_regs(x64::DUP, &[5], 9);
        t.on_syscall_exit(x64::DUP as i32, &regs);
        assert!(t.fd_table().is_monitoring(9));

        let regs = syscall_regs(x64::FCNTL, &[5, crate::kernel_abi::F_DUPFD_CLOEXEC], 11);
        t.on_syscall_exit(x64::FCNTL as i32, &regs);
        assert!(t.fd_table().is_monitoring(11));

        let regs = syscall_regs(x64::CLOSE, &[11], 0);
        t.on_syscall_exit(x64::CLOSE as i32, &regs);
        assert!(!t.fd_table().is_monitoring(11));
    }

    #[test]
    fn unshare_clone_files_swaps_table() {
        let mut t = shadow_task();
        let old_table = t.fd_table();
        old_table.add_monitor(3, Rc::new(RefCell::new(PreserveFileMonitor::new())));
        let regs = syscall_regs(x64::UNSHARE, &[libc::CLONE_FILES as usize], 0);
        t.on_syscall_exit(x64::UNSHARE as i32, &regs);
        assert!(!Rc::ptr_eq(&old_table, &t.fd_table()));
        // The clone carries the monitors forward.
        assert!(t.fd_table().is_monitoring(3));
    }
}
