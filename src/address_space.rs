//! The tracer-side shadow of a tracee address space: mappings as
//! /proc/<tid>/maps would show them, software breakpoints, hardware
//! watchpoint bookkeeping, and the per-address-space /proc/<tid>/mem fd.
//!
//! Multiple tasks (threads) share one AddressSpace. Methods take `&self`
//! and use interior mutability so a Task holding an `Rc` to its address
//! space can call in while itself mutably borrowed.

use crate::kernel_mapping::KernelMapping;
use crate::memory_range::MemoryRange;
use crate::preload_interface::{
    retrace_page_syscall_addr, RETRACE_PAGE_ADDR, RETRACE_PAGE_SYSCALL_INSTRUCTION_END,
    RETRACE_PAGE_SYSCALL_PRIVILEGED_TRACED, RETRACE_PAGE_SYSCALL_PRIVILEGED_UNTRACED,
    RETRACE_PAGE_SYSCALL_TRACED, RETRACE_PAGE_SYSCALL_UNTRACED,
    RETRACE_PAGE_SYSCALL_UNTRACED_REPLAYED,
};
use crate::remote_code_ptr::RemoteCodePtr;
use crate::remote_ptr::{RemotePtr, Void};
use crate::scoped_fd::ScopedFd;
use crate::task::{Task, TaskSharedWeakPtr, WriteFlags};
use crate::util::page_size;
use nix::sys::mman::{MapFlags, ProtFlags};
use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, HashMap};
use std::ffi::{OsStr, OsString};
use std::os::unix::io::RawFd;
use std::rc::Rc;

pub type AddressSpaceSharedPtr = Rc<AddressSpace>;

/// The int3 instruction.
pub const BREAKPOINT_INSN: u8 = 0xCC;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum BreakpointType {
    BkptNone,
    /// Trap for internal purposes (e.g. emulating a singlestep).
    BkptInternal,
    /// Trap on behalf of a debugger client.
    BkptUser,
}

/// Hardware watchpoint type, in the DR7 R/W-bits encoding.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum WatchType {
    WatchExec = 0x00,
    WatchWrite = 0x01,
    WatchReadWrite = 0x03,
}

/// DR6 bits the trap decoder consumes.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum DebugStatus {
    DsWatchpointAny = 0xf,
    DsSingleStep = 1 << 14,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct WatchConfig {
    pub addr: RemotePtr<Void>,
    pub num_bytes: usize,
    pub type_: WatchType,
}

struct Breakpoint {
    internal_count: u32,
    user_count: u32,
    /// The byte the int3 replaced.
    overwritten_data: u8,
}

impl Breakpoint {
    fn type_(&self) -> BreakpointType {
        // User breakpoints outrank internal ones: internal bookkeeping
        // must never hide a breakpoint the debugger placed.
        if self.user_count > 0 {
            BreakpointType::BkptUser
        } else {
            BreakpointType::BkptInternal
        }
    }

    fn count_for(&mut self, which: BreakpointType) -> &mut u32 {
        match which {
            BreakpointType::BkptInternal => &mut self.internal_count,
            BreakpointType::BkptUser => &mut self.user_count,
            BreakpointType::BkptNone => fatal!("Bad breakpoint type"),
        }
    }
}

struct Watchpoint {
    num_bytes: usize,
    type_: WatchType,
    /// Snapshot of the watched bytes, used to detect changes when the
    /// hardware fails to report (observed under some hypervisors).
    value_bytes: Vec<u8>,
    valid: bool,
    changed: bool,
    /// Debug register slot assigned by the last `all_watchpoints` call.
    dr_slot: Option<usize>,
}

/// Identity of an address space: the thread-group leader that created it
/// and how many execs it has survived.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct AddressSpaceUid {
    pub tgid: libc::pid_t,
    pub exec_count: u32,
}

pub struct AddressSpace {
    task_set: RefCell<Vec<TaskSharedWeakPtr>>,
    mem: RefCell<BTreeMap<MemoryRange, KernelMapping>>,
    mem_fd: RefCell<ScopedFd>,
    breakpoints: RefCell<HashMap<RemoteCodePtr, Breakpoint>>,
    watchpoints: RefCell<BTreeMap<MemoryRange, Watchpoint>>,
    exe_image: RefCell<OsString>,
    uid: Cell<AddressSpaceUid>,
    syscallbuf_enabled: Cell<bool>,
}

impl AddressSpace {
    pub fn new(exe_image: &OsStr, tgid: libc::pid_t, exec_count: u32) -> AddressSpace {
        AddressSpace {
            task_set: RefCell::new(Vec::new()),
            mem: RefCell::new(BTreeMap::new()),
            mem_fd: RefCell::new(ScopedFd::new()),
            breakpoints: RefCell::new(HashMap::new()),
            watchpoints: RefCell::new(BTreeMap::new()),
            exe_image: RefCell::new(exe_image.to_owned()),
            uid: Cell::new(AddressSpaceUid { tgid, exec_count }),
            syscallbuf_enabled: Cell::new(false),
        }
    }

    /// A copy for a forked child: same shadow mappings, no breakpoints
    /// or watchpoints (the child gets its own).
    pub fn clone_for_fork(&self, tgid: libc::pid_t) -> AddressSpace {
        AddressSpace {
            task_set: RefCell::new(Vec::new()),
            mem: RefCell::new(self.mem.borrow().clone()),
            mem_fd: RefCell::new(ScopedFd::new()),
            breakpoints: RefCell::new(HashMap::new()),
            watchpoints: RefCell::new(BTreeMap::new()),
            exe_image: RefCell::new(self.exe_image.borrow().clone()),
            uid: Cell::new(AddressSpaceUid { tgid, exec_count: 0 }),
            syscallbuf_enabled: Cell::new(self.syscallbuf_enabled.get()),
        }
    }

    pub fn uid(&self) -> AddressSpaceUid {
        self.uid.get()
    }

    pub fn exe_image(&self) -> OsString {
        self.exe_image.borrow().clone()
    }

    pub fn syscallbuf_enabled(&self) -> bool {
        self.syscallbuf_enabled.get()
    }

    pub fn set_syscallbuf_enabled(&self, enabled: bool) {
        self.syscallbuf_enabled.set(enabled);
    }

    pub fn insert_task(&self, t: TaskSharedWeakPtr) {
        let mut set = self.task_set.borrow_mut();
        if !set.iter().any(|w| w.ptr_eq(&t)) {
            set.push(t);
        }
    }

    pub fn erase_task(&self, t: &TaskSharedWeakPtr) {
        self.task_set
            .borrow_mut()
            .retain(|w| !w.ptr_eq(t) && w.strong_count() > 0);
    }

    pub fn task_set_is_empty(&self) -> bool {
        self.task_set
            .borrow()
            .iter()
            .all(|w| w.strong_count() == 0)
    }

    pub fn mem_fd_raw(&self) -> RawFd {
        self.mem_fd.borrow().as_raw()
    }

    pub fn mem_fd_is_open(&self) -> bool {
        self.mem_fd.borrow().is_open()
    }

    pub fn set_mem_fd(&self, fd: ScopedFd) {
        *self.mem_fd.borrow_mut() = fd;
    }

    // --- retrace-page geometry ------------------------------------------

    pub fn retrace_page_start() -> RemotePtr<Void> {
        RemotePtr::new(RETRACE_PAGE_ADDR)
    }

    pub fn retrace_page_end() -> RemotePtr<Void> {
        Self::retrace_page_start() + page_size()
    }

    fn ip_at_stub_end(stub_addr: usize) -> RemoteCodePtr {
        RemoteCodePtr::new(stub_addr + RETRACE_PAGE_SYSCALL_INSTRUCTION_END)
    }

    /// Entry address of the traced syscall stub: where injected
    /// syscalls start executing.
    pub fn traced_syscall_ip() -> RemoteCodePtr {
        RemoteCodePtr::new(RETRACE_PAGE_SYSCALL_TRACED)
    }

    pub fn privileged_traced_syscall_ip() -> RemoteCodePtr {
        RemoteCodePtr::new(RETRACE_PAGE_SYSCALL_PRIVILEGED_TRACED)
    }

    pub fn ip_in_untraced_syscall() -> RemoteCodePtr {
        Self::ip_at_stub_end(RETRACE_PAGE_SYSCALL_UNTRACED)
    }

    pub fn ip_in_untraced_replayed_syscall() -> RemoteCodePtr {
        Self::ip_at_stub_end(RETRACE_PAGE_SYSCALL_UNTRACED_REPLAYED)
    }

    pub fn ip_in_privileged_untraced_syscall() -> RemoteCodePtr {
        Self::ip_at_stub_end(RETRACE_PAGE_SYSCALL_PRIVILEGED_UNTRACED)
    }

    pub fn has_retrace_page_mapped(&self) -> bool {
        self.has_mapping(Self::retrace_page_start())
    }

    // --- mappings -------------------------------------------------------

    /// Record a new mapping, evicting any shadow state it overlaps.
    pub fn map(
        &self,
        start: RemotePtr<Void>,
        num_bytes: usize,
        prot: ProtFlags,
        flags: MapFlags,
        offset: u64,
        fsname: &OsStr,
        device: u64,
        inode: u64,
    ) -> KernelMapping {
        let m = KernelMapping::new(start, num_bytes, prot, flags, offset, fsname, device, inode);
        self.unmap_internal(start, num_bytes);
        self.mem.borrow_mut().insert(m.range(), m.clone());
        m
    }

    pub fn unmap(&self, addr: RemotePtr<Void>, num_bytes: usize) {
        self.unmap_internal(addr, num_bytes);
    }

    fn unmap_internal(&self, addr: RemotePtr<Void>, num_bytes: usize) {
        if num_bytes == 0 {
            return;
        }
        let dead = MemoryRange::new_range(addr, num_bytes);
        let mut mem = self.mem.borrow_mut();
        // Collect everything the dead range touches; put back the parts
        // outside it.
        let mut touched: Vec<KernelMapping> = Vec::new();
        loop {
            let key = match mem.get_key_value(&dead) {
                Some((r, _)) => *r,
                None => break,
            };
            touched.push(mem.remove(&key).unwrap());
        }
        for m in touched {
            if m.start() < dead.start() {
                let left = m.subrange(MemoryRange::from_range(m.start(), dead.start()));
                mem.insert(left.range(), left);
            }
            if dead.end() < m.end() {
                let right = m.subrange(MemoryRange::from_range(dead.end(), m.end()));
                mem.insert(right.range(), right);
            }
        }
    }

    pub fn protect(&self, addr: RemotePtr<Void>, num_bytes: usize, prot: ProtFlags) {
        if num_bytes == 0 {
            return;
        }
        let region = MemoryRange::new_range(addr, num_bytes);
        let mut mem = self.mem.borrow_mut();
        let mut touched: Vec<KernelMapping> = Vec::new();
        loop {
            let key = match mem.get_key_value(&region) {
                Some((r, _)) => *r,
                None => break,
            };
            touched.push(mem.remove(&key).unwrap());
        }
        for m in touched {
            if m.start() < region.start() {
                let left = m.subrange(MemoryRange::from_range(m.start(), region.start()));
                mem.insert(left.range(), left);
            }
            if region.end() < m.end() {
                let right = m.subrange(MemoryRange::from_range(region.end(), m.end()));
                mem.insert(right.range(), right);
            }
            let mut mid = m.subrange(m.range().intersect(&region));
            mid.set_prot(prot);
            mem.insert(mid.range(), mid);
        }
    }

    pub fn remap(
        &self,
        old_addr: RemotePtr<Void>,
        old_num_bytes: usize,
        new_addr: RemotePtr<Void>,
        new_num_bytes: usize,
    ) {
        let old = match self.mapping_of(old_addr) {
            Some(m) => m,
            None => {
                fatal!("mremap of unmapped region {}", old_addr);
            }
        };
        self.unmap_internal(old_addr, old_num_bytes);
        let moved = KernelMapping::new(
            new_addr,
            new_num_bytes,
            old.prot(),
            old.flags(),
            old.file_offset_bytes(),
            old.fsname(),
            old.device(),
            old.inode(),
        );
        self.unmap_internal(new_addr, new_num_bytes);
        self.mem.borrow_mut().insert(moved.range(), moved);
    }

    pub fn advise(&self, addr: RemotePtr<Void>, num_bytes: usize, advice: i32) {
        // Shadow layout does not change for any advice we let through;
        // kept as a hook so madvise replays stay visible in logs.
        log!(
            crate::log::LogDebug,
            "madvise({}, {:#x}, {})",
            addr,
            num_bytes,
            advice
        );
    }

    pub fn mapping_of(&self, addr: RemotePtr<Void>) -> Option<KernelMapping> {
        let probe = MemoryRange::new_range(addr, 1);
        self.mem.borrow().get(&probe).cloned()
    }

    pub fn has_mapping(&self, addr: RemotePtr<Void>) -> bool {
        self.mapping_of(addr).is_some()
    }

    pub fn maps(&self) -> Vec<KernelMapping> {
        self.mem.borrow().values().cloned().collect()
    }

    /// All mappings intersecting or above `start`, in address order.
    pub fn maps_containing_or_after(&self, start: RemotePtr<Void>) -> Vec<KernelMapping> {
        self.mem
            .borrow()
            .values()
            .filter(|m| m.end() > start)
            .cloned()
            .collect()
    }

    // --- breakpoints ----------------------------------------------------

    pub fn add_breakpoint(
        &self,
        t: &mut Task,
        addr: RemoteCodePtr,
        which: BreakpointType,
    ) -> bool {
        let need_insert = !self.breakpoints.borrow().contains_key(&addr);
        if need_insert {
            let mut overwritten = 0u8;
            let mut ok = true;
            t.read_bytes_helper(
                addr.to_data_ptr::<u8>(),
                std::slice::from_mut(&mut overwritten),
                Some(&mut ok),
            );
            if !ok {
                return false;
            }
            t.write_bytes_helper(
                addr.to_data_ptr::<u8>(),
                &[BREAKPOINT_INSN],
                Some(&mut ok),
                WriteFlags::IS_BREAKPOINT_RELATED,
            );
            if !ok {
                return false;
            }
            self.breakpoints.borrow_mut().insert(
                addr,
                Breakpoint {
                    internal_count: 0,
                    user_count: 0,
                    overwritten_data: overwritten,
                },
            );
        }
        let mut breakpoints = self.breakpoints.borrow_mut();
        let bp = breakpoints.get_mut(&addr).unwrap();
        *bp.count_for(which) += 1;
        true
    }

    pub fn remove_breakpoint(&self, t: &mut Task, addr: RemoteCodePtr, which: BreakpointType) {
        let mut restore: Option<u8> = None;
        {
            let mut breakpoints = self.breakpoints.borrow_mut();
            if let Some(bp) = breakpoints.get_mut(&addr) {
                let count = bp.count_for(which);
                debug_assert!(*count > 0);
                *count -= 1;
                if bp.internal_count == 0 && bp.user_count == 0 {
                    restore = Some(bp.overwritten_data);
                    breakpoints.remove(&addr);
                }
            }
        }
        if let Some(data) = restore {
            t.write_bytes_helper(
                addr.to_data_ptr::<u8>(),
                &[data],
                None,
                WriteFlags::IS_BREAKPOINT_RELATED,
            );
        }
    }

    pub fn remove_all_breakpoints(&self, t: &mut Task) {
        let addrs: Vec<(RemoteCodePtr, u8)> = self
            .breakpoints
            .borrow()
            .iter()
            .map(|(addr, bp)| (*addr, bp.overwritten_data))
            .collect();
        for (addr, data) in addrs {
            t.write_bytes_helper(
                addr.to_data_ptr::<u8>(),
                &[data],
                None,
                WriteFlags::IS_BREAKPOINT_RELATED,
            );
        }
        self.breakpoints.borrow_mut().clear();
    }

    pub fn get_breakpoint_type_at_addr(&self, addr: RemoteCodePtr) -> BreakpointType {
        self.breakpoints
            .borrow()
            .get(&addr)
            .map_or(BreakpointType::BkptNone, |bp| bp.type_())
    }

    /// Whether there is a breakpoint instruction at `ip`, whether we put
    /// it there or the tracee's own code contains one.
    pub fn is_breakpoint_instruction(t: &mut Task, ip: RemoteCodePtr) -> bool {
        if t.vm().get_breakpoint_type_at_addr(ip) != BreakpointType::BkptNone {
            return true;
        }
        let mut byte = 0u8;
        let mut ok = true;
        t.read_bytes_helper(
            ip.to_data_ptr::<u8>(),
            std::slice::from_mut(&mut byte),
            Some(&mut ok),
        );
        ok && byte == BREAKPOINT_INSN
    }

    /// Re-assert our breakpoint bytes in a forked child that CoW-shares
    /// the parent's memory image.
    pub fn did_fork_into(&self, child: &mut Task) {
        let bps: Vec<RemoteCodePtr> = self.breakpoints.borrow().keys().copied().collect();
        for addr in bps {
            child.write_bytes_helper(
                addr.to_data_ptr::<u8>(),
                &[BREAKPOINT_INSN],
                None,
                WriteFlags::IS_BREAKPOINT_RELATED,
            );
        }
    }

    // --- watchpoints ----------------------------------------------------

    pub fn add_watchpoint(
        &self,
        t: &mut Task,
        addr: RemotePtr<Void>,
        num_bytes: usize,
        type_: WatchType,
    ) -> bool {
        let range = MemoryRange::new_range(addr, num_bytes);
        let mut value_bytes = vec![0u8; num_bytes];
        let mut ok = true;
        t.read_bytes_helper(addr, &mut value_bytes, Some(&mut ok));
        self.watchpoints.borrow_mut().insert(
            range,
            Watchpoint {
                num_bytes,
                type_,
                value_bytes,
                valid: ok,
                changed: false,
                dr_slot: None,
            },
        );
        self.all_watchpoints().len() <= 4
    }

    pub fn remove_watchpoint(&self, addr: RemotePtr<Void>, num_bytes: usize) {
        let range = MemoryRange::new_range(addr, num_bytes);
        self.watchpoints.borrow_mut().remove(&range);
    }

    pub fn remove_all_watchpoints(&self) {
        self.watchpoints.borrow_mut().clear();
    }

    /// The watchpoint set in debug-register programming order. Slot
    /// indices are remembered so DR6 bits can be mapped back.
    pub fn all_watchpoints(&self) -> Vec<WatchConfig> {
        let mut configs = Vec::new();
        for (slot, (range, w)) in self.watchpoints.borrow_mut().iter_mut().enumerate() {
            w.dr_slot = Some(slot);
            configs.push(WatchConfig {
                addr: range.start(),
                num_bytes: w.num_bytes,
                type_: w.type_,
            });
        }
        configs
    }

    /// Decode DR6 watchpoint-hit bits into per-watchpoint changed flags.
    pub fn notify_watchpoint_fired(&self, debug_status: usize) {
        for w in self.watchpoints.borrow_mut().values_mut() {
            if let Some(slot) = w.dr_slot {
                if slot < 4 && debug_status & (1 << slot) != 0 {
                    w.changed = true;
                }
            }
        }
    }

    /// A write into tracee memory may have changed watched values behind
    /// the hardware's back.
    pub fn notify_written(&self, addr: RemotePtr<Void>, num_bytes: usize, flags: WriteFlags) {
        if flags.contains(WriteFlags::IS_BREAKPOINT_RELATED) {
            return;
        }
        let written = MemoryRange::new_range(addr, num_bytes);
        for (range, w) in self.watchpoints.borrow_mut().iter_mut() {
            if range.intersects(&written) && w.type_ != WatchType::WatchExec {
                w.changed = true;
            }
        }
    }

    pub fn has_any_watchpoint_changes(&self) -> bool {
        self.watchpoints.borrow().values().any(|w| w.changed)
    }

    pub fn has_exec_watchpoint_fired(&self, ip: RemoteCodePtr) -> bool {
        let p = ip.to_data_ptr::<Void>();
        self.watchpoints
            .borrow()
            .iter()
            .any(|(range, w)| w.changed && w.type_ == WatchType::WatchExec && range.contains_ptr(p))
    }

    /// Clear per-stop watchpoint state; called when the upper layer has
    /// consumed the trap reasons.
    pub fn consume_watchpoint_changes(&self) {
        for w in self.watchpoints.borrow_mut().values_mut() {
            w.changed = false;
        }
    }

    /// Refresh the cached value snapshots, e.g. after single-stepping in
    /// an environment where the hardware does not report watchpoint hits.
    pub fn update_watchpoint_values(&self, t: &mut Task) {
        for (range, w) in self.watchpoints.borrow_mut().iter_mut() {
            if !w.valid {
                continue;
            }
            let mut current = vec![0u8; w.num_bytes];
            let mut ok = true;
            t.read_bytes_helper(range.start(), &mut current, Some(&mut ok));
            if ok && current != w.value_bytes {
                w.changed = true;
                w.value_bytes = current;
            }
        }
    }

    pub fn post_exec_syscall(&self, _t: &mut Task) {
        // The fresh address space has no breakpoints or watchpoints yet;
        // the preload library will re-announce the retrace page.
        self.breakpoints.borrow_mut().clear();
        self.watchpoints.borrow_mut().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn space() -> AddressSpace {
        AddressSpace::new(OsStr::new("/bin/true"), 100, 0)
    }

    fn map_anon(vas: &AddressSpace, start: usize, len: usize) -> KernelMapping {
        vas.map(
            RemotePtr::new(start),
            len,
            ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
            MapFlags::MAP_PRIVATE | MapFlags::MAP_ANONYMOUS,
            0,
            OsStr::new(""),
            KernelMapping::NO_DEVICE,
            KernelMapping::NO_INODE,
        )
    }

    #[test]
    fn unmap_splits_mappings() {
        let vas = space();
        map_anon(&vas, 0x1000, 0x4000);
        vas.unmap(RemotePtr::new(0x2000), 0x1000);
        assert!(vas.has_mapping(RemotePtr::new(0x1000)));
        assert!(!vas.has_mapping(RemotePtr::new(0x2000)));
        assert!(vas.has_mapping(RemotePtr::new(0x3000)));
        let left = vas.mapping_of(RemotePtr::new(0x1000)).unwrap();
        assert_eq!(0x1000, left.size());
        let right = vas.mapping_of(RemotePtr::new(0x3000)).unwrap();
        assert_eq!(0x2000, right.size());
    }

    #[test]
    fn protect_splits_and_applies() {
        let vas = space();
        map_anon(&vas, 0x1000, 0x3000);
        vas.protect(RemotePtr::new(0x2000), 0x1000, ProtFlags::PROT_NONE);
        let m = vas.mapping_of(RemotePtr::new(0x2000)).unwrap();
        assert_eq!(ProtFlags::PROT_NONE, m.prot());
        assert_eq!(0x1000, m.size());
        let outer = vas.mapping_of(RemotePtr::new(0x1000)).unwrap();
        assert!(outer.prot().contains(ProtFlags::PROT_WRITE));
    }

    #[test]
    fn remap_moves_mapping() {
        let vas = space();
        map_anon(&vas, 0x1000, 0x2000);
        vas.remap(RemotePtr::new(0x1000), 0x2000, RemotePtr::new(0x8000), 0x4000);
        assert!(!vas.has_mapping(RemotePtr::new(0x1000)));
        let m = vas.mapping_of(RemotePtr::new(0x8000)).unwrap();
        assert_eq!(0x4000, m.size());
    }

    #[test]
    fn shmdt_style_lookup_finds_full_extent() {
        let vas = space();
        map_anon(&vas, 0x7000, 0x3000);
        let m = vas.mapping_of(RemotePtr::new(0x7000)).unwrap();
        assert_eq!(0x7000, m.start().as_usize());
        assert_eq!(0xa000, m.end().as_usize());
    }

    #[test]
    fn retrace_page_geometry() {
        assert_eq!(
            RETRACE_PAGE_ADDR,
            AddressSpace::traced_syscall_ip().as_usize()
        );
        assert_eq!(
            retrace_page_syscall_addr(2) + RETRACE_PAGE_SYSCALL_INSTRUCTION_END,
            AddressSpace::ip_in_untraced_syscall().as_usize()
        );
    }
}
