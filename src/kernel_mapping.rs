use crate::memory_range::MemoryRange;
use crate::remote_ptr::{RemotePtr, Void};
use nix::sys::mman::{MapFlags, ProtFlags};
use std::ffi::{OsStr, OsString};
use std::fmt::{self, Display, Formatter};

/// One mapping in a tracee's address space, as /proc/<tid>/maps would
/// describe it.
#[derive(Clone)]
pub struct KernelMapping {
    range: MemoryRange,
    fsname: OsString,
    device: u64,
    inode: u64,
    prot: ProtFlags,
    flags: MapFlags,
    offset: u64,
}

impl KernelMapping {
    pub const NO_DEVICE: u64 = 0;
    pub const NO_INODE: u64 = 0;

    pub fn new(
        start: RemotePtr<Void>,
        num_bytes: usize,
        prot: ProtFlags,
        flags: MapFlags,
        offset: u64,
        fsname: &OsStr,
        device: u64,
        inode: u64,
    ) -> KernelMapping {
        KernelMapping {
            range: MemoryRange::new_range(start, num_bytes),
            fsname: fsname.to_owned(),
            device,
            inode,
            prot,
            flags,
            offset,
        }
    }

    pub fn range(&self) -> MemoryRange {
        self.range
    }

    pub fn start(&self) -> RemotePtr<Void> {
        self.range.start()
    }

    pub fn end(&self) -> RemotePtr<Void> {
        self.range.end()
    }

    pub fn size(&self) -> usize {
        self.range.size()
    }

    pub fn prot(&self) -> ProtFlags {
        self.prot
    }

    pub fn flags(&self) -> MapFlags {
        self.flags
    }

    pub fn file_offset_bytes(&self) -> u64 {
        self.offset
    }

    pub fn fsname(&self) -> &OsStr {
        &self.fsname
    }

    pub fn device(&self) -> u64 {
        self.device
    }

    pub fn inode(&self) -> u64 {
        self.inode
    }

    pub fn is_heap(&self) -> bool {
        self.fsname == "[heap]"
    }

    pub fn is_stack(&self) -> bool {
        self.fsname.to_string_lossy().starts_with("[stack")
    }

    pub fn is_vdso(&self) -> bool {
        self.fsname == "[vdso]"
    }

    /// A copy of this mapping restricted to `range`, with the file
    /// offset adjusted to match.
    pub fn subrange(&self, range: MemoryRange) -> KernelMapping {
        debug_assert!(self.range.contains(&range));
        let offset_delta = (range.start() - self.start()) as u64;
        KernelMapping {
            range,
            fsname: self.fsname.clone(),
            device: self.device,
            inode: self.inode,
            prot: self.prot,
            flags: self.flags,
            offset: self.offset + offset_delta,
        }
    }

    pub fn set_prot(&mut self, prot: ProtFlags) {
        self.prot = prot;
    }
}

impl Display for KernelMapping {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}{}{}{} {:#x} {:?}",
            self.range,
            if self.prot.contains(ProtFlags::PROT_READ) {
                "r"
            } else {
                "-"
            },
            if self.prot.contains(ProtFlags::PROT_WRITE) {
                "w"
            } else {
                "-"
            },
            if self.prot.contains(ProtFlags::PROT_EXEC) {
                "x"
            } else {
                "-"
            },
            if self.flags.contains(MapFlags::MAP_SHARED) {
                "s"
            } else {
                "p"
            },
            self.offset,
            self.fsname
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subrange_adjusts_offset() {
        let m = KernelMapping::new(
            RemotePtr::new(0x1000),
            0x3000,
            ProtFlags::PROT_READ,
            MapFlags::MAP_PRIVATE,
            0x5000,
            OsStr::new("/lib/libfoo.so"),
            KernelMapping::NO_DEVICE,
            KernelMapping::NO_INODE,
        );
        let sub = m.subrange(MemoryRange::new_range(RemotePtr::new(0x2000), 0x1000));
        assert_eq!(0x2000, sub.start().as_usize());
        assert_eq!(0x1000, sub.size());
        assert_eq!(0x6000, sub.file_offset_bytes());
        assert_eq!(m.prot(), sub.prot());
    }
}
