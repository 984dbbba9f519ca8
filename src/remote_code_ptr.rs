use crate::kernel_abi::SupportedArch;
use crate::remote_ptr::{RemotePtr, Void};
use std::fmt::{self, Debug, Display, Formatter};
use std::ops::{Add, Sub};

/// The length of the x86 software breakpoint instruction (int3). The same
/// on both supported architectures.
pub const BREAKPOINT_INSN_LENGTH: usize = 1;

/// An address in the tracee that is known to point at code. Kept distinct
/// from `RemotePtr` so data and code addresses can't be confused; on some
/// architectures the two are not interchangeable, and the extra type
/// safety is cheap on x86.
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct RemoteCodePtr {
    ptr: usize,
}

impl RemoteCodePtr {
    pub fn new(ptr: usize) -> RemoteCodePtr {
        RemoteCodePtr { ptr }
    }

    pub fn null() -> RemoteCodePtr {
        RemoteCodePtr::new(0)
    }

    pub fn is_null(self) -> bool {
        self.ptr == 0
    }

    pub fn as_usize(self) -> usize {
        self.ptr
    }

    /// The value as it appears in a general-purpose register.
    pub fn register_value(self) -> usize {
        self.ptr
    }

    pub fn to_data_ptr<T>(self) -> RemotePtr<T> {
        RemotePtr::new(self.ptr)
    }

    pub fn increment_by_bkpt_insn_length(self, _arch: SupportedArch) -> RemoteCodePtr {
        RemoteCodePtr::new(self.ptr + BREAKPOINT_INSN_LENGTH)
    }

    pub fn decrement_by_bkpt_insn_length(self, _arch: SupportedArch) -> RemoteCodePtr {
        RemoteCodePtr::new(self.ptr - BREAKPOINT_INSN_LENGTH)
    }
}

impl Display for RemoteCodePtr {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.ptr)
    }
}

impl Debug for RemoteCodePtr {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.ptr)
    }
}

impl Add<usize> for RemoteCodePtr {
    type Output = Self;

    fn add(self, delta: usize) -> Self {
        RemoteCodePtr::new(self.ptr + delta)
    }
}

impl Sub<usize> for RemoteCodePtr {
    type Output = Self;

    fn sub(self, delta: usize) -> Self {
        RemoteCodePtr::new(self.ptr - delta)
    }
}

impl From<usize> for RemoteCodePtr {
    fn from(addr: usize) -> Self {
        RemoteCodePtr::new(addr)
    }
}

impl From<RemotePtr<Void>> for RemoteCodePtr {
    fn from(addr: RemotePtr<Void>) -> Self {
        RemoteCodePtr::new(addr.as_usize())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel_abi::SupportedArch;

    #[test]
    fn breakpoint_length_round_trip() {
        let p = RemoteCodePtr::new(0x1000);
        let q = p.increment_by_bkpt_insn_length(SupportedArch::X64);
        assert_eq!(0x1001, q.as_usize());
        assert_eq!(p, q.decrement_by_bkpt_insn_length(SupportedArch::X64));
    }
}
