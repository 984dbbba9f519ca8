//! The thin typed wrapper over the ptrace primitive: a raw fallible
//! call, a fatal-on-any-error variant, and the ESRCH-tolerant variant
//! every path that can race with tracee death must use.

use super::Task;
use crate::kernel_metadata::ptrace_req_name;
use crate::kernel_supplement::{PTRACE_GETEVENTMSG, PTRACE_SETSIGINFO};
use crate::log::LogDebug;
use crate::remote_ptr::{RemotePtr, Void};
use crate::util::{clear_errno, errno, u8_slice, u8_slice_mut};
use libc::{pid_t, siginfo_t, ESRCH};

/// The data argument of a ptrace request. Word-carrying requests pass
/// the value itself; buffer-carrying requests pass a pointer.
pub enum PtraceData<'a> {
    WriteInto(&'a mut [u8]),
    ReadFrom(&'a [u8]),
    ReadWord(usize),
    None,
}

impl<'a> PtraceData<'a> {
    fn as_raw(&mut self) -> *mut libc::c_void {
        match self {
            PtraceData::WriteInto(s) => s.as_mut_ptr() as *mut libc::c_void,
            PtraceData::ReadFrom(s) => s.as_ptr() as *mut libc::c_void,
            PtraceData::ReadWord(w) => *w as *mut libc::c_void,
            PtraceData::None => std::ptr::null_mut(),
        }
    }

    fn describe(&self) -> usize {
        match self {
            PtraceData::WriteInto(s) => s.as_ptr() as usize,
            PtraceData::ReadFrom(s) => s.as_ptr() as usize,
            PtraceData::ReadWord(w) => *w,
            PtraceData::None => 0,
        }
    }
}

impl Task {
    /// Make the ptrace request and return the raw result. The caller
    /// owns errno inspection.
    pub fn fallible_ptrace(
        &self,
        request: u32,
        addr: RemotePtr<Void>,
        mut data: PtraceData,
    ) -> isize {
        unsafe {
            libc::ptrace(
                request,
                self.tid,
                addr.as_usize() as *mut libc::c_void,
                data.as_raw(),
            ) as isize
        }
    }

    /// Like `fallible_ptrace` but all errors are fatal.
    pub fn xptrace(&self, request: u32, addr: RemotePtr<Void>, data: PtraceData) {
        clear_errno();
        let described = data.describe();
        self.fallible_ptrace(request, addr, data);
        let err = errno();
        ed_assert!(
            self,
            err == 0,
            "ptrace({}, {}, addr={}, data={:#x}) failed with errno {}",
            ptrace_req_name(request),
            self.tid,
            addr,
            described,
            err
        );
    }

    /// Like `xptrace` but ESRCH means the tracee died under us, which is
    /// never an error: any time during recording the task can take a
    /// SIGKILL from outside. Returns false on ESRCH.
    pub fn ptrace_if_alive(&self, request: u32, addr: RemotePtr<Void>, data: PtraceData) -> bool {
        clear_errno();
        let described = data.describe();
        self.fallible_ptrace(request, addr, data);
        let err = errno();
        if err == ESRCH {
            log!(LogDebug, "ptrace_if_alive tid {} was not alive", self.tid);
            return false;
        }
        ed_assert!(
            self,
            err == 0,
            "ptrace({}, {}, addr={}, data={:#x}) failed with errno {}",
            ptrace_req_name(request),
            self.tid,
            addr,
            described,
            err
        );
        true
    }

    /// The message pid of the current ptrace event, e.g. the new child's
    /// tid at a PTRACE_EVENT_CLONE stop.
    pub fn get_ptrace_eventmsg_pid(&self) -> pid_t {
        let mut msg: libc::c_ulong = 0;
        // A SIGKILL precisely timed between event generation and this
        // fetch would trip the assert; accepted.
        self.xptrace(
            PTRACE_GETEVENTMSG,
            RemotePtr::null(),
            PtraceData::WriteInto(u8_slice_mut(&mut msg)),
        );
        msg as pid_t
    }

    /// The seccomp filter's SECCOMP_RET_DATA at a seccomp event stop.
    pub fn get_ptrace_eventmsg_seccomp_data(&self) -> u16 {
        let mut msg: libc::c_ulong = 0;
        self.xptrace(
            PTRACE_GETEVENTMSG,
            RemotePtr::null(),
            PtraceData::WriteInto(u8_slice_mut(&mut msg)),
        );
        msg as u16
    }

    /// Override the siginfo the kernel will deliver at this signal-stop,
    /// mirroring the cached copy.
    pub fn set_siginfo(&mut self, si: &siginfo_t) {
        self.pending_siginfo = *si;
        self.ptrace_if_alive(
            PTRACE_SETSIGINFO,
            RemotePtr::null(),
            PtraceData::ReadFrom(u8_slice(si)),
        );
    }
}
