//! Remote memory I/O: the /proc/<tid>/mem path with its exec-stale-fd
//! and PROT_NONE workarounds, and the word-aligned ptrace fallback that
//! stays correct when a region abuts an unmapped page.

use super::{Task, WriteFlags};
use crate::auto_remote_syscalls::{AutoRemoteSyscalls, AutoRestoreMem};
use crate::kernel_abi::{syscall_number_for_close, syscall_number_for_mprotect, syscall_number_for_openat};
use crate::kernel_supplement::{PTRACE_PEEKDATA, PTRACE_POKEDATA};
use crate::log::{LogInfo, LogWarn};
use crate::memory_range::MemoryRange;
use crate::preload_interface::RETRACE_RESERVED_ROOT_DIR_FD;
use crate::remote_ptr::{RemotePtr, Void};
use crate::scoped_fd::ScopedFd;
use crate::task::ptrace::PtraceData;
use crate::util::{ceil_page_size, clear_errno, errno, floor_page_size, pwrite_all_fallible};
use nix::fcntl::OFlag;
use nix::sys::mman::{MapFlags, ProtFlags};
use std::cmp::min;
use std::ffi::{CStr, CString};
use std::mem::{size_of, zeroed};
use std::ptr::copy_nonoverlapping;
use std::slice;

impl Task {
    /// Open /proc/<tid>/mem for our AddressSpace, closing any old fd
    /// first. The tracee opens the file itself and smuggles the fd back,
    /// because on many systems only the process itself may open its mem
    /// file. Returns false if the process no longer exists.
    pub fn open_mem_fd(&mut self) -> bool {
        // Force the ptrace fallback while the fd is in flux.
        self.vm().set_mem_fd(ScopedFd::new());

        if !self.is_stopped {
            log!(
                LogWarn,
                "Can't retrieve mem fd for {}; process not stopped, racing with exec?",
                self.tid
            );
            return false;
        }

        let path = CStr::from_bytes_with_nul(b"/proc/self/mem\0").unwrap();

        let fd;
        {
            let mut remote = AutoRemoteSyscalls::new(self);
            let arch = remote.arch();
            let remote_fd: isize;
            {
                let mut remote_path = AutoRestoreMem::push_cstr(&mut remote, path);
                match remote_path.get() {
                    Some(addr) => {
                        // Skip the leading '/': the path is resolved
                        // relative to the reserved root-dir fd.
                        remote_fd = remote_path.syscall(
                            syscall_number_for_openat(arch),
                            &[
                                RETRACE_RESERVED_ROOT_DIR_FD as usize,
                                addr.as_usize() + 1,
                                libc::O_RDWR as usize,
                            ],
                        );
                    }
                    None => remote_fd = -(libc::ESRCH as isize),
                }
            }
            if remote_fd == -(libc::ESRCH as isize) {
                fd = ScopedFd::new();
            } else if remote_fd < 0 {
                // A process that fork()ed after setuid can no longer open
                // its own mem file; hopefully the tracer can (it is
                // usually more privileged).
                let buf = format!("/proc/{}/mem", remote.task().tid);
                fd = ScopedFd::open_path(buf.as_str(), OFlag::O_RDWR);
            } else {
                fd = remote.retrieve_fd(remote_fd as i32);
                // Leak the tracee's copy if the close fails because the
                // task got SIGKILLed; nothing to clean up then anyway.
                remote.syscall(
                    syscall_number_for_close(remote.arch()),
                    &[remote_fd as usize],
                );
            }
        }

        if !fd.is_open() {
            log!(
                LogInfo,
                "Can't retrieve mem fd for {}; process no longer exists?",
                self.tid
            );
            return false;
        }
        self.vm().set_mem_fd(fd);
        true
    }

    pub fn open_mem_fd_if_needed(&mut self) {
        if !self.vm().mem_fd_is_open() {
            self.open_mem_fd();
        }
    }

    /// Read tracee memory with PTRACE_PEEKDATA. Slow; only the fallback
    /// when no mem fd is available. Reads only aligned words, so the
    /// last byte before an unmapped region is always reachable. Returns
    /// bytes actually read.
    pub fn read_bytes_ptrace(&self, addr: RemotePtr<Void>, buf: &mut [u8]) -> usize {
        let mut nread: usize = 0;
        let word_size = size_of::<isize>();
        clear_errno();
        while nread < buf.len() {
            let start = addr.as_usize() + nread;
            let start_word = start & !(word_size - 1);
            let end_word = start_word + word_size;
            let length = min(end_word - start, buf.len() - nread);

            let v = self.fallible_ptrace(
                PTRACE_PEEKDATA,
                RemotePtr::new(start_word),
                PtraceData::None,
            );
            if errno() != 0 {
                break;
            }
            unsafe {
                copy_nonoverlapping(
                    (&v as *const isize as *const u8).add(start - start_word),
                    buf.as_mut_ptr().add(nread),
                    length,
                );
            }
            nread += length;
        }
        nread
    }

    /// Write tracee memory with PTRACE_POKEDATA; the boundary words are
    /// read-modify-written. Returns bytes actually written.
    pub fn write_bytes_ptrace(&self, addr: RemotePtr<Void>, buf: &[u8]) -> usize {
        let mut nwritten: usize = 0;
        let word_size = size_of::<isize>();
        clear_errno();
        while nwritten < buf.len() {
            let start = addr.as_usize() + nwritten;
            let start_word = start & !(word_size - 1);
            let end_word = start_word + word_size;
            let length = min(end_word - start, buf.len() - nwritten);

            let mut v: isize = 0;
            if length < word_size {
                v = self.fallible_ptrace(
                    PTRACE_PEEKDATA,
                    RemotePtr::new(start_word),
                    PtraceData::None,
                );
                if errno() != 0 {
                    break;
                }
            }
            unsafe {
                copy_nonoverlapping(
                    buf.as_ptr().add(nwritten),
                    (&mut v as *mut isize as *mut u8).add(start - start_word),
                    length,
                );
            }
            self.fallible_ptrace(
                PTRACE_POKEDATA,
                RemotePtr::new(start_word),
                PtraceData::ReadWord(v as usize),
            );
            if errno() != 0 {
                break;
            }
            nwritten += length;
        }
        nwritten
    }

    /// Read as many bytes as possible. Ok(n) when anything (or nothing,
    /// with no error) was read; Err(()) when nothing could be read and
    /// there was an error.
    pub fn read_bytes_fallible(
        &mut self,
        addr: RemotePtr<Void>,
        buf: &mut [u8],
    ) -> Result<usize, ()> {
        if buf.is_empty() {
            return Ok(0);
        }

        if !self.vm().mem_fd_is_open() {
            return Ok(self.read_bytes_ptrace(addr, buf));
        }

        let mut all_read = 0;
        let mut reopened_mem_fd = false;
        while all_read < buf.len() {
            clear_errno();
            let fd = self.vm().mem_fd_raw();
            let nread = unsafe {
                libc::pread64(
                    fd,
                    buf[all_read..].as_mut_ptr() as *mut libc::c_void,
                    buf.len() - all_read,
                    (addr.as_usize() + all_read) as libc::off64_t,
                )
            };
            // A mem fd opened very early during an exec can refer to the
            // pre-exec address space and reads 0 bytes with errno 0.
            // Reopening gets the post-exec resource. Retry exactly once,
            // and only when nothing has been read yet.
            if nread == 0 && all_read == 0 && errno() == 0 && !reopened_mem_fd {
                reopened_mem_fd = true;
                if !self.open_mem_fd() {
                    return Ok(0);
                }
                continue;
            }
            if nread <= 0 {
                if all_read > 0 {
                    // Partial success beats reporting the trailing error.
                    clear_errno();
                    return Ok(all_read);
                }
                return Err(());
            }
            all_read += nread as usize;
        }
        Ok(all_read)
    }

    /// Read exactly `buf.len()` bytes. Shortfall either flips `ok` to
    /// false or is fatal when no flag was supplied.
    pub fn read_bytes_helper(
        &mut self,
        addr: RemotePtr<Void>,
        buf: &mut [u8],
        ok: Option<&mut bool>,
    ) {
        let result = self.read_bytes_fallible(addr, buf);
        let nread = result.unwrap_or(0);
        if nread != buf.len() {
            match ok {
                Some(flag) => *flag = false,
                None => {
                    ed_assert!(
                        self,
                        false,
                        "Should have read {} bytes from {}, but only read {}",
                        buf.len(),
                        addr,
                        nread
                    );
                }
            }
        }
    }

    /// Read `buf.len()` bytes or die.
    pub fn read_bytes(&mut self, addr: RemotePtr<Void>, buf: &mut [u8]) {
        self.read_bytes_helper(addr, buf, None)
    }

    /// Read the NUL-terminated string at `child_addr`. Reads are
    /// page-clamped: only [child_addr, end-of-page) is known mapped, so
    /// each page is tried in turn until the terminator shows up.
    pub fn read_c_str(&mut self, child_addr: RemotePtr<u8>) -> CString {
        let mut p: RemotePtr<Void> = RemotePtr::cast(child_addr);
        let mut s: Vec<u8> = Vec::new();
        loop {
            let end_of_page = ceil_page_size(p + 1usize);
            let nbytes = end_of_page - p;
            let mut buf = vec![0u8; nbytes];
            self.read_bytes_helper(p, &mut buf, None);
            for &b in &buf {
                if b == 0 {
                    return CString::new(s).unwrap();
                }
                s.push(b);
            }
            p = end_of_page;
        }
    }

    /// Write the bytes, flipping `ok` (or dying) on shortfall. All
    /// writes funnel through here so watchpoint bookkeeping sees them.
    pub fn write_bytes_helper(
        &mut self,
        addr: RemotePtr<Void>,
        buf: &[u8],
        ok: Option<&mut bool>,
        flags: WriteFlags,
    ) {
        if buf.is_empty() {
            return;
        }

        if !self.vm().mem_fd_is_open() {
            let nwritten = self.write_bytes_ptrace(addr, buf);
            if nwritten > 0 {
                self.vm().notify_written(addr, nwritten, flags);
            }
            if let Some(flag) = ok {
                if nwritten < buf.len() {
                    *flag = false;
                }
            }
            return;
        }

        clear_errno();
        let nwritten_result = safe_pwrite64(self, buf, addr);
        // See the comment in read_bytes_fallible: a stale post-exec mem
        // fd reads and writes 0 bytes with no error.
        if let Ok(0) = nwritten_result {
            self.open_mem_fd();
            return self.write_bytes_helper(addr, buf, ok, flags);
        }
        if errno() == libc::EPERM {
            // PaX/SELinux forbids mem-fd writes to executable pages;
            // replacing the whole page works around that.
            if self.try_replace_pages(addr, buf) {
                self.vm().notify_written(addr, buf.len(), flags);
                return;
            }
            fatal!(
                "Can't write to /proc/{}/mem; maybe you need to disable \
                 grsecurity MPROTECT on this executable",
                self.tid
            );
        }

        let nwritten = nwritten_result.unwrap_or(0);
        match ok {
            Some(flag) => {
                if nwritten < buf.len() {
                    *flag = false;
                }
            }
            None => {
                ed_assert!(
                    self,
                    nwritten == buf.len(),
                    "Should have written {} bytes to {}, but only wrote {}",
                    buf.len(),
                    addr,
                    nwritten
                );
            }
        }
        if nwritten > 0 {
            self.vm().notify_written(addr, nwritten, flags);
        }
    }

    /// Write the bytes or die.
    pub fn write_bytes(&mut self, addr: RemotePtr<Void>, buf: &[u8]) {
        self.write_bytes_helper(addr, buf, None, WriteFlags::empty())
    }

    /// Write `buf` by mapping a temp file over the destination pages.
    /// This works around PaX-style kernels that reject mem-fd writes to
    /// executable pages. All covered pages must be private with uniform
    /// prot/flags.
    pub(super) fn try_replace_pages(&mut self, addr: RemotePtr<Void>, buf: &[u8]) -> bool {
        let page_start = floor_page_size(addr);
        let page_end = ceil_page_size(addr + buf.len());

        let mut all_prot: Option<ProtFlags> = None;
        let mut all_flags = MapFlags::empty();
        {
            let vm = self.vm();
            let mut p = page_start;
            while p < page_end {
                let m = match vm.mapping_of(p) {
                    Some(m) => m,
                    None => return false,
                };
                match all_prot {
                    Some(prot) => {
                        if prot != m.prot() || all_flags != m.flags() {
                            return false;
                        }
                    }
                    None => {
                        all_prot = Some(m.prot());
                        all_flags = m.flags();
                    }
                }
                p = p + crate::util::page_size();
            }
        }
        if !all_flags.contains(MapFlags::MAP_PRIVATE) {
            return false;
        }
        let all_prot = all_prot.unwrap();

        let mut cur = vec![0u8; page_end - page_start];
        self.read_bytes_helper(page_start, &mut cur, None);

        // Splice the new bytes into the current page contents in a temp
        // file, then have the tracee map the file MAP_FIXED over the
        // destination.
        let mut path: Vec<u8> = b"/tmp/retrace-replaced-pages-XXXXXX\0".to_vec();
        let fd = unsafe { libc::mkstemp(path.as_mut_ptr() as *mut libc::c_char) };
        ed_assert!(self, fd >= 0);
        let fd = ScopedFd::from_raw(fd);
        let nwritten =
            unsafe { libc::write(fd.as_raw(), cur.as_ptr() as *const libc::c_void, cur.len()) };
        ed_assert!(self, nwritten == cur.len() as isize);
        let nwritten = unsafe {
            libc::pwrite64(
                fd.as_raw(),
                buf.as_ptr() as *const libc::c_void,
                buf.len(),
                (addr - page_start) as libc::off64_t,
            )
        };
        ed_assert!(self, nwritten == buf.len() as isize);

        {
            let len = cur.len();
            let mut remote = AutoRemoteSyscalls::new(self);
            let arch = remote.arch();
            let child_fd;
            {
                let path_cstr = CStr::from_bytes_with_nul(&path).unwrap();
                let mut child_path = AutoRestoreMem::push_cstr(&mut remote, path_cstr);
                let addr_in_child = child_path.get().unwrap();
                child_fd = child_path.infallible_syscall(
                    syscall_number_for_openat(arch),
                    &[
                        RETRACE_RESERVED_ROOT_DIR_FD as usize,
                        addr_in_child.as_usize() + 1,
                        libc::O_RDWR as usize,
                    ],
                );
            }
            ed_assert!(remote.task(), child_fd >= 0);
            remote.infallible_mmap_syscall(
                page_start,
                len,
                all_prot,
                all_flags | MapFlags::MAP_FIXED,
                child_fd as i32,
                0,
            );
            remote.infallible_syscall(
                syscall_number_for_close(remote.arch()),
                &[child_fd as usize],
            );
        }

        unsafe { libc::unlink(path.as_ptr() as *const libc::c_char) };
        true
    }
}

/// pwrite64 to the mem fd, working around kernels where writes into
/// PROT_NONE regions fail (kernel bug 99101): any mapping in range
/// lacking both PROT_READ and PROT_WRITE is temporarily opened up with
/// an injected mprotect and restored afterwards.
pub(super) fn safe_pwrite64(
    t: &mut Task,
    buf: &[u8],
    addr: RemotePtr<Void>,
) -> Result<usize, ()> {
    let mut mappings_to_fix: Vec<(MemoryRange, ProtFlags)> = Vec::new();
    for m in t.vm().maps_containing_or_after(floor_page_size(addr)) {
        if m.start() >= ceil_page_size(addr + buf.len()) {
            break;
        }
        if !m
            .prot()
            .intersects(ProtFlags::PROT_READ | ProtFlags::PROT_WRITE)
        {
            mappings_to_fix.push((m.range(), m.prot()));
        }
    }

    let mem_fd = t.vm().mem_fd_raw();
    if mappings_to_fix.is_empty() {
        return pwrite_all_fallible(mem_fd, buf, addr.as_isize());
    }

    let mprotect_syscallno = syscall_number_for_mprotect(t.arch());
    let mut remote = AutoRemoteSyscalls::new(t);
    for (range, prot) in &mappings_to_fix {
        remote.infallible_syscall(
            mprotect_syscallno,
            &[
                range.start().as_usize(),
                range.size(),
                (*prot | ProtFlags::PROT_WRITE).bits() as usize,
            ],
        );
    }
    let nwritten = pwrite_all_fallible(mem_fd, buf, addr.as_isize());
    for (range, prot) in &mappings_to_fix {
        remote.infallible_syscall(
            mprotect_syscallno,
            &[range.start().as_usize(), range.size(), prot.bits() as usize],
        );
    }
    nwritten
}

// --- typed helpers -----------------------------------------------------

/// Read one `D` from tracee memory.
pub fn read_val_mem<D>(t: &mut Task, child_addr: RemotePtr<D>, ok: Option<&mut bool>) -> D {
    let mut v: D = unsafe { zeroed() };
    let buf = unsafe { slice::from_raw_parts_mut(&mut v as *mut D as *mut u8, size_of::<D>()) };
    t.read_bytes_helper(RemotePtr::cast(child_addr), buf, ok);
    v
}

/// Read `count` `D`s from tracee memory.
pub fn read_mem<D: Clone>(
    t: &mut Task,
    child_addr: RemotePtr<D>,
    count: usize,
    ok: Option<&mut bool>,
) -> Vec<D> {
    let mut v: Vec<D> = Vec::with_capacity(count);
    v.resize(count, unsafe { zeroed() });
    let buf =
        unsafe { slice::from_raw_parts_mut(v.as_mut_ptr() as *mut u8, count * size_of::<D>()) };
    t.read_bytes_helper(RemotePtr::cast(child_addr), buf, ok);
    v
}

/// Write one `D` into tracee memory.
pub fn write_val_mem<D>(t: &mut Task, child_addr: RemotePtr<D>, val: &D, ok: Option<&mut bool>) {
    let buf = unsafe { slice::from_raw_parts(val as *const D as *const u8, size_of::<D>()) };
    t.write_bytes_helper(RemotePtr::cast(child_addr), buf, ok, WriteFlags::empty());
}

/// Write a slice of `D`s into tracee memory.
pub fn write_mem<D>(t: &mut Task, child_addr: RemotePtr<D>, val: &[D], ok: Option<&mut bool>) {
    let buf = unsafe {
        slice::from_raw_parts(val.as_ptr() as *const u8, val.len() * size_of::<D>())
    };
    t.write_bytes_helper(RemotePtr::cast(child_addr), buf, ok, WriteFlags::empty());
}
