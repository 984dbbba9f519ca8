use crate::kernel_supplement::{SI_KERNEL, TRAP_BRKPT};
use crate::remote_ptr::{RemotePtr, Void};
use crate::scoped_fd::ScopedFd;
use lazy_static::lazy_static;
use raw_cpuid::{native_cpuid::cpuid_count, CpuIdResult};
use std::ffi::{CString, OsStr};
use std::os::unix::ffi::OsStrExt;

pub const CPUID_GETFEATURES: u32 = 0x01;
pub const CPUID_GETXSAVE: u32 = 0x0d;

pub const PAGE_SIZE: usize = 4096;

pub fn page_size() -> usize {
    PAGE_SIZE
}

pub fn floor_page_size<T>(addr: RemotePtr<T>) -> RemotePtr<T> {
    RemotePtr::new(addr.as_usize() & !(page_size() - 1))
}

pub fn ceil_page_size<T>(addr: RemotePtr<T>) -> RemotePtr<T> {
    RemotePtr::new((addr.as_usize() + page_size() - 1) & !(page_size() - 1))
}

pub fn errno() -> i32 {
    unsafe { *libc::__errno_location() }
}

pub fn clear_errno() {
    unsafe { *libc::__errno_location() = 0 };
}

pub fn cpuid(code: u32, subrequest: u32) -> CpuIdResult {
    cpuid_count(code, subrequest)
}

/// XSAVE presence and area size are process-wide constants; detect them
/// once on first use and never tear down.
pub struct XSaveLayout {
    pub supported: bool,
    /// Size in bytes of the XSAVE area (0 when unsupported).
    pub area_size: usize,
}

lazy_static! {
    static ref XSAVE_LAYOUT: XSaveLayout = {
        let features = cpuid(CPUID_GETFEATURES, 0);
        // CPUID.01H:ECX.XSAVE[bit 26]
        if features.ecx & (1 << 26) != 0 {
            let xsave = cpuid(CPUID_GETXSAVE, 0);
            XSaveLayout {
                supported: true,
                area_size: xsave.ecx as usize,
            }
        } else {
            XSaveLayout {
                supported: false,
                area_size: 0,
            }
        }
    };
}

pub fn xsave_native_layout() -> &'static XSaveLayout {
    &XSAVE_LAYOUT
}

/// Whether a SIGTRAP si_code denotes a trap raised by the kernel for a
/// breakpoint (int3 reports SI_KERNEL; hardware traps report TRAP_BRKPT).
pub fn is_kernel_trap(si_code: i32) -> bool {
    si_code == SI_KERNEL || si_code == TRAP_BRKPT
}

/// View any sized value as its raw bytes.
pub fn u8_slice<T: Sized>(v: &T) -> &[u8] {
    unsafe { std::slice::from_raw_parts(v as *const T as *const u8, std::mem::size_of::<T>()) }
}

pub fn u8_slice_mut<T: Sized>(v: &mut T) -> &mut [u8] {
    unsafe { std::slice::from_raw_parts_mut(v as *mut T as *mut u8, std::mem::size_of::<T>()) }
}

/// pwrite64 the whole buffer, retrying short writes. Returns the number
/// of bytes written; Err(()) only when nothing could be written and there
/// was an error.
pub fn pwrite_all_fallible(
    fd: std::os::unix::io::RawFd,
    buf: &[u8],
    mut offset: isize,
) -> Result<usize, ()> {
    let mut written: usize = 0;
    while written < buf.len() {
        clear_errno();
        let ret = unsafe {
            libc::pwrite64(
                fd,
                buf[written..].as_ptr() as *const libc::c_void,
                buf.len() - written,
                offset as libc::off64_t,
            )
        };
        if ret <= 0 {
            if written > 0 {
                clear_errno();
                return Ok(written);
            }
            return Err(());
        }
        written += ret as usize;
        offset += ret;
    }
    Ok(written)
}

/// Grow a freshly created shm file to its working size.
pub fn resize_shmem_segment(fd: &ScopedFd, num_bytes: usize) {
    if unsafe { libc::ftruncate(fd.as_raw(), num_bytes as libc::off_t) } < 0 {
        fatal!("Failed to resize shmem segment to {} bytes", num_bytes);
    }
}

/// Read /proc/<pid>/status and report whether the State: field says
/// zombie. Errors count as "zombie" so dead-process handling kicks in.
pub fn is_zombie_process(pid: libc::pid_t) -> bool {
    let contents = match std::fs::read_to_string(format!("/proc/{}/status", pid)) {
        Ok(s) => s,
        Err(_) => return true,
    };
    for line in contents.lines() {
        if let Some(state) = line.strip_prefix("State:") {
            return state.trim_start().starts_with('Z');
        }
    }
    true
}

pub fn to_cstring_array(args: &[impl AsRef<OsStr>]) -> Vec<CString> {
    args.iter()
        .map(|a| CString::new(a.as_ref().as_bytes()).unwrap())
        .collect()
}

pub fn to_cstr_array(cstrings: &[CString]) -> Vec<&std::ffi::CStr> {
    cstrings.iter().map(|c| c.as_c_str()).collect()
}

/// Bind the calling thread (and its future children) to one CPU.
pub fn set_cpu_affinity(cpu: u32) {
    let mut mask: libc::cpu_set_t = unsafe { std::mem::zeroed() };
    unsafe {
        libc::CPU_ZERO(&mut mask);
        libc::CPU_SET(cpu as usize, &mut mask);
        if libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &mask) < 0 {
            fatal!("Couldn't bind to CPU {}", cpu);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_rounding() {
        let p = RemotePtr::<Void>::new(0x1234);
        assert_eq!(0x1000, floor_page_size(p).as_usize());
        assert_eq!(0x2000, ceil_page_size(p).as_usize());
        let aligned = RemotePtr::<Void>::new(0x3000);
        assert_eq!(0x3000, floor_page_size(aligned).as_usize());
        assert_eq!(0x3000, ceil_page_size(aligned).as_usize());
    }

    #[test]
    fn kernel_trap_codes() {
        assert!(is_kernel_trap(SI_KERNEL));
        assert!(is_kernel_trap(TRAP_BRKPT));
        assert!(!is_kernel_trap(0));
    }

    #[test]
    fn u8_slice_views_bytes() {
        let v: u32 = 0x0403_0201;
        assert_eq!(&[1, 2, 3, 4], u8_slice(&v));
    }
}
