//! The retired-conditional-branch counter attached to each tracee
//! thread. One retired conditional branch is one "tick", the primary
//! timing unit of record and replay.

use crate::scoped_fd::ScopedFd;
use crate::ticks::Ticks;
use crate::util::{cpuid, CPUID_GETFEATURES};
use lazy_static::lazy_static;
use libc::pid_t;
use std::mem::size_of;
use std::os::unix::io::RawFd;

/// The signal delivered when the tick budget is exhausted. SIGSTKFLT is
/// otherwise unused on Linux.
pub const TIME_SLICE_SIGNAL: i32 = libc::SIGSTKFLT;

const PERF_TYPE_RAW: u32 = 4;

// perf_event_attr flag bits (bit positions per the uapi bitfield order).
const ATTR_DISABLED: u64 = 1 << 0;
const ATTR_PINNED: u64 = 1 << 2;
const ATTR_EXCLUDE_KERNEL: u64 = 1 << 5;
const ATTR_EXCLUDE_GUEST: u64 = 1 << 20;

// fcntl bits libc doesn't export.
const F_SETSIG: i32 = 10;
const F_SETOWN_EX: i32 = 15;
const F_OWNER_TID: i32 = 0;

#[repr(C)]
struct FOwnerEx {
    type_: i32,
    pid: i32,
}

/// Only the fields retrace programs; the rest of the uapi struct is left
/// zeroed. The kernel validates against `size`.
#[repr(C)]
#[derive(Default)]
struct perf_event_attr {
    type_: u32,
    size: u32,
    config: u64,
    sample_period: u64,
    sample_type: u64,
    read_format: u64,
    flags: u64,
    wakeup_events: u32,
    bp_type: u32,
    config1: u64,
    config2: u64,
    branch_sample_type: u64,
    sample_regs_user: u64,
    sample_stack_user: u32,
    clockid: i32,
    sample_regs_intr: u64,
    aux_watermark: u32,
    sample_max_stack: u16,
    _reserved: u16,
}

/// The raw event config counting retired conditional branches on this
/// microarchitecture.
struct Pmu {
    rcb_event: u64,
}

fn detect_pmu() -> Pmu {
    let vendor = cpuid(0, 0);
    // "GenuineIntel" / "AuthenticAMD" in ebx/edx/ecx.
    let is_intel = (vendor.ebx, vendor.edx, vendor.ecx) == (0x756e6547, 0x49656e69, 0x6c65746e);
    let is_amd = (vendor.ebx, vendor.edx, vendor.ecx) == (0x68747541, 0x69746e65, 0x444d4163);

    let features = cpuid(CPUID_GETFEATURES, 0);
    let family = (features.eax >> 8) & 0xf;
    let ext_family = (features.eax >> 20) & 0xff;

    if is_intel && family == 6 {
        // BR_INST_RETIRED.CONDITIONAL, in-kernel-filtered; stable across
        // Nehalem through at least Skylake.
        return Pmu {
            rcb_event: 0x5101c4,
        };
    }
    if is_amd && family + ext_family >= 0x17 {
        // RETIRED_CONDITIONAL_BRANCH_INSTRUCTIONS on Zen.
        return Pmu {
            rcb_event: 0x5100d1,
        };
    }
    fatal!(
        "Microarchitecture not supported: no known retired-conditional-branch event \
         (cpuid family {:#x}/{:#x})",
        family,
        ext_family
    );
}

lazy_static! {
    static ref PMU: Pmu = detect_pmu();
}

fn start_counter(tid: pid_t, attr: &perf_event_attr) -> ScopedFd {
    let fd = unsafe {
        libc::syscall(
            libc::SYS_perf_event_open,
            attr as *const perf_event_attr,
            tid,
            -1,
            -1,
            0,
        )
    } as RawFd;
    if fd < 0 {
        fatal!("Failed to initialize counter for tid {}", tid);
    }
    ScopedFd::from_raw(fd)
}

/// One counter per task. The fd stays open for the task's lifetime; the
/// counter is re-armed on every ticked resume and stopped at every stop.
pub struct PerfCounters {
    tid: pid_t,
    fd_ticks: ScopedFd,
    started: bool,
    counting: bool,
    last_read: Ticks,
}

impl PerfCounters {
    pub fn new(tid: pid_t) -> PerfCounters {
        PerfCounters {
            tid,
            fd_ticks: ScopedFd::new(),
            started: false,
            counting: false,
            last_read: 0,
        }
    }

    pub fn set_tid(&mut self, tid: pid_t) {
        self.stop();
        self.tid = tid;
    }

    /// Re-arm the counter with an interrupt after `ticks_period` retired
    /// conditional branches. The period must be nonzero; callers cap an
    /// unlimited request at 0xffffffff.
    pub fn reset(&mut self, ticks_period: Ticks) {
        debug_assert!(ticks_period > 0);

        if !self.started {
            let mut attr = perf_event_attr {
                type_: PERF_TYPE_RAW,
                size: size_of::<perf_event_attr>() as u32,
                config: PMU.rcb_event,
                sample_period: ticks_period,
                flags: ATTR_DISABLED | ATTR_PINNED | ATTR_EXCLUDE_KERNEL | ATTR_EXCLUDE_GUEST,
                ..Default::default()
            };
            attr.wakeup_events = 1;
            self.fd_ticks = start_counter(self.tid, &attr);

            // Deliver TIME_SLICE_SIGNAL to the tracee thread itself when
            // the period elapses; the resulting stop is what ends a
            // timeslice.
            let own = FOwnerEx {
                type_: F_OWNER_TID,
                pid: self.tid,
            };
            unsafe {
                if libc::fcntl(self.fd_ticks.as_raw(), F_SETOWN_EX, &own) != 0 {
                    fatal!("Failed to fcntl(F_SETOWN_EX) ticks fd for {}", self.tid);
                }
                if libc::fcntl(self.fd_ticks.as_raw(), libc::F_SETFL, libc::O_ASYNC) != 0 {
                    fatal!("Failed to fcntl(O_ASYNC) ticks fd for {}", self.tid);
                }
                if libc::fcntl(self.fd_ticks.as_raw(), F_SETSIG, TIME_SLICE_SIGNAL) != 0 {
                    fatal!("Failed to fcntl(F_SETSIG) ticks fd for {}", self.tid);
                }
            }
            self.started = true;
        } else {
            self.ioctl(crate::kernel_supplement::PERF_EVENT_IOC_RESET, 0);
            self.ioctl(
                crate::kernel_supplement::PERF_EVENT_IOC_PERIOD,
                &ticks_period as *const Ticks as usize,
            );
        }
        self.ioctl(crate::kernel_supplement::PERF_EVENT_IOC_ENABLE, 0);
        self.last_read = 0;
        self.counting = true;
    }

    fn ioctl(&self, request: libc::c_ulong, arg: usize) {
        if unsafe { libc::ioctl(self.fd_ticks.as_raw(), request, arg) } != 0 {
            fatal!("ioctl({:#x}) on ticks fd failed for {}", request, self.tid);
        }
    }

    /// Freeze the counter so tracer-side work on the stopped tracee can't
    /// perturb the count.
    pub fn stop_counting(&mut self) {
        if self.counting {
            self.ioctl(crate::kernel_supplement::PERF_EVENT_IOC_DISABLE, 0);
            self.counting = false;
        }
    }

    /// Tear the counter down entirely.
    pub fn stop(&mut self) {
        if self.started {
            self.fd_ticks.close();
            self.started = false;
            self.counting = false;
            self.last_read = 0;
        }
    }

    /// Ticks accumulated since the last `reset` or `read_ticks`,
    /// whichever is later.
    pub fn read_ticks(&mut self) -> Ticks {
        if !self.started || !self.counting {
            return 0;
        }
        let mut value: Ticks = 0;
        let nread = unsafe {
            libc::read(
                self.fd_ticks.as_raw(),
                &mut value as *mut Ticks as *mut libc::c_void,
                size_of::<Ticks>(),
            )
        };
        if nread != size_of::<Ticks>() as isize {
            fatal!("Failed to read ticks fd for {}", self.tid);
        }
        let delta = value - self.last_read;
        self.last_read = value;
        delta
    }

    /// The fd the forged time-slice siginfo names in si_fd.
    pub fn ticks_interrupt_fd(&self) -> RawFd {
        self.fd_ticks.as_raw()
    }
}

impl Drop for PerfCounters {
    fn drop(&mut self) {
        self.stop();
    }
}
