//! The narrow view of the on-disk trace the task core needs: where the
//! trace lives, the current event time, and how the initial exec was set
//! up. Encoding and decoding of trace data belong to the record/replay
//! layers, not here.

use std::cell::Cell;
use std::ffi::{OsStr, OsString};

pub type FrameTime = u64;

pub struct TraceStream {
    dir: OsString,
    global_time: Cell<FrameTime>,
    bound_to_cpu: Option<u32>,
    initial_exe: OsString,
    initial_argv: Vec<OsString>,
    initial_envp: Vec<OsString>,
    initial_cwd: OsString,
}

impl TraceStream {
    pub fn new(
        dir: OsString,
        bound_to_cpu: Option<u32>,
        initial_exe: OsString,
        initial_argv: Vec<OsString>,
        initial_envp: Vec<OsString>,
        initial_cwd: OsString,
    ) -> TraceStream {
        TraceStream {
            dir,
            global_time: Cell::new(0),
            bound_to_cpu,
            initial_exe,
            initial_argv,
            initial_envp,
            initial_cwd,
        }
    }

    pub fn dir(&self) -> &OsStr {
        &self.dir
    }

    pub fn time(&self) -> FrameTime {
        self.global_time.get()
    }

    pub fn tick_time(&self) {
        self.global_time.set(self.global_time.get() + 1);
    }

    pub fn bound_to_cpu(&self) -> Option<u32> {
        self.bound_to_cpu
    }

    pub fn initial_exe(&self) -> &OsStr {
        &self.initial_exe
    }

    pub fn initial_argv(&self) -> &[OsString] {
        &self.initial_argv
    }

    pub fn initial_envp(&self) -> &[OsString] {
        &self.initial_envp
    }

    pub fn initial_cwd(&self) -> &OsStr {
        &self.initial_cwd
    }
}
