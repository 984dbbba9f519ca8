//! Monitors attached to specific tracee fds. A monitor observes the
//! byte ranges a tracee wrote through its fd; what it does with them is
//! its own business (mirror them, preserve the fd, feed save-data).

use crate::remote_ptr::{RemotePtr, Void};
use crate::task::Task;

/// A range of tracee memory that was written out through an fd.
#[derive(Copy, Clone, Debug)]
pub struct Range {
    pub data: RemotePtr<Void>,
    pub length: usize,
}

impl Range {
    pub fn new(data: RemotePtr<Void>, length: usize) -> Range {
        Range { data, length }
    }
}

pub trait FileMonitor {
    /// Name for diagnostics.
    fn name(&self) -> &'static str;

    /// Whether the fd must survive attempts to close or overwrite it.
    fn is_preserved(&self) -> bool {
        false
    }

    /// The tracee wrote these ranges through the monitored fd.
    fn did_write(&mut self, _t: &mut Task, _ranges: &[Range]) {}
}

/// During replay writes to stdio are echoed to the real stdout/stderr so
/// the replayed program output is visible.
pub struct StdioMonitor {
    fd: i32,
}

impl StdioMonitor {
    pub fn new(fd: i32) -> StdioMonitor {
        StdioMonitor { fd }
    }
}

impl FileMonitor for StdioMonitor {
    fn name(&self) -> &'static str {
        "StdioMonitor"
    }

    fn did_write(&mut self, t: &mut Task, ranges: &[Range]) {
        if !t.session().is_replaying() {
            return;
        }
        for r in ranges {
            let mut buf = vec![0u8; r.length];
            let mut ok = true;
            t.read_bytes_helper(r.data, &mut buf, Some(&mut ok));
            if ok {
                let written =
                    unsafe { libc::write(self.fd, buf.as_ptr() as *const libc::c_void, buf.len()) };
                if written != buf.len() as isize {
                    log!(
                        crate::log::LogWarn,
                        "Short write echoing tracee stdio to fd {}",
                        self.fd
                    );
                }
            }
        }
    }
}

/// Marks an fd the tracer owns inside the tracee (reserved fds); the fd
/// table refuses to treat tracee closes of it as real.
pub struct PreserveFileMonitor;

impl PreserveFileMonitor {
    pub fn new() -> PreserveFileMonitor {
        PreserveFileMonitor
    }
}

impl Default for PreserveFileMonitor {
    fn default() -> Self {
        PreserveFileMonitor::new()
    }
}

impl FileMonitor for PreserveFileMonitor {
    fn name(&self) -> &'static str {
        "PreserveFileMonitor"
    }

    fn is_preserved(&self) -> bool {
        true
    }
}

/// The magic save-data fd: writes through it are part of the recorded
/// data stream. The trace-encoding side consumes them; here we only need
/// the ranges observed.
pub struct MagicSaveDataMonitor;

impl MagicSaveDataMonitor {
    pub fn new() -> MagicSaveDataMonitor {
        MagicSaveDataMonitor
    }
}

impl Default for MagicSaveDataMonitor {
    fn default() -> Self {
        MagicSaveDataMonitor::new()
    }
}

impl FileMonitor for MagicSaveDataMonitor {
    fn name(&self) -> &'static str {
        "MagicSaveDataMonitor"
    }

    fn did_write(&mut self, t: &mut Task, ranges: &[Range]) {
        for r in ranges {
            log!(
                crate::log::LogDebug,
                "save-data write of {} bytes at {} by {}",
                r.length,
                r.data,
                t.tid
            );
        }
    }
}
