//! The tracer-side shadow of a tracee's fd table: which fds carry
//! monitors, and the syscallbuf fds-disabled bookkeeping shared with the
//! preload library.
//!
//! Like AddressSpace, an FdTable is shared by every task that shares the
//! kernel fd table, and uses interior mutability throughout.

use crate::file_monitor::{FileMonitor, Range};
use crate::preload_interface::SYSCALLBUF_FDS_DISABLED_SIZE;
use crate::task::{Task, TaskSharedWeakPtr};
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

pub type FdTableSharedPtr = Rc<FdTable>;

pub struct FdTable {
    task_set: RefCell<Vec<TaskSharedWeakPtr>>,
    monitors: RefCell<HashMap<i32, Rc<RefCell<dyn FileMonitor>>>>,
}

impl FdTable {
    pub fn create() -> FdTableSharedPtr {
        Rc::new(FdTable {
            task_set: RefCell::new(Vec::new()),
            monitors: RefCell::new(HashMap::new()),
        })
    }

    /// A copy of this table for a task that unshared its fds (clone
    /// without CLONE_FILES, unshare(CLONE_FILES), exec).
    pub fn clone_table(&self) -> FdTableSharedPtr {
        Rc::new(FdTable {
            task_set: RefCell::new(Vec::new()),
            monitors: RefCell::new(self.monitors.borrow().clone()),
        })
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

    pub fn add_monitor(&self, fd: i32, monitor: Rc<RefCell<dyn FileMonitor>>) {
        // Closing a monitored fd removes the monitor, so a stale entry
        // here means we missed a close.
        let prev = self.monitors.borrow_mut().insert(fd, monitor);
        if prev.is_some() {
            log!(crate::log::LogWarn, "Monitor for fd {} replaced", fd);
        }
    }

    pub fn is_monitoring(&self, fd: i32) -> bool {
        self.monitors.borrow().contains_key(&fd)
    }

    pub fn is_preserved(&self, fd: i32) -> bool {
        self.monitors
            .borrow()
            .get(&fd)
            .map_or(false, |m| m.borrow().is_preserved())
    }

    /// dup-family shadow: the monitor follows the fd to its new number.
    pub fn did_dup(&self, from: i32, to: i32) {
        let monitor = self.monitors.borrow().get(&from).cloned();
        let mut monitors = self.monitors.borrow_mut();
        match monitor {
            Some(m) => {
                monitors.insert(to, m);
            }
            None => {
                monitors.remove(&to);
            }
        }
    }

    pub fn did_close(&self, fd: i32) {
        let preserved = self.is_preserved(fd);
        if preserved {
            log!(
                crate::log::LogDebug,
                "Tracee closed preserved fd {}; keeping monitor",
                fd
            );
            return;
        }
        self.monitors.borrow_mut().remove(&fd);
    }

    pub fn did_write(&self, t: &mut Task, fd: i32, ranges: Vec<Range>) {
        let monitor = self.monitors.borrow().get(&fd).cloned();
        if let Some(m) = monitor {
            m.borrow_mut().did_write(t, &ranges);
        }
    }

    /// Tell the preload library which fds must not be buffered: every
    /// monitored fd gets its byte set in the tracee-side
    /// syscallbuf_fds_disabled array.
    pub fn init_syscallbuf_fds_disabled(&self, t: &mut Task) {
        if t.syscallbuf_fds_disabled_child.is_null() {
            return;
        }
        let mut disabled = vec![0u8; SYSCALLBUF_FDS_DISABLED_SIZE];
        for fd in self.monitors.borrow().keys() {
            let fd = *fd;
            if (0..SYSCALLBUF_FDS_DISABLED_SIZE as i32).contains(&fd) {
                disabled[fd as usize] = 1;
            } else {
                // Large fds disable buffering via the last slot.
                disabled[SYSCALLBUF_FDS_DISABLED_SIZE - 1] = 1;
            }
        }
        let addr = t.syscallbuf_fds_disabled_child;
        t.write_bytes_helper(addr, &disabled, None, crate::task::WriteFlags::empty());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file_monitor::PreserveFileMonitor;

    #[test]
    fn dup_moves_monitor() {
        let table = FdTable::create();
        table.add_monitor(3, Rc::new(RefCell::new(PreserveFileMonitor::new())));
        assert!(table.is_monitoring(3));
        table.did_dup(3, 7);
        assert!(table.is_monitoring(7));
        // dup over an unmonitored source clears the destination.
        table.did_dup(5, 7);
        assert!(!table.is_monitoring(7));
    }

    #[test]
    fn close_keeps_preserved_fds() {
        let table = FdTable::create();
        table.add_monitor(998, Rc::new(RefCell::new(PreserveFileMonitor::new())));
        table.did_close(998);
        assert!(table.is_monitoring(998));
    }

    #[test]
    fn clone_table_copies_monitors() {
        let table = FdTable::create();
        table.add_monitor(1, Rc::new(RefCell::new(PreserveFileMonitor::new())));
        let copy = table.clone_table();
        assert!(copy.is_monitoring(1));
        copy.did_dup(1, 2);
        assert!(copy.is_monitoring(2));
        assert!(!table.is_monitoring(2));
    }
}
