//! Thread-group membership: the set of Tasks sharing a kernel thread
//! group (a "process" in userland terms).

use crate::task::TaskSharedWeakPtr;
use libc::pid_t;
use std::cell::{Cell, RefCell};
use std::rc::Rc;

pub type ThreadGroupSharedPtr = Rc<ThreadGroup>;

pub struct ThreadGroup {
    /// Thread-group id as recorded (stable across record/replay).
    pub tgid: pid_t,
    /// Live kernel thread-group id.
    pub real_tgid: pid_t,
    serial: u32,
    task_set: RefCell<Vec<TaskSharedWeakPtr>>,
    execed: Cell<bool>,
}

impl ThreadGroup {
    pub fn new(tgid: pid_t, real_tgid: pid_t, serial: u32) -> ThreadGroupSharedPtr {
        Rc::new(ThreadGroup {
            tgid,
            real_tgid,
            serial,
            task_set: RefCell::new(Vec::new()),
            execed: Cell::new(false),
        })
    }

    pub fn serial(&self) -> u32 {
        self.serial
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

    /// Whether any live task remains in the group.
    pub fn task_set_is_empty(&self) -> bool {
        self.task_set
            .borrow()
            .iter()
            .all(|w| w.strong_count() == 0)
    }

    pub fn execed(&self) -> bool {
        self.execed.get()
    }

    pub fn set_execed(&self) {
        self.execed.set(true);
    }
}
