//! The narrow Session interface the task core depends on: whether we are
//! recording or replaying, the registry of live tasks, serial-number
//! allocation, and the couple of accounting hooks the upper layers
//! expose. Record/replay policy itself lives above this crate's scope.

use crate::address_space::{AddressSpace, AddressSpaceSharedPtr};
use crate::task::{Task, TaskSharedPtr};
use crate::thread_group::{ThreadGroup, ThreadGroupSharedPtr};
use crate::ticks::Ticks;
use crate::trace_stream::TraceStream;
use libc::pid_t;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::ffi::OsStr;
use std::rc::{Rc, Weak};

pub type SessionSharedPtr = Rc<Session>;
pub type SessionSharedWeakPtr = Weak<Session>;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SessionKind {
    Recording,
    Replaying,
}

pub struct Session {
    kind: SessionKind,
    trace: TraceStream,
    tasks: RefCell<HashMap<pid_t, TaskSharedPtr>>,
    next_task_serial: Cell<u32>,
    next_tg_serial: Cell<u32>,
    ticks_processed: Cell<Ticks>,
    syscalls_performed: Cell<u64>,
    /// Set by the wait loop when a PTRACE_INTERRUPT had to end the
    /// current timeslice; the scheduler polls and clears it.
    timeslice_expired: Cell<bool>,
    use_syscall_buffer: bool,
    /// Tracer end of the socketpair whose other end is the tracee's
    /// reserved socket fd; carries fds via SCM_RIGHTS.
    tracee_socket: RefCell<crate::scoped_fd::ScopedFd>,
    weak_self: RefCell<SessionSharedWeakPtr>,
}

impl Session {
    pub fn new(kind: SessionKind, trace: TraceStream) -> SessionSharedPtr {
        let use_syscall_buffer = crate::flags::Flags::get().use_syscall_buffer;
        let sess = Rc::new(Session {
            kind,
            trace,
            tasks: RefCell::new(HashMap::new()),
            next_task_serial: Cell::new(1),
            next_tg_serial: Cell::new(1),
            ticks_processed: Cell::new(0),
            syscalls_performed: Cell::new(0),
            timeslice_expired: Cell::new(false),
            use_syscall_buffer,
            tracee_socket: RefCell::new(crate::scoped_fd::ScopedFd::new()),
            weak_self: RefCell::new(Weak::new()),
        });
        *sess.weak_self.borrow_mut() = Rc::downgrade(&sess);
        sess
    }

    pub fn weak_self_ptr(&self) -> SessionSharedWeakPtr {
        self.weak_self.borrow().clone()
    }

    pub fn is_recording(&self) -> bool {
        self.kind == SessionKind::Recording
    }

    pub fn is_replaying(&self) -> bool {
        self.kind == SessionKind::Replaying
    }

    pub fn use_syscall_buffer(&self) -> bool {
        self.use_syscall_buffer
    }

    pub fn set_tracee_socket(&self, fd: crate::scoped_fd::ScopedFd) {
        *self.tracee_socket.borrow_mut() = fd;
    }

    pub fn tracee_socket_raw(&self) -> std::os::unix::io::RawFd {
        self.tracee_socket.borrow().as_raw()
    }

    pub fn trace_stream(&self) -> &TraceStream {
        &self.trace
    }

    pub fn next_task_serial(&self) -> u32 {
        let serial = self.next_task_serial.get();
        self.next_task_serial.set(serial + 1);
        serial
    }

    fn next_tg_serial(&self) -> u32 {
        let serial = self.next_tg_serial.get();
        self.next_tg_serial.set(serial + 1);
        serial
    }

    // --- task registry --------------------------------------------------

    pub fn on_create(&self, t: TaskSharedPtr) {
        let tid = t.borrow().tid;
        self.tasks.borrow_mut().insert(tid, t);
    }

    pub fn on_destroy(&self, tid: pid_t) {
        self.tasks.borrow_mut().remove(&tid);
    }

    pub fn task_count(&self) -> usize {
        self.tasks.borrow().len()
    }

    pub fn find_task(&self, tid: pid_t) -> Option<TaskSharedPtr> {
        self.tasks.borrow().get(&tid).cloned()
    }

    pub fn find_task_from_rec_tid(&self, rec_tid: pid_t) -> Option<TaskSharedPtr> {
        self.tasks
            .borrow()
            .values()
            .find(|t| t.borrow().rec_tid == rec_tid)
            .cloned()
    }

    pub fn tasks(&self) -> Vec<TaskSharedPtr> {
        self.tasks.borrow().values().cloned().collect()
    }

    // --- aggregate construction ----------------------------------------

    pub fn create_vm(
        &self,
        t: &Task,
        exe_image: Option<&OsStr>,
        exec_count: u32,
    ) -> AddressSpaceSharedPtr {
        let exe = exe_image.unwrap_or_else(|| OsStr::new(""));
        let vas = Rc::new(AddressSpace::new(exe, t.real_tgid(), exec_count));
        vas.insert_task(t.weak_self_ptr());
        vas
    }

    pub fn clone_vm(&self, t: &Task, from: &AddressSpaceSharedPtr) -> AddressSpaceSharedPtr {
        let vas = Rc::new(from.clone_for_fork(t.real_tgid()));
        vas.insert_task(t.weak_self_ptr());
        vas
    }

    pub fn create_tg(&self, tid: pid_t, rec_tid: pid_t) -> ThreadGroupSharedPtr {
        ThreadGroup::new(rec_tid, tid, self.next_tg_serial())
    }

    // --- accounting hooks ----------------------------------------------

    pub fn accumulate_ticks_processed(&self, ticks: Ticks) {
        self.ticks_processed
            .set(self.ticks_processed.get() + ticks);
    }

    pub fn ticks_processed(&self) -> Ticks {
        self.ticks_processed.get()
    }

    pub fn accumulate_syscall_performed(&self) {
        self.syscalls_performed
            .set(self.syscalls_performed.get() + 1);
    }

    pub fn syscalls_performed(&self) -> u64 {
        self.syscalls_performed.get()
    }

    /// The wait loop interrupted a runaway tracee; the current timeslice
    /// is over no matter what the tick counter says.
    pub fn expire_timeslice(&self) {
        self.timeslice_expired.set(true);
    }

    pub fn take_timeslice_expired(&self) -> bool {
        self.timeslice_expired.replace(false)
    }

    /// The first exec has completed; tracee state is consistent from
    /// here on.
    pub fn post_exec(&self) {
        self.trace.tick_time();
    }
}
