use lazy_static::lazy_static;
use std::sync::Mutex;

/// Process-global tracer options consulted by the task core. The command
/// layer fills this in once at startup; everything else only reads it.
#[derive(Clone, Default)]
pub struct Flags {
    /// Use the syscall buffer optimization when the preload library asks
    /// for it.
    pub use_syscall_buffer: bool,
    /// CPU the tracees (and the tracer) should be bound to, if any.
    pub bind_cpu: Option<u32>,
}

lazy_static! {
    static ref FLAGS: Mutex<Flags> = Mutex::new(Flags::default());
}

impl Flags {
    pub fn get() -> Flags {
        FLAGS.lock().unwrap().clone()
    }

    pub fn set(flags: Flags) {
        *FLAGS.lock().unwrap() = flags;
    }
}
