use crate::kernel_metadata::errno_name;
use crate::util::errno;
use backtrace::Backtrace;
use lazy_static::lazy_static;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{self, Result, Write};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

#[derive(Copy, Clone, Eq, PartialEq, PartialOrd)]
pub enum LogLevel {
    LogFatal,
    LogError,
    LogWarn,
    LogInfo,
    LogDebug,
}

pub use LogLevel::*;

struct LogGlobals {
    level_map: HashMap<String, LogLevel>,
    module_cache: HashMap<String, (String, LogLevel)>,
    log_file: Box<dyn Write + Send>,
    default_level: LogLevel,
}

lazy_static! {
    static ref LOG_GLOBALS: Mutex<LogGlobals> = {
        let f: Box<dyn Write + Send> = match option_env!("RETRACE_LOG_FILE") {
            Some(filename) => Box::new(File::create(filename).unwrap()),
            None => match option_env!("RETRACE_APPEND_LOG_FILE") {
                Some(filename) => Box::new(
                    OpenOptions::new()
                        .append(true)
                        .create(true)
                        .open(filename)
                        .unwrap(),
                ),
                None => Box::new(io::stderr()),
            },
        };

        Mutex::new(LogGlobals {
            level_map: HashMap::new(),
            module_cache: HashMap::new(),
            log_file: f,
            default_level: LogWarn,
        })
    };
}

/// Module names are derived from source file names, so they are case
/// sensitive the way the filesystem is.
fn filename_to_module_name(filename: &str) -> String {
    let path = Path::new(filename);
    path.file_stem().unwrap().to_string_lossy().to_string()
}

fn module_of(filename: &str, l: &mut MutexGuard<LogGlobals>) -> (String, LogLevel) {
    if let Some(m) = l.module_cache.get(filename) {
        return m.clone();
    }
    let name = filename_to_module_name(filename);
    let level = match l.level_map.get(&name) {
        Some(level) => *level,
        None => l.default_level,
    };
    let m = (name, level);
    l.module_cache.insert(filename.to_owned(), m.clone());
    m
}

pub fn set_all_logging(level: LogLevel) {
    let mut l = LOG_GLOBALS.lock().unwrap();
    l.default_level = level;
    l.level_map.clear();
    l.module_cache.clear();
}

pub fn set_logging(module_name: &str, level: LogLevel) {
    let mut l = LOG_GLOBALS.lock().unwrap();
    l.level_map.insert(module_name.to_owned(), level);
    l.module_cache.clear();
}

fn log_name(level: LogLevel) -> &'static str {
    match level {
        LogFatal => "FATAL",
        LogError => "ERROR",
        LogWarn => "WARN",
        LogInfo => "INFO",
        LogDebug => "DEBUG",
    }
}

/// A line-buffered stream that appends a newline and flushes to the log
/// file when dropped.
pub struct NewlineTerminatingOstream {
    enabled: bool,
    message: Vec<u8>,
    lock: MutexGuard<'static, LogGlobals>,
}

impl NewlineTerminatingOstream {
    fn new(
        level: LogLevel,
        filename: &str,
        line: u32,
        module_path: &str,
        always_enabled: bool,
    ) -> NewlineTerminatingOstream {
        let mut lock = LOG_GLOBALS.lock().unwrap();
        let (module_name, module_level) = module_of(filename, &mut lock);
        let enabled = always_enabled || level <= module_level;
        let mut this = NewlineTerminatingOstream {
            message: Vec::new(),
            enabled,
            lock,
        };
        if enabled {
            if level == LogDebug {
                write!(this, "[{}] ", module_name).unwrap();
            } else {
                write_prefix(&mut this, level, filename, line, module_path);
            }
        }
        this
    }
}

impl Drop for NewlineTerminatingOstream {
    fn drop(&mut self) {
        if self.enabled {
            self.write_all(b"\n").unwrap();
            self.flush().unwrap();
        }
    }
}

impl Write for NewlineTerminatingOstream {
    fn flush(&mut self) -> Result<()> {
        if !self.message.is_empty() && self.enabled {
            self.lock.log_file.write_all(&self.message)?;
            self.lock.log_file.flush()?;
        }
        self.message.clear();
        Ok(())
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        if self.enabled {
            self.message.extend_from_slice(buf);
        }
        // Pretend the bytes were written even when disabled, otherwise
        // write! reports WriteZero.
        Ok(buf.len())
    }
}

pub fn write_prefix(
    stream: &mut dyn Write,
    level: LogLevel,
    filename: &str,
    line: u32,
    module_path: &str,
) {
    write!(stream, "[{} ", log_name(level)).unwrap();
    if level <= LogError {
        write!(stream, "{}:{} ", filename, line).unwrap();
    }
    write!(stream, "{}()", module_path).unwrap();
    let err = errno();
    if level <= LogWarn && err != 0 {
        write!(stream, " errno: {}", errno_name(err)).unwrap();
    }
    write!(stream, "] ").unwrap();
}

pub fn log(
    log_level: LogLevel,
    filename: &str,
    line: u32,
    module_path: &str,
    always_enabled: bool,
) -> NewlineTerminatingOstream {
    NewlineTerminatingOstream::new(log_level, filename, line, module_path, always_enabled)
}

/// Dump the backtrace to stderr and abort.
pub fn notifying_abort(bt: Backtrace) -> ! {
    let mut stderr = io::stderr();
    write!(
        stderr,
        "=== Start retrace backtrace:\n{:?}=== End retrace backtrace\n",
        bt
    )
    .unwrap();
    std::process::abort();
}

macro_rules! log {
    ($log_level:expr, $($args:tt)+) => {
        {
            use ::std::io::Write;
            let mut stream = crate::log::log(
                $log_level,
                file!(),
                line!(),
                module_path!(),
                false
            );
            write!(stream, $($args)+).unwrap()
        }
    };
}

/// Log at Fatal, dump a backtrace, abort.
macro_rules! fatal {
    ($($args:tt)+) => {
        {
            {
                use ::std::io::Write;
                use crate::log::LogFatal;
                let mut stream = crate::log::log(
                    LogFatal,
                    file!(),
                    line!(),
                    module_path!(),
                    true
                );
                write!(stream, $($args)+).unwrap();
            }
            crate::log::notifying_abort(backtrace::Backtrace::new())
        }
    };
}

/// Assert a condition in the context of a task; the diagnostic names the
/// task's tid so postmortems can identify which tracee went wrong.
macro_rules! ed_assert {
    ($task:expr, $cond:expr) => {
        {
            if !$cond {
                {
                    use ::std::io::Write;
                    use crate::log::LogFatal;
                    let mut stream = crate::log::log(
                        LogFatal,
                        file!(),
                        line!(),
                        module_path!(),
                        true
                    );
                    write!(
                        stream,
                        "(task {} (rec: {})) Assertion `{}' failed to hold.",
                        $task.tid,
                        $task.rec_tid,
                        stringify!($cond)
                    ).unwrap();
                }
                crate::log::notifying_abort(backtrace::Backtrace::new())
            }
        }
    };
    ($task:expr, $cond:expr, $($args:tt)+) => {
        {
            if !$cond {
                {
                    use ::std::io::Write;
                    use crate::log::LogFatal;
                    let mut stream = crate::log::log(
                        LogFatal,
                        file!(),
                        line!(),
                        module_path!(),
                        true
                    );
                    write!(
                        stream,
                        "(task {} (rec: {})) Assertion `{}' failed to hold. ",
                        $task.tid,
                        $task.rec_tid,
                        stringify!($cond)
                    ).unwrap();
                    write!(stream, $($args)+).unwrap();
                }
                crate::log::notifying_abort(backtrace::Backtrace::new())
            }
        }
    };
}

macro_rules! ed_assert_eq {
    ($task:expr, $lhs:expr, $rhs:expr) => {
        {
            let l = $lhs;
            let r = $rhs;
            ed_assert!($task, l == r, "`{:?}' vs `{:?}'", l, r)
        }
    };
    ($task:expr, $lhs:expr, $rhs:expr, $($args:tt)+) => {
        {
            let l = $lhs;
            let r = $rhs;
            ed_assert!($task, l == r, $($args)+)
        }
    };
}
