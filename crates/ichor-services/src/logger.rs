//! Console logger service.
//!
//! An ordinary service publishing `dyn Logger`; consumers declare it like any
//! other dependency, there is no privileged injection path. Delivery goes
//! through `tracing`, so whatever subscriber the host application installs
//! decides formatting and sinks.

use ichor_runtime::{Service, ServiceRegistration};
use std::cell::RefCell;
use std::rc::Rc;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
    Off,
}

/// Call-site context attached to every message.
#[derive(Clone, Copy, Debug)]
pub struct LogContext {
    pub file: &'static str,
    pub line: u32,
    pub scope: &'static str,
}

impl LogContext {
    pub fn new(file: &'static str, line: u32, scope: &'static str) -> Self {
        Self { file, line, scope }
    }
}

/// Per-message logging interface.
pub trait Logger {
    fn log(&self, level: LogLevel, origin: LogContext, message: &str);

    fn trace(&self, origin: LogContext, message: &str) {
        self.log(LogLevel::Trace, origin, message);
    }

    fn debug(&self, origin: LogContext, message: &str) {
        self.log(LogLevel::Debug, origin, message);
    }

    fn info(&self, origin: LogContext, message: &str) {
        self.log(LogLevel::Info, origin, message);
    }

    fn warn(&self, origin: LogContext, message: &str) {
        self.log(LogLevel::Warn, origin, message);
    }

    fn error(&self, origin: LogContext, message: &str) {
        self.log(LogLevel::Error, origin, message);
    }

    fn set_log_level(&mut self, level: LogLevel);

    fn log_level(&self) -> LogLevel;
}

pub struct ConsoleLogger {
    level: LogLevel,
}

impl ConsoleLogger {
    pub fn new(level: LogLevel) -> Self {
        Self { level }
    }

    /// Registration publishing `dyn Logger`.
    pub fn registration(level: LogLevel) -> ServiceRegistration<ConsoleLogger> {
        ServiceRegistration::new(move || ConsoleLogger::new(level))
            .provides(|rc| rc as Rc<RefCell<dyn Logger>>)
    }
}

impl Service for ConsoleLogger {}

impl Logger for ConsoleLogger {
    fn log(&self, level: LogLevel, origin: LogContext, message: &str) {
        if level < self.level || self.level == LogLevel::Off {
            return;
        }
        match level {
            LogLevel::Trace => {
                tracing::trace!(file = origin.file, line = origin.line, scope = origin.scope, "{message}")
            }
            LogLevel::Debug => {
                tracing::debug!(file = origin.file, line = origin.line, scope = origin.scope, "{message}")
            }
            LogLevel::Info => {
                tracing::info!(file = origin.file, line = origin.line, scope = origin.scope, "{message}")
            }
            LogLevel::Warn => {
                tracing::warn!(file = origin.file, line = origin.line, scope = origin.scope, "{message}")
            }
            LogLevel::Error => {
                tracing::error!(file = origin.file, line = origin.line, scope = origin.scope, "{message}")
            }
            LogLevel::Off => {}
        }
    }

    fn set_log_level(&mut self, level: LogLevel) {
        self.level = level;
    }

    fn log_level(&self) -> LogLevel {
        self.level
    }
}

/// Log at info level with call-site context filled in.
#[macro_export]
macro_rules! log_info {
    ($logger:expr, $($arg:tt)*) => {
        $logger.info(
            $crate::logger::LogContext::new(file!(), line!(), module_path!()),
            &format!($($arg)*),
        )
    };
}

/// Log at warn level with call-site context filled in.
#[macro_export]
macro_rules! log_warn {
    ($logger:expr, $($arg:tt)*) => {
        $logger.warn(
            $crate::logger::LogContext::new(file!(), line!(), module_path!()),
            &format!($($arg)*),
        )
    };
}

/// Log at error level with call-site context filled in.
#[macro_export]
macro_rules! log_error {
    ($logger:expr, $($arg:tt)*) => {
        $logger.error(
            $crate::logger::LogContext::new(file!(), line!(), module_path!()),
            &format!($($arg)*),
        )
    };
}
