//! Explicit logger handles.
//!
//! Components never reach for a process-wide logger. Each constructor takes a
//! [`Logger`], which pins a `log` target and a minimum level for that
//! component, and forwards records to whatever `log` implementation the host
//! binary installed.

use std::fmt;
use std::sync::Arc;

use log::{Level, LevelFilter};

#[derive(Clone)]
pub struct Logger {
    target: Arc<str>,
    max_level: LevelFilter,
}

impl fmt::Debug for Logger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Logger")
            .field("target", &self.target)
            .field("max_level", &self.max_level)
            .finish()
    }
}

impl Default for Logger {
    fn default() -> Self {
        Self::new("archivist")
    }
}

impl Logger {
    pub fn new(target: impl AsRef<str>) -> Self {
        Self {
            target: Arc::from(target.as_ref()),
            max_level: LevelFilter::Trace,
        }
    }

    /// A logger that drops everything. Handy for tests and benches.
    pub fn silent() -> Self {
        Self {
            target: Arc::from("archivist"),
            max_level: LevelFilter::Off,
        }
    }

    pub fn with_max_level(mut self, level: LevelFilter) -> Self {
        self.max_level = level;
        self
    }

    /// Derive a handle for a sub-component, e.g. `archivist` -> `archivist::cache`.
    pub fn child(&self, component: &str) -> Self {
        Self {
            target: Arc::from(format!("{}::{}", self.target, component)),
            max_level: self.max_level,
        }
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn enabled(&self, level: Level) -> bool {
        level <= self.max_level
    }

    pub fn log(&self, level: Level, args: fmt::Arguments<'_>) {
        if self.enabled(level) {
            log::log!(target: &*self.target, level, "{}", args);
        }
    }

    pub fn error(&self, args: fmt::Arguments<'_>) {
        self.log(Level::Error, args);
    }

    pub fn warn(&self, args: fmt::Arguments<'_>) {
        self.log(Level::Warn, args);
    }

    pub fn info(&self, args: fmt::Arguments<'_>) {
        self.log(Level::Info, args);
    }

    pub fn debug(&self, args: fmt::Arguments<'_>) {
        self.log(Level::Debug, args);
    }
}
