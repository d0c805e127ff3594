//! Debug output.
//!
//! All scheduler diagnostics flow through one funnel: an optional
//! user-installed sink (with a verbosity ceiling) and the `log` facade, so
//! hosts that already run `env_logger` or similar see the same messages
//! without wiring a sink.

use std::fmt;

/// Verbosity of a debug message, most severe first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LogVerbosity {
    Error,
    Warning,
    Message,
    Verbose,
}

impl LogVerbosity {
    fn as_str(&self) -> &'static str {
        match self {
            LogVerbosity::Error => "error",
            LogVerbosity::Warning => "warning",
            LogVerbosity::Message => "message",
            LogVerbosity::Verbose => "verbose",
        }
    }

    fn level(&self) -> log::Level {
        match self {
            LogVerbosity::Error => log::Level::Error,
            LogVerbosity::Warning => log::Level::Warn,
            LogVerbosity::Message => log::Level::Debug,
            LogVerbosity::Verbose => log::Level::Trace,
        }
    }
}

/// Semantic group a debug message belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LogGroup {
    Memory,
    Scheduler,
    Job,
    Worker,
}

impl LogGroup {
    fn as_str(&self) -> &'static str {
        match self {
            LogGroup::Memory => "memory",
            LogGroup::Scheduler => "scheduler",
            LogGroup::Job => "job",
            LogGroup::Worker => "worker",
        }
    }
}

impl fmt::Display for LogGroup {
    fn fmt(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        formatter.write_str(self.as_str())
    }
}

/// User-defined sink which receives all scheduler debug output at or below
/// the configured verbosity.
pub type DebugOutputFn = dyn Fn(LogVerbosity, LogGroup, &str) + Send + Sync;

pub(crate) struct DebugLog {
    sink: Option<Box<DebugOutputFn>>,
    max_verbosity: LogVerbosity,
}

impl DebugLog {
    pub fn new(sink: Option<Box<DebugOutputFn>>, max_verbosity: LogVerbosity) -> DebugLog {
        DebugLog { sink, max_verbosity }
    }

    pub fn write(&self, verbosity: LogVerbosity, group: LogGroup, args: fmt::Arguments) {
        log::log!(
            target: "gantry",
            verbosity.level(),
            "[{}] {}",
            group,
            args
        );

        if let Some(sink) = &self.sink {
            if verbosity <= self.max_verbosity {
                let message = format!("[{}] {}: {}", group, verbosity.as_str(), args);
                sink(verbosity, group, &message);
            }
        }
    }
}
