//! Explicit, per-endpoint logging (spec §9 Design Notes).
//!
//! The original source's global logger factory/registry is replaced by a
//! logger passed through construction: a [`LoggerConfig`] enumerates
//! options, and a [`LogSink`] receives every [`LogRecord`] that passes the
//! configured level. There is no process-wide state in this module.

use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
    Critical,
    Off,
}

#[derive(Debug, Clone)]
pub struct LogRecord {
    pub level: LogLevel,
    pub target: &'static str,
    pub message: String,
}

impl fmt::Display for LogRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:?}] {}: {}", self.level, self.target, self.message)
    }
}

/// Receives log records. Implement this to route records anywhere:
/// `tracing`, a test-local `Vec`, a file, nothing at all.
pub trait LogSink: Send + Sync {
    fn log(&self, record: LogRecord);
}

/// Forwards records to the `tracing` crate, which most embedding
/// applications already have a subscriber installed for.
pub struct TracingSink;

impl LogSink for TracingSink {
    fn log(&self, record: LogRecord) {
        match record.level {
            LogLevel::Debug => tracing::debug!(target: "multirpc", "{}", record.message),
            LogLevel::Info => tracing::info!(target: "multirpc", "{}", record.message),
            LogLevel::Warn => tracing::warn!(target: "multirpc", "{}", record.message),
            LogLevel::Error | LogLevel::Critical => {
                tracing::error!(target: "multirpc", "{}", record.message)
            }
            LogLevel::Off => {}
        }
    }
}

/// Per-endpoint logging configuration (spec §9: "per-endpoint
/// configuration structs enumerate options").
#[derive(Clone)]
pub struct LoggerConfig {
    pub min_level: LogLevel,
    pub colored: bool,
    pub console_enabled: bool,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        LoggerConfig {
            min_level: LogLevel::Info,
            colored: false,
            console_enabled: false,
        }
    }
}

/// A logger bound to one dispatcher/transport endpoint.
#[derive(Clone)]
pub struct Logger {
    config: LoggerConfig,
    sink: Arc<dyn LogSink>,
}

impl Default for Logger {
    fn default() -> Self {
        Logger::new(LoggerConfig::default(), Arc::new(TracingSink))
    }
}

impl Logger {
    pub fn new(config: LoggerConfig, sink: Arc<dyn LogSink>) -> Self {
        Logger { config, sink }
    }

    pub fn log(&self, level: LogLevel, target: &'static str, message: impl Into<String>) {
        if level < self.config.min_level {
            return;
        }
        let message = message.into();
        if self.config.console_enabled {
            if self.config.colored {
                eprintln!("\x1b[2m[{target}]\x1b[0m {message}");
            } else {
                eprintln!("[{target}] {message}");
            }
        }
        self.sink.log(LogRecord {
            level,
            target,
            message,
        });
    }

    pub fn debug(&self, target: &'static str, message: impl Into<String>) {
        self.log(LogLevel::Debug, target, message)
    }

    pub fn info(&self, target: &'static str, message: impl Into<String>) {
        self.log(LogLevel::Info, target, message)
    }

    pub fn warn(&self, target: &'static str, message: impl Into<String>) {
        self.log(LogLevel::Warn, target, message)
    }

    pub fn error(&self, target: &'static str, message: impl Into<String>) {
        self.log(LogLevel::Error, target, message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct CollectingSink(Mutex<Vec<LogRecord>>);

    impl LogSink for CollectingSink {
        fn log(&self, record: LogRecord) {
            self.0.lock().unwrap().push(record);
        }
    }

    #[test]
    fn records_below_min_level_are_dropped() {
        let sink = Arc::new(CollectingSink(Mutex::new(Vec::new())));
        let logger = Logger::new(
            LoggerConfig {
                min_level: LogLevel::Warn,
                colored: false,
                console_enabled: false,
            },
            sink.clone(),
        );

        logger.debug("dispatcher", "noisy detail");
        logger.warn("dispatcher", "something odd");

        let records = sink.0.lock().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].message, "something odd");
    }
}
