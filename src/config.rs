//! Ambient logging configuration.
//!
//! This crate has no on-disk configuration format, CLI, or environment
//! variables of its own — callers embed it and decide how much to log.
//! `LoggingConfig` is the one knob exposed to `logging::setup_logging`.

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub log_to_stdout: bool,
    pub level: log::LevelFilter,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_to_stdout: true,
            level: log::LevelFilter::Info,
        }
    }
}
