//! Hosted log backend
//!
//! The kernel logs through the [`log`] facade with one target per
//! subsystem (`fs`, `addr`, `sched`, `syscall`, `disk`, `console`),
//! mirroring the per-subsystem debug flags of classic teaching kernels.
//! This backend writes to stderr; the maximum level comes from the
//! `CORACLE_LOG` environment variable (`error`..`trace`, default `warn`).

use std::io::Write;

use log::{Level, LevelFilter, Metadata, Record};

struct StderrLogger;

static LOGGER: StderrLogger = StderrLogger;

impl log::Log for StderrLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let tag = match record.level() {
            Level::Error => "ERROR",
            Level::Warn => "WARN",
            Level::Info => "INFO",
            Level::Debug => "DEBUG",
            Level::Trace => "TRACE",
        };
        let mut err = std::io::stderr().lock();
        let _ = writeln!(err, "[{:5}] {}: {}", tag, record.target(), record.args());
    }

    fn flush(&self) {}
}

fn level_from_env() -> LevelFilter {
    match std::env::var("CORACLE_LOG").as_deref() {
        Ok("error") => LevelFilter::Error,
        Ok("warn") => LevelFilter::Warn,
        Ok("info") => LevelFilter::Info,
        Ok("debug") => LevelFilter::Debug,
        Ok("trace") => LevelFilter::Trace,
        Ok("off") => LevelFilter::Off,
        _ => LevelFilter::Warn,
    }
}

/// Install the stderr logger.
///
/// Idempotent: a second call (another test in the same process) is a no-op.
pub fn init() {
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(level_from_env());
    }
}
