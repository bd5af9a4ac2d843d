//! Minimal backend for the `log` facade. Diagnostic lines go to stderr
//! so they stay separate from the observable simulator logs.

use log::{LevelFilter, Log, Metadata, Record};

struct StderrLogger;

impl Log for StderrLogger {
    fn enabled(&self, _metadata: &Metadata) -> bool {
        true
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            eprintln!("{:>5} [{}] {}", record.level(), record.target(), record.args());
        }
    }

    fn flush(&self) {}
}

/// Install the logger. Level comes from the `LOG` environment variable,
/// defaulting to warnings only.
pub fn init() {
    static LOGGER: StderrLogger = StderrLogger;
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(match std::env::var("LOG").as_deref() {
            Ok("ERROR") => LevelFilter::Error,
            Ok("WARN") => LevelFilter::Warn,
            Ok("INFO") => LevelFilter::Info,
            Ok("DEBUG") => LevelFilter::Debug,
            Ok("TRACE") => LevelFilter::Trace,
            _ => LevelFilter::Warn,
        });
    }
}
