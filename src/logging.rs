//! Logging configuration
//!
//! All modules log through the [`log`] crate facade.  Applications that
//! already install their own logger (e.g. `env_logger`) can ignore this
//! module entirely; the functions here install a small crate-provided logger
//! that writes to stderr below a configurable level and/or forwards each
//! message to a user callback.

use std::sync::{OnceLock, RwLock};

pub use log::{Level, LevelFilter};

/// Callback receiving each log record that passes the callback level filter
pub type LogCallback = Box<dyn Fn(Level, &str) + Send + Sync>;

struct Config {
    stderr: Option<LevelFilter>,
    callback_level: LevelFilter,
    callback: Option<LogCallback>,
}

struct Logger;

static CONFIG: RwLock<Config> = RwLock::new(Config {
    stderr: None,
    callback_level: LevelFilter::Off,
    callback: None,
});

static LOGGER: Logger = Logger;
static INSTALL: OnceLock<bool> = OnceLock::new();

impl log::Log for Logger {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        let cfg = CONFIG.read().unwrap();
        metadata.level() <= cfg.stderr.unwrap_or(LevelFilter::Off)
            || metadata.level() <= cfg.callback_level
    }

    fn log(&self, record: &log::Record) {
        let cfg = CONFIG.read().unwrap();
        if record.level() <= cfg.stderr.unwrap_or(LevelFilter::Off) {
            eprintln!("filament: {}", record.args());
        }
        if record.level() <= cfg.callback_level {
            if let Some(cb) = &cfg.callback {
                cb(record.level(), &format!("{}", record.args()));
            }
        }
    }

    fn flush(&self) {}
}

/// Installs the crate logger if no global logger is present yet.
///
/// Returns `true` if the crate logger is the global logger (now or from an
/// earlier call); `false` if the application installed its own.
fn install() -> bool {
    *INSTALL.get_or_init(|| {
        let ok = log::set_logger(&LOGGER).is_ok();
        if ok {
            log::set_max_level(LevelFilter::Trace);
        }
        ok
    })
}

/// Sets the maximum level printed to stderr by the crate logger
pub fn set_stderr_level(level: LevelFilter) {
    install();
    CONFIG.write().unwrap().stderr = Some(level);
}

/// Returns the current stderr level of the crate logger
pub fn stderr_level() -> LevelFilter {
    CONFIG.read().unwrap().stderr.unwrap_or(LevelFilter::Off)
}

/// Registers a message callback, invoked for records at or below `level`
///
/// Passing `None` removes a previously registered callback.
pub fn set_callback(level: LevelFilter, callback: Option<LogCallback>) {
    install();
    let mut cfg = CONFIG.write().unwrap();
    cfg.callback_level = if callback.is_some() {
        level
    } else {
        LevelFilter::Off
    };
    cfg.callback = callback;
}

/// Returns the level of the registered callback (`Off` when absent)
pub fn callback_level() -> LevelFilter {
    CONFIG.read().unwrap().callback_level
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_callback() {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        set_callback(
            LevelFilter::Info,
            Some(Box::new(move |_, _| {
                c.fetch_add(1, Ordering::Relaxed);
            })),
        );
        log::info!("callback test");
        set_callback(LevelFilter::Off, None);
        log::info!("not delivered");

        // If another logger won the install race, the callback is never
        // invoked; both outcomes are valid here.
        assert!(count.load(Ordering::Relaxed) <= 1);
    }
}
