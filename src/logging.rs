//! Log setup and the small rate limiters used on the acquisition hot path.
//!
//! The level comes from `ECG_LOG`, falling back to `RUST_LOG`, default `info`.
//! Binaries call [`init_rust_logging`]; the Python extension installs a bridge
//! that forwards records into Python's `logging` module instead.

use std::sync::Once;
use std::time::{Duration, Instant};

use env_logger::Env;
use log::LevelFilter;

static RUST_LOG_ONCE: Once = Once::new();

fn env_level() -> LevelFilter {
    std::env::var("ECG_LOG")
        .or_else(|_| std::env::var("RUST_LOG"))
        .ok()
        .as_deref()
        .and_then(parse_level)
        .unwrap_or(LevelFilter::Info)
}

fn parse_level(input: &str) -> Option<LevelFilter> {
    input.trim().parse::<LevelFilter>().ok()
}

/// Initialize logging for Rust binaries (stderr formatter) based on `ECG_LOG`/`RUST_LOG`.
pub fn init_rust_logging() {
    RUST_LOG_ONCE.call_once(|| {
        let level = env_level();
        let env = Env::default().default_filter_or(level.as_str().to_ascii_lowercase());
        let _ = env_logger::Builder::from_env(env)
            .format_timestamp_millis()
            .format_target(true)
            .try_init();
    });
}

// ============================================================================
// Rate limiting
// ============================================================================

/// Lets through the 1st, (n+1)th, (2n+1)th... occurrence of an event.
#[derive(Debug, Clone)]
pub struct EveryNth {
    every: u64,
    seen: u64,
}

impl EveryNth {
    pub fn new(every: u64) -> Self {
        Self {
            every: every.max(1),
            seen: 0,
        }
    }

    /// Record one occurrence; true if this one should be logged.
    pub fn hit(&mut self) -> bool {
        self.seen += 1;
        self.seen % self.every == 1 % self.every
    }

    pub fn count(&self) -> u64 {
        self.seen
    }
}

/// Lets an event through at most once per interval.
#[derive(Debug, Clone)]
pub struct Throttle {
    interval: Duration,
    last: Option<Instant>,
}

impl Throttle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: None,
        }
    }

    pub fn ready(&mut self) -> bool {
        let now = Instant::now();
        match self.last {
            Some(t) if now.duration_since(t) < self.interval => false,
            _ => {
                self.last = Some(now);
                true
            }
        }
    }
}

// ============================================================================
// Python bridge
// ============================================================================

#[cfg(feature = "python")]
pub use python::{init_python_logging, set_python_log_level_str};

#[cfg(feature = "python")]
mod python {
    use std::collections::HashMap;
    use std::sync::{Mutex, Once};

    use log::{Level, LevelFilter, Log, Metadata, Record};
    use once_cell::sync::OnceCell;
    use pyo3::prelude::*;
    use pyo3::types::PyModule;

    use super::{env_level, parse_level};

    static PY_LOG_ONCE: Once = Once::new();
    static PY_LOGGER: OnceCell<&'static PyLogger> = OnceCell::new();

    /// Forwards `log` records to `logging.getLogger(<target>)`, with `::`
    /// in module paths turned into `.`.
    struct PyLogger {
        max_level: Mutex<LevelFilter>,
        logging_mod: Py<PyModule>,
        loggers: Mutex<HashMap<String, Py<PyAny>>>,
    }

    impl PyLogger {
        fn new(py: Python<'_>, max_level: LevelFilter) -> PyResult<Self> {
            Ok(Self {
                max_level: Mutex::new(max_level),
                logging_mod: py.import("logging")?.into(),
                loggers: Mutex::new(HashMap::new()),
            })
        }

        fn py_level(level: Level) -> u32 {
            match level {
                Level::Error => 40,
                Level::Warn => 30,
                Level::Info => 20,
                Level::Debug => 10,
                Level::Trace => 5,
            }
        }

        fn logger_for(&self, py: Python<'_>, target: &str) -> PyResult<Py<PyAny>> {
            let mut loggers = match self.loggers.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            if let Some(logger) = loggers.get(target) {
                return Ok(logger.clone_ref(py));
            }
            let logger = self
                .logging_mod
                .bind(py)
                .call_method1("getLogger", (target,))?
                .unbind();
            loggers.insert(target.to_string(), logger.clone_ref(py));
            Ok(logger)
        }

        fn forward(&self, record: &Record) {
            let target = record.target().replace("::", ".");
            let level = Self::py_level(record.level());
            let message = record.args().to_string();

            Python::attach(|py| {
                let result = self.logger_for(py, &target).and_then(|logger| {
                    let logger = logger.bind(py);
                    if logger.call_method1("isEnabledFor", (level,))?.is_truthy()? {
                        logger.call_method1("log", (level, message))?;
                    }
                    Ok(())
                });
                if let Err(e) = result {
                    e.restore(py);
                }
            });
        }

        fn set_max_level(&self, level: LevelFilter) {
            if let Ok(mut current) = self.max_level.lock() {
                *current = level;
            }
            if let Ok(mut loggers) = self.loggers.lock() {
                loggers.clear();
            }
        }
    }

    impl Log for PyLogger {
        fn enabled(&self, metadata: &Metadata) -> bool {
            self.max_level
                .lock()
                .map(|level| metadata.level().to_level_filter() <= *level)
                .unwrap_or(false)
        }

        fn log(&self, record: &Record) {
            if self.enabled(record.metadata()) {
                self.forward(record);
            }
        }

        fn flush(&self) {}
    }

    /// Route Rust logs into Python's `logging`. Safe to call more than once.
    pub fn init_python_logging(py: Python<'_>) -> PyResult<()> {
        let level = env_level();
        let mut result = Ok(());
        PY_LOG_ONCE.call_once(|| match PyLogger::new(py, level) {
            Ok(logger) => {
                let leaked: &'static PyLogger = Box::leak(Box::new(logger));
                if log::set_logger(leaked).is_ok() {
                    log::set_max_level(level);
                    let _ = PY_LOGGER.set(leaked);
                }
            }
            Err(e) => result = Err(e),
        });
        result
    }

    /// Change the forwarded level at runtime (`None` re-reads the environment).
    pub fn set_python_log_level_str(py: Python<'_>, level: Option<&str>) -> PyResult<()> {
        let level = level.and_then(parse_level).unwrap_or_else(env_level);
        init_python_logging(py)?;
        if let Some(logger) = PY_LOGGER.get() {
            logger.set_max_level(level);
        }
        log::set_max_level(level);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_nth_lets_first_of_each_run_through() {
        let mut limiter = EveryNth::new(50);
        let logged: Vec<u64> = (1..=120).filter(|_| limiter.hit()).collect();
        assert_eq!(logged, vec![1, 51, 101]);
        assert_eq!(limiter.count(), 120);
    }

    #[test]
    fn every_nth_of_one_logs_everything() {
        let mut limiter = EveryNth::new(1);
        assert!((0..10).all(|_| limiter.hit()));
    }

    #[test]
    fn throttle_blocks_within_interval() {
        let mut throttle = Throttle::new(Duration::from_secs(60));
        assert!(throttle.ready());
        assert!(!throttle.ready());

        let mut open = Throttle::new(Duration::ZERO);
        assert!(open.ready());
        assert!(open.ready());
    }

    #[test]
    fn level_parsing() {
        assert_eq!(parse_level("debug"), Some(LevelFilter::Debug));
        assert_eq!(parse_level(" WARN "), Some(LevelFilter::Warn));
        assert_eq!(parse_level("loud"), None);
    }
}
