//! File-backed `log` backend.
//!
//! The client owns the terminal in raw mode, so nothing may be written to
//! stdout/stderr while it runs. Records go to `$REMUX_LOG_FILE`
//! (default `<tmp>/remux_debug.log`) at the level named by `REMUX_LOG`.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use log::{LevelFilter, Log, Metadata, Record};

struct FileLogger {
    level: LevelFilter,
    file: Mutex<File>,
}

impl Log for FileLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) { return; }
        let line = format!("[{}] [{:<5}] [{}] {}\n", timestamp(), record.level(), record.target(), record.args());
        if let Ok(mut f) = self.file.lock() {
            let _ = f.write_all(line.as_bytes());
        }
    }

    fn flush(&self) {
        if let Ok(mut f) = self.file.lock() { let _ = f.flush(); }
    }
}

fn timestamp() -> String {
    let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default();
    format!("{}.{:06}", now.as_secs(), now.subsec_micros())
}

pub fn parse_level(s: &str) -> Option<LevelFilter> {
    match s.trim().to_ascii_lowercase().as_str() {
        "off" | "0" | "" => Some(LevelFilter::Off),
        "error" | "1" => Some(LevelFilter::Error),
        "warn" | "warning" => Some(LevelFilter::Warn),
        "info" | "2" => Some(LevelFilter::Info),
        "debug" | "3" => Some(LevelFilter::Debug),
        "trace" | "4" => Some(LevelFilter::Trace),
        _ => None,
    }
}

fn log_path() -> PathBuf {
    std::env::var_os("REMUX_LOG_FILE")
        .map(PathBuf::from)
        .unwrap_or_else(|| std::env::temp_dir().join("remux_debug.log"))
}

/// Install the logger. Silently does nothing when logging is off or the log
/// file cannot be opened.
pub fn init_logging() {
    let level = std::env::var("REMUX_LOG").ok()
        .and_then(|v| parse_level(&v))
        .unwrap_or(LevelFilter::Off);
    if level == LevelFilter::Off { return; }
    let Ok(file) = OpenOptions::new().create(true).append(true).open(log_path()) else { return; };
    let logger = FileLogger { level, file: Mutex::new(file) };
    if log::set_boxed_logger(Box::new(logger)).is_ok() {
        log::set_max_level(level);
        log::info!("remux {} logging at {}", crate::types::VERSION, level);
    }
}
