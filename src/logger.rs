//! Session logger: the `log` backend for the engine and the CLI.
//!
//! Records go to a session file in the OS data directory, truncated at each
//! launch, and are mirrored to stderr at or above a chosen level.
//!
//! Log location:
//!   Windows:  `%APPDATA%\CineTile\cinetile.log`
//!   Linux:    `~/.local/share/CineTile/cinetile.log`
//!   macOS:    `~/Library/Application Support/CineTile/cinetile.log`

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};
use std::time::{SystemTime, UNIX_EPOCH};

use log::{Level, LevelFilter, Log, Metadata, Record};

static LOGGER: OnceLock<SessionLogger> = OnceLock::new();

struct SessionLogger {
    file: Option<Mutex<File>>,
    path: Option<PathBuf>,
    /// Records at or above this level are echoed to stderr.
    echo: LevelFilter,
}

impl Log for SessionLogger {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record<'_>) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let line = format!("[{}] [{}] {}: {}", timestamp(), level_tag(record.level()), record.target(), record.args());
        if let Some(mutex) = &self.file
            && let Ok(mut file) = mutex.lock()
        {
            let _ = writeln!(file, "{}", line);
        }
        if record.level() <= self.echo {
            eprintln!("{}", line);
        }
    }

    fn flush(&self) {
        if let Some(mutex) = &self.file
            && let Ok(mut file) = mutex.lock()
        {
            let _ = file.flush();
        }
    }
}

fn level_tag(level: Level) -> &'static str {
    match level {
        Level::Error => "ERROR",
        Level::Warn => "WARN",
        Level::Info => "INFO",
        Level::Debug => "DEBUG",
        Level::Trace => "TRACE",
    }
}

/// Path of the current session log, once [`init`] has opened it.
pub fn log_path() -> Option<&'static Path> {
    LOGGER.get().and_then(|l| l.path.as_deref())
}

/// Install the session logger. `level` caps what is recorded, `echo` what is
/// also printed to stderr. Only the first call has any effect.
///
/// A log file that cannot be opened is not fatal: records still reach
/// stderr.
pub fn init(level: LevelFilter, echo: LevelFilter) {
    init_at(&log_file_path(), level, echo)
}

/// Like [`init`] with an explicit log file.
pub fn init_at(path: &Path, level: LevelFilter, echo: LevelFilter) {
    if LOGGER.get().is_some() {
        return;
    }
    if let Some(parent) = path.parent() {
        let _ = fs::create_dir_all(parent);
    }
    let file = match OpenOptions::new().create(true).write(true).truncate(true).open(path) {
        Ok(f) => Some(f),
        Err(e) => {
            eprintln!("[logger] Failed to open log file {:?}: {}", path, e);
            None
        }
    };
    let path = file.as_ref().map(|_| path.to_path_buf());
    let logger = LOGGER.get_or_init(|| SessionLogger { file: file.map(Mutex::new), path, echo });
    if log::set_logger(logger).is_err() {
        return;
    }
    log::set_max_level(level);

    if let Some(p) = log_path() {
        log::info!("=== CineTile session started (unix {}) ===", unix_seconds());
        log::info!("log file: {}", p.display());
    }

    let prev = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        log::error!("PANIC: {}", info);
        if let Some(l) = LOGGER.get() {
            l.flush();
        }
        prev(info);
    }));
}

fn log_file_path() -> PathBuf {
    data_dir().join("CineTile").join("cinetile.log")
}

/// Platform data directory (without the app sub-folder).
fn data_dir() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        if let Ok(appdata) = std::env::var("APPDATA") {
            return PathBuf::from(appdata);
        }
    }
    #[cfg(target_os = "macos")]
    {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home).join("Library").join("Application Support");
        }
    }
    if let Ok(xdg) = std::env::var("XDG_DATA_HOME") {
        return PathBuf::from(xdg);
    }
    if let Ok(home) = std::env::var("HOME") {
        return PathBuf::from(home).join(".local").join("share");
    }
    PathBuf::from(".")
}

fn unix_seconds() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
}

/// HH:MM:SS within the current UTC day.
fn timestamp() -> String {
    let secs = unix_seconds();
    format!("{:02}:{:02}:{:02}", (secs % 86400) / 3600, (secs % 3600) / 60, secs % 60)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamp_shape() {
        let ts = timestamp();
        assert_eq!(ts.len(), 8);
        assert_eq!(ts.as_bytes()[2], b':');
        assert_eq!(ts.as_bytes()[5], b':');
        assert_eq!(level_tag(Level::Warn), "WARN");
    }
}
