//! Best-effort user notifications backed by an append-only log.
//!
//! Alert-phase notices go through a [`Notifier`]; the file variant appends
//! newline-framed messages to `notify.log` in the state dir and a separate
//! reader (the UI side) tails the same file. Writes fsync so a notice is
//! never lost to a crash, but failures are the caller's to ignore: nothing
//! on the request path may block on notification delivery.

use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

pub const NOTIFY_LOG_FILE_NAME: &str = "notify.log";

pub trait Notifier: Send + Sync {
    fn notify(&self, body: &[u8]) -> io::Result<()>;
}

/// Swallows everything. Default for callers that don't surface alerts.
pub struct NullNotifier;

impl Notifier for NullNotifier {
    fn notify(&self, _body: &[u8]) -> io::Result<()> {
        Ok(())
    }
}

fn default_log_path() -> PathBuf {
    let mut p = dirs::config_dir().unwrap_or_else(|| PathBuf::from("."));
    p.push("tether");
    p.push(NOTIFY_LOG_FILE_NAME);
    p
}

/// Appends one line per notice.
pub struct FileNotifier {
    file: Mutex<File>,
}

impl FileNotifier {
    pub fn open(path: &Path) -> io::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            file: Mutex::new(file),
        })
    }

    pub fn open_default() -> io::Result<Self> {
        Self::open(&default_log_path())
    }
}

impl Notifier for FileNotifier {
    fn notify(&self, body: &[u8]) -> io::Result<()> {
        let mut file = self.file.lock().expect("notifier lock");
        file.write_all(body)?;
        file.write_all(b"\n")?;
        file.sync_data()
    }
}

/// Drains the notification log line by line. Opening truncates the file, so
/// a fresh reader only ever sees notices written after it attached.
pub struct NotificationReader {
    lines: BufReader<File>,
}

impl NotificationReader {
    pub fn open(path: &Path) -> io::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(true)
            .open(path)?;
        Ok(Self {
            lines: BufReader::new(file),
        })
    }

    pub fn open_default() -> io::Result<Self> {
        Self::open(&default_log_path())
    }

    /// Next notice, without its trailing newline. `Ok(None)` at end of log.
    pub fn read(&mut self) -> io::Result<Option<Vec<u8>>> {
        let mut line = String::new();
        let n = self.lines.read_line(&mut line)?;
        if n == 0 {
            return Ok(None);
        }
        while line.ends_with('\n') || line.ends_with('\r') {
            line.pop();
        }
        Ok(Some(line.into_bytes()))
    }
}
