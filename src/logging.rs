use std::fs::{File, OpenOptions};
use std::io;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use tracing_subscriber::fmt::MakeWriter;

use crate::error::VirtupError;

// ── activity log ─────────────────────────────────────────

/// Append-only `virt-up.log` for commands that change instance state.
///
/// Installed as a tracing writer before the command is known. Events are
/// dropped until [`ActivityLog::activate`] opens the file.
#[derive(Clone, Default)]
pub struct ActivityLog {
    file: Arc<Mutex<Option<File>>>,
}

impl ActivityLog {
    /// Start appending to `path`, creating its directory.
    pub fn activate(&self, path: &Path) -> Result<(), VirtupError> {
        let io_err = |e: io::Error| VirtupError::Io {
            context: format!("opening log file {}", path.display()),
            source: e,
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(io_err)?;
        if let Ok(mut slot) = self.file.lock() {
            *slot = Some(file);
        }
        Ok(())
    }

    /// `None` while inactive or after a panic poisoned the lock.
    fn with_file<R>(&self, op: impl FnOnce(&mut File) -> io::Result<R>) -> Option<io::Result<R>> {
        let mut slot = self.file.lock().ok()?;
        slot.as_mut().map(op)
    }
}

pub struct ActivityLogWriter<'a> {
    log: &'a ActivityLog,
}

impl io::Write for ActivityLogWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.log
            .with_file(|f| f.write(buf))
            .unwrap_or(Ok(buf.len()))
    }

    fn flush(&mut self) -> io::Result<()> {
        self.log.with_file(|f| f.flush()).unwrap_or(Ok(()))
    }
}

impl<'a> MakeWriter<'a> for ActivityLog {
    type Writer = ActivityLogWriter<'a>;

    fn make_writer(&'a self) -> Self::Writer {
        ActivityLogWriter { log: self }
    }
}

// ── tool output ──────────────────────────────────────────

/// Forward captured tool output into the log, one event per non-blank line.
pub fn log_output(command: &str, stdout: &[u8], stderr: &[u8]) {
    let lines = |bytes: &[u8]| -> Vec<String> {
        String::from_utf8_lossy(bytes)
            .lines()
            .map(str::trim_end)
            .filter(|l| !l.is_empty())
            .map(String::from)
            .collect()
    };
    for line in lines(stdout) {
        tracing::info!(command, "{line}");
    }
    for line in lines(stderr) {
        tracing::error!(command, "{line}");
    }
}

// ── timestamps ───────────────────────────────────────────

/// Current UTC time as `YYYY-MM-DDTHH:MM:SSZ`, the format of the
/// `created` and `cloned` metadata fields.
pub fn utc_timestamp() -> String {
    let secs = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    format_timestamp(secs)
}

fn is_leap(year: u64) -> bool {
    (year % 4 == 0 && year % 100 != 0) || year % 400 == 0
}

fn month_lengths(year: u64) -> [u64; 12] {
    let feb = if is_leap(year) { 29 } else { 28 };
    [31, feb, 31, 30, 31, 30, 31, 31, 30, 31, 30, 31]
}

fn format_timestamp(secs: u64) -> String {
    let clock = secs % 86_400;
    let mut days = secs / 86_400;

    let mut year = 1970;
    loop {
        let len = if is_leap(year) { 366 } else { 365 };
        if days < len {
            break;
        }
        days -= len;
        year += 1;
    }

    let mut month = 1;
    for len in month_lengths(year) {
        if days < len {
            break;
        }
        days -= len;
        month += 1;
    }

    format!(
        "{year:04}-{month:02}-{:02}T{:02}:{:02}:{:02}Z",
        days + 1,
        clock / 3600,
        clock / 60 % 60,
        clock % 60
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn timestamp_epoch() {
        assert_eq!(format_timestamp(0), "1970-01-01T00:00:00Z");
    }

    #[test]
    fn timestamp_leap_day() {
        // 2020-02-29 12:34:56 UTC
        assert_eq!(format_timestamp(1_582_979_696), "2020-02-29T12:34:56Z");
    }

    #[test]
    fn timestamp_last_second_of_year() {
        assert_eq!(format_timestamp(1_609_459_199), "2020-12-31T23:59:59Z");
        assert_eq!(format_timestamp(1_609_459_200), "2021-01-01T00:00:00Z");
    }

    #[test]
    fn activity_log_drops_events_until_activated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs").join("virt-up.log");
        let log = ActivityLog::default();

        log.make_writer().write_all(b"dropped\n").unwrap();
        assert!(!path.exists());

        log.activate(&path).unwrap();
        log.clone().make_writer().write_all(b"kept\n").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "kept\n");
    }
}
