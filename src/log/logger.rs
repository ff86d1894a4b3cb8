use crate::log::{log_msg::LogMsg, logger_handle::LoggerHandle};

use std::{
    fs::{self, OpenOptions},
    io::{self, BufWriter, Write},
    path::{Path, PathBuf},
    sync::mpsc,
    thread,
    time::{SystemTime, UNIX_EPOCH},
};

/// Bounded, non-blocking logger that writes to a per-process log file.
///
/// Messages flow through a bounded channel into a background writer thread,
/// so control-plane threads never block on disk. The worker flushes every
/// few lines and drops messages when the queue is full rather than stalling.
pub struct Logger {
    handle: LoggerHandle,
    _thread: Option<thread::JoinHandle<()>>,
    file_path: PathBuf,
}

impl Logger {
    /// Create `logs/` next to the executable and start the logger there.
    /// Example: `target/debug/logs/rustycastd-20260801_101502-pid1234.log`
    #[must_use]
    pub fn start_default(app_name: &str, cap: usize) -> Self {
        let base = exe_dir_fallback_cwd().join("logs");
        Self::start_in_dir(base, app_name, cap, false)
    }

    /// Start the logger in a specific directory.
    ///
    /// Creates the directory if missing and chooses a timestamped, per-PID
    /// file name. With `echo_stderr` every line is mirrored to stderr,
    /// which is what the daemon does when it runs in the foreground.
    pub fn start_in_dir<D: AsRef<Path>>(
        dir: D,
        app_name: &str,
        cap: usize,
        echo_stderr: bool,
    ) -> Self {
        let dir = dir.as_ref().to_path_buf();
        let _ = fs::create_dir_all(&dir);

        let fname = format!(
            "{}-{}-pid{}.log",
            app_name,
            timestamp_for_filename(),
            std::process::id()
        );
        let file_path = dir.join(&fname);

        let (tx, rx) = mpsc::sync_channel::<LogMsg>(cap.max(1));
        let file_path_clone = file_path.clone();

        let _thread = thread::Builder::new()
            .name("logger-worker".into())
            .spawn(move || {
                // Try target file -> temp file -> sink (never panic).
                let writer: Box<dyn Write + Send> = if let Ok(f) = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&file_path_clone)
                {
                    Box::new(f)
                } else {
                    let fallback = std::env::temp_dir().join("rustycast-fallback.log");
                    match OpenOptions::new().create(true).append(true).open(&fallback) {
                        Ok(f) => Box::new(f),
                        Err(_) => Box::new(io::sink()),
                    }
                };

                let mut out: BufWriter<Box<dyn Write + Send>> = BufWriter::new(writer);
                let mut lines_written: u32 = 0;

                while let Ok(m) = rx.recv() {
                    let _ = writeln!(
                        &mut out,
                        "[{}] {} {} | {}",
                        m.level.as_str(),
                        m.ts_ms,
                        m.target,
                        m.text
                    );
                    if echo_stderr {
                        eprintln!("[{}] {} | {}", m.level.as_str(), m.target, m.text);
                    }

                    lines_written = lines_written.wrapping_add(1);
                    if lines_written % 16 == 0 {
                        let _ = out.flush();
                    }
                }

                let _ = out.flush();
            })
            .ok();

        Self {
            handle: LoggerHandle { tx },
            _thread,
            file_path,
        }
    }

    /// Give modules a cloneable sink they can keep.
    #[must_use]
    pub fn handle(&self) -> LoggerHandle {
        self.handle.clone()
    }

    /// The chosen file path (nice for debugging).
    #[must_use]
    pub fn file_path(&self) -> &Path {
        &self.file_path
    }
}

/// logs next to the executable (target/{debug,release}), or current dir on error.
fn exe_dir_fallback_cwd() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|p| p.parent().map(Path::to_path_buf))
        .unwrap_or_else(|| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")))
}

/// Human-ish timestamp for filenames without extra deps.
/// Example: `20260801_101502`
fn timestamp_for_filename() -> String {
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();

    match unix_to_utc(secs) {
        Some(tm) => format!(
            "{:04}{:02}{:02}_{:02}{:02}{:02}",
            tm.year, tm.mon, tm.day, tm.hour, tm.min, tm.sec
        ),
        None => format!("unix_{secs}"),
    }
}

#[derive(Clone, Copy, Debug)]
pub(crate) struct SimpleUtc {
    pub year: i32,
    pub mon: u32,
    pub day: u32,
    pub hour: u32,
    pub min: u32,
    pub sec: u32,
    /// 0 = Sunday .. 6 = Saturday.
    pub weekday: u32,
}

/// Minimal UTC conversion (no leap seconds), days-from-civil inverse.
pub(crate) fn unix_to_utc(mut s: u64) -> Option<SimpleUtc> {
    let sec = (s % 60) as u32;
    s /= 60;
    let min = (s % 60) as u32;
    s /= 60;
    let hour = (s % 24) as u32;
    s /= 24;

    // 1970-01-01 was a Thursday.
    let weekday = ((s + 4) % 7) as u32;

    // i128 keeps the era arithmetic away from any wrap.
    let z: i128 = i128::from(s) + 719_468;

    let era = (if z >= 0 { z } else { z - 146_096 }) / 146_097;
    let doe = z - era * 146_097; // [0, 146096]
    let yoe = (doe - doe / 1_460 + doe / 36_524 - doe / 146_096) / 365;
    let y = yoe + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100); // [0, 365]
    let mp = (5 * doy + 2) / 153; // [0, 11]
    let d = doy - (153 * mp + 2) / 5 + 1; // [1, 31]
    let m = mp + if mp < 10 { 3 } else { -9 }; // [1, 12]

    let year_i = y + i128::from(m <= 2);

    Some(SimpleUtc {
        year: i32::try_from(year_i).ok()?,
        mon: u32::try_from(m).ok()?,
        day: u32::try_from(d).ok()?,
        hour,
        min,
        sec,
        weekday,
    })
}

#[cfg(test)]
mod tests {
    #![allow(clippy::expect_used)]
    use super::*;

    #[test]
    fn unix_epoch_converts() {
        let tm = unix_to_utc(0).expect("epoch converts");
        assert_eq!(
            (tm.year, tm.mon, tm.day, tm.hour, tm.min, tm.sec),
            (1970, 1, 1, 0, 0, 0)
        );
        // 1970-01-01 was a Thursday.
        assert_eq!(tm.weekday, 4);
    }

    #[test]
    fn known_date_converts() {
        // 2026-08-01 00:00:00 UTC (a Saturday).
        let tm = unix_to_utc(1_785_542_400).expect("date converts");
        assert_eq!((tm.year, tm.mon, tm.day), (2026, 8, 1));
        assert_eq!(tm.weekday, 6);
    }
}
