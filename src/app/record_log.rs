//! Rotating CSV sink for collected data records.
//!
//! One file per rotation interval, named after its opening time. All writes
//! go through a single appender owned by the application handler, so record
//! files never interleave.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{DateTime, Utc};

const CSV_HEADER: &str = "received_at,node,length,payload_hex\n";

/// Append-only CSV log with time-based rotation.
pub struct RecordLog {
    dir: PathBuf,
    file: File,
    opened_at: DateTime<Utc>,
    rotate_secs: i64,
}

impl RecordLog {
    /// Create the log directory if needed and open the first segment.
    /// Failing here is fatal: the server refuses to start without its sink.
    pub fn open(dir: &Path, rotate_secs: u64) -> anyhow::Result<Self> {
        fs::create_dir_all(dir)
            .with_context(|| format!("failed to create record directory {}", dir.display()))?;
        let opened_at = Utc::now();
        let file = Self::open_segment(dir, opened_at)?;
        Ok(Self {
            dir: dir.to_path_buf(),
            file,
            opened_at,
            rotate_secs: rotate_secs as i64,
        })
    }

    fn segment_path(dir: &Path, opened_at: DateTime<Utc>) -> PathBuf {
        dir.join(format!(
            "records_{}.csv",
            opened_at.format("%Y%m%dT%H%M%SZ")
        ))
    }

    fn open_segment(dir: &Path, opened_at: DateTime<Utc>) -> anyhow::Result<File> {
        let path = Self::segment_path(dir, opened_at);
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("failed to open record log {}", path.display()))?;
        file.write_all(CSV_HEADER.as_bytes())
            .with_context(|| format!("failed to write header to {}", path.display()))?;
        Ok(file)
    }

    /// Append one record row.
    pub fn append(&mut self, received_at: DateTime<Utc>, node: u16, payload: &[u8]) {
        let hex: String = payload.iter().map(|b| format!("{b:02x}")).collect();
        let row = format!(
            "{},{:#06x},{},{}\n",
            received_at.to_rfc3339(),
            node,
            payload.len(),
            hex
        );
        if let Err(err) = self.file.write_all(row.as_bytes()) {
            log::error!("record log write failed: {err}");
        }
    }

    /// Start a new segment once the rotation interval has elapsed. A failed
    /// rotation keeps appending to the current segment.
    pub fn rotate_if_due(&mut self) {
        let now = Utc::now();
        if (now - self.opened_at).num_seconds() < self.rotate_secs {
            return;
        }
        match Self::open_segment(&self.dir, now) {
            Ok(file) => {
                self.file = file;
                self.opened_at = now;
                log::info!("record log rotated");
            }
            Err(err) => log::error!("record log rotation failed: {err}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("rtlora-test-{name}-{}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        dir
    }

    #[test]
    fn test_append_writes_csv_rows() {
        let dir = temp_dir("append");
        let mut log = RecordLog::open(&dir, 3600).unwrap();
        let at = Utc::now();
        log.append(at, 0x0101, &[0xDE, 0xAD]);

        let entries: Vec<_> = fs::read_dir(&dir).unwrap().collect();
        assert_eq!(entries.len(), 1);
        let content = fs::read_to_string(entries[0].as_ref().unwrap().path()).unwrap();
        assert!(content.starts_with(CSV_HEADER));
        assert!(content.contains("0x0101,2,dead"));
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_rotation_opens_new_segment() {
        let dir = temp_dir("rotate");
        let mut log = RecordLog::open(&dir, 0).unwrap();
        // Zero interval: the next check must rotate.
        log.opened_at = Utc::now() - chrono::Duration::seconds(1);
        log.rotate_if_due();
        log.append(Utc::now(), 0x0202, &[0x01]);
        assert!(fs::read_dir(&dir).unwrap().count() >= 1);
        let _ = fs::remove_dir_all(&dir);
    }
}
