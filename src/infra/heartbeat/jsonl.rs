//! File-backed heartbeat mirror using JSON lines.

use std::fs::{create_dir_all, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

use crate::core::{Heartbeat, HeartbeatSink, SchedulerError};

/// Appends every heartbeat to `<dir>/<name>.jsonl` for external monitors.
///
/// Write failures are logged and dropped: the mirror is not needed for
/// scheduling to work.
pub struct JsonlHeartbeatSink {
    file_path: PathBuf,
    file: Mutex<File>,
}

impl JsonlHeartbeatSink {
    /// Open (or create) the heartbeat file.
    ///
    /// # Errors
    ///
    /// Returns `SchedulerError::Backend` if the file cannot be opened.
    pub fn open(path: impl AsRef<Path>, name: &str) -> Result<Self, SchedulerError> {
        let dir = path.as_ref();
        create_dir_all(dir).map_err(|e| SchedulerError::Backend(e.to_string()))?;
        let file_path = dir.join(format!("{name}.jsonl"));
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&file_path)
            .map_err(|e| SchedulerError::Backend(e.to_string()))?;
        Ok(Self {
            file_path,
            file: Mutex::new(file),
        })
    }

    /// File location.
    pub fn file_path(&self) -> &Path {
        &self.file_path
    }

    /// Read back every recorded heartbeat.
    ///
    /// # Errors
    ///
    /// Returns `SchedulerError::Backend` on I/O or parse failure.
    pub fn read_all(&self) -> Result<Vec<Heartbeat>, SchedulerError> {
        let file = File::open(&self.file_path).map_err(|e| SchedulerError::Backend(e.to_string()))?;
        BufReader::new(file)
            .lines()
            .map(|line| {
                let line = line.map_err(|e| SchedulerError::Backend(e.to_string()))?;
                serde_json::from_str(&line).map_err(|e| SchedulerError::Backend(e.to_string()))
            })
            .collect()
    }
}

impl HeartbeatSink for JsonlHeartbeatSink {
    fn record(&self, heartbeat: &Heartbeat) {
        let line = match serde_json::to_string(heartbeat) {
            Ok(line) => line,
            Err(err) => {
                tracing::warn!(job = %heartbeat.job, error = %err, "heartbeat not serializable");
                return;
            }
        };
        if let Err(err) = writeln!(self.file.lock(), "{line}") {
            tracing::warn!(job = %heartbeat.job, path = %self.file_path.display(), error = %err, "heartbeat write failed");
        }
    }
}
