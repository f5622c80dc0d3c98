use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Utc;
use tracing::info;

/// Append-only text log of worker-run summaries.
///
/// Before each append the file is rotated if it has grown past
/// `max_bytes`: it is renamed to `<name>.<YYYYmmddHHMMSS>` and a fresh file
/// is started.
#[derive(Debug, Clone)]
pub struct SummaryLog {
    path: PathBuf,
    max_bytes: u64,
}

impl SummaryLog {
    pub fn new(path: impl Into<PathBuf>, max_bytes: u64) -> Self {
        Self {
            path: path.into(),
            max_bytes,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write one timestamped line.
    pub fn append(&self, line: &str) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        self.rotate_if_needed()?;

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "[{}] {}", Utc::now().format("%Y-%m-%d %H:%M:%S"), line)
    }

    /// Returns the rotated file's path when a rotation happened.
    pub fn rotate_if_needed(&self) -> std::io::Result<Option<PathBuf>> {
        let size = match fs::metadata(&self.path) {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };
        if size <= self.max_bytes {
            return Ok(None);
        }

        let stamp = Utc::now().format("%Y%m%d%H%M%S");
        let mut rotated = self.path.clone().into_os_string();
        rotated.push(format!(".{stamp}"));
        let rotated = PathBuf::from(rotated);

        fs::rename(&self.path, &rotated)?;
        info!(from = %self.path.display(), to = %rotated.display(), size, "worker log rotated");
        Ok(Some(rotated))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn appends_lines_and_creates_parent() {
        let dir = tempfile::tempdir().unwrap();
        let log = SummaryLog::new(dir.path().join("logs/worker.log"), 1024);

        log.append("first").unwrap();
        log.append("second").unwrap();

        let text = fs::read_to_string(log.path()).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with("] first"));
        assert!(lines[1].ends_with("] second"));
    }

    #[test]
    fn rotates_past_threshold() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("worker.log");
        fs::write(&path, "x".repeat(64)).unwrap();

        let log = SummaryLog::new(&path, 32);
        log.append("after rotation").unwrap();

        let text = fs::read_to_string(&path).unwrap();
        assert_eq!(text.lines().count(), 1);
        assert!(text.contains("after rotation"));

        let rotated: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .filter(|name| name.starts_with("worker.log."))
            .collect();
        assert_eq!(rotated.len(), 1);
        assert_eq!(rotated[0].len(), "worker.log.".len() + 14);
    }

    #[test]
    fn small_file_is_left_alone() {
        let dir = tempfile::tempdir().unwrap();
        let log = SummaryLog::new(dir.path().join("worker.log"), 1024);
        assert!(log.rotate_if_needed().unwrap().is_none());
        log.append("one").unwrap();
        assert!(log.rotate_if_needed().unwrap().is_none());
    }
}
