//! PID record persistence.
//!
//! The record is a single decimal pid in a text file. `PidFile` keeps no
//! state between calls; every operation goes to disk.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use crate::error::PidFileError;

#[derive(Debug, Clone)]
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Save `pid` to disk (atomic write).
    pub fn save(&self, pid: u32) -> Result<(), PidFileError> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).map_err(|source| PidFileError {
                op: "create directory for",
                path: self.path.clone(),
                source,
            })?;
        }

        // Atomic write: write to temp file, then rename
        let temp_path = self.path.with_extension("pid.tmp");
        fs::write(&temp_path, format!("{pid}\n")).map_err(|source| PidFileError {
            op: "write",
            path: temp_path.clone(),
            source,
        })?;
        fs::rename(&temp_path, &self.path).map_err(|source| {
            let _ = fs::remove_file(&temp_path);
            PidFileError {
                op: "write",
                path: self.path.clone(),
                source,
            }
        })?;
        log::debug!("recorded pid {pid} in {}", self.path.display());
        Ok(())
    }

    /// Recorded pid, or `None` when there is no usable record.
    ///
    /// A missing, empty, unparsable or unreadable file all mean "no
    /// recorded process"; none of them is an error.
    pub fn load(&self) -> Option<u32> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => return None,
            Err(e) => {
                log::warn!("ignoring unreadable pid file {}: {e}", self.path.display());
                return None;
            }
        };
        match parse_pid(&raw) {
            Some(pid) => Some(pid),
            None => {
                log::warn!(
                    "ignoring malformed pid file {} (content: {:?})",
                    self.path.display(),
                    raw.trim()
                );
                None
            }
        }
    }

    /// Remove the record. A record that is already gone is fine.
    pub fn clear(&self) -> Result<(), PidFileError> {
        match fs::remove_file(&self.path) {
            Ok(()) => {
                log::debug!("cleared pid file {}", self.path.display());
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(source) => Err(PidFileError {
                op: "remove",
                path: self.path.clone(),
                source,
            }),
        }
    }
}

/// Parse a positive pid that fits in `pid_t`.
fn parse_pid(raw: &str) -> Option<u32> {
    let pid: u32 = raw.trim().parse().ok()?;
    (pid > 0 && pid <= i32::MAX as u32).then_some(pid)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_save_load_clear() {
        let dir = tempfile::tempdir().unwrap();
        let store = PidFile::new(dir.path().join("run").join("app.pid"));

        assert_eq!(store.load(), None);
        for pid in [1, 4242, i32::MAX as u32] {
            store.save(pid).unwrap();
            assert_eq!(store.load(), Some(pid));
        }
        store.clear().unwrap();
        assert_eq!(store.load(), None);
        // clearing twice is a no-op
        store.clear().unwrap();
    }

    #[test]
    fn test_malformed_records_are_absent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.pid");
        let store = PidFile::new(&path);

        for content in ["", "   \n", "abc", "12abc", "0", "-5", "99999999999"] {
            fs::write(&path, content).unwrap();
            assert_eq!(store.load(), None, "content {content:?}");
        }

        fs::write(&path, " 321 \n").unwrap();
        assert_eq!(store.load(), Some(321));
    }

    #[test]
    fn test_save_leaves_no_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = PidFile::new(dir.path().join("app.pid"));
        store.save(77).unwrap();
        let names: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(names, vec![std::ffi::OsString::from("app.pid")]);
    }

    #[test]
    #[cfg(unix)]
    fn test_save_into_unwritable_location_fails() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        fs::write(&blocker, "").unwrap();
        let store = PidFile::new(blocker.join("app.pid"));
        assert!(store.save(10).is_err());
    }
}
