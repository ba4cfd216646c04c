//! On-disk trace of a launched host, so a later invocation can find it.

use std::{
    fs,
    io,
    path::{Path, PathBuf},
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::ChainError;

pub const CHANNEL_EXT: &str = "ctl";
pub const LOG_EXT: &str = "log";
pub const RECORD_EXT: &str = "pid";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessRecord {
    pub name: String,
    pub pid: u32,
    pub uri: String,
    pub started_at: DateTime<Utc>,
}

/// Where the files of one logical name live inside the run directory.
#[derive(Debug, Clone)]
pub struct RunLayout {
    root: PathBuf,
}

impl RunLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn ensure(&self) -> Result<(), ChainError> {
        fs::create_dir_all(&self.root).map_err(|e| ChainError::io(&self.root, e))
    }

    pub fn channel(&self, name: &str) -> PathBuf {
        self.root.join(format!("{name}.{CHANNEL_EXT}"))
    }

    pub fn log(&self, name: &str) -> PathBuf {
        self.root.join(format!("{name}.{LOG_EXT}"))
    }

    pub fn record(&self, name: &str) -> PathBuf {
        self.root.join(format!("{name}.{RECORD_EXT}"))
    }

    pub fn write_record(&self, record: &ProcessRecord) -> Result<(), ChainError> {
        let path = self.record(&record.name);
        let body = serde_json::to_vec_pretty(record)
            .map_err(|e| ChainError::io(&path, io::Error::new(io::ErrorKind::InvalidData, e)))?;
        fs::write(&path, body).map_err(|e| ChainError::io(&path, e))
    }

    pub fn remove_record(&self, name: &str) {
        remove_quietly(&self.record(name));
    }

    /// Every readable record in the run directory. Unreadable ones are
    /// logged and deleted.
    pub fn read_records(&self) -> Vec<ProcessRecord> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(_) => return Vec::new(),
        };
        let mut records = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(RECORD_EXT) {
                continue;
            }
            let parsed = fs::read(&path)
                .map_err(|e| e.to_string())
                .and_then(|bytes| serde_json::from_slice::<ProcessRecord>(&bytes).map_err(|e| e.to_string()));
            match parsed {
                Ok(record) => records.push(record),
                Err(e) => {
                    warn!(record = %path.display(), error = %e, "dropping unreadable process record");
                    remove_quietly(&path);
                }
            }
        }
        records.sort_by(|a, b| a.started_at.cmp(&b.started_at).then(a.name.cmp(&b.name)));
        records
    }
}

pub(crate) fn remove_quietly(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        if e.kind() != io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "could not remove file");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn records_survive_a_round_trip_through_the_run_dir() {
        let tmp = TempDir::new().unwrap();
        let layout = RunLayout::new(tmp.path().join("run"));
        layout.ensure().unwrap();

        let rec = ProcessRecord {
            name: "rig-gain".into(),
            pid: 4242,
            uri: "urn:gain".into(),
            started_at: Utc::now(),
        };
        layout.write_record(&rec).unwrap();
        std::fs::write(layout.record("broken"), b"{not json").unwrap();

        let all = layout.read_records();
        assert_eq!(all, vec![rec]);
        assert!(!layout.record("broken").exists());

        layout.remove_record("rig-gain");
        layout.remove_record("rig-gain");
        assert!(layout.read_records().is_empty());
    }

    #[test]
    fn paths_are_namespaced_by_name() {
        let layout = RunLayout::new("/tmp/chainrig");
        assert_eq!(layout.channel("rig-chorus"), PathBuf::from("/tmp/chainrig/rig-chorus.ctl"));
        assert_eq!(layout.log("rig-chorus"), PathBuf::from("/tmp/chainrig/rig-chorus.log"));
        assert_eq!(layout.record("rig-chorus"), PathBuf::from("/tmp/chainrig/rig-chorus.pid"));
    }
}
