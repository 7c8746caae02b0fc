//! Best-effort on-disk persistence of session records.
//!
//! The session store invokes the hook on every update; durability is not
//! part of correctness, so failures are logged and swallowed. Writes are
//! atomic (temp file + fsync + rename) so a crash never leaves a torn
//! file behind.

use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::models::SessionRecord;

/// Hook invoked by the session store whenever the session set changes.
pub trait SessionPersistence: Send + Sync {
    /// Persists the full set of alive session records.
    fn persist(&self, records: &[SessionRecord]);

    /// Loads whatever records survived the previous run.
    fn load(&self) -> Vec<SessionRecord>;
}

/// Persistence that drops everything; used in tests.
#[derive(Debug, Default)]
pub struct NoopPersistence;

impl SessionPersistence for NoopPersistence {
    fn persist(&self, _records: &[SessionRecord]) {}

    fn load(&self) -> Vec<SessionRecord> {
        Vec::new()
    }
}

/// JSON-file persistence: one file holding every alive session record,
/// keyed by UUID on load.
#[derive(Debug)]
pub struct JsonFilePersistence {
    path: PathBuf,
}

impl JsonFilePersistence {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        JsonFilePersistence { path: path.into() }
    }

    fn write_atomic(&self, records: &[SessionRecord]) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        {
            let mut file = std::fs::File::create(&tmp)?;
            let body = serde_json::to_vec_pretty(records)
                .map_err(|e| std::io::Error::other(e.to_string()))?;
            file.write_all(&body)?;
            file.sync_all()?;
        }
        std::fs::rename(&tmp, &self.path)
    }
}

impl SessionPersistence for JsonFilePersistence {
    fn persist(&self, records: &[SessionRecord]) {
        if let Err(e) = self.write_atomic(records) {
            warn!(path = %self.path.display(), error = %e, "Could not persist session records");
        }
    }

    fn load(&self) -> Vec<SessionRecord> {
        match read_records(&self.path) {
            Ok(records) => records,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Could not load session records");
                Vec::new()
            }
        }
    }
}

fn read_records(path: &Path) -> std::io::Result<Vec<SessionRecord>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let content = std::fs::read(path)?;
    serde_json::from_slice(&content).map_err(|e| std::io::Error::other(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Session;
    use crate::test_utils::test_application;
    use tempfile::tempdir;

    #[test]
    fn roundtrip_through_file() {
        let dir = tempdir().unwrap();
        let persistence = JsonFilePersistence::new(dir.path().join("sessions.json"));

        let session = Session::new(test_application("persist"), "main");
        session.set_port(4242);
        persistence.persist(&[session.to_record()]);

        let loaded = persistence.load();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].uuid, session.uuid);
        assert_eq!(loaded[0].port, 4242);
    }

    #[test]
    fn load_missing_file_is_empty() {
        let dir = tempdir().unwrap();
        let persistence = JsonFilePersistence::new(dir.path().join("absent.json"));
        assert!(persistence.load().is_empty());
    }

    #[test]
    fn load_corrupt_file_is_empty() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sessions.json");
        std::fs::write(&path, "{not json").unwrap();
        let persistence = JsonFilePersistence::new(path);
        assert!(persistence.load().is_empty());
    }

    #[test]
    fn persist_overwrites_previous_contents() {
        let dir = tempdir().unwrap();
        let persistence = JsonFilePersistence::new(dir.path().join("sessions.json"));

        let first = Session::new(test_application("persist"), "main");
        persistence.persist(&[first.to_record()]);
        persistence.persist(&[]);

        assert!(persistence.load().is_empty());
    }
}
