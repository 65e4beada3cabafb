use std::collections::HashMap;
use std::path::Path;
use std::time::SystemTime;

use gaze_core::enrollment::{EnrollmentError, EnrollmentSet};
use gaze_ipc::proto::EncodingsPayload;

/// Per-user enrollment cache. An entry is valid only while the on-disk
/// file's mtime equals the mtime captured at load; enrollment changes
/// (re-enroll, model added) invalidate by advancing the mtime.
pub struct EncodingCache {
    entries: HashMap<String, EncodingsPayload>,
    hits: u64,
    misses: u64,
}

impl EncodingCache {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
            hits: 0,
            misses: 0,
        }
    }

    pub fn hits(&self) -> u64 {
        self.hits
    }

    pub fn misses(&self) -> u64 {
        self.misses
    }

    /// Fetch a user's encodings, reloading from `path` when the cache is
    /// cold or stale. `Ok(None)` means the user has no enrollment file.
    pub fn lookup(
        &mut self,
        username: &str,
        path: &Path,
    ) -> Result<Option<EncodingsPayload>, EnrollmentError> {
        let current_mtime = match std::fs::metadata(path).and_then(|m| m.modified()) {
            Ok(mtime) => mtime,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // The enrollment was deleted out from under us.
                self.entries.remove(username);
                return Ok(None);
            }
            Err(source) => {
                return Err(EnrollmentError::Io {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };

        if let Some(entry) = self.entries.get(username) {
            if entry.source_mtime == current_mtime {
                self.hits += 1;
                return Ok(Some(entry.clone()));
            }
            tracing::info!(username, "enrollment file changed, reloading");
        }

        let set = match EnrollmentSet::load(path) {
            Ok(set) => set,
            Err(EnrollmentError::Missing { .. }) => {
                self.entries.remove(username);
                return Ok(None);
            }
            Err(e) => return Err(e),
        };
        self.misses += 1;

        let payload = payload_of(&set, current_mtime);
        self.entries.insert(username.to_string(), payload.clone());
        Ok(Some(payload))
    }

    /// Drop one user's entry.
    pub fn invalidate(&mut self, username: &str) {
        if self.entries.remove(username).is_some() {
            tracing::info!(username, "enrollment cache invalidated");
        }
    }
}

impl Default for EncodingCache {
    fn default() -> Self {
        Self::new()
    }
}

fn payload_of(set: &EnrollmentSet, source_mtime: SystemTime) -> EncodingsPayload {
    EncodingsPayload {
        vectors: set.vectors.rows().into_iter().map(|r| r.to_vec()).collect(),
        meta: set.meta.clone(),
        source_mtime,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gaze_core::enrollment::EnrollmentEntry;
    use std::time::Duration;

    fn write_enrollment(path: &Path, label: &str, rows: usize) {
        let entries = vec![EnrollmentEntry {
            label: label.to_string(),
            time: 1_700_000_000,
            data: vec![vec![0.5; 8]; rows],
        }];
        std::fs::write(path, serde_json::to_vec(&entries).unwrap()).unwrap();
    }

    #[test]
    fn hit_and_miss_accounting() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("alice.json");
        write_enrollment(&path, "default", 2);

        let mut cache = EncodingCache::new();
        let first = cache.lookup("alice", &path).unwrap().unwrap();
        assert_eq!(first.vectors.len(), 2);
        assert_eq!(first.meta.len(), 2);
        assert_eq!((cache.hits(), cache.misses()), (0, 1));

        let second = cache.lookup("alice", &path).unwrap().unwrap();
        assert_eq!(second, first);
        assert_eq!((cache.hits(), cache.misses()), (1, 1));
        // Hits plus misses equal the number of lookups served.
        assert_eq!(cache.hits() + cache.misses(), 2);
    }

    #[test]
    fn missing_file_is_none_not_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut cache = EncodingCache::new();
        assert!(cache
            .lookup("bob", &dir.path().join("bob.json"))
            .unwrap()
            .is_none());
        assert_eq!((cache.hits(), cache.misses()), (0, 0));
    }

    #[test]
    fn mtime_advance_invalidates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("alice.json");
        write_enrollment(&path, "default", 1);

        let mut cache = EncodingCache::new();
        let first = cache.lookup("alice", &path).unwrap().unwrap();
        assert_eq!(first.vectors.len(), 1);

        // Re-enroll with more descriptors; ensure the mtime moves.
        std::thread::sleep(Duration::from_millis(20));
        write_enrollment(&path, "glasses", 3);

        let second = cache.lookup("alice", &path).unwrap().unwrap();
        assert_eq!(second.vectors.len(), 3);
        assert_eq!(second.meta[0].label, "glasses");
        assert_eq!((cache.hits(), cache.misses()), (0, 2));
    }

    #[test]
    fn deleted_enrollment_drops_the_entry() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("alice.json");
        write_enrollment(&path, "default", 1);

        let mut cache = EncodingCache::new();
        assert!(cache.lookup("alice", &path).unwrap().is_some());
        std::fs::remove_file(&path).unwrap();
        assert!(cache.lookup("alice", &path).unwrap().is_none());
    }

    #[test]
    fn explicit_invalidate_forces_a_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("alice.json");
        write_enrollment(&path, "default", 1);

        let mut cache = EncodingCache::new();
        cache.lookup("alice", &path).unwrap();
        cache.invalidate("alice");
        cache.lookup("alice", &path).unwrap();
        assert_eq!((cache.hits(), cache.misses()), (0, 2));
    }

    #[test]
    fn corrupt_enrollment_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("eve.json");
        std::fs::write(&path, b"{broken").unwrap();
        let mut cache = EncodingCache::new();
        assert!(matches!(
            cache.lookup("eve", &path),
            Err(EnrollmentError::Corrupt { .. })
        ));
    }
}
