use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use ndarray::Array2;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EnrollmentError {
    #[error("no enrollment for this user ({path})")]
    Missing { path: PathBuf },
    #[error("failed to read enrollment file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("enrollment file {path} is corrupt: {detail}")]
    Corrupt { path: PathBuf, detail: String },
}

/// One entry of the on-disk enrollment file, as the enrollment tool writes
/// it: a label, a creation timestamp, and one or more descriptor rows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrollmentEntry {
    pub label: String,
    pub time: i64,
    pub data: Vec<Vec<f64>>,
}

/// Per-row provenance: which entry a descriptor row came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DescriptorMeta {
    pub label: String,
    pub time: i64,
}

/// A user's enrollment, flattened for matching: every descriptor row from
/// every entry, stacked into one matrix, with one meta record per row.
///
/// Invariant: `vectors.nrows() == meta.len()`, and both equal the sum of
/// `data` lengths across the on-disk entries.
#[derive(Debug, Clone)]
pub struct EnrollmentSet {
    pub vectors: Array2<f64>,
    pub meta: Vec<DescriptorMeta>,
    pub source_mtime: SystemTime,
}

impl EnrollmentSet {
    pub fn len(&self) -> usize {
        self.vectors.nrows()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dim(&self) -> usize {
        self.vectors.ncols()
    }

    /// Load and flatten a user's enrollment file. The file is a JSON list
    /// of entries; all `data` rows are concatenated in order. Ragged rows
    /// (mismatched descriptor dimensions) reject the whole file.
    pub fn load(path: &Path) -> Result<Self, EnrollmentError> {
        let raw = match fs::read(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(EnrollmentError::Missing {
                    path: path.to_path_buf(),
                })
            }
            Err(source) => {
                return Err(EnrollmentError::Io {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        let mtime = fs::metadata(path)
            .and_then(|m| m.modified())
            .map_err(|source| EnrollmentError::Io {
                path: path.to_path_buf(),
                source,
            })?;

        let entries: Vec<EnrollmentEntry> =
            serde_json::from_slice(&raw).map_err(|e| EnrollmentError::Corrupt {
                path: path.to_path_buf(),
                detail: e.to_string(),
            })?;

        Self::from_entries(&entries, mtime).map_err(|detail| EnrollmentError::Corrupt {
            path: path.to_path_buf(),
            detail,
        })
    }

    /// Rebuild a set from row-major vectors plus per-row meta, as received
    /// over the wire. Rejects ragged rows and row/meta count mismatches.
    pub fn from_rows(
        rows: Vec<Vec<f64>>,
        meta: Vec<DescriptorMeta>,
        source_mtime: SystemTime,
    ) -> Result<Self, String> {
        if rows.len() != meta.len() {
            return Err(format!(
                "row/meta count mismatch: {} vs {}",
                rows.len(),
                meta.len()
            ));
        }
        let dim = rows.first().map_or(crate::DESCRIPTOR_DIM, Vec::len);
        if dim == 0 {
            return Err("zero-dimensional descriptors".to_string());
        }
        let mut flat = Vec::with_capacity(rows.len() * dim);
        for row in &rows {
            if row.len() != dim {
                return Err(format!(
                    "descriptor dimension mismatch: {} vs {}",
                    dim,
                    row.len()
                ));
            }
            flat.extend_from_slice(row);
        }
        let vectors = Array2::from_shape_vec((meta.len(), dim), flat)
            .map_err(|e| format!("shape error: {e}"))?;
        Ok(Self {
            vectors,
            meta,
            source_mtime,
        })
    }

    /// Flatten parsed entries into the matrix form.
    pub fn from_entries(
        entries: &[EnrollmentEntry],
        source_mtime: SystemTime,
    ) -> Result<Self, String> {
        let mut dim: Option<usize> = None;
        let mut rows: Vec<f64> = Vec::new();
        let mut meta = Vec::new();

        for entry in entries {
            for row in &entry.data {
                match dim {
                    None => dim = Some(row.len()),
                    Some(d) if d != row.len() => {
                        return Err(format!(
                            "descriptor dimension mismatch: {} vs {}",
                            d,
                            row.len()
                        ));
                    }
                    Some(_) => {}
                }
                rows.extend_from_slice(row);
                meta.push(DescriptorMeta {
                    label: entry.label.clone(),
                    time: entry.time,
                });
            }
        }

        let dim = dim.unwrap_or(crate::DESCRIPTOR_DIM);
        if dim == 0 {
            return Err("zero-dimensional descriptors".to_string());
        }
        let nrows = meta.len();
        let vectors = Array2::from_shape_vec((nrows, dim), rows)
            .map_err(|e| format!("shape error: {e}"))?;

        Ok(Self {
            vectors,
            meta,
            source_mtime,
        })
    }
}

/// Well-known location of a user's enrollment file.
pub fn user_file_path(user_dir: &Path, username: &str) -> PathBuf {
    user_dir.join(format!("{username}.json"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn entry(label: &str, rows: usize, dim: usize, fill: f64) -> EnrollmentEntry {
        EnrollmentEntry {
            label: label.to_string(),
            time: 1_700_000_000,
            data: vec![vec![fill; dim]; rows],
        }
    }

    #[test]
    fn rows_equal_meta_equal_entry_sum() {
        let entries = vec![entry("normal", 2, 8, 0.1), entry("glasses", 3, 8, 0.2)];
        let set = EnrollmentSet::from_entries(&entries, SystemTime::UNIX_EPOCH).unwrap();
        assert_eq!(set.len(), 5);
        assert_eq!(set.meta.len(), 5);
        assert_eq!(set.dim(), 8);
        assert_eq!(set.meta[0].label, "normal");
        assert_eq!(set.meta[2].label, "glasses");
    }

    #[test]
    fn ragged_rows_are_corrupt() {
        let entries = vec![
            entry("a", 1, 8, 0.1),
            EnrollmentEntry {
                label: "b".to_string(),
                time: 0,
                data: vec![vec![0.0; 4]],
            },
        ];
        assert!(EnrollmentSet::from_entries(&entries, SystemTime::UNIX_EPOCH).is_err());
    }

    #[test]
    fn empty_file_yields_empty_set() {
        let set = EnrollmentSet::from_entries(&[], SystemTime::UNIX_EPOCH).unwrap();
        assert!(set.is_empty());
    }

    #[test]
    fn from_rows_validates_counts_and_shape() {
        let meta = vec![
            DescriptorMeta {
                label: "a".to_string(),
                time: 0,
            },
            DescriptorMeta {
                label: "b".to_string(),
                time: 1,
            },
        ];
        let set = EnrollmentSet::from_rows(
            vec![vec![1.0, 2.0], vec![3.0, 4.0]],
            meta.clone(),
            SystemTime::UNIX_EPOCH,
        )
        .unwrap();
        assert_eq!(set.len(), 2);
        assert_eq!(set.vectors[[1, 0]], 3.0);

        // Row/meta count mismatch.
        assert!(EnrollmentSet::from_rows(
            vec![vec![1.0, 2.0]],
            meta.clone(),
            SystemTime::UNIX_EPOCH
        )
        .is_err());
        // Ragged rows.
        assert!(EnrollmentSet::from_rows(
            vec![vec![1.0, 2.0], vec![3.0]],
            meta,
            SystemTime::UNIX_EPOCH
        )
        .is_err());
    }

    #[test]
    fn load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = EnrollmentSet::load(&dir.path().join("nobody.json")).unwrap_err();
        assert!(matches!(err, EnrollmentError::Missing { .. }));
    }

    #[test]
    fn load_round_trip_and_mtime() {
        let dir = tempfile::tempdir().unwrap();
        let path = user_file_path(dir.path(), "alice");
        let entries = vec![entry("default", 2, 4, 0.5)];
        let mut f = fs::File::create(&path).unwrap();
        f.write_all(serde_json::to_string(&entries).unwrap().as_bytes())
            .unwrap();
        drop(f);

        let set = EnrollmentSet::load(&path).unwrap();
        assert_eq!(set.len(), 2);
        assert_eq!(set.vectors[[0, 0]], 0.5);
        let disk_mtime = fs::metadata(&path).unwrap().modified().unwrap();
        assert_eq!(set.source_mtime, disk_mtime);
    }

    #[test]
    fn load_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = user_file_path(dir.path(), "mallory");
        fs::write(&path, b"not json at all").unwrap();
        let err = EnrollmentSet::load(&path).unwrap_err();
        assert!(matches!(err, EnrollmentError::Corrupt { .. }));
    }
}
