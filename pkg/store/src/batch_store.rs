use std::{
    fs::{self, OpenOptions},
    io::{self, Write},
    path::{Path, PathBuf},
};

use crate::{StoreError, sync_dir};

pub const BATCH_FILE_PREFIX: &str = "batch_";
pub const BATCH_FILE_SUFFIX: &str = ".csv";

/// Storage file name for a batch; the only mapping from id to path.
pub fn storage_file_name(batch_id: &str) -> String {
    format!("{BATCH_FILE_PREFIX}{batch_id}{BATCH_FILE_SUFFIX}")
}

pub fn is_valid_batch_id(batch_id: &str) -> bool {
    !batch_id.is_empty()
        && batch_id.len() <= 128
        && batch_id
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || ch == '-' || ch == '_')
}

/// Durable, write-once placement of admitted batches under the storage root.
#[derive(Debug, Clone)]
pub struct BatchWriter {
    root: PathBuf,
}

impl BatchWriter {
    pub fn open(root: impl AsRef<Path>) -> Result<Self, StoreError> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).map_err(|source| StoreError::Io {
            path: root.clone(),
            source,
        })?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, batch_id: &str) -> PathBuf {
        self.root.join(storage_file_name(batch_id))
    }

    /// Writes `bytes` to a hidden temp file, syncs it, then renames it into
    /// place and syncs the directory. The final path is either absent or
    /// complete, never partial.
    pub fn write(&self, batch_id: &str, bytes: &[u8]) -> Result<PathBuf, StoreError> {
        if !is_valid_batch_id(batch_id) {
            return Err(StoreError::InvalidBatchId(batch_id.to_string()));
        }
        let final_path = self.path_for(batch_id);
        if final_path.exists() {
            return Err(StoreError::AlreadyStored(batch_id.to_string()));
        }
        let tmp_path = self.root.join(format!(
            ".{}.tmp-{}",
            storage_file_name(batch_id),
            std::process::id()
        ));

        let written =
            write_synced(&tmp_path, bytes).and_then(|()| fs::rename(&tmp_path, &final_path));
        if let Err(source) = written {
            let _ = fs::remove_file(&tmp_path);
            return Err(StoreError::Io {
                path: final_path,
                source,
            });
        }
        sync_dir(&self.root).map_err(|source| StoreError::Io {
            path: self.root.clone(),
            source,
        })?;

        tracing::debug!(batch_id, path = %final_path.display(), bytes = bytes.len(), "batch stored");
        Ok(final_path)
    }
}

fn write_synced(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let mut file = OpenOptions::new().write(true).create_new(true).open(path)?;
    file.write_all(bytes)?;
    file.sync_all()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_batch_to_deterministic_path() {
        let dir = tempfile::tempdir().unwrap();
        let writer = BatchWriter::open(dir.path()).unwrap();
        let path = writer.write("b-1", b"a,b\n1,2\n").unwrap();

        assert_eq!(path, dir.path().join("batch_b-1.csv"));
        assert_eq!(fs::read(&path).unwrap(), b"a,b\n1,2\n");
        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(Result::ok)
            .filter(|entry| entry.file_name().to_string_lossy().starts_with('.'))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn refuses_to_overwrite_existing_batch() {
        let dir = tempfile::tempdir().unwrap();
        let writer = BatchWriter::open(dir.path()).unwrap();
        writer.write("b-1", b"first").unwrap();

        let err = writer.write("b-1", b"second").unwrap_err();
        assert!(matches!(err, StoreError::AlreadyStored(id) if id == "b-1"));
        assert_eq!(fs::read(writer.path_for("b-1")).unwrap(), b"first");
    }

    #[test]
    fn rejects_ids_that_could_leave_the_root() {
        let dir = tempfile::tempdir().unwrap();
        let writer = BatchWriter::open(dir.path()).unwrap();
        assert!(matches!(
            writer.write("../escape", b"x"),
            Err(StoreError::InvalidBatchId(_))
        ));
        assert!(!is_valid_batch_id(""));
        assert!(is_valid_batch_id("0b6c7c1e-4c1b-4b57-9d0e-4a5c2f1d7e11"));
    }

    #[test]
    fn missing_root_is_reported_as_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("root");
        let writer = BatchWriter::open(&root).unwrap();
        fs::remove_dir_all(&root).unwrap();
        assert!(matches!(
            writer.write("b-2", b"x"),
            Err(StoreError::Io { .. })
        ));
    }
}
