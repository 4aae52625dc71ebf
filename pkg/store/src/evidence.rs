//! Read path over the storage root: lookup, live metadata, search, stats.

use std::{
    fs::{self, File, Metadata},
    io,
    path::{Component, Path, PathBuf},
};

use chrono::{DateTime, Utc};
use schema::ErrorClass;
use serde::Serialize;
use thiserror::Error;

use crate::{ContentDigest, digest_reader};

/// Per-component limit of common filesystems.
const MAX_NAME_COMPONENT_BYTES: usize = 255;
const MAX_NAME_BYTES: usize = 1024;

#[derive(Debug, Error)]
pub enum EvidenceError {
    #[error("evidence '{0}' not found")]
    NotFound(String),
    #[error("invalid evidence path '{name}': {reason}")]
    InvalidPath { name: String, reason: &'static str },
    #[error("evidence I/O failed at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl EvidenceError {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::NotFound(_) => ErrorClass::NotFound,
            Self::InvalidPath { .. } => ErrorClass::InvalidPath,
            Self::Io { .. } => ErrorClass::Infrastructure,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactMetadata {
    pub filename: String,
    pub size: u64,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
    /// Recomputed from the bytes on disk at call time.
    pub digest: ContentDigest,
    pub mime_type: &'static str,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EvidenceStats {
    pub total_files: usize,
    pub total_bytes: u64,
}

#[derive(Debug, Clone)]
pub struct EvidenceRepository {
    root: PathBuf,
}

impl EvidenceRepository {
    /// Creates the root if needed and pins its canonical form; every later
    /// resolution is checked against that canonical ancestor.
    pub fn open(root: impl AsRef<Path>) -> Result<Self, EvidenceError> {
        let root = root.as_ref();
        let io_err = |source| EvidenceError::Io {
            path: root.to_path_buf(),
            source,
        };
        fs::create_dir_all(root).map_err(io_err)?;
        let root = fs::canonicalize(root).map_err(io_err)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Maps `name` to a file strictly inside the root. Escapes are rejected,
    /// not clamped: non-normal components up front, then symlink escapes by
    /// component-wise ancestry of the canonical path.
    pub fn resolve(&self, name: &str) -> Result<PathBuf, EvidenceError> {
        let invalid = |reason| EvidenceError::InvalidPath {
            name: name.to_string(),
            reason,
        };
        if name.is_empty() {
            return Err(invalid("name is empty"));
        }
        if name.contains('\0') {
            return Err(invalid("name contains a NUL byte"));
        }
        if name.len() > MAX_NAME_BYTES
            || name
                .split('/')
                .any(|component| component.len() > MAX_NAME_COMPONENT_BYTES)
        {
            return Err(invalid("name is too long"));
        }
        let relative = Path::new(name);
        if !relative
            .components()
            .all(|component| matches!(component, Component::Normal(_)))
        {
            return Err(invalid("name must be relative without '.' or '..' segments"));
        }
        if relative
            .file_name()
            .and_then(|value| value.to_str())
            .is_none_or(is_hidden)
        {
            return Err(EvidenceError::NotFound(name.to_string()));
        }

        let joined = self.root.join(relative);
        let canonical = match fs::canonicalize(&joined) {
            Ok(path) => path,
            // `a.csv/` and `a.csv/x` walk through a regular file.
            Err(err)
                if matches!(
                    err.kind(),
                    io::ErrorKind::NotFound | io::ErrorKind::NotADirectory
                ) =>
            {
                return Err(EvidenceError::NotFound(name.to_string()));
            }
            Err(source) => {
                return Err(EvidenceError::Io {
                    path: joined,
                    source,
                });
            }
        };
        if !canonical.starts_with(&self.root) {
            tracing::warn!(name, resolved = %canonical.display(), "evidence resolution escaped storage root");
            return Err(invalid("resolves outside the storage root"));
        }
        if !canonical.is_file() {
            return Err(EvidenceError::NotFound(name.to_string()));
        }
        Ok(canonical)
    }

    pub fn get(&self, name: &str) -> Result<Vec<u8>, EvidenceError> {
        let path = self.resolve(name)?;
        fs::read(&path).map_err(|source| not_found_or_io(name, path, source))
    }

    pub fn metadata(&self, name: &str) -> Result<ArtifactMetadata, EvidenceError> {
        let path = self.resolve(name)?;
        artifact_metadata(name, &path)
    }

    /// Filesystem listing order; no sort is applied.
    pub fn list(&self) -> Result<Vec<ArtifactMetadata>, EvidenceError> {
        self.collect_matching(|_| true)
    }

    /// Case-insensitive substring match on file names; empty pattern matches all.
    pub fn search(&self, pattern: &str) -> Result<Vec<ArtifactMetadata>, EvidenceError> {
        let needle = pattern.to_lowercase();
        self.collect_matching(|name| name.to_lowercase().contains(&needle))
    }

    pub fn stats(&self) -> Result<EvidenceStats, EvidenceError> {
        let mut stats = EvidenceStats::default();
        for (_, _, metadata) in self.visible_files()? {
            stats.total_files += 1;
            stats.total_bytes += metadata.len();
        }
        Ok(stats)
    }

    /// True when the stored bytes still hash to `expected`.
    pub fn verify(&self, name: &str, expected: &ContentDigest) -> Result<bool, EvidenceError> {
        let path = self.resolve(name)?;
        let actual = file_digest(name, &path)?;
        if &actual != expected {
            tracing::warn!(name, %expected, %actual, "evidence digest mismatch");
        }
        Ok(&actual == expected)
    }

    fn collect_matching(
        &self,
        keep: impl Fn(&str) -> bool,
    ) -> Result<Vec<ArtifactMetadata>, EvidenceError> {
        let mut out = Vec::new();
        for (name, path, _) in self.visible_files()? {
            if !keep(&name) {
                continue;
            }
            match artifact_metadata(&name, &path) {
                Ok(metadata) => out.push(metadata),
                // Removed out-of-band between listing and hashing.
                Err(EvidenceError::NotFound(_)) => {}
                Err(err) => return Err(err),
            }
        }
        Ok(out)
    }

    fn visible_files(&self) -> Result<Vec<(String, PathBuf, Metadata)>, EvidenceError> {
        let io_err = |source| EvidenceError::Io {
            path: self.root.clone(),
            source,
        };
        let mut files = Vec::new();
        for entry in fs::read_dir(&self.root).map_err(io_err)? {
            let entry = entry.map_err(io_err)?;
            let Ok(name) = entry.file_name().into_string() else {
                continue;
            };
            if is_hidden(&name) {
                continue;
            }
            let is_symlink = entry
                .file_type()
                .map_err(io_err)?
                .is_symlink();
            // Links are listed only when they pass the same checks as lookups.
            let path = if is_symlink {
                match self.resolve(&name) {
                    Ok(target) => target,
                    Err(EvidenceError::NotFound(_) | EvidenceError::InvalidPath { .. }) => continue,
                    Err(err) => return Err(err),
                }
            } else {
                entry.path()
            };
            let metadata = match fs::metadata(&path) {
                Ok(metadata) => metadata,
                Err(err) if err.kind() == io::ErrorKind::NotFound => continue,
                Err(err) => return Err(io_err(err)),
            };
            if !metadata.is_file() {
                continue;
            }
            files.push((name, path, metadata));
        }
        Ok(files)
    }
}

pub fn mime_type_for(name: &str) -> &'static str {
    let extension = Path::new(name)
        .extension()
        .and_then(|value| value.to_str())
        .map(str::to_ascii_lowercase);
    match extension.as_deref() {
        Some("csv") => "text/csv",
        Some("json") => "application/json",
        Some("txt" | "log") => "text/plain",
        Some("pdf") => "application/pdf",
        Some("xml") => "application/xml",
        Some("zip") => "application/zip",
        Some("xlsx") => "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
        Some("xls") => "application/vnd.ms-excel",
        Some("html" | "htm") => "text/html",
        _ => "application/octet-stream",
    }
}

fn is_hidden(name: &str) -> bool {
    name.starts_with('.')
}

fn artifact_metadata(name: &str, path: &Path) -> Result<ArtifactMetadata, EvidenceError> {
    let metadata =
        fs::metadata(path).map_err(|source| not_found_or_io(name, path.to_path_buf(), source))?;
    let modified = metadata
        .modified()
        .map_err(|source| not_found_or_io(name, path.to_path_buf(), source))?;
    let created = metadata.created().unwrap_or(modified);
    Ok(ArtifactMetadata {
        filename: name.to_string(),
        size: metadata.len(),
        created_at: DateTime::<Utc>::from(created),
        modified_at: DateTime::<Utc>::from(modified),
        digest: file_digest(name, path)?,
        mime_type: mime_type_for(name),
    })
}

fn file_digest(name: &str, path: &Path) -> Result<ContentDigest, EvidenceError> {
    let file = File::open(path).map_err(|source| not_found_or_io(name, path.to_path_buf(), source))?;
    digest_reader(file).map_err(|source| EvidenceError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn not_found_or_io(name: &str, path: PathBuf, source: io::Error) -> EvidenceError {
    if source.kind() == io::ErrorKind::NotFound {
        EvidenceError::NotFound(name.to_string())
    } else {
        EvidenceError::Io { path, source }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::digest_bytes;

    fn repo_with(files: &[(&str, &[u8])]) -> (tempfile::TempDir, EvidenceRepository) {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("evidence");
        fs::create_dir_all(&root).unwrap();
        for (name, bytes) in files {
            fs::write(root.join(name), bytes).unwrap();
        }
        let repo = EvidenceRepository::open(&root).unwrap();
        (dir, repo)
    }

    #[test]
    fn get_and_metadata_reflect_stored_bytes() {
        let (_dir, repo) = repo_with(&[("journal_b1.csv", b"a,b\n1,2\n")]);
        assert_eq!(repo.get("journal_b1.csv").unwrap(), b"a,b\n1,2\n");

        let meta = repo.metadata("journal_b1.csv").unwrap();
        assert_eq!(meta.size, 8);
        assert_eq!(meta.mime_type, "text/csv");
        assert_eq!(meta.digest, digest_bytes(b"a,b\n1,2\n"));
    }

    #[test]
    fn metadata_digest_detects_out_of_band_tampering() {
        let (_dir, repo) = repo_with(&[("recon.json", b"{\"ok\":true}")]);
        let before = repo.metadata("recon.json").unwrap().digest;
        fs::write(repo.root().join("recon.json"), b"{\"ok\":false}").unwrap();

        let after = repo.metadata("recon.json").unwrap().digest;
        assert_ne!(before, after);
        assert!(!repo.verify("recon.json", &before).unwrap());
        assert!(repo.verify("recon.json", &after).unwrap());
    }

    #[test]
    fn missing_name_is_not_found() {
        let (_dir, repo) = repo_with(&[]);
        assert!(matches!(
            repo.metadata("nonexistent.csv"),
            Err(EvidenceError::NotFound(name)) if name == "nonexistent.csv"
        ));
    }

    #[test]
    fn traversal_attempts_are_invalid_paths() {
        let (dir, repo) = repo_with(&[("a.csv", b"x")]);
        fs::write(dir.path().join("secret.txt"), b"top secret").unwrap();

        for name in [
            "../secret.txt",
            "./a.csv",
            "/etc/passwd",
            "sub/../../secret.txt",
            "..",
        ] {
            assert!(
                matches!(repo.get(name), Err(EvidenceError::InvalidPath { .. })),
                "{name} should be rejected"
            );
        }
    }

    #[test]
    fn sibling_directory_sharing_prefix_is_not_inside_root() {
        let (dir, repo) = repo_with(&[]);
        let sibling = dir.path().join("evidence-evil");
        fs::create_dir_all(&sibling).unwrap();
        fs::write(sibling.join("loot.csv"), b"stolen").unwrap();

        #[cfg(unix)]
        {
            std::os::unix::fs::symlink(sibling.join("loot.csv"), repo.root().join("loot.csv"))
                .unwrap();
            assert!(matches!(
                repo.get("loot.csv"),
                Err(EvidenceError::InvalidPath { .. })
            ));
        }
        assert!(matches!(
            repo.get("../evidence-evil/loot.csv"),
            Err(EvidenceError::InvalidPath { .. })
        ));
    }

    #[test]
    fn names_walking_through_a_file_are_not_found() {
        let (_dir, repo) = repo_with(&[("a.csv", b"x")]);
        for name in ["a.csv/", "a.csv/x"] {
            let err = repo.metadata(name).unwrap_err();
            assert!(matches!(err, EvidenceError::NotFound(_)), "{name}: {err}");
            assert_eq!(err.class(), ErrorClass::NotFound);
        }
    }

    #[test]
    fn over_long_names_are_invalid_paths() {
        let (_dir, repo) = repo_with(&[]);
        let long = "n".repeat(300);
        let err = repo.metadata(&long).unwrap_err();
        assert!(matches!(err, EvidenceError::InvalidPath { .. }));
        assert_eq!(err.class(), ErrorClass::InvalidPath);
        assert!(matches!(
            repo.get(&"d/".repeat(600)),
            Err(EvidenceError::InvalidPath { .. })
        ));
    }

    #[cfg(unix)]
    #[test]
    fn listing_and_lookup_agree_on_symlinks() {
        let (dir, repo) = repo_with(&[("a.csv", b"abc")]);
        fs::write(dir.path().join("outside.csv"), b"secret").unwrap();
        std::os::unix::fs::symlink(repo.root().join("a.csv"), repo.root().join("alias.csv"))
            .unwrap();
        std::os::unix::fs::symlink(dir.path().join("outside.csv"), repo.root().join("leak.csv"))
            .unwrap();

        assert_eq!(repo.get("alias.csv").unwrap(), b"abc");
        assert!(matches!(
            repo.get("leak.csv"),
            Err(EvidenceError::InvalidPath { .. })
        ));

        let mut names: Vec<String> = repo.list().unwrap().into_iter().map(|m| m.filename).collect();
        names.sort();
        assert_eq!(names, vec!["a.csv", "alias.csv"]);
        assert_eq!(repo.search("alias").unwrap().len(), 1);
        assert_eq!(
            repo.stats().unwrap(),
            EvidenceStats {
                total_files: 2,
                total_bytes: 6
            }
        );
    }

    #[test]
    fn search_is_case_insensitive_subset_of_list() {
        let (_dir, repo) = repo_with(&[
            ("Journal_B1.csv", b"1"),
            ("recon_b1.json", b"2"),
            ("batch_x.csv", b"3"),
        ]);
        let all = repo.list().unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(repo.search("").unwrap().len(), 3);

        let hits = repo.search("JOURNAL").unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].filename, "Journal_B1.csv");
        assert!(hits.iter().all(|hit| all.contains(hit)));

        let mut b1: Vec<String> = repo
            .search("b1")
            .unwrap()
            .into_iter()
            .map(|m| m.filename)
            .collect();
        b1.sort();
        assert_eq!(b1, vec!["Journal_B1.csv", "recon_b1.json"]);
    }

    #[test]
    fn listing_skips_hidden_files_and_directories() {
        let (_dir, repo) = repo_with(&[("a.csv", b"abc"), (".batch_y.csv.tmp-1", b"partial")]);
        fs::create_dir_all(repo.root().join("nested")).unwrap();

        let names: Vec<String> = repo.list().unwrap().into_iter().map(|m| m.filename).collect();
        assert_eq!(names, vec!["a.csv"]);
        assert!(matches!(
            repo.get(".batch_y.csv.tmp-1"),
            Err(EvidenceError::NotFound(_))
        ));
        assert!(matches!(repo.get("nested"), Err(EvidenceError::NotFound(_))));
    }

    #[test]
    fn stats_aggregate_visible_files() {
        let (_dir, repo) = repo_with(&[("a.csv", b"abc"), ("b.pdf", b"12345")]);
        assert_eq!(
            repo.stats().unwrap(),
            EvidenceStats {
                total_files: 2,
                total_bytes: 8
            }
        );
    }

    #[test]
    fn mime_types_follow_extension() {
        assert_eq!(mime_type_for("x.CSV"), "text/csv");
        assert_eq!(mime_type_for("x.pdf"), "application/pdf");
        assert_eq!(mime_type_for("noext"), "application/octet-stream");
    }
}
