//! Dedup ledger: permanent, append-only claims keyed by content digest.

use std::{
    collections::HashSet,
    fs::{self, OpenOptions},
    io::{self, Write},
    path::{Path, PathBuf},
    sync::Mutex,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{ContentDigest, sync_dir};

const CLAIM_FILE_SUFFIX: &str = ".claim";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOutcome {
    Won,
    Lost,
}

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("dedup ledger unavailable at {path:?}: {source}")]
    Unavailable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("dedup ledger state poisoned")]
    Poisoned,
}

/// Atomic claim-if-absent store shared by every ingest worker.
///
/// Exactly one concurrent caller for a digest observes `Won`. There is no
/// release: a claimed digest stays claimed for the ledger's lifetime. Any
/// failure to reach the backing store must surface as an error, never as
/// `Won`.
pub trait ClaimLedger: Send + Sync {
    fn claim(&self, digest: &ContentDigest) -> Result<ClaimOutcome, LedgerError>;

    fn is_claimed(&self, digest: &ContentDigest) -> Result<bool, LedgerError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClaimMarker {
    pub digest: ContentDigest,
    pub claimed_at: DateTime<Utc>,
    pub pid: u32,
}

/// Claims are marker files created with `create_new`, so the claim is
/// decided by the filesystem and holds across processes sharing `dir`.
#[derive(Debug, Clone)]
pub struct FileClaimLedger {
    dir: PathBuf,
}

impl FileClaimLedger {
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, LedgerError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).map_err(|source| LedgerError::Unavailable {
            path: dir.clone(),
            source,
        })?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn marker_path(&self, digest: &ContentDigest) -> PathBuf {
        self.dir.join(format!("{digest}{CLAIM_FILE_SUFFIX}"))
    }

    pub fn read_marker(&self, digest: &ContentDigest) -> Result<Option<ClaimMarker>, LedgerError> {
        let path = self.marker_path(digest);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(LedgerError::Unavailable { path, source }),
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|err| LedgerError::Unavailable {
                path,
                source: io::Error::new(io::ErrorKind::InvalidData, err),
            })
    }

    fn write_marker(&self, path: &Path, digest: &ContentDigest) -> io::Result<()> {
        let mut file = OpenOptions::new().write(true).create_new(true).open(path)?;
        let marker = ClaimMarker {
            digest: digest.clone(),
            claimed_at: Utc::now(),
            pid: std::process::id(),
        };
        serde_json::to_writer(&mut file, &marker).map_err(io::Error::other)?;
        file.write_all(b"\n")?;
        file.sync_all()?;
        sync_dir(&self.dir)
    }
}

impl ClaimLedger for FileClaimLedger {
    fn claim(&self, digest: &ContentDigest) -> Result<ClaimOutcome, LedgerError> {
        let path = self.marker_path(digest);
        match self.write_marker(&path, digest) {
            Ok(()) => {
                tracing::debug!(%digest, path = %path.display(), "dedup claim won");
                Ok(ClaimOutcome::Won)
            }
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                tracing::debug!(%digest, "dedup claim lost");
                Ok(ClaimOutcome::Lost)
            }
            Err(source) => Err(LedgerError::Unavailable { path, source }),
        }
    }

    fn is_claimed(&self, digest: &ContentDigest) -> Result<bool, LedgerError> {
        let path = self.marker_path(digest);
        match fs::symlink_metadata(&path) {
            Ok(_) => Ok(true),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                // A vanished ledger directory must not read as "never claimed".
                fs::metadata(&self.dir)
                    .map(|_| false)
                    .map_err(|source| LedgerError::Unavailable {
                        path: self.dir.clone(),
                        source,
                    })
            }
            Err(source) => Err(LedgerError::Unavailable { path, source }),
        }
    }
}

/// Single-process ledger for tests and embedded use.
#[derive(Debug, Default)]
pub struct MemoryClaimLedger {
    claims: Mutex<HashSet<ContentDigest>>,
}

impl MemoryClaimLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.claims.lock().map(|claims| claims.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ClaimLedger for MemoryClaimLedger {
    fn claim(&self, digest: &ContentDigest) -> Result<ClaimOutcome, LedgerError> {
        let mut claims = self.claims.lock().map_err(|_| LedgerError::Poisoned)?;
        if claims.insert(digest.clone()) {
            Ok(ClaimOutcome::Won)
        } else {
            Ok(ClaimOutcome::Lost)
        }
    }

    fn is_claimed(&self, digest: &ContentDigest) -> Result<bool, LedgerError> {
        let claims = self.claims.lock().map_err(|_| LedgerError::Poisoned)?;
        Ok(claims.contains(digest))
    }
}
