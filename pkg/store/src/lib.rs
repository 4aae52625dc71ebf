mod batch_store;
mod digest;
mod evidence;
mod ledger;

use std::{io, path::PathBuf};

use thiserror::Error;

pub use batch_store::{
    BATCH_FILE_PREFIX, BATCH_FILE_SUFFIX, BatchWriter, is_valid_batch_id, storage_file_name,
};
pub use digest::{ContentDigest, DigestParseError, digest_bytes, digest_reader};
pub use evidence::{
    ArtifactMetadata, EvidenceError, EvidenceRepository, EvidenceStats, mime_type_for,
};
pub use ledger::{ClaimLedger, ClaimMarker, ClaimOutcome, FileClaimLedger, LedgerError, MemoryClaimLedger};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("invalid batch id '{0}'")]
    InvalidBatchId(String),
    #[error("batch '{0}' is already stored")]
    AlreadyStored(String),
    #[error("storage I/O failed at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Persists directory entry changes (creates, renames) on platforms that
/// support syncing a directory handle.
pub(crate) fn sync_dir(dir: &std::path::Path) -> io::Result<()> {
    #[cfg(unix)]
    {
        std::fs::File::open(dir)?.sync_all()?;
    }
    #[cfg(not(unix))]
    {
        let _ = dir;
    }
    Ok(())
}
