//! Batch commit coordinator.
//!
//! Drives one upload through `RECEIVED -> HASHED -> CLAIMED -> VALIDATED ->
//! STORED -> NOTIFIED`. The dedup ledger's atomic claim is the only point of
//! cross-worker synchronization; everything else here takes `&self` and runs
//! in parallel across workers and processes.

use std::{fmt, path::Path, sync::Arc};

use chrono::{DateTime, Utc};
use schema::{Batch, ErrorClass, ValidationReport, parse_csv, validate_batch};
use serde::Serialize;
use store::{
    ArtifactMetadata, BatchWriter, ClaimLedger, ClaimOutcome, ContentDigest, EvidenceError,
    EvidenceRepository, LedgerError, StoreError, digest_bytes, is_valid_batch_id,
    storage_file_name,
};
use thiserror::Error;
use uuid::Uuid;

use crate::{
    notify::{BatchCreatedEvent, BatchPublisher},
    observability,
};

pub const DEFAULT_MAX_UPLOAD_BYTES: usize = 10 * 1024 * 1024;

pub const TABULAR_CONTENT_TYPES: [&str; 4] = [
    "text/csv",
    "application/csv",
    "application/vnd.ms-excel",
    "text/comma-separated-values",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IngestState {
    Received,
    Hashed,
    Claimed,
    Validated,
    Stored,
    Notified,
    Duplicate,
    Invalid,
    Error,
}

impl IngestState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Notified | Self::Duplicate | Self::Invalid | Self::Error
        )
    }

    pub fn can_advance_to(self, next: IngestState) -> bool {
        use IngestState::*;
        matches!(
            (self, next),
            (Received, Hashed)
                | (Hashed, Claimed)
                | (Claimed, Validated)
                | (Validated, Stored)
                | (Stored, Notified)
                | (Received, Invalid)
                | (Hashed, Duplicate)
                | (Claimed, Invalid)
                | (Received | Hashed | Claimed | Validated, Error)
        )
    }
}

impl fmt::Display for IngestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Received => "RECEIVED",
            Self::Hashed => "HASHED",
            Self::Claimed => "CLAIMED",
            Self::Validated => "VALIDATED",
            Self::Stored => "STORED",
            Self::Notified => "NOTIFIED",
            Self::Duplicate => "DUPLICATE",
            Self::Invalid => "INVALID",
            Self::Error => "ERROR",
        };
        f.write_str(name)
    }
}

/// States visited by one commit attempt, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitTrace {
    states: Vec<IngestState>,
}

impl CommitTrace {
    fn new() -> Self {
        Self {
            states: vec![IngestState::Received],
        }
    }

    fn advance(&mut self, next: IngestState) {
        let current = self.current();
        debug_assert!(
            current.can_advance_to(next),
            "illegal ingest transition {current} -> {next}"
        );
        tracing::debug!(from = %current, to = %next, "ingest transition");
        self.states.push(next);
    }

    pub fn current(&self) -> IngestState {
        self.states
            .last()
            .copied()
            .unwrap_or(IngestState::Received)
    }

    pub fn states(&self) -> &[IngestState] {
        &self.states
    }
}

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("upload of {size} bytes exceeds limit of {limit} bytes")]
    TooLarge { size: usize, limit: usize },
    #[error("upload is not tabular CSV content (content type '{content_type}')")]
    NotTabular { content_type: String },
    #[error("{0}")]
    Invalid(ValidationReport),
    #[error("content already admitted with digest {digest}")]
    Duplicate { digest: ContentDigest },
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error(transparent)]
    Storage(#[from] StoreError),
    #[error(transparent)]
    Evidence(#[from] EvidenceError),
    #[error("invalid batch id '{0}'")]
    InvalidBatchId(String),
}

impl IngestError {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::TooLarge { .. } | Self::NotTabular { .. } => ErrorClass::UploadRejected,
            Self::Invalid(_) => ErrorClass::Validation,
            Self::Duplicate { .. } => ErrorClass::Duplicate,
            Self::Ledger(_) | Self::Storage(_) => ErrorClass::Infrastructure,
            Self::Evidence(err) => err.class(),
            Self::InvalidBatchId(_) => ErrorClass::InvalidPath,
        }
    }

    fn terminal_state(&self) -> IngestState {
        match self.class() {
            ErrorClass::Duplicate => IngestState::Duplicate,
            ErrorClass::Validation | ErrorClass::UploadRejected => IngestState::Invalid,
            _ => IngestState::Error,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Upload {
    pub filename: Option<String>,
    pub content_type: Option<String>,
    pub bytes: Vec<u8>,
}

impl Upload {
    pub fn csv(filename: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            filename: Some(filename.into()),
            content_type: Some("text/csv".to_string()),
            bytes: bytes.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadPolicy {
    pub max_bytes: usize,
}

impl Default for UploadPolicy {
    fn default() -> Self {
        Self {
            max_bytes: DEFAULT_MAX_UPLOAD_BYTES,
        }
    }
}

impl UploadPolicy {
    pub fn check(&self, upload: &Upload) -> Result<(), IngestError> {
        if upload.bytes.len() > self.max_bytes {
            return Err(IngestError::TooLarge {
                size: upload.bytes.len(),
                limit: self.max_bytes,
            });
        }
        let has_csv_name = upload
            .filename
            .as_deref()
            .is_some_and(|name| name.to_ascii_lowercase().ends_with(".csv"));
        let media_type = upload
            .content_type
            .as_deref()
            .and_then(|raw| raw.split(';').next())
            .map(|raw| raw.trim().to_ascii_lowercase())
            .unwrap_or_default();
        if has_csv_name || TABULAR_CONTENT_TYPES.contains(&media_type.as_str()) {
            return Ok(());
        }
        Err(IngestError::NotTabular {
            content_type: media_type,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitReceipt {
    pub batch_id: String,
    pub digest: ContentDigest,
    pub record_count: usize,
    pub storage_path: String,
    pub admitted_at: DateTime<Utc>,
    /// False when the batch is stored but the `batch.created` publish failed.
    pub notified: bool,
}

impl CommitReceipt {
    pub fn batch(&self) -> Batch {
        Batch {
            batch_id: self.batch_id.clone(),
            content_hash: self.digest.to_string(),
            record_count: self.record_count,
            storage_path: self.storage_path.clone(),
            admitted_at: self.admitted_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchStatus {
    pub batch_id: String,
    pub exists: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<ArtifactMetadata>,
}

pub struct BatchCommitCoordinator {
    ledger: Arc<dyn ClaimLedger>,
    writer: BatchWriter,
    evidence: EvidenceRepository,
    publisher: Arc<dyn BatchPublisher>,
    policy: UploadPolicy,
}

impl BatchCommitCoordinator {
    /// Opens the storage root; batches are written and looked up under its
    /// canonical path so reported storage paths are absolute.
    pub fn open(
        storage_root: impl AsRef<Path>,
        ledger: Arc<dyn ClaimLedger>,
        publisher: Arc<dyn BatchPublisher>,
        policy: UploadPolicy,
    ) -> Result<Self, IngestError> {
        let evidence = EvidenceRepository::open(storage_root)?;
        let writer = BatchWriter::open(evidence.root())?;
        Ok(Self {
            ledger,
            writer,
            evidence,
            publisher,
            policy,
        })
    }

    pub fn storage_root(&self) -> &Path {
        self.writer.root()
    }

    pub fn policy(&self) -> UploadPolicy {
        self.policy
    }

    pub fn commit(&self, upload: Upload) -> Result<CommitReceipt, IngestError> {
        self.commit_traced(upload).1
    }

    /// Like [`commit`](Self::commit), also returning the states visited.
    pub fn commit_traced(
        &self,
        upload: Upload,
    ) -> (CommitTrace, Result<CommitReceipt, IngestError>) {
        let span = tracing::info_span!(
            "commit_batch",
            filename = upload.filename.as_deref().unwrap_or(""),
            bytes = upload.bytes.len(),
            digest = tracing::field::Empty,
            batch_id = tracing::field::Empty,
        );
        let _entered = span.enter();

        let mut trace = CommitTrace::new();
        let result = self.run(&upload, &mut trace, &span);
        let counters = observability::installed();
        match &result {
            Ok(receipt) => {
                tracing::info!(
                    record_count = receipt.record_count,
                    notified = receipt.notified,
                    "batch committed"
                );
                if let Some(counters) = counters {
                    counters.observe_admitted(receipt.notified);
                }
            }
            Err(err) => {
                trace.advance(err.terminal_state());
                let class = err.class();
                if class.retryable() {
                    tracing::error!(class = %class, error = %err, "batch commit failed");
                } else {
                    tracing::info!(class = %class, error = %err, "batch rejected");
                }
                if let Some(counters) = counters {
                    counters.observe_failure(class);
                }
            }
        }
        (trace, result)
    }

    fn run(
        &self,
        upload: &Upload,
        trace: &mut CommitTrace,
        span: &tracing::Span,
    ) -> Result<CommitReceipt, IngestError> {
        self.policy.check(upload)?;

        let digest = digest_bytes(&upload.bytes);
        span.record("digest", digest.as_str());
        trace.advance(IngestState::Hashed);

        if self.ledger.claim(&digest)? == ClaimOutcome::Lost {
            return Err(IngestError::Duplicate { digest });
        }
        trace.advance(IngestState::Claimed);

        // The claim stays taken on every failure below.
        let parsed = parse_csv(&upload.bytes)
            .map_err(|err| IngestError::Invalid(ValidationReport::malformed(&err)))?;
        let report = validate_batch(&parsed);
        if !report.valid {
            return Err(IngestError::Invalid(report));
        }
        trace.advance(IngestState::Validated);

        let batch_id = Uuid::new_v4().to_string();
        span.record("batch_id", batch_id.as_str());
        let path = self.writer.write(&batch_id, &upload.bytes).inspect_err(|err| {
            tracing::warn!(%digest, error = %err, "storage failed after claim; digest stays claimed");
        })?;
        trace.advance(IngestState::Stored);

        let mut receipt = CommitReceipt {
            batch_id,
            digest,
            record_count: parsed.records.len(),
            storage_path: path.display().to_string(),
            admitted_at: Utc::now(),
            notified: false,
        };
        let event = BatchCreatedEvent::for_batch(&receipt.batch());
        match self.publisher.publish(&event) {
            Ok(()) => {
                receipt.notified = true;
                trace.advance(IngestState::Notified);
            }
            Err(err) => {
                tracing::warn!(error = %err, "batch.created publish failed; batch remains committed");
            }
        }
        Ok(receipt)
    }

    pub fn batch_status(&self, batch_id: &str) -> Result<BatchStatus, IngestError> {
        if !is_valid_batch_id(batch_id) {
            return Err(IngestError::InvalidBatchId(batch_id.to_string()));
        }
        let metadata = match self.evidence.metadata(&storage_file_name(batch_id)) {
            Ok(metadata) => Some(metadata),
            Err(EvidenceError::NotFound(_)) => None,
            Err(err) => return Err(err.into()),
        };
        Ok(BatchStatus {
            batch_id: batch_id.to_string(),
            exists: metadata.is_some(),
            metadata,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Barrier;

    use store::{FileClaimLedger, MemoryClaimLedger};
    use tempfile::TempDir;

    use super::*;
    use crate::notify::{ChannelPublisher, PublishError};

    const VALID_CSV: &str = "transactionId,amount,fromAccount,toAccount,paymentMethod,timestamp\n\
        T1,100.50,ACC1,ACC2,NEFT,2024-01-01T10:00:00Z\n\
        T2,2500,ACC3,ACC4,upi,2024-01-01T11:00:00Z\n";

    struct Harness {
        _dir: TempDir,
        ledger: Arc<MemoryClaimLedger>,
        publisher: Arc<ChannelPublisher>,
        coordinator: BatchCommitCoordinator,
    }

    fn harness() -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let ledger = Arc::new(MemoryClaimLedger::new());
        let publisher = Arc::new(ChannelPublisher::new());
        let coordinator = BatchCommitCoordinator::open(
            dir.path().join("evidence"),
            ledger.clone(),
            publisher.clone(),
            UploadPolicy::default(),
        )
        .unwrap();
        Harness {
            _dir: dir,
            ledger,
            publisher,
            coordinator,
        }
    }

    struct FailingPublisher;

    impl BatchPublisher for FailingPublisher {
        fn publish(&self, _event: &BatchCreatedEvent) -> Result<(), PublishError> {
            Err(PublishError::Poisoned)
        }
    }

    #[test]
    fn valid_batch_walks_the_full_state_machine() {
        let h = harness();
        let rx = h.publisher.subscribe();

        let (trace, result) = h
            .coordinator
            .commit_traced(Upload::csv("payments.csv", VALID_CSV));
        let receipt = result.unwrap();

        assert_eq!(
            trace.states(),
            &[
                IngestState::Received,
                IngestState::Hashed,
                IngestState::Claimed,
                IngestState::Validated,
                IngestState::Stored,
                IngestState::Notified,
            ]
        );
        assert_eq!(receipt.record_count, 2);
        assert!(receipt.notified);
        assert_eq!(receipt.digest, digest_bytes(VALID_CSV.as_bytes()));
        assert!(receipt
            .storage_path
            .ends_with(&format!("batch_{}.csv", receipt.batch_id)));
        assert_eq!(
            std::fs::read(&receipt.storage_path).unwrap(),
            VALID_CSV.as_bytes()
        );

        let event = rx.try_recv().unwrap();
        assert_eq!(event.event_type, "batch.created");
        assert_eq!(event.batch_id, receipt.batch_id);
        assert_eq!(event.storage_path, receipt.storage_path);
    }

    #[test]
    fn duplicate_upload_is_rejected_without_side_effects() {
        let h = harness();
        let first = h
            .coordinator
            .commit(Upload::csv("payments.csv", VALID_CSV))
            .unwrap();
        let rx = h.publisher.subscribe();

        let (trace, result) = h
            .coordinator
            .commit_traced(Upload::csv("renamed.csv", VALID_CSV));
        let err = result.unwrap_err();

        assert_eq!(err.class(), ErrorClass::Duplicate);
        assert!(matches!(&err, IngestError::Duplicate { digest } if *digest == first.digest));
        assert_eq!(trace.current(), IngestState::Duplicate);
        assert!(rx.try_recv().is_err());
        let stored = std::fs::read_dir(h.coordinator.storage_root())
            .unwrap()
            .count();
        assert_eq!(stored, 1);
    }

    #[test]
    fn invalid_payment_method_reports_row_and_burns_claim() {
        let h = harness();
        let csv = "transactionId,amount,fromAccount,toAccount,paymentMethod,timestamp\n\
            T1,10,A,B,RTGS,2024-01-01\n\
            T2,20,A,B,CASH,2024-01-01\n";

        let (trace, result) = h.coordinator.commit_traced(Upload::csv("bad.csv", csv));
        let err = result.unwrap_err();
        let IngestError::Invalid(report) = &err else {
            panic!("expected validation error, got {err:?}");
        };
        assert_eq!(report.row, Some(2));
        assert_eq!(report.field.as_deref(), Some("paymentMethod"));
        assert_eq!(trace.current(), IngestState::Invalid);
        assert!(h.ledger.is_claimed(&digest_bytes(csv.as_bytes())).unwrap());

        let again = h.coordinator.commit(Upload::csv("bad.csv", csv)).unwrap_err();
        assert_eq!(again.class(), ErrorClass::Duplicate);
        assert_eq!(
            std::fs::read_dir(h.coordinator.storage_root()).unwrap().count(),
            0
        );
    }

    #[test]
    fn empty_file_is_a_validation_error() {
        let h = harness();
        let err = h.coordinator.commit(Upload::csv("empty.csv", "")).unwrap_err();
        assert_eq!(err.class(), ErrorClass::Validation);
        assert!(err.to_string().contains("file is empty"));
    }

    #[test]
    fn upload_precheck_rejects_before_hashing() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = Arc::new(MemoryClaimLedger::new());
        let coordinator = BatchCommitCoordinator::open(
            dir.path(),
            ledger.clone(),
            Arc::new(ChannelPublisher::new()),
            UploadPolicy { max_bytes: 16 },
        )
        .unwrap();

        let (trace, result) = coordinator.commit_traced(Upload::csv("big.csv", VALID_CSV));
        assert!(matches!(result, Err(IngestError::TooLarge { limit: 16, .. })));
        assert_eq!(trace.states(), &[IngestState::Received, IngestState::Invalid]);

        let json = Upload {
            filename: Some("data.json".into()),
            content_type: Some("application/json".into()),
            bytes: b"{}".to_vec(),
        };
        let err = coordinator.commit(json).unwrap_err();
        assert_eq!(err.class(), ErrorClass::UploadRejected);
        assert!(ledger.is_empty());
    }

    #[test]
    fn policy_accepts_csv_name_or_tabular_content_type() {
        let policy = UploadPolicy::default();
        let by_name = Upload {
            filename: Some("REPORT.CSV".into()),
            content_type: Some("application/octet-stream".into()),
            bytes: vec![],
        };
        let by_type = Upload {
            filename: None,
            content_type: Some("text/csv; charset=utf-8".into()),
            bytes: vec![],
        };
        assert!(policy.check(&by_name).is_ok());
        assert!(policy.check(&by_type).is_ok());
        assert!(policy.check(&Upload::default()).is_err());
    }

    #[test]
    fn publish_failure_keeps_the_committed_batch() {
        let dir = tempfile::tempdir().unwrap();
        let coordinator = BatchCommitCoordinator::open(
            dir.path(),
            Arc::new(MemoryClaimLedger::new()),
            Arc::new(FailingPublisher),
            UploadPolicy::default(),
        )
        .unwrap();

        let (trace, result) = coordinator.commit_traced(Upload::csv("p.csv", VALID_CSV));
        let receipt = result.unwrap();
        assert!(!receipt.notified);
        assert_eq!(trace.current(), IngestState::Stored);
        assert!(Path::new(&receipt.storage_path).is_file());
        assert!(coordinator.batch_status(&receipt.batch_id).unwrap().exists);
    }

    #[test]
    fn batch_is_readable_before_its_notification_arrives() {
        let h = harness();
        let rx = h.publisher.subscribe();
        h.coordinator
            .commit(Upload::csv("p.csv", VALID_CSV))
            .unwrap();

        let event = rx.try_recv().unwrap();
        assert_eq!(std::fs::read(&event.storage_path).unwrap(), VALID_CSV.as_bytes());
    }

    #[test]
    fn unreachable_ledger_fails_closed_with_no_batch() {
        let dir = tempfile::tempdir().unwrap();
        let ledger_dir = dir.path().join("ledger");
        let ledger = Arc::new(FileClaimLedger::open(&ledger_dir).unwrap());
        let coordinator = BatchCommitCoordinator::open(
            dir.path().join("evidence"),
            ledger,
            Arc::new(ChannelPublisher::new()),
            UploadPolicy::default(),
        )
        .unwrap();
        std::fs::remove_dir_all(&ledger_dir).unwrap();

        let (trace, result) = coordinator.commit_traced(Upload::csv("p.csv", VALID_CSV));
        let err = result.unwrap_err();
        assert_eq!(err.class(), ErrorClass::Infrastructure);
        assert_eq!(trace.current(), IngestState::Error);
        assert_eq!(
            std::fs::read_dir(coordinator.storage_root()).unwrap().count(),
            0
        );
    }

    #[test]
    fn concurrent_identical_uploads_admit_exactly_once() {
        let dir = tempfile::tempdir().unwrap();
        let ledger_dir = dir.path().join("ledger");
        let storage = dir.path().join("evidence");
        let workers = 8;
        let barrier = Barrier::new(workers);

        let results: Vec<Result<CommitReceipt, IngestError>> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..workers)
                .map(|_| {
                    // Separate ledger handles model separate worker processes.
                    let coordinator = BatchCommitCoordinator::open(
                        &storage,
                        Arc::new(FileClaimLedger::open(&ledger_dir).unwrap()),
                        Arc::new(ChannelPublisher::new()),
                        UploadPolicy::default(),
                    )
                    .unwrap();
                    let barrier = &barrier;
                    scope.spawn(move || {
                        barrier.wait();
                        coordinator.commit(Upload::csv("p.csv", VALID_CSV))
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        let admitted = results.iter().filter(|r| r.is_ok()).count();
        let duplicates = results
            .iter()
            .filter(|r| matches!(r, Err(IngestError::Duplicate { .. })))
            .count();
        assert_eq!(admitted, 1);
        assert_eq!(duplicates, workers - 1);
        assert_eq!(std::fs::read_dir(&storage).unwrap().count(), 1);
    }

    #[test]
    fn different_content_admits_independently() {
        let h = harness();
        let other = VALID_CSV.replace("T2", "T3");
        let a = h.coordinator.commit(Upload::csv("a.csv", VALID_CSV)).unwrap();
        let b = h.coordinator.commit(Upload::csv("b.csv", other)).unwrap();
        assert_ne!(a.batch_id, b.batch_id);
        assert_ne!(a.digest, b.digest);
        assert_eq!(h.ledger.len(), 2);
    }

    #[test]
    fn batch_status_reports_presence_and_rejects_bad_ids() {
        let h = harness();
        let receipt = h
            .coordinator
            .commit(Upload::csv("p.csv", VALID_CSV))
            .unwrap();

        let status = h.coordinator.batch_status(&receipt.batch_id).unwrap();
        assert!(status.exists);
        let metadata = status.metadata.unwrap();
        assert_eq!(metadata.digest, receipt.digest);
        assert_eq!(metadata.size, VALID_CSV.len() as u64);

        let missing = h.coordinator.batch_status("no-such-batch").unwrap();
        assert!(!missing.exists);
        assert!(missing.metadata.is_none());

        let err = h.coordinator.batch_status("../etc").unwrap_err();
        assert_eq!(err.class(), ErrorClass::InvalidPath);
    }

    #[test]
    fn transition_table_rejects_skips_and_backtracking() {
        assert!(IngestState::Received.can_advance_to(IngestState::Hashed));
        assert!(!IngestState::Received.can_advance_to(IngestState::Stored));
        assert!(!IngestState::Stored.can_advance_to(IngestState::Claimed));
        assert!(!IngestState::Stored.can_advance_to(IngestState::Error));
        assert!(!IngestState::Notified.can_advance_to(IngestState::Error));
        assert!(IngestState::Duplicate.is_terminal());
        assert!(!IngestState::Stored.is_terminal());
    }
}
