//! Batch ingest service: upload pre-checks, content-addressed dedup, schema
//! validation, durable placement and `batch.created` notification.

pub mod config;
pub mod coordinator;
pub mod notify;
pub mod observability;
pub mod transport;
#[cfg(feature = "async-transport")]
pub mod transport_axum;

pub use coordinator::{
    BatchCommitCoordinator, BatchStatus, CommitReceipt, CommitTrace, IngestError, IngestState,
    Upload, UploadPolicy,
};
pub use notify::{
    BatchCreatedEvent, BatchPublisher, ChannelPublisher, PublishError, SpoolPublisher,
};
