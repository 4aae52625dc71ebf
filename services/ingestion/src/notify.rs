//! Post-commit `batch.created` notifications.
//!
//! Delivery is at-most-once: a publish failure is reported to the caller but
//! never retried, and never undoes the commit that produced the event.

use std::{
    fs::OpenOptions,
    io::{self, Write},
    path::{Path, PathBuf},
    sync::Mutex,
};

use chrono::{DateTime, Utc};
use crossbeam_channel::{Receiver, Sender};
use schema::Batch;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const BATCH_CREATED_EVENT_TYPE: &str = "batch.created";
pub const DEFAULT_EVENTS_CHANNEL: &str = "arealis:events";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchCreatedEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    pub batch_id: String,
    pub storage_path: String,
    pub timestamp: DateTime<Utc>,
}

impl BatchCreatedEvent {
    pub fn for_batch(batch: &Batch) -> Self {
        Self {
            event_type: BATCH_CREATED_EVENT_TYPE.to_string(),
            batch_id: batch.batch_id.clone(),
            storage_path: batch.storage_path.clone(),
            timestamp: batch.admitted_at,
        }
    }
}

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("event spool write failed at {path:?}: {source}")]
    Spool {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("event encoding failed: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("publisher state poisoned")]
    Poisoned,
}

pub trait BatchPublisher: Send + Sync {
    fn publish(&self, event: &BatchCreatedEvent) -> Result<(), PublishError>;
}

/// In-process fan-out. Publishing with no subscribers is not an error.
#[derive(Debug, Default)]
pub struct ChannelPublisher {
    subscribers: Mutex<Vec<Sender<BatchCreatedEvent>>>,
}

impl ChannelPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> Receiver<BatchCreatedEvent> {
        let (tx, rx) = crossbeam_channel::unbounded();
        if let Ok(mut subscribers) = self.subscribers.lock() {
            subscribers.push(tx);
        }
        rx
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .map(|subscribers| subscribers.len())
            .unwrap_or(0)
    }
}

impl BatchPublisher for ChannelPublisher {
    fn publish(&self, event: &BatchCreatedEvent) -> Result<(), PublishError> {
        let mut subscribers = self.subscribers.lock().map_err(|_| PublishError::Poisoned)?;
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
        Ok(())
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SpoolRecord {
    pub channel: String,
    pub event: BatchCreatedEvent,
}

/// Appends one JSON line per event to a file shared with downstream
/// consumers. Each line is written with a single `write_all` on an
/// append-mode handle so concurrent writers do not interleave records.
#[derive(Debug)]
pub struct SpoolPublisher {
    path: PathBuf,
    channel: String,
    write_lock: Mutex<()>,
}

impl SpoolPublisher {
    pub fn new(path: impl Into<PathBuf>, channel: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            channel: channel.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    fn append_line(&self, line: &[u8]) -> io::Result<()> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(line)?;
        file.flush()
    }
}

impl BatchPublisher for SpoolPublisher {
    fn publish(&self, event: &BatchCreatedEvent) -> Result<(), PublishError> {
        let record = SpoolRecord {
            channel: self.channel.clone(),
            event: event.clone(),
        };
        let mut line = serde_json::to_vec(&record)?;
        line.push(b'\n');
        let _guard = self.write_lock.lock().map_err(|_| PublishError::Poisoned)?;
        self.append_line(&line).map_err(|source| PublishError::Spool {
            path: self.path.clone(),
            source,
        })
    }
}
