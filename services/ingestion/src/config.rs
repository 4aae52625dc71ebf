use std::path::PathBuf;

use crate::{coordinator::DEFAULT_MAX_UPLOAD_BYTES, notify::DEFAULT_EVENTS_CHANNEL};

pub const DEFAULT_BIND_ADDR: &str = "127.0.0.1:8081";
pub const DEFAULT_STORAGE_ROOT: &str = "./data/evidence";
pub const DEFAULT_LEDGER_DIR: &str = "./data/ledger";
pub const DEFAULT_EVENTS_PATH: &str = "./data/events/batch-events.jsonl";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportRuntime {
    Std,
    Axum,
}

impl TransportRuntime {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Std => "std",
            Self::Axum => "axum",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestConfig {
    pub bind_addr: String,
    pub storage_root: PathBuf,
    pub ledger_dir: PathBuf,
    pub events_path: PathBuf,
    pub events_channel: String,
    pub max_upload_bytes: usize,
    pub http_workers: usize,
    pub http_queue_capacity: Option<usize>,
    pub transport_runtime: TransportRuntime,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            bind_addr: DEFAULT_BIND_ADDR.to_string(),
            storage_root: PathBuf::from(DEFAULT_STORAGE_ROOT),
            ledger_dir: PathBuf::from(DEFAULT_LEDGER_DIR),
            events_path: PathBuf::from(DEFAULT_EVENTS_PATH),
            events_channel: DEFAULT_EVENTS_CHANNEL.to_string(),
            max_upload_bytes: DEFAULT_MAX_UPLOAD_BYTES,
            http_workers: default_http_workers(),
            http_queue_capacity: None,
            transport_runtime: TransportRuntime::Std,
        }
    }
}

impl IngestConfig {
    /// Reads `BATCHVAULT_INGEST_*` keys, falling back to the shared
    /// `BATCHVAULT_*` key where one exists. Unparseable values are logged and
    /// replaced with the default.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            bind_addr: env_with_fallback("BATCHVAULT_INGEST_BIND", "BATCHVAULT_BIND")
                .unwrap_or(defaults.bind_addr),
            storage_root: env_with_fallback(
                "BATCHVAULT_INGEST_STORAGE_ROOT",
                "BATCHVAULT_STORAGE_ROOT",
            )
            .map(PathBuf::from)
            .unwrap_or(defaults.storage_root),
            ledger_dir: env_with_fallback("BATCHVAULT_INGEST_LEDGER_DIR", "BATCHVAULT_LEDGER_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.ledger_dir),
            events_path: env_with_fallback(
                "BATCHVAULT_INGEST_EVENTS_PATH",
                "BATCHVAULT_EVENTS_PATH",
            )
            .map(PathBuf::from)
            .unwrap_or(defaults.events_path),
            events_channel: env_with_fallback(
                "BATCHVAULT_INGEST_EVENTS_CHANNEL",
                "BATCHVAULT_EVENTS_CHANNEL",
            )
            .filter(|value| !value.trim().is_empty())
            .unwrap_or(defaults.events_channel),
            max_upload_bytes: parse_positive("BATCHVAULT_INGEST_MAX_UPLOAD_BYTES")
                .unwrap_or(defaults.max_upload_bytes),
            http_workers: parse_positive("BATCHVAULT_INGEST_HTTP_WORKERS")
                .unwrap_or(defaults.http_workers),
            http_queue_capacity: parse_positive("BATCHVAULT_INGEST_HTTP_QUEUE_CAPACITY"),
            transport_runtime: parse_transport_runtime(
                std::env::var("BATCHVAULT_INGEST_TRANSPORT_RUNTIME").ok(),
            ),
        }
    }
}

pub fn default_http_workers() -> usize {
    std::thread::available_parallelism()
        .map(|parallelism| parallelism.get().clamp(1, 32))
        .unwrap_or(4)
}

fn env_with_fallback(primary: &str, fallback: &str) -> Option<String> {
    std::env::var(primary)
        .ok()
        .or_else(|| std::env::var(fallback).ok())
}

fn parse_positive(key: &str) -> Option<usize> {
    let raw = std::env::var(key).ok()?;
    match raw.trim().parse::<usize>() {
        Ok(value) if value > 0 => Some(value),
        _ => {
            tracing::warn!(key, value = %raw, "ignoring invalid value, expected positive integer");
            None
        }
    }
}

fn parse_transport_runtime(raw: Option<String>) -> TransportRuntime {
    match raw.as_deref().map(str::trim) {
        None | Some("") | Some("std") => TransportRuntime::Std,
        Some("axum") => TransportRuntime::Axum,
        Some(other) => {
            tracing::warn!(value = other, "unknown transport runtime, using std");
            TransportRuntime::Std
        }
    }
}
