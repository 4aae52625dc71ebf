use std::path::PathBuf;

pub const DEFAULT_BIND_ADDR: &str = "127.0.0.1:8082";
pub const DEFAULT_STORAGE_ROOT: &str = "./data/evidence";

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
pub struct EvidenceConfig {
    pub bind_addr: String,
    pub storage_root: PathBuf,
    pub http_workers: usize,
    pub http_queue_capacity: Option<usize>,
    pub transport_runtime: TransportRuntime,
}

impl Default for EvidenceConfig {
    fn default() -> Self {
        Self {
            bind_addr: DEFAULT_BIND_ADDR.to_string(),
            storage_root: PathBuf::from(DEFAULT_STORAGE_ROOT),
            http_workers: default_http_workers(),
            http_queue_capacity: None,
            transport_runtime: TransportRuntime::Std,
        }
    }
}

impl EvidenceConfig {
    /// `BATCHVAULT_EVIDENCE_*` keys; the storage root falls back to the
    /// `BATCHVAULT_STORAGE_ROOT` shared with the ingestion service.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            bind_addr: std::env::var("BATCHVAULT_EVIDENCE_BIND").unwrap_or(defaults.bind_addr),
            storage_root: env_with_fallback(
                "BATCHVAULT_EVIDENCE_STORAGE_ROOT",
                "BATCHVAULT_STORAGE_ROOT",
            )
            .map(PathBuf::from)
            .unwrap_or(defaults.storage_root),
            http_workers: parse_positive("BATCHVAULT_EVIDENCE_HTTP_WORKERS")
                .unwrap_or(defaults.http_workers),
            http_queue_capacity: parse_positive("BATCHVAULT_EVIDENCE_HTTP_QUEUE_CAPACITY"),
            transport_runtime: match std::env::var("BATCHVAULT_EVIDENCE_TRANSPORT_RUNTIME")
                .ok()
                .as_deref()
                .map(str::trim)
            {
                Some("axum") => TransportRuntime::Axum,
                None | Some("") | Some("std") => TransportRuntime::Std,
                Some(other) => {
                    tracing::warn!(value = other, "unknown transport runtime, using std");
                    TransportRuntime::Std
                }
            },
        }
    }
}

fn default_http_workers() -> usize {
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_serve_the_shared_storage_root() {
        let config = EvidenceConfig::default();
        assert_eq!(config.bind_addr, DEFAULT_BIND_ADDR);
        assert_eq!(config.storage_root, PathBuf::from("./data/evidence"));
        assert_eq!(config.transport_runtime.as_str(), "std");
        assert!(config.http_queue_capacity.is_none());
    }
}
