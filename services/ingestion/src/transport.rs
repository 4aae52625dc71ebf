use std::{
    net::{TcpListener, TcpStream},
    sync::{
        Arc, OnceLock,
        atomic::{AtomicU64, AtomicUsize, Ordering},
    },
    time::{Duration, Instant},
};

use schema::ErrorClass;
use serde_json::{Value, json};

use crate::{
    coordinator::{BatchCommitCoordinator, IngestError},
    observability,
};

mod http;
mod request;
mod server_runtime;
mod upload;


pub(crate) use http::{HttpRequest, HttpResponse};
use http::{RequestError, render_response_text, write_backpressure_response, write_response};
use request::{parse_http_request_bytes, read_http_request, split_target, url_decode};

const SOCKET_TIMEOUT_SECS: u64 = 30;
const DEFAULT_HTTP_WORKERS: usize = 4;
const DEFAULT_HTTP_QUEUE_CAPACITY_PER_WORKER: usize = 64;
/// Room for multipart framing on top of the upload size limit.
const MULTIPART_OVERHEAD_BYTES: usize = 64 * 1024;
const BATCHES_PATH: &str = "/v1/batches";

pub type SharedRuntime = Arc<IngestionRuntime>;

#[derive(Debug)]
pub(crate) struct TransportBackpressureMetrics {
    queue_depth: AtomicUsize,
    queue_capacity: usize,
    queue_full_reject_total: AtomicU64,
}

impl TransportBackpressureMetrics {
    pub(crate) fn new(queue_capacity: usize) -> Self {
        Self {
            queue_depth: AtomicUsize::new(0),
            queue_capacity,
            queue_full_reject_total: AtomicU64::new(0),
        }
    }

    pub(crate) fn observe_enqueued(&self) {
        self.queue_depth.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn observe_dequeued(&self) {
        let _ = self
            .queue_depth
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |value| {
                Some(value.saturating_sub(1))
            });
    }

    pub(crate) fn observe_rejected(&self) {
        self.queue_full_reject_total.fetch_add(1, Ordering::Relaxed);
    }

    fn to_json(&self) -> Value {
        json!({
            "queueDepth": self.queue_depth.load(Ordering::Relaxed),
            "queueCapacity": self.queue_capacity,
            "queueFullRejectTotal": self.queue_full_reject_total.load(Ordering::Relaxed),
        })
    }
}

/// Everything a request handler needs. Shared across workers without a lock;
/// concurrent commits coordinate through the dedup ledger alone.
pub struct IngestionRuntime {
    coordinator: BatchCommitCoordinator,
    backpressure: OnceLock<Arc<TransportBackpressureMetrics>>,
    started_at: Instant,
}

impl IngestionRuntime {
    pub fn new(coordinator: BatchCommitCoordinator) -> Self {
        Self {
            coordinator,
            backpressure: OnceLock::new(),
            started_at: Instant::now(),
        }
    }

    pub fn coordinator(&self) -> &BatchCommitCoordinator {
        &self.coordinator
    }

    pub(crate) fn max_body_bytes(&self) -> usize {
        self.coordinator
            .policy()
            .max_bytes
            .saturating_add(MULTIPART_OVERHEAD_BYTES)
    }

    fn set_transport_backpressure_metrics(&self, metrics: Arc<TransportBackpressureMetrics>) {
        let _ = self.backpressure.set(metrics);
    }

    fn health_json(&self) -> Value {
        json!({
            "status": "ok",
            "uptimeSeconds": self.started_at.elapsed().as_secs(),
            "storageRoot": self.coordinator.storage_root().display().to_string(),
            "maxUploadBytes": self.coordinator.policy().max_bytes,
            "counters": observability::installed().map(|counters| counters.snapshot()),
            "transport": self.backpressure.get().map(|metrics| metrics.to_json()),
        })
    }
}

pub fn serve_http(runtime: IngestionRuntime, bind_addr: &str) -> std::io::Result<()> {
    serve_http_with_workers(runtime, bind_addr, DEFAULT_HTTP_WORKERS, None)
}

pub fn serve_http_with_workers(
    runtime: IngestionRuntime,
    bind_addr: &str,
    worker_count: usize,
    queue_capacity: Option<usize>,
) -> std::io::Result<()> {
    server_runtime::serve_http_with_workers(runtime, bind_addr, worker_count, queue_capacity)
}

/// Runs one raw HTTP/1.1 request through the router and returns the rendered
/// response. Framing errors are returned as `Err`; an oversized body is
/// answered with 413 like on a live socket.
pub fn handle_http_request_bytes(
    runtime: &IngestionRuntime,
    raw_request: &[u8],
) -> Result<Vec<u8>, String> {
    let response = match parse_http_request_bytes(raw_request, runtime.max_body_bytes()) {
        Ok(request) => handle_request(runtime, &request),
        Err(err @ RequestError::TooLarge { .. }) => err.into_response(),
        Err(RequestError::Malformed(message)) => return Err(message),
    };
    Ok(render_response_text(&response).into_bytes())
}

pub(crate) fn handle_request(runtime: &IngestionRuntime, request: &HttpRequest) -> HttpResponse {
    let (path, query) = split_target(&request.target);
    match (request.method.as_str(), path.as_str()) {
        ("GET", "/health") => HttpResponse::ok_json(&runtime.health_json()),
        ("POST", BATCHES_PATH) => {
            let upload = match upload::extract_upload(request, &query) {
                Ok(upload) => upload,
                Err(message) => return HttpResponse::bad_request(&message),
            };
            match runtime.coordinator.commit(upload) {
                Ok(receipt) => match serde_json::to_value(&receipt) {
                    Ok(body) => HttpResponse::json(201, &body),
                    Err(err) => HttpResponse::service_unavailable(&err.to_string()),
                },
                Err(err) => ingest_error_response(&err),
            }
        }
        (_, "/health") => HttpResponse::method_not_allowed("only GET is supported"),
        (_, BATCHES_PATH) => HttpResponse::method_not_allowed("only POST is supported"),
        (method, path) if path.starts_with("/v1/batches/") => {
            if method != "GET" {
                return HttpResponse::method_not_allowed("only GET is supported");
            }
            let raw_id = &path["/v1/batches/".len()..];
            let batch_id = match url_decode(raw_id, false) {
                Ok(batch_id) => batch_id,
                Err(message) => return HttpResponse::bad_request(&message),
            };
            match runtime.coordinator.batch_status(&batch_id) {
                Ok(status) if status.exists => match serde_json::to_value(&status) {
                    Ok(body) => HttpResponse::ok_json(&body),
                    Err(err) => HttpResponse::service_unavailable(&err.to_string()),
                },
                Ok(status) => HttpResponse::json(
                    404,
                    &json!({
                        "error": ErrorClass::NotFound.as_str(),
                        "message": format!("batch '{}' not found", status.batch_id),
                        "batchId": status.batch_id,
                        "exists": false,
                    }),
                ),
                Err(err) => ingest_error_response(&err),
            }
        }
        _ => HttpResponse::not_found("route not found"),
    }
}

fn ingest_error_response(err: &IngestError) -> HttpResponse {
    let class = err.class();
    let mut body = json!({
        "error": class.as_str(),
        "message": err.to_string(),
    });
    let status = match err {
        IngestError::TooLarge { limit, .. } => {
            body["limitBytes"] = json!(limit);
            413
        }
        IngestError::NotTabular { .. } => 415,
        IngestError::Invalid(report) => {
            body["row"] = json!(report.row);
            body["field"] = json!(report.field);
            body["reason"] = json!(report.reason);
            422
        }
        IngestError::Duplicate { digest } => {
            body["digest"] = json!(digest.as_str());
            409
        }
        _ => match class {
            ErrorClass::NotFound => 404,
            ErrorClass::InvalidPath => 400,
            _ => 503,
        },
    };
    HttpResponse::json(status, &body)
}
