use std::{
    collections::HashMap,
    net::{TcpListener, TcpStream},
    sync::{
        Arc, OnceLock,
        atomic::{AtomicU64, AtomicUsize, Ordering},
    },
    time::{Duration, Instant},
};

use schema::ErrorClass;
use serde::Serialize;
use serde_json::{Value, json};
use store::{ArtifactMetadata, ContentDigest, EvidenceError, EvidenceRepository};

mod http;


pub(crate) use http::{HttpRequest, HttpResponse};
use http::{
    RequestError, parse_http_request_bytes, read_http_request, render_response_bytes,
    write_backpressure_response, write_response,
};

pub(crate) const MAX_HTTP_BODY_BYTES: usize = 64 * 1024;
const SOCKET_TIMEOUT_SECS: u64 = 10;
const DEFAULT_HTTP_WORKERS: usize = 4;
const DEFAULT_HTTP_QUEUE_CAPACITY_PER_WORKER: usize = 64;
const EVIDENCE_PREFIX: &str = "/v1/evidence";
const METADATA_SUFFIX: &str = "/metadata";
const VERIFY_SUFFIX: &str = "/verify";

pub type SharedRuntime = Arc<EvidenceRuntime>;

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

    fn observe_enqueued(&self) {
        self.queue_depth.fetch_add(1, Ordering::Relaxed);
    }

    fn observe_dequeued(&self) {
        let _ = self
            .queue_depth
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |value| {
                Some(value.saturating_sub(1))
            });
    }

    fn observe_rejected(&self) {
        self.queue_full_reject_total.fetch_add(1, Ordering::Relaxed);
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Listing {
    count: usize,
    files: Vec<ArtifactMetadata>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Verification<'a> {
    filename: &'a str,
    expected: &'a ContentDigest,
    matches: bool,
}

/// Read-only view over the storage root. Handlers take `&self`; the
/// repository needs no locking since stored files never change.
pub struct EvidenceRuntime {
    repository: EvidenceRepository,
    backpressure: OnceLock<Arc<TransportBackpressureMetrics>>,
    started_at: Instant,
}

impl EvidenceRuntime {
    pub fn new(repository: EvidenceRepository) -> Self {
        Self {
            repository,
            backpressure: OnceLock::new(),
            started_at: Instant::now(),
        }
    }

    pub fn repository(&self) -> &EvidenceRepository {
        &self.repository
    }

    fn health_json(&self) -> Value {
        let transport = self.backpressure.get().map(|metrics| {
            json!({
                "queueDepth": metrics.queue_depth.load(Ordering::Relaxed),
                "queueCapacity": metrics.queue_capacity,
                "queueFullRejectTotal": metrics.queue_full_reject_total.load(Ordering::Relaxed),
            })
        });
        json!({
            "status": "ok",
            "uptimeSeconds": self.started_at.elapsed().as_secs(),
            "storageRoot": self.repository.root().display().to_string(),
            "transport": transport,
        })
    }
}

pub fn serve_http(runtime: EvidenceRuntime, bind_addr: &str) -> std::io::Result<()> {
    serve_http_with_workers(runtime, bind_addr, DEFAULT_HTTP_WORKERS, None)
}

pub fn serve_http_with_workers(
    runtime: EvidenceRuntime,
    bind_addr: &str,
    worker_count: usize,
    queue_capacity: Option<usize>,
) -> std::io::Result<()> {
    let listener = TcpListener::bind(bind_addr)?;
    let worker_count = worker_count.max(1);
    let queue_capacity = queue_capacity.filter(|value| *value > 0).unwrap_or_else(|| {
        worker_count
            .saturating_mul(DEFAULT_HTTP_QUEUE_CAPACITY_PER_WORKER)
            .max(worker_count)
    });
    let backpressure_metrics = Arc::new(TransportBackpressureMetrics::new(queue_capacity));
    let _ = runtime.backpressure.set(Arc::clone(&backpressure_metrics));
    let runtime: SharedRuntime = Arc::new(runtime);
    let (tx, rx) = crossbeam_channel::bounded::<TcpStream>(queue_capacity);

    tracing::info!(bind_addr, worker_count, queue_capacity, "evidence transport listening");

    std::thread::scope(|scope| {
        for _ in 0..worker_count {
            let runtime = Arc::clone(&runtime);
            let rx = rx.clone();
            let backpressure_metrics = Arc::clone(&backpressure_metrics);
            scope.spawn(move || {
                for stream in rx.iter() {
                    backpressure_metrics.observe_dequeued();
                    if let Err(err) = handle_connection(&runtime, stream) {
                        tracing::warn!(error = %err, "evidence transport error");
                    }
                }
            });
        }

        for stream in listener.incoming() {
            match stream {
                Ok(stream) => {
                    backpressure_metrics.observe_enqueued();
                    match tx.try_send(stream) {
                        Ok(()) => {}
                        Err(crossbeam_channel::TrySendError::Full(stream)) => {
                            backpressure_metrics.observe_dequeued();
                            backpressure_metrics.observe_rejected();
                            if let Err(err) =
                                write_backpressure_response(stream, SOCKET_TIMEOUT_SECS)
                            {
                                tracing::warn!(error = %err, "backpressure response failed");
                            }
                        }
                        Err(crossbeam_channel::TrySendError::Disconnected(_)) => {
                            backpressure_metrics.observe_dequeued();
                            tracing::error!("evidence transport worker queue closed");
                            break;
                        }
                    }
                }
                Err(err) => tracing::warn!(error = %err, "evidence transport accept error"),
            }
        }
        drop(tx);
    });

    Ok(())
}

pub fn handle_http_request_bytes(
    runtime: &EvidenceRuntime,
    raw_request: &[u8],
) -> Result<Vec<u8>, String> {
    let response = match parse_http_request_bytes(raw_request) {
        Ok(request) => handle_request(runtime, &request),
        Err(err @ RequestError::TooLarge) => err.into_response(),
        Err(RequestError::Malformed(message)) => return Err(message),
    };
    Ok(render_response_bytes(&response))
}

fn handle_connection(runtime: &EvidenceRuntime, mut stream: TcpStream) -> std::io::Result<()> {
    stream.set_read_timeout(Some(Duration::from_secs(SOCKET_TIMEOUT_SECS)))?;
    stream.set_write_timeout(Some(Duration::from_secs(SOCKET_TIMEOUT_SECS)))?;

    let request = match read_http_request(&mut stream) {
        Ok(Some(request)) => request,
        Ok(None) => return Ok(()),
        Err(err) => return write_response(&mut stream, err.into_response()),
    };
    let response = handle_request(runtime, &request);
    write_response(&mut stream, response)
}

pub(crate) fn handle_request(runtime: &EvidenceRuntime, request: &HttpRequest) -> HttpResponse {
    let (path, query) = split_target(&request.target);
    if request.method != "GET" {
        return if path == "/health" || path.starts_with(EVIDENCE_PREFIX) {
            HttpResponse::method_not_allowed("only GET is supported")
        } else {
            HttpResponse::not_found("route not found")
        };
    }
    let repository = &runtime.repository;

    match path.as_str() {
        "/health" => HttpResponse::ok_json(&runtime.health_json()),
        EVIDENCE_PREFIX => json_or_error(repository.list().map(|files| Listing {
            count: files.len(),
            files,
        })),
        "/v1/evidence/stats" => json_or_error(repository.stats()),
        "/v1/evidence/search" => {
            let pattern = query.get("pattern").map(String::as_str).unwrap_or("");
            json_or_error(repository.search(pattern).map(|files| Listing {
                count: files.len(),
                files,
            }))
        }
        other => match other.strip_prefix("/v1/evidence/") {
            Some(rest) => named_artifact(repository, rest, &query),
            None => HttpResponse::not_found("route not found"),
        },
    }
}

fn named_artifact(
    repository: &EvidenceRepository,
    rest: &str,
    query: &HashMap<String, String>,
) -> HttpResponse {
    let (raw_name, action) = if let Some(name) = rest.strip_suffix(METADATA_SUFFIX) {
        (name, Action::Metadata)
    } else if let Some(name) = rest.strip_suffix(VERIFY_SUFFIX) {
        (name, Action::Verify)
    } else {
        (rest, Action::Download)
    };
    let name = match url_decode(raw_name, false) {
        Ok(name) => name,
        Err(message) => return HttpResponse::bad_request(&message),
    };

    match action {
        Action::Metadata => json_or_error(repository.metadata(&name)),
        Action::Download => match repository.get(&name) {
            Ok(bytes) => HttpResponse::ok_bytes(store::mime_type_for(&name), bytes).with_header(
                "Content-Disposition",
                format!("inline; filename=\"{}\"", disposition_filename(&name)),
            ),
            Err(err) => evidence_error_response(&err),
        },
        Action::Verify => {
            let Some(raw_digest) = query.get("digest") else {
                return HttpResponse::bad_request("query parameter 'digest' is required");
            };
            let expected = match ContentDigest::parse(raw_digest) {
                Ok(digest) => digest,
                Err(err) => return HttpResponse::bad_request(&err.to_string()),
            };
            json_or_error(
                repository
                    .verify(&name, &expected)
                    .map(|matches| Verification {
                        filename: &name,
                        expected: &expected,
                        matches,
                    }),
            )
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Action {
    Download,
    Metadata,
    Verify,
}

/// Header-safe rendering of a stored name: quotes and control bytes dropped.
fn disposition_filename(name: &str) -> String {
    name.chars()
        .filter(|ch| *ch != '"' && !ch.is_control())
        .collect()
}

fn json_or_error<T: Serialize>(result: Result<T, EvidenceError>) -> HttpResponse {
    match result {
        Ok(value) => match serde_json::to_value(&value) {
            Ok(body) => HttpResponse::ok_json(&body),
            Err(err) => HttpResponse::service_unavailable(&err.to_string()),
        },
        Err(err) => evidence_error_response(&err),
    }
}

fn evidence_error_response(err: &EvidenceError) -> HttpResponse {
    let class = err.class();
    let status = match class {
        ErrorClass::NotFound => 404,
        ErrorClass::InvalidPath => 400,
        _ => {
            tracing::error!(error = %err, "evidence read failed");
            503
        }
    };
    HttpResponse::error(status, class.as_str(), &err.to_string())
}

fn split_target(target: &str) -> (String, HashMap<String, String>) {
    let (path, query_str) = target
        .split_once('?')
        .map(|(path, query)| (path, Some(query)))
        .unwrap_or((target, None));

    let mut query = HashMap::new();
    for pair in query_str.unwrap_or_default().split('&') {
        if pair.is_empty() {
            continue;
        }
        let (raw_key, raw_value) = pair.split_once('=').unwrap_or((pair, ""));
        if let (Ok(key), Ok(value)) = (url_decode(raw_key, true), url_decode(raw_value, true)) {
            query.insert(key, value);
        }
    }
    (path.to_string(), query)
}

fn url_decode(raw: &str, plus_as_space: bool) -> Result<String, String> {
    let bytes = raw.as_bytes();
    let mut out: Vec<u8> = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' if plus_as_space => {
                out.push(b' ');
                i += 1;
            }
            b'%' => {
                if i + 2 >= bytes.len() {
                    return Err("incomplete percent escape".to_string());
                }
                let hi = decode_hex(bytes[i + 1])?;
                let lo = decode_hex(bytes[i + 2])?;
                out.push((hi << 4) | lo);
                i += 3;
            }
            other => {
                out.push(other);
                i += 1;
            }
        }
    }
    String::from_utf8(out).map_err(|_| "invalid UTF-8 in URL component".to_string())
}

fn decode_hex(byte: u8) -> Result<u8, String> {
    match byte {
        b'0'..=b'9' => Ok(byte - b'0'),
        b'a'..=b'f' => Ok(byte - b'a' + 10),
        b'A'..=b'F' => Ok(byte - b'A' + 10),
        _ => Err("invalid hex digit".to_string()),
    }
}
