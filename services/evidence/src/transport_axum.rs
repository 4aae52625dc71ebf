use std::{collections::HashMap, sync::Arc};

use axum::{
    Router,
    body::{Body, to_bytes},
    extract::State,
    http::{HeaderName, HeaderValue, Request, Response, StatusCode, header::CONTENT_TYPE},
    response::IntoResponse,
    routing::any,
};

use crate::transport::{
    EvidenceRuntime, HttpRequest, HttpResponse, MAX_HTTP_BODY_BYTES, SharedRuntime, handle_request,
};

#[derive(Clone)]
struct AppState {
    runtime: SharedRuntime,
}

pub fn serve_http_with_axum(
    evidence_runtime: EvidenceRuntime,
    bind_addr: &str,
    worker_threads: usize,
) -> Result<(), String> {
    let worker_threads = worker_threads.max(1);
    let tokio_runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(worker_threads)
        .enable_all()
        .build()
        .map_err(|e| format!("failed to build tokio runtime: {e}"))?;

    let bind_addr = bind_addr.to_string();
    tokio_runtime.block_on(async move {
        let listener = tokio::net::TcpListener::bind(&bind_addr)
            .await
            .map_err(|e| format!("failed to bind {bind_addr}: {e}"))?;
        let state = AppState {
            runtime: Arc::new(evidence_runtime),
        };
        let app = Router::new()
            .fallback(any(dispatch))
            .with_state(state)
            .layer(axum::extract::DefaultBodyLimit::max(MAX_HTTP_BODY_BYTES));

        tracing::info!(bind_addr = %bind_addr, worker_threads, "evidence axum transport listening");
        axum::serve(listener, app)
            .await
            .map_err(|e| format!("axum server failed: {e}"))
    })
}

async fn dispatch(State(state): State<AppState>, request: Request<Body>) -> impl IntoResponse {
    let method = request.method().to_string();
    let target = request
        .uri()
        .path_and_query()
        .map(|value| value.as_str().to_string())
        .unwrap_or_else(|| request.uri().path().to_string());

    let mut headers = HashMap::new();
    for (name, value) in request.headers() {
        if let Ok(value) = value.to_str() {
            headers.insert(name.as_str().to_ascii_lowercase(), value.to_string());
        }
    }

    let body = match to_bytes(request.into_body(), MAX_HTTP_BODY_BYTES).await {
        Ok(bytes) => bytes.to_vec(),
        Err(_) => {
            return response_from_transport(HttpResponse::error(
                413,
                "BadRequest",
                "request body exceeds max size",
            ));
        }
    };
    let request = HttpRequest {
        method,
        target,
        headers,
        body,
    };

    // Downloads and digests read whole files from disk.
    let runtime = Arc::clone(&state.runtime);
    let response = match tokio::task::spawn_blocking(move || handle_request(&runtime, &request)).await
    {
        Ok(response) => response,
        Err(err) => HttpResponse::service_unavailable(&format!("request handler failed: {err}")),
    };
    response_from_transport(response)
}

fn response_from_transport(response: HttpResponse) -> Response<Body> {
    let status = StatusCode::from_u16(response.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut out = Response::new(Body::from(response.body));
    *out.status_mut() = status;
    out.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static(response.content_type),
    );
    for (name, value) in response.headers {
        match (HeaderName::from_bytes(name.as_bytes()), HeaderValue::from_str(&value)) {
            (Ok(name), Ok(value)) => {
                out.headers_mut().insert(name, value);
            }
            _ => tracing::warn!(header = name, "dropping invalid response header"),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use axum::http::header::CONTENT_DISPOSITION;
    use store::EvidenceRepository;

    use super::*;

    fn sample_state(dir: &tempfile::TempDir) -> AppState {
        std::fs::write(dir.path().join("batch_a1.csv"), b"transactionId\nT1\n").unwrap();
        let repository = EvidenceRepository::open(dir.path()).unwrap();
        AppState {
            runtime: Arc::new(EvidenceRuntime::new(repository)),
        }
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder()
            .method("GET")
            .uri(uri)
            .body(Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn dispatch_health_returns_ok_json() {
        let dir = tempfile::tempdir().unwrap();
        let response = dispatch(State(sample_state(&dir)), get("/health"))
            .await
            .into_response();

        assert_eq!(response.status(), StatusCode::OK);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn dispatch_download_carries_disposition_header() {
        let dir = tempfile::tempdir().unwrap();
        let response = dispatch(State(sample_state(&dir)), get("/v1/evidence/batch_a1.csv"))
            .await
            .into_response();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[CONTENT_TYPE], "text/csv");
        assert_eq!(
            response.headers()[CONTENT_DISPOSITION],
            "inline; filename=\"batch_a1.csv\""
        );
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&bytes[..], b"transactionId\nT1\n");
    }
}
