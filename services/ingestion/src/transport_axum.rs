use std::{collections::HashMap, sync::Arc};

use axum::{
    Router,
    body::{Body, to_bytes},
    extract::State,
    http::{Request, Response, StatusCode, header::CONTENT_TYPE},
    response::IntoResponse,
    routing::any,
};

use crate::transport::{HttpRequest, HttpResponse, IngestionRuntime, SharedRuntime, handle_request};

#[derive(Clone)]
struct AppState {
    runtime: SharedRuntime,
}

pub fn serve_http_with_axum(
    ingestion_runtime: IngestionRuntime,
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
        let max_body_bytes = ingestion_runtime.max_body_bytes();
        let state = AppState {
            runtime: Arc::new(ingestion_runtime),
        };

        let app = Router::new()
            .fallback(any(dispatch))
            .with_state(state)
            .layer(axum::extract::DefaultBodyLimit::max(max_body_bytes));

        tracing::info!(bind_addr = %bind_addr, worker_threads, "ingestion axum transport listening");
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

    let max_body_bytes = state.runtime.max_body_bytes();
    let body = match to_bytes(request.into_body(), max_body_bytes).await {
        Ok(bytes) => bytes.to_vec(),
        Err(_) => return response_from_transport(HttpResponse::payload_too_large(max_body_bytes)),
    };

    let request = HttpRequest {
        method,
        target,
        headers,
        body,
    };

    // Commits hash, fsync and rename; keep them off the async workers.
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
        response
            .content_type
            .parse()
            .unwrap_or(axum::http::HeaderValue::from_static("application/json")),
    );
    out
}
