use std::{collections::HashMap, io::Write, net::TcpStream, time::Duration};

use serde_json::{Value, json};
use thiserror::Error;

const BACKPRESSURE_QUEUE_FULL_MESSAGE: &str = "service unavailable: ingestion worker queue full";

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct HttpRequest {
    pub(crate) method: String,
    pub(crate) target: String,
    pub(crate) headers: HashMap<String, String>,
    pub(crate) body: Vec<u8>,
}

impl HttpRequest {
    pub(crate) fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct HttpResponse {
    pub(crate) status: u16,
    pub(crate) content_type: &'static str,
    pub(crate) body: String,
}

impl HttpResponse {
    pub(crate) fn json(status: u16, body: &Value) -> Self {
        Self {
            status,
            content_type: "application/json",
            body: body.to_string(),
        }
    }

    pub(crate) fn ok_json(body: &Value) -> Self {
        Self::json(200, body)
    }

    /// Protocol-level failure outside the ingest error taxonomy.
    pub(crate) fn bad_request(message: &str) -> Self {
        Self::json(400, &json!({"error": "BadRequest", "message": message}))
    }

    pub(crate) fn not_found(message: &str) -> Self {
        Self::json(404, &json!({"error": "NotFoundError", "message": message}))
    }

    pub(crate) fn method_not_allowed(message: &str) -> Self {
        Self::json(405, &json!({"error": "MethodNotAllowed", "message": message}))
    }

    pub(crate) fn payload_too_large(limit: usize) -> Self {
        Self::json(
            413,
            &json!({
                "error": "UploadRejected",
                "message": format!("request body exceeds {limit} bytes"),
                "limitBytes": limit,
            }),
        )
    }

    pub(crate) fn service_unavailable(message: &str) -> Self {
        Self::json(
            503,
            &json!({"error": "InfrastructureError", "message": message}),
        )
    }
}

#[derive(Debug, Error)]
pub(crate) enum RequestError {
    #[error("request body exceeds max size ({limit} bytes)")]
    TooLarge { limit: usize },
    #[error("{0}")]
    Malformed(String),
}

impl RequestError {
    pub(crate) fn into_response(self) -> HttpResponse {
        match self {
            Self::TooLarge { limit } => HttpResponse::payload_too_large(limit),
            Self::Malformed(message) => HttpResponse::bad_request(&message),
        }
    }
}

pub(crate) fn backpressure_rejection_response() -> HttpResponse {
    HttpResponse::service_unavailable(BACKPRESSURE_QUEUE_FULL_MESSAGE)
}

pub(crate) fn write_backpressure_response(
    mut stream: TcpStream,
    socket_timeout_secs: u64,
) -> std::io::Result<()> {
    stream.set_write_timeout(Some(Duration::from_secs(socket_timeout_secs)))?;
    write_response(&mut stream, backpressure_rejection_response())
}

pub(crate) fn write_response(
    stream: &mut TcpStream,
    response: HttpResponse,
) -> std::io::Result<()> {
    stream.write_all(render_response_text(&response).as_bytes())?;
    stream.flush()
}

pub(crate) fn render_response_text(response: &HttpResponse) -> String {
    let status_text = match response.status {
        200 => "200 OK",
        201 => "201 Created",
        400 => "400 Bad Request",
        404 => "404 Not Found",
        405 => "405 Method Not Allowed",
        409 => "409 Conflict",
        413 => "413 Payload Too Large",
        415 => "415 Unsupported Media Type",
        422 => "422 Unprocessable Entity",
        503 => "503 Service Unavailable",
        _ => "500 Internal Server Error",
    };
    let body_len = response.body.len();
    format!(
        "HTTP/1.1 {status_text}\r\nContent-Type: {}\r\nContent-Length: {body_len}\r\nConnection: close\r\n\r\n{}",
        response.content_type, response.body
    )
}
