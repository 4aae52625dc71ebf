use std::{
    collections::HashMap,
    io::{BufRead, BufReader, Read, Write},
    net::TcpStream,
    time::Duration,
};

use serde_json::{Value, json};
use thiserror::Error;

use super::MAX_HTTP_BODY_BYTES;

const BACKPRESSURE_QUEUE_FULL_MESSAGE: &str = "service unavailable: evidence worker queue full";

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct HttpRequest {
    pub(crate) method: String,
    pub(crate) target: String,
    pub(crate) headers: HashMap<String, String>,
    pub(crate) body: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct HttpResponse {
    pub(crate) status: u16,
    pub(crate) content_type: &'static str,
    pub(crate) headers: Vec<(&'static str, String)>,
    pub(crate) body: Vec<u8>,
}

impl HttpResponse {
    pub(crate) fn json(status: u16, body: &Value) -> Self {
        Self {
            status,
            content_type: "application/json",
            headers: Vec::new(),
            body: body.to_string().into_bytes(),
        }
    }

    pub(crate) fn ok_json(body: &Value) -> Self {
        Self::json(200, body)
    }

    pub(crate) fn ok_bytes(content_type: &'static str, body: Vec<u8>) -> Self {
        Self {
            status: 200,
            content_type,
            headers: Vec::new(),
            body,
        }
    }

    pub(crate) fn with_header(mut self, name: &'static str, value: String) -> Self {
        self.headers.push((name, value));
        self
    }

    pub(crate) fn error(status: u16, class: &str, message: &str) -> Self {
        Self::json(status, &json!({"error": class, "message": message}))
    }

    pub(crate) fn bad_request(message: &str) -> Self {
        Self::error(400, "BadRequest", message)
    }

    pub(crate) fn not_found(message: &str) -> Self {
        Self::error(404, "NotFoundError", message)
    }

    pub(crate) fn method_not_allowed(message: &str) -> Self {
        Self::error(405, "MethodNotAllowed", message)
    }

    pub(crate) fn service_unavailable(message: &str) -> Self {
        Self::error(503, "InfrastructureError", message)
    }
}

#[derive(Debug, Error)]
pub(crate) enum RequestError {
    #[error("request body exceeds max size ({} bytes)", MAX_HTTP_BODY_BYTES)]
    TooLarge,
    #[error("{0}")]
    Malformed(String),
}

impl RequestError {
    pub(crate) fn into_response(self) -> HttpResponse {
        let status = match self {
            Self::TooLarge => 413,
            Self::Malformed(_) => 400,
        };
        HttpResponse::error(status, "BadRequest", &self.to_string())
    }
}

pub(crate) fn read_http_request(stream: &mut TcpStream) -> Result<Option<HttpRequest>, RequestError> {
    let mut reader = BufReader::new(stream);
    let io_err = |e: std::io::Error| RequestError::Malformed(e.to_string());

    let mut request_line = String::new();
    if reader.read_line(&mut request_line).map_err(io_err)? == 0 {
        return Ok(None);
    }
    let (method, target) = parse_request_line(&request_line)?;

    let mut headers = HashMap::new();
    loop {
        let mut header_line = String::new();
        let bytes = reader.read_line(&mut header_line).map_err(io_err)?;
        if bytes == 0 || header_line == "\r\n" {
            break;
        }
        insert_header(&mut headers, &header_line)?;
    }

    let content_length = content_length(&headers)?;
    let mut body = vec![0u8; content_length];
    if content_length > 0 {
        reader.read_exact(&mut body).map_err(io_err)?;
    }
    Ok(Some(HttpRequest {
        method,
        target,
        headers,
        body,
    }))
}

pub(crate) fn parse_http_request_bytes(raw: &[u8]) -> Result<HttpRequest, RequestError> {
    let split = raw
        .windows(4)
        .position(|window| window == b"\r\n\r\n")
        .ok_or_else(|| RequestError::Malformed("missing HTTP header terminator".to_string()))?;
    let head = std::str::from_utf8(&raw[..split])
        .map_err(|_| RequestError::Malformed("request head must be valid UTF-8".to_string()))?;
    let body = &raw[split + 4..];

    let mut lines = head.split("\r\n");
    let request_line = lines
        .next()
        .ok_or_else(|| RequestError::Malformed("missing request line".to_string()))?;
    let (method, target) = parse_request_line(request_line)?;
    let mut headers = HashMap::new();
    for line in lines.filter(|line| !line.trim().is_empty()) {
        insert_header(&mut headers, line)?;
    }
    if content_length(&headers)? != body.len() {
        return Err(RequestError::Malformed(
            "content-length does not match body size".to_string(),
        ));
    }
    Ok(HttpRequest {
        method,
        target,
        headers,
        body: body.to_vec(),
    })
}

fn insert_header(headers: &mut HashMap<String, String>, line: &str) -> Result<(), RequestError> {
    let (name, value) = line
        .split_once(':')
        .ok_or_else(|| RequestError::Malformed("invalid HTTP header".to_string()))?;
    headers.insert(name.trim().to_ascii_lowercase(), value.trim().to_string());
    Ok(())
}

fn content_length(headers: &HashMap<String, String>) -> Result<usize, RequestError> {
    let length = match headers.get("content-length") {
        Some(raw) => raw
            .parse::<usize>()
            .map_err(|_| RequestError::Malformed("invalid content-length header".to_string()))?,
        None => 0,
    };
    if length > MAX_HTTP_BODY_BYTES {
        return Err(RequestError::TooLarge);
    }
    Ok(length)
}

fn parse_request_line(line: &str) -> Result<(String, String), RequestError> {
    let malformed = |message: &str| RequestError::Malformed(message.to_string());
    let mut parts = line.trim().split_whitespace();
    let method = parts.next().ok_or_else(|| malformed("missing HTTP method"))?;
    let target = parts.next().ok_or_else(|| malformed("missing HTTP target"))?;
    let version = parts.next().ok_or_else(|| malformed("missing HTTP version"))?;
    if !version.starts_with("HTTP/1.") {
        return Err(malformed("unsupported HTTP version"));
    }
    Ok((method.to_string(), target.to_string()))
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
    stream.write_all(&render_response_bytes(&response))?;
    stream.flush()
}

pub(crate) fn render_response_bytes(response: &HttpResponse) -> Vec<u8> {
    let status_text = match response.status {
        200 => "200 OK",
        400 => "400 Bad Request",
        404 => "404 Not Found",
        405 => "405 Method Not Allowed",
        413 => "413 Payload Too Large",
        503 => "503 Service Unavailable",
        _ => "500 Internal Server Error",
    };
    let mut head = format!(
        "HTTP/1.1 {status_text}\r\nContent-Type: {}\r\nContent-Length: {}\r\n",
        response.content_type,
        response.body.len()
    );
    for (name, value) in &response.headers {
        head.push_str(&format!("{name}: {value}\r\n"));
    }
    head.push_str("Connection: close\r\n\r\n");

    let mut out = head.into_bytes();
    out.extend_from_slice(&response.body);
    out
}
