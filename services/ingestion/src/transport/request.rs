use std::{
    collections::HashMap,
    io::{BufRead, BufReader, Read},
    net::TcpStream,
};

use super::{HttpRequest, RequestError};

pub(super) fn read_http_request(
    stream: &mut TcpStream,
    max_body_bytes: usize,
) -> Result<Option<HttpRequest>, RequestError> {
    let mut reader = BufReader::new(stream);
    let io_err = |e: std::io::Error| RequestError::Malformed(e.to_string());

    let mut request_line = String::new();
    let bytes = reader.read_line(&mut request_line).map_err(io_err)?;
    if bytes == 0 {
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

    let content_length = content_length(&headers, max_body_bytes)?;
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

/// Parses a complete request held in memory. The body is taken verbatim and
/// must match `content-length`.
pub(super) fn parse_http_request_bytes(
    raw: &[u8],
    max_body_bytes: usize,
) -> Result<HttpRequest, RequestError> {
    let split = find_subslice(raw, b"\r\n\r\n")
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
    for line in lines {
        if line.trim().is_empty() {
            continue;
        }
        insert_header(&mut headers, line)?;
    }

    let content_length = content_length(&headers, max_body_bytes)?;
    if content_length != body.len() {
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

fn content_length(
    headers: &HashMap<String, String>,
    max_body_bytes: usize,
) -> Result<usize, RequestError> {
    if headers
        .get("transfer-encoding")
        .is_some_and(|value| value.to_ascii_lowercase().contains("chunked"))
    {
        return Err(RequestError::Malformed(
            "chunked transfer encoding is not supported".to_string(),
        ));
    }
    let length = match headers.get("content-length") {
        Some(raw) => raw
            .parse::<usize>()
            .map_err(|_| RequestError::Malformed("invalid content-length header".to_string()))?,
        None => 0,
    };
    if length > max_body_bytes {
        return Err(RequestError::TooLarge {
            limit: max_body_bytes,
        });
    }
    Ok(length)
}

pub(super) fn parse_request_line(line: &str) -> Result<(String, String), RequestError> {
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

pub(super) fn split_target(target: &str) -> (String, HashMap<String, String>) {
    let (path, query_str) = target
        .split_once('?')
        .map(|(path, query)| (path, Some(query)))
        .unwrap_or((target, None));

    let mut query = HashMap::new();
    if let Some(query_str) = query_str {
        for pair in query_str.split('&') {
            if pair.is_empty() {
                continue;
            }
            let (raw_key, raw_value) = pair.split_once('=').unwrap_or((pair, ""));
            let (Ok(key), Ok(value)) = (url_decode(raw_key, true), url_decode(raw_value, true))
            else {
                continue;
            };
            query.insert(key, value);
        }
    }
    (path.to_string(), query)
}

/// Percent-decodes a URL component. `+` means space only in query strings.
pub(super) fn url_decode(raw: &str, plus_as_space: bool) -> Result<String, String> {
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

pub(super) fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}
