//! Turns an HTTP request into an [`Upload`]: either a raw CSV body or a
//! `multipart/form-data` body carrying one file part.

use std::collections::HashMap;

use super::{HttpRequest, request::find_subslice};
use crate::coordinator::Upload;

const FILE_FIELD_NAME: &str = "file";

#[derive(Debug, Default, PartialEq, Eq)]
struct Part {
    name: Option<String>,
    filename: Option<String>,
    content_type: Option<String>,
    data: Vec<u8>,
}

pub(super) fn extract_upload(
    request: &HttpRequest,
    query: &HashMap<String, String>,
) -> Result<Upload, String> {
    let content_type = request.header("content-type").unwrap_or_default();
    if content_type
        .to_ascii_lowercase()
        .starts_with("multipart/form-data")
    {
        let boundary = multipart_boundary(content_type)
            .ok_or_else(|| "multipart content-type is missing a boundary".to_string())?;
        let part = select_file_part(parse_multipart(&request.body, &boundary)?)?;
        return Ok(Upload {
            filename: part.filename,
            content_type: part.content_type,
            bytes: part.data,
        });
    }

    let filename = query
        .get("filename")
        .cloned()
        .or_else(|| request.header("x-filename").map(str::to_string))
        .filter(|name| !name.trim().is_empty());
    Ok(Upload {
        filename,
        content_type: (!content_type.is_empty()).then(|| content_type.to_string()),
        bytes: request.body.clone(),
    })
}

fn multipart_boundary(content_type: &str) -> Option<String> {
    content_type.split(';').skip(1).find_map(|param| {
        let (key, value) = param.trim().split_once('=')?;
        key.trim()
            .eq_ignore_ascii_case("boundary")
            .then(|| value.trim().trim_matches('"').to_string())
            .filter(|boundary| !boundary.is_empty())
    })
}

fn parse_multipart(body: &[u8], boundary: &str) -> Result<Vec<Part>, String> {
    let delimiter = format!("--{boundary}").into_bytes();
    let mut part_end = b"\r\n".to_vec();
    part_end.extend_from_slice(&delimiter);

    let mut pos = find_subslice(body, &delimiter)
        .ok_or_else(|| "multipart body does not contain its boundary".to_string())?;
    let mut parts = Vec::new();
    loop {
        pos += delimiter.len();
        let rest = &body[pos..];
        if rest.starts_with(b"--") {
            break;
        }
        if !rest.starts_with(b"\r\n") {
            return Err("malformed multipart boundary line".to_string());
        }
        pos += 2;

        let header_len = find_subslice(&body[pos..], b"\r\n\r\n")
            .ok_or_else(|| "multipart part is missing its header terminator".to_string())?;
        let headers = std::str::from_utf8(&body[pos..pos + header_len])
            .map_err(|_| "multipart part headers must be valid UTF-8".to_string())?;
        let content_start = pos + header_len + 4;
        let content_len = find_subslice(&body[content_start..], &part_end)
            .ok_or_else(|| "multipart part is not terminated by a boundary".to_string())?;

        let mut part = parse_part_headers(headers);
        part.data = body[content_start..content_start + content_len].to_vec();
        parts.push(part);
        pos = content_start + content_len + 2;
    }
    Ok(parts)
}

fn parse_part_headers(headers: &str) -> Part {
    let mut part = Part::default();
    for line in headers.split("\r\n") {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        let name = name.trim();
        if name.eq_ignore_ascii_case("content-type") {
            part.content_type = Some(value.trim().to_string());
        } else if name.eq_ignore_ascii_case("content-disposition") {
            for param in value.split(';').skip(1) {
                let Some((key, raw)) = param.trim().split_once('=') else {
                    continue;
                };
                let raw = raw.trim().trim_matches('"').to_string();
                match key.trim().to_ascii_lowercase().as_str() {
                    "name" => part.name = Some(raw),
                    "filename" => part.filename = Some(raw),
                    _ => {}
                }
            }
        }
    }
    part
}

fn select_file_part(parts: Vec<Part>) -> Result<Part, String> {
    let mut files: Vec<Part> = parts
        .into_iter()
        .filter(|part| part.filename.is_some() || part.name.as_deref() == Some(FILE_FIELD_NAME))
        .collect();
    match files.len() {
        0 => Err("multipart upload has no file part".to_string()),
        1 => Ok(files.remove(0)),
        _ => Err("multipart upload must contain exactly one file part".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn multipart_request(body: &str) -> HttpRequest {
        HttpRequest {
            method: "POST".to_string(),
            target: "/v1/batches".to_string(),
            headers: HashMap::from([(
                "content-type".to_string(),
                "multipart/form-data; boundary=XyZ".to_string(),
            )]),
            body: body.as_bytes().to_vec(),
        }
    }

    #[test]
    fn extracts_single_file_part() {
        let body = "--XyZ\r\n\
            Content-Disposition: form-data; name=\"note\"\r\n\r\n\
            hello\r\n\
            --XyZ\r\n\
            Content-Disposition: form-data; name=\"file\"; filename=\"pay.csv\"\r\n\
            Content-Type: text/csv\r\n\r\n\
            a,b\r\n1,2\r\n\
            --XyZ--\r\n";
        let upload = extract_upload(&multipart_request(body), &HashMap::new()).unwrap();
        assert_eq!(upload.filename.as_deref(), Some("pay.csv"));
        assert_eq!(upload.content_type.as_deref(), Some("text/csv"));
        assert_eq!(upload.bytes, b"a,b\r\n1,2");
    }

    #[test]
    fn rejects_multiple_file_parts() {
        let body = "--XyZ\r\n\
            Content-Disposition: form-data; name=\"file\"; filename=\"a.csv\"\r\n\r\n\
            x\r\n\
            --XyZ\r\n\
            Content-Disposition: form-data; name=\"other\"; filename=\"b.csv\"\r\n\r\n\
            y\r\n\
            --XyZ--\r\n";
        let err = extract_upload(&multipart_request(body), &HashMap::new()).unwrap_err();
        assert!(err.contains("exactly one file part"));
    }

    #[test]
    fn rejects_unterminated_part() {
        let body = "--XyZ\r\nContent-Disposition: form-data; name=\"file\"\r\n\r\nabc";
        assert!(extract_upload(&multipart_request(body), &HashMap::new()).is_err());
    }

    #[test]
    fn raw_body_takes_filename_from_query_then_header() {
        let mut request = HttpRequest {
            method: "POST".to_string(),
            target: "/v1/batches".to_string(),
            headers: HashMap::from([
                ("content-type".to_string(), "text/csv".to_string()),
                ("x-filename".to_string(), "header.csv".to_string()),
            ]),
            body: b"a,b\n".to_vec(),
        };
        let query = HashMap::from([("filename".to_string(), "query.csv".to_string())]);
        let upload = extract_upload(&request, &query).unwrap();
        assert_eq!(upload.filename.as_deref(), Some("query.csv"));

        let upload = extract_upload(&request, &HashMap::new()).unwrap();
        assert_eq!(upload.filename.as_deref(), Some("header.csv"));

        request.headers.clear();
        let upload = extract_upload(&request, &HashMap::new()).unwrap();
        assert_eq!(upload.filename, None);
        assert_eq!(upload.content_type, None);
    }
}
