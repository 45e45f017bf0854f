//! Minimal HTTP/1.x request head parsing
//!
//! Only the request line and headers are read; MJPEG viewers never send a
//! body.

use std::collections::HashMap;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{AppError, Result};

/// Largest request head accepted
pub const MAX_REQUEST_HEAD: usize = 8192;

#[derive(Debug, Clone, PartialEq)]
pub struct HttpRequest {
    pub method: String,
    /// Normalized request path, see [`normalize_path`]
    pub path: String,
    pub version: String,
    /// Header names in lowercase
    pub headers: HashMap<String, String>,
}

/// Cut a complete request head off the front of `buffer`
pub fn take_request_from_buffer(buffer: &mut Vec<u8>) -> Option<String> {
    let delimiter = b"\r\n\r\n";
    let pos = find_bytes(buffer, delimiter)?;
    let req_end = pos + delimiter.len();
    let req_bytes: Vec<u8> = buffer.drain(0..req_end).collect();
    Some(String::from_utf8_lossy(&req_bytes).to_string())
}

fn find_bytes(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|window| window == needle)
}

pub fn parse_request(raw: &str) -> Option<HttpRequest> {
    let mut lines = raw.split("\r\n");
    let mut request_line = lines.next()?.split_whitespace();
    let method = request_line.next()?.to_string();
    let target = request_line.next()?;
    let version = request_line.next()?.to_string();
    if request_line.next().is_some() || !version.starts_with("HTTP/") {
        return None;
    }

    let mut headers = HashMap::new();
    for line in lines.take_while(|l| !l.is_empty()) {
        let (name, value) = line.split_once(':')?;
        headers.insert(name.trim().to_ascii_lowercase(), value.trim().to_string());
    }

    Some(HttpRequest {
        method,
        path: normalize_path(target),
        version,
        headers,
    })
}

/// Lowercase path without scheme, host, query, fragment or trailing slash
pub fn normalize_path(target: &str) -> String {
    let raw_path = if let Some((_, remainder)) = target.split_once("://") {
        match remainder.find('/') {
            Some(idx) => &remainder[idx..],
            None => "/",
        }
    } else {
        target
    };

    let path = raw_path
        .split(['?', '#'])
        .next()
        .unwrap_or(raw_path)
        .trim_matches('/')
        .to_ascii_lowercase();
    format!("/{}", path)
}

/// Read and parse one request head.
///
/// `Ok(None)` when the peer closed before sending a complete head.
pub async fn read_request<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<HttpRequest>> {
    let mut buffer = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];

    loop {
        if let Some(head) = take_request_from_buffer(&mut buffer) {
            return parse_request(&head)
                .map(Some)
                .ok_or_else(|| AppError::BadRequest("malformed request head".to_string()));
        }
        if buffer.len() >= MAX_REQUEST_HEAD {
            return Err(AppError::BadRequest(format!(
                "request head exceeds {} bytes",
                MAX_REQUEST_HEAD
            )));
        }

        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            return Ok(None);
        }
        buffer.extend_from_slice(&chunk[..n]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_get() {
        let req = parse_request("GET /Cam0?x=1 HTTP/1.1\r\nHost: example\r\nUser-Agent: curl\r\n\r\n")
            .unwrap();
        assert_eq!(req.method, "GET");
        assert_eq!(req.path, "/cam0");
        assert_eq!(req.version, "HTTP/1.1");
        assert_eq!(req.headers.get("host").map(String::as_str), Some("example"));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_request("hello\r\n\r\n").is_none());
        assert!(parse_request("GET /x FTP/1.0\r\n\r\n").is_none());
        assert!(parse_request("GET /x HTTP/1.1\r\nbroken header\r\n\r\n").is_none());
    }

    #[test]
    fn test_normalize_path() {
        assert_eq!(normalize_path("/Video/"), "/video");
        assert_eq!(normalize_path("video"), "/video");
        assert_eq!(normalize_path("http://host:7227/A/b#frag"), "/a/b");
        assert_eq!(normalize_path("http://host"), "/");
        assert_eq!(normalize_path("/"), "/");
    }

    #[test]
    fn test_take_request_keeps_remainder() {
        let mut buffer = b"GET / HTTP/1.0\r\n\r\nextra".to_vec();
        let head = take_request_from_buffer(&mut buffer).unwrap();
        assert!(head.ends_with("\r\n\r\n"));
        assert_eq!(buffer, b"extra");
        assert!(take_request_from_buffer(&mut buffer).is_none());
    }

    #[tokio::test]
    async fn test_read_request_limits() {
        let mut complete: &[u8] = b"GET /a HTTP/1.1\r\n\r\n";
        let req = read_request(&mut complete).await.unwrap().unwrap();
        assert_eq!(req.path, "/a");

        let mut truncated: &[u8] = b"GET /a HTTP/1.1\r\n";
        assert!(read_request(&mut truncated).await.unwrap().is_none());

        let huge = vec![b'a'; MAX_REQUEST_HEAD + 10];
        let mut huge: &[u8] = &huge;
        assert!(read_request(&mut huge).await.is_err());
    }
}
