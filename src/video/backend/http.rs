//! HTTP capture backend
//!
//! Two kinds of URL are accepted:
//! - `multipart/x-mixed-replace` MJPEG streams (IP cameras, other framecast servers)
//! - single JPEG/PNG snapshot URLs, fetched again on every read

use bytes::Bytes;
use reqwest::blocking::{Client, Response};
use reqwest::header::CONTENT_TYPE;
use std::io::Read;
use std::time::Duration;
use tracing::{debug, info};

use super::{BackendKind, CaptureBackend, CaptureStream, OpenRequest};
use crate::error::{AppError, Result};
use crate::video::decoder::{find_soi, jpeg_length, MjpegDecoder};
use crate::video::frame::VideoFrame;
use crate::video::source::SourceId;

/// Bounds connect and each body read
const READ_TIMEOUT: Duration = Duration::from_secs(5);
/// Bytes pulled from the socket per read call
const READ_CHUNK: usize = 64 * 1024;
/// Buffered bytes allowed without a complete JPEG before the buffer is dropped
const MAX_BUFFERED: usize = 16 * 1024 * 1024;

/// Opens `http://` and `https://` sources
pub struct HttpBackend {
    connect_timeout: Duration,
}

impl HttpBackend {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }

    fn client(&self) -> Result<Client> {
        Client::builder()
            .connect_timeout(self.connect_timeout)
            .timeout(READ_TIMEOUT)
            .build()
            .map_err(|e| AppError::VideoError(format!("Failed to build HTTP client: {}", e)))
    }
}

fn fetch(client: &Client, url: &str) -> Result<Response> {
    client
        .get(url)
        .send()
        .and_then(|r| r.error_for_status())
        .map_err(|e| AppError::VideoError(format!("GET {} failed: {}", url, e)))
}

impl CaptureBackend for HttpBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Http
    }

    fn supports(&self, id: &SourceId) -> bool {
        matches!(id.scheme().as_deref(), Some("http") | Some("https"))
    }

    fn open(&self, id: &SourceId, _request: &OpenRequest) -> Result<Box<dyn CaptureStream>> {
        let SourceId::Url(url) = id else {
            return Err(AppError::Unsupported(format!("{} is not a URL", id)));
        };

        let client = self.client()?;
        let response = fetch(&client, url)?;
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_ascii_lowercase();

        let decoder = MjpegDecoder::new()?;
        if content_type.starts_with("multipart/") {
            info!("HTTP MJPEG stream {} ({})", url, content_type);
            return Ok(Box::new(MultipartStream {
                response: Some(response),
                buffer: JpegBuffer::default(),
                decoder,
            }));
        }

        let first = response
            .bytes()
            .map_err(|e| AppError::VideoError(format!("Failed to read {}: {}", url, e)))?;
        info!("HTTP snapshot source {} ({}, {} bytes)", url, content_type, first.len());
        Ok(Box::new(SnapshotStream {
            client: Some(client),
            url: url.clone(),
            pending: Some(first),
            decoder,
        }))
    }
}

/// Accumulates stream bytes and cuts complete JPEG images out of them.
///
/// Multipart boundaries and part headers are skipped implicitly: only the
/// bytes between an SOI marker and the matching EOI are kept.
#[derive(Default)]
struct JpegBuffer {
    data: Vec<u8>,
}

impl JpegBuffer {
    fn push(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
        if self.data.len() > MAX_BUFFERED {
            debug!("Dropping {} buffered bytes without a complete JPEG", self.data.len());
            self.data.clear();
        }
    }

    fn next_jpeg(&mut self) -> Option<Vec<u8>> {
        let Some(start) = find_soi(&self.data) else {
            // a trailing 0xFF may be the first half of the next SOI
            let keep = usize::from(self.data.last() == Some(&0xFF));
            self.data.drain(..self.data.len() - keep);
            return None;
        };
        self.data.drain(..start);
        let len = jpeg_length(&self.data)?;
        Some(self.data.drain(..len).collect())
    }
}

/// Long-lived multipart response
struct MultipartStream {
    response: Option<Response>,
    buffer: JpegBuffer,
    decoder: MjpegDecoder,
}

impl CaptureStream for MultipartStream {
    fn read(&mut self) -> Result<VideoFrame> {
        let mut chunk = vec![0u8; READ_CHUNK];
        loop {
            if let Some(jpeg) = self.buffer.next_jpeg() {
                return self.decoder.decode(&jpeg, 0);
            }
            let Some(response) = self.response.as_mut() else {
                return Err(AppError::ReadFailure("stream released".to_string()));
            };
            match response.read(&mut chunk) {
                Ok(0) => {
                    self.response = None;
                    return Err(AppError::ReadFailure("stream ended".to_string()));
                }
                Ok(n) => self.buffer.push(&chunk[..n]),
                Err(e) => {
                    self.response = None;
                    return Err(AppError::ReadFailure(format!("stream read failed: {}", e)));
                }
            }
        }
    }

    fn is_opened(&self) -> bool {
        self.response.is_some()
    }

    fn release(&mut self) {
        self.response = None;
        self.buffer.data.clear();
    }
}

/// Still image re-fetched on every read
struct SnapshotStream {
    client: Option<Client>,
    url: String,
    /// Body fetched while opening, served by the first read
    pending: Option<Bytes>,
    decoder: MjpegDecoder,
}

impl SnapshotStream {
    fn decode(&mut self, body: &[u8]) -> Result<VideoFrame> {
        if body.starts_with(&[0xFF, 0xD8]) {
            return self.decoder.decode(body, 0);
        }
        let image = image::load_from_memory(body)
            .map_err(|e| AppError::ReadFailure(format!("{} is not an image: {}", self.url, e)))?
            .to_rgb8();
        Ok(VideoFrame::from_image(image, 0))
    }
}

impl CaptureStream for SnapshotStream {
    fn read(&mut self) -> Result<VideoFrame> {
        let body = match self.pending.take() {
            Some(body) => body,
            None => {
                let Some(client) = self.client.as_ref() else {
                    return Err(AppError::ReadFailure("snapshot released".to_string()));
                };
                let fetched = fetch(client, &self.url).and_then(|r| {
                    r.bytes()
                        .map_err(|e| AppError::ReadFailure(format!("{}: {}", self.url, e)))
                });
                match fetched {
                    Ok(body) => body,
                    Err(e) => {
                        self.client = None;
                        return Err(AppError::ReadFailure(e.to_string()));
                    }
                }
            }
        };
        self.decode(&body)
    }

    fn is_opened(&self) -> bool {
        self.client.is_some()
    }

    fn release(&mut self) {
        self.client = None;
        self.pending = None;
    }
}
