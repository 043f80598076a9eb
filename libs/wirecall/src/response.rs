//! HTTP response wrapper with a size-limited, materialize-once body.

use std::time::{Duration, SystemTime};

use bytes::Bytes;
use http::header::{HeaderMap, RETRY_AFTER};
use http::StatusCode;
use http_body_util::combinators::BoxBody;
use http_body_util::BodyExt;

use crate::error::{DecodeError, InvokeError};

/// Boxed response body stream.
pub type ResponseBody = BoxBody<Bytes, Box<dyn std::error::Error + Send + Sync>>;

/// Default cap on buffered response bodies (10 MiB).
pub const DEFAULT_MAX_BODY_SIZE: usize = 10 * 1024 * 1024;

enum BodyState {
    Pending(ResponseBody),
    Buffered(Bytes),
}

/// A response as seen by decoders and error decoders.
///
/// The body arrives as a stream and is buffered on first access to
/// [`bytes`](Response::bytes), subject to the size limit. After buffering,
/// repeated access returns the same bytes. Raw-result calls receive the
/// response with the stream still pending.
pub struct Response {
    status: StatusCode,
    headers: HeaderMap,
    body: BodyState,
    max_body_size: usize,
}

impl Response {
    #[must_use]
    pub fn new(status: StatusCode, headers: HeaderMap, body: ResponseBody) -> Self {
        Response {
            status,
            headers,
            body: BodyState::Pending(body),
            max_body_size: DEFAULT_MAX_BODY_SIZE,
        }
    }

    /// A response over already-buffered bytes. Used by tests and by clients
    /// that buffer eagerly.
    #[must_use]
    pub fn from_bytes(status: StatusCode, headers: HeaderMap, body: Bytes) -> Self {
        Response {
            status,
            headers,
            body: BodyState::Buffered(body),
            max_body_size: DEFAULT_MAX_BODY_SIZE,
        }
    }

    #[must_use]
    pub fn with_max_body_size(mut self, limit: usize) -> Self {
        self.max_body_size = limit;
        self
    }

    #[must_use]
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// Canonical reason phrase for the status, when one exists.
    #[must_use]
    pub fn reason(&self) -> Option<&'static str> {
        self.status.canonical_reason()
    }

    #[must_use]
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// First value of `name` as UTF-8 text.
    #[must_use]
    pub fn header_str(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// `Content-Type` without parameters.
    #[must_use]
    pub fn content_type(&self) -> Option<&str> {
        self.header_str(http::header::CONTENT_TYPE.as_str())
            .map(|ct| ct.split(';').next().unwrap_or(ct).trim())
    }

    /// Buffers the body (if not already buffered) and returns it.
    ///
    /// Frames are collected up to the configured limit; exceeding it aborts
    /// the read and fails the call with [`InvokeError::BodyTooLarge`].
    pub async fn bytes(&mut self) -> Result<Bytes, InvokeError> {
        if let BodyState::Pending(body) = &mut self.body {
            let mut collected: Vec<u8> = Vec::new();
            while let Some(frame) = body.frame().await {
                let frame = frame.map_err(|e| InvokeError::Decode(DecodeError::Body(e)))?;
                if let Ok(data) = frame.into_data() {
                    if collected.len() + data.len() > self.max_body_size {
                        return Err(InvokeError::BodyTooLarge {
                            limit: self.max_body_size,
                            actual: collected.len() + data.len(),
                        });
                    }
                    collected.extend_from_slice(&data);
                }
            }
            self.body = BodyState::Buffered(Bytes::from(collected));
        }
        match &self.body {
            BodyState::Buffered(bytes) => Ok(bytes.clone()),
            BodyState::Pending(_) => unreachable!("body buffered above"),
        }
    }

    /// Buffers the body and decodes it as UTF-8, replacing invalid
    /// sequences.
    pub async fn text(&mut self) -> Result<String, InvokeError> {
        let bytes = self.bytes().await?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Resume instant from this response's `Retry-After` header, if present
    /// and parseable.
    #[must_use]
    pub fn retry_after(&self, now: SystemTime) -> Option<SystemTime> {
        self.header_str(RETRY_AFTER.as_str())
            .and_then(|v| parse_retry_after_at(v, now))
    }
}

impl std::fmt::Debug for Response {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Response")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .field(
                "body",
                &match &self.body {
                    BodyState::Pending(_) => "<pending>".to_owned(),
                    BodyState::Buffered(b) => format!("<{} bytes>", b.len()),
                },
            )
            .finish()
    }
}

/// Parses a `Retry-After` value against an explicit reference clock.
///
/// Accepts the two RFC 7231 forms: a non-negative relative second count
/// (`"120"` means `now + 120s`) and an HTTP-date (`httpdate` handles the
/// obsolete formats too). Anything else yields `None`.
#[must_use]
pub fn parse_retry_after_at(value: &str, now: SystemTime) -> Option<SystemTime> {
    let value = value.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return now.checked_add(Duration::from_secs(secs));
    }
    httpdate::parse_http_date(value).ok()
}
