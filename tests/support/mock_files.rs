//! Mock HTTP responders and content helpers.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use sha1::{Digest, Sha1};
use wiremock::{Request, Respond, ResponseTemplate};

/// Lowercase hex SHA-1 of `bytes`.
pub fn sha1_hex(bytes: &[u8]) -> String {
    hex::encode(Sha1::digest(bytes))
}

/// Deterministic, non-repeating-looking payload of `len` bytes.
pub fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}

/// Fails the first `fail_count` requests with `status`, then serves `body`.
pub struct FlakyResponder {
    pub request_count: Arc<AtomicUsize>,
    pub fail_count: usize,
    pub status: u16,
    pub body: Vec<u8>,
}

impl FlakyResponder {
    pub fn new(fail_count: usize, status: u16, body: Vec<u8>) -> Self {
        Self {
            request_count: Arc::new(AtomicUsize::new(0)),
            fail_count,
            status,
            body,
        }
    }
}

impl Respond for FlakyResponder {
    fn respond(&self, _request: &Request) -> ResponseTemplate {
        let n = self.request_count.fetch_add(1, Ordering::SeqCst);
        if n < self.fail_count {
            ResponseTemplate::new(self.status).set_body_bytes(b"unavailable".to_vec())
        } else {
            ResponseTemplate::new(200).set_body_bytes(self.body.clone())
        }
    }
}

/// Serves `body` honoring `Range: bytes=a-b` with 206 responses.
pub struct RangeResponder {
    pub body: Vec<u8>,
    pub delay: Duration,
}

impl RangeResponder {
    pub fn new(body: Vec<u8>) -> Self {
        Self {
            body,
            delay: Duration::ZERO,
        }
    }
}

fn parse_range(header: &str, len: usize) -> Option<(usize, usize)> {
    let spec = header.strip_prefix("bytes=")?;
    let (start, end) = spec.split_once('-')?;
    let start: usize = start.parse().ok()?;
    let end: usize = if end.is_empty() {
        len.checked_sub(1)?
    } else {
        end.parse().ok()?
    };
    (start <= end && end < len).then_some((start, end))
}

impl Respond for RangeResponder {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let range = request
            .headers
            .get("range")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| parse_range(v, self.body.len()));
        let template = match range {
            Some((start, end)) => ResponseTemplate::new(206)
                .insert_header(
                    "content-range",
                    format!("bytes {start}-{end}/{}", self.body.len()).as_str(),
                )
                .set_body_bytes(self.body[start..=end].to_vec()),
            None => ResponseTemplate::new(200).set_body_bytes(self.body.clone()),
        };
        template.set_delay(self.delay)
    }
}
