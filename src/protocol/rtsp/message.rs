//! RTSP message object and header collection
//!
//! One message type serves both directions: parsed requests carry `method`
//! and `uri`, built responses carry `respcode`. Requests are frozen into an
//! [`SharedMessage`] after parsing so that metadata consumers can keep the
//! payload alive after the request handler has moved on; cloning the handle
//! retains the message, dropping it releases it.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;

/// Cap on headers per message; senders use far fewer.
const MAX_HEADERS: usize = 16;

static MESSAGE_INDEX: AtomicU64 = AtomicU64::new(1);

/// An RTSP message, request or response.
#[derive(Debug)]
pub struct RtspMessage {
    /// Monotonically increasing identifier, for diagnostics only
    pub index_number: u64,
    /// Request verb, exactly as received (requests only)
    pub method: Option<String>,
    /// Request URI (requests only)
    pub uri: Option<String>,
    /// Numeric status (responses only)
    pub respcode: u16,
    /// Ordered header sequence
    pub headers: Headers,
    /// Opaque content buffer
    pub content: Bytes,
}

/// A reference-counted handle to a parsed message.
///
/// Clone to retain, drop to release; the message is freed when the last
/// handle goes away.
pub type SharedMessage = Arc<RtspMessage>;

impl RtspMessage {
    /// Create an empty message with a fresh index number.
    #[must_use]
    pub fn new() -> Self {
        Self {
            index_number: MESSAGE_INDEX.fetch_add(1, Ordering::Relaxed),
            method: None,
            uri: None,
            respcode: 0,
            headers: Headers::new(),
            content: Bytes::new(),
        }
    }

    /// Create a response template with the given initial status.
    #[must_use]
    pub fn response(respcode: u16) -> Self {
        let mut msg = Self::new();
        msg.respcode = respcode;
        msg
    }

    /// Content length in bytes.
    #[must_use]
    pub fn content_length(&self) -> usize {
        self.content.len()
    }

    /// Request body as UTF-8, lossily decoded.
    #[must_use]
    pub fn content_str(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.content)
    }
}

impl Default for RtspMessage {
    fn default() -> Self {
        Self::new()
    }
}

/// Ordered RTSP header collection.
///
/// Headers keep their insertion order and are compared case-insensitively on
/// read. At most [`MAX_HEADERS`] entries are kept; extras are dropped with a
/// warning.
#[derive(Debug, Clone, Default)]
pub struct Headers {
    entries: Vec<(String, String)>,
}

impl Headers {
    /// Create an empty header collection.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a header, preserving order.
    ///
    /// Returns `false` if the header table is full and the entry was dropped.
    pub fn add(&mut self, name: impl Into<String>, value: impl Into<String>) -> bool {
        if self.entries.len() >= MAX_HEADERS {
            tracing::warn!("too many headers, dropping one");
            return false;
        }
        self.entries.push((name.into(), value.into()));
        true
    }

    /// Get the first header with the given name (case-insensitive).
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Check whether a header is present.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Parsed `CSeq` value.
    #[must_use]
    pub fn cseq(&self) -> Option<u32> {
        self.get("CSeq")?.parse().ok()
    }

    /// Parsed `Content-Length` value.
    #[must_use]
    pub fn content_length(&self) -> Option<usize> {
        self.get("Content-Length")?.parse().ok()
    }

    /// `Content-Type` value.
    #[must_use]
    pub fn content_type(&self) -> Option<&str> {
        self.get("Content-Type")
    }

    /// Iterate over headers in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    /// Number of headers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if there are no headers.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Extract the value of a `key=` field from a composite header value such as
/// `RTP-Info: seq=1234;rtptime=5678`.
#[must_use]
pub fn header_field<'a>(value: &'a str, key: &str) -> Option<&'a str> {
    for part in value.split(';') {
        let part = part.trim();
        if let Some(rest) = part.strip_prefix(key) {
            if let Some(v) = rest.strip_prefix('=') {
                return Some(v);
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_headers_case_insensitive() {
        let mut h = Headers::new();
        h.add("Content-Length", "42");
        assert_eq!(h.get("content-length"), Some("42"));
        assert_eq!(h.get("CONTENT-LENGTH"), Some("42"));
        assert_eq!(h.content_length(), Some(42));
    }

    #[test]
    fn test_headers_preserve_order() {
        let mut h = Headers::new();
        h.add("CSeq", "1");
        h.add("Server", "AirTunes/105.1");
        h.add("Public", "OPTIONS");
        let names: Vec<&str> = h.iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["CSeq", "Server", "Public"]);
    }

    #[test]
    fn test_headers_capacity() {
        let mut h = Headers::new();
        for i in 0..MAX_HEADERS {
            assert!(h.add(format!("X-{i}"), "v"));
        }
        assert!(!h.add("X-overflow", "v"));
        assert_eq!(h.len(), MAX_HEADERS);
    }

    #[test]
    fn test_message_index_monotonic() {
        let a = RtspMessage::new();
        let b = RtspMessage::new();
        assert!(b.index_number > a.index_number);
    }

    #[test]
    fn test_shared_message_retain_release() {
        let msg = SharedMessage::new(RtspMessage::new());
        assert_eq!(Arc::strong_count(&msg), 1);
        let retained = msg.clone();
        assert_eq!(Arc::strong_count(&msg), 2);
        drop(retained);
        assert_eq!(Arc::strong_count(&msg), 1);
    }

    #[test]
    fn test_header_field() {
        assert_eq!(header_field("seq=12;rtptime=3456", "rtptime"), Some("3456"));
        assert_eq!(header_field("rtptime=99", "rtptime"), Some("99"));
        assert_eq!(header_field("seq=12", "rtptime"), None);
    }
}
