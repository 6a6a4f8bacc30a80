//! Incremental RTSP request parsing and response encoding
//!
//! The parser is sans-IO: the connection worker feeds it whatever the socket
//! produced and polls for a complete message. Line terminators may be `\r`,
//! `\n` or `\r\n` — some senders are sloppy about this, so a bare `\r` or
//! `\n` ends a line. Bodies are delimited by `Content-Length` and the parser
//! never consumes past it; excess bytes stay buffered for the next request.

use bytes::{Buf, BytesMut};

use super::message::RtspMessage;

/// Errors during RTSP request parsing; all of them mean "bad packet"
#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    /// Request line was not `METHOD URI VERSION`
    #[error("malformed request line: {0:?}")]
    InvalidRequestLine(String),

    /// Version string was not `RTSP/1.0`
    #[error("unsupported protocol version: {0:?}")]
    InvalidVersion(String),

    /// Header line without a `": "` separator
    #[error("malformed header line: {0:?}")]
    InvalidHeader(String),

    /// Header section was not valid UTF-8
    #[error("non-UTF-8 data in header section")]
    InvalidUtf8,
}

#[derive(Debug)]
enum ParseState {
    RequestLine,
    Headers(RtspMessage),
    Body { msg: RtspMessage, remaining: usize },
}

/// Incremental parser for RTSP requests.
///
/// Feed bytes with [`feed`](Self::feed), then call [`poll`](Self::poll) until
/// it yields a message or asks for more data. [`body_remaining`](Self::body_remaining)
/// tells the IO driver whether the parser is in the body phase and how many
/// bytes are still owed, so reads can be capped and paced.
#[derive(Debug)]
pub struct RequestParser {
    buf: BytesMut,
    state: ParseState,
}

impl RequestParser {
    /// Create a parser with the standard 4 KiB read buffer.
    #[must_use]
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(4096),
            state: ParseState::RequestLine,
        }
    }

    /// Append bytes read from the socket.
    pub fn feed(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Bytes of body still owed, if the parser is in the body phase.
    #[must_use]
    pub fn body_remaining(&self) -> Option<usize> {
        match &self.state {
            ParseState::Body { remaining, .. } => Some(remaining.saturating_sub(self.buf.len())),
            _ => None,
        }
    }

    /// Number of bytes currently buffered.
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Try to produce a complete request from the buffered bytes.
    ///
    /// Returns `Ok(None)` when more data is needed.
    ///
    /// # Errors
    /// Returns [`ParseError`] when the request is malformed; the parser is
    /// left in an unspecified state and should be discarded.
    pub fn poll(&mut self) -> Result<Option<RtspMessage>, ParseError> {
        loop {
            match std::mem::replace(&mut self.state, ParseState::RequestLine) {
                ParseState::RequestLine => {
                    let Some(line) = self.take_line()? else {
                        return Ok(None);
                    };
                    if line.is_empty() {
                        // stray blank line before the request; tolerate it
                        continue;
                    }
                    let mut msg = RtspMessage::new();
                    Self::parse_request_line(&line, &mut msg)?;
                    self.state = ParseState::Headers(msg);
                }
                ParseState::Headers(mut msg) => {
                    let Some(line) = self.take_line()? else {
                        self.state = ParseState::Headers(msg);
                        return Ok(None);
                    };
                    if line.is_empty() {
                        let remaining = msg.headers.content_length().unwrap_or(0);
                        self.state = ParseState::Body { msg, remaining };
                        continue;
                    }
                    let Some(sep) = line.find(": ") else {
                        tracing::warn!("bad header: {line:?}");
                        return Err(ParseError::InvalidHeader(line));
                    };
                    let (name, value) = line.split_at(sep);
                    msg.headers.add(name, &value[2..]);
                    self.state = ParseState::Headers(msg);
                }
                ParseState::Body { mut msg, remaining } => {
                    if self.buf.len() < remaining {
                        self.state = ParseState::Body { msg, remaining };
                        return Ok(None);
                    }
                    msg.content = self.buf.split_to(remaining).freeze();
                    return Ok(Some(msg));
                }
            }
        }
    }

    /// Take one line off the buffer, honouring `\r`, `\n` and `\r\n`.
    ///
    /// A trailing `\r` at the very end of the buffer is left in place until
    /// more data arrives, in case its `\n` is still in flight.
    fn take_line(&mut self) -> Result<Option<String>, ParseError> {
        let Some(pos) = self.buf.iter().position(|&b| b == b'\r' || b == b'\n') else {
            return Ok(None);
        };
        if self.buf[pos] == b'\r' && pos + 1 == self.buf.len() {
            return Ok(None);
        }
        let line = self.buf.split_to(pos);
        let line = std::str::from_utf8(&line)
            .map_err(|_| ParseError::InvalidUtf8)?
            .to_string();
        let term = self.buf.get_u8();
        if term == b'\r' && self.buf.first() == Some(&b'\n') {
            self.buf.advance(1);
        }
        Ok(Some(line))
    }

    fn parse_request_line(line: &str, msg: &mut RtspMessage) -> Result<(), ParseError> {
        let mut parts = line.split_whitespace();
        let (Some(method), Some(uri), Some(version)) = (parts.next(), parts.next(), parts.next())
        else {
            return Err(ParseError::InvalidRequestLine(line.to_string()));
        };
        if version != "RTSP/1.0" {
            return Err(ParseError::InvalidVersion(version.to_string()));
        }
        msg.method = Some(method.to_string());
        msg.uri = Some(uri.to_string());
        Ok(())
    }
}

impl Default for RequestParser {
    fn default() -> Self {
        Self::new()
    }
}

/// Encode an RTSP response for transmission.
///
/// Status line, headers verbatim in insertion order, `Content-Length` only
/// when there is content, blank line, content. Meant to go out in a single
/// contiguous write.
#[must_use]
pub fn encode_response(resp: &RtspMessage) -> Vec<u8> {
    let mut out = Vec::with_capacity(256 + resp.content.len());

    out.extend_from_slice(
        format!(
            "RTSP/1.0 {} {}\r\n",
            resp.respcode,
            super::reason_phrase(resp.respcode)
        )
        .as_bytes(),
    );

    for (name, value) in resp.headers.iter() {
        out.extend_from_slice(format!("{name}: {value}\r\n").as_bytes());
    }

    if !resp.content.is_empty() {
        out.extend_from_slice(format!("Content-Length: {}\r\n", resp.content.len()).as_bytes());
    }

    out.extend_from_slice(b"\r\n");
    out.extend_from_slice(&resp.content);

    out
}
