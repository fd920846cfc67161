//! JSON-RPC framing codec for LSP communication.
//!
//! LSP uses `Content-Length: N\r\n\r\n{json}` framing over stdin/stdout.
//! [`encode`] produces one frame; [`FrameDecoder`] consumes an append-only
//! byte stream and yields complete messages as they become available.
//!
//! The decoder never blocks and never gives up on the stream: a malformed
//! header or payload drops that one frame and yields a [`FramingError`],
//! and decoding resumes at the next header.

use anyhow::{Context, Result};
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::protocol::{InvalidMessage, Message};

/// Maximum frame size (4 MiB) to prevent unbounded memory allocation.
pub const MAX_FRAME_BYTES: usize = 4 * 1024 * 1024;

/// Header block size beyond which a buffer without a separator is garbage.
const MAX_HEADER_BYTES: usize = 8 * 1024;

/// Bytes re-scanned across feeds so a header split between chunks is found.
const RESCAN_OVERLAP: usize = 64;

const HEADER_SEPARATOR: &[u8] = b"\r\n\r\n";

const CONTENT_LENGTH_MARKER: &[u8] = b"content-length:";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FramingError {
    #[error("missing Content-Length header")]
    MissingContentLength,
    #[error("invalid Content-Length value: {0:?}")]
    InvalidContentLength(String),
    #[error("Content-Length {0} exceeds maximum {MAX_FRAME_BYTES}")]
    Oversized(usize),
    #[error("truncated frame: declared {declared} bytes, next header after {found}")]
    Truncated { declared: usize, found: usize },
    #[error("discarded {0} bytes without a header separator")]
    Garbage(usize),
    #[error("invalid JSON payload: {0}")]
    InvalidJson(String),
    #[error("invalid JSON-RPC message: {0}")]
    InvalidMessage(#[from] InvalidMessage),
}

/// Serialize a message into one `Content-Length` frame.
///
/// The length counts bytes of the UTF-8 body, not characters.
pub fn encode(message: &Message) -> serde_json::Result<Vec<u8>> {
    let body = serde_json::to_vec(&message.to_value())?;
    let mut frame = format!("Content-Length: {}\r\n\r\n", body.len()).into_bytes();
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Incremental decoder over a partially-buffered byte stream.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
    /// Remaining bytes of an oversized frame still to be discarded.
    skip: usize,
    /// Payload bytes of the pending frame already checked for a new header.
    scanned: usize,
}

impl FrameDecoder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append bytes and iterate the frames that are now complete.
    ///
    /// The iterator is lazy: frames it does not reach stay buffered and are
    /// yielded by the next call.
    pub fn feed(&mut self, bytes: &[u8]) -> Frames<'_> {
        self.buf.extend_from_slice(bytes);
        Frames { decoder: self }
    }

    /// Bytes held for an incomplete frame.
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    fn discard(&mut self, n: usize) {
        self.buf.drain(..n);
        self.scanned = 0;
    }

    fn next_frame(&mut self) -> Option<Result<Message, FramingError>> {
        if self.skip > 0 {
            let n = self.skip.min(self.buf.len());
            self.discard(n);
            self.skip -= n;
            if self.skip > 0 {
                return None;
            }
        }

        let Some(header_end) = find(&self.buf, HEADER_SEPARATOR) else {
            return self.discard_garbage();
        };
        let body_start = header_end + HEADER_SEPARATOR.len();

        let declared = match parse_content_length(&self.buf[..header_end]) {
            Ok(len) => len,
            Err(e) => {
                // Junk glued in front of a real header line: resume at that line.
                let resync = find_header_line(&self.buf[1..header_end + 2]).map(|pos| pos + 1);
                self.discard(resync.unwrap_or(body_start));
                return Some(Err(e));
            }
        };

        if declared > MAX_FRAME_BYTES {
            self.discard(body_start);
            self.skip = declared;
            return Some(Err(FramingError::Oversized(declared)));
        }

        let available = self.buf.len() - body_start;
        let window_end = declared.min(available);
        let window_start = self.scanned.min(window_end);
        // A header line starting inside the payload may run past its end.
        match scan_header_line(
            &self.buf[body_start + window_start..],
            window_end - window_start,
        ) {
            HeaderScan::Complete(pos) => {
                let found = window_start + pos;
                self.discard(body_start + found);
                return Some(Err(FramingError::Truncated { declared, found }));
            }
            HeaderScan::Partial(pos) => {
                self.scanned = window_start + pos;
                return None;
            }
            HeaderScan::Absent => {}
        }

        if available < declared {
            self.scanned = available.saturating_sub(RESCAN_OVERLAP);
            return None;
        }

        let frame_end = body_start + declared;
        let result = parse_payload(&self.buf[body_start..frame_end]);
        self.discard(frame_end);
        Some(result)
    }

    /// With no separator in sight, only a bounded amount of header is kept.
    fn discard_garbage(&mut self) -> Option<Result<Message, FramingError>> {
        if self.buf.len() <= MAX_HEADER_BYTES {
            return None;
        }
        let len = self.buf.len();
        // Keep a tail that may be the start of a header split across feeds.
        let partial_marker = (1..CONTENT_LENGTH_MARKER.len())
            .rev()
            .find(|&k| self.buf[len - k..].eq_ignore_ascii_case(&CONTENT_LENGTH_MARKER[..k]))
            .unwrap_or(0);
        let keep_from = find_ascii_case_insensitive(&self.buf[1..], CONTENT_LENGTH_MARKER)
            .map_or(len - partial_marker, |pos| pos + 1);
        self.discard(keep_from);
        Some(Err(FramingError::Garbage(keep_from)))
    }
}

/// Lazy sequence of decoded frames, borrowed from a [`FrameDecoder`].
pub struct Frames<'a> {
    decoder: &'a mut FrameDecoder,
}

impl Iterator for Frames<'_> {
    type Item = Result<Message, FramingError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.decoder.next_frame()
    }
}

fn parse_content_length(header: &[u8]) -> Result<usize, FramingError> {
    let header = String::from_utf8_lossy(header);
    for line in header.split("\r\n") {
        // Header names are case-insensitive.
        if let Some((key, value)) = line.split_once(':')
            && key.trim().eq_ignore_ascii_case("Content-Length")
        {
            let value = value.trim();
            return value
                .parse()
                .map_err(|_| FramingError::InvalidContentLength(value.to_string()));
        }
        // Ignore other headers (e.g. Content-Type)
    }
    Err(FramingError::MissingContentLength)
}

fn parse_payload(body: &[u8]) -> Result<Message, FramingError> {
    let value: serde_json::Value =
        serde_json::from_slice(body).map_err(|e| FramingError::InvalidJson(e.to_string()))?;
    Ok(Message::from_value(value)?)
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

fn find_ascii_case_insensitive(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window.eq_ignore_ascii_case(needle))
}

enum HeaderScan {
    /// A complete `Content-Length: <digits>\r\n` line starts here.
    Complete(usize),
    /// A header line may start here but the buffer ends before it does.
    Partial(usize),
    Absent,
}

/// Look for a `Content-Length: <digits>\r\n` line starting before `limit`.
///
/// The line itself may extend past `limit`. Valid JSON can never contain
/// one: raw CR/LF are illegal inside strings and the text is not a JSON
/// token outside them.
fn scan_header_line(haystack: &[u8], limit: usize) -> HeaderScan {
    let marker_len = CONTENT_LENGTH_MARKER.len();
    for start in 0..limit.min(haystack.len()) {
        let rest = &haystack[start..];
        if rest.len() < marker_len {
            if rest.eq_ignore_ascii_case(&CONTENT_LENGTH_MARKER[..rest.len()]) {
                return HeaderScan::Partial(start);
            }
            continue;
        }
        if !rest[..marker_len].eq_ignore_ascii_case(CONTENT_LENGTH_MARKER) {
            continue;
        }
        let value = &rest[marker_len..];
        let value_len = value
            .iter()
            .take_while(|b| b.is_ascii_digit() || **b == b' ' || **b == b'\t')
            .count();
        let tail = &value[value_len..];
        if tail.is_empty() || tail == b"\r" {
            return HeaderScan::Partial(start);
        }
        if value[..value_len].iter().any(u8::is_ascii_digit) && tail.starts_with(b"\r\n") {
            return HeaderScan::Complete(start);
        }
    }
    HeaderScan::Absent
}

/// Locate a complete `Content-Length: <digits>\r\n` line.
fn find_header_line(haystack: &[u8]) -> Option<usize> {
    match scan_header_line(haystack, haystack.len()) {
        HeaderScan::Complete(pos) => Some(pos),
        HeaderScan::Partial(_) | HeaderScan::Absent => None,
    }
}

/// Writes JSON-RPC frames to an async writer.
pub struct FrameWriter<W> {
    writer: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    /// Write one framed message and flush it.
    pub async fn write_message(&mut self, message: &Message) -> Result<()> {
        let frame = encode(message).context("serializing JSON-RPC frame")?;
        self.writer
            .write_all(&frame)
            .await
            .context("writing frame")?;
        self.writer.flush().await.context("flushing frame")?;
        Ok(())
    }

    /// Shut down the underlying writer, closing the peer's input.
    pub async fn close(&mut self) -> Result<()> {
        self.writer.shutdown().await.context("closing writer")
    }
}
