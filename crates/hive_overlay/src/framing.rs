//! Stream framing — recover discrete JSON messages from a TCP byte stream.
//!
//! Messages go on the wire as compact JSON objects written back to back, so
//! consecutive messages are separated by the two-byte sequence `}{` (the
//! closing brace of one object followed by the opening brace of the next).
//! The same sequence may also occur inside a string value, so a split on it
//! is only a guess: a fragment that fails to parse is merged with the next
//! one and retried. A trailing fragment that is merely incomplete is kept
//! for the next chunk.
//!
//! The decoder works on raw bytes. `}` and `{` never occur inside a
//! multi-byte UTF-8 sequence, so a chunk boundary may fall anywhere.

use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::NetworkError;

/// The byte sequence found between two consecutive messages.
pub const SPLIT_SEQUENCE: &[u8] = b"}{";

/// Serialize one message for the wire.
pub fn encode<T: Serialize>(message: &T) -> Result<Vec<u8>, NetworkError> {
    let bytes = serde_json::to_vec(message)?;
    if bytes.first() != Some(&b'{') || bytes.last() != Some(&b'}') {
        return Err(NetworkError::Protocol(
            "only JSON objects can be framed".to_string(),
        ));
    }
    Ok(bytes)
}

/// Long-lived per-connection decoder.
///
/// Feed it chunks as they arrive with [`feed`](FrameDecoder::feed) and pull
/// decoded messages with [`next_frame`](FrameDecoder::next_frame) (or by
/// iterating). Once drained it yields `None` until more bytes are fed.
#[derive(Debug)]
pub struct FrameDecoder {
    buf: Vec<u8>,
    /// Start of the split search. Every candidate prefix ending before this
    /// offset has already failed to parse, and keeps failing until the
    /// buffer is drained.
    scan_from: usize,
    max_frame_bytes: usize,
}

impl FrameDecoder {
    /// Create a decoder that gives up on a single frame once it grows past
    /// `max_frame_bytes`.
    pub fn new(max_frame_bytes: usize) -> Self {
        Self {
            buf: Vec::new(),
            scan_from: 0,
            max_frame_bytes,
        }
    }

    /// Append a chunk of raw bytes.
    pub fn feed(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Number of bytes held back waiting for the rest of a frame.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Decode the next complete message, if the buffer holds one.
    ///
    /// `Some(Err(_))` reports a fragment that can never become valid JSON.
    /// Those bytes are dropped up to the next delimiter and decoding resumes
    /// from there on the following call.
    pub fn next_frame(&mut self) -> Option<Result<Value, NetworkError>> {
        if self.buf.iter().all(u8::is_ascii_whitespace) {
            self.reset();
            return None;
        }

        // Try every new delimiter as a potential message end, merging
        // fragments until one parses.
        while let Some(pos) = find_split(&self.buf, self.scan_from) {
            let end = pos + 1;
            if let Ok(value) = serde_json::from_slice::<Value>(&self.buf[..end]) {
                self.drain(end);
                return Some(Ok(value));
            }
            self.scan_from = end;
        }

        match serde_json::from_slice::<Value>(&self.buf) {
            Ok(value) => {
                self.reset();
                Some(Ok(value))
            }
            Err(e) if e.is_eof() => {
                if self.buf.len() > self.max_frame_bytes {
                    let dropped = self.buf.len();
                    self.reset();
                    warn!("Dropping oversized frame ({dropped} bytes)");
                    return Some(Err(NetworkError::Decode(format!(
                        "frame exceeds {} bytes",
                        self.max_frame_bytes
                    ))));
                }
                debug!("Holding {} bytes of incomplete frame", self.buf.len());
                None
            }
            Err(e) => {
                let dropped = match find_split(&self.buf, 0) {
                    Some(pos) => pos + 1,
                    None => self.buf.len(),
                };
                self.drain(dropped);
                Some(Err(NetworkError::Decode(format!(
                    "{e} (discarded {dropped} bytes)"
                ))))
            }
        }
    }

    fn drain(&mut self, len: usize) {
        self.buf.drain(..len);
        self.scan_from = 0;
    }

    fn reset(&mut self) {
        self.buf.clear();
        self.scan_from = 0;
    }
}

impl Iterator for FrameDecoder {
    type Item = Result<Value, NetworkError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_frame()
    }
}

/// Index of the `}` of the first split sequence at or after `from`.
fn find_split(buf: &[u8], from: usize) -> Option<usize> {
    buf.get(from..)?
        .windows(SPLIT_SEQUENCE.len())
        .position(|w| w == SPLIT_SEQUENCE)
        .map(|p| p + from)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
