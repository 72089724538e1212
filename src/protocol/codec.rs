//! Resumable frame codec
//!
//! The transport may split a frame across any number of deliveries, or pack
//! several frames into one. `FrameCodec` keeps the undecoded remainder between
//! calls. Bare EOLs between frames are heart-beats and are reported separately
//! so they never reach application handlers.

use super::frame::{headers, Command, Frame};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Default upper bound on a single frame (headers and body)
pub const DEFAULT_MAX_FRAME_BYTES: usize = 1024 * 1024;

/// Malformed input. Non-fatal to the codec itself.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Unknown command: {0:?}")]
    UnknownCommand(String),
    #[error("Header section is not valid UTF-8")]
    InvalidUtf8,
    #[error("Malformed header line: {0:?}")]
    MalformedHeader(String),
    #[error("Invalid escape sequence in header: {0:?}")]
    InvalidEscape(String),
    #[error("Invalid {name} header: {value:?}")]
    InvalidHeader { name: String, value: String },
    #[error("Frame body is not terminated by NUL")]
    MissingTerminator,
    #[error("Frame exceeds {limit} bytes")]
    FrameTooLarge { limit: usize },
}

/// One decoded unit from the inbound stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    Frame(Frame),
    Heartbeat,
}

/// Where a rejected frame ends, when its headers said so
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Resync {
    /// Declared length checked out; drop exactly this many bytes
    Exact(usize),
    /// Declared body was not followed by NUL; drop the body then scan
    PastBody(usize),
}

#[derive(Debug)]
pub struct FrameCodec {
    buffer: BytesMut,
    max_frame_bytes: usize,
    /// Bytes of a rejected frame still to drop before anything else
    skip_bytes: usize,
    /// Dropping input up to the next NUL after an oversized or broken frame
    skipping: bool,
    /// Set by the parser just before it rejects a frame with a usable length
    rejected_end: Option<Resync>,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameCodec {
    pub fn new() -> Self {
        Self::with_max_frame_bytes(DEFAULT_MAX_FRAME_BYTES)
    }

    pub fn with_max_frame_bytes(max_frame_bytes: usize) -> Self {
        Self {
            buffer: BytesMut::new(),
            max_frame_bytes,
            skip_bytes: 0,
            skipping: false,
            rejected_end: None,
        }
    }

    /// Serialize a frame, adding `content-length` when a body is present
    pub fn encode(frame: &Frame) -> Bytes {
        let mut out = BytesMut::with_capacity(64 + frame.body.len());
        out.put_slice(frame.command.as_str().as_bytes());
        out.put_u8(b'\n');

        let escape = frame.command.escapes_headers();
        for (name, value) in &frame.headers {
            if escape {
                out.put_slice(escape_header(name).as_bytes());
                out.put_u8(b':');
                out.put_slice(escape_header(value).as_bytes());
            } else {
                out.put_slice(name.as_bytes());
                out.put_u8(b':');
                out.put_slice(value.as_bytes());
            }
            out.put_u8(b'\n');
        }
        if !frame.body.is_empty() && frame.get(headers::CONTENT_LENGTH).is_none() {
            out.put_slice(format!("{}:{}\n", headers::CONTENT_LENGTH, frame.body.len()).as_bytes());
        }

        out.put_u8(b'\n');
        out.put_slice(&frame.body);
        out.put_u8(0);
        out.freeze()
    }

    /// The wire form of a heart-beat
    pub fn heartbeat() -> Bytes {
        Bytes::from_static(b"\n")
    }

    /// Append a transport delivery to the carried-over remainder
    pub fn feed(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
    }

    /// Feed one chunk and decode the first complete unit, if any.
    /// Call [`FrameCodec::decode_next`] to drain further buffered frames.
    pub fn decode(&mut self, chunk: &[u8]) -> Result<Option<Decoded>, ProtocolError> {
        self.feed(chunk);
        self.decode_next()
    }

    /// Decode the next complete unit from the buffer. `Ok(None)` means the
    /// buffered bytes do not yet hold a complete frame.
    pub fn decode_next(&mut self) -> Result<Option<Decoded>, ProtocolError> {
        if !self.resync() {
            return Ok(None);
        }

        match self.parse_next() {
            Ok(decoded) => Ok(decoded),
            Err(e) => {
                self.discard_current();
                Err(e)
            }
        }
    }

    /// Bytes held waiting for the rest of a frame
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Forget any partial frame, used when a new transport replaces the old one
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.skip_bytes = 0;
        self.skipping = false;
        self.rejected_end = None;
    }

    /// Drop the frame that just failed to parse. A declared `content-length`
    /// locates its end even when the body holds NULs; otherwise the first
    /// NUL does.
    fn discard_current(&mut self) {
        match self.rejected_end.take() {
            Some(Resync::Exact(len)) => self.skip_bytes = len,
            Some(Resync::PastBody(len)) => {
                self.skip_bytes = len;
                self.skipping = true;
            }
            None => self.skipping = true,
        }
        self.resync();
    }

    /// Consume what is left of a rejected frame. Returns false while more
    /// input is needed to finish.
    fn resync(&mut self) -> bool {
        if self.skip_bytes > 0 {
            let n = self.skip_bytes.min(self.buffer.len());
            self.buffer.advance(n);
            self.skip_bytes -= n;
            if self.skip_bytes > 0 {
                return false;
            }
        }
        if self.skipping {
            match self.buffer.iter().position(|&b| b == 0) {
                Some(pos) => {
                    self.buffer.advance(pos + 1);
                    self.skipping = false;
                }
                None => {
                    self.buffer.clear();
                    return false;
                }
            }
        }
        true
    }

    fn check_limit(&self, len: usize) -> Result<(), ProtocolError> {
        if len > self.max_frame_bytes {
            Err(ProtocolError::FrameTooLarge {
                limit: self.max_frame_bytes,
            })
        } else {
            Ok(())
        }
    }

    fn parse_next(&mut self) -> Result<Option<Decoded>, ProtocolError> {
        let buf = &self.buffer[..];
        match buf.first() {
            None => return Ok(None),
            Some(b'\n') => {
                self.buffer.advance(1);
                return Ok(Some(Decoded::Heartbeat));
            }
            Some(b'\r') => match buf.get(1) {
                None => return Ok(None),
                Some(b'\n') => {
                    self.buffer.advance(2);
                    return Ok(Some(Decoded::Heartbeat));
                }
                Some(_) => {}
            },
            Some(_) => {}
        }

        let Some((head_end, body_start)) = find_header_end(buf) else {
            self.check_limit(buf.len())?;
            return Ok(None);
        };

        let head = std::str::from_utf8(&buf[..head_end]).map_err(|_| ProtocolError::InvalidUtf8)?;
        let mut lines = head.split('\n').map(|line| line.strip_suffix('\r').unwrap_or(line));
        let verb = lines.next().unwrap_or_default();
        let command =
            Command::parse(verb).ok_or_else(|| ProtocolError::UnknownCommand(verb.to_string()))?;

        let mut frame_headers = Vec::new();
        for line in lines {
            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| ProtocolError::MalformedHeader(line.to_string()))?;
            if command.escapes_headers() {
                frame_headers.push((unescape_header(name)?, unescape_header(value)?));
            } else {
                frame_headers.push((name.to_string(), value.to_string()));
            }
        }

        let content_length = frame_headers
            .iter()
            .find(|(name, _)| name == headers::CONTENT_LENGTH)
            .map(|(_, value)| {
                value
                    .trim()
                    .parse::<usize>()
                    .map_err(|_| ProtocolError::InvalidHeader {
                        name: headers::CONTENT_LENGTH.to_string(),
                        value: value.clone(),
                    })
            })
            .transpose()?;

        let body_end = match content_length {
            Some(len) => {
                // A declared length past usize is never a real frame;
                // resync falls back to the next NUL
                let total = body_start
                    .checked_add(len)
                    .and_then(|end| end.checked_add(1))
                    .ok_or(ProtocolError::FrameTooLarge {
                        limit: self.max_frame_bytes,
                    })?;
                if let Err(e) = self.check_limit(total) {
                    self.rejected_end = Some(Resync::Exact(total));
                    return Err(e);
                }
                let end = total - 1;
                match buf.get(end) {
                    None => return Ok(None),
                    Some(0) => end,
                    Some(_) => {
                        self.rejected_end = Some(Resync::PastBody(end));
                        return Err(ProtocolError::MissingTerminator);
                    }
                }
            }
            None => match buf[body_start..].iter().position(|&b| b == 0) {
                Some(offset) => body_start + offset,
                None => {
                    self.check_limit(buf.len())?;
                    return Ok(None);
                }
            },
        };
        self.check_limit(body_end + 1)?;

        let mut raw = self.buffer.split_to(body_end + 1);
        raw.truncate(body_end);
        let body = raw.split_off(body_start).freeze();

        Ok(Some(Decoded::Frame(Frame {
            command,
            headers: frame_headers,
            body,
        })))
    }
}

/// Locate the blank line ending the header section.
/// Returns (end of header text, start of body).
fn find_header_end(buf: &[u8]) -> Option<(usize, usize)> {
    for (i, &b) in buf.iter().enumerate() {
        if b != b'\n' {
            continue;
        }
        match buf.get(i + 1) {
            Some(b'\n') => return Some((i, i + 2)),
            Some(b'\r') if buf.get(i + 2) == Some(&b'\n') => return Some((i, i + 3)),
            _ => {}
        }
    }
    None
}

fn escape_header(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            ':' => out.push_str("\\c"),
            other => out.push(other),
        }
    }
    out
}

fn unescape_header(raw: &str) -> Result<String, ProtocolError> {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        let unescaped = match chars.next() {
            Some('n') => '\n',
            Some('r') => '\r',
            Some('c') => ':',
            Some('\\') => '\\',
            _ => return Err(ProtocolError::InvalidEscape(raw.to_string())),
        };
        out.push(unescaped);
    }
    Ok(out)
}
