//! Multiplexed exec stream framing.
//!
//! Non-TTY exec output arrives as frames, each preceded by an 8-byte header:
//!
//! ```text
//! [stream_type, 0, 0, 0, len_be[0], len_be[1], len_be[2], len_be[3]] payload...
//! ```
//!
//! `stream_type` is 0 (stdin), 1 (stdout) or 2 (stderr).

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Size of a frame header.
pub const HEADER_LEN: usize = 8;

/// Largest payload the buffering decoder accepts.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Stream a frame belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamType {
    Stdin,
    Stdout,
    Stderr,
    Unknown(u8),
}

impl From<u8> for StreamType {
    fn from(byte: u8) -> Self {
        match byte {
            0 => Self::Stdin,
            1 => Self::Stdout,
            2 => Self::Stderr,
            other => Self::Unknown(other),
        }
    }
}

impl From<StreamType> for u8 {
    fn from(stream: StreamType) -> Self {
        match stream {
            StreamType::Stdin => 0,
            StreamType::Stdout => 1,
            StreamType::Stderr => 2,
            StreamType::Unknown(other) => other,
        }
    }
}

/// Frame borrowed from a caller's buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameRef<'a> {
    pub stream: StreamType,
    pub payload: &'a [u8],
}

impl FrameRef<'_> {
    /// Payload as text, replacing invalid UTF-8.
    #[must_use]
    pub fn text(&self) -> String {
        String::from_utf8_lossy(self.payload).into_owned()
    }
}

/// Owned frame produced by [`FrameDecoder`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub stream: StreamType,
    pub payload: Bytes,
}

/// Framing error.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("Frame payload of {0} bytes exceeds limit")]
    TooLarge(usize),
}

/// Encode one frame.
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn encode_frame(stream: StreamType, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
    buf.put_u8(stream.into());
    buf.put_bytes(0, 3);
    buf.put_u32(payload.len() as u32);
    buf.put_slice(payload);
    buf.freeze()
}

fn declared_len(header: &[u8]) -> usize {
    u32::from_be_bytes([header[4], header[5], header[6], header[7]]) as usize
}

/// Lazily decode the complete frames of a single buffer.
///
/// Stops at the first truncated frame (fewer than 8 header bytes, or a
/// declared length past the end). Use [`FrameDecoder`] to carry the tail
/// over to the next read.
#[must_use]
pub const fn decode_frames(buf: &[u8]) -> Frames<'_> {
    Frames { buf }
}

/// Iterator returned by [`decode_frames`].
#[derive(Debug, Clone)]
pub struct Frames<'a> {
    buf: &'a [u8],
}

impl<'a> Iterator for Frames<'a> {
    type Item = FrameRef<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buf.len() < HEADER_LEN {
            return None;
        }
        let len = declared_len(self.buf);
        let end = HEADER_LEN.checked_add(len)?;
        if end > self.buf.len() {
            return None;
        }
        let frame = FrameRef {
            stream: StreamType::from(self.buf[0]),
            payload: &self.buf[HEADER_LEN..end],
        };
        self.buf = &self.buf[end..];
        Some(frame)
    }
}

/// Concatenate the payloads of every complete frame as text.
#[must_use]
pub fn demux_to_string(buf: &[u8]) -> String {
    decode_frames(buf).map(|f| f.text()).collect()
}

/// Buffering decoder for frames split across reads.
///
/// Incomplete trailing bytes are carried until the rest arrives.
#[derive(Debug)]
pub struct FrameDecoder {
    buf: BytesMut,
    max_frame_len: usize,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameDecoder {
    /// Create a decoder with the default payload limit.
    #[must_use]
    pub fn new() -> Self {
        Self::with_max_frame_len(MAX_FRAME_LEN)
    }

    /// Create a decoder with a custom payload limit.
    #[must_use]
    pub fn with_max_frame_len(max_frame_len: usize) -> Self {
        Self {
            buf: BytesMut::new(),
            max_frame_len,
        }
    }

    /// Append bytes read from the stream.
    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Take the next complete frame, if one is buffered.
    ///
    /// # Errors
    /// Returns `TooLarge` if a header declares a payload over the limit.
    pub fn next_frame(&mut self) -> Result<Option<Frame>, FrameError> {
        if self.buf.len() < HEADER_LEN {
            return Ok(None);
        }
        let len = declared_len(&self.buf);
        if len > self.max_frame_len {
            return Err(FrameError::TooLarge(len));
        }
        if self.buf.len() < HEADER_LEN + len {
            self.buf.reserve(HEADER_LEN + len - self.buf.len());
            return Ok(None);
        }
        let stream = StreamType::from(self.buf[0]);
        self.buf.advance(HEADER_LEN);
        let payload = self.buf.split_to(len).freeze();
        Ok(Some(Frame { stream, payload }))
    }

    /// Append bytes and drain every frame they complete.
    ///
    /// # Errors
    /// Returns `TooLarge` if a header declares a payload over the limit.
    pub fn decode(&mut self, bytes: &[u8]) -> Result<Vec<Frame>, FrameError> {
        self.extend(bytes);
        let mut frames = Vec::new();
        while let Some(frame) = self.next_frame()? {
            frames.push(frame);
        }
        Ok(frames)
    }

    /// Number of buffered bytes not yet part of a complete frame.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}
