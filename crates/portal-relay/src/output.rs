//! Raw stream bytes to client output chunks.

use portal_exec::{FrameDecoder, FrameError, StreamType, Utf8Decoder};

/// Turns reads from an exec stream into text chunks, one per decoded unit.
#[derive(Debug)]
pub enum OutputDecoder {
    /// TTY mode: combined raw bytes.
    Raw(Utf8Decoder),
    /// Multiplexed frames, decoded per stream.
    Framed {
        frames: FrameDecoder,
        stdout: Utf8Decoder,
        stderr: Utf8Decoder,
    },
}

impl OutputDecoder {
    /// Decoder matching the exec's TTY mode.
    #[must_use]
    pub fn new(tty: bool) -> Self {
        if tty {
            Self::Raw(Utf8Decoder::new())
        } else {
            Self::Framed {
                frames: FrameDecoder::new(),
                stdout: Utf8Decoder::new(),
                stderr: Utf8Decoder::new(),
            }
        }
    }

    /// Decode one read. Empty chunks are skipped.
    ///
    /// # Errors
    /// Returns error if a frame header declares an oversized payload.
    pub fn decode(&mut self, bytes: &[u8]) -> Result<Vec<String>, FrameError> {
        let chunks = match self {
            Self::Raw(text) => vec![text.decode(bytes)],
            Self::Framed {
                frames,
                stdout,
                stderr,
            } => frames
                .decode(bytes)?
                .into_iter()
                .filter_map(|frame| match frame.stream {
                    StreamType::Stdout => Some(stdout.decode(&frame.payload)),
                    StreamType::Stderr => Some(stderr.decode(&frame.payload)),
                    _ => None,
                })
                .collect(),
        };
        Ok(chunks.into_iter().filter(|c| !c.is_empty()).collect())
    }

    /// Flush text held back for an unfinished UTF-8 sequence, once the
    /// stream has ended. A partial frame is discarded.
    pub fn finish(&mut self) -> Vec<String> {
        let tails = match self {
            Self::Raw(text) => vec![text.finish()],
            Self::Framed { stdout, stderr, .. } => vec![stdout.finish(), stderr.finish()],
        };
        tails.into_iter().filter(|c| !c.is_empty()).collect()
    }
}

#[cfg(test)]
mod tests {
    use portal_exec::encode_frame;

    use super::*;

    #[test]
    fn test_raw_mode_passes_bytes_through() {
        let mut decoder = OutputDecoder::new(true);
        assert_eq!(decoder.decode(b"$ ls\r\n").unwrap(), vec!["$ ls\r\n"]);
        assert!(decoder.decode(b"").unwrap().is_empty());
    }

    #[test]
    fn test_framed_mode_one_chunk_per_frame() {
        let mut decoder = OutputDecoder::new(false);
        let mut raw = encode_frame(StreamType::Stdout, b"file.txt\n").to_vec();
        raw.extend_from_slice(&encode_frame(StreamType::Stderr, b"warn\n"));
        assert_eq!(decoder.decode(&raw).unwrap(), vec!["file.txt\n", "warn\n"]);
    }

    #[test]
    fn test_framed_mode_carries_split_frame() {
        let mut decoder = OutputDecoder::new(false);
        let raw = encode_frame(StreamType::Stdout, b"hello");
        assert!(decoder.decode(&raw[..10]).unwrap().is_empty());
        assert_eq!(decoder.decode(&raw[10..]).unwrap(), vec!["hello"]);
    }

    #[test]
    fn test_finish_flushes_unfinished_sequence() {
        let mut decoder = OutputDecoder::new(true);
        assert_eq!(decoder.decode(b"ok \xe2\x82").unwrap(), vec!["ok "]);
        assert_eq!(decoder.finish(), vec!["\u{FFFD}"]);
        assert!(decoder.finish().is_empty());

        let mut framed = OutputDecoder::new(false);
        assert!(framed.decode(&encode_frame(StreamType::Stderr, b"\xc3")).unwrap().is_empty());
        assert_eq!(framed.finish(), vec!["\u{FFFD}"]);
    }
}
