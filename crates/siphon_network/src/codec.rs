//! NUL-delimited frame codec for the post-handshake byte stream.
//!
//! Every frame is UTF-8 JSON terminated by a single `\0`. Frames are
//! returned raw so that a frame which fails to decode never disturbs the
//! position of the frames after it.
//!
//! Frames longer than the configured limit are skipped with a warning
//! rather than killing the connection.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::warn;

const DELIMITER: u8 = b'\0';

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("Outbound frame contains a NUL byte")]
    EmbeddedNul,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug)]
pub struct FrameCodec {
    max_frame_len: usize,
    /// Bytes already scanned without finding a delimiter.
    scanned: usize,
    /// Discarding the tail of an oversized frame until the next delimiter.
    skipping: bool,
}

impl FrameCodec {
    pub fn new(max_frame_len: usize) -> Self {
        Self {
            max_frame_len,
            scanned: 0,
            skipping: false,
        }
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(1024 * 1024)
    }
}

impl Decoder for FrameCodec {
    type Item = Bytes;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            let found = src[self.scanned..].iter().position(|b| *b == DELIMITER);

            let Some(offset) = found else {
                if self.skipping {
                    src.clear();
                    self.scanned = 0;
                } else if src.len() > self.max_frame_len {
                    warn!(bytes = src.len(), "codec: frame exceeds limit, skipping");
                    src.clear();
                    self.scanned = 0;
                    self.skipping = true;
                } else {
                    self.scanned = src.len();
                }
                return Ok(None);
            };

            let pos = self.scanned + offset;
            self.scanned = 0;

            if self.skipping {
                src.advance(pos + 1);
                self.skipping = false;
                warn!(bytes = pos, "codec: finished skipping oversized frame tail");
                continue;
            }

            if pos > self.max_frame_len {
                warn!(bytes = pos, "codec: skipped oversized frame");
                src.advance(pos + 1);
                continue;
            }

            let frame = src.split_to(pos).freeze();
            src.advance(1);
            return Ok(Some(frame));
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(src)? {
            Some(frame) => Ok(Some(frame)),
            None => {
                if !src.is_empty() {
                    warn!(bytes = src.len(), "codec: discarding unterminated frame at EOF");
                    src.clear();
                }
                self.scanned = 0;
                Ok(None)
            }
        }
    }
}

impl Encoder<String> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, item: String, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if item.as_bytes().contains(&DELIMITER) {
            return Err(FrameError::EmbeddedNul);
        }
        dst.reserve(item.len() + 1);
        dst.put_slice(item.as_bytes());
        dst.put_u8(DELIMITER);
        Ok(())
    }
}
