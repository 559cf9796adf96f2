use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::{Buf, BytesMut};
use tokio_util::codec::Decoder;

/// Re-encodes a non-UTF-8 byte stream to UTF-8 chunk by chunk.
///
/// Malformed sequences become U+FFFD; each chunk that needed a replacement
/// bumps the shared counter so the caller can report lossy input.
pub struct Transcoder {
    decoder: encoding_rs::Decoder,
    malformed: Arc<AtomicU64>,
    finished: bool,
}

impl Transcoder {
    pub fn new(encoding: &'static encoding_rs::Encoding, malformed: Arc<AtomicU64>) -> Self {
        Self {
            decoder: encoding.new_decoder(),
            malformed,
            finished: false,
        }
    }

    fn convert(&mut self, src: &mut BytesMut, last: bool) -> Option<BytesMut> {
        let capacity = self
            .decoder
            .max_utf8_buffer_length(src.len())
            .unwrap_or(src.len() * 3 + 4);
        let mut out = vec![0u8; capacity];
        let (_result, read, written, had_errors) = self.decoder.decode_to_utf8(src, &mut out, last);
        if had_errors {
            self.malformed.fetch_add(1, Ordering::Relaxed);
        }
        if last {
            src.clear();
        } else {
            src.advance(read);
        }
        (written > 0).then(|| BytesMut::from(&out[..written]))
    }
}

impl Decoder for Transcoder {
    type Item = BytesMut;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.is_empty() {
            return Ok(None);
        }
        // A lone partial sequence stays in the decoder until more bytes arrive.
        Ok(self.convert(src, false))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        // Called until it yields None; the decoder is flushed exactly once so
        // a truncated trailing sequence still becomes U+FFFD.
        if self.finished {
            src.clear();
            return Ok(None);
        }
        self.finished = true;
        Ok(self.convert(src, true))
    }
}
