//! Resumable frame reassembly over an arbitrarily-chunked byte stream.
//!
//! Transports deliver bytes with no relationship to frame boundaries: one
//! read may hold half a frame, three frames, or the tail of one and the
//! head of the next. [`FrameReassembler`] accumulates chunks and carves out
//! complete, length-exact [`RawFrameImage`]s.
//!
//! Failures are values. A corrupt length field or lost sync surfaces as one
//! [`FramingError`] per incident, and the next call picks up scanning where
//! the error left off. Stopping mid-frame simply drops the reassembler;
//! partial frames are never emitted.

use std::sync::Arc;

use bytes::{Buf, BytesMut};
use tracing::trace;

use crate::codec::FrameCodec;
use crate::error::FramingError;
use crate::types::RawFrameImage;

/// Incremental frame extractor for one connection.
///
/// Feed bytes with [`push`](Self::push), then drain with
/// [`next_frame`](Self::next_frame) until it yields `Ok(None)`.
pub struct FrameReassembler {
    codec: Arc<dyn FrameCodec>,
    buf: BytesMut,
    /// Upper bound on a single frame's declared length.
    max_frame: usize,
    /// Hard cap on buffered bytes while no frame can be carved out.
    max_buffer: usize,
}

impl FrameReassembler {
    pub fn new(codec: Arc<dyn FrameCodec>, max_frame: usize) -> Self {
        let max_frame = max_frame.max(codec.min_frame_len());
        Self {
            codec,
            buf: BytesMut::with_capacity(4096),
            max_frame,
            max_buffer: max_frame.saturating_mul(4),
        }
    }

    /// Append a received chunk. Call [`next_frame`](Self::next_frame) in a
    /// loop afterwards; a single chunk may complete several frames.
    pub fn push(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Bytes currently held waiting for frame completion.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    /// Carve the next complete frame out of the buffer.
    ///
    /// `Ok(None)` means more bytes are needed. An `Err` reports exactly one
    /// framing incident; the buffer has already been advanced past it, so
    /// the caller counts the fault and calls again.
    pub fn next_frame(&mut self) -> Result<Option<RawFrameImage>, FramingError> {
        let Some(start) = self.codec.locate_sync(&self.buf) else {
            if self.buf.is_empty() {
                return Ok(None);
            }
            if self.buf.len() > self.max_buffer {
                self.buf.clear();
                return Err(FramingError::OversizedStream { limit: self.max_buffer });
            }
            let discarded = self.buf.len();
            self.buf.clear();
            return Err(FramingError::SyncLost { discarded });
        };

        if start > 0 {
            self.buf.advance(start);
            return Err(FramingError::SyncLost { discarded: start });
        }

        if self.buf.len() < self.codec.header_len() {
            return Ok(None);
        }

        let header = match self.codec.decode_header(&self.buf) {
            Ok(header) => header,
            Err(_) => {
                // Sync candidate turned out bogus once the full header
                // arrived; resume the search one byte later.
                self.buf.advance(1);
                return Err(FramingError::SyncLost { discarded: 1 });
            }
        };

        let declared = header.declared_len;
        if declared < self.codec.min_frame_len() || declared > self.max_frame {
            self.buf.advance(1);
            return Err(FramingError::InvalidFrameLength {
                declared,
                min: self.codec.min_frame_len(),
                max: self.max_frame,
            });
        }

        if self.buf.len() < declared {
            return Ok(None);
        }

        let image = self.buf.split_to(declared).freeze();
        trace!(
            frame_type = header.frame_type.name(),
            len = declared,
            device_id = header.device_id,
            "frame reassembled"
        );
        Ok(Some(RawFrameImage::new(image, header.frame_type)))
    }
}
