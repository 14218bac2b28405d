use bytes::{Buf, BufMut, BytesMut};
use std::io::Cursor;
use thiserror::Error as ThisError;
use tokio_util::codec::{Decoder, Encoder};

use crate::frame::{self, Frame};

/// Default upper bound for a single frame sitting in the read buffer.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 512 * 1024 * 1024;

#[derive(Debug, ThisError)]
pub enum CodecError {
    #[error(transparent)]
    Frame(#[from] frame::Error),
    #[error("protocol error; frame of at least {size} bytes exceeds the {limit} bytes limit")]
    FrameTooLarge { size: usize, limit: usize },
    #[error("protocol error; stream ended with {pending} bytes of an incomplete frame")]
    Truncated { pending: usize },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Streaming RESP codec. Decoding only consumes bytes once a whole frame is buffered, so input
/// can be split at any point by the network.
pub struct FrameCodec {
    max_frame_size: usize,
    // Total bytes consumed by decoded frames.
    consumed: u64,
}

impl FrameCodec {
    pub fn new(max_frame_size: usize) -> FrameCodec {
        FrameCodec {
            max_frame_size,
            consumed: 0,
        }
    }

    /// Number of bytes decoded so far, which is also the offset of the next frame in the stream.
    pub fn consumed(&self) -> u64 {
        self.consumed
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_SIZE)
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.is_empty() {
            return Ok(None);
        }

        let mut cursor = Cursor::new(&src[..]);
        let frame = match Frame::parse(&mut cursor) {
            Ok(frame) => frame,
            Err(frame::Error::Incomplete) => {
                // Check the frame size only while waiting for more data, to stop a peer from
                // making us buffer without bound.
                if src.len() > self.max_frame_size {
                    return Err(CodecError::FrameTooLarge {
                        size: src.len(),
                        limit: self.max_frame_size,
                    });
                }
                return Ok(None);
            }
            Err(err) => return Err(err.into()),
        };

        let position = cursor.position();

        // Remove the parsed frame from the buffer.
        src.advance(position as usize);
        self.consumed += position;

        Ok(Some(frame))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(src)? {
            Some(frame) => Ok(Some(frame)),
            None if src.is_empty() => Ok(None),
            None => Err(CodecError::Truncated { pending: src.len() }),
        }
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = CodecError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let bytes = frame.serialize();
        dst.reserve(bytes.len());
        dst.put_slice(&bytes);
        Ok(())
    }
}
