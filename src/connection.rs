use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use tokio::net::TcpStream;
use tokio_util::codec::Framed;
use uuid::Uuid;

use crate::codec::{CodecError, FrameCodec};
use crate::frame::Frame;

/// A client connection. Frames are decoded from the socket as bytes arrive and replies are encoded
/// straight back onto it.
pub struct Connection {
    pub id: Uuid,
    pub client_address: Option<SocketAddr>,
    // Data is read from the socket into the codec's read buffer. When a frame is parsed, the
    // corresponding data is removed from the buffer.
    stream: Framed<TcpStream, FrameCodec>,
}

impl Connection {
    pub fn new(stream: TcpStream) -> Connection {
        Connection::with_codec(stream, FrameCodec::default())
    }

    pub fn with_codec(stream: TcpStream, codec: FrameCodec) -> Connection {
        Connection {
            id: Uuid::new_v4(),
            client_address: stream.peer_addr().ok(),
            stream: Framed::new(stream, codec),
        }
    }

    /// Reads the next frame. `Ok(None)` means the peer closed the connection cleanly, between
    /// frames. Closing in the middle of a frame is an error.
    pub async fn read_frame(&mut self) -> Result<Option<Frame>, CodecError> {
        self.stream.next().await.transpose()
    }

    pub async fn write_frame(&mut self, frame: Frame) -> Result<(), CodecError> {
        self.stream.send(frame).await
    }

    /// Bytes read from the client so far.
    pub fn bytes_read(&self) -> u64 {
        self.stream.codec().consumed()
    }
}
