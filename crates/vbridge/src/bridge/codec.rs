//! Framed codec shared by the local and remote transports.
//!
//! LengthDelimitedCodec does the framing, serde_json the payload.
//! Works over any AsyncRead/AsyncWrite (socket pairs, TCP streams).

use std::io;
use std::marker::PhantomData;

use serde::{Serialize, de::DeserializeOwned};
use tokio_util::bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

/// Frames larger than this are rejected as malformed (8 MiB).
pub const MAX_FRAME_BYTES: usize = 8 * 1024 * 1024;

fn invalid_data(error: serde_json::Error) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, error)
}

/// Frames messages of type `T`: 4-byte big-endian length, then JSON.
pub struct JsonCodec<T> {
    frames: LengthDelimitedCodec,
    _message: PhantomData<fn() -> T>,
}

impl<T> Default for JsonCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> JsonCodec<T> {
    pub fn new() -> Self {
        let frames = LengthDelimitedCodec::builder()
            .length_field_length(4)
            .max_frame_length(MAX_FRAME_BYTES)
            .new_codec();
        Self {
            frames,
            _message: PhantomData,
        }
    }
}

impl<T: DeserializeOwned> Decoder for JsonCodec<T> {
    type Item = T;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> io::Result<Option<T>> {
        let Some(frame) = self.frames.decode(src)? else {
            return Ok(None);
        };
        serde_json::from_slice(&frame).map(Some).map_err(invalid_data)
    }
}

impl<T: Serialize> Encoder<T> for JsonCodec<T> {
    type Error = io::Error;

    fn encode(&mut self, message: T, dst: &mut BytesMut) -> io::Result<()> {
        let body = serde_json::to_vec(&message).map_err(invalid_data)?;
        tracing::trace!(frame_bytes = body.len(), "Encoding frame");
        self.frames.encode(Bytes::from(body), dst)
    }
}
