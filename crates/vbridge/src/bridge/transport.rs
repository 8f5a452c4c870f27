//! Local-transport connections.
//!
//! A [`Connection`] is one end of a Unix socket pair. The runtime hands the
//! server end to the application that offers the service and the client end
//! to the caller.

use std::io;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::net::UnixStream;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio_util::codec::{FramedRead, FramedWrite};

use super::codec::JsonCodec;
use super::protocol::ConnectionId;

pub type FrameReader<T> = FramedRead<OwnedReadHalf, JsonCodec<T>>;
pub type FrameWriter<T> = FramedWrite<OwnedWriteHalf, JsonCodec<T>>;

/// One end of a local-transport channel.
#[derive(Debug)]
pub struct Connection {
    id: ConnectionId,
    stream: UnixStream,
}

impl Connection {
    /// Create both ends of a new channel. Both ends share one id.
    pub fn pair() -> io::Result<(Connection, Connection)> {
        let (a, b) = UnixStream::pair()?;
        let id = ConnectionId::new();
        tracing::trace!(connection = %id, "Created connection pair");
        Ok((Connection { id, stream: a }, Connection { id, stream: b }))
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Split into a typed frame reader and writer.
    pub fn into_framed<In, Out>(self) -> (FrameReader<In>, FrameWriter<Out>)
    where
        In: DeserializeOwned,
        Out: Serialize,
    {
        let (read_half, write_half) = self.stream.into_split();
        (
            FramedRead::new(read_half, JsonCodec::new()),
            FramedWrite::new(write_half, JsonCodec::new()),
        )
    }

    /// Raw stream, for tests that need to write malformed bytes.
    pub fn into_stream(self) -> UnixStream {
        self.stream
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::{SinkExt, StreamExt};

    #[tokio::test]
    async fn pair_ends_share_id_and_carry_frames() {
        let (a, b) = Connection::pair().unwrap();
        assert_eq!(a.id(), b.id());

        let (_a_reader, mut a_writer) = a.into_framed::<String, String>();
        let (mut b_reader, _b_writer) = b.into_framed::<String, String>();

        a_writer.send("hello".to_string()).await.unwrap();
        let got = b_reader.next().await.unwrap().unwrap();
        assert_eq!(got, "hello");
    }

    #[tokio::test]
    async fn dropping_one_end_ends_the_other_stream() {
        let (a, b) = Connection::pair().unwrap();
        drop(a);

        let (mut reader, _writer) = b.into_framed::<String, String>();
        assert!(reader.next().await.is_none());
    }
}
