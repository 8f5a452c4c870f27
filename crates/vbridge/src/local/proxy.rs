//! Typed client end of a local-transport connection.

use std::io;
use std::marker::PhantomData;

use futures::{SinkExt, StreamExt};

use crate::bridge::protocol::{CallError, ConnectionId, Interface, Reply};
use crate::bridge::transport::{Connection, FrameReader, FrameWriter};

#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    /// The service end went away before replying.
    #[error("connection closed")]
    Closed,

    #[error("transport error: {0}")]
    Transport(#[from] io::Error),

    /// The service answered with an error reply.
    #[error("call failed: {0}")]
    Call(#[from] CallError),

    /// The service answered with a response of the wrong shape.
    #[error("unexpected response to {0}")]
    UnexpectedResponse(&'static str),
}

/// Client for interface `I` over one connection. Calls are sequential.
pub struct Proxy<I: Interface> {
    connection: ConnectionId,
    reader: FrameReader<Reply<I::Response>>,
    writer: FrameWriter<I::Request>,
    _interface: PhantomData<I>,
}

impl<I: Interface> std::fmt::Debug for Proxy<I> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Proxy")
            .field("connection", &self.connection)
            .field("interface", &I::NAME)
            .finish_non_exhaustive()
    }
}

impl<I: Interface> Proxy<I> {
    pub fn new(connection: Connection) -> Self {
        let connection_id = connection.id();
        let (reader, writer) = connection.into_framed();
        Self {
            connection: connection_id,
            reader,
            writer,
            _interface: PhantomData,
        }
    }

    /// Send one request and wait for its reply.
    pub async fn call(&mut self, request: I::Request) -> Result<I::Response, ProxyError> {
        tracing::trace!(connection = %self.connection, interface = I::NAME, "Sending request");
        self.writer.send(request).await?;
        match self.reader.next().await {
            Some(Ok(reply)) => Ok(reply.into_result()?),
            Some(Err(e)) => Err(ProxyError::Transport(e)),
            None => Err(ProxyError::Closed),
        }
    }

    /// Close the connection. The service's stub loop sees a cooperative close.
    pub fn close(self) {
        tracing::trace!(connection = %self.connection, interface = I::NAME, "Closing proxy");
    }
}
