//! Stub server loop: serve one connection until it closes.
//!
//! A stub binds one [`Connection`] to one service implementation. The loop
//! reads a request, dispatches it, writes the reply, and repeats. Requests on
//! one stub are served strictly one at a time.
//!
//! Termination is classified from the error the wait primitive returns:
//! - [`ServeError::ConnectionClosed`]: peer went away, normal exit
//! - [`ServeError::Transport`]: anything else, logged as an error
//!
//! Handler failures are not loop failures; they travel back as error replies.

use std::io;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::{SinkExt, StreamExt};
use tokio_util::sync::CancellationToken;

use crate::bridge::protocol::{CallError, ConnectionId, Interface, Reply, StubId};
use crate::bridge::transport::{Connection, FrameReader, FrameWriter};

/// Implementation of interface `I`.
#[async_trait]
pub trait Service<I: Interface>: Send + Sync + 'static {
    async fn handle(&self, request: I::Request) -> Result<I::Response, CallError>;
}

/// Why serving a request stopped.
#[derive(Debug, thiserror::Error)]
pub enum ServeError {
    /// The connection was closed cooperatively by either side.
    #[error("connection closed")]
    ConnectionClosed,

    /// Malformed input or any other I/O failure.
    #[error("transport failure: {0}")]
    Transport(#[source] io::Error),
}

impl ServeError {
    /// Map an I/O error from the connection onto the two termination kinds.
    pub fn classify(error: io::Error) -> Self {
        match error.kind() {
            io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted => Self::ConnectionClosed,
            _ => Self::Transport(error),
        }
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, Self::ConnectionClosed)
    }
}

/// How a stub loop ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopExit {
    /// Peer closed the connection.
    ConnectionClosed,
    /// The owner closed the stub (Quit).
    Closed,
    /// Abnormal termination.
    TransportFailure(String),
}

/// Live binding of one connection to one service implementation.
pub struct Stub<I: Interface, S> {
    id: StubId,
    connection: ConnectionId,
    service: S,
    reader: FrameReader<I::Request>,
    writer: FrameWriter<Reply<I::Response>>,
}

impl<I: Interface, S: Service<I>> Stub<I, S> {
    pub fn new(connection: Connection, service: S) -> Self {
        let connection_id = connection.id();
        let (reader, writer) = connection.into_framed();
        Self {
            id: StubId::new(),
            connection: connection_id,
            service,
            reader,
            writer,
        }
    }

    pub fn id(&self) -> StubId {
        self.id
    }

    /// Wait for one request, dispatch it and send the reply.
    pub async fn serve_request(&mut self) -> Result<(), ServeError> {
        let request = match self.reader.next().await {
            Some(Ok(request)) => request,
            Some(Err(e)) => return Err(ServeError::classify(e)),
            None => return Err(ServeError::ConnectionClosed),
        };

        tracing::trace!(stub = %self.id, interface = I::NAME, "Dispatching request");
        let result = self.service.handle(request).await;
        if let Err(ref e) = result {
            tracing::debug!(stub = %self.id, error = %e, "Request failed");
        }

        self.writer
            .send(Reply::from(result))
            .await
            .map_err(ServeError::classify)
    }
}

/// Serve `stub` until the connection ends or `close` fires.
pub async fn run_stub_loop<I, S>(mut stub: Stub<I, S>, close: CancellationToken) -> LoopExit
where
    I: Interface,
    S: Service<I>,
{
    tracing::debug!(stub = %stub.id, connection = %stub.connection, interface = I::NAME, "Stub loop starting");
    loop {
        tokio::select! {
            biased;

            _ = close.cancelled() => {
                tracing::debug!(stub = %stub.id, "Stub closed by owner");
                return LoopExit::Closed;
            }

            result = stub.serve_request() => match result {
                Ok(()) => continue,
                Err(ServeError::ConnectionClosed) => {
                    tracing::debug!(stub = %stub.id, "Connection closed");
                    return LoopExit::ConnectionClosed;
                }
                Err(e) => {
                    tracing::error!(stub = %stub.id, error = %e, "Stub loop failed");
                    return LoopExit::TransportFailure(e.to_string());
                }
            }
        }
    }
}

/// A stub whose interface type has been erased, ready to be launched.
pub struct BoundStub {
    id: StubId,
    interface: &'static str,
    run: Box<dyn FnOnce(CancellationToken) -> BoxFuture<'static, LoopExit> + Send>,
}

impl BoundStub {
    pub fn new<I, S>(connection: Connection, service: S) -> Self
    where
        I: Interface,
        S: Service<I>,
    {
        let stub = Stub::<I, S>::new(connection, service);
        let id = stub.id();
        Self {
            id,
            interface: I::NAME,
            run: Box::new(move |close| Box::pin(run_stub_loop(stub, close))),
        }
    }

    pub fn id(&self) -> StubId {
        self.id
    }

    pub fn interface(&self) -> &'static str {
        self.interface
    }

    pub(crate) fn into_future(self, close: CancellationToken) -> BoxFuture<'static, LoopExit> {
        (self.run)(close)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::local::Proxy;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;

    /// Test interface: returns the length of the string, rejects empty input.
    pub(crate) struct Measure;

    impl Interface for Measure {
        const NAME: &'static str = "test.Measure";
        type Request = String;
        type Response = usize;
    }

    #[derive(Default)]
    pub(crate) struct MeasureService {
        pub calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Service<Measure> for MeasureService {
        async fn handle(&self, request: String) -> Result<usize, CallError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if request.is_empty() {
                return Err(CallError::bad_request("empty input"));
            }
            Ok(request.len())
        }
    }

    fn spawn_loop(
        connection: Connection,
        close: CancellationToken,
    ) -> tokio::task::JoinHandle<LoopExit> {
        let stub = Stub::<Measure, _>::new(connection, MeasureService::default());
        tokio::spawn(run_stub_loop(stub, close))
    }

    #[test]
    fn classify_maps_closure_kinds() {
        for kind in [
            io::ErrorKind::BrokenPipe,
            io::ErrorKind::ConnectionReset,
            io::ErrorKind::ConnectionAborted,
        ] {
            assert!(ServeError::classify(io::Error::from(kind)).is_closed());
        }
        assert!(!ServeError::classify(io::Error::from(io::ErrorKind::InvalidData)).is_closed());
    }

    #[tokio::test]
    async fn serves_until_peer_closes() {
        let (server, client) = Connection::pair().unwrap();
        let handle = spawn_loop(server, CancellationToken::new());

        let mut proxy = Proxy::<Measure>::new(client);
        assert_eq!(proxy.call("abc".to_string()).await.unwrap(), 3);
        assert_eq!(proxy.call("TestMessage".to_string()).await.unwrap(), 11);
        proxy.close();

        assert_eq!(handle.await.unwrap(), LoopExit::ConnectionClosed);
    }

    #[tokio::test]
    async fn handler_error_does_not_end_loop() {
        let (server, client) = Connection::pair().unwrap();
        let handle = spawn_loop(server, CancellationToken::new());

        let mut proxy = Proxy::<Measure>::new(client);
        let err = proxy.call(String::new()).await.unwrap_err();
        assert!(err.to_string().contains("empty input"));
        assert_eq!(proxy.call("x".to_string()).await.unwrap(), 1);
        proxy.close();

        assert_eq!(handle.await.unwrap(), LoopExit::ConnectionClosed);
    }

    #[tokio::test]
    async fn malformed_frame_is_transport_failure() {
        let (server, client) = Connection::pair().unwrap();
        let handle = spawn_loop(server, CancellationToken::new());

        let mut stream = client.into_stream();
        stream.write_all(&[0, 0, 0, 3, b'{', b'{', b'{']).await.unwrap();

        match handle.await.unwrap() {
            LoopExit::TransportFailure(_) => {}
            other => panic!("expected transport failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn close_token_unblocks_idle_loop() {
        let (server, _client) = Connection::pair().unwrap();
        let close = CancellationToken::new();
        let handle = spawn_loop(server, close.clone());

        close.cancel();
        let exit = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("loop did not stop")
            .unwrap();
        assert_eq!(exit, LoopExit::Closed);
    }

    #[tokio::test]
    async fn bound_stub_keeps_interface_name() {
        let (server, client) = Connection::pair().unwrap();
        let bound = BoundStub::new::<Measure, _>(server, MeasureService::default());
        assert_eq!(bound.interface(), "test.Measure");

        let handle = tokio::spawn(bound.into_future(CancellationToken::new()));
        drop(client);
        assert_eq!(handle.await.unwrap(), LoopExit::ConnectionClosed);
    }
}
