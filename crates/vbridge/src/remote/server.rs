//! Remote-transport server over TCP.
//!
//! Flow:
//! 1. `listen` binds and starts the accept loop, returning the endpoints
//! 2. `serve` installs the dispatcher and authorizer
//! 3. Each connection: handshake, then calls answered in order
//! 4. `stop` ends the accept loop, cancels every open connection (including
//!    handshakes and in-flight dispatches) and waits for their tasks

use std::net::SocketAddr;
use std::sync::{Arc, Mutex as StdMutex, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

use crate::bridge::codec::JsonCodec;
use crate::bridge::protocol::Endpoint;

use super::protocol::{ClientFrame, ServerFrame};
use super::security::{Blessings, RemoteContext};

/// Pause after a failed accept, so a persistent error does not spin.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Where to listen. Port 0 picks a free port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenSpec {
    pub addr: String,
}

impl Default for ListenSpec {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:0".to_string(),
        }
    }
}

impl ListenSpec {
    pub fn new(addr: impl Into<String>) -> Self {
        Self { addr: addr.into() }
    }
}

/// Render the endpoint string for a bound TCP address.
pub fn tcp_endpoint(addr: SocketAddr) -> Endpoint {
    Endpoint::new(format!("@tcp@{addr}@@"))
}

/// Extract the TCP address from an endpoint or an object name (`/` + endpoint).
pub fn endpoint_addr(endpoint: &Endpoint) -> Option<&str> {
    let s = endpoint.as_str();
    let s = s.strip_prefix('/').unwrap_or(s);
    s.strip_prefix("@tcp@")?
        .strip_suffix("@@")
        .filter(|addr| !addr.is_empty())
}

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("server is already listening")]
    AlreadyListening,

    #[error("server is already serving")]
    AlreadyServing,

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("unknown method: {0}")]
    UnknownMethod(String),

    #[error("bad arguments: {0}")]
    BadArguments(String),

    #[error("{0}")]
    Failed(String),
}

/// Server-side implementation of remote methods.
#[async_trait]
pub trait Dispatcher: Send + Sync + 'static {
    async fn dispatch(
        &self,
        method: &str,
        args: serde_json::Value,
    ) -> Result<serde_json::Value, DispatchError>;
}

/// Which clients may call the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Authorizer {
    AllowEveryone,
    /// Only clients whose blessings the server's context trusts.
    TrustedOnly,
}

impl Authorizer {
    pub fn allows(&self, ctx: &RemoteContext, client: &Blessings) -> bool {
        match self {
            Self::AllowEveryone => true,
            Self::TrustedOnly => ctx.trusts(client),
        }
    }
}

struct Serving {
    dispatcher: Arc<dyn Dispatcher>,
    authorizer: Authorizer,
}

struct Shared {
    ctx: RemoteContext,
    serving: OnceLock<Serving>,
}

/// A remote-transport server bound to one security context.
pub struct RemoteServer {
    shared: Arc<Shared>,
    endpoints: OnceLock<Vec<Endpoint>>,
    stop: CancellationToken,
    accept_task: StdMutex<Option<JoinHandle<()>>>,
}

impl RemoteServer {
    pub fn new(ctx: RemoteContext) -> Self {
        Self {
            shared: Arc::new(Shared {
                ctx,
                serving: OnceLock::new(),
            }),
            endpoints: OnceLock::new(),
            stop: CancellationToken::new(),
            accept_task: StdMutex::new(None),
        }
    }

    pub fn context(&self) -> &RemoteContext {
        &self.shared.ctx
    }

    /// Bind and start accepting connections.
    pub async fn listen(&self, spec: &ListenSpec) -> Result<Vec<Endpoint>, ServerError> {
        if self.endpoints.get().is_some() {
            return Err(ServerError::AlreadyListening);
        }

        let bind_err = |source: std::io::Error| ServerError::Bind {
            addr: spec.addr.clone(),
            source,
        };
        let listener = TcpListener::bind(&spec.addr).await.map_err(bind_err)?;
        let local_addr = listener.local_addr().map_err(bind_err)?;
        let endpoints = vec![tcp_endpoint(local_addr)];
        if self.endpoints.set(endpoints.clone()).is_err() {
            return Err(ServerError::AlreadyListening);
        }

        let handle = tokio::spawn(accept_loop(
            listener,
            Arc::clone(&self.shared),
            self.stop.clone(),
        ));
        if let Ok(mut task) = self.accept_task.lock() {
            *task = Some(handle);
        }

        tracing::info!(endpoint = %endpoints[0], "Remote server listening");
        Ok(endpoints)
    }

    /// Endpoints, once `listen` has completed.
    pub fn endpoints(&self) -> Option<&[Endpoint]> {
        self.endpoints.get().map(Vec::as_slice)
    }

    pub fn serve(
        &self,
        dispatcher: Arc<dyn Dispatcher>,
        authorizer: Authorizer,
    ) -> Result<(), ServerError> {
        self.shared
            .serving
            .set(Serving {
                dispatcher,
                authorizer,
            })
            .map_err(|_| ServerError::AlreadyServing)?;
        tracing::debug!(?authorizer, "Remote server serving");
        Ok(())
    }

    /// Stop accepting, close every open connection and wait for the
    /// connection tasks to end. Idempotent.
    pub async fn stop(&self) {
        self.stop.cancel();
        let task = self.accept_task.lock().ok().and_then(|mut t| t.take());
        if let Some(task) = task {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "Accept loop ended abnormally");
            }
            tracing::info!("Remote server stopped");
        }
    }
}

impl Drop for RemoteServer {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

async fn accept_loop(listener: TcpListener, shared: Arc<Shared>, stop: CancellationToken) {
    let mut connections: Vec<JoinHandle<()>> = Vec::new();
    loop {
        tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    tracing::trace!(%peer, "Accepted remote connection");
                    connections.retain(|task| !task.is_finished());
                    connections.push(tokio::spawn(handle_connection(
                        stream,
                        peer,
                        Arc::clone(&shared),
                        stop.child_token(),
                    )));
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Accept failed");
                    if !back_off(&stop).await {
                        break;
                    }
                }
            }
        }
    }
    drop(listener);

    tracing::debug!(connections = connections.len(), "Closing remote connections");
    for task in connections {
        if let Err(e) = task.await {
            tracing::warn!(error = %e, "Remote connection task ended abnormally");
        }
    }
}

/// Wait out [`ACCEPT_BACKOFF`]. Returns false if the server stopped meanwhile.
async fn back_off(stop: &CancellationToken) -> bool {
    tokio::select! {
        biased;
        _ = stop.cancelled() => false,
        _ = tokio::time::sleep(ACCEPT_BACKOFF) => true,
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    shared: Arc<Shared>,
    stop: CancellationToken,
) {
    let (read_half, write_half) = stream.into_split();
    let mut reader = FramedRead::new(read_half, JsonCodec::<ClientFrame>::new());
    let mut writer = FramedWrite::new(write_half, JsonCodec::<ServerFrame>::new());

    let hello = tokio::select! {
        biased;
        _ = stop.cancelled() => return,
        frame = reader.next() => frame,
    };
    let client = match hello {
        Some(Ok(ClientFrame::Hello { blessings })) => blessings,
        Some(Ok(other)) => {
            tracing::warn!(%peer, frame = ?other, "Expected hello");
            return;
        }
        Some(Err(e)) => {
            tracing::warn!(%peer, error = %e, "Handshake failed");
            return;
        }
        None => return,
    };

    let Some(serving) = shared.serving.get() else {
        let _ = writer
            .send(ServerFrame::Rejected {
                reason: "server is not serving yet".to_string(),
            })
            .await;
        return;
    };

    if !serving.authorizer.allows(&shared.ctx, &client) {
        tracing::warn!(%peer, client = %client, "Client not authorized");
        let _ = writer
            .send(ServerFrame::Rejected {
                reason: format!("{client} is not authorized"),
            })
            .await;
        return;
    }

    let hello = ServerFrame::Hello {
        blessings: shared.ctx.blessings(),
    };
    if let Err(e) = writer.send(hello).await {
        tracing::warn!(%peer, error = %e, "Failed to send hello");
        return;
    }
    tracing::debug!(%peer, client = %client, "Remote handshake complete");

    loop {
        let frame = tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            frame = reader.next() => frame,
        };

        let (id, method, args) = match frame {
            Some(Ok(ClientFrame::Call { id, method, args })) => (id, method, args),
            Some(Ok(ClientFrame::Hello { .. })) => {
                tracing::warn!(%peer, "Unexpected hello after handshake");
                break;
            }
            Some(Err(e)) => {
                tracing::warn!(%peer, error = %e, "Remote connection error");
                break;
            }
            None => {
                tracing::trace!(%peer, "Remote connection closed");
                break;
            }
        };

        tracing::trace!(%peer, id, %method, "Dispatching remote call");
        let dispatched = tokio::select! {
            biased;
            _ = stop.cancelled() => {
                tracing::debug!(%peer, id, %method, "Abandoning remote call on stop");
                break;
            }
            dispatched = serving.dispatcher.dispatch(&method, args) => dispatched,
        };
        let response = match dispatched {
            Ok(output) => ServerFrame::Result { id, output },
            Err(e) => ServerFrame::Error {
                id,
                message: e.to_string(),
            },
        };
        if let Err(e) = writer.send(response).await {
            tracing::warn!(%peer, error = %e, "Failed to send remote response");
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::{RemoteClient, RemoteInvoker};
    use serde_json::{Value, json};
    use tokio::io::AsyncReadExt;
    use tokio::time::{Instant, timeout};

    struct Stall;

    #[async_trait]
    impl Dispatcher for Stall {
        async fn dispatch(&self, _method: &str, _args: Value) -> Result<Value, DispatchError> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(Value::Null)
        }
    }

    #[test]
    fn endpoint_addr_parses_tcp_endpoints() {
        let endpoint = tcp_endpoint("127.0.0.1:4000".parse().unwrap());
        assert_eq!(endpoint.as_str(), "@tcp@127.0.0.1:4000@@");
        assert_eq!(endpoint_addr(&endpoint), Some("127.0.0.1:4000"));

        let name = Endpoint::new("/@tcp@127.0.0.1:4000@@");
        assert_eq!(endpoint_addr(&name), Some("127.0.0.1:4000"));
    }

    #[test]
    fn endpoint_addr_rejects_other_shapes() {
        assert_eq!(endpoint_addr(&Endpoint::new("")), None);
        assert_eq!(endpoint_addr(&Endpoint::new("@tcp@@@")), None);
        assert_eq!(endpoint_addr(&Endpoint::new("127.0.0.1:4000")), None);
    }

    #[test]
    fn authorizer_policies() {
        let ctx = RemoteContext::init("server");
        let stranger = Blessings::self_signed("stranger");

        assert!(Authorizer::AllowEveryone.allows(&ctx, &stranger));
        assert!(!Authorizer::TrustedOnly.allows(&ctx, &stranger));
        assert!(Authorizer::TrustedOnly.allows(&ctx.with_root(stranger.clone()), &stranger));
    }

    #[tokio::test]
    async fn listen_twice_fails() {
        let server = RemoteServer::new(RemoteContext::init("server"));
        assert!(server.endpoints().is_none());

        let endpoints = server.listen(&ListenSpec::default()).await.unwrap();
        assert_eq!(endpoints.len(), 1);
        assert_eq!(server.endpoints(), Some(&endpoints[..]));
        assert!(matches!(
            server.listen(&ListenSpec::default()).await,
            Err(ServerError::AlreadyListening)
        ));
        server.stop().await;
    }

    #[tokio::test]
    async fn bind_failure_is_reported() {
        let server = RemoteServer::new(RemoteContext::init("server"));
        let err = server
            .listen(&ListenSpec::new("not-an-address"))
            .await
            .unwrap_err();
        assert!(matches!(err, ServerError::Bind { .. }));
    }

    #[tokio::test]
    async fn stop_closes_connections_waiting_for_hello() {
        let server = RemoteServer::new(RemoteContext::init("server"));
        let endpoints = server.listen(&ListenSpec::default()).await.unwrap();
        let addr = endpoint_addr(&endpoints[0]).unwrap().to_string();

        let mut silent = TcpStream::connect(&addr).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        timeout(Duration::from_secs(2), server.stop())
            .await
            .expect("stop waited on a silent peer");
        let mut buf = [0u8; 16];
        let read = timeout(Duration::from_secs(2), silent.read(&mut buf))
            .await
            .expect("connection left open after stop");
        assert!(matches!(read, Ok(0) | Err(_)));
    }

    #[tokio::test]
    async fn stop_abandons_in_flight_calls() {
        let server = RemoteServer::new(RemoteContext::init("server"));
        let endpoint = server.listen(&ListenSpec::default()).await.unwrap()[0].clone();
        server.serve(Arc::new(Stall), Authorizer::AllowEveryone).unwrap();
        let ctx = RemoteContext::init("client").with_root(server.context().blessings());

        let call = tokio::spawn(async move {
            let client = RemoteClient::new();
            client.invoke(&ctx, &endpoint, "Stall", json!(null)).await
        });
        tokio::time::sleep(Duration::from_millis(100)).await;

        timeout(Duration::from_secs(2), server.stop())
            .await
            .expect("stop waited on a stalled dispatch");
        let result = timeout(Duration::from_secs(2), call)
            .await
            .expect("caller never saw the connection close")
            .unwrap();
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn accept_back_off_pauses_unless_stopped() {
        let stop = CancellationToken::new();
        let started = Instant::now();
        assert!(back_off(&stop).await);
        assert!(started.elapsed() >= ACCEPT_BACKOFF);

        stop.cancel();
        let started = Instant::now();
        assert!(!back_off(&stop).await);
        assert!(started.elapsed() < ACCEPT_BACKOFF);
    }
}
