//! Remote-transport client.
//!
//! Idle channels are pooled per endpoint and client blessings, and a call
//! checks one out for its duration, so concurrent calls never wait on each
//! other and a channel only carries calls for the identity that opened it.
//! The server's blessings are checked against the calling context on every
//! invocation. A failed channel is dropped; nothing is retried.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::bridge::codec::JsonCodec;
use crate::bridge::protocol::Endpoint;

use super::protocol::{ClientFrame, ServerFrame};
use super::security::{Blessings, RemoteContext};
use super::server::endpoint_addr;

#[derive(Debug, thiserror::Error)]
pub enum RemoteError {
    #[error("bad endpoint: {0:?}")]
    BadEndpoint(String),

    #[error("failed to connect to {endpoint}: {source}")]
    Connect {
        endpoint: Endpoint,
        #[source]
        source: std::io::Error,
    },

    #[error("server {server} is not trusted")]
    Untrusted { server: String },

    #[error("server rejected the client: {0}")]
    Rejected(String),

    #[error("{method} failed: {message}")]
    Call { method: String, message: String },

    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    #[error("connection closed")]
    Closed,

    #[error("protocol error: {0}")]
    Protocol(String),
}

/// Invokes a method on a remote server.
#[async_trait]
pub trait RemoteInvoker: Send + Sync + 'static {
    async fn invoke(
        &self,
        ctx: &RemoteContext,
        endpoint: &Endpoint,
        method: &str,
        args: serde_json::Value,
    ) -> Result<serde_json::Value, RemoteError>;

    /// Drop every cached channel.
    async fn close_all(&self) {}
}

struct Channel {
    server: Blessings,
    reader: FramedRead<OwnedReadHalf, JsonCodec<ServerFrame>>,
    writer: FramedWrite<OwnedWriteHalf, JsonCodec<ClientFrame>>,
}

impl Channel {
    async fn open(ctx: &RemoteContext, endpoint: &Endpoint) -> Result<Self, RemoteError> {
        let addr = endpoint_addr(endpoint)
            .ok_or_else(|| RemoteError::BadEndpoint(endpoint.to_string()))?;
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|source| RemoteError::Connect {
                endpoint: endpoint.clone(),
                source,
            })?;

        let (read_half, write_half) = stream.into_split();
        let mut reader = FramedRead::new(read_half, JsonCodec::<ServerFrame>::new());
        let mut writer = FramedWrite::new(write_half, JsonCodec::<ClientFrame>::new());

        writer
            .send(ClientFrame::Hello {
                blessings: ctx.blessings(),
            })
            .await?;

        let server = match reader.next().await {
            Some(Ok(ServerFrame::Hello { blessings })) => blessings,
            Some(Ok(ServerFrame::Rejected { reason })) => return Err(RemoteError::Rejected(reason)),
            Some(Ok(other)) => {
                return Err(RemoteError::Protocol(format!(
                    "expected hello, got {other:?}"
                )));
            }
            Some(Err(e)) => return Err(e.into()),
            None => return Err(RemoteError::Closed),
        };
        tracing::debug!(%endpoint, server = %server, "Opened remote channel");

        Ok(Self {
            server,
            reader,
            writer,
        })
    }

    async fn call(
        &mut self,
        id: u64,
        method: &str,
        args: serde_json::Value,
    ) -> Result<serde_json::Value, RemoteError> {
        self.writer
            .send(ClientFrame::Call {
                id,
                method: method.to_string(),
                args,
            })
            .await?;

        match self.reader.next().await {
            Some(Ok(ServerFrame::Result { id: got, output })) if got == id => Ok(output),
            Some(Ok(ServerFrame::Error { id: got, message })) if got == id => {
                Err(RemoteError::Call {
                    method: method.to_string(),
                    message,
                })
            }
            Some(Ok(other)) => Err(RemoteError::Protocol(format!(
                "unexpected frame for call {id}: {other:?}"
            ))),
            Some(Err(e)) => Err(e.into()),
            None => Err(RemoteError::Closed),
        }
    }
}

/// Channels are only shared between callers with the same blessings.
type ChannelKey = (Endpoint, Blessings);

/// Client that pools idle channels per endpoint and identity.
#[derive(Default)]
pub struct RemoteClient {
    idle: StdMutex<HashMap<ChannelKey, Vec<Channel>>>,
    /// Bumped by `close_all`; channels checked out before then are not returned.
    generation: AtomicU64,
    next_id: AtomicU64,
}

impl RemoteClient {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Number of idle channels.
    pub fn open_channels(&self) -> usize {
        self.idle
            .lock()
            .map(|idle| idle.values().map(Vec::len).sum())
            .unwrap_or(0)
    }

    fn checkout(&self, key: &ChannelKey) -> Option<Channel> {
        let mut idle = self.idle.lock().ok()?;
        let channels = idle.get_mut(key)?;
        let channel = channels.pop();
        if channels.is_empty() {
            idle.remove(key);
        }
        channel
    }

    fn checkin(&self, key: ChannelKey, generation: u64, channel: Channel) {
        if self.generation.load(Ordering::Acquire) != generation {
            tracing::debug!(endpoint = %key.0, "Discarding channel closed during call");
            return;
        }
        if let Ok(mut idle) = self.idle.lock() {
            idle.entry(key).or_default().push(channel);
        }
    }
}

#[async_trait]
impl RemoteInvoker for RemoteClient {
    async fn invoke(
        &self,
        ctx: &RemoteContext,
        endpoint: &Endpoint,
        method: &str,
        args: serde_json::Value,
    ) -> Result<serde_json::Value, RemoteError> {
        let key = (endpoint.clone(), ctx.blessings());
        let generation = self.generation.load(Ordering::Acquire);

        let mut channel = match self.checkout(&key) {
            Some(channel) => channel,
            None => Channel::open(ctx, endpoint).await?,
        };

        if !ctx.trusts(&channel.server) {
            let server = channel.server.to_string();
            // Trust is per context; another context with these blessings may still use it.
            self.checkin(key, generation, channel);
            tracing::warn!(%endpoint, %server, "Refusing call to untrusted server");
            return Err(RemoteError::Untrusted { server });
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        match channel.call(id, method, args).await {
            Ok(output) => {
                self.checkin(key, generation, channel);
                Ok(output)
            }
            Err(e @ RemoteError::Call { .. }) => {
                self.checkin(key, generation, channel);
                Err(e)
            }
            Err(e) => {
                tracing::debug!(%endpoint, error = %e, "Dropping remote channel");
                Err(e)
            }
        }
    }

    async fn close_all(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
        let closed = self
            .idle
            .lock()
            .map(|mut idle| std::mem::take(&mut *idle))
            .unwrap_or_default();
        let count: usize = closed.values().map(Vec::len).sum();
        drop(closed);
        tracing::debug!(channels = count, "Closed remote channels");
    }
}
