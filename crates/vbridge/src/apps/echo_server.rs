//! Application owning the remote identity and serving `Echo`.

use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use serde_json::Value;

use crate::bridge::protocol::Endpoint;
use crate::config::BridgeConfig;
use crate::delegate::{CreateError, IncomingConnection, ServiceDelegate, ServiceRequest, SetupError};
use crate::handler::ECHO_METHOD;
use crate::local::ApplicationContext;
use crate::relay::{LocalRelay, RelayService, RelayState};
use crate::remote::{
    Authorizer, DispatchError, Dispatcher, ListenSpec, RemoteContext, RemoteServer,
};
use crate::stub::BoundStub;

/// Remote-side implementation of the echo method.
#[derive(Debug, Default)]
pub struct EchoDispatcher;

#[async_trait]
impl Dispatcher for EchoDispatcher {
    async fn dispatch(&self, method: &str, args: Value) -> Result<Value, DispatchError> {
        if method != ECHO_METHOD {
            return Err(DispatchError::UnknownMethod(method.to_string()));
        }
        match args {
            Value::String(value) => {
                tracing::debug!(%value, "Echo");
                Ok(Value::String(value))
            }
            other => Err(DispatchError::BadArguments(format!(
                "expected a string, got {other}"
            ))),
        }
    }
}

struct Running {
    server: RemoteServer,
    relay: Arc<RelayState>,
}

/// Owns a remote identity and server. Offers [`LocalRelay`] so local peers
/// can find and trust it.
pub struct EchoServer {
    listen: ListenSpec,
    identity: String,
    running: OnceLock<Running>,
}

impl EchoServer {
    pub fn new(listen: ListenSpec, identity: impl Into<String>) -> Self {
        Self {
            listen,
            identity: identity.into(),
            running: OnceLock::new(),
        }
    }

    pub fn from_config(config: &BridgeConfig) -> Self {
        Self::new(config.listen.clone(), config.identity.clone())
    }

    /// Remote context of the running server.
    pub fn context(&self) -> Option<&RemoteContext> {
        self.running.get().map(|r| r.server.context())
    }

    pub fn endpoint(&self) -> Option<Endpoint> {
        self.running.get().and_then(|r| r.relay.endpoint().ok())
    }
}

#[async_trait]
impl ServiceDelegate for EchoServer {
    async fn initialize(&self, ctx: &ApplicationContext) -> Result<(), SetupError> {
        let remote = RemoteContext::init(&self.identity);
        let relay = RelayState::new(Arc::clone(remote.principal()));
        let server = RemoteServer::new(remote);

        let endpoints = server
            .listen(&self.listen)
            .await
            .map_err(|e| SetupError::listen(e.to_string()))?;
        server
            .serve(Arc::new(EchoDispatcher), Authorizer::AllowEveryone)
            .map_err(|e| SetupError::serve(e.to_string()))?;

        let endpoint = endpoints
            .into_iter()
            .next()
            .ok_or_else(|| SetupError::listen("server reported no endpoints"))?;
        relay.publish_endpoint(endpoint.clone());

        if self.running.set(Running { server, relay }).is_err() {
            return Err(SetupError::internal("echo server initialized twice"));
        }
        tracing::info!(app = ctx.url(), %endpoint, identity = %self.identity, "Echo server listening");
        Ok(())
    }

    fn accept_connection(&self, connection: &mut IncomingConnection) {
        connection.provide::<LocalRelay>();
    }

    fn create(&self, request: ServiceRequest) -> Result<BoundStub, CreateError> {
        let running = self.running.get().ok_or(CreateError::NotReady("echo server"))?;
        request.bind::<LocalRelay, _>(RelayService::new(Arc::clone(&running.relay)))
    }

    async fn quit(&self) {
        if let Some(running) = self.running.get() {
            running.server.stop().await;
        }
    }
}
