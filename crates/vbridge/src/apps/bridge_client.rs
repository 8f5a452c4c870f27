//! Application bridging local echo calls to the remote server.

use std::sync::{Arc, OnceLock};

use async_trait::async_trait;

use crate::config::BridgeConfig;
use crate::delegate::{CreateError, IncomingConnection, ServiceDelegate, ServiceRequest, SetupError};
use crate::handler::{BridgeHandler, RemoteEchoBridge, RemoteTarget};
use crate::local::ApplicationContext;
use crate::relay::{fetch_endpoint, fetch_root};
use crate::remote::{Blessings, RemoteClient, RemoteContext, RemoteInvoker};
use crate::stub::BoundStub;

/// Bridges [`RemoteEchoBridge`] calls to the server behind a relay.
///
/// Initialize asks the relay for the server's root blessings and endpoint,
/// then installs the root in a fresh remote context. Calls made before that
/// would be refused by the remote client as untrusted.
pub struct BridgeClient<R = RemoteClient> {
    relay_url: String,
    identity: String,
    invoker: Arc<R>,
    target: OnceLock<Arc<RemoteTarget>>,
}

impl BridgeClient<RemoteClient> {
    pub fn new(relay_url: impl Into<String>) -> Self {
        Self::with_invoker(relay_url, RemoteClient::new())
    }

    pub fn from_config(config: &BridgeConfig) -> Self {
        Self::new(config.relay_url.clone())
    }
}

impl<R: RemoteInvoker> BridgeClient<R> {
    pub fn with_invoker(relay_url: impl Into<String>, invoker: Arc<R>) -> Self {
        Self {
            relay_url: relay_url.into(),
            identity: "vbridge-client".to_string(),
            invoker,
            target: OnceLock::new(),
        }
    }

    /// Target established by Initialize.
    pub fn target(&self) -> Option<&Arc<RemoteTarget>> {
        self.target.get()
    }
}

#[async_trait]
impl<R: RemoteInvoker> ServiceDelegate for BridgeClient<R> {
    async fn initialize(&self, ctx: &ApplicationContext) -> Result<(), SetupError> {
        let blob = fetch_root(ctx, &self.relay_url)
            .await
            .map_err(|e| SetupError::relay(e.to_string()))?;
        let root = Blessings::decode(&blob)?;
        let remote = RemoteContext::init(&self.identity).with_root(root.clone());

        let endpoint = fetch_endpoint(ctx, &self.relay_url)
            .await
            .map_err(|e| SetupError::relay(e.to_string()))?;

        tracing::info!(app = ctx.url(), %endpoint, root = %root, "Bridge target installed");
        self.target
            .set(Arc::new(RemoteTarget {
                endpoint,
                ctx: remote,
            }))
            .map_err(|_| SetupError::internal("bridge client initialized twice"))
    }

    fn accept_connection(&self, connection: &mut IncomingConnection) {
        connection.provide::<RemoteEchoBridge>();
    }

    fn create(&self, request: ServiceRequest) -> Result<BoundStub, CreateError> {
        let target = self.target.get().ok_or(CreateError::NotReady("remote target"))?;
        request.bind::<RemoteEchoBridge, _>(BridgeHandler::new(
            Arc::clone(target),
            Arc::clone(&self.invoker),
        ))
    }

    async fn quit(&self) {
        self.invoker.close_all().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apps::EchoServer;
    use crate::delegate::{DelegateState, LifecycleError};
    use crate::handler::{EchoRequest, EchoResponse};
    use crate::local::{ConnectError, LocalRuntime};
    use crate::remote::ListenSpec;

    fn echo(value: &str) -> EchoRequest {
        EchoRequest::EchoOverRemote {
            value: value.to_string(),
        }
    }

    #[tokio::test]
    async fn bridges_to_relayed_server() {
        let runtime = LocalRuntime::new();
        let server = runtime
            .register("test:server", EchoServer::new(ListenSpec::default(), "server"))
            .unwrap();
        let bridge = runtime
            .register("test:bridge", BridgeClient::new("test:server"))
            .unwrap();

        let mut proxy = runtime
            .context_for("test:caller")
            .connect_to_service::<RemoteEchoBridge>("test:bridge")
            .await
            .unwrap();
        let response = proxy.call(echo("Hello, world!")).await.unwrap();
        assert_eq!(
            response,
            EchoResponse::Echoed {
                value: "Hello, world!".to_string()
            }
        );

        let target = bridge.delegate().target().unwrap();
        assert_eq!(Some(target.endpoint.clone()), server.delegate().endpoint());
        assert!(
            target
                .ctx
                .trusts(&server.delegate().context().unwrap().blessings())
        );

        runtime.shutdown().await;
        assert_eq!(bridge.state(), DelegateState::ShuttingDown);
        assert!(bridge.stubs().is_empty());
    }

    #[tokio::test]
    async fn quit_closes_remote_channels() {
        let runtime = LocalRuntime::new();
        runtime
            .register("test:server", EchoServer::new(ListenSpec::default(), "server"))
            .unwrap();
        let client = RemoteClient::new();
        runtime
            .register(
                "test:bridge",
                BridgeClient::with_invoker("test:server", Arc::clone(&client)),
            )
            .unwrap();

        let mut proxy = runtime
            .context_for("test:caller")
            .connect_to_service::<RemoteEchoBridge>("test:bridge")
            .await
            .unwrap();
        proxy.call(echo("ping")).await.unwrap();
        assert_eq!(client.open_channels(), 1);

        runtime.quit("test:bridge").await.unwrap();
        assert_eq!(client.open_channels(), 0);

        proxy.close();
        runtime.shutdown().await;
    }

    #[tokio::test]
    async fn missing_relay_fails_setup() {
        let runtime = LocalRuntime::new();
        runtime
            .register("test:bridge", BridgeClient::new("test:nowhere"))
            .unwrap();

        let err = runtime
            .context_for("test:caller")
            .connect_to_service::<RemoteEchoBridge>("test:bridge")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ConnectError::Lifecycle {
                source: LifecycleError::Setup(SetupError::Relay { .. }),
                ..
            }
        ));
        assert_eq!(
            runtime.state_of("test:bridge"),
            Some(DelegateState::ShuttingDown)
        );
    }
}
