//! Application that calls the bridge once at startup.

use std::sync::OnceLock;

use async_trait::async_trait;

use crate::delegate::{CreateError, IncomingConnection, ServiceDelegate, ServiceRequest, SetupError};
use crate::handler::{EchoRequest, EchoResponse, RemoteEchoBridge};
use crate::local::ApplicationContext;
use crate::stub::BoundStub;

/// Calls `EchoOverRemote` once during Initialize and keeps the answer.
/// Offers nothing to peers.
pub struct EchoCaller {
    bridge_url: String,
    message: String,
    echoed: OnceLock<String>,
}

impl EchoCaller {
    pub fn new(bridge_url: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            bridge_url: bridge_url.into(),
            message: message.into(),
            echoed: OnceLock::new(),
        }
    }

    /// The echoed message, once Initialize has completed.
    pub fn echoed(&self) -> Option<&str> {
        self.echoed.get().map(String::as_str)
    }
}

#[async_trait]
impl ServiceDelegate for EchoCaller {
    async fn initialize(&self, ctx: &ApplicationContext) -> Result<(), SetupError> {
        let mut bridge = ctx
            .connect_to_service::<RemoteEchoBridge>(&self.bridge_url)
            .await
            .map_err(|e| SetupError::internal(format!("connect to {}: {e}", self.bridge_url)))?;

        let response = bridge
            .call(EchoRequest::EchoOverRemote {
                value: self.message.clone(),
            })
            .await;
        bridge.close();

        let EchoResponse::Echoed { value } =
            response.map_err(|e| SetupError::internal(format!("echo failed: {e}")))?;
        tracing::info!(app = ctx.url(), sent = %self.message, received = %value, "Echo complete");
        if value != self.message {
            tracing::warn!(sent = %self.message, received = %value, "Echo mismatch");
        }

        self.echoed
            .set(value)
            .map_err(|_| SetupError::internal("echo caller initialized twice"))
    }

    fn accept_connection(&self, _connection: &mut IncomingConnection) {}

    fn create(&self, request: ServiceRequest) -> Result<BoundStub, CreateError> {
        Err(CreateError::NotOffered(request.service_name().to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apps::LocalEcho;
    use crate::local::{ConnectError, LocalRuntime};

    #[tokio::test]
    async fn records_the_echo() {
        let runtime = LocalRuntime::new();
        runtime.register("test:echo", LocalEcho).unwrap();
        let caller = runtime
            .register("test:caller", EchoCaller::new("test:echo", "Hello, world!"))
            .unwrap();

        runtime.start("test:caller").await.unwrap();
        assert_eq!(caller.delegate().echoed(), Some("Hello, world!"));
        runtime.shutdown().await;
    }

    #[tokio::test]
    async fn refuses_inbound_connections() {
        let runtime = LocalRuntime::new();
        runtime.register("test:echo", LocalEcho).unwrap();
        runtime
            .register("test:caller", EchoCaller::new("test:echo", "x"))
            .unwrap();

        let err = runtime
            .context_for("test:other")
            .connect_to_service::<RemoteEchoBridge>("test:caller")
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectError::ServiceNotOffered { .. }));
    }

    #[tokio::test]
    async fn missing_bridge_fails_setup() {
        let runtime = LocalRuntime::new();
        runtime
            .register("test:caller", EchoCaller::new("test:nowhere", "x"))
            .unwrap();
        assert!(runtime.start("test:caller").await.is_err());
    }
}
