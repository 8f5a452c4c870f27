//! Bridge invocation handler: a local call that performs a remote call.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::bridge::protocol::{CallError, Endpoint, Interface};
use crate::remote::{RemoteContext, RemoteInvoker};
use crate::stub::Service;

/// Name of the echo method on the remote server.
pub const ECHO_METHOD: &str = "Echo";

/// Local-transport interface with one bridged method.
pub struct RemoteEchoBridge;

impl Interface for RemoteEchoBridge {
    const NAME: &'static str = "vbridge.RemoteEchoBridge";
    type Request = EchoRequest;
    type Response = EchoResponse;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EchoRequest {
    EchoOverRemote { value: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EchoResponse {
    Echoed { value: String },
}

/// Where the handler sends its calls and which context it calls with.
#[derive(Debug, Clone)]
pub struct RemoteTarget {
    pub endpoint: Endpoint,
    pub ctx: RemoteContext,
}

/// Serves [`RemoteEchoBridge`] by invoking [`ECHO_METHOD`] on the target.
pub struct BridgeHandler<R> {
    target: Arc<RemoteTarget>,
    invoker: Arc<R>,
}

impl<R> Clone for BridgeHandler<R> {
    fn clone(&self) -> Self {
        Self {
            target: Arc::clone(&self.target),
            invoker: Arc::clone(&self.invoker),
        }
    }
}

impl<R: RemoteInvoker> BridgeHandler<R> {
    pub fn new(target: Arc<RemoteTarget>, invoker: Arc<R>) -> Self {
        Self { target, invoker }
    }

    /// Invoke the remote echo once. No retry.
    pub async fn echo_over_remote(&self, value: String) -> Result<String, CallError> {
        let target = &self.target;
        tracing::debug!(endpoint = %target.endpoint, method = ECHO_METHOD, "Bridging call");

        let output = self
            .invoker
            .invoke(&target.ctx, &target.endpoint, ECHO_METHOD, Value::String(value))
            .await
            .map_err(|e| {
                tracing::warn!(endpoint = %target.endpoint, error = %e, "Remote invocation failed");
                CallError::remote(e.to_string())
            })?;

        match output {
            Value::String(echoed) => Ok(echoed),
            other => Err(CallError::remote(format!(
                "{ECHO_METHOD} returned a non-string value: {other}"
            ))),
        }
    }
}

#[async_trait]
impl<R: RemoteInvoker> Service<RemoteEchoBridge> for BridgeHandler<R> {
    async fn handle(&self, request: EchoRequest) -> Result<EchoResponse, CallError> {
        match request {
            EchoRequest::EchoOverRemote { value } => {
                let value = self.echo_over_remote(value).await?;
                Ok(EchoResponse::Echoed { value })
            }
        }
    }
}

/// Serves [`RemoteEchoBridge`] without leaving the process.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalEchoHandler;

#[async_trait]
impl Service<RemoteEchoBridge> for LocalEchoHandler {
    async fn handle(&self, request: EchoRequest) -> Result<EchoResponse, CallError> {
        let EchoRequest::EchoOverRemote { value } = request;
        Ok(EchoResponse::Echoed { value })
    }
}
