//! Relay of endpoint and credential data to local peers.
//!
//! The application that owns a remote identity exposes [`LocalRelay`] so
//! that local peers can learn where its server listens and which blessings
//! to trust. Both answers are read-only; the relay keeps no per-caller state.

use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::bridge::protocol::{CallError, CredentialBlob, Endpoint, Interface};
use crate::local::{ApplicationContext, ConnectError, ProxyError};
use crate::remote::Principal;
use crate::stub::Service;

/// Local-transport interface answering endpoint and root queries.
pub struct LocalRelay;

impl Interface for LocalRelay {
    const NAME: &'static str = "vbridge.LocalRelay";
    type Request = RelayRequest;
    type Response = RelayResponse;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RelayRequest {
    GetEndpoint,
    GetRoot,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RelayResponse {
    Endpoint { endpoint: Endpoint },
    Root { blessings: CredentialBlob },
}

/// Data the relay answers from. Shared between the owning application and
/// every relay stub.
#[derive(Debug)]
pub struct RelayState {
    endpoint: OnceLock<Endpoint>,
    principal: Arc<Principal>,
}

impl RelayState {
    pub fn new(principal: Arc<Principal>) -> Arc<Self> {
        Arc::new(Self {
            endpoint: OnceLock::new(),
            principal,
        })
    }

    /// Record the endpoint once the server is listening. Later calls are
    /// ignored and return false.
    pub fn publish_endpoint(&self, endpoint: Endpoint) -> bool {
        if endpoint.is_empty() {
            tracing::warn!("Refusing to publish an empty endpoint");
            return false;
        }
        let published = self.endpoint.set(endpoint).is_ok();
        if !published {
            tracing::warn!("Endpoint already published");
        }
        published
    }

    pub fn endpoint(&self) -> Result<Endpoint, CallError> {
        self.endpoint
            .get()
            .cloned()
            .ok_or_else(|| CallError::not_ready("endpoint"))
    }

    /// Current default blessings of the hosting principal, serialized.
    pub fn root(&self) -> Result<CredentialBlob, CallError> {
        self.principal
            .default_blessings()
            .encode()
            .map_err(|e| CallError::internal(e.to_string()))
    }
}

/// [`LocalRelay`] implementation over a shared [`RelayState`].
#[derive(Clone)]
pub struct RelayService {
    state: Arc<RelayState>,
}

impl RelayService {
    pub fn new(state: Arc<RelayState>) -> Self {
        Self { state }
    }
}

#[async_trait]
impl Service<LocalRelay> for RelayService {
    async fn handle(&self, request: RelayRequest) -> Result<RelayResponse, CallError> {
        match request {
            RelayRequest::GetEndpoint => {
                let endpoint = self.state.endpoint()?;
                tracing::debug!(%endpoint, "Relaying endpoint");
                Ok(RelayResponse::Endpoint { endpoint })
            }
            RelayRequest::GetRoot => {
                let blessings = self.state.root()?;
                tracing::debug!(bytes = blessings.as_bytes().len(), "Relaying root");
                Ok(RelayResponse::Root { blessings })
            }
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error(transparent)]
    Connect(#[from] ConnectError),

    #[error(transparent)]
    Call(#[from] ProxyError),
}

/// Ask the relay at `app_url` for its endpoint. Opens and closes a connection.
pub async fn fetch_endpoint(
    ctx: &ApplicationContext,
    app_url: &str,
) -> Result<Endpoint, RelayError> {
    let mut relay = ctx.connect_to_service::<LocalRelay>(app_url).await?;
    let response = relay.call(RelayRequest::GetEndpoint).await;
    relay.close();
    match response? {
        RelayResponse::Endpoint { endpoint } => Ok(endpoint),
        RelayResponse::Root { .. } => Err(ProxyError::UnexpectedResponse("GetEndpoint").into()),
    }
}

/// Ask the relay at `app_url` for its root blessings.
pub async fn fetch_root(
    ctx: &ApplicationContext,
    app_url: &str,
) -> Result<CredentialBlob, RelayError> {
    let mut relay = ctx.connect_to_service::<LocalRelay>(app_url).await?;
    let response = relay.call(RelayRequest::GetRoot).await;
    relay.close();
    match response? {
        RelayResponse::Root { blessings } => Ok(blessings),
        RelayResponse::Endpoint { .. } => Err(ProxyError::UnexpectedResponse("GetRoot").into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::protocol::CallErrorKind;
    use crate::remote::Blessings;

    fn service() -> (Arc<RelayState>, RelayService) {
        let state = RelayState::new(Principal::new(Blessings::self_signed("echo-server")));
        (Arc::clone(&state), RelayService::new(state))
    }

    #[tokio::test]
    async fn endpoint_not_ready_before_publish() {
        let (_state, relay) = service();
        let err = relay.handle(RelayRequest::GetEndpoint).await.unwrap_err();
        assert_eq!(err.kind, CallErrorKind::NotReady);
        assert_eq!(err.message, "endpoint not ready");
    }

    #[tokio::test]
    async fn endpoint_is_stable_once_published() {
        let (state, relay) = service();
        assert!(state.publish_endpoint(Endpoint::new("@tcp@127.0.0.1:4000@@")));
        assert!(!state.publish_endpoint(Endpoint::new("@tcp@127.0.0.1:5000@@")));

        for _ in 0..3 {
            let response = relay.handle(RelayRequest::GetEndpoint).await.unwrap();
            assert_eq!(
                response,
                RelayResponse::Endpoint {
                    endpoint: Endpoint::new("@tcp@127.0.0.1:4000@@")
                }
            );
        }
    }

    #[tokio::test]
    async fn empty_endpoint_is_never_published() {
        let (state, relay) = service();
        assert!(!state.publish_endpoint(Endpoint::new("")));
        assert!(relay.handle(RelayRequest::GetEndpoint).await.is_err());
    }

    #[tokio::test]
    async fn root_follows_rotation() {
        let principal = Principal::new(Blessings::self_signed("echo-server"));
        let relay = RelayService::new(RelayState::new(Arc::clone(&principal)));

        let RelayResponse::Root { blessings: before } =
            relay.handle(RelayRequest::GetRoot).await.unwrap()
        else {
            panic!("expected root");
        };
        assert_eq!(Blessings::decode(&before).unwrap(), principal.default_blessings());

        let rotated = Blessings::self_signed("echo-server-v2");
        principal.set_default_blessings(rotated.clone());

        let RelayResponse::Root { blessings: after } =
            relay.handle(RelayRequest::GetRoot).await.unwrap()
        else {
            panic!("expected root");
        };
        assert_ne!(before, after);
        assert_eq!(Blessings::decode(&after).unwrap(), rotated);
    }

    #[test]
    fn responses_serialize() {
        let response = RelayResponse::Root {
            blessings: CredentialBlob::new(b"B1".to_vec()),
        };
        insta::assert_json_snapshot!(response, @r#"
        {
          "type": "root",
          "blessings": "QjE="
        }
        "#);

        insta::assert_json_snapshot!(RelayRequest::GetEndpoint, @r#"
        {
          "type": "get_endpoint"
        }
        "#);
    }
}
