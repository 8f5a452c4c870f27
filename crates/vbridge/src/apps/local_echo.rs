//! Local-only echo peer.

use async_trait::async_trait;

use crate::delegate::{CreateError, IncomingConnection, ServiceDelegate, ServiceRequest, SetupError};
use crate::handler::{LocalEchoHandler, RemoteEchoBridge};
use crate::local::ApplicationContext;
use crate::stub::BoundStub;

/// Offers [`RemoteEchoBridge`] answered in-process.
#[derive(Debug, Default)]
pub struct LocalEcho;

#[async_trait]
impl ServiceDelegate for LocalEcho {
    async fn initialize(&self, ctx: &ApplicationContext) -> Result<(), SetupError> {
        tracing::debug!(app = ctx.url(), "Local echo ready");
        Ok(())
    }

    fn accept_connection(&self, connection: &mut IncomingConnection) {
        connection.provide::<RemoteEchoBridge>();
    }

    fn create(&self, request: ServiceRequest) -> Result<BoundStub, CreateError> {
        request.bind::<RemoteEchoBridge, _>(LocalEchoHandler)
    }
}
