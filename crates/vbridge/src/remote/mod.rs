//! Remote transport: credentialed TCP RPC with a blessing handshake.

mod client;
mod protocol;
mod security;
mod server;

pub use client::{RemoteClient, RemoteError, RemoteInvoker};
pub use protocol::{ClientFrame, ServerFrame};
pub use security::{Blessings, CredentialError, Principal, RemoteContext};
pub use server::{
    Authorizer, DispatchError, Dispatcher, ListenSpec, RemoteServer, ServerError, endpoint_addr,
    tcp_endpoint,
};
