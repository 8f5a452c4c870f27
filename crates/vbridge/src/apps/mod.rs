//! Bridging applications wired together by the demo binary.
//!
//! - [`EchoServer`] owns the remote identity, serves `Echo` and relays its
//!   endpoint and root
//! - [`BridgeClient`] installs the relayed root and bridges local echo calls
//!   to the remote server
//! - [`LocalEcho`] answers the same interface without a remote hop
//! - [`EchoCaller`] makes one bridged call at startup

mod bridge_client;
mod echo_caller;
mod echo_server;
mod local_echo;

pub use bridge_client::BridgeClient;
pub use echo_caller::EchoCaller;
pub use echo_server::{EchoDispatcher, EchoServer};
pub use local_echo::LocalEcho;
