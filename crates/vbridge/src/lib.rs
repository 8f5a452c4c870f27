//! vbridge: bridge local IPC services to a credentialed remote RPC transport.

pub mod apps;
pub mod bridge;
pub mod config;
pub mod delegate;
pub mod handler;
pub mod local;
pub mod relay;
pub mod remote;
pub mod stub;

pub use bridge::protocol::{CallError, CallErrorKind, CredentialBlob, Endpoint, Interface};
pub use config::BridgeConfig;
pub use delegate::{
    ApplicationHost, CreateError, DelegateState, IncomingConnection, LifecycleError,
    ServiceDelegate, ServiceRequest, SetupError,
};
pub use handler::{BridgeHandler, EchoRequest, EchoResponse, RemoteEchoBridge};
pub use local::{ApplicationContext, ConnectError, LocalRuntime, Proxy, ProxyError};
pub use relay::{LocalRelay, RelayRequest, RelayResponse, RelayService, RelayState};
pub use stub::{BoundStub, LoopExit, ServeError, Service};
