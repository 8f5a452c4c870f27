//! Local transport: application registry, connections and typed proxies.

mod proxy;
mod runtime;

pub use proxy::{Proxy, ProxyError};
pub use runtime::{ApplicationContext, ConnectError, LocalRuntime};
