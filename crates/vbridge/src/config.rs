//! Bridge configuration.

use std::time::Duration;

use crate::remote::ListenSpec;

/// Application URL of the process that owns the remote identity.
pub const ECHO_SERVER_URL: &str = "vbridge:echo_server";
/// Application URL of the bridge client.
pub const BRIDGE_CLIENT_URL: &str = "vbridge:bridge_client";
pub const LOCAL_ECHO_URL: &str = "vbridge:local_echo";
pub const ECHO_CALLER_URL: &str = "vbridge:echo_caller";

const DEFAULT_IDENTITY: &str = "vbridge-echo-server";
const DEFAULT_SHUTDOWN_TIMEOUT_MS: u64 = 5000;

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Where the remote server listens.
    pub listen: ListenSpec,
    /// Blessing name of the remote identity.
    pub identity: String,
    /// URL of the application exposing the relay.
    pub relay_url: String,
    /// URL of the application exposing the bridge.
    pub bridge_url: String,
    /// How long Quit waits for each stub loop before aborting it.
    pub shutdown_timeout: Duration,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            listen: ListenSpec::default(),
            identity: DEFAULT_IDENTITY.to_string(),
            relay_url: ECHO_SERVER_URL.to_string(),
            bridge_url: BRIDGE_CLIENT_URL.to_string(),
            shutdown_timeout: Duration::from_millis(DEFAULT_SHUTDOWN_TIMEOUT_MS),
        }
    }
}

impl BridgeConfig {
    /// Defaults overridden by `VBRIDGE_LISTEN_ADDR`, `VBRIDGE_IDENTITY` and
    /// `VBRIDGE_SHUTDOWN_TIMEOUT_MS`. Unparseable values are ignored.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(addr) = lookup("VBRIDGE_LISTEN_ADDR").filter(|s| !s.is_empty()) {
            config.listen = ListenSpec::new(addr);
        }
        if let Some(identity) = lookup("VBRIDGE_IDENTITY").filter(|s| !s.is_empty()) {
            config.identity = identity;
        }
        if let Some(raw) = lookup("VBRIDGE_SHUTDOWN_TIMEOUT_MS") {
            match raw.parse::<u64>() {
                Ok(ms) => config.shutdown_timeout = Duration::from_millis(ms),
                Err(_) => {
                    tracing::warn!(value = %raw, "Ignoring invalid VBRIDGE_SHUTDOWN_TIMEOUT_MS")
                }
            }
        }
        config
    }

    pub fn with_listen(mut self, listen: ListenSpec) -> Self {
        self.listen = listen;
        self
    }

    pub fn with_identity(mut self, identity: impl Into<String>) -> Self {
        self.identity = identity.into();
        self
    }

    pub fn with_relay_url(mut self, url: impl Into<String>) -> Self {
        self.relay_url = url.into();
        self
    }

    pub fn with_bridge_url(mut self, url: impl Into<String>) -> Self {
        self.bridge_url = url.into();
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| vars.get(key).cloned()
    }

    #[test]
    fn defaults() {
        let config = BridgeConfig::default();
        assert_eq!(config.listen.addr, "127.0.0.1:0");
        assert_eq!(config.relay_url, ECHO_SERVER_URL);
        assert_eq!(config.bridge_url, BRIDGE_CLIENT_URL);
        assert_eq!(config.shutdown_timeout, Duration::from_secs(5));
    }

    #[test]
    fn env_overrides() {
        let config = BridgeConfig::from_lookup(lookup(&[
            ("VBRIDGE_LISTEN_ADDR", "0.0.0.0:9000"),
            ("VBRIDGE_IDENTITY", "dev"),
            ("VBRIDGE_SHUTDOWN_TIMEOUT_MS", "250"),
        ]));
        assert_eq!(config.listen, ListenSpec::new("0.0.0.0:9000"));
        assert_eq!(config.identity, "dev");
        assert_eq!(config.shutdown_timeout, Duration::from_millis(250));
    }

    #[test]
    fn invalid_env_values_are_ignored() {
        let config = BridgeConfig::from_lookup(lookup(&[
            ("VBRIDGE_LISTEN_ADDR", ""),
            ("VBRIDGE_SHUTDOWN_TIMEOUT_MS", "soon"),
        ]));
        assert_eq!(config.listen, ListenSpec::default());
        assert_eq!(config.shutdown_timeout, Duration::from_secs(5));
    }

    #[test]
    fn builders_chain() {
        let config = BridgeConfig::default()
            .with_identity("alt")
            .with_relay_url("test:relay")
            .with_bridge_url("test:bridge")
            .with_shutdown_timeout(Duration::from_millis(10));
        assert_eq!(config.identity, "alt");
        assert_eq!(config.relay_url, "test:relay");
        assert_eq!(config.bridge_url, "test:bridge");
        assert_eq!(config.shutdown_timeout, Duration::from_millis(10));
    }
}
