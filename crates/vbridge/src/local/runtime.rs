//! In-process local transport runtime.
//!
//! Applications register under a URL. The first connection to an
//! application initializes it; every connection goes through
//! AcceptConnection (which interfaces are offered) and Create (bind the
//! implementation and start its stub loop).

use std::io;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use crate::bridge::protocol::Interface;
use crate::bridge::transport::Connection;
use crate::config::BridgeConfig;
use crate::delegate::{
    ApplicationHost, DelegateState, HostedApplication, LifecycleError, ServiceDelegate,
    ServiceRequest,
};

use super::proxy::Proxy;

#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error("unknown application: {0}")]
    UnknownApplication(String),

    #[error("application {0} is already registered")]
    AlreadyRegistered(String),

    #[error("{app} does not offer {service}")]
    ServiceNotOffered { app: String, service: String },

    #[error("{app}: {source}")]
    Lifecycle {
        app: String,
        #[source]
        source: LifecycleError,
    },

    #[error("failed to create connection: {0}")]
    Io(#[from] io::Error),
}

/// Registry of the applications reachable over the local transport.
pub struct LocalRuntime {
    apps: DashMap<String, Arc<dyn HostedApplication>>,
    /// Registration order, for shutdown.
    order: StdMutex<Vec<String>>,
    shutdown_timeout: Duration,
}

impl LocalRuntime {
    pub fn new() -> Arc<Self> {
        Self::from_config(&BridgeConfig::default())
    }

    pub fn from_config(config: &BridgeConfig) -> Arc<Self> {
        Arc::new(Self {
            apps: DashMap::new(),
            order: StdMutex::new(Vec::new()),
            shutdown_timeout: config.shutdown_timeout,
        })
    }

    /// Register a delegate under `url`.
    pub fn register<D: ServiceDelegate>(
        &self,
        url: impl Into<String>,
        delegate: D,
    ) -> Result<Arc<ApplicationHost<D>>, ConnectError> {
        let url = url.into();
        let host = Arc::new(
            ApplicationHost::new(url.clone(), delegate).with_shutdown_timeout(self.shutdown_timeout),
        );

        match self.apps.entry(url.clone()) {
            Entry::Occupied(_) => return Err(ConnectError::AlreadyRegistered(url)),
            Entry::Vacant(slot) => {
                slot.insert(Arc::clone(&host) as Arc<dyn HostedApplication>);
            }
        }
        if let Ok(mut order) = self.order.lock() {
            order.push(url.clone());
        }
        tracing::debug!(app = %url, "Registered application");
        Ok(host)
    }

    /// Context handed to the application at `url` during Initialize.
    pub fn context_for(self: &Arc<Self>, url: impl Into<String>) -> ApplicationContext {
        ApplicationContext {
            url: url.into(),
            runtime: Arc::clone(self),
        }
    }

    fn lookup(&self, url: &str) -> Result<Arc<dyn HostedApplication>, ConnectError> {
        self.apps
            .get(url)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| ConnectError::UnknownApplication(url.to_string()))
    }

    /// Launch an application (run Initialize) without connecting to it.
    pub async fn start(self: &Arc<Self>, url: &str) -> Result<(), ConnectError> {
        let app = self.lookup(url)?;
        app.ensure_initialized(&self.context_for(url))
            .await
            .map_err(|source| ConnectError::Lifecycle {
                app: url.to_string(),
                source,
            })
    }

    /// Open a connection from `requestor` to `service` offered by `app_url`.
    pub async fn connect(
        self: &Arc<Self>,
        requestor: &str,
        app_url: &str,
        service: &str,
    ) -> Result<Connection, ConnectError> {
        let app = self.lookup(app_url)?;
        let lifecycle = |source| ConnectError::Lifecycle {
            app: app_url.to_string(),
            source,
        };

        app.ensure_initialized(&self.context_for(app_url))
            .await
            .map_err(lifecycle)?;
        let incoming = app.accept_connection(requestor).map_err(lifecycle)?;
        if !incoming.offers(service) {
            return Err(ConnectError::ServiceNotOffered {
                app: app_url.to_string(),
                service: service.to_string(),
            });
        }

        let (server, client) = Connection::pair()?;
        app.create(ServiceRequest::new(service, server))
            .map_err(lifecycle)?;
        tracing::debug!(requestor, app = app_url, service, connection = %client.id(), "Connected");
        Ok(client)
    }

    /// Quit one application.
    pub async fn quit(&self, url: &str) -> Result<(), ConnectError> {
        let app = self.lookup(url)?;
        app.quit().await.map_err(|source| ConnectError::Lifecycle {
            app: url.to_string(),
            source,
        })
    }

    pub fn state_of(&self, url: &str) -> Option<DelegateState> {
        self.apps.get(url).map(|entry| entry.value().state())
    }

    /// Quit every application, most recently registered first.
    pub async fn shutdown(&self) {
        let order = match self.order.lock() {
            Ok(order) => order.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };

        for url in order.iter().rev() {
            let Ok(app) = self.lookup(url) else { continue };
            if app.state() == DelegateState::ShuttingDown {
                continue;
            }
            if let Err(e) = app.quit().await {
                tracing::warn!(app = %url, error = %e, "Error during application quit");
            }
        }
        tracing::info!(apps = order.len(), "Local runtime shut down");
    }
}

/// Per-application handle passed to Initialize.
#[derive(Clone)]
pub struct ApplicationContext {
    url: String,
    runtime: Arc<LocalRuntime>,
}

impl ApplicationContext {
    /// URL of the application this context belongs to.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Connect to interface `I` offered by the application at `app_url`.
    pub async fn connect_to_service<I: Interface>(
        &self,
        app_url: &str,
    ) -> Result<Proxy<I>, ConnectError> {
        let connection = self.runtime.connect(&self.url, app_url, I::NAME).await?;
        Ok(Proxy::new(connection))
    }
}
