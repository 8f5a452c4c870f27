//! Service delegate lifecycle.
//!
//! Every bridging application implements [`ServiceDelegate`]. The
//! [`ApplicationHost`] drives it through a strictly forward state machine:
//!
//! ```text
//! Uninitialized --initialize--> Initialized --accept--> Accepting --quit--> ShuttingDown
//! ```
//!
//! Out-of-order calls fail with [`LifecycleError::OutOfOrder`]. A failed
//! initialize moves straight to ShuttingDown, so a half-initialized
//! application is never reachable.
//!
//! The host owns the stubs the delegate creates. Each stub runs in its own
//! task; a stub that ends on its own is pruned, and quit closes and joins
//! the rest.

use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::bridge::protocol::{Interface, StubId};
use crate::bridge::transport::Connection;
use crate::local::ApplicationContext;
use crate::remote::CredentialError;
use crate::stub::{BoundStub, LoopExit, Service};

/// Lifecycle state of a hosted delegate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DelegateState {
    #[default]
    Uninitialized,
    Initialized,
    /// At least one connection has been accepted.
    Accepting,
    ShuttingDown,
}

/// Setup failures. Fatal to the application that hits them.
#[derive(Debug, thiserror::Error)]
pub enum SetupError {
    #[error("failed to listen: {message}")]
    Listen { message: String },

    #[error("failed to serve: {message}")]
    Serve { message: String },

    #[error("failed to decode credentials: {0}")]
    Credential(#[from] CredentialError),

    #[error("relay query failed: {message}")]
    Relay { message: String },

    #[error("internal error: {message}")]
    Internal { message: String },
}

impl SetupError {
    pub fn listen(message: impl Into<String>) -> Self {
        Self::Listen {
            message: message.into(),
        }
    }

    pub fn serve(message: impl Into<String>) -> Self {
        Self::Serve {
            message: message.into(),
        }
    }

    pub fn relay(message: impl Into<String>) -> Self {
        Self::Relay {
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CreateError {
    #[error("interface {0} is not offered by this application")]
    NotOffered(String),

    #[error("{0} is not ready")]
    NotReady(&'static str),
}

#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    #[error("{operation} not allowed in state {state:?}")]
    OutOfOrder {
        operation: &'static str,
        state: DelegateState,
    },

    #[error(transparent)]
    Setup(#[from] SetupError),

    #[error(transparent)]
    Create(#[from] CreateError),
}

/// A peer's connection to this application, before any service is bound.
#[derive(Debug)]
pub struct IncomingConnection {
    requestor: String,
    offered: Vec<&'static str>,
}

impl IncomingConnection {
    pub fn new(requestor: impl Into<String>) -> Self {
        Self {
            requestor: requestor.into(),
            offered: Vec::new(),
        }
    }

    pub fn requestor(&self) -> &str {
        &self.requestor
    }

    /// Offer interface `I` on this connection.
    pub fn provide<I: Interface>(&mut self) {
        if !self.offered.contains(&I::NAME) {
            self.offered.push(I::NAME);
        }
    }

    pub fn offers(&self, service: &str) -> bool {
        self.offered.iter().any(|name| *name == service)
    }
}

/// Request to bind a service implementation to a new connection.
#[derive(Debug)]
pub struct ServiceRequest {
    service: String,
    connection: Connection,
}

impl ServiceRequest {
    pub fn new(service: impl Into<String>, connection: Connection) -> Self {
        Self {
            service: service.into(),
            connection,
        }
    }

    pub fn service_name(&self) -> &str {
        &self.service
    }

    /// Bind `service` as the implementation of `I` for this connection.
    pub fn bind<I, S>(self, service: S) -> Result<BoundStub, CreateError>
    where
        I: Interface,
        S: Service<I>,
    {
        if self.service != I::NAME {
            return Err(CreateError::NotOffered(self.service));
        }
        Ok(BoundStub::new::<I, S>(self.connection, service))
    }
}

/// What a bridging application implements.
#[async_trait]
pub trait ServiceDelegate: Send + Sync + 'static {
    /// One-time setup, before any connection is accepted.
    async fn initialize(&self, ctx: &ApplicationContext) -> Result<(), SetupError>;

    /// Declare the interfaces offered on a new connection.
    fn accept_connection(&self, connection: &mut IncomingConnection);

    /// Bind an implementation to a service request.
    fn create(&self, request: ServiceRequest) -> Result<BoundStub, CreateError>;

    /// Release process-wide resources. Stubs are already closed.
    async fn quit(&self) {}
}

struct StubEntry {
    id: StubId,
    interface: &'static str,
    close: CancellationToken,
    handle: JoinHandle<LoopExit>,
}

/// Ordered collection of live stubs (creation order).
#[derive(Clone, Default)]
pub struct StubSet {
    entries: Arc<StdMutex<Vec<StubEntry>>>,
}

fn lock_entries(entries: &StdMutex<Vec<StubEntry>>) -> MutexGuard<'_, Vec<StubEntry>> {
    entries.lock().unwrap_or_else(|poisoned| {
        tracing::error!("Stub set mutex poisoned - recovering");
        poisoned.into_inner()
    })
}

impl StubSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn the stub's loop and record it.
    pub fn launch(&self, bound: BoundStub) -> StubId {
        let id = bound.id();
        let interface = bound.interface();
        let close = CancellationToken::new();
        let serve = bound.into_future(close.clone());
        let registry = Arc::clone(&self.entries);

        // Held across spawn so the prune below cannot run before the push.
        let mut entries = lock_entries(&self.entries);
        let handle = tokio::spawn(async move {
            let exit = serve.await;
            let mut entries = lock_entries(&registry);
            if let Some(pos) = entries.iter().position(|e| e.id == id) {
                entries.remove(pos);
                tracing::trace!(stub = %id, ?exit, "Pruned terminated stub");
            }
            exit
        });
        entries.push(StubEntry {
            id,
            interface,
            close,
            handle,
        });
        tracing::debug!(stub = %id, interface, live = entries.len(), "Stub launched");
        id
    }

    pub fn len(&self) -> usize {
        lock_entries(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn ids(&self) -> Vec<StubId> {
        lock_entries(&self.entries).iter().map(|e| e.id).collect()
    }

    /// Close every stub and wait for its loop. Loops still running after
    /// `timeout` are aborted.
    pub async fn close_all(&self, timeout: Duration) -> Vec<(StubId, LoopExit)> {
        let entries = std::mem::take(&mut *lock_entries(&self.entries));
        for entry in &entries {
            entry.close.cancel();
        }

        let mut exits = Vec::with_capacity(entries.len());
        for mut entry in entries {
            let exit = match tokio::time::timeout(timeout, &mut entry.handle).await {
                Ok(Ok(exit)) => exit,
                Ok(Err(e)) => {
                    tracing::error!(stub = %entry.id, error = %e, "Stub task panicked");
                    LoopExit::TransportFailure(e.to_string())
                }
                Err(_) => {
                    tracing::warn!(stub = %entry.id, interface = entry.interface, "Stub did not stop in time, aborting");
                    entry.handle.abort();
                    LoopExit::Closed
                }
            };
            exits.push((entry.id, exit));
        }
        exits
    }
}

/// Drives one delegate through its lifecycle and owns its stubs.
pub struct ApplicationHost<D> {
    url: String,
    delegate: D,
    state: StdMutex<DelegateState>,
    init_lock: tokio::sync::Mutex<()>,
    stubs: StubSet,
    shutdown_timeout: Duration,
}

impl<D: ServiceDelegate> ApplicationHost<D> {
    pub fn new(url: impl Into<String>, delegate: D) -> Self {
        Self {
            url: url.into(),
            delegate,
            state: StdMutex::new(DelegateState::Uninitialized),
            init_lock: tokio::sync::Mutex::new(()),
            stubs: StubSet::new(),
            shutdown_timeout: Duration::from_secs(5),
        }
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn delegate(&self) -> &D {
        &self.delegate
    }

    pub fn stubs(&self) -> &StubSet {
        &self.stubs
    }

    fn lock_state(&self) -> MutexGuard<'_, DelegateState> {
        self.state.lock().unwrap_or_else(|poisoned| {
            tracing::error!(app = %self.url, "Delegate state mutex poisoned - recovering");
            poisoned.into_inner()
        })
    }

    pub fn state(&self) -> DelegateState {
        *self.lock_state()
    }

    /// Run the delegate's one-time setup.
    pub async fn initialize(&self, ctx: &ApplicationContext) -> Result<(), LifecycleError> {
        let _guard = self.init_lock.lock().await;
        self.initialize_locked(ctx).await
    }

    /// Initialize unless already initialized. Concurrent callers run setup once.
    pub async fn ensure_initialized(&self, ctx: &ApplicationContext) -> Result<(), LifecycleError> {
        let _guard = self.init_lock.lock().await;
        match self.state() {
            DelegateState::Initialized | DelegateState::Accepting => Ok(()),
            _ => self.initialize_locked(ctx).await,
        }
    }

    async fn initialize_locked(&self, ctx: &ApplicationContext) -> Result<(), LifecycleError> {
        let state = self.state();
        if state != DelegateState::Uninitialized {
            return Err(LifecycleError::OutOfOrder {
                operation: "initialize",
                state,
            });
        }

        tracing::debug!(app = %self.url, "Initializing");
        match self.delegate.initialize(ctx).await {
            Ok(()) => {
                *self.lock_state() = DelegateState::Initialized;
                tracing::info!(app = %self.url, "Initialized");
                Ok(())
            }
            Err(e) => {
                *self.lock_state() = DelegateState::ShuttingDown;
                tracing::error!(app = %self.url, error = %e, "Initialize failed");
                Err(e.into())
            }
        }
    }

    /// Register a new peer connection and collect the offered interfaces.
    pub fn accept_connection(&self, requestor: &str) -> Result<IncomingConnection, LifecycleError> {
        let mut state = self.lock_state();
        match *state {
            DelegateState::Initialized | DelegateState::Accepting => {
                *state = DelegateState::Accepting;
            }
            other => {
                return Err(LifecycleError::OutOfOrder {
                    operation: "accept_connection",
                    state: other,
                });
            }
        }
        drop(state);

        let mut connection = IncomingConnection::new(requestor);
        self.delegate.accept_connection(&mut connection);
        tracing::debug!(
            app = %self.url,
            requestor = connection.requestor(),
            offered = ?connection.offered,
            "Accepted connection"
        );
        Ok(connection)
    }

    /// Bind a service to a request and start its stub loop.
    pub fn create(&self, request: ServiceRequest) -> Result<StubId, LifecycleError> {
        // Held until the stub is recorded so quit cannot miss it.
        let state = self.lock_state();
        if *state != DelegateState::Accepting {
            return Err(LifecycleError::OutOfOrder {
                operation: "create",
                state: *state,
            });
        }

        let service = request.service_name().to_string();
        let bound = self.delegate.create(request)?;
        let id = self.stubs.launch(bound);
        drop(state);

        tracing::debug!(app = %self.url, %service, stub = %id, "Created stub");
        Ok(id)
    }

    /// Close all stubs, then let the delegate release its resources.
    pub async fn quit(&self) -> Result<(), LifecycleError> {
        {
            let mut state = self.lock_state();
            if *state == DelegateState::ShuttingDown {
                return Err(LifecycleError::OutOfOrder {
                    operation: "quit",
                    state: *state,
                });
            }
            *state = DelegateState::ShuttingDown;
        }

        tracing::info!(app = %self.url, live_stubs = self.stubs.len(), "Quitting");
        let exits = self.stubs.close_all(self.shutdown_timeout).await;
        tracing::debug!(app = %self.url, closed = exits.len(), "Stubs closed");
        self.delegate.quit().await;
        Ok(())
    }
}

/// Object-safe view of a host, used by the local runtime.
#[async_trait]
pub trait HostedApplication: Send + Sync {
    fn url(&self) -> &str;
    fn state(&self) -> DelegateState;
    async fn ensure_initialized(&self, ctx: &ApplicationContext) -> Result<(), LifecycleError>;
    fn accept_connection(&self, requestor: &str) -> Result<IncomingConnection, LifecycleError>;
    fn create(&self, request: ServiceRequest) -> Result<StubId, LifecycleError>;
    async fn quit(&self) -> Result<(), LifecycleError>;
}

#[async_trait]
impl<D: ServiceDelegate> HostedApplication for ApplicationHost<D> {
    fn url(&self) -> &str {
        ApplicationHost::url(self)
    }

    fn state(&self) -> DelegateState {
        ApplicationHost::state(self)
    }

    async fn ensure_initialized(&self, ctx: &ApplicationContext) -> Result<(), LifecycleError> {
        ApplicationHost::ensure_initialized(self, ctx).await
    }

    fn accept_connection(&self, requestor: &str) -> Result<IncomingConnection, LifecycleError> {
        ApplicationHost::accept_connection(self, requestor)
    }

    fn create(&self, request: ServiceRequest) -> Result<StubId, LifecycleError> {
        ApplicationHost::create(self, request)
    }

    async fn quit(&self) -> Result<(), LifecycleError> {
        ApplicationHost::quit(self).await
    }
}
