//! Ordered acquisition and reverse release of server resources.

use futures::future::BoxFuture;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::error::{BoxError, RpcError};

/// Server lifecycle states. Transitions only ever move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ServerState {
    Created,
    Starting,
    Running,
    Stopping,
    Stopped,
}

impl ServerState {
    pub fn is_terminal(self) -> bool {
        self == ServerState::Stopped
    }
}

impl fmt::Display for ServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ServerState::Created => "created",
            ServerState::Starting => "starting",
            ServerState::Running => "running",
            ServerState::Stopping => "stopping",
            ServerState::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// Strictly-forward state machine, published on a watch channel.
#[derive(Debug)]
pub struct StateMachine {
    tx: watch::Sender<ServerState>,
}

impl StateMachine {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(ServerState::Created);
        Self { tx }
    }

    pub fn current(&self) -> ServerState {
        *self.tx.borrow()
    }

    /// Move to `to`, which must be later than the current state.
    pub fn transition(&self, to: ServerState) -> Result<(), RpcError> {
        let mut result = Ok(());
        self.tx.send_if_modified(|state| {
            if to > *state {
                debug!(from = %state, to = %to, "Server state transition");
                *state = to;
                true
            } else {
                result = Err(RpcError::InvalidTransition { from: *state, to });
                false
            }
        });
        result
    }

    pub fn subscribe(&self) -> watch::Receiver<ServerState> {
        self.tx.subscribe()
    }
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

/// An external resource held by the server for its lifetime.
pub trait Resource: Send + Sync + 'static {
    /// Name used in logs.
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    /// Close the resource. Called once, during shutdown or a failed startup.
    fn release(&self) -> BoxFuture<'_, Result<(), BoxError>>;
}

/// Drives the Created → Starting → Running → Stopping → Stopped sequence and
/// owns the stack of acquired resources.
///
/// Resources are released in the reverse of their acquisition order, both on
/// a failed startup and on stop.
pub struct Lifecycle {
    state: StateMachine,
    resources: Vec<(String, Arc<dyn Resource>)>,
}

impl Lifecycle {
    pub fn new() -> Self {
        Self {
            state: StateMachine::new(),
            resources: Vec::new(),
        }
    }

    pub fn state(&self) -> ServerState {
        self.state.current()
    }

    pub fn subscribe(&self) -> watch::Receiver<ServerState> {
        self.state.subscribe()
    }

    /// Names of the acquired resources, in acquisition order.
    pub fn acquired(&self) -> Vec<&str> {
        self.resources.iter().map(|(name, _)| name.as_str()).collect()
    }

    pub fn start(&mut self) -> Result<(), RpcError> {
        self.state.transition(ServerState::Starting)?;
        info!("Server starting");
        Ok(())
    }

    /// Acquire the next resource.
    ///
    /// If `open` fails, everything acquired so far is released in reverse
    /// order, the lifecycle ends in `Stopped`, and the error names `name`.
    pub async fn acquire<R, F>(&mut self, name: &str, open: F) -> Result<Arc<R>, RpcError>
    where
        R: Resource,
        F: Future<Output = Result<R, BoxError>>,
    {
        let current = self.state();
        if current != ServerState::Starting {
            return Err(RpcError::InvalidTransition {
                from: current,
                to: ServerState::Starting,
            });
        }

        match open.await {
            Ok(resource) => {
                let resource = Arc::new(resource);
                self.resources
                    .push((name.to_string(), Arc::clone(&resource) as Arc<dyn Resource>));
                info!(resource = %name, "Acquired resource");
                Ok(resource)
            }
            Err(e) => {
                error!(resource = %name, error = %e, "Failed to acquire resource, aborting startup");
                self.state.transition(ServerState::Stopping)?;
                self.release_all().await;
                self.state.transition(ServerState::Stopped)?;
                Err(RpcError::startup(name, e))
            }
        }
    }

    pub fn running(&mut self) -> Result<(), RpcError> {
        self.state.transition(ServerState::Running)?;
        info!(resources = ?self.acquired(), "Server running");
        Ok(())
    }

    /// Release every resource in reverse order and end in `Stopped`.
    ///
    /// Release failures are logged and do not stop the remaining releases.
    /// Calling this again once stopped does nothing.
    pub async fn stop(&mut self) -> Result<(), RpcError> {
        if self.state().is_terminal() {
            return Ok(());
        }

        self.state.transition(ServerState::Stopping)?;
        info!("Server stopping");
        self.release_all().await;
        self.state.transition(ServerState::Stopped)?;
        info!("Server stopped");
        Ok(())
    }

    async fn release_all(&mut self) {
        while let Some((name, resource)) = self.resources.pop() {
            match resource.release().await {
                Ok(()) => debug!(resource = %name, "Released resource"),
                Err(e) => warn!(resource = %name, error = %e, "Failed to release resource"),
            }
        }
    }
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lifecycle")
            .field("state", &self.state())
            .field("resources", &self.acquired())
            .finish()
    }
}
