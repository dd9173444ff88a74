use std::net::SocketAddr;

use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::Receiver;

use crate::{
    Signal,
    error::{BindError, ProtocolError},
    internal,
    listener::{BoundListener, Listener},
    traits::Protocol,
};

/// What a failed endpoint bind means for startup.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum BindPolicy {
    /// Any endpoint failing to bind aborts startup.
    #[default]
    Global,
    /// Failed endpoints are reported and skipped; startup only fails when no
    /// endpoint could be bound.
    PerEndpoint,
}

/// Owns every endpoint of one protocol.
pub struct Controller<Proto: Protocol> {
    listeners: Vec<Listener<Proto>>,
    policy: BindPolicy,
}

impl<Proto: Protocol> Controller<Proto> {
    pub const fn new(policy: BindPolicy) -> Self {
        Self {
            listeners: Vec::new(),
            policy,
        }
    }

    #[must_use]
    pub fn with_listener(mut self, listener: Listener<Proto>) -> Self {
        self.listeners.push(listener);
        self
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    ///
    /// Validate every listener's arguments
    ///
    /// # Errors
    /// The first listener whose arguments are rejected
    ///
    pub fn init(&self) -> Result<(), ProtocolError> {
        internal!("Initialising Controller for {}", Proto::ty());

        self.listeners.iter().try_for_each(Listener::init)
    }

    /// Bind every endpoint concurrently, applying the bind policy.
    ///
    /// # Errors
    /// Under [`BindPolicy::Global`] the first failure; under
    /// [`BindPolicy::PerEndpoint`] [`BindError::NoneBound`] when nothing bound.
    pub async fn bind(self) -> Result<BoundController<Proto>, BindError> {
        let total = self.listeners.len();
        let results = join_all(self.listeners.into_iter().map(Listener::bind)).await;

        let mut bound = Vec::with_capacity(total);
        let mut failures = Vec::new();

        for result in results {
            match result {
                Ok(listener) => bound.push(listener),
                Err(err) => {
                    internal!(level = ERROR, "{} {err}", Proto::ty());
                    failures.push(err);
                }
            }
        }

        match self.policy {
            BindPolicy::Global => {
                if let Some(err) = failures.into_iter().next() {
                    return Err(err);
                }
            }
            BindPolicy::PerEndpoint => {
                if bound.is_empty() && total > 0 {
                    return Err(BindError::NoneBound(total));
                }
            }
        }

        Ok(BoundController { listeners: bound })
    }
}

/// Endpoints that bound successfully.
pub struct BoundController<Proto: Protocol> {
    listeners: Vec<BoundListener<Proto>>,
}

impl<Proto: Protocol> BoundController<Proto> {
    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.listeners.iter().map(BoundListener::local_addr).collect()
    }

    /// Serve every endpoint until shutdown.
    #[tracing::instrument(level = "trace", skip_all)]
    pub async fn control(self, signal: Receiver<Signal>) {
        join_all(
            self.listeners
                .into_iter()
                .map(|listener| listener.serve(signal.resubscribe())),
        )
        .await;

        internal!(level = INFO, "All {} listeners stopped", Proto::ty());
    }
}
