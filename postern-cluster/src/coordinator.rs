use std::{collections::BTreeMap, sync::Arc, time::Duration};

use parking_lot::RwLock;
use postern_common::{Signal, host::hostname, internal, stopped, tracing};
use serde::Serialize;
use tokio::{
    net::TcpStream,
    sync::broadcast,
    task::JoinSet,
    time::{Instant, interval_at, sleep, timeout},
};

use crate::{
    config::ClusterConfig,
    error::{ClusterError, Result},
    protocol::{Command, Identity, Session},
};

/// A channel this node hosts, advertised under its topic.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Registration {
    pub topic: String,
    pub channel: String,
}

impl Registration {
    pub fn new(topic: impl Into<String>, channel: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            channel: channel.into(),
        }
    }
}

/// The channels to advertise, read again on every heartbeat so channels
/// created after startup are registered too.
pub trait RegistrationSource: Send + Sync {
    fn registrations(&self) -> Vec<Registration>;
}

impl RegistrationSource for Vec<Registration> {
    fn registrations(&self) -> Vec<Registration> {
        self.clone()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum PeerState {
    Connecting,
    Registered,
    /// The last session failed; the next attempt starts after `retry_in`.
    Disconnected { error: String, retry_in: Duration },
    Stopped,
}

/// Snapshot returned by [`Coordinator::topology`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Topology {
    /// topic → channels
    pub topics: BTreeMap<String, Vec<String>>,
    pub peers: BTreeMap<String, PeerState>,
}

/// Keeps this node's channels registered with every discovery service.
///
/// Nothing here touches the queue; a failing peer only changes its own
/// entry in [`Topology::peers`].
pub struct Coordinator {
    config: ClusterConfig,
    identity: Identity,
    source: Box<dyn RegistrationSource>,
    peers: RwLock<BTreeMap<String, PeerState>>,
}

impl std::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator")
            .field("config", &self.config)
            .field("identity", &self.identity)
            .field("peers", &self.peers)
            .finish_non_exhaustive()
    }
}

impl Coordinator {
    pub fn new(config: ClusterConfig, source: impl RegistrationSource + 'static) -> Self {
        let identity = Identity {
            broadcast_address: config.broadcast_address(),
            hostname: hostname(),
            tcp_port: config.tcp_port,
            http_port: config.http_port,
            version: env!("CARGO_PKG_VERSION").to_string(),
        };

        let peers = config
            .discovery
            .iter()
            .map(|address| (address.clone(), PeerState::Connecting))
            .collect();

        Self {
            config,
            identity,
            source: Box::new(source),
            peers: RwLock::new(peers),
        }
    }

    pub fn topology(&self) -> Topology {
        let mut topics: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for registration in self.source.registrations() {
            topics
                .entry(registration.topic.clone())
                .or_default()
                .push(registration.channel);
        }

        Topology {
            topics,
            peers: self.peers.read().clone(),
        }
    }

    /// Run one registration task per discovery address until shutdown.
    #[tracing::instrument(level = "trace", skip_all)]
    pub async fn serve(self: Arc<Self>, shutdown: broadcast::Receiver<Signal>) {
        internal!(
            level = INFO,
            "Registering {} channel(s) with {:?}",
            self.source.registrations().len(),
            self.config.discovery
        );

        let mut peers = JoinSet::new();
        for address in self.config.discovery.clone() {
            peers.spawn(Arc::clone(&self).peer(address, shutdown.resubscribe()));
        }

        while peers.join_next().await.is_some() {}

        internal!(level = INFO, "Cluster coordinator stopped");
    }

    async fn peer(self: Arc<Self>, address: String, mut shutdown: broadcast::Receiver<Signal>) {
        let mut delay = self.config.reconnect_delay;

        loop {
            self.set_state(&address, PeerState::Connecting);

            match self.session(&address, &mut shutdown, &mut delay).await {
                Ok(()) => break,
                Err(err) => {
                    internal!(
                        level = WARN,
                        "Discovery peer {address} failed: {err}, reconnecting in {delay:?}"
                    );
                    self.set_state(
                        &address,
                        PeerState::Disconnected {
                            error: err.to_string(),
                            retry_in: delay,
                        },
                    );
                }
            }

            tokio::select! {
                () = stopped(&mut shutdown) => break,
                () = sleep(delay) => {}
            }

            delay = (delay * 2).min(self.config.max_reconnect_delay);
        }

        self.set_state(&address, PeerState::Stopped);
    }

    /// One connection: identify, register, then heartbeat until shutdown.
    ///
    /// Returns `Ok` only after a requested shutdown.
    async fn session(
        &self,
        address: &str,
        shutdown: &mut broadcast::Receiver<Signal>,
        delay: &mut Duration,
    ) -> Result<()> {
        let stream = timeout(self.config.request_timeout, TcpStream::connect(address))
            .await
            .map_err(|_| ClusterError::Timeout(format!("connect to {address}")))??;

        let mut session = Session::open(stream, self.config.request_timeout).await?;
        session.request(&Command::Identify(&self.identity)).await?;

        let mut registered = Vec::new();
        self.register_new(&mut session, &mut registered).await?;

        internal!(level = INFO, "Registered with discovery peer {address}");
        self.set_state(address, PeerState::Registered);
        *delay = self.config.reconnect_delay;

        let heartbeat = self.config.heartbeat;
        let mut ticks = interval_at(Instant::now() + heartbeat, heartbeat);

        loop {
            tokio::select! {
                () = stopped(shutdown) => break,
                _ = ticks.tick() => {
                    self.register_new(&mut session, &mut registered).await?;
                    session.request(&Command::Ping).await?;
                }
            }
        }

        for registration in &registered {
            let unregister = Command::Unregister {
                topic: &registration.topic,
                channel: &registration.channel,
            };
            if let Err(err) = session.request(&unregister).await {
                internal!(level = WARN, "Failed to unregister from {address}: {err}");
                break;
            }
        }

        Ok(())
    }

    /// Register every channel from the source not yet in `registered`.
    async fn register_new(
        &self,
        session: &mut Session<TcpStream>,
        registered: &mut Vec<Registration>,
    ) -> Result<()> {
        for registration in self.source.registrations() {
            if registered.contains(&registration) {
                continue;
            }

            session
                .request(&Command::Register {
                    topic: &registration.topic,
                    channel: &registration.channel,
                })
                .await?;
            internal!(
                level = DEBUG,
                "Registered {}/{}",
                registration.topic,
                registration.channel
            );
            registered.push(registration);
        }

        Ok(())
    }

    fn set_state(&self, address: &str, state: PeerState) {
        self.peers.write().insert(address.to_string(), state);
    }
}
