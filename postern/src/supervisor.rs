use std::{future::Future, net::SocketAddr, path::Path, sync::Arc};

use postern_cluster::{Coordinator, Registration, RegistrationSource, Topology};
use postern_common::{
    Signal,
    controller::{BoundController, Controller},
    internal,
    listener::Listener,
};
use postern_delivery::{SmtpTransport, Worker};
use postern_queue::{DurableQueue, Queue};
use postern_scanner::{ClamdScanner, ContentScanner};
use postern_smtp::{Smtp, SmtpArgs};
use tokio::{
    sync::{broadcast, mpsc},
    task::JoinHandle,
};

use crate::{config::Config, error::SupervisorError};

/// Creates `path` and its parents, owner-only on Unix.
async fn create_private_dir(path: &Path) -> Result<(), SupervisorError> {
    let mut builder = tokio::fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    builder.mode(0o700);

    builder
        .create(path)
        .await
        .map_err(|source| SupervisorError::Storage {
            path: path.to_path_buf(),
            source,
        })
}

/// Advertises whatever channels the queue holds, including ones created on
/// first use after startup.
struct QueueChannels(Arc<Queue>);

impl RegistrationSource for QueueChannels {
    fn registrations(&self) -> Vec<Registration> {
        self.0
            .channel_specs()
            .into_iter()
            .map(|spec| Registration::new(spec.topic, spec.name))
            .collect()
    }
}

/// Create the storage layout and open the queue with its channels loaded.
///
/// # Errors
/// Directory creation, a missing or foreign queue format marker, or
/// metadata that cannot be read or written
pub async fn open_queue(config: &Config) -> Result<Queue, SupervisorError> {
    create_private_dir(&config.queue_path()).await?;
    create_private_dir(&config.tls_path()).await?;

    let queue = Queue::open(config.queue_path(), config.queue.clone(), config.auto_create).await?;
    queue.load_metadata().await?;

    for spec in config.channel_specs() {
        queue.ensure_channel(&spec).await?;
    }
    queue.persist_metadata().await?;

    Ok(queue)
}

/// Validate everything `start` would, without binding or spawning anything.
///
/// # Errors
/// The first startup step that fails
pub async fn check(config: &Config) -> Result<(), SupervisorError> {
    config.validate()?;
    let queue = open_queue(config).await?;

    internal!(
        level = INFO,
        "Configuration OK, queue channels: {:?}",
        queue.channel_names()
    );
    Ok(())
}

struct Component {
    name: &'static str,
    shutdown: broadcast::Sender<Signal>,
    handle: JoinHandle<()>,
}

impl Component {
    /// Spawn `serve`, reporting on `exited` when it returns.
    fn spawn<F, Fut>(
        name: &'static str,
        exited: &mpsc::UnboundedSender<&'static str>,
        serve: F,
    ) -> Self
    where
        F: FnOnce(broadcast::Receiver<Signal>) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (shutdown, receiver) = broadcast::channel(16);
        let task = serve(receiver);
        let exited = exited.clone();

        let handle = tokio::spawn(async move {
            task.await;
            let _ = exited.send(name);
        });

        Self {
            name,
            shutdown,
            handle,
        }
    }

    async fn stop(self) {
        internal!(level = DEBUG, "Stopping {}", self.name);

        let _ = self.shutdown.send(Signal::Shutdown);
        if let Err(err) = self.handle.await {
            internal!(level = ERROR, "{} task failed: {err}", self.name);
        }
    }
}

/// A started node.
pub struct Running {
    queue: Arc<Queue>,
    local_addrs: Vec<SocketAddr>,
    coordinator: Option<Arc<Coordinator>>,
    frontend: Option<Component>,
    worker: Option<Component>,
    cluster: Option<Component>,
    service: Component,
    exited: mpsc::UnboundedReceiver<&'static str>,
}

impl std::fmt::Debug for Running {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Running")
            .field("queue", &self.queue)
            .field("local_addrs", &self.local_addrs)
            .field("frontend", &self.frontend.is_some())
            .field("worker", &self.worker.is_some())
            .field("cluster", &self.cluster.is_some())
            .finish_non_exhaustive()
    }
}

/// Bring every enabled component up in order.
///
/// Nothing is left running when this fails.
///
/// # Errors
/// Invalid configuration, storage, an unreachable mandatory scanner, an
/// unusable listener, or a bind failure under the configured policy
#[tracing::instrument(level = "trace", skip_all, err)]
pub async fn start(config: &Config) -> Result<Running, SupervisorError> {
    config.validate()?;

    let queue = Arc::new(open_queue(config).await?);
    let shared: Arc<dyn DurableQueue> = Arc::clone(&queue) as Arc<dyn DurableQueue>;

    let scanner = scanner(config).await?;

    let frontend = if config.frontend.enabled {
        let mut controller = Controller::new(config.frontend.bind_policy);
        for listener in &config.frontend.listeners {
            let socket = listener.address.socket_addr()?;
            let args = SmtpArgs::new(listener.clone(), Arc::clone(&shared))
                .with_channel(&config.frontend.channel)
                .with_scanner(scanner.clone());
            controller = controller.with_listener(Listener::new(Arc::new(Smtp), socket, args));
        }
        controller.init()?;
        Some(controller.bind().await?)
    } else {
        None
    };

    let worker = if config.delivery.enabled {
        let transport = SmtpTransport::new(Arc::new(config.delivery.clone()))?;
        Some(Worker::new(
            &config.delivery,
            Arc::clone(&shared),
            Arc::new(transport),
            config.queue.msg_timeout,
        ))
    } else {
        None
    };

    let coordinator = config.cluster.enabled.then(|| {
        Arc::new(Coordinator::new(
            config.cluster.clone(),
            QueueChannels(Arc::clone(&queue)),
        ))
    });

    Ok(spawn(queue, frontend, worker, coordinator))
}

async fn scanner(config: &Config) -> Result<Option<Arc<dyn ContentScanner>>, SupervisorError> {
    if !config.scanner.enabled {
        return Ok(None);
    }

    let scanner = ClamdScanner::from_config(&config.scanner);
    match scanner.ping().await {
        Ok(()) => internal!(level = INFO, "Content scanner reachable"),
        Err(err) if config.scanner.mandatory => return Err(err.into()),
        Err(err) => internal!(level = WARN, "Content scanner unavailable, continuing: {err}"),
    }

    Ok(Some(Arc::new(scanner)))
}

fn spawn(
    queue: Arc<Queue>,
    frontend: Option<BoundController<Smtp>>,
    worker: Option<Worker>,
    coordinator: Option<Arc<Coordinator>>,
) -> Running {
    let (exited_tx, exited) = mpsc::unbounded_channel();

    let service = Component::spawn("queue service", &exited_tx, |rx| Arc::clone(&queue).serve(rx));

    let local_addrs = frontend
        .as_ref()
        .map(BoundController::local_addrs)
        .unwrap_or_default();
    let frontend =
        frontend.map(|bound| Component::spawn("frontend", &exited_tx, |rx| bound.control(rx)));

    let worker = worker
        .map(|worker| Component::spawn("delivery worker", &exited_tx, |rx| worker.serve(rx)));

    let cluster = coordinator.as_ref().map(|coordinator| {
        let coordinator = Arc::clone(coordinator);
        Component::spawn("cluster coordinator", &exited_tx, |rx| coordinator.serve(rx))
    });

    internal!(level = INFO, "postern running");

    Running {
        queue,
        local_addrs,
        coordinator,
        frontend,
        worker,
        cluster,
        service,
        exited,
    }
}

impl Running {
    pub fn queue(&self) -> &Arc<Queue> {
        &self.queue
    }

    /// Addresses the frontend actually bound.
    pub fn local_addrs(&self) -> &[SocketAddr] {
        &self.local_addrs
    }

    pub fn topology(&self) -> Option<Topology> {
        self.coordinator.as_ref().map(|coordinator| coordinator.topology())
    }

    /// Wait for `termination`, or for a component to stop on its own, then
    /// shut down.
    ///
    /// # Errors
    /// See [`Running::shutdown`]
    pub async fn run_until<F>(mut self, termination: F) -> Result<(), SupervisorError>
    where
        F: Future<Output = ()>,
    {
        tokio::select! {
            () = termination => {}
            Some(name) = self.exited.recv() => {
                internal!(level = ERROR, "{name} stopped unexpectedly, shutting down");
            }
        }

        self.shutdown().await
    }

    /// Stop intake, let running deliveries finish, then make the queue
    /// durable.
    ///
    /// # Errors
    /// [`SupervisorError::Flush`] or [`SupervisorError::PendingRecords`]
    /// when queue state could not be persisted
    #[tracing::instrument(level = "trace", skip_all, err)]
    pub async fn shutdown(self) -> Result<(), SupervisorError> {
        internal!(level = INFO, "Shutting down...");

        if let Some(frontend) = self.frontend {
            frontend.stop().await;
        }

        self.queue.close();

        if let Some(worker) = self.worker {
            worker.stop().await;
        }

        if let Some(cluster) = self.cluster {
            cluster.stop().await;
        }

        self.service.stop().await;

        let persisted = self.queue.persist_metadata().await;
        let flushed = self.queue.flush().await;
        persisted.and(flushed).map_err(SupervisorError::Flush)?;

        if self.queue.has_pending().await {
            return Err(SupervisorError::PendingRecords);
        }

        internal!(level = INFO, "Shutdown complete");
        Ok(())
    }
}

/// Resolves on SIGINT or SIGTERM.
///
/// # Errors
/// If the handlers cannot be installed
pub fn termination() -> Result<impl Future<Output = ()>, SupervisorError> {
    let mut terminate = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .map_err(SupervisorError::Signal)?;

    Ok(async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                internal!(level = INFO, "Interrupt received, shutting down");
            }
            _ = terminate.recv() => {
                internal!(level = INFO, "Terminate signal received, shutting down");
            }
        }
    })
}

/// Start, wait for a termination signal, shut down.
///
/// # Errors
/// Any startup failure, or a failed shutdown flush
pub async fn run(config: &Config) -> Result<(), SupervisorError> {
    let running = start(config).await?;
    let termination = termination()?;
    running.run_until(termination).await
}
