use std::{net::SocketAddr, sync::Arc};

use tokio::{net::TcpListener, sync::broadcast, task::JoinSet};

use crate::{
    Signal,
    error::{BindError, ProtocolError},
    internal,
    traits::protocol::{Protocol, SessionHandler},
};

/// One configured endpoint, not yet bound.
pub struct Listener<Proto: Protocol> {
    handler: Arc<Proto>,
    socket: SocketAddr,
    args: Proto::Args,
}

impl<Proto: Protocol> Listener<Proto> {
    pub const fn new(handler: Arc<Proto>, socket: SocketAddr, args: Proto::Args) -> Self {
        Self {
            handler,
            socket,
            args,
        }
    }

    pub const fn socket(&self) -> SocketAddr {
        self.socket
    }

    /// # Errors
    /// If the protocol rejects its arguments
    #[tracing::instrument(level = "trace", skip(self), fields(socket = %self.socket))]
    pub fn init(&self) -> Result<(), ProtocolError> {
        self.handler.validate(&self.args)
    }

    /// Bind the endpoint. Nothing is accepted until [`BoundListener::serve`].
    ///
    /// # Errors
    /// [`BindError::Failed`] if the socket cannot be bound
    pub async fn bind(self) -> Result<BoundListener<Proto>, BindError> {
        let listener = TcpListener::bind(self.socket)
            .await
            .map_err(|source| BindError::Failed {
                address: self.socket,
                source,
            })?;

        let local = listener.local_addr().map_err(|source| BindError::Failed {
            address: self.socket,
            source,
        })?;

        internal!(level = INFO, "{} listener bound to {local}", Proto::ty());

        Ok(BoundListener {
            listener,
            local,
            handler: self.handler,
            args: self.args,
        })
    }
}

/// An endpoint holding its socket, ready to accept sessions.
pub struct BoundListener<Proto: Protocol> {
    listener: TcpListener,
    local: SocketAddr,
    handler: Arc<Proto>,
    args: Proto::Args,
}

impl<Proto: Protocol> BoundListener<Proto> {
    pub const fn local_addr(&self) -> SocketAddr {
        self.local
    }

    /// Accept sessions until a shutdown signal arrives, then wait for the
    /// running sessions (which see the same signal) to finish.
    #[tracing::instrument(level = "trace", skip_all, fields(socket = %self.local))]
    pub async fn serve(self, mut shutdown: broadcast::Receiver<Signal>) {
        internal!("Serving {} on {}", Proto::ty(), self.local);

        let mut sessions = JoinSet::new();

        loop {
            tokio::select! {
                sig = shutdown.recv() => {
                    if matches!(sig, Ok(Signal::Shutdown) | Err(broadcast::error::RecvError::Closed)) {
                        internal!(
                            level = INFO,
                            "{} Listener {} received Shutdown signal, finishing {} sessions ...",
                            Proto::ty(),
                            self.local,
                            sessions.len()
                        );
                        break;
                    }
                }

                connection = self.listener.accept() => {
                    match connection {
                        Ok((stream, peer)) => {
                            tracing::debug!("Connection received on {} from {peer}", self.local);
                            let session = self.handler.handle(stream, peer, &self.args);
                            let signal = shutdown.resubscribe();

                            sessions.spawn(async move {
                                if let Err(err) = session.run(signal).await {
                                    if err.is_client_error() {
                                        internal!(level = DEBUG, "Session with {peer} ended: {err}");
                                    } else {
                                        internal!(level = ERROR, "Session with {peer} failed: {err}");
                                    }
                                }
                            });
                        }
                        Err(err) => {
                            internal!(level = WARN, "Failed to accept on {}: {err}", self.local);
                        }
                    }
                }

                Some(_) = sessions.join_next(), if !sessions.is_empty() => {}
            }
        }

        while sessions.join_next().await.is_some() {}
        internal!(level = INFO, "{} Listener {} stopped", Proto::ty(), self.local);
    }
}
