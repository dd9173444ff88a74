use std::{fmt::Debug, future::Future, net::SocketAddr};

use tokio::{net::TcpStream, sync::broadcast};

use crate::{
    Signal,
    error::{ProtocolError, SessionError},
};

pub trait SessionHandler {
    fn run(
        self,
        signal: broadcast::Receiver<Signal>,
    ) -> impl Future<Output = Result<(), SessionError>> + Send;
}

/// A wire protocol served by a [`Listener`](crate::listener::Listener).
///
/// `Args` carries everything a session needs: the listener's settings plus
/// any shared runtime handles (queue, scanner) injected at construction.
pub trait Protocol: Send + Sync + 'static {
    type Session: SessionHandler + Send + 'static;
    type Args: Clone + Debug + Send + Sync + 'static;

    fn handle(&self, stream: TcpStream, peer: SocketAddr, args: &Self::Args) -> Self::Session;

    ///
    /// Validate the arguments being provided to the protocol
    ///
    /// # Errors
    /// Depends on the protocol, e.g. TLS material that does not exist.
    ///
    fn validate(&self, args: &Self::Args) -> Result<(), ProtocolError>;

    fn ty() -> &'static str;
}
