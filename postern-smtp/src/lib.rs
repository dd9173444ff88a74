pub mod client;
pub mod command;
pub mod config;
pub mod connection;
pub mod endpoint;
pub mod error;
pub mod session;

use std::{
    fmt::{self, Debug, Formatter},
    net::SocketAddr,
    sync::Arc,
};

use postern_common::{
    Signal,
    error::{ProtocolError, SessionError},
    host::hostname,
    traits::protocol::{Protocol, SessionHandler},
    tracing,
};
use postern_queue::{DurableQueue, types::is_valid_channel_name};
use postern_scanner::ContentScanner;
use tokio::net::TcpStream;

pub use crate::{
    config::{FrontendConfig, ListenerConfig, TlsContext},
    endpoint::{Endpoint, Scheme},
    session::Session,
};

#[derive(Default)]
pub struct Smtp;

/// Everything a session needs: its listener's settings plus the shared
/// queue and scanner handles.
#[derive(Clone)]
pub struct SmtpArgs {
    endpoint: Arc<ListenerConfig>,
    banner: Arc<str>,
    channel: Arc<str>,
    queue: Arc<dyn DurableQueue>,
    scanner: Option<Arc<dyn ContentScanner>>,
}

impl Debug for SmtpArgs {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("SmtpArgs")
            .field("endpoint", &self.endpoint)
            .field("banner", &self.banner)
            .field("channel", &self.channel)
            .field("scanner", &self.scanner.is_some())
            .finish_non_exhaustive()
    }
}

impl SmtpArgs {
    pub fn new(endpoint: ListenerConfig, queue: Arc<dyn DurableQueue>) -> Self {
        let banner: Arc<str> = if endpoint.banner.is_empty() {
            hostname().into()
        } else {
            endpoint.banner.as_str().into()
        };

        Self {
            endpoint: Arc::new(endpoint),
            banner,
            channel: "delivery".into(),
            queue,
            scanner: None,
        }
    }

    /// Set the channel accepted messages are enqueued on
    #[must_use]
    pub fn with_channel(mut self, channel: &str) -> Self {
        self.channel = channel.into();
        self
    }

    /// Set the content scanner consulted before enqueueing
    #[must_use]
    pub fn with_scanner(mut self, scanner: Option<Arc<dyn ContentScanner>>) -> Self {
        self.scanner = scanner;
        self
    }

    /// Override the host name announced to clients
    #[must_use]
    pub fn with_banner(mut self, banner: &str) -> Self {
        self.banner = banner.into();
        self
    }

    pub fn endpoint(&self) -> &ListenerConfig {
        &self.endpoint
    }
}

impl Protocol for Smtp {
    type Session = Session<TcpStream>;
    type Args = SmtpArgs;

    fn ty() -> &'static str {
        "SMTP"
    }

    fn handle(&self, stream: TcpStream, peer: SocketAddr, args: &SmtpArgs) -> Self::Session {
        Session::create(stream, peer, args.clone())
    }

    #[tracing::instrument(level = "trace", skip(self))]
    fn validate(&self, args: &SmtpArgs) -> Result<(), ProtocolError> {
        if args.endpoint.address.is_implicit_tls() && args.endpoint.tls.is_none() {
            return Err(ProtocolError::MissingField("tls"));
        }

        if let Some(tls) = args.endpoint.tls.as_ref() {
            for (what, path) in [("Certificate", &tls.certificate), ("Key", &tls.key)] {
                if !path.try_exists()? {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::NotFound,
                        format!("Unable to find TLS {what} {}", path.display()),
                    )
                    .into());
                }
            }
        }

        if !is_valid_channel_name(&args.channel) {
            return Err(ProtocolError::InvalidConfiguration {
                field: "channel".to_string(),
                reason: format!("{:?} is not a valid channel name", args.channel),
            });
        }

        Ok(())
    }
}

impl SessionHandler for Session<TcpStream> {
    async fn run(self, signal: tokio::sync::broadcast::Receiver<Signal>) -> Result<(), SessionError> {
        Self::run(self, signal).await
    }
}

#[cfg(test)]
mod tests {
    use postern_queue::{Queue, QueueConfig};
    use pretty_assertions::assert_eq;

    use super::*;

    #[tokio::test]
    async fn banner_defaults_to_the_system_hostname() {
        let dir = tempfile::tempdir().unwrap();
        let queue: Arc<dyn DurableQueue> = Arc::new(
            Queue::open(dir.path(), QueueConfig::default(), true)
                .await
                .unwrap(),
        );
        let address: Endpoint = "smtp://127.0.0.1:0".parse().unwrap();

        let args = SmtpArgs::new(ListenerConfig::new(address.clone()), Arc::clone(&queue));
        assert_eq!(&*args.banner, hostname());

        let mut named = ListenerConfig::new(address);
        named.banner = "mx.example.net".to_string();
        assert_eq!(&*SmtpArgs::new(named, queue).banner, "mx.example.net");
    }
}
