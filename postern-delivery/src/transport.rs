//! Outbound transfer of one queued message.
//!
//! [`SmtpTransport`] walks the destination's mail servers in preference order
//! and runs one SMTP transaction against the first that accepts the
//! connection:
//! 1. connect and read the greeting
//! 2. EHLO, falling back to HELO
//! 3. STARTTLS according to the configured [`TlsPolicy`]
//! 4. MAIL FROM, one RCPT TO per recipient, DATA
//! 5. QUIT

use std::{future::Future, sync::Arc, time::Duration};

use async_trait::async_trait;
use postern_common::{config::TlsPolicy, internal, tracing};
use postern_queue::Message;
use postern_smtp::client::{ClientError, Response, SmtpClient};

use crate::{
    config::{DeliveryConfig, split_host_port},
    dns::{MailServer, MxResolver},
    error::{DeliveryError, PermanentError, SystemError, TemporaryError},
};

/// Moves a message to its destination.
#[async_trait]
pub trait Transport: Send + Sync {
    /// # Errors
    /// [`DeliveryError::Permanent`] when retrying cannot help, anything else
    /// when it might
    async fn deliver(&self, message: &Message) -> Result<(), DeliveryError>;
}

/// Where a transport sends mail.
#[derive(Debug)]
enum Route {
    Relay(MailServer),
    Mx(MxResolver),
}

#[derive(Debug)]
pub struct SmtpTransport {
    route: Route,
    config: Arc<DeliveryConfig>,
    helo_name: String,
}

impl SmtpTransport {
    /// # Errors
    /// An unusable relay address, or a system resolver that cannot be loaded
    pub fn new(config: Arc<DeliveryConfig>) -> Result<Self, DeliveryError> {
        let route = match config.relay.as_deref() {
            Some(relay) => {
                let (host, port) = split_host_port(relay, config.port)
                    .map_err(|err| SystemError::Configuration(err.to_string()))?;
                internal!(level = INFO, "Relaying all outbound mail through {host}:{port}");
                Route::Relay(MailServer::new(host, 0, port))
            }
            None => Route::Mx(
                MxResolver::new(config.dns.clone(), config.port)
                    .map_err(|err| SystemError::Configuration(err.to_string()))?,
            ),
        };

        if config.tls.accept_invalid_certs {
            tracing::warn!("TLS certificate validation is disabled for outbound delivery");
        }

        Ok(Self {
            route,
            helo_name: config.helo_name(),
            config,
        })
    }

    async fn servers(&self, domain: &str) -> Result<Arc<[MailServer]>, DeliveryError> {
        match &self.route {
            Route::Relay(relay) => Ok(Arc::from([relay.clone()])),
            Route::Mx(resolver) => Ok(resolver.resolve(domain).await?),
        }
    }
}

#[async_trait]
impl Transport for SmtpTransport {
    #[tracing::instrument(level = "debug", skip_all, fields(id = %message.id, attempt = message.attempts))]
    async fn deliver(&self, message: &Message) -> Result<(), DeliveryError> {
        let domain = message.envelope.domain().ok_or_else(|| {
            PermanentError::InvalidRecipient(format!(
                "{:?} do not share a single domain",
                message.envelope.recipients()
            ))
        })?;

        let servers = self.servers(&domain).await?;
        let mut last_error = None;

        for server in servers.iter() {
            let transaction = Transaction {
                server,
                message,
                config: &self.config,
                helo_name: &self.helo_name,
            };

            match transaction.execute().await {
                Ok(()) => {
                    internal!(level = INFO, "Delivered {} to {server}", message.id);
                    return Ok(());
                }
                Err(err) if err.is_unreachable() => {
                    internal!(level = WARN, "{server} unavailable for {domain}: {err}");
                    last_error = Some(err);
                }
                Err(err) => return Err(err),
            }
        }

        Err(last_error.unwrap_or_else(|| PermanentError::NoMailServers(domain).into()))
    }
}

/// Wait at most `secs` for one step of the conversation.
async fn timed<T>(
    secs: u64,
    what: &str,
    step: impl Future<Output = Result<T, ClientError>>,
) -> Result<T, DeliveryError> {
    tokio::time::timeout(Duration::from_secs(secs), step)
        .await
        .map_err(|_| TemporaryError::Timeout(format!("{what} timed out after {secs}s")))?
        .map_err(DeliveryError::from)
}

/// Turn anything other than a 2xx/3xx reply into an error.
fn expect_ok(what: &str, response: Response) -> Result<Response, DeliveryError> {
    if response.is_success() || response.is_intermediate() {
        Ok(response)
    } else {
        Err(DeliveryError::from_response(what, &response))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TlsOutcome {
    Secured,
    Skipped,
    /// Opportunistic STARTTLS failed; reconnect in plaintext (RFC 3207
    /// section 4.1).
    Reconnect,
}

struct Transaction<'a> {
    server: &'a MailServer,
    message: &'a Message,
    config: &'a DeliveryConfig,
    helo_name: &'a str,
}

impl Transaction<'_> {
    async fn execute(self) -> Result<(), DeliveryError> {
        let mut client = self.connect().await?;
        let mut ehlo = self.greet(&mut client).await?;

        match self.negotiate_tls(&mut client, &ehlo).await? {
            TlsOutcome::Secured => ehlo = self.greet_again(&mut client).await?,
            TlsOutcome::Skipped => {}
            TlsOutcome::Reconnect => {
                drop(client);
                client = self.connect().await?;
                ehlo = self.greet(&mut client).await?;
            }
        }

        self.transfer(&mut client, &ehlo).await?;

        if let Err(err) = timed(self.config.smtp_timeouts.quit_secs, "QUIT", client.quit()).await {
            internal!(level = DEBUG, "QUIT to {} after delivery failed: {err}", self.server);
        }

        Ok(())
    }

    async fn connect(&self) -> Result<SmtpClient, DeliveryError> {
        let timeouts = &self.config.smtp_timeouts;

        let mut client = timed(
            timeouts.connect_secs,
            "connect",
            SmtpClient::connect(&self.server.host, self.server.port),
        )
        .await
        .map_err(|err| match err {
            DeliveryError::Temporary(TemporaryError::Timeout(msg)) => {
                TemporaryError::ConnectionFailed(msg).into()
            }
            other => other,
        })?
        .accept_invalid_certs(self.config.tls.accept_invalid_certs);

        let greeting = timed(timeouts.ehlo_secs, "greeting", client.read_greeting())
            .await
            .map_err(|err| match err {
                DeliveryError::Temporary(TemporaryError::Timeout(msg)) => {
                    TemporaryError::ConnectionFailed(msg).into()
                }
                other => other,
            })?;
        if !greeting.is_success() {
            return Err(TemporaryError::ServerBusy(greeting.to_string()).into());
        }

        Ok(client)
    }

    /// EHLO, or HELO for servers that refuse it.
    async fn greet(&self, client: &mut SmtpClient) -> Result<Response, DeliveryError> {
        let secs = self.config.smtp_timeouts.ehlo_secs;

        let ehlo = timed(secs, "EHLO", client.ehlo(self.helo_name)).await?;
        if ehlo.is_success() {
            return Ok(ehlo);
        }

        if ehlo.is_permanent_error() {
            let helo = timed(secs, "HELO", client.helo(self.helo_name)).await?;
            if helo.is_success() {
                // No extensions without EHLO.
                return Ok(Response::new(helo.code, helo.lines.into_iter().take(1).collect()));
            }
            return Err(TemporaryError::ServerBusy(format!("HELO refused: {helo}")).into());
        }

        Err(TemporaryError::ServerBusy(format!("EHLO refused: {ehlo}")).into())
    }

    async fn greet_again(&self, client: &mut SmtpClient) -> Result<Response, DeliveryError> {
        let ehlo = timed(
            self.config.smtp_timeouts.ehlo_secs,
            "EHLO after STARTTLS",
            client.ehlo(self.helo_name),
        )
        .await?;
        expect_ok("EHLO after STARTTLS", ehlo)
    }

    async fn negotiate_tls(
        &self,
        client: &mut SmtpClient,
        ehlo: &Response,
    ) -> Result<TlsOutcome, DeliveryError> {
        let policy = self.config.tls.policy;
        if policy == TlsPolicy::Disabled {
            return Ok(TlsOutcome::Skipped);
        }

        let required = policy == TlsPolicy::Required;
        if !ehlo.supports("STARTTLS") {
            if required {
                return Err(PermanentError::TlsRequired(format!(
                    "{} does not offer STARTTLS",
                    self.server
                ))
                .into());
            }
            return Ok(TlsOutcome::Skipped);
        }

        let failure = match timed(
            self.config.smtp_timeouts.starttls_secs,
            "STARTTLS",
            client.starttls(),
        )
        .await
        {
            Ok(response) if response.is_success() => return Ok(TlsOutcome::Secured),
            Ok(response) => format!("STARTTLS refused: {response}"),
            Err(err) => err.to_string(),
        };

        if required {
            return Err(PermanentError::TlsRequired(failure).into());
        }

        internal!(
            level = INFO,
            "{failure}; retrying {} without TLS",
            self.server
        );
        Ok(TlsOutcome::Reconnect)
    }

    async fn transfer(&self, client: &mut SmtpClient, ehlo: &Response) -> Result<(), DeliveryError> {
        let timeouts = &self.config.smtp_timeouts;
        let envelope = &self.message.envelope;
        let size = ehlo.supports("SIZE").then_some(self.message.payload.len());

        let reply = timed(
            timeouts.mail_from_secs,
            "MAIL FROM",
            client.mail_from(envelope.sender(), size),
        )
        .await?;
        expect_ok("MAIL FROM", reply)?;

        let mut accepted = 0;
        let mut rejected = Vec::new();

        for recipient in envelope.recipients() {
            let reply = timed(timeouts.rcpt_to_secs, "RCPT TO", client.rcpt_to(recipient)).await?;

            if reply.is_success() {
                accepted += 1;
            } else if reply.is_permanent_error() {
                internal!(level = WARN, "{} rejected {recipient}: {reply}", self.server);
                rejected.push(format!("{recipient}: {reply}"));
            } else {
                // Anything delivered now would be delivered again on retry.
                let _ = timed(timeouts.quit_secs, "RSET", client.rset()).await;
                return Err(DeliveryError::from_response(
                    &format!("RCPT TO {recipient}"),
                    &reply,
                ));
            }
        }

        if accepted == 0 {
            return Err(PermanentError::RecipientsRejected(rejected.join("; ")).into());
        }

        let reply = timed(timeouts.data_secs, "DATA", client.data()).await?;
        if !reply.is_intermediate() {
            return Err(DeliveryError::from_response("DATA", &reply));
        }

        let reply = timed(
            timeouts.data_secs,
            "message transfer",
            client.send_data(&self.message.payload),
        )
        .await?;
        expect_ok("end of data", reply)?;

        if !rejected.is_empty() {
            internal!(
                level = WARN,
                "{} delivered to {accepted} recipient(s), {} rejected permanently",
                self.message.id,
                rejected.len()
            );
        }

        Ok(())
    }
}
