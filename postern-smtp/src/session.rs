//! One SMTP conversation with a submitting client.
//!
//! The session accepts the minimal command set needed to receive a message:
//! `HELO`/`EHLO`, `MAIL FROM`, `RCPT TO`, `DATA`, `RSET`, `NOOP`, `QUIT` and
//! `STARTTLS`. After the terminating dot the message is scanned (when a
//! scanner is configured), split per recipient domain and enqueued. The
//! client only sees `250` once every enqueue is durable.

use std::{fmt::Display, net::SocketAddr, sync::Arc, time::Duration};

use postern_common::{
    Signal, envelope::Envelope, error::SessionError, incoming, internal, outgoing,
    status::Status, tracing,
};
use postern_scanner::Verdict;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::broadcast::{self, error::RecvError},
    time::Instant,
};

use crate::{
    SmtpArgs,
    command::{Command, CommandError},
    connection::Connection,
    error::ConnectionError,
};

const MAX_COMMAND_LINE: usize = 4096;
const MAX_DATA_LINE: usize = 64 * 1024;
const MAX_RECIPIENTS: usize = 100;

/// What the next read produced. The line itself is left in `Session::line`.
enum Input {
    Line,
    TooLong,
    Closed,
    Shutdown,
}

/// Where the conversation is.
enum State {
    Connected,
    Greeted,
    Mail(Envelope),
}

enum Flow {
    Continue,
    StartTls,
    Close,
}

pub struct Session<Stream: AsyncRead + AsyncWrite + Unpin + Send + Sync> {
    peer: SocketAddr,
    args: SmtpArgs,
    connection: Connection<Stream>,
    state: State,
    line: Vec<u8>,
    started: Instant,
}

impl<Stream: AsyncRead + AsyncWrite + Unpin + Send + Sync> Session<Stream> {
    pub fn create(stream: Stream, peer: SocketAddr, args: SmtpArgs) -> Self {
        Self {
            peer,
            args,
            connection: Connection::plain(stream),
            state: State::Connected,
            line: Vec::with_capacity(512),
            started: Instant::now(),
        }
    }

    /// Serve the client until it quits, disconnects, times out or the
    /// shutdown signal arrives.
    ///
    /// # Errors
    /// Timeouts, I/O failures and TLS handshake failures end the session
    #[tracing::instrument(level = "debug", skip_all, fields(peer = %self.peer))]
    pub async fn run(mut self, mut signal: broadcast::Receiver<Signal>) -> Result<(), SessionError> {
        internal!("Connected");

        if self.args.endpoint.address.is_implicit_tls() {
            self = self.secure().await?;
        }

        let greeting = format!("{} ESMTP postern", self.args.banner);
        self.reply(Status::ServiceReady, greeting).await?;

        loop {
            match self.serve(&mut signal).await? {
                Flow::StartTls => {
                    self = self.secure().await?;
                    self.state = State::Connected;
                }
                Flow::Continue | Flow::Close => break,
            }
        }

        internal!("Connection closed");
        Ok(())
    }

    /// Replace the plaintext connection with a TLS one.
    async fn secure(mut self) -> Result<Self, SessionError> {
        let endpoint = Arc::clone(&self.args.endpoint);
        let Some(tls) = endpoint.tls.as_ref() else {
            return Err(SessionError::Protocol("TLS is not configured".to_string()));
        };

        let (connection, info) = self
            .connection
            .upgrade(tls)
            .await
            .map_err(|err| SessionError::Protocol(err.to_string()))?;

        internal!(
            level = DEBUG,
            "Connection secured with {} using {}",
            info.protocol,
            info.cipher
        );

        self.connection = connection;
        Ok(self)
    }

    /// Answer commands until the connection ends or must be upgraded.
    async fn serve(
        &mut self,
        signal: &mut broadcast::Receiver<Signal>,
    ) -> Result<Flow, SessionError> {
        loop {
            let wait = self.args.endpoint.timeouts.command();

            match self.next_line(MAX_COMMAND_LINE, wait, signal).await? {
                Input::Line => {}
                Input::Closed => return Ok(Flow::Close),
                Input::Shutdown => return self.shutting_down().await,
                Input::TooLong => {
                    self.reply(Status::SyntaxError, "5.5.2 line too long").await?;
                    return Ok(Flow::Close);
                }
            }

            incoming!("{}", String::from_utf8_lossy(&self.line));

            let flow = match Command::try_from(self.line.as_slice()) {
                Ok(command) => self.dispatch(command, signal).await?,
                Err(CommandError::Unrecognised(_)) => {
                    self.reply(Status::SyntaxError, "5.5.2 command not recognised")
                        .await?;
                    Flow::Continue
                }
                Err(CommandError::Syntax(reason)) => {
                    self.reply(Status::ParameterError, format!("5.5.4 {reason}"))
                        .await?;
                    Flow::Continue
                }
            };

            if !matches!(flow, Flow::Continue) {
                return Ok(flow);
            }
        }
    }

    async fn dispatch(
        &mut self,
        command: Command,
        signal: &mut broadcast::Receiver<Signal>,
    ) -> Result<Flow, SessionError> {
        let (status, text) = match command {
            Command::Helo(id) => {
                self.state = State::Greeted;
                (Status::Ok, format!("{} says hello to {id}", self.args.banner))
            }
            Command::Ehlo(id) => {
                self.state = State::Greeted;
                let lines = self.capabilities(&id);
                self.reply_lines(Status::Ok, &lines).await?;
                return Ok(Flow::Continue);
            }
            Command::MailFrom { sender, size } => self.mail_from(sender, size),
            Command::RcptTo(recipient) => self.rcpt_to(recipient),
            Command::Rset => {
                if !matches!(self.state, State::Connected) {
                    self.state = State::Greeted;
                }
                (Status::Ok, "2.0.0 Ok".to_string())
            }
            Command::Noop => (Status::Ok, "2.0.0 Ok".to_string()),
            Command::Quit => {
                let text = format!("2.0.0 {} closing connection", self.args.banner);
                self.reply(Status::GoodBye, text).await?;
                return Ok(Flow::Close);
            }
            Command::StartTls => {
                if self.args.endpoint.tls.is_none() || self.connection.is_tls() {
                    (Status::NotImplemented, "5.5.1 STARTTLS not available".to_string())
                } else {
                    self.reply(Status::ServiceReady, "2.0.0 Ready to start TLS")
                        .await?;
                    if self.connection.discard_buffered() {
                        internal!(level = WARN, "Discarded data pipelined after STARTTLS");
                    }
                    return Ok(Flow::StartTls);
                }
            }
            Command::Data => return self.data(signal).await,
        };

        self.reply(status, text).await?;
        Ok(Flow::Continue)
    }

    fn capabilities(&self, id: &str) -> Vec<String> {
        let mut lines = vec![
            format!("{} greets {id}", self.args.banner),
            "PIPELINING".to_string(),
            "8BITMIME".to_string(),
            format!("SIZE {}", self.args.endpoint.max_message_size),
        ];

        if self.args.endpoint.tls.is_some() && !self.connection.is_tls() {
            lines.push("STARTTLS".to_string());
        }

        lines.push("ENHANCEDSTATUSCODES".to_string());
        lines
    }

    fn mail_from(&mut self, sender: String, size: Option<usize>) -> (Status, String) {
        let max = self.args.endpoint.max_message_size;

        match self.state {
            State::Connected => (
                Status::InvalidCommandSequence,
                "5.5.1 send HELO or EHLO first".to_string(),
            ),
            State::Mail(_) => (
                Status::InvalidCommandSequence,
                "5.5.1 sender already specified".to_string(),
            ),
            State::Greeted => {
                if let Some(size) = size
                    && max > 0
                    && size > max
                {
                    return (
                        Status::ExceededStorage,
                        "5.3.4 message size exceeds fixed maximum message size".to_string(),
                    );
                }

                self.state = State::Mail(Envelope::new(sender, Vec::new()));
                (Status::Ok, "2.1.0 Ok".to_string())
            }
        }
    }

    fn rcpt_to(&mut self, recipient: String) -> (Status, String) {
        match &mut self.state {
            State::Mail(envelope) if envelope.recipients().len() >= MAX_RECIPIENTS => (
                Status::InsufficientStorage,
                "4.5.3 too many recipients".to_string(),
            ),
            State::Mail(envelope) => {
                envelope.add_recipient(recipient);
                (Status::Ok, "2.1.5 Ok".to_string())
            }
            State::Connected | State::Greeted => (
                Status::InvalidCommandSequence,
                "5.5.1 need MAIL before RCPT".to_string(),
            ),
        }
    }

    /// Receive the message body after `DATA` and hand it to the queue.
    async fn data(&mut self, signal: &mut broadcast::Receiver<Signal>) -> Result<Flow, SessionError> {
        let envelope = match std::mem::replace(&mut self.state, State::Greeted) {
            State::Mail(envelope) if !envelope.recipients().is_empty() => envelope,
            state => {
                let text = if matches!(state, State::Mail(_)) {
                    "5.5.1 need RCPT before DATA"
                } else {
                    "5.5.1 need MAIL before DATA"
                };
                self.state = state;
                self.reply(Status::InvalidCommandSequence, text).await?;
                return Ok(Flow::Continue);
            }
        };

        self.reply(Status::StartMailInput, "End data with <CR><LF>.<CR><LF>")
            .await?;

        let max = self.args.endpoint.max_message_size;
        let wait = self.args.endpoint.timeouts.data_block();
        let mut payload = Vec::new();
        let mut oversize = false;

        loop {
            match self.next_line(MAX_DATA_LINE, wait, signal).await? {
                Input::Line => {}
                Input::Closed => return Ok(Flow::Close),
                Input::Shutdown => return self.shutting_down().await,
                Input::TooLong => {
                    self.reply(Status::SyntaxError, "5.5.2 line too long").await?;
                    return Ok(Flow::Close);
                }
            }

            if self.line == b"." {
                break;
            }

            if oversize {
                continue;
            }

            let line = self.line.strip_prefix(b".").unwrap_or(&self.line[..]);
            if max > 0 && payload.len() + line.len() + 2 > max {
                oversize = true;
                payload = Vec::new();
                continue;
            }

            payload.extend_from_slice(line);
            payload.extend_from_slice(b"\r\n");
        }

        if oversize {
            self.reply(
                Status::ExceededStorage,
                "5.3.4 message size exceeds fixed maximum message size",
            )
            .await?;
            return Ok(Flow::Continue);
        }

        let (status, text) = accept(&self.args, self.peer, envelope, payload).await;
        self.reply(status, text).await?;
        Ok(Flow::Continue)
    }

    async fn shutting_down(&mut self) -> Result<Flow, SessionError> {
        self.reply(Status::Unavailable, "4.3.2 Server shutting down, try again later")
            .await?;
        Ok(Flow::Close)
    }

    /// Read the next line into `self.line`, bounded by `wait`, the
    /// connection lifetime and the shutdown signal.
    async fn next_line(
        &mut self,
        limit: usize,
        wait: Duration,
        signal: &mut broadcast::Receiver<Signal>,
    ) -> Result<Input, SessionError> {
        let lifetime = self.started + self.args.endpoint.timeouts.connection();
        let deadline = (Instant::now() + wait).min(lifetime);

        self.line.clear();

        loop {
            tokio::select! {
                sig = signal.recv() => {
                    if matches!(sig, Ok(Signal::Shutdown) | Err(RecvError::Closed)) {
                        return Ok(Input::Shutdown);
                    }
                }

                () = tokio::time::sleep_until(deadline) => {
                    tracing::warn!(peer = %self.peer, "Client connection timed out");
                    let _ = self
                        .connection
                        .send(&format!("{} 4.4.2 {} timeout, closing connection", Status::Unavailable, self.args.banner))
                        .await;
                    return Err(SessionError::Timeout(wait.as_secs()));
                }

                read = self.connection.read_line(&mut self.line, limit) => {
                    return match read {
                        Ok(true) => Ok(Input::Line),
                        Ok(false) => Ok(Input::Closed),
                        Err(ConnectionError::LineTooLong(_)) => Ok(Input::TooLong),
                        Err(ConnectionError::Io(err)) => Err(SessionError::Connection(err)),
                    };
                }
            }
        }
    }

    async fn reply(&mut self, status: Status, text: impl Display + Send + Sync) -> Result<(), SessionError> {
        let line = format!("{status} {text}");
        outgoing!("{line}");

        self.connection.send(&line).await.map_err(|err| {
            internal!(level = DEBUG, "{err}");
            SessionError::Protocol(format!("Failed to send response: {err}"))
        })
    }

    async fn reply_lines(&mut self, status: Status, lines: &[String]) -> Result<(), SessionError> {
        for (index, text) in lines.iter().enumerate() {
            let separator = if index + 1 == lines.len() { ' ' } else { '-' };
            let line = format!("{status}{separator}{text}");
            outgoing!("{line}");

            self.connection
                .send(&line)
                .await
                .map_err(|err| SessionError::Protocol(format!("Failed to send response: {err}")))?;
        }

        Ok(())
    }
}

/// Scan, split and enqueue a received message, producing the final reply.
async fn accept(
    args: &SmtpArgs,
    peer: SocketAddr,
    envelope: Envelope,
    payload: Vec<u8>,
) -> (Status, String) {
    if let Some(scanner) = &args.scanner {
        match scanner.scan(&payload).await {
            Ok(Verdict::Clean) => {}
            Ok(Verdict::Infected(signature)) => {
                internal!(
                    level = WARN,
                    "Rejected message from {peer}: content matched {signature}"
                );
                return (
                    Status::TransactionFailed,
                    format!("5.7.1 message rejected: {signature}"),
                );
            }
            Err(err) => {
                internal!(level = WARN, "Unable to scan message from {peer}: {err}");
                return (
                    Status::ActionUnavailable,
                    "4.7.1 content scanner unavailable, try again later".to_string(),
                );
            }
        }
    }

    let mut ids = Vec::new();

    for group in envelope.split_by_domain() {
        match args.queue.enqueue(&args.channel, group, payload.clone()).await {
            Ok(id) => ids.push(id.to_string()),
            Err(err) => {
                internal!(level = ERROR, "Failed to enqueue message from {peer}: {err}");
                return (
                    Status::ActionUnavailable,
                    "4.3.0 queue unavailable, try again later".to_string(),
                );
            }
        }
    }

    let ids = ids.join(",");
    internal!(
        level = INFO,
        "Accepted message from {peer} for {} recipients as {ids}",
        envelope.recipients().len()
    );

    (Status::Ok, format!("2.0.0 Ok: queued as {ids}"))
}
