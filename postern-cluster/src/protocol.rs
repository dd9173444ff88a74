//! The lookupd TCP protocol, client side.
//!
//! After the 4-byte magic, commands are newline-terminated text. `IDENTIFY`
//! carries a `[u32 BE size][JSON]` body. Every reply is `[u32 BE size][body]`,
//! `OK` on success or an `E_*` code on failure.

use std::time::Duration;

use postern_common::{incoming, outgoing};
use serde::Serialize;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    time::timeout,
};

use crate::error::{ClusterError, Result};

pub const MAGIC: &[u8; 4] = b"  V1";

/// Replies larger than this are treated as a protocol violation.
pub const MAX_RESPONSE_SIZE: u32 = 1024 * 1024;

/// What this node tells the discovery service about itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Identity {
    pub broadcast_address: String,
    pub hostname: String,
    pub tcp_port: u16,
    pub http_port: u16,
    pub version: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command<'a> {
    Identify(&'a Identity),
    Register { topic: &'a str, channel: &'a str },
    Unregister { topic: &'a str, channel: &'a str },
    Ping,
}

impl Command<'_> {
    fn name(&self) -> &'static str {
        match self {
            Self::Identify(_) => "IDENTIFY",
            Self::Register { .. } => "REGISTER",
            Self::Unregister { .. } => "UNREGISTER",
            Self::Ping => "PING",
        }
    }

    /// Wire form of the command.
    ///
    /// # Errors
    /// If the identity cannot be serialised
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(match self {
            Self::Identify(identity) => {
                let body = serde_json::to_vec(identity)?;
                let size = u32::try_from(body.len())
                    .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;

                let mut bytes = b"IDENTIFY\n".to_vec();
                bytes.extend_from_slice(&size.to_be_bytes());
                bytes.extend_from_slice(&body);
                bytes
            }
            Self::Register { topic, channel } => format!("REGISTER {topic} {channel}\n").into_bytes(),
            Self::Unregister { topic, channel } => {
                format!("UNREGISTER {topic} {channel}\n").into_bytes()
            }
            Self::Ping => b"PING\n".to_vec(),
        })
    }
}

impl std::fmt::Display for Command<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Register { topic, channel } | Self::Unregister { topic, channel } => {
                write!(f, "{} {topic} {channel}", self.name())
            }
            _ => f.write_str(self.name()),
        }
    }
}

/// One discovery connection after the magic has been sent.
pub struct Session<S> {
    stream: S,
    timeout: Duration,
}

impl<S: AsyncRead + AsyncWrite + Unpin> Session<S> {
    /// Send the protocol magic.
    ///
    /// # Errors
    /// If the write fails
    pub async fn open(mut stream: S, timeout: Duration) -> Result<Self> {
        stream.write_all(MAGIC).await?;
        stream.flush().await?;
        Ok(Self { stream, timeout })
    }

    /// Send `command` and wait for its reply.
    ///
    /// # Errors
    /// I/O failures, timeouts, and `E_*` replies. `IDENTIFY` answers with
    /// the peer's own identity, every other command with `OK`.
    pub async fn request(&mut self, command: &Command<'_>) -> Result<Vec<u8>> {
        outgoing!("lookupd: {command}");

        let limit = self.timeout;
        let stream = &mut self.stream;
        let exchange = async {
            stream.write_all(&command.encode()?).await?;
            stream.flush().await?;
            read_reply(stream).await
        };

        let reply = timeout(limit, exchange)
            .await
            .map_err(|_| ClusterError::Timeout(command.to_string()))??;

        incoming!("lookupd: {}", String::from_utf8_lossy(&reply));
        check(command, reply)
    }

    pub fn into_inner(self) -> S {
        self.stream
    }
}

async fn read_reply<S: AsyncRead + Unpin>(stream: &mut S) -> Result<Vec<u8>> {
    let size = stream.read_u32().await?;
    if size > MAX_RESPONSE_SIZE {
        return Err(ClusterError::TooLarge(size));
    }

    let mut body = vec![0; size as usize];
    stream.read_exact(&mut body).await?;
    Ok(body)
}

fn check(command: &Command<'_>, reply: Vec<u8>) -> Result<Vec<u8>> {
    if reply.starts_with(b"E_") {
        return Err(ClusterError::Rejected {
            command: command.to_string(),
            reason: String::from_utf8_lossy(&reply).into_owned(),
        });
    }

    match command {
        Command::Identify(_) => Ok(reply),
        _ if reply == b"OK" => Ok(reply),
        _ => Err(ClusterError::Unexpected {
            command: command.to_string(),
            reply: String::from_utf8_lossy(&reply).into_owned(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, duplex};

    use super::*;

    fn identity() -> Identity {
        Identity {
            broadcast_address: "mx1.example.net".to_string(),
            hostname: "mx1".to_string(),
            tcp_port: 25,
            http_port: 0,
            version: "0.1.0".to_string(),
        }
    }

    #[test]
    fn encoding() {
        assert_eq!(Command::Ping.encode().unwrap(), b"PING\n");
        assert_eq!(
            Command::Register {
                topic: "outbound",
                channel: "delivery"
            }
            .encode()
            .unwrap(),
            b"REGISTER outbound delivery\n"
        );

        let identity = identity();
        let bytes = Command::Identify(&identity).encode().unwrap();
        assert!(bytes.starts_with(b"IDENTIFY\n"));

        let size = u32::from_be_bytes(bytes[9..13].try_into().unwrap()) as usize;
        let body: serde_json::Value = serde_json::from_slice(&bytes[13..]).unwrap();
        assert_eq!(size, bytes.len() - 13);
        assert_eq!(body["broadcast_address"], "mx1.example.net");
        assert_eq!(body["tcp_port"], 25);
    }

    #[tokio::test]
    async fn request_reply() {
        let (client, mut server) = duplex(1024);

        let peer = tokio::spawn(async move {
            let mut magic = [0; 4];
            server.read_exact(&mut magic).await.unwrap();
            assert_eq!(&magic, MAGIC);

            let mut line = [0; 5];
            server.read_exact(&mut line).await.unwrap();
            assert_eq!(&line, b"PING\n");
            server.write_all(&2u32.to_be_bytes()).await.unwrap();
            server.write_all(b"OK").await.unwrap();

            let mut line = vec![0; "REGISTER outbound delivery\n".len()];
            server.read_exact(&mut line).await.unwrap();
            server.write_all(&15u32.to_be_bytes()).await.unwrap();
            server.write_all(b"E_INVALID topic").await.unwrap();
        });

        let mut session = Session::open(client, Duration::from_secs(1)).await.unwrap();
        assert_eq!(session.request(&Command::Ping).await.unwrap(), b"OK");

        let err = session
            .request(&Command::Register {
                topic: "outbound",
                channel: "delivery",
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ClusterError::Rejected { ref reason, .. } if reason == "E_INVALID topic"));

        peer.await.unwrap();
    }

    #[tokio::test]
    async fn oversized_reply() {
        let (client, mut server) = duplex(1024);

        tokio::spawn(async move {
            let mut buf = [0; 9];
            server.read_exact(&mut buf).await.unwrap();
            server.write_all(&u32::MAX.to_be_bytes()).await.unwrap();
        });

        let mut session = Session::open(client, Duration::from_secs(1)).await.unwrap();
        assert!(matches!(
            session.request(&Command::Ping).await,
            Err(ClusterError::TooLarge(u32::MAX))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn silent_peer_times_out() {
        let (client, _server) = duplex(1024);
        let mut session = Session::open(client, Duration::from_secs(5)).await.unwrap();
        assert!(matches!(
            session.request(&Command::Ping).await,
            Err(ClusterError::Timeout(_))
        ));
    }
}
