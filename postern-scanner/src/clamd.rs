//! Client for the clamd `PING` and `INSTREAM` commands.
//!
//! Commands use the NUL-delimited `z` form. `INSTREAM` sends the payload as
//! chunks prefixed with a 4-byte big-endian length and ends with a
//! zero-length chunk.

use std::time::Duration;

use async_trait::async_trait;
use postern_common::{incoming, internal, outgoing};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
};

use crate::{ContentScanner, Verdict, config::ScannerConfig, error::ScannerError};

const CHUNK_SIZE: usize = 8 * 1024;
const MAX_REPLY: usize = 4 * 1024;

#[derive(Debug, Clone)]
pub struct ClamdScanner {
    addresses: Vec<String>,
    timeout: Duration,
}

impl ClamdScanner {
    pub const fn new(addresses: Vec<String>, timeout: Duration) -> Self {
        Self { addresses, timeout }
    }

    pub fn from_config(config: &ScannerConfig) -> Self {
        Self::new(config.addresses.clone(), config.timeout)
    }

    /// Run `exchange` against each address in turn until one succeeds.
    async fn first_answer<T, F, Fut>(&self, what: &str, exchange: F) -> Result<T, ScannerError>
    where
        T: Send,
        F: Fn(TcpStream) -> Fut + Send + Sync,
        Fut: Future<Output = Result<T, String>> + Send,
    {
        let mut last = ScannerError::NoAddresses;

        for address in &self.addresses {
            let attempt = tokio::time::timeout(self.timeout, async {
                let stream = TcpStream::connect(address.as_str())
                    .await
                    .map_err(|err| err.to_string())?;
                exchange(stream).await
            })
            .await;

            let reason = match attempt {
                Ok(Ok(answer)) => return Ok(answer),
                Ok(Err(reason)) => reason,
                Err(_) => format!("no reply within {:?}", self.timeout),
            };

            internal!(level = WARN, "clamd {what} via {address} failed: {reason}");
            last = ScannerError::unavailable(address, reason);
        }

        Err(last)
    }
}

async fn read_reply(stream: &mut TcpStream) -> Result<String, String> {
    let mut reply = Vec::with_capacity(64);
    let mut buf = [0u8; 256];

    loop {
        let n = stream.read(&mut buf).await.map_err(|err| err.to_string())?;
        if n == 0 {
            break;
        }

        reply.extend_from_slice(&buf[..n]);
        if reply.contains(&0) {
            break;
        }

        if reply.len() > MAX_REPLY {
            return Err(format!("reply exceeds {MAX_REPLY} bytes"));
        }
    }

    if reply.is_empty() {
        return Err("connection closed without a reply".to_string());
    }

    let end = reply.iter().position(|&b| b == 0).unwrap_or(reply.len());
    let reply = String::from_utf8_lossy(&reply[..end]).trim().to_string();
    incoming!("clamd: {reply}");
    Ok(reply)
}

/// Interpret the reply to an `INSTREAM` command.
fn parse_verdict(reply: &str) -> Result<Verdict, String> {
    let body = reply.strip_prefix("stream:").map(str::trim);

    match body {
        Some("OK") => Ok(Verdict::Clean),
        Some(found) if found.ends_with("FOUND") => {
            let signature = found.trim_end_matches("FOUND").trim();
            Ok(Verdict::Infected(signature.to_string()))
        }
        _ => Err(format!("unexpected reply {reply:?}")),
    }
}

async fn ping(mut stream: TcpStream) -> Result<(), String> {
    outgoing!("clamd: zPING");
    stream
        .write_all(b"zPING\0")
        .await
        .map_err(|err| err.to_string())?;

    let reply = read_reply(&mut stream).await?;
    if reply == "PONG" {
        Ok(())
    } else {
        Err(format!("unexpected reply {reply:?}"))
    }
}

async fn instream(mut stream: TcpStream, payload: &[u8]) -> Result<Verdict, String> {
    outgoing!("clamd: zINSTREAM ({} bytes)", payload.len());

    let send = async {
        stream.write_all(b"zINSTREAM\0").await?;
        for chunk in payload.chunks(CHUNK_SIZE) {
            // Chunks are at most CHUNK_SIZE, well inside u32.
            #[allow(clippy::cast_possible_truncation)]
            let len = chunk.len() as u32;
            stream.write_all(&len.to_be_bytes()).await?;
            stream.write_all(chunk).await?;
        }
        stream.write_all(&0u32.to_be_bytes()).await?;
        stream.flush().await
    };
    send.await.map_err(|err| err.to_string())?;

    let reply = read_reply(&mut stream).await?;
    parse_verdict(&reply)
}

#[async_trait]
impl ContentScanner for ClamdScanner {
    async fn ping(&self) -> Result<(), ScannerError> {
        self.first_answer("PING", ping).await
    }

    #[tracing::instrument(level = "debug", skip_all, fields(size = payload.len()))]
    async fn scan(&self, payload: &[u8]) -> Result<Verdict, ScannerError> {
        self.first_answer("INSTREAM", |stream| instream(stream, payload))
            .await
    }
}
