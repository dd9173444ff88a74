use std::{fmt::Display, fs::File, io::BufReader, path::Path, sync::Arc};

use postern_common::tracing;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_rustls::{
    TlsAcceptor,
    rustls::{
        ServerConfig, ServerConnection,
        pki_types::{CertificateDer, PrivateKeyDer},
    },
    server::TlsStream,
};

use crate::{
    config::TlsContext,
    error::{ConnectionError, ConnectionResult, TlsError, TlsResult},
};

const BUFFER_SIZE: usize = 8192;

#[derive(Debug)]
pub struct TlsInfo {
    pub protocol: String,
    pub cipher: String,
}

impl TlsInfo {
    fn of(conn: &ServerConnection) -> Self {
        Self {
            protocol: conn
                .protocol_version()
                .and_then(|version| version.as_str())
                .map(str::to_string)
                .unwrap_or_default(),
            cipher: conn
                .negotiated_cipher_suite()
                .and_then(|suite| suite.suite().as_str())
                .map(str::to_string)
                .unwrap_or_default(),
        }
    }
}

enum Transport<Stream> {
    Plain(Stream),
    Tls(Box<TlsStream<Stream>>),
}

/// A client connection with line-oriented reads.
pub struct Connection<Stream: AsyncRead + AsyncWrite + Unpin + Send + Sync> {
    transport: Transport<Stream>,
    read_buf: Box<[u8]>,
    /// Next unread byte in `read_buf`
    read_pos: usize,
    /// Amount of valid data in `read_buf`
    read_len: usize,
}

impl<Stream: AsyncRead + AsyncWrite + Unpin + Send + Sync> Connection<Stream> {
    pub fn plain(stream: Stream) -> Self {
        Self {
            transport: Transport::Plain(stream),
            read_buf: vec![0; BUFFER_SIZE].into_boxed_slice(),
            read_pos: 0,
            read_len: 0,
        }
    }

    pub const fn is_tls(&self) -> bool {
        matches!(self.transport, Transport::Tls(_))
    }

    /// Write `line` followed by CRLF.
    pub async fn send<S: Display + Send + Sync>(&mut self, line: &S) -> ConnectionResult<()> {
        let data = format!("{line}\r\n");

        match &mut self.transport {
            Transport::Plain(stream) => {
                stream.write_all(data.as_bytes()).await?;
                stream.flush().await?;
            }
            Transport::Tls(stream) => {
                stream.write_all(data.as_bytes()).await?;
                stream.flush().await?;
            }
        }

        Ok(())
    }

    /// Append the next line to `line`, without its CRLF (or bare LF)
    /// terminator. Returns `false` once the peer has closed the connection.
    ///
    /// Cancel safe: bytes consumed before a cancellation stay in `line`.
    pub async fn read_line(&mut self, line: &mut Vec<u8>, limit: usize) -> ConnectionResult<bool> {
        loop {
            if self.read_pos == self.read_len {
                let read = match &mut self.transport {
                    Transport::Plain(stream) => stream.read(&mut self.read_buf).await?,
                    Transport::Tls(stream) => stream.read(&mut self.read_buf).await?,
                };

                if read == 0 {
                    return Ok(false);
                }

                self.read_pos = 0;
                self.read_len = read;
            }

            let window = &self.read_buf[self.read_pos..self.read_len];
            let newline = window.iter().position(|&b| b == b'\n');
            let take = newline.map_or(window.len(), |end| end);

            if line.len() + take > limit {
                return Err(ConnectionError::LineTooLong(limit));
            }

            line.extend_from_slice(&window[..take]);

            if newline.is_some() {
                self.read_pos += take + 1;
                if line.last() == Some(&b'\r') {
                    line.pop();
                }
                return Ok(true);
            }

            self.read_pos = self.read_len;
        }
    }

    /// Drop anything the client pipelined behind a command that changes the
    /// security of the connection.
    pub const fn discard_buffered(&mut self) -> bool {
        let had = self.read_pos < self.read_len;
        self.read_pos = self.read_len;
        had
    }

    fn load_certs<P: AsRef<Path>>(path: &P) -> std::io::Result<Vec<CertificateDer<'static>>> {
        rustls_pemfile::certs(&mut BufReader::new(File::open(path)?)).collect()
    }

    fn load_key<P: AsRef<Path>>(path: &P) -> TlsResult<PrivateKeyDer<'static>> {
        let path_str = path.as_ref().display().to_string();
        let key_error = |reason: String| TlsError::KeyLoad {
            path: path_str.clone(),
            reason,
        };

        let mut reader = BufReader::new(File::open(path).map_err(|e| key_error(e.to_string()))?);

        match rustls_pemfile::read_one(&mut reader).map_err(|e| key_error(e.to_string()))? {
            Some(rustls_pemfile::Item::Pkcs1Key(key)) => Ok(PrivateKeyDer::Pkcs1(key)),
            Some(rustls_pemfile::Item::Pkcs8Key(key)) => Ok(PrivateKeyDer::Pkcs8(key)),
            Some(rustls_pemfile::Item::Sec1Key(key)) => Ok(PrivateKeyDer::Sec1(key)),
            _ => Err(key_error(
                "Unable to determine key file format (expected PKCS1, PKCS8, or SEC1)".to_string(),
            )),
        }
    }

    fn acceptor(tls: &TlsContext) -> TlsResult<TlsAcceptor> {
        let certs = Self::load_certs(&tls.certificate).map_err(|source| {
            TlsError::CertificateLoad {
                path: tls.certificate.display().to_string(),
                source,
            }
        })?;
        let key = Self::load_key(&tls.key)?;

        let config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)?;

        Ok(TlsAcceptor::from(Arc::new(config)))
    }

    /// Run the server side of a TLS handshake over the plaintext stream.
    ///
    /// # Errors
    /// If the TLS material cannot be loaded, the handshake fails, or the
    /// connection is already encrypted
    pub async fn upgrade(self, tls: &TlsContext) -> TlsResult<(Self, TlsInfo)> {
        tracing::debug!("Upgrading connection ...");

        let Transport::Plain(stream) = self.transport else {
            return Err(TlsError::UpgradeFailed(
                "Connection is already using TLS".to_string(),
            ));
        };

        let stream = Self::acceptor(tls)?.accept(stream).await?;
        let info = TlsInfo::of(stream.get_ref().1);

        Ok((
            Self {
                transport: Transport::Tls(Box::new(stream)),
                read_buf: self.read_buf,
                read_pos: 0,
                read_len: 0,
            },
            info,
        ))
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt, duplex};

    use super::*;

    #[tokio::test]
    async fn lines_across_reads() {
        let (client, server) = duplex(64);
        let mut connection = Connection::plain(server);

        let writer = tokio::spawn(async move {
            let mut client = client;
            client.write_all(b"EHLO exa").await.unwrap();
            client.write_all(b"mple.com\r\nNOOP\nQUIT\r\n").await.unwrap();
            client
        });

        let mut line = Vec::new();
        assert!(connection.read_line(&mut line, 512).await.unwrap());
        assert_eq!(line, b"EHLO example.com");

        line.clear();
        assert!(connection.read_line(&mut line, 512).await.unwrap());
        assert_eq!(line, b"NOOP");

        line.clear();
        assert!(connection.read_line(&mut line, 512).await.unwrap());
        assert_eq!(line, b"QUIT");

        drop(writer.await.unwrap());
        line.clear();
        assert!(!connection.read_line(&mut line, 512).await.unwrap());
    }

    #[tokio::test]
    async fn long_lines_are_rejected() {
        let (mut client, server) = duplex(1024);
        let mut connection = Connection::plain(server);

        client.write_all(&[b'a'; 100]).await.unwrap();
        client.write_all(b"\r\n").await.unwrap();

        let mut line = Vec::new();
        assert!(matches!(
            connection.read_line(&mut line, 64).await,
            Err(ConnectionError::LineTooLong(64))
        ));
    }

    #[tokio::test]
    async fn send_appends_crlf() {
        let (mut client, server) = duplex(64);
        let mut connection = Connection::plain(server);

        connection.send(&"250 Ok").await.unwrap();
        drop(connection);

        let mut sent = String::new();
        client.read_to_string(&mut sent).await.unwrap();
        assert_eq!(sent, "250 Ok\r\n");
    }
}
