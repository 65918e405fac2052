//! # Transport Streams
//!
//! Plain TCP or rustls-wrapped TCP behind one `AsyncRead + AsyncWrite` type,
//! so the connection tasks never care which one they drive.

use std::fs::File;
use std::io::BufReader;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use rustls::pki_types::{CertificateDer, ServerName};
use rustls::RootCertStore;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

use crate::config::TlsConfig;
use crate::error::{ClientError, ClientResult};

/// Socket used by a connection.
pub enum ClientStream {
    /// Plain TCP connection
    Tcp(TcpStream),
    /// TLS-encrypted connection
    Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

impl AsyncRead for ClientStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            ClientStream::Tcp(stream) => Pin::new(stream).poll_read(cx, buf),
            ClientStream::Tls(stream) => Pin::new(stream.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for ClientStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            ClientStream::Tcp(stream) => Pin::new(stream).poll_write(cx, buf),
            ClientStream::Tls(stream) => Pin::new(stream.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            ClientStream::Tcp(stream) => Pin::new(stream).poll_flush(cx),
            ClientStream::Tls(stream) => Pin::new(stream.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            ClientStream::Tcp(stream) => Pin::new(stream).poll_shutdown(cx),
            ClientStream::Tls(stream) => Pin::new(stream.as_mut()).poll_shutdown(cx),
        }
    }
}

/// Builds a rustls connector from the TLS settings.
pub fn build_connector(config: &TlsConfig) -> ClientResult<TlsConnector> {
    let mut root_store = RootCertStore::empty();

    if let Some(ca_path) = &config.ca_cert_path {
        let file = File::open(ca_path)
            .map_err(|e| ClientError::Tls(format!("{}: {}", ca_path.display(), e)))?;
        let mut reader = BufReader::new(file);
        let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut reader)
            .filter_map(|r| r.ok())
            .collect();
        if certs.is_empty() {
            return Err(ClientError::Tls(format!(
                "no certificates found in {}",
                ca_path.display()
            )));
        }
        for cert in certs {
            root_store
                .add(cert)
                .map_err(|e| ClientError::Tls(format!("failed to add CA: {}", e)))?;
        }
    } else {
        root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    }

    let client_config = rustls::ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();
    Ok(TlsConnector::from(Arc::new(client_config)))
}

/// Wraps a connected socket in TLS.
pub async fn wrap_tls(
    connector: &TlsConnector,
    server_name: &str,
    stream: TcpStream,
) -> ClientResult<ClientStream> {
    let name = ServerName::try_from(server_name.to_string())
        .map_err(|e| ClientError::Tls(format!("invalid server name: {}", e)))?;
    let tls = connector
        .connect(name, stream)
        .await
        .map_err(|e| ClientError::Tls(e.to_string()))?;
    Ok(ClientStream::Tls(Box::new(tls)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn default_roots_build() {
        assert!(build_connector(&TlsConfig::default()).is_ok());
    }

    #[test]
    fn missing_ca_file_is_tls_error() {
        let config = TlsConfig {
            ca_cert_path: Some(PathBuf::from("/nonexistent/ca.pem")),
            server_name: None,
        };
        assert!(matches!(build_connector(&config), Err(ClientError::Tls(_))));
    }
}
