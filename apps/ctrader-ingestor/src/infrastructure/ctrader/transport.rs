//! Socket Transport
//!
//! Opens the TCP connection to the Open API endpoint, wrapped in TLS unless
//! the endpoint says otherwise (plain TCP is only useful against a local
//! mock broker).

use std::sync::Arc;

use rustls::RootCertStore;
use rustls::pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

use super::client::{ClientError, Endpoint};

/// Byte stream the session runs over.
pub trait Transport: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Transport for T {}

/// Connect to `endpoint`.
///
/// # Errors
///
/// Returns an error if the TCP connection or the TLS handshake fails.
pub async fn connect(endpoint: &Endpoint) -> Result<Box<dyn Transport>, ClientError> {
    let tcp = TcpStream::connect((endpoint.host.as_str(), endpoint.port)).await?;
    tcp.set_nodelay(true)?;

    if !endpoint.tls {
        tracing::debug!(host = %endpoint.host, port = endpoint.port, "Connected without TLS");
        return Ok(Box::new(tcp));
    }

    let server_name = ServerName::try_from(endpoint.host.clone())
        .map_err(|e| ClientError::Tls(format!("invalid server name {}: {e}", endpoint.host)))?;

    let stream = tls_connector()?.connect(server_name, tcp).await?;
    tracing::debug!(host = %endpoint.host, port = endpoint.port, "TLS handshake complete");

    Ok(Box::new(stream))
}

fn tls_connector() -> Result<TlsConnector, ClientError> {
    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    let config = rustls::ClientConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .map_err(|e| ClientError::Tls(e.to_string()))?
    .with_root_certificates(roots)
    .with_no_client_auth();

    Ok(TlsConnector::from(Arc::new(config)))
}

#[cfg(test)]
mod tests {
    use tokio::net::TcpListener;

    use super::*;

    #[test]
    fn tls_connector_builds() {
        assert!(tls_connector().is_ok());
    }

    #[tokio::test]
    async fn plain_tcp_connects_to_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let endpoint = Endpoint {
            host: "127.0.0.1".to_string(),
            port,
            tls: false,
        };
        let (client, accepted) = tokio::join!(connect(&endpoint), listener.accept());

        assert!(client.is_ok());
        assert!(accepted.is_ok());
    }

    #[tokio::test]
    async fn refused_connection_is_io_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let endpoint = Endpoint {
            host: "127.0.0.1".to_string(),
            port,
            tls: false,
        };
        let result = connect(&endpoint).await;
        assert!(matches!(result, Err(ClientError::Io(_))));
    }
}
