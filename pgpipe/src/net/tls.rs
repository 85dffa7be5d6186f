use std::sync::Arc;

use rustls::{ClientConfig, RootCertStore, pki_types::ServerName};
use tokio::net::TcpStream;
use tokio_rustls::{TlsConnector, client::TlsStream};

use super::TlsError;

/// Client config verifying the server against the webpki root certificates.
pub fn default_client_config() -> Arc<ClientConfig> {
    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    let config = ClientConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
        .with_safe_default_protocol_versions()
        .map(|builder| builder.with_root_certificates(roots).with_no_client_auth());

    match config {
        Ok(config) => Arc::new(config),
        // ring provider always supports the default protocol versions
        Err(err) => unreachable!("{err}"),
    }
}

pub(super) async fn connect(
    tcp: TcpStream,
    host: &str,
    config: Arc<ClientConfig>,
) -> Result<TlsStream<TcpStream>, TlsError> {
    let server_name = ServerName::try_from(host.to_owned())
        .map_err(|_| TlsError::InvalidServerName(host.into()))?;

    TlsConnector::from(config)
        .connect(server_name, tcp)
        .await
        .map_err(TlsError::Handshake)
}
