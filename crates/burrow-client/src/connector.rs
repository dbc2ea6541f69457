//! TLS WebSocket connector.
//!
//! Development deployments pin a self-signed certificate and may disable
//! hostname verification; both knobs live in [`ConnectorConfig`] so a
//! production build can turn verification back on without code changes.

use native_tls::{Certificate, TlsConnector};
use tokio::net::TcpStream;
use tokio_tungstenite::{connect_async_tls_with_config, Connector, MaybeTlsStream, WebSocketStream};

use crate::error::ClientError;

pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Where and how to reach the relay.
#[derive(Debug, Clone)]
pub struct ConnectorConfig {
    /// Relay endpoint, e.g. `wss://relay.example:8443`.
    pub url: String,
    /// Path to the relay's certificate, trusted as a root.
    pub ca_cert_path: String,
    /// Skip hostname verification. Development only.
    pub danger_accept_invalid_hostnames: bool,
}

/// Open a TLS-protected WebSocket connection to the relay.
pub async fn connect(config: &ConnectorConfig) -> Result<WsStream, ClientError> {
    let pem = std::fs::read(&config.ca_cert_path)?;
    let certificate =
        Certificate::from_pem(&pem).map_err(|e| ClientError::Tls(e.to_string()))?;

    let tls = TlsConnector::builder()
        .add_root_certificate(certificate)
        .danger_accept_invalid_hostnames(config.danger_accept_invalid_hostnames)
        .build()
        .map_err(|e| ClientError::Tls(e.to_string()))?;

    tracing::debug!(url = %config.url, "connecting to relay");

    let (stream, _response) = connect_async_tls_with_config(
        config.url.as_str(),
        None,
        false,
        Some(Connector::NativeTls(tls)),
    )
    .await
    .map_err(|e| ClientError::Transport(e.to_string()))?;

    tracing::debug!(url = %config.url, "relay connection established");
    Ok(stream)
}
