//! Byte stream transport.
use std::{fmt, io};

mod socket;
#[cfg(feature = "tls")]
mod tls;

pub use socket::Socket;
#[cfg(feature = "tls")]
pub use tls::default_client_config;

/// Byte stream consumed by a connection.
///
/// Reading, writing and half-closing come from [`AsyncRead`][tokio::io::AsyncRead]
/// and [`AsyncWrite`][tokio::io::AsyncWrite].
pub trait Transport: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static {
    /// Whether the stream is encrypted with TLS.
    fn is_tls(&self) -> bool {
        false
    }

    /// DER encoded TLS leaf certificate of the peer, used for channel binding.
    fn peer_certificate_der(&self) -> Option<&[u8]> {
        None
    }
}

/// In memory stream, used to drive a connection against a mocked backend.
impl Transport for tokio::io::DuplexStream { }

/// An error when negotiating TLS.
pub enum TlsError {
    /// Server answered `SSLRequest` with `N` while TLS is required.
    Rejected,
    /// TLS is required but the `tls` feature is disabled.
    Unsupported,
    /// Only tcp connections can be upgraded.
    NotTcp,
    /// Host is not a valid TLS server name.
    InvalidServerName(String),
    /// TLS handshake failed.
    Handshake(io::Error),
}

impl std::error::Error for TlsError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Handshake(err) => Some(err),
            _ => None,
        }
    }
}

impl fmt::Display for TlsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rejected => f.write_str("server does not support TLS"),
            Self::Unsupported => f.write_str("TLS required but `tls` feature is disabled"),
            Self::NotTcp => f.write_str("TLS is only supported over tcp"),
            Self::InvalidServerName(host) => write!(f, "invalid TLS server name: {host:?}"),
            Self::Handshake(err) => write!(f, "TLS handshake failed: {err}"),
        }
    }
}

impl fmt::Debug for TlsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{self}\"")
    }
}
