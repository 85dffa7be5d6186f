use std::{
    io,
    pin::Pin,
    task::{Context, Poll},
};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

#[cfg(feature = "tls")]
use super::TlsError;
use super::Transport;

/// Either a tcp stream, a unix socket, or TLS over tcp, which implement
/// `AsyncRead` and `AsyncWrite` transparently.
pub struct Socket {
    kind: Kind,
}

enum Kind {
    Tcp(tokio::net::TcpStream),
    #[cfg(unix)]
    Unix(tokio::net::UnixStream),
    #[cfg(feature = "tls")]
    Tls(Box<tokio_rustls::client::TlsStream<tokio::net::TcpStream>>),
}

impl Socket {
    pub async fn connect_tcp(host: &str, port: u16) -> io::Result<Socket> {
        let socket = tokio::net::TcpStream::connect((host, port)).await?;
        socket.set_nodelay(true)?;
        Ok(Socket { kind: Kind::Tcp(socket) })
    }

    /// Connect to postgres unix socket in directory `dir`, `{dir}/.s.PGSQL.{port}`.
    #[cfg(unix)]
    pub async fn connect_socket(dir: &str, port: u16) -> io::Result<Socket> {
        let path = format!("{}/.s.PGSQL.{port}", dir.trim_end_matches('/'));
        let socket = tokio::net::UnixStream::connect(path).await?;
        Ok(Socket { kind: Kind::Unix(socket) })
    }

    #[cfg(not(unix))]
    pub async fn connect_socket(dir: &str, port: u16) -> io::Result<Socket> {
        let _ = (dir, port);
        Err(io::Error::new(io::ErrorKind::Unsupported, "unix socket is not supported"))
    }

    /// Wrap the tcp stream in TLS, after the server accepted `SSLRequest`.
    #[cfg(feature = "tls")]
    pub async fn upgrade_tls(
        self,
        host: &str,
        config: std::sync::Arc<rustls::ClientConfig>,
    ) -> Result<Socket, TlsError> {
        let Kind::Tcp(tcp) = self.kind else {
            return Err(TlsError::NotTcp);
        };
        let tls = super::tls::connect(tcp, host, config).await?;
        Ok(Socket { kind: Kind::Tls(Box::new(tls)) })
    }
}

impl Transport for Socket {
    fn is_tls(&self) -> bool {
        match self.kind {
            #[cfg(feature = "tls")]
            Kind::Tls(_) => true,
            _ => false,
        }
    }

    fn peer_certificate_der(&self) -> Option<&[u8]> {
        match &self.kind {
            #[cfg(feature = "tls")]
            Kind::Tls(tls) => {
                let (_, session) = tls.get_ref();
                session.peer_certificates()?.first().map(|cert| &cert[..])
            },
            _ => None,
        }
    }
}

impl AsyncRead for Socket {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match &mut self.kind {
            Kind::Tcp(t) => Pin::new(t).poll_read(cx, buf),
            #[cfg(unix)]
            Kind::Unix(u) => Pin::new(u).poll_read(cx, buf),
            #[cfg(feature = "tls")]
            Kind::Tls(t) => Pin::new(t.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Socket {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match &mut self.kind {
            Kind::Tcp(t) => Pin::new(t).poll_write(cx, buf),
            #[cfg(unix)]
            Kind::Unix(u) => Pin::new(u).poll_write(cx, buf),
            #[cfg(feature = "tls")]
            Kind::Tls(t) => Pin::new(t.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut self.kind {
            Kind::Tcp(t) => Pin::new(t).poll_flush(cx),
            #[cfg(unix)]
            Kind::Unix(u) => Pin::new(u).poll_flush(cx),
            #[cfg(feature = "tls")]
            Kind::Tls(t) => Pin::new(t.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut self.kind {
            Kind::Tcp(t) => Pin::new(t).poll_shutdown(cx),
            #[cfg(unix)]
            Kind::Unix(u) => Pin::new(u).poll_shutdown(cx),
            #[cfg(feature = "tls")]
            Kind::Tls(t) => Pin::new(t.as_mut()).poll_shutdown(cx),
        }
    }
}

impl std::fmt::Debug for Socket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            Kind::Tcp(tcp) => std::fmt::Debug::fmt(tcp, f),
            #[cfg(unix)]
            Kind::Unix(unix) => std::fmt::Debug::fmt(unix, f),
            #[cfg(feature = "tls")]
            Kind::Tls(tls) => std::fmt::Debug::fmt(tls.get_ref().0, f),
        }
    }
}
