//! Postgres connection.
//!
//! A [`Connection`] owns the transport, frames outbound messages into its
//! write buffer and decodes inbound bytes with [`MessageReader`]. It does
//! not interpret query semantics, that is the job of [`Client`][crate::Client].
mod config;
mod state;

pub use config::{Config, ParseError, SslMode};
pub use state::ConnectionState;

#[cfg(feature = "tokio")]
pub use io_impl::{CancelToken, Connection};
#[cfg(feature = "tokio")]
pub(crate) use io_impl::is_disconnect;

#[cfg(feature = "tokio")]
mod io_impl {
    use bytes::BytesMut;
    use std::{
        collections::HashMap,
        fmt, io,
        task::{Context, Poll, ready},
    };

    use super::{Config, ConnectionState, SslMode};
    use crate::{
        Result,
        auth::SaslSession,
        common::{ByteStr, debug, verbose},
        io::{self as pgio, MessageReader},
        net::{Socket, TlsError, Transport},
        phase,
        postgres::{
            BackendMessage, FrontendProtocol,
            backend::BackendKeyData,
            frontend::{self, CancelRequest, SslRequest, Startup},
        },
    };

    /// A single authenticated postgres connection.
    pub struct Connection<T = Socket> {
        io: T,
        reader: MessageReader,
        write_buf: BytesMut,
        state: ConnectionState,
        key_data: Option<BackendKeyData>,
        parameters: HashMap<ByteStr, ByteStr>,
        /// In progress SASL exchange, replaced at every step.
        pub(crate) sasl: Option<SaslSession>,
        target: Target,
    }

    /// Where to open the side channel for cancellation.
    #[derive(Clone, Debug)]
    enum Target {
        Tcp { host: ByteStr, port: u16 },
        Unix { dir: ByteStr, port: u16 },
        /// Custom transport, cancellation has to be written by the caller.
        None,
    }

    impl Target {
        fn from_config(config: &Config) -> Self {
            match &config.socket {
                Some(dir) => Self::Unix { dir: dir.clone(), port: config.port },
                None => Self::Tcp { host: config.host.clone(), port: config.port },
            }
        }

        async fn connect(&self) -> io::Result<Socket> {
            match self {
                Self::Tcp { host, port } => Socket::connect_tcp(host, *port).await,
                Self::Unix { dir, port } => Socket::connect_socket(dir, *port).await,
                Self::None => Err(io::Error::new(
                    io::ErrorKind::Unsupported,
                    "connection has no address to cancel through",
                )),
            }
        }
    }

    impl Connection {
        /// Connect using [`Config::from_env`].
        pub async fn connect_env() -> Result<Self> {
            Self::connect(&Config::from_env()).await
        }

        /// Open the socket, negotiate TLS when configured, and run startup.
        pub async fn connect(config: &Config) -> Result<Self> {
            let target = Target::from_config(config);
            let socket = target.connect().await?;
            let socket = negotiate_tls(socket, config).await?;
            let mut conn = Self::new(socket, target);
            phase::startup(&mut conn, config).await?;
            Ok(conn)
        }
    }

    impl<T: Transport> Connection<T> {
        fn new(io: T, target: Target) -> Self {
            Self {
                io,
                reader: MessageReader::new(),
                write_buf: BytesMut::with_capacity(1024),
                state: ConnectionState::Connecting,
                key_data: None,
                parameters: HashMap::new(),
                sasl: None,
                target,
            }
        }

        /// Run startup and authentication over an already established transport.
        ///
        /// The connection has no address to open a cancel side channel through,
        /// use [`CancelToken::cancel_with`] instead.
        pub async fn startup_with(io: T, config: &Config) -> Result<Self> {
            let mut conn = Self::new(io, Target::None);
            phase::startup(&mut conn, config).await?;
            Ok(conn)
        }

        pub fn state(&self) -> ConnectionState {
            self.state
        }

        pub(crate) fn set_state(&mut self, state: ConnectionState) {
            if self.state != state {
                verbose!(from = ?self.state, to = ?state, "connection state");
                self.state = state;
            }
        }

        /// Process id and secret key sent by the backend, `None` before startup completed.
        pub fn backend_key_data(&self) -> Option<BackendKeyData> {
            self.key_data
        }

        pub(crate) fn set_backend_key_data(&mut self, key: BackendKeyData) {
            self.key_data = Some(key);
        }

        /// Run-time parameters reported by the backend.
        pub fn parameters(&self) -> &HashMap<ByteStr, ByteStr> {
            &self.parameters
        }

        pub fn parameter(&self, name: &str) -> Option<&str> {
            self.parameters.get(name).map(ByteStr::as_str)
        }

        pub(crate) fn set_parameter(&mut self, name: ByteStr, value: ByteStr) {
            self.parameters.insert(name, value);
        }

        pub fn transport(&self) -> &T {
            &self.io
        }

        /// Token to cancel the running query through a separate connection.
        pub fn cancel_token(&self) -> Option<CancelToken> {
            let key = self.key_data?;
            Some(CancelToken {
                process_id: key.process_id,
                secret_key: key.secret_key,
                target: self.target.clone(),
            })
        }

        /// Buffer a message, it is written on the next flush.
        pub fn send<F: FrontendProtocol>(&mut self, message: F) {
            verbose!(msgtype = %(F::MSGTYPE as char), "send");
            frontend::write(message, &mut self.write_buf);
        }

        pub(crate) fn send_startup(&mut self, startup: Startup) {
            verbose!("send startup");
            startup.write(&mut self.write_buf);
        }

        /// Append raw frontend bytes produced elsewhere.
        pub(crate) fn send_raw(&mut self, bytes: &[u8]) {
            self.write_buf.extend_from_slice(bytes);
        }

        pub(crate) fn has_pending_write(&self) -> bool {
            !self.write_buf.is_empty()
        }

        /// Write the whole buffer and flush the transport.
        pub fn poll_flush(&mut self, cx: &mut Context) -> Poll<io::Result<()>> {
            ready!(pgio::poll_write_all(&mut self.io, &mut self.write_buf, cx))?;
            pgio::poll_flush(&mut self.io, cx)
        }

        pub async fn flush(&mut self) -> io::Result<()> {
            std::future::poll_fn(|cx| self.poll_flush(cx)).await
        }

        /// Poll the next backend message.
        ///
        /// Returns `None` when the backend closed the stream on a frame boundary.
        pub fn poll_message(&mut self, cx: &mut Context) -> Poll<Result<Option<BackendMessage>>> {
            loop {
                if let Some(message) = self.reader.next_message()? {
                    verbose!(msgtype = %(message.msgtype() as char), name = BackendMessage::message_name(message.msgtype()), "recv");
                    return Poll::Ready(Ok(Some(message)));
                }

                if ready!(pgio::poll_read(&mut self.io, self.reader.read_buf(), cx))? == 0 {
                    if self.reader.buffered() != 0 {
                        return Poll::Ready(Err(io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            "connection closed in the middle of a message",
                        ).into()));
                    }
                    return Poll::Ready(Ok(None));
                }
            }
        }

        /// Receive the next backend message, end of stream is an error.
        pub async fn recv(&mut self) -> Result<BackendMessage> {
            let message = std::future::poll_fn(|cx| self.poll_message(cx)).await?;
            message.ok_or_else(|| io::Error::from(io::ErrorKind::UnexpectedEof).into())
        }

        pub fn poll_shutdown(&mut self, cx: &mut Context) -> Poll<io::Result<()>> {
            pgio::poll_shutdown(&mut self.io, cx)
        }

        /// Write `Terminate` and half-close the transport.
        ///
        /// Reset or broken pipe errors are expected here and ignored.
        pub async fn terminate(mut self) -> io::Result<()> {
            self.set_state(ConnectionState::Ending);
            self.send(frontend::Terminate);
            let result = match self.flush().await {
                Ok(()) => std::future::poll_fn(|cx| self.poll_shutdown(cx)).await,
                Err(err) => Err(err),
            };
            self.set_state(ConnectionState::Ended);
            match result {
                Err(err) if is_disconnect(&err) => {
                    debug!("ignored error on terminate: {err}");
                    Ok(())
                },
                result => result,
            }
        }
    }

    pub(crate) fn is_disconnect(err: &io::Error) -> bool {
        matches!(
            err.kind(),
            io::ErrorKind::ConnectionReset | io::ErrorKind::BrokenPipe | io::ErrorKind::NotConnected
        )
    }

    impl<T> fmt::Debug for Connection<T> {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.debug_struct("Connection")
                .field("state", &self.state)
                .field("key_data", &self.key_data)
                .field("buffered", &self.reader.buffered())
                .finish()
        }
    }

    async fn negotiate_tls(mut socket: Socket, config: &Config) -> Result<Socket> {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        if let SslMode::Disable = config.ssl_mode {
            return Ok(socket);
        }

        if !cfg!(feature = "tls") || config.socket.is_some() {
            return match config.ssl_mode {
                SslMode::Require if config.socket.is_some() => Err(TlsError::NotTcp.into()),
                SslMode::Require => Err(TlsError::Unsupported.into()),
                _ => {
                    debug!("TLS unavailable, continuing in plaintext");
                    Ok(socket)
                },
            };
        }

        let mut buf = BytesMut::with_capacity(8);
        SslRequest.write(&mut buf);
        socket.write_all(&buf).await?;
        socket.flush().await?;

        match socket.read_u8().await? {
            b'S' => upgrade(socket, config).await,
            b'N' if config.ssl_mode == SslMode::Require => Err(TlsError::Rejected.into()),
            b'N' => {
                debug!("server refused TLS, continuing in plaintext");
                Ok(socket)
            },
            found => Err(crate::postgres::ProtocolError::InvalidSslResponse { found }.into()),
        }
    }

    #[cfg(feature = "tls")]
    async fn upgrade(socket: Socket, config: &Config) -> Result<Socket> {
        let socket = socket
            .upgrade_tls(&config.host, crate::net::default_client_config())
            .await?;
        verbose!("TLS established");
        Ok(socket)
    }

    #[cfg(not(feature = "tls"))]
    async fn upgrade(_: Socket, _: &Config) -> Result<Socket> {
        Err(TlsError::Unsupported.into())
    }

    /// Cancel the query running on a connection.
    ///
    /// Cancellation is best-effort: the server may have finished the query
    /// already, or ignore the request when nothing is running.
    #[derive(Clone, Debug)]
    pub struct CancelToken {
        process_id: u32,
        secret_key: u32,
        target: Target,
    }

    impl CancelToken {
        pub fn process_id(&self) -> u32 {
            self.process_id
        }

        /// Open a new connection to the same address and send `CancelRequest`.
        pub async fn cancel(&self) -> Result<()> {
            let socket = self.target.connect().await?;
            self.cancel_with(socket).await
        }

        /// Send `CancelRequest` over a freshly opened transport, then close it.
        pub async fn cancel_with<T: Transport>(&self, mut io: T) -> Result<()> {
            use tokio::io::AsyncWriteExt;

            let mut buf = BytesMut::with_capacity(CancelRequest::LEN as usize);
            CancelRequest { process_id: self.process_id, secret_key: self.secret_key }.write(&mut buf);
            debug!("sending cancel request for process {}", self.process_id);

            io.write_all(&buf).await?;
            io.flush().await?;
            match io.shutdown().await {
                Err(err) if !is_disconnect(&err) => Err(err.into()),
                _ => Ok(()),
            }
        }
    }

}
