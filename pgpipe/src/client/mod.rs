//! Query pipeline over a single connection.
//!
//! A [`Client`] is a cheap, cloneable handle. Every clone submits into the
//! same FIFO queue, served by one background worker which owns the
//! [`Connection`]. Queries execute strictly in submission order.
//!
//! ```no_run
//! # async fn app() -> pgpipe::Result<()> {
//! use pgpipe::{Client, Query};
//!
//! let client = Client::connect_env().await?;
//!
//! let (a, b) = tokio::join!(
//!     client.query("SELECT 1"),
//!     client.query(Query::new("SELECT $1::text").bind("pipelined")),
//! );
//! assert_eq!(a?.rows()[0].try_get::<_, i64>(0)?, 1);
//! assert_eq!(b?.rows()[0].try_get::<_, String>(0)?, "pipelined");
//!
//! client.end().await?;
//! # Ok(())
//! # }
//! ```
use std::{
    collections::HashMap,
    fmt, io,
    sync::{
        Arc, PoisonError, RwLock,
        atomic::{AtomicU8, Ordering},
    },
    time::Duration,
};
use tokio::{
    sync::{mpsc, oneshot},
    time::Instant,
};

mod pipeline;
mod query;
mod statement;
mod worker;

pub use query::{Query, QueryResult, ResultSet};

use pipeline::{Pipeline, Request, Submission};
use worker::{WorkerFuture, WorkerMessage};

use crate::{
    CancelToken, Config, Connection, Result,
    common::ByteStr,
    error::{ConnectionClosed, DatabaseError},
    net::Transport,
    postgres::TransactionStatus,
    value::{Decoder, DefaultDecoder},
};

/// Asynchronous message from the backend, not tied to any query.
#[derive(Debug, Clone)]
pub enum Event {
    /// A `NoticeResponse`, a warning or informational message.
    Notice(DatabaseError),
    /// A `NotificationResponse` raised by `NOTIFY` on a listened channel.
    Notification {
        process_id: u32,
        channel: ByteStr,
        payload: ByteStr,
    },
    /// A `ParameterStatus`, the backend reports a changed run-time parameter.
    Parameter {
        name: ByteStr,
        value: ByteStr,
    },
}

/// State the worker publishes to every client handle.
#[derive(Default)]
pub(crate) struct Shared {
    tx_status: AtomicU8,
    parameters: RwLock<HashMap<ByteStr, ByteStr>>,
    cancel: Option<CancelToken>,
}

impl Shared {
    pub(crate) fn transaction_status(&self) -> TransactionStatus {
        match self.tx_status.load(Ordering::Acquire) {
            1 => TransactionStatus::InTransaction,
            2 => TransactionStatus::Failed,
            _ => TransactionStatus::Idle,
        }
    }

    pub(crate) fn set_transaction_status(&self, status: TransactionStatus) {
        let code = match status {
            TransactionStatus::Idle => 0,
            TransactionStatus::InTransaction => 1,
            TransactionStatus::Failed => 2,
        };
        self.tx_status.store(code, Ordering::Release);
    }

    pub(crate) fn parameter(&self, name: &str) -> Option<ByteStr> {
        let parameters = self.parameters.read().unwrap_or_else(PoisonError::into_inner);
        parameters.get(name).cloned()
    }

    pub(crate) fn set_parameter(&self, name: ByteStr, value: ByteStr) {
        let mut parameters = self.parameters.write().unwrap_or_else(PoisonError::into_inner);
        parameters.insert(name, value);
    }
}

/// Handle to a pipelined connection.
///
/// Dropping every clone closes the connection once the worker observes it,
/// [`Client::end`] closes it explicitly.
#[derive(Clone)]
pub struct Client {
    send: mpsc::UnboundedSender<WorkerMessage>,
    shared: Arc<Shared>,
    timeout: Option<Duration>,
}

impl Client {
    /// Connect using configuration from environment.
    ///
    /// See [`Config::from_env`] for more details on env.
    pub async fn connect_env() -> Result<Self> {
        Self::connect(&Config::from_env()).await
    }

    /// Connect, authenticate and spawn the connection worker.
    pub async fn connect(config: &Config) -> Result<Self> {
        let conn = Connection::connect(config).await?;
        Ok(Self::from_connection_with(conn, DefaultDecoder, config.get_query_timeout()))
    }

    /// Take over an authenticated [`Connection`].
    ///
    /// Must be called within a tokio runtime, the worker is spawned onto it.
    pub fn from_connection<T: Transport>(conn: Connection<T>) -> Self {
        Self::from_connection_with(conn, DefaultDecoder, None)
    }

    /// Take over an authenticated [`Connection`] with a custom row decoder and
    /// a default timeout applied to queries without their own.
    pub fn from_connection_with<T: Transport>(
        conn: Connection<T>,
        decoder: impl Decoder,
        timeout: Option<Duration>,
    ) -> Self {
        let shared = Arc::new(Shared {
            tx_status: AtomicU8::new(0),
            parameters: RwLock::new(conn.parameters().clone()),
            cancel: conn.cancel_token(),
        });
        let pipeline = Pipeline::new(Arc::new(decoder), shared.clone());
        let (send, worker) = WorkerFuture::new(conn, pipeline);
        tokio::spawn(worker);
        Self { send, shared, timeout }
    }

    /// Submit a query and wait for all of its result sets.
    ///
    /// A rejected query does not affect other queries, the connection
    /// stays usable. See [`Error::class`][crate::Error::class] to tell
    /// apart failures that never reached the server.
    pub async fn query(&self, query: impl Into<Query>) -> Result<QueryResult> {
        let query = query.into();
        let deadline = query.timeout.or(self.timeout).map(|timeout| Instant::now() + timeout);
        self.submit(Request::Query(query), deadline).await
    }

    /// Close a named prepared statement and forget it.
    ///
    /// The name can then be used for another statement text.
    pub async fn close_statement(&self, name: impl Into<String>) -> Result<()> {
        self.submit(Request::Close(name.into()), None).await.map(|_| ())
    }

    async fn submit(&self, request: Request, deadline: Option<Instant>) -> Result<QueryResult> {
        let (reply, recv) = oneshot::channel();
        let submission = Submission { request, reply, deadline };
        if self.send.send(WorkerMessage::Submit(submission)).is_err() {
            return Err(ConnectionClosed::new(false, None).into());
        }
        match recv.await {
            Ok(result) => result,
            Err(_) => Err(ConnectionClosed::new(true, None).into()),
        }
    }

    /// Subscribe to notices, notifications and parameter changes.
    ///
    /// Only the latest subscriber receives events, a previous receiver is
    /// closed. Without a subscriber notices are logged.
    pub fn events(&self) -> mpsc::UnboundedReceiver<Event> {
        let (send, recv) = mpsc::unbounded_channel();
        let _ = self.send.send(WorkerMessage::Subscribe(send));
        recv
    }

    /// Write `Terminate` and close the connection.
    ///
    /// Queries not yet resolved fail with [`ConnectionClosed`]. Ending an
    /// already closed client is not an error.
    pub async fn end(&self) -> Result<()> {
        let (reply, recv) = oneshot::channel();
        if self.send.send(WorkerMessage::End(reply)).is_err() {
            return Ok(());
        }
        recv.await.unwrap_or(Ok(()))
    }

    /// Transaction status reported by the latest `ReadyForQuery`.
    pub fn transaction_status(&self) -> TransactionStatus {
        self.shared.transaction_status()
    }

    /// Run-time parameter reported by the backend.
    pub fn parameter(&self, name: &str) -> Option<ByteStr> {
        self.shared.parameter(name)
    }

    pub fn cancel_token(&self) -> Option<CancelToken> {
        self.shared.cancel.clone()
    }

    /// Request cancellation of the running query through a separate connection.
    ///
    /// Best-effort, the query may complete regardless.
    pub async fn cancel(&self) -> Result<()> {
        match &self.shared.cancel {
            Some(token) => token.cancel().await,
            None => Err(io::Error::new(io::ErrorKind::Unsupported, "backend sent no cancellation key").into()),
        }
    }

    /// The worker stopped, every submission fails.
    pub fn is_closed(&self) -> bool {
        self.send.is_closed()
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("closed", &self.is_closed())
            .field("transaction_status", &self.transaction_status())
            .finish()
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

    use super::*;
    use crate::{
        ErrorClass, ErrorKind, Value,
        postgres::{
            oid,
            testing::{self, Frame, read_frame, read_startup},
        },
    };

    async fn write(io: &mut DuplexStream, frames: &[Frame]) {
        io.write_all(&testing::frames(frames)).await.unwrap();
    }

    async fn connected() -> (Client, DuplexStream) {
        let (client, mut server) = tokio::io::duplex(4096);
        let backend = tokio::spawn(async move {
            read_startup(&mut server).await;
            write(&mut server, &[
                Frame::auth_ok(),
                Frame::backend_key(7, 9),
                Frame::parameter_status("server_version", "17.0"),
                Frame::ready(b'I'),
            ]).await;
            server
        });
        let conn = Connection::startup_with(client, &Config::default().user("postgres")).await.unwrap();
        (Client::from_connection(conn), backend.await.unwrap())
    }

    /// Answer one simple query with its own text as the only value.
    async fn echo(server: &mut DuplexStream) -> String {
        let (tag, body) = read_frame(server).await;
        assert_eq!(tag, b'Q');
        let text = String::from_utf8(body[..body.len() - 1].to_vec()).unwrap();
        write(server, &[
            Frame::row_description(&[("echo", oid::TEXT)]),
            Frame::data_row(&[Some(text.as_str())]),
            Frame::command_complete("SELECT 1"),
            Frame::ready(b'I'),
        ]).await;
        text
    }

    fn first_text(result: &QueryResult) -> &str {
        result.rows()[0].get(0).and_then(Value::as_str).unwrap()
    }

    #[tokio::test]
    async fn query_round_trip() {
        let (client, mut server) = connected().await;
        assert_eq!(client.parameter("server_version").as_deref(), Some("17.0"));
        assert_eq!(client.cancel_token().map(|t| t.process_id()), Some(7));

        let backend = tokio::spawn(async move {
            echo(&mut server).await;
            server
        });
        let result = client.query("SELECT 1").await.unwrap();
        assert_eq!(first_text(&result), "SELECT 1");
        assert_eq!(result.row_count(), Some(1));
        drop(backend.await.unwrap());
    }

    #[tokio::test]
    async fn pipelined_in_submission_order() {
        let (client, mut server) = connected().await;
        let backend = tokio::spawn(async move {
            let mut seen = vec![];
            for _ in 0..3 {
                seen.push(echo(&mut server).await);
            }
            (server, seen)
        });

        let (a, b, c) = tokio::join!(client.query("a"), client.query("b"), client.query("c"));
        assert_eq!(first_text(&a.unwrap()), "a");
        assert_eq!(first_text(&b.unwrap()), "b");
        assert_eq!(first_text(&c.unwrap()), "c");

        let (_server, seen) = backend.await.unwrap();
        assert_eq!(seen, ["a", "b", "c"]);
    }

    #[tokio::test]
    async fn rejected_query_keeps_connection() {
        let (client, mut server) = connected().await;
        let backend = tokio::spawn(async move {
            read_frame(&mut server).await;
            write(&mut server, &[
                Frame::error(&[(b'S', "ERROR"), (b'C', "42P01"), (b'M', "relation \"nope\" does not exist")]),
                Frame::ready(b'I'),
            ]).await;
            echo(&mut server).await;
            server
        });

        let err = client.query("SELECT * FROM nope").await.unwrap_err();
        assert_eq!(err.class(), ErrorClass::Rejected);
        assert_eq!(err.as_database().and_then(|db| db.code()), Some("42P01"));

        let result = client.query("after").await.unwrap();
        assert_eq!(first_text(&result), "after");
        drop(backend.await.unwrap());
    }

    #[tokio::test]
    async fn end_terminates() {
        let (client, mut server) = connected().await;
        client.end().await.unwrap();

        let mut received = vec![];
        server.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"X\0\0\0\x04");

        assert!(client.is_closed());
        let err = client.query("SELECT 1").await.unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::Closed(closed) if !closed.was_sent()));
        client.end().await.unwrap();
    }

    #[tokio::test]
    async fn server_disconnect_fails_active_query() {
        let (client, mut server) = connected().await;
        let backend = tokio::spawn(async move {
            read_frame(&mut server).await;
            drop(server);
        });

        let err = client.query("SELECT pg_terminate_backend(pg_backend_pid())").await.unwrap_err();
        assert_eq!(err.class(), ErrorClass::ConnectionLost);
        let ErrorKind::Closed(closed) = err.kind() else { panic!("{err}") };
        assert!(closed.was_sent());
        assert!(closed.cause().is_some());
        backend.await.unwrap();

        let err = client.query("SELECT 1").await.unwrap_err();
        assert_eq!(err.class(), ErrorClass::NotSent);
    }

    #[tokio::test(start_paused = true)]
    async fn timed_out_query_is_drained() {
        let (client, mut server) = connected().await;
        let (release, released) = oneshot::channel::<()>();
        let backend = tokio::spawn(async move {
            let (tag, _) = read_frame(&mut server).await;
            assert_eq!(tag, b'Q');
            released.await.unwrap();
            write(&mut server, &[Frame::command_complete("SELECT 1"), Frame::ready(b'I')]).await;
            echo(&mut server).await;
            server
        });

        let slow = Query::new("SELECT pg_sleep(60)").timeout(Duration::from_secs(1));
        let err = client.query(slow).await.unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::Timeout(timeout) if timeout.was_sent()));

        release.send(()).unwrap();
        let result = client.query("next").await.unwrap();
        assert_eq!(first_text(&result), "next");
        drop(backend.await.unwrap());
    }

    #[tokio::test]
    async fn notifications_and_status() {
        let (client, mut server) = connected().await;
        let mut events = client.events();

        let backend = tokio::spawn(async move {
            read_frame(&mut server).await;
            write(&mut server, &[
                Frame::notification(11, "jobs", "ready"),
                Frame::parameter_status("TimeZone", "Asia/Jakarta"),
                Frame::command_complete("BEGIN"),
                Frame::ready(b'T'),
            ]).await;
            server
        });

        client.query("BEGIN").await.unwrap();
        assert_eq!(client.transaction_status(), TransactionStatus::InTransaction);
        assert_eq!(client.parameter("TimeZone").as_deref(), Some("Asia/Jakarta"));

        let Some(Event::Notification { process_id, channel, payload }) = events.recv().await else {
            panic!("expected notification")
        };
        assert_eq!((process_id, &*channel, &*payload), (11, "jobs", "ready"));
        assert!(matches!(events.recv().await, Some(Event::Parameter { .. })));
        drop(backend.await.unwrap());
    }
}
