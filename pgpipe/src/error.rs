//! `pgpipe` error types.
use std::{backtrace::Backtrace, fmt, io, sync::Arc};

use crate::postgres::{ErrorFields, ErrorResponse, NoticeResponse};

pub use crate::{
    auth::SaslError,
    connection::ParseError,
    phase::UnsupportedAuth,
    postgres::ProtocolError,
    row::DecodeError,
};

#[cfg(feature = "tokio")]
pub use crate::net::TlsError;

/// A specialized [`Result`] type for `pgpipe` operation.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// All possible error from `pgpipe` library.
pub struct Error {
    context: String,
    backtrace: Backtrace,
    kind: ErrorKind,
}

impl Error {
    pub fn kind(&self) -> &ErrorKind {
        &self.kind
    }

    pub fn into_kind(self) -> ErrorKind {
        self.kind
    }

    pub fn backtrace(&self) -> &Backtrace {
        &self.backtrace
    }

    /// Prefix the error message with `context`.
    pub fn context(mut self, context: impl Into<String>) -> Self {
        self.context = context.into();
        self
    }

    /// Returns the [`DatabaseError`] if the server rejected the query.
    pub fn as_database(&self) -> Option<&DatabaseError> {
        match &self.kind {
            ErrorKind::Database(db) => Some(db),
            _ => None,
        }
    }

    /// Whether the query was never sent, rejected by the server, or lost with the connection.
    pub fn class(&self) -> ErrorClass {
        match &self.kind {
            ErrorKind::Config(_)
            | ErrorKind::StatementConflict(_)
            | ErrorKind::InvalidQuery(_) => ErrorClass::NotSent,
            ErrorKind::Closed(closed) if !closed.sent => ErrorClass::NotSent,
            ErrorKind::Timeout(timeout) if !timeout.sent => ErrorClass::NotSent,
            ErrorKind::Database(db) if db.is_fatal() => ErrorClass::ConnectionLost,
            ErrorKind::Database(_) | ErrorKind::Decode(_) => ErrorClass::Rejected,
            ErrorKind::Protocol(_)
            | ErrorKind::Io(_)
            | ErrorKind::Sasl(_)
            | ErrorKind::UnsupportedAuth(_)
            | ErrorKind::Closed(_)
            | ErrorKind::Timeout(_) => ErrorClass::ConnectionLost,
            #[cfg(feature = "tokio")]
            ErrorKind::Tls(_) => ErrorClass::ConnectionLost,
        }
    }
}

/// User visible classification of an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// The query was never written, it is safe to retry on the same connection.
    NotSent,
    /// The query was sent and the server rejected it, the connection remains usable.
    Rejected,
    /// The connection died, or the outcome of the query is unknown.
    ConnectionLost,
}

/// All possible error kind from `pgpipe` library.
pub enum ErrorKind {
    Config(ParseError),
    Protocol(ProtocolError),
    Io(io::Error),
    Database(DatabaseError),
    Sasl(SaslError),
    UnsupportedAuth(UnsupportedAuth),
    StatementConflict(StatementConflict),
    InvalidQuery(InvalidQuery),
    Decode(DecodeError),
    Closed(ConnectionClosed),
    Timeout(QueryTimeout),
    #[cfg(feature = "tokio")]
    Tls(TlsError),
}

macro_rules! from {
    (<$ty:ty>$pat:pat => $body:expr) => {
        impl From<$ty> for Error {
            fn from($pat: $ty) -> Self {
                let backtrace = std::backtrace::Backtrace::capture();
                Self { context: String::new(), backtrace, kind: $body }
            }
        }
    };
}

from!(<ErrorKind>e => e);
from!(<ParseError>e => ErrorKind::Config(e));
from!(<ProtocolError>e => ErrorKind::Protocol(e));
from!(<std::io::Error>e => ErrorKind::Io(e));
from!(<DatabaseError>e => ErrorKind::Database(e));
from!(<ErrorResponse>e => ErrorKind::Database(e.into()));
from!(<SaslError>e => ErrorKind::Sasl(e));
from!(<UnsupportedAuth>e => ErrorKind::UnsupportedAuth(e));
from!(<StatementConflict>e => ErrorKind::StatementConflict(e));
from!(<InvalidQuery>e => ErrorKind::InvalidQuery(e));
from!(<DecodeError>e => ErrorKind::Decode(e));
from!(<ConnectionClosed>e => ErrorKind::Closed(e));
from!(<QueryTimeout>e => ErrorKind::Timeout(e));
#[cfg(feature = "tokio")]
from!(<TlsError>e => ErrorKind::Tls(e));

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            ErrorKind::Io(e) => Some(e),
            ErrorKind::Closed(ConnectionClosed { cause: Some(cause), .. }) => Some(&**cause),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.context.is_empty() {
            write!(f, "{}: ", self.context)?;
        }

        fmt::Display::fmt(&self.kind, f)?;

        if let std::backtrace::BacktraceStatus::Captured = self.backtrace.status() {
            let mut backtrace = self.backtrace.to_string();
            write!(f, "\n\n")?;
            writeln!(f, "Stack backtrace:")?;
            backtrace.truncate(backtrace.trim_end().len());
            write!(f, "{}", backtrace)?;
        }

        Ok(())
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{self}\"")
    }
}

impl std::error::Error for ErrorKind { }

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(e) => e.fmt(f),
            Self::Protocol(e) => e.fmt(f),
            Self::Io(e) => e.fmt(f),
            Self::Database(e) => e.fmt(f),
            Self::Sasl(e) => e.fmt(f),
            Self::UnsupportedAuth(e) => e.fmt(f),
            Self::StatementConflict(e) => e.fmt(f),
            Self::InvalidQuery(e) => e.fmt(f),
            Self::Decode(e) => e.fmt(f),
            Self::Closed(e) => e.fmt(f),
            Self::Timeout(e) => e.fmt(f),
            #[cfg(feature = "tokio")]
            Self::Tls(e) => e.fmt(f),
        }
    }
}

impl fmt::Debug for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{self}\"")
    }
}

/// An error reported by the server, parsed from `ErrorResponse` or `NoticeResponse`.
#[derive(Clone)]
pub struct DatabaseError {
    fields: ErrorFields,
    /// Reported while establishing the connection.
    startup: bool,
}

impl DatabaseError {
    pub(crate) fn startup(value: ErrorResponse) -> Self {
        Self { fields: value.fields, startup: true }
    }

    /// Whether the server closes the session after this error.
    ///
    /// True for `FATAL` and `PANIC` severities and for any error during startup.
    pub fn is_fatal(&self) -> bool {
        let severity = self.severity_nonlocalized().or(self.severity());
        self.startup || matches!(severity, Some("FATAL" | "PANIC"))
    }

    /// All identified fields.
    pub fn fields(&self) -> &ErrorFields {
        &self.fields
    }

    pub fn into_fields(self) -> ErrorFields {
        self.fields
    }
}

impl std::ops::Deref for DatabaseError {
    type Target = ErrorFields;

    fn deref(&self) -> &Self::Target {
        &self.fields
    }
}

impl From<ErrorResponse> for DatabaseError {
    fn from(value: ErrorResponse) -> Self {
        Self { fields: value.fields, startup: false }
    }
}

impl From<NoticeResponse> for DatabaseError {
    fn from(value: NoticeResponse) -> Self {
        Self { fields: value.fields, startup: false }
    }
}

impl std::error::Error for DatabaseError { }

impl fmt::Display for DatabaseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.fields, f)?;
        if let Some(detail) = self.detail() {
            write!(f, "\nDETAIL: {detail}")?;
        }
        if let Some(hint) = self.hint() {
            write!(f, "\nHINT: {hint}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for DatabaseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.fields, f)
    }
}

/// A statement name reused for a different sql text on the same connection.
#[derive(Clone, PartialEq, Eq)]
pub struct StatementConflict {
    pub(crate) name: String,
}

impl StatementConflict {
    /// The conflicting statement name.
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl std::error::Error for StatementConflict { }

impl fmt::Display for StatementConflict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Prepared statements must be unique - '{}' was used for a different statement",
            self.name,
        )
    }
}

impl fmt::Debug for StatementConflict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{self}\"")
    }
}

/// A query which can not be written to the wire, rejected on submission.
#[derive(Clone, PartialEq, Eq)]
pub enum InvalidQuery {
    /// Parameter types outnumber the bound values.
    TooManyTypes,
    /// More bound values than a message can carry.
    TooManyParams(usize),
    /// Query text and values exceed the largest message.
    TooLarge(usize),
    /// A nul byte inside a string the protocol nul terminates.
    NulByte(&'static str),
}

impl std::error::Error for InvalidQuery { }

impl fmt::Display for InvalidQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TooManyTypes => f.write_str("query has more parameter types than values"),
            Self::TooManyParams(len) => write!(f, "query has {len} parameters, at most {} are supported", u16::MAX),
            Self::TooLarge(size) => write!(f, "query of {size} bytes exceeds the message size limit"),
            Self::NulByte(what) => write!(f, "{what} contains a nul byte"),
        }
    }
}

impl fmt::Debug for InvalidQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{self}\"")
    }
}

/// The connection is closed.
#[derive(Clone)]
pub struct ConnectionClosed {
    pub(crate) sent: bool,
    pub(crate) cause: Option<Arc<Error>>,
}

impl ConnectionClosed {
    pub(crate) fn new(sent: bool, cause: Option<Arc<Error>>) -> Self {
        Self { sent, cause }
    }

    /// Whether the query was written before the connection closed.
    pub fn was_sent(&self) -> bool {
        self.sent
    }

    /// The error that closed the connection, `None` if it was closed by the client.
    pub fn cause(&self) -> Option<&Error> {
        self.cause.as_deref()
    }
}

impl std::error::Error for ConnectionClosed { }

impl fmt::Display for ConnectionClosed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.cause {
            Some(cause) => write!(f, "connection terminated: {}", cause.kind),
            None => f.write_str("connection terminated"),
        }
    }
}

impl fmt::Debug for ConnectionClosed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{self}\"")
    }
}

/// The query did not complete within its timeout.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct QueryTimeout {
    pub(crate) sent: bool,
}

impl QueryTimeout {
    /// Whether the query was already written, its effect on the server is then unknown.
    pub fn was_sent(&self) -> bool {
        self.sent
    }
}

impl std::error::Error for QueryTimeout { }

impl fmt::Display for QueryTimeout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.sent {
            true => f.write_str("query timed out after being sent"),
            false => f.write_str("query timed out before being sent"),
        }
    }
}

impl fmt::Debug for QueryTimeout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{self}\"")
    }
}
