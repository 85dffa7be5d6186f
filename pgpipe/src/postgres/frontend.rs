//! Postgres Frontend Messages
//!
//! <https://www.postgresql.org/docs/current/protocol-message-formats.html>
use bytes::{BufMut, BytesMut};

use super::{Oid, PgFormat};
use crate::{
    common::warning,
    encode::Param,
    ext::{BufMutExt, UsizeExt},
};

/// The protocol version number, major version 3 and minor version 0.
pub const PROTOCOL_VERSION: u32 = 196_608;

/// The `SSLRequest` code, chosen to contain 1234 in the most significant 16 bits,
/// and 5679 in the least significant 16 bits.
pub const SSL_REQUEST_CODE: u32 = 80_877_103;

/// The `CancelRequest` code, chosen to contain 1234 in the most significant 16 bits,
/// and 5678 in the least significant 16 bits.
pub const CANCEL_REQUEST_CODE: u32 = 80_877_102;

/// Backend identifiers longer than this (`NAMEDATALEN - 1`) are truncated.
pub const MAX_NAME_LEN: usize = 63;

/// Write a frontend message to `buf`.
///
/// The length is written as placeholder first, then patched after the body is written.
pub fn write<F: FrontendProtocol>(msg: F, buf: &mut BytesMut) {
    buf.put_u8(F::MSGTYPE);
    let offset = buf.len();
    buf.put_u32(0);
    msg.encode(buf);
    patch_len(buf, offset);
}

/// Overwrite the 4 bytes length placeholder at `offset` with the length counted from it.
fn patch_len(buf: &mut BytesMut, offset: usize) {
    let len = (buf.len() - offset).to_u32();
    buf[offset..offset + 4].copy_from_slice(&len.to_be_bytes());
}

/// A type which can be encoded into postgres frontend message
pub trait FrontendProtocol {
    /// Message type.
    const MSGTYPE: u8;

    /// Write the main body of the message.
    fn encode(self, buf: &mut BytesMut);
}

/// Postgres Startup frontend message
///
/// For historical reasons, the very first message sent by the client (the [`Startup`] message)
/// has no initial message-type byte, thus [`Startup`] does not implement [`FrontendProtocol`].
///
/// To write startup message, use [`Startup::write`].
#[derive(Debug)]
pub struct Startup<'a> {
    /// The database user name to connect as. Required; there is no default.
    pub user: &'a str,
    /// Additional run-time parameters, e.g. `database`, `application_name`.
    ///
    /// A `user` entry here is ignored in favor of [`Startup::user`].
    pub params: &'a [(&'a str, &'a str)],
}

impl Startup<'_> {
    pub fn write(self, buf: &mut BytesMut) {
        let offset = buf.len();

        // Length of message contents in bytes, including self.
        buf.put_u32(0);

        // The most significant 16 bits are the major version number (3 for the protocol described here).
        // The least significant 16 bits are the minor version number (0 for the protocol described here).
        buf.put_u32(PROTOCOL_VERSION);

        buf.put_nul_string("user");
        buf.put_nul_string(self.user);

        // Parameter names beginning with _pq_. are reserved for use as protocol extensions,
        // while others are treated as run-time parameters to be set at backend start time.
        for &(key, value) in self.params {
            if key == "user" {
                continue;
            }
            buf.put_nul_string(key);
            buf.put_nul_string(value);
        }

        // A zero byte is required as a terminator after the last name/value pair.
        buf.put_u8(b'\0');

        patch_len(buf, offset);
    }
}

/// Request the connection to be encrypted with SSL.
///
/// The server then responds with a single byte containing `S` or `N`,
/// indicating that it is willing or unwilling to perform SSL, respectively.
#[derive(Debug)]
pub struct SslRequest;

impl SslRequest {
    pub fn write(self, buf: &mut BytesMut) {
        buf.put_u32(8);
        buf.put_u32(SSL_REQUEST_CODE);
    }
}

/// Request cancellation of the query currently executing by another backend.
///
/// Sent over a brand new connection instead of the [`Startup`] message.
#[derive(Debug)]
pub struct CancelRequest {
    /// The process ID of the target backend.
    pub process_id: u32,
    /// The secret key for the target backend.
    pub secret_key: u32,
}

impl CancelRequest {
    /// Length of the whole packet.
    pub const LEN: u32 = 16;

    pub fn write(self, buf: &mut BytesMut) {
        buf.put_u32(Self::LEN);
        buf.put_u32(CANCEL_REQUEST_CODE);
        buf.put_u32(self.process_id);
        buf.put_u32(self.secret_key);
    }
}

/// Identifies the message as a password response.
#[derive(Debug)]
pub struct PasswordMessage<'a> {
    /// The password (encrypted, if requested)
    pub password: &'a str,
}

impl FrontendProtocol for PasswordMessage<'_> {
    const MSGTYPE: u8 = b'p';

    fn encode(self, buf: &mut BytesMut) {
        buf.put_nul_string(self.password);
    }
}

/// Identifies the message as an initial SASL response.
#[derive(Debug)]
pub struct SaslInitialResponse<'a> {
    /// Name of the SASL authentication mechanism that the client selected.
    pub mechanism: &'a str,
    /// SASL mechanism specific "Initial Response".
    pub data: &'a [u8],
}

impl FrontendProtocol for SaslInitialResponse<'_> {
    const MSGTYPE: u8 = b'p';

    fn encode(self, buf: &mut BytesMut) {
        buf.put_nul_string(self.mechanism);
        buf.put_i32(self.data.len().to_i32());
        buf.put_slice(self.data);
    }
}

/// Identifies the message as a SASL response.
#[derive(Debug)]
pub struct SaslResponse<'a> {
    /// SASL mechanism specific message data.
    pub data: &'a [u8],
}

impl FrontendProtocol for SaslResponse<'_> {
    const MSGTYPE: u8 = b'p';

    fn encode(self, buf: &mut BytesMut) {
        buf.put_slice(self.data);
    }
}

/// Identifies the message as a simple query
#[derive(Debug)]
pub struct Query<'a> {
    /// the query string itself
    pub sql: &'a str,
}

impl FrontendProtocol for Query<'_> {
    const MSGTYPE: u8 = b'Q';

    fn encode(self, buf: &mut BytesMut) {
        buf.put_nul_string(self.sql);
    }
}

/// Identifies the message as a Parse command
#[derive(Debug)]
pub struct Parse<'a> {
    /// prepared statement name (an empty string selects the unnamed prepared statement).
    pub prepare_name: &'a str,
    /// The query string to be parsed.
    pub sql: &'a str,
    /// Specifies the object ID of the parameter data type.
    ///
    /// Note that this is not an indication of the number of parameters that might appear in the query string,
    /// only the number that the frontend wants to prespecify types for.
    ///
    /// Placing a zero here is equivalent to leaving the type unspecified.
    pub oids: &'a [Oid],
}

impl FrontendProtocol for Parse<'_> {
    const MSGTYPE: u8 = b'P';

    fn encode(self, buf: &mut BytesMut) {
        if self.prepare_name.len() > MAX_NAME_LEN {
            warning!(
                "statement name `{}` exceeds {MAX_NAME_LEN} bytes and will be truncated by postgres, \
                distinct names sharing a prefix may collide",
                self.prepare_name,
            );
        }

        buf.put_nul_string(self.prepare_name);
        buf.put_nul_string(self.sql);
        buf.put_u16(self.oids.len().to_u16());
        for &oid in self.oids {
            buf.put_u32(oid);
        }
    }
}

/// Identifies the message as a Bind command.
///
/// Each value is converted to a [`Param`] by `encoder`, the writer itself is type-agnostic.
pub struct Bind<'a, V, F> {
    /// The name of the destination portal (an empty string selects the unnamed portal).
    pub portal_name: &'a str,
    /// The name of the source prepared statement (an empty string selects the unnamed prepared statement).
    pub stmt_name: &'a str,
    /// Parameter values.
    pub params: &'a [V],
    /// Request all result columns in [`PgFormat::Binary`].
    pub binary: bool,
    /// Converts each value into its wire representation.
    pub encoder: F,
}

impl<V, F> FrontendProtocol for Bind<'_, V, F>
where
    F: FnMut(&V) -> Param,
{
    const MSGTYPE: u8 = b'B';

    fn encode(mut self, buf: &mut BytesMut) {
        buf.put_nul_string(self.portal_name);
        buf.put_nul_string(self.stmt_name);

        // format codes come before the values, values are buffered separately
        // so `encoder` is called exactly once per value
        let mut formats = Vec::with_capacity(self.params.len());
        let mut values = BytesMut::new();

        for value in self.params {
            match (self.encoder)(value) {
                Param::Null => {
                    formats.push(PgFormat::Text);
                    // As a special case, -1 indicates a NULL parameter value.
                    values.put_i32(-1);
                },
                Param::Text(bytes) => {
                    formats.push(PgFormat::Text);
                    values.put_i32(bytes.len().to_i32());
                    values.put(bytes);
                },
                Param::Binary(bytes) => {
                    formats.push(PgFormat::Binary);
                    values.put_i32(bytes.len().to_i32());
                    values.put(bytes);
                },
            }
        }

        buf.put_u16(formats.len().to_u16());
        for format in formats {
            buf.put_u16(format.format_code());
        }

        buf.put_u16(self.params.len().to_u16());
        buf.put(values);

        // one result format code applies to all result columns
        if self.binary {
            buf.put_u16(1);
            buf.put_u16(PgFormat::Binary.format_code());
        } else {
            buf.put_u16(0);
        }
    }
}

impl<V, F> std::fmt::Debug for Bind<'_, V, F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bind")
            .field("portal_name", &self.portal_name)
            .field("stmt_name", &self.stmt_name)
            .field("params", &self.params.len())
            .field("binary", &self.binary)
            .finish()
    }
}

/// Target of [`Describe`] and [`Close`] command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    /// Prepared statement, `S`.
    Statement,
    /// Portal, `P`.
    Portal,
}

impl Target {
    pub fn code(&self) -> u8 {
        match self {
            Target::Statement => b'S',
            Target::Portal => b'P',
        }
    }
}

/// Identifies the message as a Describe command.
#[derive(Debug)]
pub struct Describe<'a> {
    /// Describe a prepared statement or a portal.
    pub kind: Target,
    /// The name of the prepared statement or portal to describe
    /// (an empty string selects the unnamed prepared statement or portal).
    pub name: &'a str,
}

impl FrontendProtocol for Describe<'_> {
    const MSGTYPE: u8 = b'D';

    fn encode(self, buf: &mut BytesMut) {
        buf.put_u8(self.kind.code());
        buf.put_nul_string(self.name);
    }
}

/// Identifies the message as a Execute command
#[derive(Debug)]
pub struct Execute<'a> {
    /// The name of the portal to execute (an empty string selects the unnamed portal).
    pub portal_name: &'a str,
    /// Maximum number of rows to return, if portal contains a query that returns rows
    /// (ignored otherwise). Zero denotes “no limit”.
    pub max_rows: u32,
}

impl FrontendProtocol for Execute<'_> {
    const MSGTYPE: u8 = b'E';

    fn encode(self, buf: &mut BytesMut) {
        buf.put_nul_string(self.portal_name);
        buf.put_u32(self.max_rows);
    }
}

/// Identifies the message as a Close command
#[derive(Debug)]
pub struct Close<'a> {
    /// Close a prepared statement or a portal.
    pub kind: Target,
    /// The name of the prepared statement or portal to close
    /// (an empty string selects the unnamed prepared statement or portal).
    pub name: &'a str,
}

impl FrontendProtocol for Close<'_> {
    const MSGTYPE: u8 = b'C';

    fn encode(self, buf: &mut BytesMut) {
        buf.put_u8(self.kind.code());
        buf.put_nul_string(self.name);
    }
}

/// Identifies the message as `COPY` data.
#[derive(Debug)]
pub struct CopyData<'a> {
    /// Data that forms part of a `COPY` data stream.
    pub data: &'a [u8],
}

impl FrontendProtocol for CopyData<'_> {
    const MSGTYPE: u8 = b'd';

    fn encode(self, buf: &mut BytesMut) {
        buf.put_slice(self.data);
    }
}

/// Identifies the message as a `COPY`-failure indicator.
#[derive(Debug)]
pub struct CopyFail<'a> {
    /// An error message to report as the cause of failure.
    pub message: &'a str,
}

impl FrontendProtocol for CopyFail<'_> {
    const MSGTYPE: u8 = b'f';

    fn encode(self, buf: &mut BytesMut) {
        buf.put_nul_string(self.message);
    }
}

macro_rules! unit_msg {
    ($(
        $(#[$doc:meta])* struct $name:ident, $ty:literal;
    )*) => {$(
        $(#[$doc])*
        #[derive(Debug)]
        pub struct $name;

        impl FrontendProtocol for $name {
            const MSGTYPE: u8 = $ty;

            fn encode(self, _: &mut BytesMut) { }
        }
    )*};
}

unit_msg! {
    /// Identifies the message as a Sync command
    struct Sync, b'S';

    /// Identifies the message as a Flush command
    struct Flush, b'H';

    /// Identifies the message as a termination.
    struct Terminate, b'X';

    /// Identifies the message as a `COPY`-complete indicator.
    struct CopyDone, b'c';
}
