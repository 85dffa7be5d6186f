//! Postgres Backend Messages
//!
//! <https://www.postgresql.org/docs/current/protocol-message-formats.html>
use bytes::{Buf, Bytes};
use std::{collections::BTreeMap, sync::Arc};

use super::{Oid, PgFormat, ProtocolError};
use crate::common::ByteStr;

/// A type that can be decoded into postgres backend message
pub trait BackendProtocol: Sized {
    /// Decode the message body, `body` contains exactly the declared length of the frame.
    fn decode(msgtype: u8, body: Bytes) -> Result<Self, ProtocolError>;
}

/// Checked forward-only cursor over a single message body.
///
/// Every read that runs past the body is a [`ProtocolError::Malformed`].
struct Body {
    msgtype: u8,
    bytes: Bytes,
}

macro_rules! get_int {
    ($($fn:ident, $get:ident, $ty:ty;)*) => {$(
        fn $fn(&mut self) -> Result<$ty, ProtocolError> {
            self.need(size_of::<$ty>())?;
            Ok(self.bytes.$get())
        }
    )*};
}

impl Body {
    fn new(msgtype: u8, bytes: Bytes) -> Self {
        Self { msgtype, bytes }
    }

    fn need(&self, n: usize) -> Result<(), ProtocolError> {
        match self.bytes.remaining() < n {
            true => Err(ProtocolError::malformed(self.msgtype, "body shorter than its fields")),
            false => Ok(()),
        }
    }

    get_int! {
        u8, get_u8, u8;
        i16, get_i16, i16;
        u16, get_u16, u16;
        i32, get_i32, i32;
        u32, get_u32, u32;
    }

    fn bytes(&mut self, n: usize) -> Result<Bytes, ProtocolError> {
        self.need(n)?;
        Ok(self.bytes.split_to(n))
    }

    /// Read a nul terminated string, excluding the nul.
    fn nul_bytes(&mut self) -> Result<Bytes, ProtocolError> {
        let Some(end) = self.bytes.iter().position(|&b| b == b'\0') else {
            return Err(ProtocolError::malformed(self.msgtype, "missing nul terminator"));
        };
        let string = self.bytes.split_to(end);
        self.bytes.advance(1);
        Ok(string)
    }

    fn nul_str(&mut self) -> Result<ByteStr, ProtocolError> {
        let bytes = self.nul_bytes()?;
        ByteStr::from_utf8(bytes)
            .map_err(|_| ProtocolError::malformed(self.msgtype, "string is not valid utf-8"))
    }

    fn format(&mut self) -> Result<PgFormat, ProtocolError> {
        let code = self.u16()?;
        PgFormat::from_code(code)
            .ok_or_else(|| ProtocolError::malformed(self.msgtype, "unknown format code"))
    }

    fn rest(&mut self) -> Bytes {
        std::mem::take(&mut self.bytes)
    }

    /// Asserts the whole body is consumed.
    fn finish(self) -> Result<(), ProtocolError> {
        match self.bytes.is_empty() {
            true => Ok(()),
            false => Err(ProtocolError::malformed(self.msgtype, "trailing bytes after fields")),
        }
    }
}

macro_rules! assert_msgtype {
    ($typ:ident) => {
        if Self::MSGTYPE != $typ {
            return Err(ProtocolError::unexpected(Self::MSGTYPE, $typ))
        }
    };
}

/// Postgres backend messages
#[derive(Debug)]
pub enum BackendMessage {
    Authentication(Authentication),
    BackendKeyData(BackendKeyData),
    BindComplete(BindComplete),
    CloseComplete(CloseComplete),
    CommandComplete(CommandComplete),
    CopyBothResponse(CopyBothResponse),
    CopyData(CopyData),
    CopyDone(CopyDone),
    CopyInResponse(CopyInResponse),
    CopyOutResponse(CopyOutResponse),
    DataRow(DataRow),
    EmptyQueryResponse(EmptyQueryResponse),
    ErrorResponse(ErrorResponse),
    FunctionCallResponse(FunctionCallResponse),
    NegotiateProtocolVersion(NegotiateProtocolVersion),
    NoData(NoData),
    NoticeResponse(NoticeResponse),
    NotificationResponse(NotificationResponse),
    ParameterDescription(ParameterDescription),
    ParameterStatus(ParameterStatus),
    ParseComplete(ParseComplete),
    PortalSuspended(PortalSuspended),
    ReadyForQuery(ReadyForQuery),
    RowDescription(RowDescription),
    /// Message type this client does not know, framing is preserved.
    Unsupported(Unsupported),
}

macro_rules! match_backend {
    ($($name:ident,)*) => {
        impl BackendMessage {
            pub fn msgtype(&self) -> u8 {
                match self {
                    $(Self::$name(_) => $name::MSGTYPE,)*
                    Self::Unsupported(u) => u.msgtype,
                }
            }

            /// Get message name from message type.
            ///
            /// Returns `"Unknown"` for unknown message type.
            pub fn message_name(msgtype: u8) -> &'static str {
                match msgtype {
                    $($name::MSGTYPE => stringify!($name),)*
                    _ => "Unknown",
                }
            }
        }

        impl BackendProtocol for BackendMessage {
            fn decode(msgtype: u8, body: Bytes) -> Result<Self, ProtocolError> {
                let message = match msgtype {
                    $($name::MSGTYPE => Self::$name(<$name as BackendProtocol>::decode(msgtype, body)?),)*
                    _ => Self::Unsupported(Unsupported { msgtype, body }),
                };
                Ok(message)
            }
        }
    };
}

match_backend! {
    Authentication,
    BackendKeyData,
    BindComplete,
    CloseComplete,
    CommandComplete,
    CopyBothResponse,
    CopyData,
    CopyDone,
    CopyInResponse,
    CopyOutResponse,
    DataRow,
    EmptyQueryResponse,
    ErrorResponse,
    FunctionCallResponse,
    NegotiateProtocolVersion,
    NoData,
    NoticeResponse,
    NotificationResponse,
    ParameterDescription,
    ParameterStatus,
    ParseComplete,
    PortalSuspended,
    ReadyForQuery,
    RowDescription,
}

impl BackendMessage {
    /// Create [`ProtocolError`] for this message arriving in `phase`.
    pub fn unexpected(&self, phase: &'static str) -> ProtocolError {
        ProtocolError::unexpected_phase(self.msgtype(), phase)
    }
}

/// Backend message with a type unknown to this client.
#[derive(Debug)]
pub struct Unsupported {
    /// The raw message type.
    pub msgtype: u8,
    /// The undecoded body.
    pub body: Bytes,
}

impl Unsupported {
    /// The declared message length, including the length field itself.
    pub fn len(&self) -> usize {
        self.body.len() + 4
    }
}

/// Identifies the message as an authentication request.
#[derive(Debug)]
pub enum Authentication {
    /// Specifies that the authentication was successful.
    Ok,
    /// Specifies that Kerberos V5 authentication is required.
    KerberosV5,
    /// Specifies that a clear-text password is required.
    CleartextPassword,
    /// Specifies that an MD5-encrypted password is required.
    MD5Password {
        /// The salt to use when encrypting the password.
        salt: [u8; 4],
    },
    /// Specifies that GSSAPI authentication is required.
    GSS,
    /// GSSAPI or SSPI authentication data.
    GSSContinue {
        data: Bytes,
    },
    /// Specifies that SSPI authentication is required.
    SSPI,
    /// Specifies that SASL authentication is required.
    SASL {
        /// SASL authentication mechanisms, in the server's order of preference.
        mechanisms: Vec<ByteStr>,
    },
    /// Specifies that this message contains a SASL challenge.
    SASLContinue {
        /// SASL data, specific to the SASL mechanism being used.
        data: Bytes,
    },
    /// Specifies that SASL authentication has completed.
    SASLFinal {
        /// SASL outcome "additional data", specific to the SASL mechanism being used.
        data: Bytes,
    },
    /// Authentication code unknown to this client.
    Unsupported {
        code: u32,
        data: Bytes,
    },
}

impl Authentication {
    pub const MSGTYPE: u8 = b'R';

    /// Human readable name of the requested method.
    pub fn method_name(&self) -> &'static str {
        match self {
            Authentication::Ok => "Ok",
            Authentication::KerberosV5 => "KerberosV5",
            Authentication::CleartextPassword => "CleartextPassword",
            Authentication::MD5Password { .. } => "MD5Password",
            Authentication::GSS => "GSS",
            Authentication::GSSContinue { .. } => "GSSContinue",
            Authentication::SSPI => "SSPI",
            Authentication::SASL { .. } => "SASL",
            Authentication::SASLContinue { .. } => "SASLContinue",
            Authentication::SASLFinal { .. } => "SASLFinal",
            Authentication::Unsupported { .. } => "Unsupported",
        }
    }
}

impl BackendProtocol for Authentication {
    fn decode(msgtype: u8, body: Bytes) -> Result<Self, ProtocolError> {
        assert_msgtype!(msgtype);
        let mut body = Body::new(msgtype, body);
        let auth = match body.u32()? {
            0 => Authentication::Ok,
            2 => Authentication::KerberosV5,
            3 => Authentication::CleartextPassword,
            5 => {
                let salt = body.u32()?.to_be_bytes();
                Authentication::MD5Password { salt }
            },
            7 => Authentication::GSS,
            8 => return Ok(Authentication::GSSContinue { data: body.rest() }),
            9 => Authentication::SSPI,
            10 => {
                let mut mechanisms = vec![];
                loop {
                    let mechanism = body.nul_str()?;
                    if mechanism.is_empty() {
                        break;
                    }
                    mechanisms.push(mechanism);
                }
                Authentication::SASL { mechanisms }
            },
            11 => return Ok(Authentication::SASLContinue { data: body.rest() }),
            12 => return Ok(Authentication::SASLFinal { data: body.rest() }),
            code => return Ok(Authentication::Unsupported { code, data: body.rest() }),
        };
        body.finish()?;
        Ok(auth)
    }
}

/// Identifies the message as cancellation key data.
///
/// The frontend must save these values if it wishes to be able to issue CancelRequest messages later.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackendKeyData {
    /// The process ID of this backend.
    pub process_id: u32,
    /// The secret key of this backend.
    pub secret_key: u32,
}

impl BackendKeyData {
    pub const MSGTYPE: u8 = b'K';
}

impl BackendProtocol for BackendKeyData {
    fn decode(msgtype: u8, body: Bytes) -> Result<Self, ProtocolError> {
        assert_msgtype!(msgtype);
        let mut body = Body::new(msgtype, body);
        let key = Self {
            process_id: body.u32()?,
            secret_key: body.u32()?,
        };
        body.finish()?;
        Ok(key)
    }
}

/// Identifies the message as a run-time parameter status report
#[derive(Debug, Clone)]
pub struct ParameterStatus {
    /// The name of the run-time parameter being reported
    pub name: ByteStr,
    /// The current value of the parameter
    pub value: ByteStr,
}

impl ParameterStatus {
    pub const MSGTYPE: u8 = b'S';
}

impl BackendProtocol for ParameterStatus {
    fn decode(msgtype: u8, body: Bytes) -> Result<Self, ProtocolError> {
        assert_msgtype!(msgtype);
        let mut body = Body::new(msgtype, body);
        let status = Self {
            name: body.nul_str()?,
            value: body.nul_str()?,
        };
        body.finish()?;
        Ok(status)
    }
}

/// Identified fields of an [`ErrorResponse`] or [`NoticeResponse`].
///
/// Fields of unrecognized type are kept, the frontend may ignore them.
///
/// <https://www.postgresql.org/docs/current/protocol-error-fields.html>
#[derive(Clone, Default, PartialEq, Eq)]
pub struct ErrorFields(BTreeMap<u8, ByteStr>);

macro_rules! field {
    ($($(#[$doc:meta])* $fn:ident, $code:literal;)*) => {$(
        $(#[$doc])*
        pub fn $fn(&self) -> Option<&str> {
            self.get($code)
        }
    )*};
}

impl ErrorFields {
    fn decode(body: &mut Body) -> Result<Self, ProtocolError> {
        let mut fields = BTreeMap::new();
        loop {
            let code = body.u8()?;
            if code == b'\0' {
                break;
            }
            fields.insert(code, body.nul_str()?);
        }
        Ok(Self(fields))
    }

    /// Get a field by its code.
    pub fn get(&self, code: u8) -> Option<&str> {
        self.0.get(&code).map(ByteStr::as_str)
    }

    /// Consume into the raw field map.
    pub fn into_inner(self) -> BTreeMap<u8, ByteStr> {
        self.0
    }

    field! {
        /// Severity, localized: `ERROR`, `FATAL`, or `PANIC` for errors,
        /// `WARNING`, `NOTICE`, `DEBUG`, `INFO`, or `LOG` for notices.
        severity, b'S';
        /// Severity, never localized. Present only in postgres 9.6 and later.
        severity_nonlocalized, b'V';
        /// The SQLSTATE code for the error.
        code, b'C';
        /// The primary human-readable error message.
        message, b'M';
        /// An optional secondary error message carrying more detail about the problem.
        detail, b'D';
        /// An optional suggestion what to do about the problem.
        hint, b'H';
        /// Error cursor position as an index into the original query string, counted in characters.
        position, b'P';
        /// Like `position`, but for an internally generated command.
        internal_position, b'p';
        /// The text of a failed internally-generated command.
        internal_query, b'q';
        /// The context in which the error occurred, a call stack traceback.
        where_, b'W';
        /// Name of the schema associated with the error.
        schema, b's';
        /// Name of the table associated with the error.
        table, b't';
        /// Name of the column associated with the error.
        column, b'c';
        /// Name of the data type associated with the error.
        data_type, b'd';
        /// Name of the constraint associated with the error.
        constraint, b'n';
        /// The file name of the source-code location where the error was reported.
        file, b'F';
        /// The line number of the source-code location where the error was reported.
        line, b'L';
        /// The name of the source-code routine reporting the error.
        routine, b'R';
    }
}

impl std::ops::Deref for ErrorFields {
    type Target = BTreeMap<u8, ByteStr>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl std::fmt::Debug for ErrorFields {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_map()
            .entries(self.0.iter().map(|(k, v)| (*k as char, v)))
            .finish()
    }
}

impl std::fmt::Display for ErrorFields {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(severity) = self.severity() {
            write!(f, "{severity}: ")?;
        }
        f.write_str(self.message().unwrap_or("(no message)"))?;
        if let Some(code) = self.code() {
            write!(f, " ({code})")?;
        }
        Ok(())
    }
}

macro_rules! fields_msg {
    ($($(#[$doc:meta])* struct $name:ident, $ty:literal;)*) => {$(
        $(#[$doc])*
        #[derive(Debug, Clone)]
        pub struct $name {
            pub fields: ErrorFields,
        }

        impl $name {
            pub const MSGTYPE: u8 = $ty;
        }

        impl BackendProtocol for $name {
            fn decode(msgtype: u8, body: Bytes) -> Result<Self, ProtocolError> {
                assert_msgtype!(msgtype);
                let mut body = Body::new(msgtype, body);
                let fields = ErrorFields::decode(&mut body)?;
                body.finish()?;
                Ok(Self { fields })
            }
        }

        impl std::ops::Deref for $name {
            type Target = ErrorFields;

            fn deref(&self) -> &Self::Target {
                &self.fields
            }
        }
    )*};
}

fields_msg! {
    /// Identifies the message as an error
    ///
    /// The message body consists of one or more identified fields, followed by a zero byte as a terminator.
    /// Fields can appear in any order.
    struct ErrorResponse, b'E';

    /// A warning message. The frontend should display the message.
    struct NoticeResponse, b'N';
}

/// Column metadata from a [`RowDescription`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDescriptor {
    /// The field name.
    pub name: ByteStr,
    /// If the field can be identified as a column of a specific table,
    /// the object ID of the table; otherwise zero.
    pub table_oid: u32,
    /// If the field can be identified as a column of a specific table,
    /// the attribute number of the column; otherwise zero.
    pub column_id: i16,
    /// The object ID of the field's data type.
    pub type_oid: Oid,
    /// The data type size (see `pg_type.typlen`). Note that negative values denote variable-width types.
    pub type_size: i16,
    /// The type modifier (see `pg_attribute.atttypmod`). The meaning of the modifier is type-specific.
    pub type_modifier: i32,
    /// The format code being used for the field.
    ///
    /// In a RowDescription returned from the statement variant of Describe,
    /// the format code is not yet known and will always be zero.
    pub format: PgFormat,
}

impl FieldDescriptor {
    fn decode(body: &mut Body) -> Result<Self, ProtocolError> {
        Ok(Self {
            name: body.nul_str()?,
            table_oid: body.u32()?,
            column_id: body.i16()?,
            type_oid: body.u32()?,
            type_size: body.i16()?,
            type_modifier: body.i32()?,
            format: body.format()?,
        })
    }
}

/// Identifies the message as a row description
#[derive(Debug, Clone)]
pub struct RowDescription {
    /// Field metadata, shared by every row decoded under this description.
    pub fields: Arc<[FieldDescriptor]>,
}

impl RowDescription {
    pub const MSGTYPE: u8 = b'T';
}

impl BackendProtocol for RowDescription {
    fn decode(msgtype: u8, body: Bytes) -> Result<Self, ProtocolError> {
        assert_msgtype!(msgtype);
        let mut body = Body::new(msgtype, body);
        let len = body.u16()?;
        let mut fields = Vec::with_capacity(len as usize);
        for _ in 0..len {
            fields.push(FieldDescriptor::decode(&mut body)?);
        }
        body.finish()?;
        Ok(Self { fields: fields.into() })
    }
}

/// Identifies the message as a data row.
#[derive(Debug, Clone)]
pub struct DataRow {
    /// Column values, `None` is SQL `NULL`.
    pub values: Vec<Option<Bytes>>,
}

impl DataRow {
    pub const MSGTYPE: u8 = b'D';
}

impl BackendProtocol for DataRow {
    fn decode(msgtype: u8, body: Bytes) -> Result<Self, ProtocolError> {
        assert_msgtype!(msgtype);
        let mut body = Body::new(msgtype, body);
        let len = body.u16()?;
        let mut values = Vec::with_capacity(len as usize);
        for _ in 0..len {
            // As a special case, -1 indicates a NULL column value.
            let value = match body.i32()? {
                -1 => None,
                len @ 0.. => Some(body.bytes(len as usize)?),
                _ => return Err(ProtocolError::malformed(msgtype, "negative column length")),
            };
            values.push(value);
        }
        body.finish()?;
        Ok(Self { values })
    }
}

/// Identifies the message as a command-completed response
///
/// For an INSERT command, the tag is `INSERT oid rows`, where rows is the number of rows inserted,
/// oid is always 0.
///
/// For DELETE, UPDATE, MERGE, SELECT, MOVE, FETCH and COPY, the tag is the command
/// followed by the number of rows affected.
#[derive(Debug, Clone)]
pub struct CommandComplete {
    /// The command tag. This is usually a single word that identifies which SQL command was completed.
    pub tag: ByteStr,
}

impl CommandComplete {
    pub const MSGTYPE: u8 = b'C';
}

impl BackendProtocol for CommandComplete {
    fn decode(msgtype: u8, body: Bytes) -> Result<Self, ProtocolError> {
        assert_msgtype!(msgtype);
        let mut body = Body::new(msgtype, body);
        let tag = body.nul_str()?;
        body.finish()?;
        Ok(Self { tag })
    }
}

/// Overall and per column format of a `COPY` response.
#[derive(Debug, Clone)]
pub struct CopyFormat {
    /// Overall `COPY` format.
    pub format: PgFormat,
    /// The format codes to be used for each column.
    pub columns: Vec<PgFormat>,
}

impl CopyFormat {
    fn decode(msgtype: u8, body: Bytes) -> Result<Self, ProtocolError> {
        let mut body = Body::new(msgtype, body);
        let format = match body.u8()? {
            0 => PgFormat::Text,
            1 => PgFormat::Binary,
            _ => return Err(ProtocolError::malformed(msgtype, "unknown copy format")),
        };
        let len = body.u16()?;
        let mut columns = Vec::with_capacity(len as usize);
        for _ in 0..len {
            columns.push(body.format()?);
        }
        body.finish()?;
        Ok(Self { format, columns })
    }
}

macro_rules! copy_msg {
    ($($(#[$doc:meta])* struct $name:ident, $ty:literal;)*) => {$(
        $(#[$doc])*
        #[derive(Debug, Clone)]
        pub struct $name(pub CopyFormat);

        impl $name {
            pub const MSGTYPE: u8 = $ty;
        }

        impl BackendProtocol for $name {
            fn decode(msgtype: u8, body: Bytes) -> Result<Self, ProtocolError> {
                assert_msgtype!(msgtype);
                CopyFormat::decode(msgtype, body).map(Self)
            }
        }
    )*};
}

copy_msg! {
    /// Identifies the message as a Start Copy In response.
    ///
    /// The frontend must now send copy-in data.
    struct CopyInResponse, b'G';

    /// Identifies the message as a Start Copy Out response.
    ///
    /// This message will be followed by copy-out data.
    struct CopyOutResponse, b'H';

    /// Identifies the message as a Start Copy Both response.
    ///
    /// This message is used only for Streaming Replication.
    struct CopyBothResponse, b'W';
}

/// Identifies the message as `COPY` data.
#[derive(Debug, Clone)]
pub struct CopyData {
    /// Data that forms part of a `COPY` data stream.
    pub data: Bytes,
}

impl CopyData {
    pub const MSGTYPE: u8 = b'd';
}

impl BackendProtocol for CopyData {
    fn decode(msgtype: u8, data: Bytes) -> Result<Self, ProtocolError> {
        assert_msgtype!(msgtype);
        Ok(Self { data })
    }
}

/// Identifies the message as a notification response.
#[derive(Debug, Clone)]
pub struct NotificationResponse {
    /// The process ID of the notifying backend process.
    pub process_id: u32,
    /// The name of the channel that the notify has been raised on.
    pub channel: ByteStr,
    /// The “payload” string passed from the notifying process.
    pub payload: ByteStr,
}

impl NotificationResponse {
    pub const MSGTYPE: u8 = b'A';
}

impl BackendProtocol for NotificationResponse {
    fn decode(msgtype: u8, body: Bytes) -> Result<Self, ProtocolError> {
        assert_msgtype!(msgtype);
        let mut body = Body::new(msgtype, body);
        let notif = Self {
            process_id: body.u32()?,
            channel: body.nul_str()?,
            payload: body.nul_str()?,
        };
        body.finish()?;
        Ok(notif)
    }
}

/// Identifies the message as a function call result.
#[derive(Debug, Clone)]
pub struct FunctionCallResponse {
    /// The function result value, `None` is SQL `NULL`.
    pub value: Option<Bytes>,
}

impl FunctionCallResponse {
    pub const MSGTYPE: u8 = b'V';
}

impl BackendProtocol for FunctionCallResponse {
    fn decode(msgtype: u8, body: Bytes) -> Result<Self, ProtocolError> {
        assert_msgtype!(msgtype);
        let mut body = Body::new(msgtype, body);
        let value = match body.i32()? {
            -1 => None,
            len @ 0.. => Some(body.bytes(len as usize)?),
            _ => return Err(ProtocolError::malformed(msgtype, "negative value length")),
        };
        body.finish()?;
        Ok(Self { value })
    }
}

/// Identifies the message as a protocol version negotiation message.
#[derive(Debug, Clone)]
pub struct NegotiateProtocolVersion {
    /// Newest minor protocol version supported by the server for the major protocol version requested by the client.
    pub minor: u32,
    /// Protocol options not recognized by the server.
    pub options: Vec<ByteStr>,
}

impl NegotiateProtocolVersion {
    pub const MSGTYPE: u8 = b'v';
}

impl BackendProtocol for NegotiateProtocolVersion {
    fn decode(msgtype: u8, body: Bytes) -> Result<Self, ProtocolError> {
        assert_msgtype!(msgtype);
        let mut body = Body::new(msgtype, body);
        let minor = body.u32()?;
        let len = body.u32()?;
        let mut options = vec![];
        for _ in 0..len {
            options.push(body.nul_str()?);
        }
        body.finish()?;
        Ok(Self { minor, options })
    }
}

/// Identifies the message as a parameter description.
#[derive(Debug, Clone)]
pub struct ParameterDescription {
    /// The object ID of each parameter data type.
    pub oids: Vec<Oid>,
}

impl ParameterDescription {
    pub const MSGTYPE: u8 = b't';
}

impl BackendProtocol for ParameterDescription {
    fn decode(msgtype: u8, body: Bytes) -> Result<Self, ProtocolError> {
        assert_msgtype!(msgtype);
        let mut body = Body::new(msgtype, body);
        let len = body.u16()?;
        let mut oids = Vec::with_capacity(len as usize);
        for _ in 0..len {
            oids.push(body.u32()?);
        }
        body.finish()?;
        Ok(Self { oids })
    }
}

/// Current backend transaction status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransactionStatus {
    /// Not in a transaction block, `I`.
    #[default]
    Idle,
    /// In a transaction block, `T`.
    InTransaction,
    /// In a failed transaction block, queries will be rejected until block is ended, `E`.
    Failed,
}

/// Identifies the message type. ReadyForQuery is sent whenever the backend is ready for a new query cycle.
#[derive(Debug, Clone, Copy)]
pub struct ReadyForQuery {
    /// Current backend transaction status indicator.
    pub tx_status: u8,
}

impl ReadyForQuery {
    pub const MSGTYPE: u8 = b'Z';

    /// Parsed transaction status, `None` for unknown indicator.
    pub fn status(&self) -> Option<TransactionStatus> {
        match self.tx_status {
            b'I' => Some(TransactionStatus::Idle),
            b'T' => Some(TransactionStatus::InTransaction),
            b'E' => Some(TransactionStatus::Failed),
            _ => None,
        }
    }
}

impl BackendProtocol for ReadyForQuery {
    fn decode(msgtype: u8, body: Bytes) -> Result<Self, ProtocolError> {
        assert_msgtype!(msgtype);
        let mut body = Body::new(msgtype, body);
        let tx_status = body.u8()?;
        body.finish()?;
        Ok(Self { tx_status })
    }
}

macro_rules! unit_msg {
    ($(
        $(#[$doc:meta])* struct $name:ident, $ty:literal;
    )*) => {$(
        $(#[$doc])*
        #[derive(Debug, Clone, Copy)]
        pub struct $name;

        impl $name {
            pub const MSGTYPE: u8 = $ty;
        }

        impl BackendProtocol for $name {
            fn decode(msgtype: u8, body: Bytes) -> Result<Self, ProtocolError> {
                assert_msgtype!(msgtype);
                Body::new(msgtype, body).finish()?;
                Ok(Self)
            }
        }
    )*};
}

unit_msg! {
    /// Identifies the message as a Bind-complete indicator.
    struct BindComplete, b'2';

    /// Identifies the message as a Close-complete indicator.
    struct CloseComplete, b'3';

    /// Identifies the message as a `COPY`-complete indicator.
    struct CopyDone, b'c';

    /// Identifies the message as a response to an empty query string.
    ///
    /// This substitutes for CommandComplete.
    struct EmptyQueryResponse, b'I';

    /// Identifies the message as a no-data indicator.
    struct NoData, b'n';

    /// Identifies the message as a Parse-complete indicator.
    struct ParseComplete, b'1';

    /// Identifies the message as a portal-suspended indicator.
    ///
    /// Note this only appears if an Execute message's row-count limit was reached.
    struct PortalSuspended, b's';
}
