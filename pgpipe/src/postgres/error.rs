//! Protocol error
use std::fmt;

use super::BackendMessage;

/// An error when translating buffer from postgres.
///
/// A protocol error means the byte stream can no longer be trusted,
/// the connection is always terminated after one.
pub enum ProtocolError {
    /// Received message is not the one expected in the current phase.
    Unexpected {
        expect: Option<u8>,
        found: u8,
        phase: Option<&'static str>,
    },
    /// Message body violates its declared shape.
    Malformed {
        msgtype: u8,
        reason: &'static str,
    },
    /// Message length field is smaller than the length field itself.
    InvalidLength {
        msgtype: u8,
        len: i32,
    },
    /// Single byte response to `SSLRequest` is neither `S` nor `N`.
    InvalidSslResponse {
        found: u8,
    },
}

impl std::error::Error for ProtocolError { }

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            ProtocolError::Unexpected { expect, found, phase } => {
                let found = BackendMessage::message_name(found);
                match expect {
                    Some(m) => {
                        write!(
                            f,
                            "Expected message `{}` found `{found}`",
                            BackendMessage::message_name(m),
                        )?
                    },
                    None => write!(f, "Unexpected message `{found}`")?,
                }
                if let Some(phase) = phase {
                    write!(f, " in `{phase}`")?
                }
                Ok(())
            },
            ProtocolError::Malformed { msgtype, reason } => {
                write!(f, "Malformed `{}` message: {reason}", BackendMessage::message_name(msgtype))
            },
            ProtocolError::InvalidLength { msgtype, len } => {
                write!(f, "Invalid length {len} for `{}` message", BackendMessage::message_name(msgtype))
            },
            ProtocolError::InvalidSslResponse { found } => {
                write!(f, "Invalid response to SSLRequest: {:?}", found as char)
            },
        }
    }
}

impl fmt::Debug for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl ProtocolError {
    pub(crate) fn unexpected(expect: u8, found: u8) -> ProtocolError {
        Self::Unexpected {
            expect: Some(expect),
            found,
            phase: None,
        }
    }

    pub(crate) fn unexpected_phase(found: u8, phase: &'static str) -> ProtocolError {
        Self::Unexpected {
            expect: None,
            found,
            phase: Some(phase),
        }
    }

    pub(crate) fn malformed(msgtype: u8, reason: &'static str) -> ProtocolError {
        Self::Malformed { msgtype, reason }
    }
}
