//! Decoded column value and the injected type decoder.
use bytes::Bytes;
use std::fmt;

use crate::{
    common::ByteStr,
    ext::FmtExt,
    postgres::{Oid, PgFormat, oid},
};

/// A decoded column value.
#[derive(Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(ByteStr),
    Binary(Bytes),
}

impl Value {
    /// Returns `true` if value is `NULL`.
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Text(s) => Some(s.as_bytes()),
            Self::Binary(b) => Some(b),
            _ => None,
        }
    }

    /// Name of the variant, used in decode errors.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::Text(_) => "text",
            Self::Binary(_) => "binary",
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("NULL"),
            Self::Bool(b) => b.fmt(f),
            Self::Int(i) => i.fmt(f),
            Self::Float(n) => n.fmt(f),
            Self::Text(s) => s.as_str().fmt(f),
            Self::Binary(b) => b.lossy().fmt(f),
        }
    }
}

/// Maps a raw column value to a [`Value`].
///
/// The pipeline never interprets column contents itself, every non-null
/// value goes through the decoder installed on the client.
pub trait Decoder: Send + Sync + 'static {
    fn decode(&self, type_oid: Oid, format: PgFormat, raw: &Bytes) -> Value;
}

impl<F> Decoder for F
where
    F: Fn(Oid, PgFormat, &Bytes) -> Value + Send + Sync + 'static,
{
    fn decode(&self, type_oid: Oid, format: PgFormat, raw: &Bytes) -> Value {
        self(type_oid, format, raw)
    }
}

/// Decodes the builtin scalar types in text format.
///
/// Anything not recognized is kept as [`Value::Text`], or [`Value::Binary`]
/// when the server sent binary format or invalid utf8.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultDecoder;

impl Decoder for DefaultDecoder {
    fn decode(&self, type_oid: Oid, format: PgFormat, raw: &Bytes) -> Value {
        if let PgFormat::Binary = format {
            return Value::Binary(raw.clone());
        }

        let Ok(text) = ByteStr::from_utf8(raw.clone()) else {
            return Value::Binary(raw.clone());
        };

        let parsed = match type_oid {
            oid::BOOL => match text.as_str() {
                "t" => Some(Value::Bool(true)),
                "f" => Some(Value::Bool(false)),
                _ => None,
            },
            oid::INT2 | oid::INT4 | oid::INT8 | oid::OID => text.parse().ok().map(Value::Int),
            oid::FLOAT4 | oid::FLOAT8 => parse_float(&text).map(Value::Float),
            _ => None,
        };

        parsed.unwrap_or(Value::Text(text))
    }
}

fn parse_float(text: &str) -> Option<f64> {
    match text {
        "Infinity" => Some(f64::INFINITY),
        "-Infinity" => Some(f64::NEG_INFINITY),
        "NaN" => Some(f64::NAN),
        _ => text.parse().ok(),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn text(oid: Oid, raw: &'static str) -> Value {
        DefaultDecoder.decode(oid, PgFormat::Text, &Bytes::from_static(raw.as_bytes()))
    }

    #[test]
    fn default_decoder() {
        assert_eq!(text(oid::BOOL, "t"), Value::Bool(true));
        assert_eq!(text(oid::INT4, "-42"), Value::Int(-42));
        assert_eq!(text(oid::INT8, "9007199254740993"), Value::Int(9007199254740993));
        assert_eq!(text(oid::FLOAT8, "1.5"), Value::Float(1.5));
        assert_eq!(text(oid::FLOAT4, "-Infinity"), Value::Float(f64::NEG_INFINITY));
        assert_eq!(text(oid::TEXT, "deez"), Value::Text(ByteStr::from_static("deez")));
        // unparseable input keeps the text
        assert_eq!(text(oid::INT4, "x"), Value::Text(ByteStr::from_static("x")));

        let raw = Bytes::from_static(&[0, 0, 0, 1]);
        assert_eq!(DefaultDecoder.decode(oid::INT4, PgFormat::Binary, &raw), Value::Binary(raw));
    }

    #[test]
    fn closure_decoder() {
        let decoder = |_: Oid, _: PgFormat, raw: &Bytes| Value::Int(raw.len() as i64);
        let raw = Bytes::from_static(b"abc");
        assert_eq!(Decoder::decode(&decoder, oid::TEXT, PgFormat::Text, &raw), Value::Int(3));
    }
}
