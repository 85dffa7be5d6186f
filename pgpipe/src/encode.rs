//! Query parameter encoding.
//!
//! Scalars are sent in text format with their builtin [`Oid`], strings leave
//! the type unspecified so the server infers it from the statement, and byte
//! slices are sent in binary format as `bytea`.
use bytes::Bytes;
use std::fmt;

use crate::{
    ext::FmtExt,
    postgres::{Oid, PgType, oid},
};

/// A single encoded parameter as it is written in `Bind`.
#[derive(Clone, PartialEq, Eq)]
pub enum Param {
    /// SQL `NULL`, written as length `-1`.
    Null,
    Text(Bytes),
    Binary(Bytes),
}

impl fmt::Debug for Param {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("NULL"),
            Self::Text(b) => write!(f, "{:?}", b.lossy()),
            Self::Binary(b) => write!(f, "Binary({})", b.len()),
        }
    }
}

/// Parameter with its declared type.
#[derive(Debug, Clone)]
pub struct Encoded {
    pub param: Param,
    /// Type sent in `Parse`, [`oid::UNSPECIFIED`] lets the server infer it.
    pub oid: Oid,
}

/// A value that can be bound as a query parameter.
pub trait Encode {
    fn encode(self) -> Encoded;
}

impl Encode for Encoded {
    fn encode(self) -> Encoded {
        self
    }
}

impl Encode for Param {
    fn encode(self) -> Encoded {
        Encoded { param: self, oid: oid::UNSPECIFIED }
    }
}

impl<T: Encode + PgType> Encode for Option<T> {
    fn encode(self) -> Encoded {
        match self {
            Some(value) => value.encode(),
            None => Encoded { param: Param::Null, oid: T::OID },
        }
    }
}

impl Encode for bool {
    fn encode(self) -> Encoded {
        let text = if self { "t" } else { "f" };
        Encoded { param: Param::Text(Bytes::from_static(text.as_bytes())), oid: oid::BOOL }
    }
}

macro_rules! encode_int {
    ($($ty:ty),*) => {$(
        impl Encode for $ty {
            fn encode(self) -> Encoded {
                let mut buf = itoa::Buffer::new();
                let text = Bytes::copy_from_slice(buf.format(self).as_bytes());
                Encoded { param: Param::Text(text), oid: <$ty>::OID }
            }
        }
    )*};
}

encode_int!(i16, i32, i64);

macro_rules! encode_float {
    ($($ty:ty),*) => {$(
        impl Encode for $ty {
            fn encode(self) -> Encoded {
                let text = if self.is_nan() {
                    String::from("NaN")
                } else if self.is_infinite() {
                    String::from(if self > 0.0 { "Infinity" } else { "-Infinity" })
                } else {
                    self.to_string()
                };
                Encoded { param: Param::Text(text.into()), oid: <$ty>::OID }
            }
        }
    )*};
}

encode_float!(f32, f64);

impl Encode for &str {
    fn encode(self) -> Encoded {
        Encoded { param: Param::Text(Bytes::copy_from_slice(self.as_bytes())), oid: oid::UNSPECIFIED }
    }
}

impl Encode for String {
    fn encode(self) -> Encoded {
        Encoded { param: Param::Text(self.into()), oid: oid::UNSPECIFIED }
    }
}

impl Encode for &String {
    fn encode(self) -> Encoded {
        self.as_str().encode()
    }
}

impl Encode for &[u8] {
    fn encode(self) -> Encoded {
        Encoded { param: Param::Binary(Bytes::copy_from_slice(self)), oid: oid::BYTEA }
    }
}

impl Encode for Vec<u8> {
    fn encode(self) -> Encoded {
        Encoded { param: Param::Binary(self.into()), oid: oid::BYTEA }
    }
}

impl Encode for Bytes {
    fn encode(self) -> Encoded {
        Encoded { param: Param::Binary(self), oid: oid::BYTEA }
    }
}

impl PgType for Bytes {
    const OID: Oid = oid::BYTEA;
}
