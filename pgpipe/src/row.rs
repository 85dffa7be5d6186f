//! Postgres row operation.
//!
//! - [`Row`]
//! - [`FromRow`]
//! - [`FromValue`]
//! - [`Index`]
//! - [`DecodeError`]
use bytes::Bytes;
use std::{borrow::Cow, fmt, sync::Arc};

use crate::{
    common::ByteStr,
    value::Value,
};

pub use crate::postgres::FieldDescriptor;

/// Postgres row.
///
/// Rows decoded under the same `RowDescription` share its field metadata.
#[derive(Clone)]
pub struct Row {
    fields: Arc<[FieldDescriptor]>,
    values: Vec<Value>,
}

impl Row {
    pub(crate) fn new(fields: Arc<[FieldDescriptor]>, values: Vec<Value>) -> Self {
        debug_assert_eq!(fields.len(), values.len());
        Self { fields, values }
    }

    /// Returns `true` if row contains no columns.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Returns the number of fields/column.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Field metadata of each column.
    pub fn fields(&self) -> &[FieldDescriptor] {
        &self.fields
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn into_values(self) -> Vec<Value> {
        self.values
    }

    /// Get column value by position or name.
    pub fn get<I: Index>(&self, idx: I) -> Option<&Value> {
        let nth = idx.position(&self.fields).ok()?;
        self.values.get(nth)
    }

    /// Try get and convert column.
    pub fn try_get<I: Index, R: FromValue>(&self, idx: I) -> Result<R, DecodeError> {
        let nth = idx.position(&self.fields)?;
        R::from_value(&self.values[nth])
    }

    /// Try decode type using [`FromRow`] implementation.
    pub fn decode<D: FromRow>(self) -> Result<D, DecodeError> {
        D::from_row(self)
    }
}

impl fmt::Debug for Row {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut dbg = f.debug_map();
        for (field, value) in self.fields.iter().zip(&self.values) {
            dbg.entry(&field.name, value);
        }
        dbg.finish()
    }
}

// ===== Traits =====

/// Type that can be constructed from a row.
pub trait FromRow: Sized {
    /// Construct self from row.
    fn from_row(row: Row) -> Result<Self, DecodeError>;
}

impl FromRow for Row {
    fn from_row(row: Row) -> Result<Self, DecodeError> {
        Ok(row)
    }
}

impl FromRow for () {
    fn from_row(_: Row) -> Result<Self, DecodeError> {
        Ok(())
    }
}

macro_rules! from_row_tuple {
    ($($t:ident $i:literal),*) => {
        impl<$($t),*> FromRow for ($($t),*,)
        where
            $($t: FromValue),*
        {
            fn from_row(row: Row) -> Result<Self, DecodeError> {
                Ok((
                    $(row.try_get($i)?),*,
                ))
            }
        }
    };
}

from_row_tuple!(T0 0);
from_row_tuple!(T0 0, T1 1);
from_row_tuple!(T0 0, T1 1, T2 2);
from_row_tuple!(T0 0, T1 1, T2 2, T3 3);

/// A type that can be converted from a decoded [`Value`].
pub trait FromValue: Sized {
    fn from_value(value: &Value) -> Result<Self, DecodeError>;
}

impl FromValue for Value {
    fn from_value(value: &Value) -> Result<Self, DecodeError> {
        Ok(value.clone())
    }
}

impl<T: FromValue> FromValue for Option<T> {
    fn from_value(value: &Value) -> Result<Self, DecodeError> {
        match value {
            Value::Null => Ok(None),
            _ => T::from_value(value).map(Some),
        }
    }
}

fn mismatch(expected: &'static str, value: &Value) -> DecodeError {
    match value {
        Value::Null => DecodeError::Null,
        _ => DecodeError::TypeMismatch { expected, found: value.kind() },
    }
}

impl FromValue for bool {
    fn from_value(value: &Value) -> Result<Self, DecodeError> {
        value.as_bool().ok_or_else(|| mismatch("bool", value))
    }
}

macro_rules! from_value_int {
    ($($ty:ty),*) => {$(
        impl FromValue for $ty {
            fn from_value(value: &Value) -> Result<Self, DecodeError> {
                let int = value.as_i64().ok_or_else(|| mismatch("int", value))?;
                <$ty>::try_from(int).map_err(|_| DecodeError::OutOfRange(stringify!($ty)))
            }
        }
    )*};
}

from_value_int!(i16, i32, i64, u32);

impl FromValue for f64 {
    fn from_value(value: &Value) -> Result<Self, DecodeError> {
        value.as_f64().ok_or_else(|| mismatch("float", value))
    }
}

impl FromValue for f32 {
    fn from_value(value: &Value) -> Result<Self, DecodeError> {
        f64::from_value(value).map(|f| f as f32)
    }
}

impl FromValue for ByteStr {
    fn from_value(value: &Value) -> Result<Self, DecodeError> {
        match value {
            Value::Text(s) => Ok(s.clone()),
            _ => Err(mismatch("text", value)),
        }
    }
}

impl FromValue for String {
    fn from_value(value: &Value) -> Result<Self, DecodeError> {
        value.as_str().map(String::from).ok_or_else(|| mismatch("text", value))
    }
}

impl FromValue for Bytes {
    fn from_value(value: &Value) -> Result<Self, DecodeError> {
        match value {
            Value::Binary(b) => Ok(b.clone()),
            Value::Text(s) => Ok(s.clone().into_bytes()),
            _ => Err(mismatch("bytes", value)),
        }
    }
}

impl FromValue for Vec<u8> {
    fn from_value(value: &Value) -> Result<Self, DecodeError> {
        value.as_bytes().map(<[u8]>::to_vec).ok_or_else(|| mismatch("bytes", value))
    }
}

/// Type that can be used for indexing column.
pub trait Index: Sized + sealed::Sealed {
    /// Returns the column position.
    fn position(self, fields: &[FieldDescriptor]) -> Result<usize, DecodeError>;
}

impl Index for usize {
    fn position(self, fields: &[FieldDescriptor]) -> Result<usize, DecodeError> {
        match self < fields.len() {
            true => Ok(self),
            false => Err(DecodeError::IndexOutOfBounds(self)),
        }
    }
}

impl Index for &str {
    fn position(self, fields: &[FieldDescriptor]) -> Result<usize, DecodeError> {
        fields
            .iter()
            .position(|field| field.name == self)
            .ok_or_else(|| DecodeError::ColumnNotFound(String::from(self).into()))
    }
}

mod sealed {
    pub trait Sealed { }
    impl Sealed for usize { }
    impl Sealed for &str { }
}

/// An error when decoding row value.
#[derive(Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Column requested not found.
    ColumnNotFound(Cow<'static, str>),
    /// Index requested is out of bounds.
    IndexOutOfBounds(usize),
    /// Decoded value is of another kind.
    TypeMismatch { expected: &'static str, found: &'static str },
    /// Integer does not fit the requested type.
    OutOfRange(&'static str),
    /// Row is null.
    Null,
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("failed to decode value, ")?;
        match self {
            Self::ColumnNotFound(name) => write!(f, "column not found: {name:?}"),
            Self::IndexOutOfBounds(u) => write!(f, "index out of bounds: {u:?}"),
            Self::TypeMismatch { expected, found } => write!(f, "expected {expected}, found {found}"),
            Self::OutOfRange(ty) => write!(f, "value out of range for {ty}"),
            Self::Null => write!(f, "unexpected NULL value"),
        }
    }
}

impl std::error::Error for DecodeError { }

impl fmt::Debug for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{self}\"")
    }
}
