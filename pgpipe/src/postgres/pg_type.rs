
pub type Oid = u32;

/// A type with known postgres [`Oid`].
pub trait PgType {
    const OID: Oid;
}

impl<T> PgType for &T where T: PgType + ?Sized {
    const OID: Oid = T::OID;
}

impl<T> PgType for Option<T> where T: PgType {
    const OID: Oid = T::OID;
}

/// Builtin type oids the client refers to.
///
/// <https://github.com/postgres/postgres/blob/master/src/include/catalog/pg_type.dat>
pub mod oid {
    use super::Oid;

    /// Placing a zero leaves the parameter type unspecified.
    pub const UNSPECIFIED: Oid = 0;
    pub const BOOL: Oid = 16;
    pub const BYTEA: Oid = 17;
    pub const INT8: Oid = 20;
    pub const INT2: Oid = 21;
    pub const INT4: Oid = 23;
    pub const TEXT: Oid = 25;
    pub const OID: Oid = 26;
    pub const FLOAT4: Oid = 700;
    pub const FLOAT8: Oid = 701;
    pub const VARCHAR: Oid = 1043;
}

macro_rules! pg_type {
    ($($ty:ty => $oid:ident,)*) => {$(
        impl PgType for $ty {
            const OID: Oid = oid::$oid;
        }
    )*};
}

pg_type! {
    () => UNSPECIFIED,
    bool => BOOL,
    i16 => INT2,
    i32 => INT4,
    i64 => INT8,
    f32 => FLOAT4,
    f64 => FLOAT8,
    str => TEXT,
    String => TEXT,
    [u8] => BYTEA,
    Vec<u8> => BYTEA,
}
