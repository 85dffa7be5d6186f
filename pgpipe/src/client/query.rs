//! Query submission and its results.
use std::{fmt, sync::Arc, time::Duration};

use crate::{
    common::ByteStr,
    encode::{Encode, Param},
    error::InvalidQuery,
    io::MAX_FRAME_LEN,
    postgres::{FieldDescriptor, Oid},
    row::Row,
};

/// A logical query submitted to a [`Client`][super::Client].
///
/// Parameterless text without a name, row limit or binary output is sent
/// with the simple query protocol, anything else with the extended protocol.
///
/// ```no_run
/// # async fn app(client: pgpipe::Client) -> pgpipe::Result<()> {
/// use pgpipe::Query;
///
/// let result = client
///     .query(Query::new("SELECT id, name FROM users WHERE id = $1").bind(420).name("user_by_id"))
///     .await?;
///
/// for row in result.rows() {
///     let id: i32 = row.try_get("id")?;
/// }
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Query {
    pub(crate) text: String,
    pub(crate) name: Option<String>,
    pub(crate) values: Vec<Param>,
    pub(crate) oids: Vec<Oid>,
    pub(crate) param_types: Option<Vec<Oid>>,
    pub(crate) rows: u32,
    pub(crate) binary: bool,
    pub(crate) timeout: Option<Duration>,
}

impl Query {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            name: None,
            values: Vec::new(),
            oids: Vec::new(),
            param_types: None,
            rows: 0,
            binary: false,
            timeout: None,
        }
    }

    /// Prepare the query as a named statement, reused by later queries with the same name.
    ///
    /// Reusing a name with a different text fails with [`StatementConflict`][crate::error::StatementConflict].
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Bind the next parameter.
    pub fn bind<E: Encode>(mut self, value: E) -> Self {
        let encoded = value.encode();
        self.values.push(encoded.param);
        self.oids.push(encoded.oid);
        self
    }

    /// Override parameter types sent in `Parse`.
    ///
    /// There may be fewer types than values, the rest is inferred by the server.
    pub fn param_types(mut self, oids: impl Into<Vec<Oid>>) -> Self {
        self.param_types = Some(oids.into());
        self
    }

    /// Fetch at most `rows` rows per `Execute`, until the portal is exhausted.
    ///
    /// Zero fetches everything at once.
    pub fn rows(mut self, rows: u32) -> Self {
        self.rows = rows;
        self
    }

    /// Request result columns in binary format.
    pub fn binary(mut self, binary: bool) -> Self {
        self.binary = binary;
        self
    }

    /// Resolve the query early with [`QueryTimeout`][crate::error::QueryTimeout].
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn get_name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Whether the query goes through the extended protocol.
    pub fn requires_preparation(&self) -> bool {
        self.name.is_some() || !self.values.is_empty() || self.rows > 0 || self.binary
    }

    /// Reject a query the wire format can not carry.
    pub(crate) fn validate(&self) -> Result<(), InvalidQuery> {
        if self.text.contains('\0') {
            return Err(InvalidQuery::NulByte("query text"));
        }
        if self.name.as_deref().is_some_and(|name| name.contains('\0')) {
            return Err(InvalidQuery::NulByte("statement name"));
        }
        if self.values.len() > u16::MAX as usize {
            return Err(InvalidQuery::TooManyParams(self.values.len()));
        }
        let size = self.values.iter().fold(self.text.len(), |size, value| match value {
            Param::Null => size,
            Param::Text(bytes) | Param::Binary(bytes) => size.saturating_add(bytes.len()),
        });
        if size > MAX_FRAME_LEN as usize {
            return Err(InvalidQuery::TooLarge(size));
        }
        self.parse_types().map(|_| ())
    }

    /// Parameter types written in `Parse`.
    pub(crate) fn parse_types(&self) -> Result<&[Oid], InvalidQuery> {
        match &self.param_types {
            Some(oids) if oids.len() > self.values.len() => Err(InvalidQuery::TooManyTypes),
            Some(oids) => Ok(oids),
            None => Ok(&self.oids),
        }
    }
}

impl From<&str> for Query {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for Query {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

impl fmt::Debug for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Query")
            .field("text", &self.text)
            .field("name", &self.name)
            .field("values", &self.values)
            .field("rows", &self.rows)
            .field("binary", &self.binary)
            .finish()
    }
}

/// Rows and command outcome of one statement.
#[derive(Debug, Clone)]
pub struct ResultSet {
    command: Option<ByteStr>,
    row_count: Option<u64>,
    oid: Option<Oid>,
    fields: Arc<[FieldDescriptor]>,
    rows: Vec<Row>,
}

impl ResultSet {
    /// Finalize with a `CommandComplete` tag, `None` for an empty query.
    pub(crate) fn new(tag: Option<ByteStr>, fields: Option<Arc<[FieldDescriptor]>>, rows: Vec<Row>) -> Self {
        let (command, oid, row_count) = match tag {
            Some(tag) => {
                let (command, oid, row_count) = parse_command_tag(&tag);
                (Some(command), oid, row_count)
            },
            None => (None, None, None),
        };
        Self {
            command,
            row_count,
            oid,
            fields: fields.unwrap_or_else(|| Arc::from([])),
            rows,
        }
    }

    /// Override the count of a portal fetched over several `Execute`.
    pub(crate) fn with_row_count(mut self, row_count: u64) -> Self {
        self.row_count = Some(row_count);
        self
    }

    /// Command verb, e.g. `SELECT` or `CREATE TABLE`, `None` for an empty query.
    pub fn command(&self) -> Option<&str> {
        self.command.as_deref()
    }

    /// Rows affected or returned, when the command reports it.
    pub fn row_count(&self) -> Option<u64> {
        self.row_count
    }

    /// Object id reported by `INSERT`.
    pub fn oid(&self) -> Option<Oid> {
        self.oid
    }

    pub fn fields(&self) -> &[FieldDescriptor] {
        &self.fields
    }

    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    pub fn into_rows(self) -> Vec<Row> {
        self.rows
    }
}

/// Split a command tag into verb, optional oid and optional row count.
///
/// `INSERT 0 1` has an oid and a count, `SELECT 5` only a count, and
/// `CREATE TABLE` neither.
fn parse_command_tag(tag: &ByteStr) -> (ByteStr, Option<Oid>, Option<u64>) {
    let mut words = tag.split(' ').collect::<Vec<_>>();

    let row_count = pop_number(&mut words);
    let oid = match row_count {
        Some(_) => pop_number(&mut words).and_then(|oid| Oid::try_from(oid).ok()),
        None => None,
    };

    let len = words.iter().map(|w| w.len()).sum::<usize>() + words.len().saturating_sub(1);
    (tag.slice_ref(&tag.as_str()[..len]), oid, row_count)
}

/// Pop a trailing number, the verb itself is never taken.
fn pop_number(words: &mut Vec<&str>) -> Option<u64> {
    if words.len() < 2 {
        return None;
    }
    let number = words.last()?.parse().ok()?;
    words.pop();
    Some(number)
}

/// Outcome of a query.
///
/// A query producing exactly one result set resolves to [`QueryResult::Single`],
/// multi-statement text resolves to every result set in order.
#[derive(Debug, Clone)]
pub enum QueryResult {
    Single(ResultSet),
    Multi(Vec<ResultSet>),
}

impl QueryResult {
    pub(crate) fn from_sets(mut sets: Vec<ResultSet>) -> Self {
        match sets.len() {
            1 => Self::Single(sets.remove(0)),
            _ => Self::Multi(sets),
        }
    }

    /// Every result set in order.
    pub fn result_sets(&self) -> &[ResultSet] {
        match self {
            Self::Single(set) => std::slice::from_ref(set),
            Self::Multi(sets) => sets,
        }
    }

    pub fn into_result_sets(self) -> Vec<ResultSet> {
        match self {
            Self::Single(set) => vec![set],
            Self::Multi(sets) => sets,
        }
    }

    /// Rows of the last result set.
    pub fn rows(&self) -> &[Row] {
        self.result_sets().last().map(ResultSet::rows).unwrap_or_default()
    }

    /// Row count of the last result set.
    pub fn row_count(&self) -> Option<u64> {
        self.result_sets().last().and_then(ResultSet::row_count)
    }
}
