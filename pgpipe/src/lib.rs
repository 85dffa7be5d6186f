//! Pipelined Postgres client
//!
//! Speaks the postgres frontend/backend protocol version 3 over a single
//! connection. Queries submitted from any number of [`Client`] handles are
//! queued and executed strictly in order, each resolved with its own result
//! or error.
//!
//! # Examples
//!
//! ```no_run
//! use pgpipe::{Client, Query};
//!
//! # async fn app() -> pgpipe::Result<()> {
//! let client = Client::connect_env().await?;
//!
//! let result = client
//!     .query(Query::new("SELECT 420, $1").bind("Foo"))
//!     .await?;
//!
//! let (id, name) = result.rows()[0].clone().decode::<(i64, String)>()?;
//! assert_eq!(id, 420);
//! assert_eq!(name, "Foo");
//! # Ok(())
//! # }
//! ```
//!
//! Cursor-style fetch, at most 100 rows are requested per round trip:
//!
//! ```no_run
//! use pgpipe::{Client, Query};
//!
//! # async fn app(client: Client) -> pgpipe::Result<()> {
//! let result = client
//!     .query(Query::new("SELECT * FROM events").rows(100))
//!     .await?;
//!
//! println!("{} events", result.rows().len());
//! # Ok(())
//! # }
//! ```

pub mod common;
pub mod io;
#[cfg(feature = "tokio")]
mod net;
mod ext;

// Protocol
pub mod postgres;
pub mod auth;

// Encoding
pub mod encode;
pub mod value;
pub mod row;

// Connection
pub mod connection;
mod phase;

// Operation
#[cfg(feature = "tokio")]
pub mod client;

pub mod error;

pub use encode::{Encode, Param};
pub use value::{Decoder, DefaultDecoder, Value};
pub use row::{DecodeError, FromRow, FromValue, Row};

pub use connection::{Config, ConnectionState, SslMode};
#[cfg(feature = "tokio")]
pub use connection::{CancelToken, Connection};
#[cfg(feature = "tokio")]
pub use net::{Socket, Transport};

#[cfg(feature = "tokio")]
pub use client::{Client, Event, Query, QueryResult, ResultSet};
pub use error::{Error, ErrorClass, ErrorKind, Result};
