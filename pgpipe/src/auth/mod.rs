//! Authentication mechanisms.
//!
//! - [`md5`]: `"md5" + md5(md5(password + user) ++ salt)` password hashing
//! - [`sasl`]: SCRAM-SHA-256 and SCRAM-SHA-256-PLUS
//!
//! <https://www.postgresql.org/docs/current/auth-password.html>
pub mod md5;
pub mod sasl;
mod cert;

pub use sasl::{Mechanism, SaslError, SaslSession, continue_session, finalize_session, start_session};
