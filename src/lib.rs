//! Postgres wire driver.
//!
//! `pgline` speaks the PostgreSQL v3 frontend/backend protocol
//! directly over TCP: startup and authentication (cleartext, md5,
//! SCRAM-SHA-256), the extended query pipeline with binary-format
//! parameters and results, and a forward-only streaming row reader
//! decoding columns on demand.
//!
//! Statements name their parameters `@name` style; every occurrence is
//! rewritten to the positional `$n` form before the statement reaches
//! the backend.
//!
//! # Examples
//!
//! Query with named parameters:
//!
//! ```no_run
//! use pgline::{Connection, Params};
//!
//! # async fn app() -> pgline::Result<()> {
//! let mut conn =
//!     Connection::open_str("host=localhost;username=postgres;password=secret;database=app")
//!         .await?;
//!
//! let mut params = Params::new();
//! params.push("id", 420);
//!
//! let mut rows = conn.query("SELECT id, name FROM users WHERE id = @id", &params).await?;
//! while rows.read().await? {
//!     println!("{} {}", rows.get_i32(0)?, rows.get_str(1)?);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! Execute returning the affected-row count:
//!
//! ```no_run
//! # async fn app(mut conn: pgline::Connection) -> pgline::Result<()> {
//! use pgline::Params;
//!
//! let mut params = Params::new();
//! params.push("name", "foo");
//!
//! let inserted = conn.execute("INSERT INTO foo(name) VALUES (@name)", &params).await?;
//! assert_eq!(inserted, 1);
//! # Ok(())
//! # }
//! ```
//!
//! Begin a transaction:
//!
//! ```no_run
//! use pgline::{Connection, IsolationLevel, Params};
//!
//! # async fn app() -> pgline::Result<()> {
//! let mut conn = Connection::open_str("host=localhost;user=postgres").await?;
//!
//! let mut tx = conn.begin(IsolationLevel::ReadCommitted).await?;
//!
//! tx.execute("INSERT INTO foo(id) VALUES (@id)", Params::new().push("id", 14)).await?;
//!
//! // if this failed, `tx` would be dropped and the transaction
//! // rolled back
//! fallible_operation()?;
//!
//! tx.commit().await?;
//! # Ok(())
//! # }
//! #
//! # fn fallible_operation() -> pgline::Result<()> { todo!() }
//! ```

pub mod common;
mod ext;

// Protocol
mod net;
pub mod protocol;

// Encoding
pub mod types;
mod params;
mod sql;
pub mod row;

// Connection
pub mod connection;
mod reader;
mod transaction;

mod error;

#[doc(inline)]
pub use connection::{AuthError, Config, Connection};
#[doc(inline)]
pub use params::{Param, Params};
#[doc(inline)]
pub use reader::RowReader;
#[doc(inline)]
pub use transaction::{IsolationLevel, Transaction};
#[doc(inline)]
pub use types::{Oid, PgFormat, PgValue};

pub use error::{Error, ErrorKind, Result, UsageError};
pub use row::Column;
pub use sql::SqlError;
