//! The [`Transaction`] type.
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

use crate::{Result, connection::Connection, protocol::frontend};

/// Transaction isolation levels, mapped onto the identically named SQL
/// clauses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IsolationLevel {
    ReadUncommitted,
    #[default]
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl IsolationLevel {
    pub(crate) fn begin_statement(self) -> &'static str {
        match self {
            Self::ReadUncommitted => "BEGIN ISOLATION LEVEL READ UNCOMMITTED",
            Self::ReadCommitted => "BEGIN ISOLATION LEVEL READ COMMITTED",
            Self::RepeatableRead => "BEGIN ISOLATION LEVEL REPEATABLE READ",
            Self::Serializable => "BEGIN ISOLATION LEVEL SERIALIZABLE",
        }
    }
}

/// An RAII implementation of transaction scope.
///
/// Begun by [`Connection::begin`], which issues the `BEGIN` through
/// the simple query path. Commands run through the transaction itself,
/// which derefs to the connection; the exclusive borrow means at most
/// one transaction is live per connection.
///
/// [`commit`][Transaction::commit] and
/// [`rollback`][Transaction::rollback] consume the transaction, so a
/// second completion is unrepresentable. Dropping an uncompleted
/// transaction buffers a best-effort `ROLLBACK` that the connection
/// settles before its next command.
///
/// # Example
///
/// ```no_run
/// # async fn test(mut conn: pgline::Connection) -> pgline::Result<()> {
/// use pgline::{IsolationLevel, Params};
///
/// let mut tx = conn.begin(IsolationLevel::ReadCommitted).await?;
///
/// let mut params = Params::new();
/// params.push("name", "foo");
/// tx.execute("INSERT INTO post(name) VALUES (@name)", &params).await?;
///
/// tx.commit().await?;
/// # Ok(())
/// # }
/// ```
pub struct Transaction<'c, S = TcpStream>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    conn: &'c mut Connection<S>,
    completed: bool,
}

impl<'c, S> Transaction<'c, S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub(crate) fn new(conn: &'c mut Connection<S>) -> Self {
        Self { conn, completed: false }
    }

    /// Commit the transaction.
    pub async fn commit(mut self) -> Result<()> {
        self.completed = true;
        self.conn.simple_query("COMMIT").await?;
        Ok(())
    }

    /// Roll the transaction back.
    pub async fn rollback(mut self) -> Result<()> {
        self.completed = true;
        self.conn.simple_query("ROLLBACK").await?;
        Ok(())
    }
}

impl<S> std::ops::Deref for Transaction<'_, S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    type Target = Connection<S>;

    fn deref(&self) -> &Self::Target {
        self.conn
    }
}

impl<S> std::ops::DerefMut for Transaction<'_, S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.conn
    }
}

impl<S> Drop for Transaction<'_, S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn drop(&mut self) {
        if !self.completed {
            // buffered only: flushed and settled by the connection
            // before its next command, exceptions suppressed
            self.conn.stream.send(&frontend::Query { sql: "ROLLBACK" });
            self.conn.pending_ready += 1;
        }
    }
}

impl<S> std::fmt::Debug for Transaction<'_, S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction").field("completed", &self.completed).finish()
    }
}
