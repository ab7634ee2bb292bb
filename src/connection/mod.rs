//! Postgres connection.
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::{debug, trace};

use crate::{
    Error, Result,
    error::UsageError,
    net::BufferedStream,
    params::Params,
    protocol::{backend::BackendMessage, frontend},
    reader::RowReader,
    sql::{self, SqlError},
    transaction::{IsolationLevel, Transaction},
    types::PgValue,
};

pub mod config;
mod startup;

pub use config::Config;
pub use startup::AuthError;

/// A single postgres session over one TCP connection.
///
/// Exactly one command is in flight at a time; the protocol is
/// half-duplex by convention and the api enforces it through `&mut`
/// borrows. Every operation attempts a synchronous fulfillment from
/// buffered bytes before touching the socket.
///
/// Dropping a future mid-operation (cancellation) aborts at the
/// pending socket await and leaves the session in an indeterminate
/// protocol state; close it rather than reuse it.
///
/// # Example
///
/// ```no_run
/// use pgline::{Connection, Params};
///
/// # async fn app() -> pgline::Result<()> {
/// let mut conn = Connection::open_str("host=localhost;user=postgres;password=secret").await?;
///
/// let mut params = Params::new();
/// params.push("id", 2001);
///
/// let mut rows = conn.query("SELECT name FROM users WHERE id = @id", &params).await?;
/// while rows.read().await? {
///     println!("{}", rows.get_str(0)?);
/// }
/// # Ok(())
/// # }
/// ```
pub struct Connection<S = TcpStream> {
    pub(crate) stream: BufferedStream<S>,
    open: bool,
    /// `ReadyForQuery` messages still owed to the wire before the next
    /// command may start: abandoned readers and dropped transactions.
    pub(crate) pending_ready: u32,
}

impl Connection<TcpStream> {
    /// Connect and authenticate.
    pub async fn open(config: &Config) -> Result<Self> {
        let socket = TcpStream::connect((config.host.as_str(), config.port))
            .await
            .map_err(|e| Error::from(e).with_context("connecting"))?;
        socket.set_nodelay(true)?;
        Self::handshake(socket, config).await
    }

    /// Connect using a connection string, see [`Config::parse`].
    pub async fn open_str(s: &str) -> Result<Self> {
        Self::open(&Config::parse(s)?).await
    }
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Run startup and authentication over an established stream.
    pub(crate) async fn handshake(socket: S, config: &Config) -> Result<Self> {
        let mut stream = BufferedStream::new(socket);
        startup::authenticate(&mut stream, config).await?;
        debug!(host = %config.host, database = %config.dbname, "session open");
        Ok(Self { stream, open: true, pending_ready: 0 })
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    /// Close the session: best-effort `Terminate`, then the socket goes
    /// down with the stream. Idempotent.
    pub async fn close(&mut self) -> Result<()> {
        if !self.open {
            return Ok(());
        }
        self.open = false;
        self.stream.send(&frontend::Terminate);
        let _ = self.stream.flush().await;
        debug!("session closed");
        Ok(())
    }

    /// Execute a statement and return the server-reported affected-row
    /// count.
    pub async fn execute(&mut self, sql: &str, params: &Params) -> Result<u64> {
        self.ready_for_command(sql).await?;
        self.send_burst(sql, params)?;
        self.stream.flush().await?;
        self.consume_to_ready().await
    }

    /// Execute a query and stream its rows through a [`RowReader`].
    ///
    /// The reader holds the connection until it is consumed, closed or
    /// dropped.
    pub async fn query(&mut self, sql: &str, params: &Params) -> Result<RowReader<'_, S>> {
        self.ready_for_command(sql).await?;
        self.send_burst(sql, params)?;
        self.stream.flush().await?;
        Ok(RowReader::new(self))
    }

    /// Execute a query and return the first column of the first row,
    /// `None` when the result set is empty.
    pub async fn query_scalar(&mut self, sql: &str, params: &Params) -> Result<Option<PgValue>> {
        let mut reader = self.query(sql, params).await?;
        let mut value = None;
        if reader.read().await? && reader.column_count() > 0 {
            value = Some(reader.value(0)?);
        }
        reader.close().await?;
        Ok(value)
    }

    /// Run a statement through the simple query protocol (single `Q`
    /// message, text format). Used for transaction control.
    ///
    /// <https://www.postgresql.org/docs/current/protocol-flow.html#PROTOCOL-FLOW-SIMPLE-QUERY>
    pub async fn simple_query(&mut self, sql: &str) -> Result<u64> {
        self.ready_for_command(sql).await?;
        self.stream.send(&frontend::Query { sql });
        self.stream.flush().await?;
        self.consume_to_ready().await
    }

    /// Begin a transaction at the given isolation level.
    pub async fn begin(&mut self, isolation: IsolationLevel) -> Result<Transaction<'_, S>> {
        self.simple_query(isolation.begin_statement()).await?;
        Ok(Transaction::new(self))
    }

    /// Precondition checks shared by every command, plus settling
    /// whatever a dropped reader or transaction left on the wire.
    async fn ready_for_command(&mut self, sql: &str) -> Result<()> {
        if !self.open {
            return Err(UsageError::NotOpen.into());
        }
        if sql.trim().is_empty() {
            return Err(UsageError::EmptySql.into());
        }
        self.settle().await
    }

    /// Consume owed `ReadyForQuery` messages, flushing first in case a
    /// dropped transaction's `ROLLBACK` is still buffered.
    async fn settle(&mut self) -> Result<()> {
        if self.pending_ready == 0 {
            return Ok(());
        }
        trace!(cycles = self.pending_ready, "settling abandoned cycles");
        self.stream.flush().await?;
        while self.pending_ready > 0 {
            if let BackendMessage::ReadyForQuery(_) = self.stream.recv().await? {
                self.pending_ready -= 1;
            }
        }
        Ok(())
    }

    /// Buffer the extended query burst: Parse, Bind, Describe, Execute,
    /// Sync. One flush sends all five, the backend pipelines them and
    /// answers with a single stream.
    fn send_burst(&mut self, sql: &str, params: &Params) -> Result<()> {
        let prepared = sql::substitute(sql);

        // referenced but missing fails before anything is sent;
        // unreferenced parameters are simply not sent
        let mut encoded = Vec::with_capacity(prepared.names.len());
        for name in &prepared.names {
            let param = params.resolve(name).ok_or_else(|| SqlError::missing(name))?;
            encoded.push(param.value().encode());
        }

        self.stream.send(&frontend::Parse {
            statement: "",
            sql: &prepared.sql,
            params: &encoded,
        });
        self.stream.send(&frontend::Bind { portal: "", statement: "", params: &encoded });
        self.stream.send(&frontend::Describe { kind: b'P', name: "" });
        self.stream.send(&frontend::Execute { portal: "", max_rows: 0 });
        self.stream.send(&frontend::Sync);
        Ok(())
    }

    /// Read to `ReadyForQuery`, recording the affected-row count from
    /// `CommandComplete`. Row data and completion chatter are skipped;
    /// an `ErrorResponse` fails with the server message after the cycle
    /// has been drained, leaving the session recoverable.
    async fn consume_to_ready(&mut self) -> Result<u64> {
        let mut rows_affected = 0;
        loop {
            match self.stream.recv().await? {
                BackendMessage::CommandComplete(cmd) => rows_affected = cmd.rows_affected(),
                BackendMessage::ReadyForQuery(_) => return Ok(rows_affected),
                BackendMessage::ErrorResponse(err) => {
                    self.drain_ready().await?;
                    return Err(err.into());
                }
                BackendMessage::NoticeResponse(notice) => {
                    debug!(message = notice.message(), "notice");
                }
                _ => {}
            }
        }
    }

    /// Skip everything up to and including the next `ReadyForQuery`.
    async fn drain_ready(&mut self) -> Result<()> {
        loop {
            if let BackendMessage::ReadyForQuery(_) = self.stream.recv().await? {
                return Ok(());
            }
        }
    }
}

impl<S> std::fmt::Debug for Connection<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("open", &self.open)
            .field("pending_ready", &self.pending_ready)
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{ErrorKind, types::oid};
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream, duplex};

    fn block_on<F: std::future::Future>(f: F) -> F::Output {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap()
            .block_on(f)
    }

    fn test_config() -> Config {
        Config::parse("username=bob;password=pw;database=db").unwrap()
    }

    // ===== scripted backend plumbing =====

    fn msg(tag: u8, body: &[u8]) -> Vec<u8> {
        let mut out = vec![tag];
        out.extend(((body.len() + 4) as i32).to_be_bytes());
        out.extend(body);
        out
    }

    fn auth(subtype: i32, extra: &[u8]) -> Vec<u8> {
        let mut body = subtype.to_be_bytes().to_vec();
        body.extend(extra);
        msg(b'R', &body)
    }

    fn ready() -> Vec<u8> {
        msg(b'Z', b"I")
    }

    fn command_complete(tag: &str) -> Vec<u8> {
        let mut body = tag.as_bytes().to_vec();
        body.push(0);
        msg(b'C', &body)
    }

    fn error_response(message: &str) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend(b"SERROR\0");
        body.push(b'M');
        body.extend(message.as_bytes());
        body.push(0);
        body.push(0);
        msg(b'E', &body)
    }

    fn row_description(columns: &[(&str, u32, i16)]) -> Vec<u8> {
        let mut body = (columns.len() as u16).to_be_bytes().to_vec();
        for (name, oid, format) in columns {
            body.extend(name.as_bytes());
            body.push(0);
            body.extend(0u32.to_be_bytes()); // table oid
            body.extend(0u16.to_be_bytes()); // attribute number
            body.extend(oid.to_be_bytes());
            body.extend((-1i16).to_be_bytes()); // type size
            body.extend((-1i32).to_be_bytes()); // type modifier
            body.extend(format.to_be_bytes());
        }
        msg(b'T', &body)
    }

    fn data_row(columns: &[Option<&[u8]>]) -> Vec<u8> {
        let mut body = (columns.len() as u16).to_be_bytes().to_vec();
        for column in columns {
            match column {
                Some(value) => {
                    body.extend((value.len() as i32).to_be_bytes());
                    body.extend(*value);
                }
                None => body.extend((-1i32).to_be_bytes()),
            }
        }
        msg(b'D', &body)
    }

    /// Read the tagless startup message, returning its body.
    async fn read_startup(server: &mut DuplexStream) -> Vec<u8> {
        let mut len = [0u8; 4];
        server.read_exact(&mut len).await.unwrap();
        let mut body = vec![0; i32::from_be_bytes(len) as usize - 4];
        server.read_exact(&mut body).await.unwrap();
        body
    }

    /// Read one tagged frontend message.
    async fn read_frame(server: &mut DuplexStream) -> (u8, Vec<u8>) {
        let mut header = [0u8; 5];
        server.read_exact(&mut header).await.unwrap();
        let len = i32::from_be_bytes(header[1..].try_into().unwrap()) as usize;
        let mut body = vec![0; len - 4];
        server.read_exact(&mut body).await.unwrap();
        (header[0], body)
    }

    /// Read the five-message extended query burst, returning the SQL
    /// the Parse message carried.
    async fn read_burst(server: &mut DuplexStream) -> String {
        let (tag, parse) = read_frame(server).await;
        assert_eq!(tag, b'P');
        assert_eq!(parse[0], 0, "unnamed statement");
        let sql_end = 1 + parse[1..].iter().position(|b| *b == 0).unwrap();
        let sql = std::str::from_utf8(&parse[1..sql_end]).unwrap().to_string();

        for expect in [b'B', b'D', b'E', b'S'] {
            let (tag, _) = read_frame(server).await;
            assert_eq!(tag, expect);
        }
        sql
    }

    /// Accept the startup message and answer trust authentication.
    async fn trust_handshake(server: &mut DuplexStream) {
        let startup = read_startup(server).await;
        assert_eq!(&startup[..4], 196608i32.to_be_bytes());
        let mut response = auth(0, b"");
        response.extend(msg(b'S', b"server_version\017\0"));
        response.extend(msg(b'K', &[0, 0, 0, 9, 0, 0, 0, 42]));
        response.extend(ready());
        server.write_all(&response).await.unwrap();
    }

    async fn open_trusted(server: &mut DuplexStream, client: DuplexStream) -> Connection<DuplexStream> {
        let config = test_config();
        let (conn, _) = tokio::join!(Connection::handshake(client, &config), trust_handshake(server));
        conn.unwrap()
    }

    // ===== authentication =====

    #[test]
    fn cleartext_authentication() {
        block_on(async {
            let (client, mut server) = duplex(64 * 1024);

            let backend = async {
                let startup = read_startup(&mut server).await;
                let text = String::from_utf8_lossy(&startup).into_owned();
                assert!(text.contains("user\0bob\0"));
                assert!(text.contains("database\0db\0"));
                assert!(text.contains("client_encoding\0UTF8\0"));

                server.write_all(&auth(3, b"")).await.unwrap();

                let (tag, body) = read_frame(&mut server).await;
                assert_eq!(tag, b'p');
                assert_eq!(body, b"pw\0");

                let mut rest = auth(0, b"");
                rest.extend(ready());
                server.write_all(&rest).await.unwrap();
            };

            let config = test_config();
            let (conn, _) = tokio::join!(Connection::handshake(client, &config), backend);
            assert!(conn.unwrap().is_open());
        });
    }

    #[test]
    fn md5_authentication() {
        block_on(async {
            let (client, mut server) = duplex(64 * 1024);

            let backend = async {
                read_startup(&mut server).await;
                server.write_all(&auth(5, b"salt")).await.unwrap();

                let (tag, body) = read_frame(&mut server).await;
                assert_eq!(tag, b'p');
                // md5 + hex(md5(hex(md5(password + user)) + salt))
                let inner = format!("{:x}", md5::compute("pwbob"));
                let mut outer = inner.into_bytes();
                outer.extend_from_slice(b"salt");
                let mut expect = format!("md5{:x}", md5::compute(outer)).into_bytes();
                expect.push(0);
                assert_eq!(body, expect);

                let mut rest = auth(0, b"");
                rest.extend(ready());
                server.write_all(&rest).await.unwrap();
            };

            let config = test_config();
            let (conn, _) = tokio::join!(Connection::handshake(client, &config), backend);
            assert!(conn.unwrap().is_open());
        });
    }

    #[test]
    fn scram_authentication() {
        use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
        use hmac::{Hmac, Mac};
        use pbkdf2::pbkdf2_hmac_array;
        use sha2::{Digest, Sha256};

        fn hmac(key: &[u8], data: &[u8]) -> [u8; 32] {
            let mut mac = Hmac::<Sha256>::new_from_slice(key).unwrap();
            mac.update(data);
            mac.finalize().into_bytes().into()
        }

        block_on(async {
            let (client, mut server) = duplex(64 * 1024);

            let backend = async {
                read_startup(&mut server).await;
                server
                    .write_all(&auth(10, b"SCRAM-SHA-256\0\0"))
                    .await
                    .unwrap();

                // SASLInitialResponse: mechanism, length, client-first
                let (tag, body) = read_frame(&mut server).await;
                assert_eq!(tag, b'p');
                assert_eq!(&body[..14], b"SCRAM-SHA-256\0");
                let len = i32::from_be_bytes(body[14..18].try_into().unwrap()) as usize;
                let client_first = std::str::from_utf8(&body[18..18 + len]).unwrap();
                let client_bare = client_first.strip_prefix("n,,").unwrap().to_string();
                let client_nonce = client_bare.strip_prefix("n=,r=").unwrap();

                let salt = b"table salt";
                let iterations = 1024u32; // keep the test fast
                let nonce = format!("{client_nonce}serverside");
                let server_first =
                    format!("r={nonce},s={},i={iterations}", BASE64.encode(salt));
                server.write_all(&auth(11, server_first.as_bytes())).await.unwrap();

                // client-final: channel binding, nonce, proof
                let (tag, body) = read_frame(&mut server).await;
                assert_eq!(tag, b'p');
                let client_final = std::str::from_utf8(&body).unwrap();
                let without_proof = format!("c=biws,r={nonce}");
                let proof = client_final
                    .strip_prefix(&format!("{without_proof},p="))
                    .expect("client-final must carry the proof last");

                // verify the proof against the shared password
                let salted = pbkdf2_hmac_array::<Sha256, 32>(b"pw", salt, iterations);
                let client_key = hmac(&salted, b"Client Key");
                let stored_key: [u8; 32] = Sha256::digest(client_key).into();
                let auth_message =
                    format!("{client_bare},{server_first},{without_proof}");
                let signature = hmac(&stored_key, auth_message.as_bytes());
                let expect: Vec<u8> =
                    client_key.iter().zip(signature).map(|(k, s)| k ^ s).collect();
                assert_eq!(BASE64.decode(proof).unwrap(), expect);

                // server-final with the server signature, then Ok
                let server_key = hmac(&salted, b"Server Key");
                let server_signature = hmac(&server_key, auth_message.as_bytes());
                let server_final = format!("v={}", BASE64.encode(server_signature));
                let mut rest = auth(12, server_final.as_bytes());
                rest.extend(auth(0, b""));
                rest.extend(ready());
                server.write_all(&rest).await.unwrap();
            };

            let config = test_config();
            let (conn, _) = tokio::join!(Connection::handshake(client, &config), backend);
            assert!(conn.unwrap().is_open());
        });
    }

    #[test]
    fn scram_rejects_forged_server_signature() {
        use base64::{Engine, engine::general_purpose::STANDARD as BASE64};

        block_on(async {
            let (client, mut server) = duplex(64 * 1024);

            let backend = async {
                read_startup(&mut server).await;
                server.write_all(&auth(10, b"SCRAM-SHA-256\0\0")).await.unwrap();

                let (_, body) = read_frame(&mut server).await;
                let len = i32::from_be_bytes(body[14..18].try_into().unwrap()) as usize;
                let client_first =
                    std::str::from_utf8(&body[18..18 + len]).unwrap().to_string();
                let nonce = client_first.strip_prefix("n,,n=,r=").unwrap();

                let server_first =
                    format!("r={nonce}srv,s={},i=512", BASE64.encode(b"salt"));
                server.write_all(&auth(11, server_first.as_bytes())).await.unwrap();

                read_frame(&mut server).await;
                // a signature derived from the wrong password
                server.write_all(&auth(12, b"v=Zm9yZ2Vk")).await.unwrap();
            };

            let config = test_config();
            let (conn, _) = tokio::join!(Connection::handshake(client, &config), backend);
            assert!(matches!(conn.unwrap_err().kind(), ErrorKind::Auth(_)));
        });
    }

    #[test]
    fn wrong_password_is_an_auth_error() {
        block_on(async {
            let (client, mut server) = duplex(64 * 1024);

            let backend = async {
                read_startup(&mut server).await;
                server.write_all(&auth(3, b"")).await.unwrap();
                read_frame(&mut server).await;
                server
                    .write_all(&error_response("password authentication failed for user \"bob\""))
                    .await
                    .unwrap();
            };

            let config = test_config();
            let (conn, _) = tokio::join!(Connection::handshake(client, &config), backend);
            let err = conn.unwrap_err();
            assert!(matches!(err.kind(), ErrorKind::Auth(AuthError::Server(_))));
        });
    }

    #[test]
    fn unsupported_auth_method_fails() {
        block_on(async {
            let (client, mut server) = duplex(64 * 1024);

            let backend = async {
                read_startup(&mut server).await;
                // Kerberos V5
                server.write_all(&auth(2, b"")).await.unwrap();
            };

            let config = test_config();
            let (conn, _) = tokio::join!(Connection::handshake(client, &config), backend);
            assert!(matches!(
                conn.unwrap_err().kind(),
                ErrorKind::Auth(AuthError::Unsupported(2)),
            ));
        });
    }

    // ===== query pipeline =====

    #[test]
    fn execute_substitutes_and_reports_affected_rows() {
        block_on(async {
            let (client, mut server) = duplex(64 * 1024);
            let mut conn = open_trusted(&mut server, client).await;

            let backend = async {
                let sql = read_burst(&mut server).await;
                assert_eq!(sql, "INSERT INTO users(id, name) VALUES ($1, $2)");

                let mut response = msg(b'1', b"");
                response.extend(msg(b'2', b""));
                response.extend(msg(b'n', b""));
                response.extend(command_complete("INSERT 0 1"));
                response.extend(ready());
                server.write_all(&response).await.unwrap();
            };

            let mut params = Params::new();
            params.push("name", "ADO.NET User");
            params.push("id", 2001);
            params.push("unused", false); // allowed, simply not sent

            let run = conn.execute(
                "INSERT INTO users(id, name) VALUES (@id, @name)",
                &params,
            );
            let (rows, _) = tokio::join!(run, backend);
            assert_eq!(rows.unwrap(), 1);
        });
    }

    #[test]
    fn missing_parameter_fails_before_send() {
        block_on(async {
            let (client, mut server) = duplex(64 * 1024);
            let mut conn = open_trusted(&mut server, client).await;

            let err = conn
                .execute("SELECT @nope", &Params::new())
                .await
                .unwrap_err();
            assert!(matches!(err.kind(), ErrorKind::Sql(_)));

            // nothing reached the wire, the session is still clean
            assert!(conn.is_open());
        });
    }

    #[test]
    fn usage_preconditions() {
        block_on(async {
            let (client, mut server) = duplex(64 * 1024);
            let mut conn = open_trusted(&mut server, client).await;

            let err = conn.execute("   ", &Params::new()).await.unwrap_err();
            assert!(matches!(err.kind(), ErrorKind::Usage(UsageError::EmptySql)));

            conn.close().await.unwrap();
            conn.close().await.unwrap(); // idempotent

            let err = conn.execute("SELECT 1", &Params::new()).await.unwrap_err();
            assert!(matches!(err.kind(), ErrorKind::Usage(UsageError::NotOpen)));
        });
    }

    #[test]
    fn reader_streams_typed_rows() {
        block_on(async {
            let (client, mut server) = duplex(64 * 1024);
            let mut conn = open_trusted(&mut server, client).await;

            let backend = async {
                let sql = read_burst(&mut server).await;
                assert_eq!(sql, "SELECT id, name, option, flag FROM data");

                let mut response = msg(b'1', b"");
                response.extend(msg(b'2', b""));
                response.extend(row_description(&[
                    ("id", oid::INT4, 1),
                    ("name", oid::VARCHAR, 1),
                    ("option", oid::VARCHAR, 1),
                    ("flag", oid::BOOL, 1),
                ]));
                response.extend(data_row(&[
                    Some(&1i32.to_be_bytes()),
                    Some(b"name 1"),
                    Some(b"option 1"),
                    Some(&[0]),
                ]));
                response.extend(data_row(&[
                    Some(&2i32.to_be_bytes()),
                    Some(b"name 2"),
                    None,
                    Some(&[1]),
                ]));
                response.extend(command_complete("SELECT 2"));
                response.extend(ready());
                server.write_all(&response).await.unwrap();
            };

            let run = async {
                let mut rows = conn
                    .query("SELECT id, name, option, flag FROM data", &Params::new())
                    .await?;

                assert!(rows.read().await?);
                assert_eq!(rows.column_count(), 4);
                assert_eq!(rows.columns()[1].name(), "name");
                assert_eq!(rows.ordinal("flag"), Some(3));

                assert_eq!(rows.get_i32(0)?, 1);
                assert_eq!(rows.get_str(1)?, "name 1");
                assert_eq!(rows.get_string(2)?, "option 1");
                assert!(!rows.get_bool(3)?);
                assert!(!rows.is_null(2)?);

                assert!(rows.read().await?);
                assert_eq!(rows.get_i32(0)?, 2);
                assert!(rows.is_null(2)?);
                assert_eq!(rows.value(2)?, PgValue::Null);
                // typed access to NULL is a cast error
                assert!(matches!(
                    rows.get_string(2).unwrap_err().kind(),
                    ErrorKind::Decode(_),
                ));
                // so is a wrong-type access
                assert!(matches!(
                    rows.get_i64(0).unwrap_err().kind(),
                    ErrorKind::Decode(_),
                ));
                assert!(rows.get_bool(3)?);

                assert!(!rows.read().await?);
                assert!(!rows.read().await?); // idempotent after the end
                crate::Result::<()>::Ok(())
            };

            let (run, _) = tokio::join!(run, backend);
            run.unwrap();
            assert_eq!(conn.pending_ready, 0);
        });
    }

    #[test]
    fn server_error_mid_stream_leaves_connection_usable() {
        block_on(async {
            let (client, mut server) = duplex(64 * 1024);
            let mut conn = open_trusted(&mut server, client).await;

            let backend = async {
                read_burst(&mut server).await;
                let mut response = error_response("division by zero");
                response.extend(ready());
                server.write_all(&response).await.unwrap();

                // the next command proceeds normally
                read_burst(&mut server).await;
                let mut response = command_complete("SELECT 1");
                response.extend(ready());
                server.write_all(&response).await.unwrap();
            };

            let run = async {
                let mut rows = conn.query("SELECT 1/0", &Params::new()).await.unwrap();
                let err = rows.read().await.unwrap_err();
                assert!(matches!(err.kind(), ErrorKind::Database(_)));
                assert!(err.is_recoverable());
                drop(rows);

                let n = conn.execute("SELECT 1", &Params::new()).await.unwrap();
                assert_eq!(n, 0);
            };

            tokio::join!(run, backend);
        });
    }

    #[test]
    fn dropped_reader_is_settled_before_the_next_command() {
        block_on(async {
            let (client, mut server) = duplex(64 * 1024);
            let mut conn = open_trusted(&mut server, client).await;

            let backend = async {
                read_burst(&mut server).await;
                let mut response = row_description(&[("n", oid::INT4, 1)]);
                for n in [1i32, 2, 3] {
                    response.extend(data_row(&[Some(&n.to_be_bytes())]));
                }
                response.extend(command_complete("SELECT 3"));
                response.extend(ready());
                server.write_all(&response).await.unwrap();

                read_burst(&mut server).await;
                let mut response = command_complete("SELECT 1");
                response.extend(ready());
                server.write_all(&response).await.unwrap();
            };

            let run = async {
                let mut rows = conn.query("SELECT n FROM t", &Params::new()).await.unwrap();
                assert!(rows.read().await.unwrap());
                assert_eq!(rows.get_i32(0).unwrap(), 1);
                drop(rows); // two rows and the tail still on the wire
                assert_eq!(conn.pending_ready, 1);

                conn.execute("SELECT 1", &Params::new()).await.unwrap();
                assert_eq!(conn.pending_ready, 0);
            };

            tokio::join!(run, backend);
        });
    }

    #[test]
    fn explicit_close_drains_the_stream() {
        block_on(async {
            let (client, mut server) = duplex(64 * 1024);
            let mut conn = open_trusted(&mut server, client).await;

            let backend = async {
                read_burst(&mut server).await;
                let mut response = row_description(&[("n", oid::INT4, 1)]);
                response.extend(data_row(&[Some(&7i32.to_be_bytes())]));
                response.extend(data_row(&[Some(&8i32.to_be_bytes())]));
                response.extend(command_complete("SELECT 2"));
                response.extend(ready());
                server.write_all(&response).await.unwrap();
            };

            let run = async {
                let mut rows = conn.query("SELECT n FROM t", &Params::new()).await.unwrap();
                assert!(rows.read().await.unwrap());
                rows.close().await.unwrap();
                assert_eq!(conn.pending_ready, 0);
            };

            tokio::join!(run, backend);
        });
    }

    #[test]
    fn query_scalar_returns_first_column_or_none() {
        block_on(async {
            let (client, mut server) = duplex(64 * 1024);
            let mut conn = open_trusted(&mut server, client).await;

            let backend = async {
                read_burst(&mut server).await;
                let mut response = row_description(&[("count", oid::INT8, 1)]);
                response.extend(data_row(&[Some(&42i64.to_be_bytes())]));
                response.extend(command_complete("SELECT 1"));
                response.extend(ready());
                server.write_all(&response).await.unwrap();

                read_burst(&mut server).await;
                let mut response = row_description(&[("n", oid::INT4, 1)]);
                response.extend(command_complete("SELECT 0"));
                response.extend(ready());
                server.write_all(&response).await.unwrap();
            };

            let run = async {
                let value = conn
                    .query_scalar("SELECT count(*) FROM t", &Params::new())
                    .await
                    .unwrap();
                assert_eq!(value, Some(PgValue::Int8(42)));

                let value = conn
                    .query_scalar("SELECT n FROM t WHERE false", &Params::new())
                    .await
                    .unwrap();
                assert_eq!(value, None);
            };

            tokio::join!(run, backend);
        });
    }

    // ===== transactions =====

    async fn simple_query_backend(server: &mut DuplexStream, expect: &str, tag: &str) {
        let (kind, body) = read_frame(server).await;
        assert_eq!(kind, b'Q');
        let mut sql = expect.as_bytes().to_vec();
        sql.push(0);
        assert_eq!(body, sql);
        let mut response = command_complete(tag);
        response.extend(ready());
        server.write_all(&response).await.unwrap();
    }

    #[test]
    fn transaction_commit_flow() {
        block_on(async {
            let (client, mut server) = duplex(64 * 1024);
            let mut conn = open_trusted(&mut server, client).await;

            let backend = async {
                simple_query_backend(
                    &mut server,
                    "BEGIN ISOLATION LEVEL SERIALIZABLE",
                    "BEGIN",
                )
                .await;

                let sql = read_burst(&mut server).await;
                assert_eq!(sql, "INSERT INTO t(n) VALUES ($1)");
                let mut response = command_complete("INSERT 0 1");
                response.extend(ready());
                server.write_all(&response).await.unwrap();

                simple_query_backend(&mut server, "COMMIT", "COMMIT").await;
            };

            let run = async {
                let mut tx = conn.begin(IsolationLevel::Serializable).await.unwrap();

                let mut params = Params::new();
                params.push("n", 5);
                let rows = tx.execute("INSERT INTO t(n) VALUES (@n)", &params).await.unwrap();
                assert_eq!(rows, 1);

                tx.commit().await.unwrap();
            };

            tokio::join!(run, backend);
            assert_eq!(conn.pending_ready, 0);
        });
    }

    #[test]
    fn dropped_transaction_rolls_back_before_the_next_command() {
        block_on(async {
            let (client, mut server) = duplex(64 * 1024);
            let mut conn = open_trusted(&mut server, client).await;

            let backend = async {
                simple_query_backend(
                    &mut server,
                    "BEGIN ISOLATION LEVEL READ COMMITTED",
                    "BEGIN",
                )
                .await;

                // the buffered rollback arrives with the next command's
                // settle flush
                simple_query_backend(&mut server, "ROLLBACK", "ROLLBACK").await;

                read_burst(&mut server).await;
                let mut response = command_complete("SELECT 1");
                response.extend(ready());
                server.write_all(&response).await.unwrap();
            };

            let run = async {
                let tx = conn.begin(IsolationLevel::default()).await.unwrap();
                drop(tx);
                assert_eq!(conn.pending_ready, 1);

                conn.execute("SELECT 1", &Params::new()).await.unwrap();
                assert_eq!(conn.pending_ready, 0);
            };

            tokio::join!(run, backend);
        });
    }

    #[test]
    fn explicit_rollback_flow() {
        block_on(async {
            let (client, mut server) = duplex(64 * 1024);
            let mut conn = open_trusted(&mut server, client).await;

            let backend = async {
                simple_query_backend(
                    &mut server,
                    "BEGIN ISOLATION LEVEL REPEATABLE READ",
                    "BEGIN",
                )
                .await;
                simple_query_backend(&mut server, "ROLLBACK", "ROLLBACK").await;
            };

            let run = async {
                let tx = conn.begin(IsolationLevel::RepeatableRead).await.unwrap();
                tx.rollback().await.unwrap();
            };

            tokio::join!(run, backend);
            assert_eq!(conn.pending_ready, 0);
        });
    }

    #[test]
    fn close_emits_terminate() {
        block_on(async {
            let (client, mut server) = duplex(64 * 1024);
            let mut conn = open_trusted(&mut server, client).await;

            conn.close().await.unwrap();
            assert!(!conn.is_open());

            let (tag, body) = read_frame(&mut server).await;
            assert_eq!((tag, body.len()), (b'X', 0));
        });
    }
}
