//! Postgres configuration.
use std::{borrow::Cow, env::var, fmt};

use crate::common::ByteStr;

/// Postgres connection config.
///
/// Parsed from an ADO-style connection string of semicolon separated
/// `key=value` pairs, keys case-insensitive, unknown keys ignored:
///
/// ```
/// use pgline::Config;
///
/// let config = Config::parse("Host=db.internal;Port=5433;Database=app;Username=svc;Password=s3cr3t")?;
/// # Ok::<(), pgline::Error>(())
/// ```
#[derive(Clone, Debug)]
pub struct Config {
    pub(crate) host: ByteStr,
    pub(crate) port: u16,
    pub(crate) dbname: ByteStr,
    pub(crate) user: ByteStr,
    pub(crate) pass: ByteStr,
}

impl Config {
    /// Parse a connection string.
    ///
    /// Recognized keys: `host`/`server` (default `localhost`), `port`
    /// (default 5432), `database`/`db`, `username`/`user`/`uid`,
    /// `password`/`pwd` (default empty).
    pub fn parse(s: &str) -> Result<Config, ParseError> {
        Self::parse_inner(ByteStr::copy_from_str(s))
    }

    /// Parse a static connection string.
    ///
    /// This is for micro optimization, see [`Bytes::from_static`][1].
    ///
    /// [1]: bytes::Bytes::from_static
    pub fn parse_static(s: &'static str) -> Result<Config, ParseError> {
        Self::parse_inner(ByteStr::from_static(s))
    }

    fn parse_inner(s: ByteStr) -> Result<Self, ParseError> {
        let mut config = Config::default();

        for pair in s.split(';') {
            if pair.trim().is_empty() {
                continue;
            }
            let Some((key, value)) = pair.split_once('=') else {
                return Err(ParseError {
                    reason: format!("expected key=value, found `{pair}`").into(),
                });
            };
            let key = key.trim();
            let value = value.trim();

            if key.eq_ignore_ascii_case("host") || key.eq_ignore_ascii_case("server") {
                config.host = s.slice_ref(value);
            } else if key.eq_ignore_ascii_case("port") {
                config.port = value
                    .parse()
                    .map_err(|_| ParseError { reason: format!("invalid port `{value}`").into() })?;
            } else if key.eq_ignore_ascii_case("database") || key.eq_ignore_ascii_case("db") {
                config.dbname = s.slice_ref(value);
            } else if key.eq_ignore_ascii_case("username")
                || key.eq_ignore_ascii_case("user")
                || key.eq_ignore_ascii_case("uid")
            {
                config.user = s.slice_ref(value);
            } else if key.eq_ignore_ascii_case("password") || key.eq_ignore_ascii_case("pwd") {
                config.pass = s.slice_ref(value);
            }
            // unknown keys ignored
        }

        Ok(config)
    }

    /// Retrieve configuration from environment variable.
    ///
    /// It reads `PGHOST`, `PGPORT`, `PGDATABASE`, `PGUSER` and
    /// `PGPASSWORD`, falling back to the same defaults as
    /// [`parse`][Config::parse].
    pub fn from_env() -> Config {
        let mut config = Config::default();
        if let Ok(host) = var("PGHOST") {
            config.host = host.into();
        }
        if let Ok(Ok(port)) = var("PGPORT").map(|p| p.parse()) {
            config.port = port;
        }
        if let Ok(dbname) = var("PGDATABASE") {
            config.dbname = dbname.into();
        }
        if let Ok(user) = var("PGUSER") {
            config.user = user.into();
        }
        if let Ok(pass) = var("PGPASSWORD") {
            config.pass = pass.into();
        }
        config
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn database(&self) -> &str {
        &self.dbname
    }

    pub fn username(&self) -> &str {
        &self.user
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: ByteStr::from_static("localhost"),
            port: 5432,
            dbname: ByteStr::from_static(""),
            user: ByteStr::from_static(""),
            pass: ByteStr::from_static(""),
        }
    }
}

impl std::str::FromStr for Config {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Error when parsing a connection string.
pub struct ParseError {
    reason: Cow<'static, str>,
}

impl std::error::Error for ParseError { }

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if f.alternate() {
            return f.write_str(&self.reason);
        }
        write!(f, "failed to parse connection string: {}", self.reason)
    }
}

impl fmt::Debug for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{self}\"")
    }
}
