//! Startup and authentication phase.
//!
//! After the startup message, the backend drives the exchange through
//! `AuthenticationRequest` subtypes until the first `ReadyForQuery`
//! closes the phase.
//!
//! <https://www.postgresql.org/docs/current/protocol-flow.html#PROTOCOL-FLOW-START-UP>
use std::fmt;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, trace};

use super::config::Config;
use crate::{
    Result,
    net::BufferedStream,
    protocol::{
        ProtocolError,
        backend::{Authentication, BackendMessage},
        frontend,
        sasl::{SCRAM_SHA_256, SaslError, ScramClient},
    },
};

/// Drive the connection from startup to the first `ReadyForQuery`.
pub(crate) async fn authenticate<S>(stream: &mut BufferedStream<S>, config: &Config) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream.send_startup(&frontend::Startup {
        user: &config.user,
        database: &config.dbname,
    });
    stream.flush().await?;

    loop {
        match stream.recv().await? {
            BackendMessage::Authentication(auth) => match auth {
                Authentication::Ok => {
                    debug!("authenticated");
                }
                Authentication::CleartextPassword => {
                    stream.send(&frontend::Password { password: &config.pass });
                    stream.flush().await?;
                }
                Authentication::Md5Password { salt } => {
                    let hashed = md5_password(&config.user, &config.pass, salt);
                    stream.send(&frontend::Password { password: &hashed });
                    stream.flush().await?;
                }
                Authentication::Sasl { mechanisms } => {
                    if !mechanisms.iter().any(|m| m == SCRAM_SHA_256) {
                        return Err(AuthError::Sasl(SaslError::mechanism_unavailable()).into());
                    }
                    sasl_exchange(stream, &config.pass).await?;
                }
                Authentication::SaslContinue { .. } | Authentication::SaslFinal { .. } => {
                    return Err(ProtocolError::new(
                        "SASL continuation outside a SASL exchange",
                    )
                    .into());
                }
                Authentication::Other(method) => {
                    return Err(AuthError::Unsupported(method).into());
                }
            },
            // session defaults, an interested bystander would keep them
            BackendMessage::ParameterStatus(status) => {
                trace!(name = %status.name, value = %status.value, "parameter status");
            }
            BackendMessage::BackendKeyData(key) => {
                trace!(process_id = key.process_id, "backend key data");
            }
            BackendMessage::NoticeResponse(notice) => {
                debug!(message = notice.message(), "notice during startup");
            }
            BackendMessage::ReadyForQuery(_) => return Ok(()),
            BackendMessage::ErrorResponse(err) => {
                return Err(AuthError::Server(err.message().into()).into());
            }
            message => {
                return Err(ProtocolError::new(format!(
                    "unexpected {} message in startup phase",
                    message.name(),
                ))
                .into());
            }
        }
    }
}

/// The SCRAM-SHA-256 leg: client-first, server-first, client-final,
/// server-final. Resumes the outer loop once the server-final message
/// has been verified; `AuthenticationOk` follows it.
async fn sasl_exchange<S>(stream: &mut BufferedStream<S>, password: &str) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut scram = ScramClient::new(password);

    let client_first = scram.client_first();
    stream.send(&frontend::SaslInitialResponse {
        mechanism: SCRAM_SHA_256,
        data: client_first.as_bytes(),
    });
    stream.flush().await?;

    loop {
        match stream.recv().await? {
            BackendMessage::Authentication(Authentication::SaslContinue { data }) => {
                let server_first = std::str::from_utf8(&data)?;
                let client_final = scram.client_final(server_first)?;
                stream.send(&frontend::SaslResponse { data: client_final.as_bytes() });
                stream.flush().await?;
            }
            BackendMessage::Authentication(Authentication::SaslFinal { data }) => {
                scram.verify_server_final(std::str::from_utf8(&data)?)?;
                return Ok(());
            }
            BackendMessage::NoticeResponse(notice) => {
                debug!(message = notice.message(), "notice during SASL exchange");
            }
            BackendMessage::ErrorResponse(err) => {
                return Err(AuthError::Server(err.message().into()).into());
            }
            message => {
                return Err(ProtocolError::new(format!(
                    "unexpected {} message in SASL exchange",
                    message.name(),
                ))
                .into());
            }
        }
    }
}

/// The md5 recipe: `"md5" + hex(md5(hex(md5(password + user)) + salt))`
/// with lowercase hex.
fn md5_password(user: &str, password: &str, salt: [u8; 4]) -> String {
    let inner = md5::compute(format!("{password}{user}"));
    let mut outer = format!("{inner:x}").into_bytes();
    outer.extend_from_slice(&salt);
    format!("md5{:x}", md5::compute(outer))
}

/// Authentication failure during the startup phase.
pub enum AuthError {
    /// The backend rejected the credentials.
    Server(String),
    /// The backend requested an authentication method this crate does
    /// not implement.
    Unsupported(i32),
    /// The SCRAM exchange failed.
    Sasl(SaslError),
}

impl std::error::Error for AuthError { }

impl fmt::Display for AuthError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Server(message) => write!(f, "authentication failed: {message}"),
            Self::Unsupported(method) => {
                write!(f, "unsupported authentication method ({method})")
            }
            Self::Sasl(e) => e.fmt(f),
        }
    }
}

impl fmt::Debug for AuthError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{self}\"")
    }
}
