//! SCRAM-SHA-256 client exchange, RFC 5802 with SHA-256.
//!
//! The flow is client-first, server-first, client-final, server-final.
//! Channel binding is not negotiated (`n,,` gs2 header), and the
//! username attribute is left empty since the backend takes the user
//! from the startup message.
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use hmac::{Hmac, Mac};
use pbkdf2::pbkdf2_hmac_array;
use rand::{RngCore, rngs::OsRng};
use sha2::{Digest, Sha256};
use std::{borrow::Cow, fmt};

/// The only SASL mechanism this crate speaks.
pub const SCRAM_SHA_256: &str = "SCRAM-SHA-256";

const NONCE_LEN: usize = 18;
const KEY_LEN: usize = 32;

type HmacSha256 = Hmac<Sha256>;

/// Client side of one SCRAM-SHA-256 exchange.
///
/// Single use: [`client_first`][ScramClient::client_first], then
/// [`client_final`][ScramClient::client_final] on the server-first
/// message, then [`verify_server_final`][ScramClient::verify_server_final]
/// on the server-final message.
pub struct ScramClient {
    password: String,
    nonce: String,
    first_bare: String,
    /// Set by `client_final`, consumed by `verify_server_final`.
    server_key: Option<[u8; KEY_LEN]>,
    auth_message: Option<String>,
}

impl ScramClient {
    pub fn new(password: &str) -> Self {
        let mut raw = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut raw);
        Self::with_nonce(password, BASE64.encode(raw))
    }

    fn with_nonce(password: &str, nonce: String) -> Self {
        let first_bare = format!("n=,r={nonce}");
        Self {
            password: password.into(),
            nonce,
            first_bare,
            server_key: None,
            auth_message: None,
        }
    }

    /// The client-first message: gs2 header plus the bare message.
    pub fn client_first(&self) -> String {
        format!("n,,{}", self.first_bare)
    }

    /// Process the server-first message and produce the client-final
    /// message carrying the proof.
    pub fn client_final(&mut self, server_first: &str) -> Result<String, SaslError> {
        let ServerFirst { nonce, salt, iterations } = parse_server_first(server_first)?;

        if !nonce.starts_with(&self.nonce) {
            return Err(SaslError::new("server nonce does not extend client nonce"));
        }

        let salted_password =
            pbkdf2_hmac_array::<Sha256, KEY_LEN>(self.password.as_bytes(), &salt, iterations);

        let client_key = hmac(&salted_password, b"Client Key");
        let stored_key: [u8; KEY_LEN] = Sha256::digest(client_key).into();

        // "biws" is base64("n,,"), the gs2 header echoed back
        let without_proof = format!("c=biws,r={nonce}");
        let auth_message = format!("{},{server_first},{without_proof}", self.first_bare);

        let client_signature = hmac(&stored_key, auth_message.as_bytes());
        let mut proof = client_key;
        for (p, s) in proof.iter_mut().zip(client_signature) {
            *p ^= s;
        }

        self.server_key = Some(hmac(&salted_password, b"Server Key"));
        self.auth_message = Some(auth_message);

        Ok(format!("{without_proof},p={}", BASE64.encode(proof)))
    }

    /// Check the server signature in the server-final message against
    /// the salted password, proving the server knew it too.
    pub fn verify_server_final(&self, server_final: &str) -> Result<(), SaslError> {
        if let Some(err) = server_final.strip_prefix("e=") {
            return Err(SaslError::new(format!("server rejected authentication: {err}")));
        }
        let Some(signature) = server_final.strip_prefix("v=") else {
            return Err(SaslError::new("server-final message carries no signature"));
        };
        let signature = BASE64
            .decode(signature.trim_end())
            .map_err(|_| SaslError::new("server signature is not valid base64"))?;

        let (Some(server_key), Some(auth_message)) = (&self.server_key, &self.auth_message)
        else {
            return Err(SaslError::new("server-final received before client-final"));
        };

        if hmac(server_key, auth_message.as_bytes())[..] != signature[..] {
            return Err(SaslError::new("server signature mismatch"));
        }
        Ok(())
    }
}

struct ServerFirst<'a> {
    nonce: &'a str,
    salt: Vec<u8>,
    iterations: u32,
}

/// Parse the comma separated `k=v` attributes: `r` combined nonce,
/// `s` base64 salt, `i` iteration count.
fn parse_server_first(message: &str) -> Result<ServerFirst<'_>, SaslError> {
    let mut nonce = None;
    let mut salt = None;
    let mut iterations = None;

    for attr in message.split(',') {
        if let Some(value) = attr.strip_prefix("r=") {
            nonce = Some(value);
        } else if let Some(value) = attr.strip_prefix("s=") {
            salt = Some(
                BASE64
                    .decode(value)
                    .map_err(|_| SaslError::new("salt is not valid base64"))?,
            );
        } else if let Some(value) = attr.strip_prefix("i=") {
            iterations = Some(
                value
                    .parse::<u32>()
                    .map_err(|_| SaslError::new("iteration count is not an integer"))?,
            );
        }
    }

    let nonce = nonce.ok_or_else(|| SaslError::new("server-first message carries no nonce"))?;
    let salt = salt.ok_or_else(|| SaslError::new("server-first message carries no salt"))?;
    let iterations =
        iterations.ok_or_else(|| SaslError::new("server-first message carries no iteration count"))?;
    if iterations == 0 {
        return Err(SaslError::new("iteration count must be positive"));
    }

    Ok(ServerFirst { nonce, salt, iterations })
}

fn hmac(key: &[u8], data: &[u8]) -> [u8; KEY_LEN] {
    let mut mac = HmacSha256::new_from_slice(key).expect("hmac accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().into()
}

/// An error during the SCRAM exchange.
pub struct SaslError {
    reason: Cow<'static, str>,
}

impl SaslError {
    fn new(reason: impl Into<Cow<'static, str>>) -> Self {
        Self { reason: reason.into() }
    }

    /// The server offered no mechanism this crate speaks.
    pub(crate) fn mechanism_unavailable() -> Self {
        Self::new("server offers no SCRAM-SHA-256 mechanism")
    }
}

impl std::error::Error for SaslError { }

impl fmt::Display for SaslError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SCRAM exchange failed: {}", self.reason)
    }
}

impl fmt::Debug for SaslError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{self}\"")
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn client_first_shape() {
        let scram = ScramClient::new("secret");
        let first = scram.client_first();
        let bare = first.strip_prefix("n,,n=,r=").unwrap();
        // 18 random bytes base64 encode to 24 chars
        assert_eq!(bare.len(), 24);
        assert!(BASE64.decode(bare).is_ok());
    }

    #[test]
    fn rejects_foreign_nonce() {
        let mut scram = ScramClient::with_nonce("secret", "abcdef".into());
        let err = scram.client_final("r=zzzzzz123,s=QSBzYWx0,i=4096");
        assert!(err.is_err());
    }

    #[test]
    fn rejects_bad_server_first() {
        let mut scram = ScramClient::with_nonce("secret", "abcdef".into());
        assert!(scram.client_final("s=QSBzYWx0,i=4096").is_err());
        assert!(scram.client_final("r=abcdefgh,i=4096").is_err());
        assert!(scram.client_final("r=abcdefgh,s=QSBzYWx0").is_err());
        assert!(scram.client_final("r=abcdefgh,s=QSBzYWx0,i=zero").is_err());
        assert!(scram.client_final("r=abcdefgh,s=QSBzYWx0,i=0").is_err());
    }

    /// Drive a full exchange with the server side computed
    /// independently from the same password.
    #[test]
    fn full_exchange_round_trip() {
        let password = "pencil";
        let salt = b"sodium chloride";
        let iterations = 4096;

        let mut scram = ScramClient::with_nonce(password, "clientnonce".into());
        let client_first = scram.client_first();
        let client_bare = client_first.strip_prefix("n,,").unwrap().to_string();

        let server_first =
            format!("r=clientnonceservernonce,s={},i={iterations}", BASE64.encode(salt));
        let client_final = scram.client_final(&server_first).unwrap();

        // server side: recompute the proof from the salted password
        let salted = pbkdf2_hmac_array::<Sha256, 32>(password.as_bytes(), salt, iterations);
        let client_key = hmac(&salted, b"Client Key");
        let stored_key: [u8; 32] = Sha256::digest(client_key).into();
        let without_proof = "c=biws,r=clientnonceservernonce";
        let auth_message = format!("{client_bare},{server_first},{without_proof}");
        let signature = hmac(&stored_key, auth_message.as_bytes());

        let proof = client_final.strip_prefix("c=biws,r=clientnonceservernonce,p=").unwrap();
        let proof = BASE64.decode(proof).unwrap();
        let recovered_key: Vec<u8> =
            proof.iter().zip(signature).map(|(p, s)| p ^ s).collect();
        assert_eq!(recovered_key, client_key, "proof must xor back to the client key");

        // server-final accepted, tampered signature rejected
        let server_key = hmac(&salted, b"Server Key");
        let server_signature = hmac(&server_key, auth_message.as_bytes());
        scram
            .verify_server_final(&format!("v={}", BASE64.encode(server_signature)))
            .unwrap();
        assert!(scram.verify_server_final("v=AAAA").is_err());
        assert!(scram.verify_server_final("e=other-error").is_err());
    }
}
