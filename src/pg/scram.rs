//! SCRAM-SHA-256 authentication exchange.
//!
//! Implements RFC 5802 (SCRAM) and RFC 7677 (SCRAM-SHA-256) without channel
//! binding. The exchange is a three-step value machine so the handshake poller
//! can advance it one server message at a time.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use hmac::{Hmac, Mac};
use rand::Rng;
use sha2::{Digest, Sha256};

type HmacSha256 = Hmac<Sha256>;

/// Mechanism name advertised by the server.
pub const MECHANISM: &str = "SCRAM-SHA-256";

/// GS2 header for "no channel binding, no authzid", base64 of `n,,`.
const GS2_HEADER_B64: &str = "biws";

enum Step {
    /// client-first sent, waiting for server-first
    AwaitingServerFirst,
    /// client-final sent, waiting for the server signature
    AwaitingServerFinal {
        salted_password: [u8; 32],
        auth_message: String,
    },
    Done,
}

/// Client side of one SCRAM-SHA-256 exchange.
pub struct ScramExchange {
    password: String,
    client_first_bare: String,
    client_nonce: String,
    step: Step,
}

impl ScramExchange {
    /// Start an exchange; returns the exchange and the client-first-message.
    pub fn start(password: &str) -> (Self, Vec<u8>) {
        let mut rng = rand::thread_rng();
        let nonce_bytes: [u8; 18] = rng.gen();
        Self::with_nonce(password, BASE64.encode(nonce_bytes))
    }

    fn with_nonce(password: &str, client_nonce: String) -> (Self, Vec<u8>) {
        // The server takes the user from the startup packet, so n= stays empty.
        let client_first_bare = format!("n=,r={}", client_nonce);
        let first = format!("n,,{}", client_first_bare).into_bytes();
        let exchange = Self {
            password: password.to_string(),
            client_first_bare,
            client_nonce,
            step: Step::AwaitingServerFirst,
        };
        (exchange, first)
    }

    /// Consume server-first-message (`r=<nonce>,s=<salt>,i=<iterations>`) and
    /// produce client-final-message.
    pub fn server_first(&mut self, server_msg: &[u8]) -> Result<Vec<u8>, ScramError> {
        if !matches!(self.step, Step::AwaitingServerFirst) {
            return Err(ScramError::InvalidState);
        }
        let server_first =
            std::str::from_utf8(server_msg).map_err(|_| ScramError::InvalidServerMessage)?;

        let mut nonce = None;
        let mut salt = None;
        let mut iterations = None;
        for part in server_first.split(',') {
            if let Some(value) = part.strip_prefix("r=") {
                nonce = Some(value);
            } else if let Some(value) = part.strip_prefix("s=") {
                salt = Some(BASE64.decode(value).map_err(|_| ScramError::InvalidSalt)?);
            } else if let Some(value) = part.strip_prefix("i=") {
                iterations = Some(
                    value
                        .parse::<u32>()
                        .map_err(|_| ScramError::InvalidIterations)?,
                );
            }
        }

        let combined_nonce = nonce.ok_or(ScramError::MissingNonce)?;
        let salt = salt.ok_or(ScramError::MissingSalt)?;
        let iterations = iterations.ok_or(ScramError::MissingIterations)?;
        if iterations == 0 {
            return Err(ScramError::InvalidIterations);
        }
        if !combined_nonce.starts_with(&self.client_nonce) {
            return Err(ScramError::NonceVerificationFailed);
        }

        let salted_password = hi(&self.password, &salt, iterations);
        let client_key = hmac_sha256(&salted_password, b"Client Key");
        let stored_key = sha256(&client_key);

        let without_proof = format!("c={},r={}", GS2_HEADER_B64, combined_nonce);
        let auth_message = format!(
            "{},{},{}",
            self.client_first_bare, server_first, without_proof
        );

        let client_signature = hmac_sha256(&stored_key, auth_message.as_bytes());
        let mut proof = client_key;
        proof
            .iter_mut()
            .zip(client_signature.iter())
            .for_each(|(k, s)| *k ^= s);

        self.step = Step::AwaitingServerFinal {
            salted_password,
            auth_message,
        };
        Ok(format!("{},p={}", without_proof, BASE64.encode(proof)).into_bytes())
    }

    /// Verify server-final-message (`v=<signature>`).
    pub fn server_final(&mut self, server_msg: &[u8]) -> Result<(), ScramError> {
        let Step::AwaitingServerFinal {
            ref salted_password,
            ref auth_message,
        } = self.step
        else {
            return Err(ScramError::InvalidState);
        };

        let server_final =
            std::str::from_utf8(server_msg).map_err(|_| ScramError::InvalidServerMessage)?;
        if let Some(err) = server_final.strip_prefix("e=") {
            return Err(ScramError::ServerRejected(err.to_string()));
        }
        let signature = server_final
            .strip_prefix("v=")
            .and_then(|v| BASE64.decode(v.trim_end_matches(['\0', '\n'])).ok())
            .ok_or(ScramError::InvalidServerSignature)?;

        let server_key = hmac_sha256(salted_password, b"Server Key");
        let expected = hmac_sha256(&server_key, auth_message.as_bytes());
        if signature != expected {
            return Err(ScramError::ServerSignatureVerificationFailed);
        }

        self.step = Step::Done;
        Ok(())
    }

    pub fn is_done(&self) -> bool {
        matches!(self.step, Step::Done)
    }
}

/// SCRAM authentication errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScramError {
    InvalidServerMessage,
    InvalidSalt,
    InvalidIterations,
    MissingNonce,
    MissingSalt,
    MissingIterations,
    NonceVerificationFailed,
    InvalidServerSignature,
    ServerSignatureVerificationFailed,
    ServerRejected(String),
    InvalidState,
}

impl std::fmt::Display for ScramError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidServerMessage => write!(f, "Invalid server message"),
            Self::InvalidSalt => write!(f, "Invalid salt encoding"),
            Self::InvalidIterations => write!(f, "Invalid iteration count"),
            Self::MissingNonce => write!(f, "Missing nonce in server message"),
            Self::MissingSalt => write!(f, "Missing salt in server message"),
            Self::MissingIterations => write!(f, "Missing iterations in server message"),
            Self::NonceVerificationFailed => write!(f, "Server nonce verification failed"),
            Self::InvalidServerSignature => write!(f, "Invalid server signature"),
            Self::ServerSignatureVerificationFailed => {
                write!(f, "Server signature verification failed")
            }
            Self::ServerRejected(reason) => write!(f, "Server rejected SCRAM exchange: {}", reason),
            Self::InvalidState => write!(f, "Invalid SCRAM state"),
        }
    }
}

impl std::error::Error for ScramError {}

// ============================================================================
// Helper Functions
// ============================================================================

/// Hi() function - PBKDF2 with HMAC-SHA-256
fn hi(password: &str, salt: &[u8], iterations: u32) -> [u8; 32] {
    let mut output = [0u8; 32];
    pbkdf2::pbkdf2::<HmacSha256>(password.as_bytes(), salt, iterations, &mut output)
        .expect("valid output length");
    output
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> [u8; 32] {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC can take key of any size");
    mac.update(data);
    mac.finalize().into_bytes().into()
}

fn sha256(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

/// Compute the MD5 password response: `md5` + md5(md5(password + user) + salt).
pub fn md5_password(user: &str, password: &str, salt: &[u8; 4]) -> String {
    let inner = md5::compute(format!("{}{}", password, user).as_bytes());
    let mut outer_input = format!("{:x}", inner).into_bytes();
    outer_input.extend_from_slice(salt);
    format!("md5{:x}", md5::compute(&outer_input))
}
