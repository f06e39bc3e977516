//! SCRAM-SHA-256 client primitives (RFC 5802 / RFC 7677).
//!
//! Pure functions over byte slices; the handshake sequencer owns all I/O.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

type HmacSha256 = Hmac<Sha256>;

/// Raw entropy per nonce; encodes to 24 base64 characters.
const NONCE_LEN: usize = 18;

/// Generate a fresh client nonce.
pub fn generate_nonce() -> String {
    let mut bytes = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut bytes);
    BASE64.encode(bytes)
}

/// Attributes extracted from the server-first message.
///
/// Format: `r=<nonce>,s=<base64 salt>,i=<iterations>`, optionally preceded
/// by an `m=` extension attribute (rejected, per RFC 5802 mandatory-extension
/// semantics).
#[derive(Debug, Clone)]
pub struct ServerFirst {
    /// Combined client+server nonce.
    pub nonce: String,
    pub salt: Vec<u8>,
    pub iterations: u32,
}

impl ServerFirst {
    pub fn parse(server_first: &str) -> Result<Self> {
        let mut nonce = None;
        let mut salt = None;
        let mut iterations = None;

        for attr in server_first.split(',') {
            let (key, value) = attr
                .split_once('=')
                .ok_or_else(|| malformed(server_first))?;
            match key {
                "m" => {
                    return Err(Error::AuthFailed(format!(
                        "unsupported mandatory SCRAM extension: {}",
                        value
                    )));
                }
                "r" => nonce = Some(value.to_string()),
                "s" => {
                    salt = Some(
                        BASE64
                            .decode(value)
                            .map_err(|_| malformed(server_first))?,
                    );
                }
                "i" => {
                    iterations = Some(
                        value
                            .parse::<u32>()
                            .map_err(|_| malformed(server_first))?,
                    );
                }
                _ => {} // later extensions are ignored
            }
        }

        match (nonce, salt, iterations) {
            (Some(nonce), Some(salt), Some(iterations)) => Ok(Self {
                nonce,
                salt,
                iterations,
            }),
            _ => Err(malformed(server_first)),
        }
    }
}

fn malformed(server_first: &str) -> Error {
    Error::AuthFailed(format!("malformed server-first message: {}", server_first))
}

/// Client proof plus the server signature expected in the server-final message.
#[derive(Debug, Clone)]
pub struct ClientProof {
    pub proof: [u8; 32],
    pub server_signature: [u8; 32],
}

/// Compute the client proof for the final handshake message.
///
/// Formula (RFC 5802 §3, instantiated with SHA-256):
/// ```text
/// SaltedPassword  := Hi(password, salt, i)
/// ClientKey       := HMAC(SaltedPassword, "Client Key")
/// StoredKey       := H(ClientKey)
/// AuthMessage     := client-first-bare , server-first , client-final-without-proof
/// ClientSignature := HMAC(StoredKey, AuthMessage)
/// ClientProof     := ClientKey XOR ClientSignature
/// ServerSignature := HMAC(HMAC(SaltedPassword, "Server Key"), AuthMessage)
/// ```
pub fn generate_client_proof(
    client_first_bare: &str,
    server_first: &str,
    client_final_without_proof: &str,
    password: &str,
    salt: &[u8],
    iterations: u32,
) -> ClientProof {
    let salted = salted_password(password, salt, iterations);

    let client_key = hmac_sha256(&salted, b"Client Key");
    let stored_key: [u8; 32] = Sha256::digest(client_key).into();

    let auth_message = format!(
        "{},{},{}",
        client_first_bare, server_first, client_final_without_proof
    );

    let client_signature = hmac_sha256(&stored_key, auth_message.as_bytes());

    let mut proof = [0u8; 32];
    for i in 0..32 {
        proof[i] = client_key[i] ^ client_signature[i];
    }

    let server_key = hmac_sha256(&salted, b"Server Key");
    let server_signature = hmac_sha256(&server_key, auth_message.as_bytes());

    ClientProof {
        proof,
        server_signature,
    }
}

/// `Hi(password, salt, i)` is PBKDF2-HMAC-SHA-256 with a 32-byte output.
pub fn salted_password(password: &str, salt: &[u8], iterations: u32) -> [u8; 32] {
    let mut out = [0u8; 32];
    pbkdf2::pbkdf2_hmac::<Sha256>(password.as_bytes(), salt, iterations, &mut out);
    out
}

/// Check the `v=` attribute of the server-final message against the signature
/// computed alongside the client proof. An `e=` attribute is a server-reported
/// authentication error.
pub fn verify_server_final(server_final: &str, expected_signature: &[u8; 32]) -> Result<()> {
    if let Some(err) = server_final.strip_prefix("e=") {
        return Err(Error::AuthFailed(err.to_string()));
    }
    let encoded = server_final.strip_prefix("v=").ok_or_else(|| {
        Error::AuthFailed(format!("malformed server-final message: {}", server_final))
    })?;
    let signature = BASE64
        .decode(encoded)
        .map_err(|_| Error::AuthFailed("undecodable server signature".to_string()))?;
    if signature != expected_signature {
        return Err(Error::AuthFailed(
            "server signature mismatch".to_string(),
        ));
    }
    Ok(())
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> [u8; 32] {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC can take key of any size");
    mac.update(data);
    mac.finalize().into_bytes().into()
}
