//! The V1_0 connection handshake.
//!
//! A fixed four-step dialogue framed differently from the query protocol:
//! after the 4-byte magic, each direction exchanges JSON documents terminated
//! by a single NUL byte. The whole dialogue shares one deadline.
//!
//! The sequencer is a straight-line function: any failing step returns an
//! error and the caller closes the stream. No query-protocol state is touched
//! before the handshake completes.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde_json::{Value, json};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::{Instant, timeout_at};

use crate::constant::{
    AUTH_ERROR_CODES, AUTHENTICATION_METHOD, HANDSHAKE_MAGIC, SUB_PROTOCOL_VERSION,
};
use crate::error::{Error, Result};
use crate::scram;

/// Drive the handshake dialogue to completion.
///
/// Steps:
/// 1. Send the magic bytes; the server answers with its version document.
/// 2. Send the SCRAM client-first message:
///
/// ```json
/// {
///   "protocol_version": 0,
///   "authentication_method": "SCRAM-SHA-256",
///   "authentication": "n,,n=admin,r=rOprNGfwEbeRWgbNEkqO"
/// }
/// ```
///
/// 3. Answer the server-first challenge with the client proof:
///
/// ```json
/// { "authentication": "c=biws,r=<combined nonce>,p=<proof>" }
/// ```
///
/// 4. Verify the server signature in the server-final message.
pub async fn handshake<S>(stream: &mut S, user: &str, password: &str, deadline: Instant) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    bounded(deadline, stream.write_all(&HANDSHAKE_MAGIC)).await?;
    expect_success(read_document(stream, deadline).await?)?;

    let nonce = scram::generate_nonce();
    let client_first_bare = format!("n={},r={}", user, nonce);
    let client_first = format!("n,,{}", client_first_bare);
    send_document(
        stream,
        &json!({
            "protocol_version": SUB_PROTOCOL_VERSION,
            "authentication_method": AUTHENTICATION_METHOD,
            "authentication": client_first,
        }),
        deadline,
    )
    .await?;

    let reply = expect_success(read_document(stream, deadline).await?)?;
    let server_first = authentication(&reply)?.to_string();

    let attrs = scram::ServerFirst::parse(&server_first)?;
    if !attrs.nonce.starts_with(&nonce) {
        return Err(Error::AuthFailed(
            "server nonce does not extend the client nonce".to_string(),
        ));
    }

    let client_final_without_proof = format!("c=biws,r={}", attrs.nonce);
    let keys = scram::generate_client_proof(
        &client_first_bare,
        &server_first,
        &client_final_without_proof,
        password,
        &attrs.salt,
        attrs.iterations,
    );
    let client_final = format!(
        "{},p={}",
        client_final_without_proof,
        BASE64.encode(keys.proof)
    );
    send_document(stream, &json!({ "authentication": client_final }), deadline).await?;

    let reply = expect_success(read_document(stream, deadline).await?)?;
    scram::verify_server_final(authentication(&reply)?, &keys.server_signature)
}

/// Require `success == true`; otherwise classify the server's error JSON.
fn expect_success(reply: Value) -> Result<Value> {
    if reply.get("success").and_then(Value::as_bool) == Some(true) {
        return Ok(reply);
    }

    // Error codes in the auth range mean the credentials were rejected.
    if let Some(code) = reply.get("error_code").and_then(Value::as_i64) {
        if AUTH_ERROR_CODES.contains(&code) {
            let message = reply
                .get("error")
                .and_then(Value::as_str)
                .unwrap_or("authentication rejected")
                .to_string();
            return Err(Error::AuthFailed(message));
        }
    }
    Err(Error::Handshake(reply))
}

fn authentication(reply: &Value) -> Result<&str> {
    reply
        .get("authentication")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::Protocol("handshake reply lacks an authentication field".to_string()))
}

/// Write one JSON document followed by the NUL terminator.
async fn send_document<S>(stream: &mut S, document: &Value, deadline: Instant) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    let mut out = serde_json::to_vec(document)?;
    out.push(0);
    bounded(deadline, stream.write_all(&out)).await?;
    bounded(deadline, stream.flush()).await?;
    Ok(())
}

/// Accumulate bytes until the NUL terminator and decode the single document
/// before it. Anything after the terminator other than trailing NULs means
/// the server sent multiple documents in one exchange, which is rejected.
async fn read_document<S>(stream: &mut S, deadline: Instant) -> Result<Value>
where
    S: AsyncRead + Unpin,
{
    let mut buf = Vec::new();
    let mut chunk = [0u8; 512];
    loop {
        let n = bounded(deadline, stream.read(&mut chunk)).await?;
        if n == 0 {
            return Err(Error::Closed);
        }
        buf.extend_from_slice(&chunk[..n]);

        if let Some(pos) = buf.iter().position(|&b| b == 0) {
            if !buf[pos + 1..].iter().all(|&b| b == 0) {
                return Err(Error::Protocol(
                    "multiple documents in one handshake exchange".to_string(),
                ));
            }
            return match serde_json::from_slice(&buf[..pos]) {
                Ok(value) => Ok(value),
                // Pre-handshake servers reject the magic with a bare text
                // message instead of JSON; surface it as-is.
                Err(_) => Err(Error::Handshake(Value::String(
                    String::from_utf8_lossy(&buf[..pos]).into_owned(),
                ))),
            };
        }
    }
}

async fn bounded<T>(
    deadline: Instant,
    fut: impl Future<Output = std::io::Result<T>>,
) -> Result<T> {
    match timeout_at(deadline, fut).await {
        Ok(res) => Ok(res?),
        Err(_) => Err(Error::Timeout),
    }
}
