use serde::Deserialize;
use serde_json::Value;

use crate::constant::{ErrorType, ResponseType};
use crate::error::{Error, Result, ServerError};

/// A single response document.
///
/// `t` is the response type code and `r` the result array; error responses
/// additionally carry `e` (runtime-error subtype) and `b` (backtrace), and
/// profiled queries carry `p`.
#[derive(Debug, Clone, Deserialize)]
pub struct Response {
    pub t: u64,
    #[serde(default)]
    pub r: Vec<Value>,
    #[serde(default)]
    pub e: Option<u64>,
    #[serde(default)]
    pub b: Option<Value>,
    #[serde(default)]
    pub p: Option<Value>,
}

impl Response {
    pub fn parse(payload: &[u8]) -> Result<Self> {
        serde_json::from_slice(payload)
            .map_err(|e| Error::Protocol(format!("undecodable response: {}", e)))
    }

    /// Map the `t` code to its symbolic type.
    pub fn kind(&self) -> Result<ResponseType> {
        ResponseType::from_code(self.t)
            .ok_or_else(|| Error::Protocol(format!("unknown response type code {}", self.t)))
    }

    /// Take the single value of an atom-shaped response.
    pub fn into_atom(self) -> Result<Value> {
        self.r
            .into_iter()
            .next()
            .ok_or_else(|| Error::Protocol("atom response with empty r".to_string()))
    }

    /// Convert an error-typed response into the caller-facing server error.
    pub fn into_server_error(self, kind: ResponseType) -> ServerError {
        let payload = self.r.into_iter().next().unwrap_or(Value::Null);
        let message = match &payload {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        ServerError {
            kind,
            error_type: self.e.and_then(ErrorType::from_code),
            message,
            payload,
            backtrace: self.b,
        }
    }
}
