use thiserror::Error;

pub use color_eyre::eyre::eyre;

use serde_json::Value;

use crate::constant::{ErrorType, ResponseType};

pub type Result<T> = core::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("connection closed")]
    Closed,

    /// The server rejected a handshake step; carries the server's error JSON.
    #[error("handshake rejected: {0}")]
    Handshake(Value),

    #[error("authentication failed: {0}")]
    AuthFailed(String),

    /// The per-request deadline expired before a response arrived.
    #[error("request timed out")]
    Timeout,

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("bad config error: {0}")]
    BadConfigError(String),

    /// The server answered the query with an error response.
    #[error("{0}")]
    ServerError(#[from] ServerError),

    #[error("a bug in zero-reql: {0}")]
    LibraryBug(color_eyre::Report),
}

/// A query error reported by the server: the symbolic response kind plus the
/// first element of `r`, the runtime subtype, and the backtrace if present.
#[derive(Debug, Clone, Error)]
#[error("{}: {}", kind_name(self.kind), self.message)]
pub struct ServerError {
    pub kind: ResponseType,
    pub error_type: Option<ErrorType>,
    pub message: String,
    /// First element of the response's `r` array, verbatim.
    pub payload: Value,
    pub backtrace: Option<Value>,
}

fn kind_name(kind: ResponseType) -> &'static str {
    match kind {
        ResponseType::ClientError => "client error",
        ResponseType::CompileError => "compile error",
        _ => "runtime error",
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Protocol(format!("JSON codec: {}", err))
    }
}

impl From<core::convert::Infallible> for Error {
    fn from(err: core::convert::Infallible) -> Self {
        match err {}
    }
}

impl Error {
    pub fn from_debug(err: impl std::fmt::Debug) -> Self {
        Self::LibraryBug(color_eyre::eyre::eyre!(format!("{:#?}", err)))
    }
}
