pub mod constant;
pub mod error;
mod opts;
pub mod protocol;
pub mod scram;
pub mod tokio;

pub use error::{Error, Result};
pub use opts::{Deadline, Opts, RunOptions, TcpOpts};

pub use crate::tokio::{Conn, Cursor, CursorEvent, RunResult};

#[cfg(test)]
mod opts_test;
