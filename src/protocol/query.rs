//! Outbound query payload builders.
//!
//! A query is a JSON array `[<query type>, <term tree>, <global opts>]`;
//! continuations and the other tokenless commands are fixed one-element
//! arrays reusing the original token.

use serde_json::Value;

use crate::constant::{QueryType, TermType};
use crate::error::Result;

/// Wire payload for a START query.
pub fn wire_start(query: &Value, opts: &Value) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(&(QueryType::Start as u8, query, opts))?)
}

/// Wire payload requesting the next batch of a partial result.
pub fn wire_continue() -> &'static [u8] {
    b"[2]"
}

/// Wire payload releasing a cursor early.
pub fn wire_stop() -> &'static [u8] {
    b"[3]"
}

pub fn wire_noreply_wait() -> &'static [u8] {
    b"[4]"
}

pub fn wire_server_info() -> &'static [u8] {
    b"[5]"
}

/// Wrapper template for splicing a pre-encoded JSON document into an insert
/// query without re-parsing it.
///
/// `prefix ‖ raw ‖ suffix` forms
/// `[START,[INSERT,[[TABLE,[[DB,["<db>"]],"<table>"]],<raw>]],<opts>]`;
/// the frame length is the sum of the three pieces.
pub fn insert_splice(db: &str, table: &str, opts: &Value) -> Result<(Vec<u8>, Vec<u8>)> {
    let db_json = serde_json::to_string(db)?;
    let table_json = serde_json::to_string(table)?;

    let prefix = format!(
        "[{},[{},[[{},[[{},[{}]],{}]],",
        QueryType::Start as u8,
        TermType::Insert as u8,
        TermType::Table as u8,
        TermType::Db as u8,
        db_json,
        table_json,
    )
    .into_bytes();

    let mut suffix = b"]],".to_vec();
    suffix.extend_from_slice(&serde_json::to_vec(opts)?);
    suffix.push(b']');

    Ok((prefix, suffix))
}
