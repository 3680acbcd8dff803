//! Driver error classification.
//!
//! SQLSTATE codes are extracted once, by [`sql_state`], and looked up in the
//! static tables below. Nothing else in the crate inspects raw driver codes.

use crate::error::{DbError, ErrorKind};
use std::borrow::Cow;

pub const UNIQUE_VIOLATION: &str = "23505";
pub const UNDEFINED_TABLE: &str = "42P01";

/// Codes recognized for mutations.
pub const EXEC_CODES: &[(&str, ErrorKind)] = &[
    (UNIQUE_VIOLATION, ErrorKind::DuplicateEntry),
    (UNDEFINED_TABLE, ErrorKind::UndefinedTable),
];

/// Codes recognized for reads.
pub const QUERY_CODES: &[(&str, ErrorKind)] = &[(UNDEFINED_TABLE, ErrorKind::UndefinedTable)];

/// Extract the SQLSTATE code from a driver error, if the server reported one.
pub fn sql_state(err: &sqlx::Error) -> Option<Cow<'_, str>> {
    err.as_database_error().and_then(|db_err| db_err.code())
}

/// Look up a code in a classification table.
pub fn lookup(code: Option<&str>, table: &[(&str, ErrorKind)]) -> Option<ErrorKind> {
    let code = code?;
    table
        .iter()
        .find(|(known, _)| *known == code)
        .map(|(_, kind)| *kind)
}

/// Classify a driver error against `table`, wrapping it unclassified when the
/// code is not listed.
pub fn classify(operation: &'static str, err: sqlx::Error, table: &[(&str, ErrorKind)]) -> DbError {
    let kind = lookup(sql_state(&err).as_deref(), table);
    match kind {
        Some(ErrorKind::DuplicateEntry) => DbError::DuplicateEntry { source: err },
        Some(ErrorKind::UndefinedTable) => DbError::UndefinedTable { source: err },
        _ => DbError::database(operation, err),
    }
}
