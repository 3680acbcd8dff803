//! Database access layer.
//!
//! This module provides:
//! - Connection pool management and readiness probing
//! - Named placeholder compilation, `IN` expansion and query rendering
//! - Mutation and query execution with generic row decoding
//! - SQLSTATE classification of driver errors

pub mod classify;
pub mod executor;
#[macro_use]
pub mod macros;
pub mod named;
pub mod params;
pub mod pool;

pub use classify::{EXEC_CODES, QUERY_CODES, sql_state};
pub use executor::{
    exec, named_exec, named_query_slice, named_query_slice_using_in, named_query_struct,
    named_query_struct_using_in, query_row, query_rows, query_slice, query_struct,
};
pub use named::{Binding, BoundQuery, NamedQuery, render};
pub use params::{NamedArgs, NoParams, Param, Params};
pub use pool::{Database, STATUS_CHECK_TIMEOUT, status_check};
