//! Query execution engine.
//!
//! Mutations and reads share one pipeline:
//! - render the template for the log line and the span
//! - bind every named placeholder (fails before any network I/O)
//! - run the driver call raced against the caller's [`Context`]
//! - classify driver errors by SQLSTATE
//!
//! Every function accepts any sqlx Postgres executor: `&PgPool`,
//! `&mut PgConnection` or `&mut *tx` for a transaction.

use crate::context::Context;
use crate::db::classify::{EXEC_CODES, QUERY_CODES, classify};
use crate::db::named::{Binding, BoundQuery, NamedQuery, render};
use crate::db::params::{NamedArgs, NoParams, Param, PgQuery, bind_param};
use crate::error::{DbError, DbResult};
use futures_util::TryStreamExt;
use sqlx::postgres::PgRow;
use sqlx::{Executor, FromRow, Postgres};
use tracing::field::Empty;
use tracing::{Instrument, Span, debug, info, info_span};

/// Execute a statement without parameters.
pub async fn exec<'c, E>(ctx: &Context, executor: E, query: &str) -> DbResult<u64>
where
    E: Executor<'c, Database = Postgres>,
{
    named_exec(ctx, executor, query, &NoParams).await
}

/// Execute a statement with named parameters and return the rows affected.
///
/// Unique violations surface as `DuplicateEntry` and missing relations as
/// `UndefinedTable`.
pub async fn named_exec<'c, E, A>(
    ctx: &Context,
    executor: E,
    query: &str,
    args: &A,
) -> DbResult<u64>
where
    E: Executor<'c, Database = Postgres>,
    A: NamedArgs + ?Sized,
{
    let rendered = render(query, args);
    if args.is_empty() {
        debug!(query = %rendered, "database.named_exec");
    } else {
        info!(query = %rendered, "database.named_exec");
    }

    let span = info_span!("database.exec", query = %rendered, rows_affected = Empty);
    async move {
        let bound = bind(query, args, Binding::Plain)?;

        // Statements without arguments go through the simple protocol so
        // multi-statement scripts and DDL work.
        let result = if bound.args.is_empty() {
            ctx.run(executor.execute(bound.sql.as_str())).await?
        } else {
            ctx.run(build_query(&bound).execute(executor)).await?
        };

        let done = result.map_err(|e| classify("named_exec", e, EXEC_CODES))?;
        Span::current().record("rows_affected", done.rows_affected());
        Ok::<_, DbError>(done.rows_affected())
    }
    .instrument(span)
    .await
}

/// Run a query and decode every row into `T`.
///
/// Zero rows is an empty `Vec`, not an error.
pub async fn query_rows<'c, T, E, A>(
    ctx: &Context,
    executor: E,
    query: &str,
    args: &A,
    binding: Binding,
) -> DbResult<Vec<T>>
where
    T: for<'r> FromRow<'r, PgRow>,
    E: Executor<'c, Database = Postgres>,
    A: NamedArgs + ?Sized,
{
    let rendered = render(query, args);
    info!(query = %rendered, ?binding, "database.query_rows");

    let span = info_span!("database.query_rows", query = %rendered, rows = Empty);
    async move {
        let bound = bind(query, args, binding)?;
        let query = build_query(&bound);

        ctx.run(async move {
            let mut rows = query.fetch(executor);
            let mut out = Vec::new();
            while let Some(row) = rows
                .try_next()
                .await
                .map_err(|e| classify("query_rows", e, QUERY_CODES))?
            {
                out.push(T::from_row(&row).map_err(DbError::decode::<T>)?);
            }
            Span::current().record("rows", out.len());
            Ok::<_, DbError>(out)
        })
        .await?
    }
    .instrument(span)
    .await
}

/// Run a query and decode its first row into `T`.
///
/// Zero rows is `NotFound`. The stream is dropped after the first row, so
/// any further rows are never fetched.
pub async fn query_row<'c, T, E, A>(
    ctx: &Context,
    executor: E,
    query: &str,
    args: &A,
    binding: Binding,
) -> DbResult<T>
where
    T: for<'r> FromRow<'r, PgRow>,
    E: Executor<'c, Database = Postgres>,
    A: NamedArgs + ?Sized,
{
    let rendered = render(query, args);
    info!(query = %rendered, ?binding, "database.query_row");

    let span = info_span!("database.query_row", query = %rendered);
    async move {
        let bound = bind(query, args, binding)?;
        let query = build_query(&bound);

        ctx.run(async move {
            let mut rows = query.fetch(executor);
            let row = rows
                .try_next()
                .await
                .map_err(|e| classify("query_row", e, QUERY_CODES))?
                .ok_or(DbError::NotFound)?;
            let value = T::from_row(&row).map_err(DbError::decode::<T>)?;
            Ok::<_, DbError>(value)
        })
        .await?
    }
    .instrument(span)
    .await
}

/// [`query_rows`] without parameters.
pub async fn query_slice<'c, T, E>(ctx: &Context, executor: E, query: &str) -> DbResult<Vec<T>>
where
    T: for<'r> FromRow<'r, PgRow>,
    E: Executor<'c, Database = Postgres>,
{
    query_rows(ctx, executor, query, &NoParams, Binding::Plain).await
}

pub async fn named_query_slice<'c, T, E, A>(
    ctx: &Context,
    executor: E,
    query: &str,
    args: &A,
) -> DbResult<Vec<T>>
where
    T: for<'r> FromRow<'r, PgRow>,
    E: Executor<'c, Database = Postgres>,
    A: NamedArgs + ?Sized,
{
    query_rows(ctx, executor, query, args, Binding::Plain).await
}

/// [`query_rows`] with list-valued parameters expanded. Use when the query has
/// an `IN (...)` clause.
pub async fn named_query_slice_using_in<'c, T, E, A>(
    ctx: &Context,
    executor: E,
    query: &str,
    args: &A,
) -> DbResult<Vec<T>>
where
    T: for<'r> FromRow<'r, PgRow>,
    E: Executor<'c, Database = Postgres>,
    A: NamedArgs + ?Sized,
{
    query_rows(ctx, executor, query, args, Binding::InExpansion).await
}

/// [`query_row`] without parameters.
pub async fn query_struct<'c, T, E>(ctx: &Context, executor: E, query: &str) -> DbResult<T>
where
    T: for<'r> FromRow<'r, PgRow>,
    E: Executor<'c, Database = Postgres>,
{
    query_row(ctx, executor, query, &NoParams, Binding::Plain).await
}

pub async fn named_query_struct<'c, T, E, A>(
    ctx: &Context,
    executor: E,
    query: &str,
    args: &A,
) -> DbResult<T>
where
    T: for<'r> FromRow<'r, PgRow>,
    E: Executor<'c, Database = Postgres>,
    A: NamedArgs + ?Sized,
{
    query_row(ctx, executor, query, args, Binding::Plain).await
}

pub async fn named_query_struct_using_in<'c, T, E, A>(
    ctx: &Context,
    executor: E,
    query: &str,
    args: &A,
) -> DbResult<T>
where
    T: for<'r> FromRow<'r, PgRow>,
    E: Executor<'c, Database = Postgres>,
    A: NamedArgs + ?Sized,
{
    query_row(ctx, executor, query, args, Binding::InExpansion).await
}

fn bind<A: NamedArgs + ?Sized>(query: &str, args: &A, binding: Binding) -> DbResult<BoundQuery> {
    NamedQuery::compile(query).bind(args, binding)
}

fn build_query(bound: &BoundQuery) -> PgQuery<'_> {
    bound
        .args
        .iter()
        .fold(sqlx::query(&bound.sql), |query, param: &Param| {
            bind_param(query, param)
        })
}
