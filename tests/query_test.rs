//! Integration tests for execution and queries against PostgreSQL.
//!
//! These tests require a running PostgreSQL database.
//! Set TEST_PG_HOST (and optionally TEST_PG_USER, TEST_PG_PASSWORD, TEST_PG_NAME) to run them.
//! Example: TEST_PG_HOST="localhost:5432" TEST_PG_PASSWORD="postgres"

use dbsql::db::{
    Binding, Database, exec, named_exec, named_query_slice, named_query_slice_using_in,
    named_query_struct, query_row, query_rows, query_slice, query_struct,
};
use dbsql::{ConnectionConfig, Context, DbError, ErrorKind, NoParams, Params, params};
use futures_util::future::join_all;
use rand::Rng;
use serde::Serialize;
use std::error::Error as _;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
struct User {
    id: i64,
    name: String,
}

fn pg_config() -> Option<ConnectionConfig> {
    let host = match std::env::var("TEST_PG_HOST") {
        Ok(host) => host,
        Err(_) => {
            eprintln!("Skipping test: TEST_PG_HOST not set");
            return None;
        }
    };
    let env = |key: &str, default: &str| std::env::var(key).unwrap_or_else(|_| default.into());
    let config = ConnectionConfig::new(
        env("TEST_PG_USER", "postgres"),
        env("TEST_PG_PASSWORD", "postgres"),
        host,
        env("TEST_PG_NAME", "postgres"),
    )
    .unwrap()
    .with_pool_sizes(2, 10)
    .with_disable_tls(true);
    Some(config)
}

/// Create a uniquely named table with `count` users (ids 1..=count).
async fn setup(db: &Database, count: i64) -> String {
    let table = format!("dbsql_users_{}", rand::thread_rng().r#gen::<u32>());
    let ctx = Context::background();
    exec(
        &ctx,
        db.pool(),
        &format!("CREATE TABLE {table} (id BIGINT PRIMARY KEY, name TEXT NOT NULL)"),
    )
    .await
    .unwrap();

    for id in 1..=count {
        named_exec(
            &ctx,
            db.pool(),
            &format!("INSERT INTO {table} (id, name) VALUES (:id, :name)"),
            &params! { "id" => id, "name" => format!("user-{id}") },
        )
        .await
        .unwrap();
    }
    table
}

async fn teardown(db: Database, table: &str) {
    let _ = exec(
        &Context::background(),
        db.pool(),
        &format!("DROP TABLE IF EXISTS {table}"),
    )
    .await;
    db.close().await;
}

#[tokio::test]
async fn test_query_row_cardinality() {
    let Some(config) = pg_config() else { return };
    let db = Database::open(&config).unwrap();
    let table = setup(&db, 3).await;
    let ctx = Context::background();

    let user: User = named_query_struct(
        &ctx,
        db.pool(),
        &format!("SELECT id, name FROM {table} WHERE id = :id"),
        &params! { "id" => 2 },
    )
    .await
    .unwrap();
    assert_eq!(user, User { id: 2, name: "user-2".into() });

    let err = named_query_struct::<User, _, _>(
        &ctx,
        db.pool(),
        &format!("SELECT id, name FROM {table} WHERE id = :id"),
        &params! { "id" => 999 },
    )
    .await
    .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);

    // Several rows: the first one wins.
    let first: User = query_struct(
        &ctx,
        db.pool(),
        &format!("SELECT id, name FROM {table} ORDER BY id"),
    )
    .await
    .unwrap();
    assert_eq!(first.id, 1);

    teardown(db, &table).await;
}

#[tokio::test]
async fn test_query_rows_empty_and_many() {
    let Some(config) = pg_config() else { return };
    let db = Database::open(&config).unwrap();
    let table = setup(&db, 4).await;
    let ctx = Context::background();

    let none: Vec<User> = named_query_slice(
        &ctx,
        db.pool(),
        &format!("SELECT id, name FROM {table} WHERE name = :name"),
        &params! { "name" => "nobody" },
    )
    .await
    .unwrap();
    assert!(none.is_empty());

    let all: Vec<User> = query_slice(
        &ctx,
        db.pool(),
        &format!("SELECT id, name FROM {table} ORDER BY id"),
    )
    .await
    .unwrap();
    assert_eq!(all.len(), 4);
    assert_eq!(all.iter().map(|u| u.id).collect::<Vec<_>>(), vec![1, 2, 3, 4]);

    teardown(db, &table).await;
}

#[tokio::test]
async fn test_named_exec_duplicate_entry() {
    let Some(config) = pg_config() else { return };
    let db = Database::open(&config).unwrap();
    let table = setup(&db, 1).await;

    let err = named_exec(
        &Context::background(),
        db.pool(),
        &format!("INSERT INTO {table} (id, name) VALUES (:id, :name)"),
        &params! { "id" => 1, "name" => "again" },
    )
    .await
    .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::DuplicateEntry);
    assert_eq!(err.sql_state().as_deref(), Some("23505"));
    let source = err.source().expect("driver error kept as source");
    assert!(source.to_string().contains("duplicate key"));

    teardown(db, &table).await;
}

#[tokio::test]
async fn test_undefined_table() {
    let Some(config) = pg_config() else { return };
    let db = Database::open(&config).unwrap();
    let ctx = Context::background();

    let err = named_exec(
        &ctx,
        db.pool(),
        "UPDATE dbsql_missing_table SET name = :name",
        &params! { "name" => "x" },
    )
    .await
    .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::UndefinedTable);
    assert!(err.source().is_some());

    let err = query_slice::<User, _>(&ctx, db.pool(), "SELECT id, name FROM dbsql_missing_table")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::UndefinedTable);

    db.close().await;
}

#[tokio::test]
async fn test_other_errors_stay_unclassified() {
    let Some(config) = pg_config() else { return };
    let db = Database::open(&config).unwrap();

    let err = exec(&Context::background(), db.pool(), "SELEC 1")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Other);
    assert_eq!(err.sql_state().as_deref(), Some("42601"));

    db.close().await;
}

#[tokio::test]
async fn test_in_expansion() {
    let Some(config) = pg_config() else { return };
    let db = Database::open(&config).unwrap();
    let table = setup(&db, 10).await;
    let ctx = Context::background();
    let query = format!("SELECT id, name FROM {table} WHERE id IN (:ids) ORDER BY id");

    for k in [0i64, 1, 5] {
        let ids: Vec<i64> = (1..=k).map(|i| i * 2).collect();
        let users: Vec<User> =
            named_query_slice_using_in(&ctx, db.pool(), &query, &params! { "ids" => ids.clone() })
                .await
                .unwrap();
        assert_eq!(users.iter().map(|u| u.id).collect::<Vec<_>>(), ids, "k = {k}");
    }

    let err = query_row::<User, _, _>(
        &ctx,
        db.pool(),
        &query,
        &params! { "ids" => Vec::<i64>::new() },
        Binding::InExpansion,
    )
    .await
    .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);

    teardown(db, &table).await;
}

#[tokio::test]
async fn test_plain_list_binds_as_array() {
    let Some(config) = pg_config() else { return };
    let db = Database::open(&config).unwrap();
    let table = setup(&db, 5).await;

    let users: Vec<User> = query_rows(
        &Context::background(),
        db.pool(),
        &format!("SELECT id, name FROM {table} WHERE id = ANY(:ids) ORDER BY id"),
        &params! { "ids" => vec![1i64, 3, 5] },
        Binding::Plain,
    )
    .await
    .unwrap();
    assert_eq!(users.iter().map(|u| u.id).collect::<Vec<_>>(), vec![1, 3, 5]);

    teardown(db, &table).await;
}

#[tokio::test]
async fn test_serialized_record_and_json_params() {
    #[derive(Serialize)]
    struct NewUser<'a> {
        id: i64,
        name: &'a str,
    }

    let Some(config) = pg_config() else { return };
    let db = Database::open(&config).unwrap();
    let table = setup(&db, 0).await;
    let ctx = Context::background();
    let insert = format!("INSERT INTO {table} (id, name) VALUES (:id, :name)");

    let record = Params::from_serialize(&NewUser { id: 7, name: "ser" }).unwrap();
    let affected = named_exec(&ctx, db.pool(), &insert, &record).await.unwrap();
    assert_eq!(affected, 1);

    let json = serde_json::json!({ "id": 8, "name": "json" });
    named_exec(&ctx, db.pool(), &insert, &json).await.unwrap();

    let users: Vec<User> = query_slice(
        &ctx,
        db.pool(),
        &format!("SELECT id, name FROM {table} ORDER BY id"),
    )
    .await
    .unwrap();
    assert_eq!(users.len(), 2);
    assert_eq!(users[1].name, "json");

    teardown(db, &table).await;
}

#[tokio::test]
async fn test_decode_failure_is_not_retryable() {
    #[derive(Debug, sqlx::FromRow)]
    struct Wrong {
        #[allow(dead_code)]
        id: String,
    }

    let Some(config) = pg_config() else { return };
    let db = Database::open(&config).unwrap();

    let err = query_struct::<Wrong, _>(&Context::background(), db.pool(), "SELECT 1::bigint AS id")
        .await
        .unwrap_err();
    assert!(matches!(err, DbError::Decode { .. }));
    assert!(!err.is_retryable());

    db.close().await;
}

#[tokio::test]
async fn test_transaction_rollback() {
    let Some(config) = pg_config() else { return };
    let db = Database::open(&config).unwrap();
    let table = setup(&db, 1).await;
    let ctx = Context::background();

    let mut tx = db.begin(&ctx).await.unwrap();
    named_exec(
        &ctx,
        &mut *tx,
        &format!("DELETE FROM {table} WHERE id = :id"),
        &params! { "id" => 1 },
    )
    .await
    .unwrap();
    let inside: Vec<User> = query_slice(&ctx, &mut *tx, &format!("SELECT id, name FROM {table}"))
        .await
        .unwrap();
    assert!(inside.is_empty());
    tx.rollback().await.unwrap();

    let after: Vec<User> = query_slice(&ctx, db.pool(), &format!("SELECT id, name FROM {table}"))
        .await
        .unwrap();
    assert_eq!(after.len(), 1);

    teardown(db, &table).await;
}

#[tokio::test]
async fn test_deadline_aborts_in_flight_query() {
    let Some(config) = pg_config() else { return };
    let db = Database::open(&config).unwrap();

    let ctx = Context::background().with_timeout(Duration::from_millis(100));
    let err = exec(&ctx, db.pool(), "SELECT pg_sleep(5)").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::DeadlineExceeded);

    // The pool is still usable afterwards.
    let one: (i32,) = query_struct(&Context::background(), db.pool(), "SELECT 1")
        .await
        .unwrap();
    assert_eq!(one.0, 1);

    db.close().await;
}

#[tokio::test]
async fn test_concurrent_callers_share_one_handle() {
    let Some(config) = pg_config() else { return };
    let db = Arc::new(Database::open(&config).unwrap());
    let table = setup(&db, 20).await;
    let query = format!("SELECT id, name FROM {table} WHERE id = :id");

    let calls = (0..50).map(|_| {
        let db = Arc::clone(&db);
        let query = query.clone();
        let id = rand::thread_rng().gen_range(1..=20i64);
        async move {
            let ctx = Context::background().with_timeout(Duration::from_secs(10));
            let user: User = named_query_struct(&ctx, db.pool(), &query, &params! { "id" => id })
                .await
                .unwrap();
            (id, user)
        }
    });

    for (id, user) in join_all(calls).await {
        assert_eq!(user.id, id);
        assert_eq!(user.name, format!("user-{id}"));
    }

    let db = Arc::try_unwrap(db).expect("all callers finished");
    teardown(db, &table).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_writers_on_worker_threads() {
    let Some(config) = pg_config() else { return };
    let db = Arc::new(Database::open(&config).unwrap());
    let table = setup(&db, 0).await;
    let counter = format!("{table}_counter");
    let ctx = Context::background();
    exec(&ctx, db.pool(), &format!("CREATE TABLE {counter} (n BIGINT NOT NULL)"))
        .await
        .unwrap();
    exec(&ctx, db.pool(), &format!("INSERT INTO {counter} (n) VALUES (0)"))
        .await
        .unwrap();

    let insert = format!("INSERT INTO {table} (id, name) VALUES (:id, :name)");
    let bump = format!("UPDATE {counter} SET n = n + :by");
    let select = format!("SELECT id, name FROM {table} WHERE id = :id");

    let handles: Vec<_> = (1..=50i64)
        .map(|id| {
            let db = Arc::clone(&db);
            let (insert, bump, select) = (insert.clone(), bump.clone(), select.clone());
            tokio::spawn(async move {
                let ctx = Context::background().with_timeout(Duration::from_secs(10));
                let args = params! { "id" => id, "name" => format!("writer-{id}") };
                let inserted = named_exec(&ctx, db.pool(), &insert, &args).await.unwrap();
                let bumped = named_exec(&ctx, db.pool(), &bump, &params! { "by" => 1 })
                    .await
                    .unwrap();
                let user: User = named_query_struct(&ctx, db.pool(), &select, &args)
                    .await
                    .unwrap();
                (inserted, bumped, user)
            })
        })
        .collect();

    for (i, handle) in handles.into_iter().enumerate() {
        let (inserted, bumped, user) = handle.await.unwrap();
        let id = i as i64 + 1;
        assert_eq!((inserted, bumped), (1, 1));
        assert_eq!(user, User { id, name: format!("writer-{id}") });
    }

    // Any serial order of the writers ends in the same state.
    let users: Vec<User> = query_slice(
        &ctx,
        db.pool(),
        &format!("SELECT id, name FROM {table} ORDER BY id"),
    )
    .await
    .unwrap();
    let expected: Vec<User> = (1..=50)
        .map(|id| User { id, name: format!("writer-{id}") })
        .collect();
    assert_eq!(users, expected);

    let (n,): (i64,) = query_struct(&ctx, db.pool(), &format!("SELECT n FROM {counter}"))
        .await
        .unwrap();
    assert_eq!(n, 50);

    exec(&ctx, db.pool(), &format!("DROP TABLE {counter}"))
        .await
        .unwrap();
    let db = Arc::try_unwrap(db).expect("all writers finished");
    teardown(db, &table).await;
}

#[tokio::test]
async fn test_missing_parameter_never_reaches_server() {
    let Some(config) = pg_config() else { return };
    let db = Database::open(&config).unwrap();

    let err = named_exec(
        &Context::background(),
        db.pool(),
        "INSERT INTO dbsql_missing_table (id) VALUES (:id)",
        &NoParams,
    )
    .await
    .unwrap_err();
    // A bind error, not UndefinedTable: the statement was never sent.
    assert!(matches!(err, DbError::Bind { .. }));

    db.close().await;
}

#[tokio::test]
async fn test_null_binds_into_typed_column() {
    #[derive(Debug, PartialEq, sqlx::FromRow)]
    struct Node {
        id: i64,
        parent: Option<i64>,
    }

    let Some(config) = pg_config() else { return };
    let db = Database::open(&config).unwrap();
    let table = format!("dbsql_nodes_{}", rand::thread_rng().r#gen::<u32>());
    let ctx = Context::background();
    exec(
        &ctx,
        db.pool(),
        &format!("CREATE TABLE {table} (id BIGINT PRIMARY KEY, parent BIGINT)"),
    )
    .await
    .unwrap();

    let insert = format!("INSERT INTO {table} (id, parent) VALUES (:id, :parent)");
    named_exec(&ctx, db.pool(), &insert, &params! { "id" => 1, "parent" => None::<i64> })
        .await
        .unwrap();
    named_exec(&ctx, db.pool(), &insert, &params! { "id" => 2, "parent" => Some(1i64) })
        .await
        .unwrap();
    // Same statement text, now with a NULL after a typed value was cached.
    named_exec(&ctx, db.pool(), &insert, &params! { "id" => 3, "parent" => None::<i64> })
        .await
        .unwrap();

    let nodes: Vec<Node> = query_slice(
        &ctx,
        db.pool(),
        &format!("SELECT id, parent FROM {table} ORDER BY id"),
    )
    .await
    .unwrap();
    assert_eq!(
        nodes,
        vec![
            Node { id: 1, parent: None },
            Node { id: 2, parent: Some(1) },
            Node { id: 3, parent: None },
        ]
    );

    teardown(db, &table).await;
}

#[tokio::test]
async fn test_serialized_uuid_and_timestamp_columns() {
    #[derive(Debug, Serialize, PartialEq, sqlx::FromRow)]
    struct Event {
        id: uuid::Uuid,
        at: chrono::DateTime<chrono::Utc>,
        label: String,
    }

    let Some(config) = pg_config() else { return };
    let db = Database::open(&config).unwrap();
    let table = format!("dbsql_events_{}", rand::thread_rng().r#gen::<u32>());
    let ctx = Context::background();
    exec(
        &ctx,
        db.pool(),
        &format!(
            "CREATE TABLE {table} (id UUID PRIMARY KEY, at TIMESTAMPTZ NOT NULL, label TEXT NOT NULL)"
        ),
    )
    .await
    .unwrap();

    let event = Event {
        id: uuid::Uuid::new_v4(),
        at: chrono::DateTime::parse_from_rfc3339("2024-05-01T12:30:00.250Z")
            .unwrap()
            .with_timezone(&chrono::Utc),
        // Looks like a UUID but lands in a text column.
        label: uuid::Uuid::new_v4().to_string(),
    };
    let record = Params::from_serialize(&event).unwrap();
    named_exec(
        &ctx,
        db.pool(),
        &format!("INSERT INTO {table} (id, at, label) VALUES (:id, :at, :label)"),
        &record,
    )
    .await
    .unwrap();

    let stored: Event = named_query_struct(
        &ctx,
        db.pool(),
        &format!("SELECT id, at, label FROM {table} WHERE id = :id AND at = :at"),
        &record,
    )
    .await
    .unwrap();
    assert_eq!(stored, event);

    teardown(db, &table).await;
}

#[tokio::test]
async fn test_empty_list_with_in_and_not_in() {
    let Some(config) = pg_config() else { return };
    let db = Database::open(&config).unwrap();
    let table = setup(&db, 3).await;
    let ctx = Context::background();
    let empty = params! { "ids" => Vec::<i64>::new() };

    let none: Vec<User> = named_query_slice_using_in(
        &ctx,
        db.pool(),
        &format!("SELECT id, name FROM {table} WHERE id IN (:ids)"),
        &empty,
    )
    .await
    .unwrap();
    assert!(none.is_empty());

    let not_in = format!("SELECT id, name FROM {table} WHERE id NOT IN (:ids) ORDER BY id");
    let err = named_query_slice_using_in::<User, _, _>(&ctx, db.pool(), &not_in, &empty)
        .await
        .unwrap_err();
    assert!(matches!(err, DbError::Bind { .. }));

    let rest: Vec<User> =
        named_query_slice_using_in(&ctx, db.pool(), &not_in, &params! { "ids" => vec![2i64] })
            .await
            .unwrap();
    assert_eq!(rest.iter().map(|u| u.id).collect::<Vec<_>>(), vec![1, 3]);

    teardown(db, &table).await;
}

#[tokio::test]
async fn test_schema_with_spaces_lands_on_search_path() {
    let Some(config) = pg_config() else { return };
    let admin = Database::open(&config).unwrap();
    let schema = format!("dbsql app {}", rand::thread_rng().r#gen::<u32>());
    let ctx = Context::background();
    exec(&ctx, admin.pool(), &format!("CREATE SCHEMA \"{schema}\""))
        .await
        .unwrap();

    let db = Database::open(&config.clone().with_schema(schema.clone())).unwrap();
    let (current,): (String,) = query_struct(&ctx, db.pool(), "SELECT current_schema()::text")
        .await
        .unwrap();
    assert_eq!(current, schema);
    db.close().await;

    exec(&ctx, admin.pool(), &format!("DROP SCHEMA \"{schema}\""))
        .await
        .unwrap();
    admin.close().await;
}

/// Counts events from this crate and collects the result-size span fields.
#[derive(Clone, Default)]
struct Recorder {
    events: Arc<AtomicUsize>,
    sizes: Arc<Mutex<Vec<(&'static str, u64)>>>,
}

struct SizeVisitor<'a>(&'a Mutex<Vec<(&'static str, u64)>>);

impl tracing::field::Visit for SizeVisitor<'_> {
    fn record_u64(&mut self, field: &tracing::field::Field, value: u64) {
        if matches!(field.name(), "rows" | "rows_affected") {
            self.0.lock().unwrap().push((field.name(), value));
        }
    }

    fn record_debug(&mut self, _field: &tracing::field::Field, _value: &dyn std::fmt::Debug) {}
}

impl<S: tracing::Subscriber> tracing_subscriber::Layer<S> for Recorder {
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: tracing_subscriber::layer::Context<'_, S>) {
        if event.metadata().target().starts_with("dbsql") {
            self.events.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn on_record(
        &self,
        _span: &tracing::span::Id,
        values: &tracing::span::Record<'_>,
        _ctx: tracing_subscriber::layer::Context<'_, S>,
    ) {
        values.record(&mut SizeVisitor(&self.sizes));
    }
}

#[tokio::test]
async fn test_successful_calls_emit_one_event_each() {
    use tracing_subscriber::layer::SubscriberExt;

    let Some(config) = pg_config() else { return };
    let db = Database::open(&config).unwrap();
    let table = setup(&db, 3).await;
    let ctx = Context::background();

    let recorder = Recorder::default();
    let guard =
        tracing::subscriber::set_default(tracing_subscriber::registry().with(recorder.clone()));
    let events = || recorder.events.swap(0, Ordering::SeqCst);

    named_exec(
        &ctx,
        db.pool(),
        &format!("UPDATE {table} SET name = :name WHERE id <= :id"),
        &params! { "name" => "renamed", "id" => 2 },
    )
    .await
    .unwrap();
    assert_eq!(events(), 1);

    let users: Vec<User> = query_rows(
        &ctx,
        db.pool(),
        &format!("SELECT id, name FROM {table} ORDER BY id"),
        &NoParams,
        Binding::Plain,
    )
    .await
    .unwrap();
    assert_eq!(users.len(), 3);
    assert_eq!(events(), 1);

    let first: User = query_struct(
        &ctx,
        db.pool(),
        &format!("SELECT id, name FROM {table} ORDER BY id"),
    )
    .await
    .unwrap();
    assert_eq!(first.id, 1);
    assert_eq!(events(), 1);

    assert_eq!(
        *recorder.sizes.lock().unwrap(),
        vec![("rows_affected", 2), ("rows", 3)]
    );

    drop(guard);
    teardown(db, &table).await;
}
