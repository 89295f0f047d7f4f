//! Shared plumbing for the Postgres-backed stores.
//!
//! The store traits are synchronous. Each Postgres store keeps a handle to a
//! tokio runtime and blocks on its sqlx futures, so it must be called from
//! plain threads (projector workers, the node's command loop), never from
//! inside an async task.

pub mod schema;

use std::future::Future;

use sqlx::PgPool;

/// Connection pool plus the runtime used to drive it.
#[derive(Debug, Clone)]
pub struct PgContext {
    pool: PgPool,
    handle: tokio::runtime::Handle,
}

impl PgContext {
    pub fn new(pool: PgPool, handle: tokio::runtime::Handle) -> Self {
        Self { pool, handle }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub(crate) fn block_on<F: Future>(&self, future: F) -> F::Output {
        self.handle.block_on(future)
    }

    /// Create every table the backend needs (idempotent).
    pub fn migrate(&self) -> Result<(), sqlx::Error> {
        self.block_on(async {
            for statement in schema::ALL {
                sqlx::raw_sql(statement).execute(&self.pool).await?;
            }
            Ok(())
        })
    }
}

/// Whether an error is a unique constraint violation (SQLSTATE 23505).
pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        if let Some(code) = db_err.code() {
            return code.as_ref() == "23505";
        }
    }
    false
}

/// Human-readable description of a sqlx failure in `operation`.
pub(crate) fn describe(operation: &str, err: &sqlx::Error) -> String {
    match err {
        sqlx::Error::Database(db_err) => format!("database error in {operation}: {}", db_err.message()),
        sqlx::Error::PoolClosed => format!("connection pool closed in {operation}"),
        sqlx::Error::PoolTimedOut => format!("connection pool timed out in {operation}"),
        other => format!("sqlx error in {operation}: {other}"),
    }
}
