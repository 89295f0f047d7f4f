//! Postgres-backed idempotency records.

use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::Row;

use super::store::{CheckOutcome, EffectKey, IdempotencyError, IdempotencyRecord, IdempotencyStore};
use crate::postgres::{PgContext, describe};

/// Idempotency store over the `idempotency_records` table.
///
/// `check_and_reserve` locks the key's row (`SELECT … FOR UPDATE`) so racing
/// executors serialize on it; the insert of a fresh marker uses
/// `ON CONFLICT DO NOTHING` and re-checks, which covers two callers inserting
/// the first marker at once.
#[derive(Debug, Clone)]
pub struct PostgresIdempotencyStore {
    ctx: PgContext,
}

impl PostgresIdempotencyStore {
    pub fn new(ctx: PgContext) -> Self {
        Self { ctx }
    }

    async fn check_and_reserve_async(
        &self,
        key: &EffectKey,
        pending_until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<CheckOutcome, IdempotencyError> {
        let mut tx = self.ctx.pool().begin().await.map_err(|e| unavailable("begin", &e))?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO idempotency_records (id, effect_kind, pending_until)
            VALUES ($1, $2, $3)
            ON CONFLICT (id, effect_kind) DO NOTHING
            "#,
        )
        .bind(key.id)
        .bind(&key.kind)
        .bind(pending_until)
        .execute(&mut *tx)
        .await
        .map_err(|e| unavailable("insert_marker", &e))?
        .rows_affected();

        if inserted == 0 {
            let row = sqlx::query(
                r#"
                SELECT result, pending_until, completed_at
                FROM idempotency_records
                WHERE id = $1 AND effect_kind = $2
                FOR UPDATE
                "#,
            )
            .bind(key.id)
            .bind(&key.kind)
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| unavailable("lock_record", &e))?;

            let result: Option<JsonValue> = row.try_get("result").map_err(|e| corrupt(&e))?;
            let completed_at: Option<DateTime<Utc>> = row.try_get("completed_at").map_err(|e| corrupt(&e))?;
            let until: Option<DateTime<Utc>> = row.try_get("pending_until").map_err(|e| corrupt(&e))?;

            if completed_at.is_some() {
                let result = result.ok_or_else(|| IdempotencyError::Corrupt(format!("{key} completed without result")))?;
                return Ok(CheckOutcome::AlreadyDone(result));
            }
            if until.is_some_and(|u| u > now) {
                return Err(IdempotencyError::InFlight(key.clone()));
            }

            sqlx::query("UPDATE idempotency_records SET pending_until = $3 WHERE id = $1 AND effect_kind = $2")
                .bind(key.id)
                .bind(&key.kind)
                .bind(pending_until)
                .execute(&mut *tx)
                .await
                .map_err(|e| unavailable("take_over_marker", &e))?;
        }

        tx.commit().await.map_err(|e| unavailable("commit", &e))?;
        Ok(CheckOutcome::Fresh)
    }
}

impl IdempotencyStore for PostgresIdempotencyStore {
    fn check_and_reserve(
        &self,
        key: &EffectKey,
        pending_until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<CheckOutcome, IdempotencyError> {
        self.ctx.block_on(self.check_and_reserve_async(key, pending_until, now))
    }

    fn record(&self, key: &EffectKey, result: &JsonValue, now: DateTime<Utc>) -> Result<(), IdempotencyError> {
        self.ctx.block_on(async {
            sqlx::query(
                r#"
                INSERT INTO idempotency_records (id, effect_kind, result, pending_until, completed_at)
                VALUES ($1, $2, $3, NULL, $4)
                ON CONFLICT (id, effect_kind)
                DO UPDATE SET result = EXCLUDED.result, pending_until = NULL, completed_at = EXCLUDED.completed_at
                "#,
            )
            .bind(key.id)
            .bind(&key.kind)
            .bind(result)
            .bind(now)
            .execute(self.ctx.pool())
            .await
            .map_err(|e| unavailable("record", &e))?;
            Ok(())
        })
    }

    fn abandon(&self, key: &EffectKey) -> Result<(), IdempotencyError> {
        self.ctx.block_on(async {
            sqlx::query("DELETE FROM idempotency_records WHERE id = $1 AND effect_kind = $2 AND completed_at IS NULL")
                .bind(key.id)
                .bind(&key.kind)
                .execute(self.ctx.pool())
                .await
                .map_err(|e| unavailable("abandon", &e))?;
            Ok(())
        })
    }

    fn get(&self, key: &EffectKey) -> Result<Option<IdempotencyRecord>, IdempotencyError> {
        self.ctx.block_on(async {
            let row = sqlx::query(
                r#"
                SELECT result, completed_at
                FROM idempotency_records
                WHERE id = $1 AND effect_kind = $2 AND completed_at IS NOT NULL
                "#,
            )
            .bind(key.id)
            .bind(&key.kind)
            .fetch_optional(self.ctx.pool())
            .await
            .map_err(|e| unavailable("get", &e))?;

            let Some(row) = row else {
                return Ok(None);
            };
            Ok(Some(IdempotencyRecord {
                id: key.id,
                effect_kind: key.kind.clone(),
                result: row.try_get("result").map_err(|e| corrupt(&e))?,
                completed_at: row.try_get("completed_at").map_err(|e| corrupt(&e))?,
            }))
        })
    }

    fn purge_completed_before(&self, cutoff: DateTime<Utc>) -> Result<usize, IdempotencyError> {
        self.ctx.block_on(async {
            let done = sqlx::query(
                r#"
                DELETE FROM idempotency_records
                WHERE completed_at < $1
                   OR (completed_at IS NULL AND pending_until < $1)
                "#,
            )
                .bind(cutoff)
                .execute(self.ctx.pool())
                .await
                .map_err(|e| unavailable("purge", &e))?;
            Ok(done.rows_affected() as usize)
        })
    }
}

fn unavailable(operation: &str, err: &sqlx::Error) -> IdempotencyError {
    IdempotencyError::Unavailable(describe(operation, err))
}

fn corrupt(err: &sqlx::Error) -> IdempotencyError {
    IdempotencyError::Corrupt(err.to_string())
}
