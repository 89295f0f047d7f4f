//! Postgres-backed checkpoint store.

use serde_json::Value as JsonValue;
use sqlx::Row;

use super::checkpoint::{CheckpointError, CheckpointStore, CommittedState};
use crate::postgres::{PgContext, describe};

/// Checkpoint store over `projection_checkpoints`; state and checkpoint live
/// in the same row, so a commit is one conditional statement.
#[derive(Debug, Clone)]
pub struct PostgresCheckpointStore {
    ctx: PgContext,
}

impl PostgresCheckpointStore {
    pub fn new(ctx: PgContext) -> Self {
        Self { ctx }
    }

    async fn commit_async(
        &self,
        projection_id: &str,
        expected: Option<u64>,
        checkpoint: u64,
        state: &JsonValue,
    ) -> Result<(), CheckpointError> {
        let mut tx = self.ctx.pool().begin().await.map_err(|e| unavailable("begin", &e))?;

        let found: Option<Option<i64>> = sqlx::query_scalar(
            "SELECT last_committed_offset FROM projection_checkpoints WHERE projection_id = $1 FOR UPDATE",
        )
        .bind(projection_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| unavailable("lock_checkpoint", &e))?;
        let found = found.flatten().map(|o| o as u64);

        if found != expected {
            return Err(CheckpointError::Aborted {
                projection_id: projection_id.to_string(),
                expected,
                found,
            });
        }

        sqlx::query(
            r#"
            INSERT INTO projection_checkpoints (projection_id, last_committed_offset, state, updated_at)
            VALUES ($1, $2, $3, NOW())
            ON CONFLICT (projection_id)
            DO UPDATE SET
                last_committed_offset = EXCLUDED.last_committed_offset,
                state = EXCLUDED.state,
                updated_at = NOW()
            "#,
        )
        .bind(projection_id)
        .bind(checkpoint as i64)
        .bind(state)
        .execute(&mut *tx)
        .await
        .map_err(|e| unavailable("commit_checkpoint", &e))?;

        tx.commit().await.map_err(|e| unavailable("commit", &e))
    }
}

impl CheckpointStore for PostgresCheckpointStore {
    fn get(&self, projection_id: &str) -> Result<Option<u64>, CheckpointError> {
        Ok(self.load(projection_id)?.and_then(|c| c.checkpoint))
    }

    fn load(&self, projection_id: &str) -> Result<Option<CommittedState>, CheckpointError> {
        self.ctx.block_on(async {
            let row = sqlx::query(
                "SELECT last_committed_offset, state FROM projection_checkpoints WHERE projection_id = $1",
            )
            .bind(projection_id)
            .fetch_optional(self.ctx.pool())
            .await
            .map_err(|e| unavailable("load_checkpoint", &e))?;

            let Some(row) = row else {
                return Ok(None);
            };
            let offset: Option<i64> = row
                .try_get("last_committed_offset")
                .map_err(|e| CheckpointError::Corrupt(e.to_string()))?;
            let state: JsonValue = row.try_get("state").map_err(|e| CheckpointError::Corrupt(e.to_string()))?;
            Ok(Some(CommittedState {
                checkpoint: offset.map(|o| o as u64),
                state,
            }))
        })
    }

    fn commit(
        &self,
        projection_id: &str,
        expected: Option<u64>,
        checkpoint: u64,
        state: &JsonValue,
    ) -> Result<(), CheckpointError> {
        self.ctx.block_on(self.commit_async(projection_id, expected, checkpoint, state))
    }

    fn rewind(&self, projection_id: &str, to: Option<u64>) -> Result<(), CheckpointError> {
        self.ctx.block_on(async {
            sqlx::query(
                r#"
                UPDATE projection_checkpoints
                SET last_committed_offset = CASE
                        WHEN $2::BIGINT IS NULL OR last_committed_offset IS NULL THEN NULL
                        ELSE LEAST(last_committed_offset, $2::BIGINT)
                    END,
                    updated_at = NOW()
                WHERE projection_id = $1
                "#,
            )
            .bind(projection_id)
            .bind(to.map(|o| o as i64))
            .execute(self.ctx.pool())
            .await
            .map_err(|e| unavailable("rewind_checkpoint", &e))?;
            Ok(())
        })
    }

    fn reset(&self, projection_id: &str) -> Result<(), CheckpointError> {
        self.ctx.block_on(async {
            sqlx::query("DELETE FROM projection_checkpoints WHERE projection_id = $1")
                .bind(projection_id)
                .execute(self.ctx.pool())
                .await
                .map_err(|e| unavailable("reset_checkpoint", &e))?;
            Ok(())
        })
    }
}

fn unavailable(operation: &str, err: &sqlx::Error) -> CheckpointError {
    CheckpointError::Unavailable(describe(operation, err))
}
