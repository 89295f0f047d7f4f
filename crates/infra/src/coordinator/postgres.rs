//! Postgres-backed reservation table.

use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{Postgres, Row, Transaction};
use uuid::Uuid;

use factline_core::{AggregateId, CommandId};
use factline_events::{ClaimChange, ClaimKey};

use super::CoordinatorError;
use super::reservation::{
    ClaimConflict, Fenced, LeaseState, Reservation, ReservationStore, ReserveOutcome, decide_reserve, holds_lease,
};
use crate::postgres::{PgContext, describe};

/// Reservation store over `reservations` and `coordinator_cursor`.
///
/// Each operation is one transaction holding the key's row lock
/// (`SELECT … FOR UPDATE`); `apply_committed` additionally locks the cursor row,
/// so the position check, the claim changes and the cursor advance commit
/// together.
///
/// `commit_fenced` keeps its transaction open across the caller's append: the
/// key rows stay locked until the append has returned and the keys are marked
/// owned, so a competing `try_reserve` waits instead of taking an expired lease.
#[derive(Debug, Clone)]
pub struct PostgresReservationStore {
    ctx: PgContext,
}

impl PostgresReservationStore {
    pub fn new(ctx: PgContext) -> Self {
        Self { ctx }
    }

    async fn try_reserve_async(
        &self,
        key: &ClaimKey,
        holder: &AggregateId,
        token: CommandId,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<ReserveOutcome, CoordinatorError> {
        let mut tx = self.ctx.pool().begin().await.map_err(|e| unavailable("begin", &e))?;

        // Make sure a row exists to lock; a fresh row starts as our lease.
        let inserted = sqlx::query(
            r#"
            INSERT INTO reservations (claim_key, holder, lease_token, expires_at, owned)
            VALUES ($1, $2, $3, $4, FALSE)
            ON CONFLICT (claim_key) DO NOTHING
            "#,
        )
        .bind(key.as_str())
        .bind(holder.as_str())
        .bind(token.as_uuid())
        .bind(expires_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| unavailable("insert_lease", &e))?
        .rows_affected();

        let outcome = if inserted == 1 {
            ReserveOutcome::Leased
        } else {
            let current = lock_row(&mut tx, key).await?;
            let outcome = decide_reserve(current.as_ref(), holder, now);
            if outcome == ReserveOutcome::Leased {
                sqlx::query(
                    r#"
                    UPDATE reservations
                    SET holder = $2, lease_token = $3, expires_at = $4, owned = FALSE
                    WHERE claim_key = $1
                    "#,
                )
                .bind(key.as_str())
                .bind(holder.as_str())
                .bind(token.as_uuid())
                .bind(expires_at)
                .execute(&mut *tx)
                .await
                .map_err(|e| unavailable("take_lease", &e))?;
            }
            outcome
        };

        tx.commit().await.map_err(|e| unavailable("commit", &e))?;
        Ok(outcome)
    }

    /// Lock every key row; the first key no longer held under `token` is returned with the transaction.
    async fn lock_leases(
        &self,
        keys: &[ClaimKey],
        holder: &AggregateId,
        token: CommandId,
        now: DateTime<Utc>,
    ) -> Result<(Transaction<'static, Postgres>, Option<ClaimKey>), CoordinatorError> {
        let mut tx = self.ctx.pool().begin().await.map_err(|e| unavailable("begin", &e))?;
        for key in keys {
            let current = lock_row(&mut tx, key).await?;
            if !holds_lease(current.as_ref(), holder, token, now) {
                return Ok((tx, Some(key.clone())));
            }
        }
        Ok((tx, None))
    }

    async fn confirm_fenced(
        &self,
        mut tx: Transaction<'static, Postgres>,
        keys: &[ClaimKey],
        holder: &AggregateId,
    ) -> Result<(), CoordinatorError> {
        for key in keys {
            sqlx::query(
                r#"
                UPDATE reservations
                SET holder = $2, lease_token = NULL, expires_at = NULL, owned = TRUE
                WHERE claim_key = $1
                "#,
            )
            .bind(key.as_str())
            .bind(holder.as_str())
            .execute(&mut *tx)
            .await
            .map_err(|e| unavailable("confirm_fenced", &e))?;
        }
        tx.commit().await.map_err(|e| unavailable("commit", &e))
    }

    async fn apply_committed_async(
        &self,
        global_position: u64,
        holder: &AggregateId,
        changes: &[ClaimChange],
    ) -> Result<Vec<ClaimConflict>, CoordinatorError> {
        let mut tx = self.ctx.pool().begin().await.map_err(|e| unavailable("begin", &e))?;

        let observed: Option<i64> =
            sqlx::query_scalar("SELECT global_position FROM coordinator_cursor WHERE id = 1 FOR UPDATE")
                .fetch_one(&mut *tx)
                .await
                .map_err(|e| unavailable("lock_cursor", &e))?;
        if observed.is_some_and(|p| global_position as i64 <= p) {
            return Ok(Vec::new());
        }

        let mut conflicts = Vec::new();
        for change in changes {
            let key = change.key();
            let current = lock_row(&mut tx, key).await?;
            match change {
                ClaimChange::Acquire(_) => match current {
                    Some(r) if r.is_owned() && &r.holder != holder => conflicts.push(ClaimConflict {
                        key: key.clone(),
                        owner: r.holder,
                        claimant: holder.clone(),
                    }),
                    _ => {
                        sqlx::query(
                            r#"
                            INSERT INTO reservations (claim_key, holder, lease_token, expires_at, owned)
                            VALUES ($1, $2, NULL, NULL, TRUE)
                            ON CONFLICT (claim_key)
                            DO UPDATE SET holder = EXCLUDED.holder, lease_token = NULL, expires_at = NULL, owned = TRUE
                            "#,
                        )
                        .bind(key.as_str())
                        .bind(holder.as_str())
                        .execute(&mut *tx)
                        .await
                        .map_err(|e| unavailable("confirm_owner", &e))?;
                    }
                },
                ClaimChange::Release(_) => {
                    sqlx::query("DELETE FROM reservations WHERE claim_key = $1 AND holder = $2 AND owned")
                        .bind(key.as_str())
                        .bind(holder.as_str())
                        .execute(&mut *tx)
                        .await
                        .map_err(|e| unavailable("release_owner", &e))?;
                }
            }
        }

        sqlx::query("UPDATE coordinator_cursor SET global_position = $1 WHERE id = 1")
            .bind(global_position as i64)
            .execute(&mut *tx)
            .await
            .map_err(|e| unavailable("advance_cursor", &e))?;

        tx.commit().await.map_err(|e| unavailable("commit", &e))?;
        Ok(conflicts)
    }
}

impl ReservationStore for PostgresReservationStore {
    fn try_reserve(
        &self,
        key: &ClaimKey,
        holder: &AggregateId,
        token: CommandId,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<ReserveOutcome, CoordinatorError> {
        self.ctx.block_on(self.try_reserve_async(key, holder, token, expires_at, now))
    }

    fn renew(
        &self,
        key: &ClaimKey,
        holder: &AggregateId,
        token: CommandId,
        expires_at: DateTime<Utc>,
    ) -> Result<bool, CoordinatorError> {
        self.ctx.block_on(async {
            let updated = sqlx::query(
                r#"
                UPDATE reservations
                SET expires_at = CASE WHEN owned THEN NULL ELSE $4 END
                WHERE claim_key = $1
                  AND ((owned AND holder = $2) OR (NOT owned AND lease_token = $3))
                "#,
            )
            .bind(key.as_str())
            .bind(holder.as_str())
            .bind(token.as_uuid())
            .bind(expires_at)
            .execute(self.ctx.pool())
            .await
            .map_err(|e| unavailable("renew", &e))?;
            Ok(updated.rows_affected() == 1)
        })
    }

    fn release(&self, key: &ClaimKey, token: CommandId) -> Result<(), CoordinatorError> {
        self.ctx.block_on(async {
            sqlx::query("DELETE FROM reservations WHERE claim_key = $1 AND NOT owned AND lease_token = $2")
                .bind(key.as_str())
                .bind(token.as_uuid())
                .execute(self.ctx.pool())
                .await
                .map_err(|e| unavailable("release", &e))?;
            Ok(())
        })
    }

    fn commit_fenced(
        &self,
        keys: &[ClaimKey],
        holder: &AggregateId,
        token: CommandId,
        now: DateTime<Utc>,
        commit: &mut dyn FnMut() -> bool,
    ) -> Result<Fenced, CoordinatorError> {
        let (tx, lost) = self.ctx.block_on(self.lock_leases(keys, holder, token, now))?;
        if let Some(key) = lost {
            self.ctx.block_on(tx.rollback()).map_err(|e| unavailable("rollback", &e))?;
            return Ok(Fenced::LeaseLost(key));
        }

        // Outside `block_on`: the append drives the runtime itself.
        if !commit() {
            self.ctx.block_on(tx.rollback()).map_err(|e| unavailable("rollback", &e))?;
            return Ok(Fenced::Aborted);
        }
        self.ctx.block_on(self.confirm_fenced(tx, keys, holder))?;
        Ok(Fenced::Committed)
    }

    fn apply_committed(
        &self,
        global_position: u64,
        holder: &AggregateId,
        changes: &[ClaimChange],
    ) -> Result<Vec<ClaimConflict>, CoordinatorError> {
        self.ctx.block_on(self.apply_committed_async(global_position, holder, changes))
    }

    fn observed_position(&self) -> Result<Option<u64>, CoordinatorError> {
        self.ctx.block_on(async {
            let p: Option<i64> = sqlx::query_scalar("SELECT global_position FROM coordinator_cursor WHERE id = 1")
                .fetch_one(self.ctx.pool())
                .await
                .map_err(|e| unavailable("observed_position", &e))?;
            Ok(p.map(|p| p as u64))
        })
    }

    fn get(&self, key: &ClaimKey) -> Result<Option<Reservation>, CoordinatorError> {
        self.ctx.block_on(async {
            let row = sqlx::query(
                "SELECT claim_key, holder, lease_token, expires_at, owned FROM reservations WHERE claim_key = $1",
            )
            .bind(key.as_str())
            .fetch_optional(self.ctx.pool())
            .await
            .map_err(|e| unavailable("get", &e))?;
            row.as_ref().map(row_to_reservation).transpose()
        })
    }

    fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize, CoordinatorError> {
        self.ctx.block_on(async {
            let done = sqlx::query("DELETE FROM reservations WHERE NOT owned AND expires_at <= $1")
                .bind(now)
                .execute(self.ctx.pool())
                .await
                .map_err(|e| unavailable("purge_expired", &e))?;
            Ok(done.rows_affected() as usize)
        })
    }
}

async fn lock_row(tx: &mut Transaction<'_, Postgres>, key: &ClaimKey) -> Result<Option<Reservation>, CoordinatorError> {
    let row = sqlx::query(
        "SELECT claim_key, holder, lease_token, expires_at, owned FROM reservations WHERE claim_key = $1 FOR UPDATE",
    )
    .bind(key.as_str())
    .fetch_optional(&mut **tx)
    .await
    .map_err(|e| unavailable("lock_reservation", &e))?;
    row.as_ref().map(row_to_reservation).transpose()
}

fn row_to_reservation(row: &PgRow) -> Result<Reservation, CoordinatorError> {
    let bad = |e: sqlx::Error| CoordinatorError::Unavailable(format!("malformed reservation row: {e}"));

    let key: String = row.try_get("claim_key").map_err(bad)?;
    let holder: String = row.try_get("holder").map_err(bad)?;
    let owned: bool = row.try_get("owned").map_err(bad)?;
    let token: Option<Uuid> = row.try_get("lease_token").map_err(bad)?;
    let expires_at: Option<DateTime<Utc>> = row.try_get("expires_at").map_err(bad)?;

    let state = match (owned, token, expires_at) {
        (true, _, _) => LeaseState::Owned,
        (false, Some(token), Some(expires_at)) => LeaseState::Leased {
            token: CommandId::from_uuid(token),
            expires_at,
        },
        _ => {
            return Err(CoordinatorError::Unavailable(format!(
                "reservation {key} is neither owned nor leased"
            )));
        }
    };

    Ok(Reservation {
        key: ClaimKey::from(key),
        holder: AggregateId::new(holder)
            .map_err(|e| CoordinatorError::Unavailable(format!("malformed reservation holder: {e}")))?,
        state,
    })
}

fn unavailable(operation: &str, err: &sqlx::Error) -> CoordinatorError {
    CoordinatorError::Unavailable(describe(operation, err))
}
