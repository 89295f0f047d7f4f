//! Database schema for the Postgres backend.
//!
//! Every statement is idempotent (`IF NOT EXISTS`), so `PgContext::migrate`
//! can run on every start.

/// The log. `global_position` is the primary key and is handed out under the
/// `log_heads` row lock, so it follows commit order.
pub const CREATE_EVENTS_TABLE: &str = r"
CREATE TABLE IF NOT EXISTS events (
    global_position  BIGINT PRIMARY KEY,
    event_id         UUID NOT NULL UNIQUE,
    causation_id     UUID NOT NULL,
    aggregate_id     TEXT NOT NULL,
    aggregate_type   TEXT NOT NULL,
    stream_version   BIGINT NOT NULL CHECK (stream_version > 0),
    partition_id     INTEGER NOT NULL,
    partition_offset BIGINT NOT NULL,
    event_type       TEXT NOT NULL,
    event_version    INTEGER NOT NULL,
    occurred_at      TIMESTAMPTZ NOT NULL,
    payload          JSONB NOT NULL,
    created_at       TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    UNIQUE (aggregate_id, stream_version),
    UNIQUE (partition_id, partition_offset)
);

CREATE INDEX IF NOT EXISTS idx_events_causation_id
    ON events (causation_id);
";

/// Next free position per scope: `global` and one row per partition (`p0`, `p1`, ...).
pub const CREATE_LOG_HEADS_TABLE: &str = r"
CREATE TABLE IF NOT EXISTS log_heads (
    scope      TEXT PRIMARY KEY,
    next_value BIGINT NOT NULL
);
";

/// Committed projection state and checkpoint, written in one transaction.
pub const CREATE_PROJECTION_CHECKPOINTS_TABLE: &str = r"
CREATE TABLE IF NOT EXISTS projection_checkpoints (
    projection_id         TEXT PRIMARY KEY,
    last_committed_offset BIGINT,
    state                 JSONB NOT NULL,
    updated_at            TIMESTAMPTZ NOT NULL DEFAULT NOW()
);
";

/// Completed effects and pending markers.
pub const CREATE_IDEMPOTENCY_RECORDS_TABLE: &str = r"
CREATE TABLE IF NOT EXISTS idempotency_records (
    id            UUID NOT NULL,
    effect_kind   TEXT NOT NULL,
    result        JSONB,
    pending_until TIMESTAMPTZ,
    completed_at  TIMESTAMPTZ,
    PRIMARY KEY (id, effect_kind)
);

CREATE INDEX IF NOT EXISTS idx_idempotency_records_completed_at
    ON idempotency_records (completed_at);
";

/// Uniqueness reservations plus the coordinator's log cursor.
pub const CREATE_RESERVATIONS_TABLE: &str = r"
CREATE TABLE IF NOT EXISTS reservations (
    claim_key   TEXT PRIMARY KEY,
    holder      TEXT NOT NULL,
    lease_token UUID,
    expires_at  TIMESTAMPTZ,
    owned       BOOLEAN NOT NULL DEFAULT FALSE
);

CREATE TABLE IF NOT EXISTS coordinator_cursor (
    id              SMALLINT PRIMARY KEY DEFAULT 1 CHECK (id = 1),
    global_position BIGINT
);

INSERT INTO coordinator_cursor (id, global_position) VALUES (1, NULL)
    ON CONFLICT (id) DO NOTHING;
";

/// All statements in dependency order.
pub const ALL: &[&str] = &[
    CREATE_EVENTS_TABLE,
    CREATE_LOG_HEADS_TABLE,
    CREATE_PROJECTION_CHECKPOINTS_TABLE,
    CREATE_IDEMPOTENCY_RECORDS_TABLE,
    CREATE_RESERVATIONS_TABLE,
];
