//! SQL migration definitions for the docflow execution database.
//!
//! Migrations are applied in order on database open. Each migration has a
//! version number and a batch of SQL statements.

/// A database migration with a version and SQL statements.
pub(crate) struct Migration {
    pub version: u32,
    pub description: &'static str,
    pub sql: &'static str,
}

/// All migrations, in ascending version order.
pub(crate) fn all_migrations() -> Vec<Migration> {
    vec![
        Migration {
            version: 1,
            description: "Initial schema: executions, execution_events",
            sql: r#"
-- Schema version tracking
CREATE TABLE IF NOT EXISTS schema_migrations (
    version    INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- One row per workflow instance; context_json is the checkpointed WorkflowContext
CREATE TABLE IF NOT EXISTS executions (
    id           TEXT PRIMARY KEY,
    request_id   TEXT NOT NULL UNIQUE,
    state        TEXT NOT NULL,
    context_json TEXT NOT NULL,
    attempt      INTEGER NOT NULL DEFAULT 0,
    resume_at    TEXT,
    error        TEXT,
    created_at   TEXT NOT NULL,
    updated_at   TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_executions_state ON executions(state);

-- Append-only transition history
CREATE TABLE IF NOT EXISTS execution_events (
    id           INTEGER PRIMARY KEY AUTOINCREMENT,
    execution_id TEXT NOT NULL REFERENCES executions(id) ON DELETE CASCADE,
    state        TEXT NOT NULL,
    kind         TEXT NOT NULL,
    detail       TEXT,
    at           TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_events_execution ON execution_events(execution_id);

INSERT INTO schema_migrations (version) VALUES (1);
"#,
        },
        Migration {
            version: 2,
            description: "Runner leases and checkpoint versions",
            sql: r#"
-- Every checkpoint write bumps version; writers compare-and-swap on it
ALTER TABLE executions ADD COLUMN version INTEGER NOT NULL DEFAULT 0;

-- Runner currently driving the execution, and when its claim lapses (unix millis)
ALTER TABLE executions ADD COLUMN owner TEXT;
ALTER TABLE executions ADD COLUMN lease_expires_at INTEGER;

INSERT INTO schema_migrations (version) VALUES (2);
"#,
        },
    ]
}
