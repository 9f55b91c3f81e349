//! Database schema migrations.
//!
//! Version 1 creates the `sessions` table and the append-only `turns` log.

use rusqlite::Connection;
use tracing::info;

use askdb_core::error::AskError;

use crate::db::storage;

/// Run all pending database migrations.
pub fn run_migrations(conn: &Connection) -> Result<(), AskError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version     INTEGER PRIMARY KEY NOT NULL,
            name        TEXT NOT NULL,
            applied_at  INTEGER NOT NULL DEFAULT (strftime('%s', 'now'))
        );",
    )
    .map_err(storage("create migrations table"))?;

    let current_version: i64 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
            [],
            |row| row.get(0),
        )
        .map_err(storage("read migration version"))?;

    if current_version < 1 {
        apply_v1(conn)?;
        info!("Applied migration v1: sessions_and_turns");
    }

    Ok(())
}

/// Version 1: sessions and their turn log.
fn apply_v1(conn: &Connection) -> Result<(), AskError> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS sessions (
            session_id      TEXT PRIMARY KEY NOT NULL,
            db_family       TEXT NOT NULL,
            db_label        TEXT NOT NULL,
            created_at      INTEGER NOT NULL,
            last_active_at  INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_sessions_last_active
            ON sessions (last_active_at ASC);

        -- Turns are never updated in place; seq orders them within a session.
        CREATE TABLE IF NOT EXISTS turns (
            turn_id             TEXT PRIMARY KEY NOT NULL,
            session_id          TEXT NOT NULL,
            seq                 INTEGER NOT NULL,
            timestamp           INTEGER NOT NULL,
            raw_utterance       TEXT NOT NULL,
            resolved_utterance  TEXT NOT NULL,
            classification      TEXT NOT NULL
                                CHECK (classification IN ('data', 'schema', 'general', 'followup')),
            generated_sql       TEXT,
            query_spec          TEXT,
            result_summary      TEXT,
            chart_hint          TEXT
                                CHECK (chart_hint IS NULL
                                       OR chart_hint IN ('bar', 'line', 'histogram', 'table')),
            failure             TEXT,
            UNIQUE (session_id, seq),
            FOREIGN KEY (session_id) REFERENCES sessions(session_id) ON DELETE CASCADE
        );

        CREATE INDEX IF NOT EXISTS idx_turns_session_seq
            ON turns (session_id, seq ASC);

        INSERT INTO schema_migrations (version, name) VALUES (1, 'sessions_and_turns');
        ",
    )
    .map_err(storage("apply migration v1"))?;

    Ok(())
}
