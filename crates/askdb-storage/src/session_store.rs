//! Session persistence: the [`SessionStore`] capability and its SQLite backend.
//!
//! Turns are append-only. A turn is written once, in a transaction that also
//! bumps the session's `last_active_at`, and is never updated afterwards.

use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, OptionalExtension};
use tracing::{debug, info};
use uuid::Uuid;

use askdb_core::error::{AskError, Result};
use askdb_core::query::ResolvedQuerySpec;
use askdb_core::types::{
    ChartHint, DatabaseDescriptor, QueryClass, ResultSummary, Session, SessionId,
    SessionSummary, Turn, TurnFailure, TurnId,
};

use crate::db::{storage, Database};

/// Durable record of conversation turns keyed by session id.
///
/// Implementations serialize appends to one session; errors are always
/// returned to the caller, which decides whether to continue without
/// persistence.
pub trait SessionStore: Send + Sync {
    /// Create an empty session. Fails if the id is already taken.
    fn create_session(&self, session_id: SessionId, database: DatabaseDescriptor)
        -> Result<Session>;

    /// Append a turn to the end of a session.
    fn append_turn(&self, session_id: SessionId, turn: &Turn) -> Result<()>;

    /// Full session with turns in append order, or `None` if unknown.
    fn get_session(&self, session_id: SessionId) -> Result<Option<Session>>;

    /// Delete a session and its turns. Returns whether it existed.
    fn clear(&self, session_id: SessionId) -> Result<bool>;

    /// All sessions, most recently active first.
    fn list_sessions(&self) -> Result<Vec<SessionSummary>>;

    /// Delete sessions whose last activity is older than `cutoff`.
    fn purge_inactive(&self, cutoff: DateTime<Utc>) -> Result<usize>;
}

impl<S: SessionStore + ?Sized> SessionStore for Arc<S> {
    fn create_session(
        &self,
        session_id: SessionId,
        database: DatabaseDescriptor,
    ) -> Result<Session> {
        (**self).create_session(session_id, database)
    }

    fn append_turn(&self, session_id: SessionId, turn: &Turn) -> Result<()> {
        (**self).append_turn(session_id, turn)
    }

    fn get_session(&self, session_id: SessionId) -> Result<Option<Session>> {
        (**self).get_session(session_id)
    }

    fn clear(&self, session_id: SessionId) -> Result<bool> {
        (**self).clear(session_id)
    }

    fn list_sessions(&self) -> Result<Vec<SessionSummary>> {
        (**self).list_sessions()
    }

    fn purge_inactive(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        (**self).purge_inactive(cutoff)
    }
}

/// Check that a turn may be appended to `session_id`.
pub(crate) fn check_turn_owner(session_id: SessionId, turn: &Turn) -> Result<()> {
    if turn.session_id != session_id {
        return Err(AskError::Storage(format!(
            "Turn {} belongs to session {}, not {}",
            turn.turn_id, turn.session_id, session_id
        )));
    }
    Ok(())
}

// =============================================================================
// SQLite implementation
// =============================================================================

/// SQLite-backed session store.
pub struct SqliteSessionStore {
    db: Arc<Database>,
}

impl SqliteSessionStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Open (or create) the session database at `path`.
    pub fn open(path: &std::path::Path) -> Result<Self> {
        Ok(Self::new(Arc::new(Database::new(path)?)))
    }

    pub fn in_memory() -> Result<Self> {
        Ok(Self::new(Arc::new(Database::in_memory()?)))
    }

    fn load_turns(conn: &rusqlite::Connection, session_id: SessionId) -> Result<Vec<Turn>> {
        let mut stmt = conn
            .prepare(
                "SELECT turn_id, timestamp, raw_utterance, resolved_utterance, classification,
                        generated_sql, query_spec, result_summary, chart_hint, failure
                 FROM turns WHERE session_id = ?1 ORDER BY seq ASC",
            )
            .map_err(storage("query session database"))?;

        let rows = stmt
            .query_map(params![session_id.to_string()], |row| {
                Ok(TurnRow {
                    turn_id: row.get(0)?,
                    timestamp: row.get(1)?,
                    raw_utterance: row.get(2)?,
                    resolved_utterance: row.get(3)?,
                    classification: row.get(4)?,
                    generated_sql: row.get(5)?,
                    query_spec: row.get(6)?,
                    result_summary: row.get(7)?,
                    chart_hint: row.get(8)?,
                    failure: row.get(9)?,
                })
            })
            .map_err(storage("query session database"))?;

        let mut turns = Vec::new();
        for row in rows {
            let row = row.map_err(storage("query session database"))?;
            turns.push(row.into_turn(session_id)?);
        }
        Ok(turns)
    }
}

impl SessionStore for SqliteSessionStore {
    fn create_session(
        &self,
        session_id: SessionId,
        database: DatabaseDescriptor,
    ) -> Result<Session> {
        let session = Session::new(session_id, database);
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO sessions (session_id, db_family, db_label, created_at, last_active_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    session.session_id.to_string(),
                    session.database.family,
                    session.database.label,
                    session.created_at.timestamp_millis(),
                    session.last_active_at.timestamp_millis(),
                ],
            )
            .map_err(storage("create session"))?;
            Ok(())
        })?;
        info!(session_id = %session_id, "Session created");
        Ok(session)
    }

    fn append_turn(&self, session_id: SessionId, turn: &Turn) -> Result<()> {
        check_turn_owner(session_id, turn)?;

        let query_spec = turn
            .query_spec
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let result_summary = turn
            .result_summary
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let failure = turn.failure.as_ref().map(serde_json::to_string).transpose()?;

        self.db.in_transaction(|tx| {
            let updated = tx
                .execute(
                    "UPDATE sessions SET last_active_at = MAX(last_active_at, ?2)
                     WHERE session_id = ?1",
                    params![session_id.to_string(), turn.timestamp.timestamp_millis()],
                )
                .map_err(storage("query session database"))?;
            if updated == 0 {
                return Err(AskError::SessionNotFound(session_id.to_string()));
            }

            tx.execute(
                "INSERT INTO turns (turn_id, session_id, seq, timestamp, raw_utterance,
                                    resolved_utterance, classification, generated_sql,
                                    query_spec, result_summary, chart_hint, failure)
                 VALUES (?1, ?2,
                         (SELECT COALESCE(MAX(seq), 0) + 1 FROM turns WHERE session_id = ?2),
                         ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    turn.turn_id.to_string(),
                    session_id.to_string(),
                    turn.timestamp.timestamp_millis(),
                    turn.raw_utterance,
                    turn.resolved_utterance,
                    turn.classification.as_str(),
                    turn.generated_sql,
                    query_spec,
                    result_summary,
                    turn.chart_hint.map(|h| h.as_str()),
                    failure,
                ],
            )
            .map_err(storage("append turn"))?;
            Ok(())
        })?;

        debug!(session_id = %session_id, turn_id = %turn.turn_id, "Turn appended");
        Ok(())
    }

    fn get_session(&self, session_id: SessionId) -> Result<Option<Session>> {
        self.db.with_conn(|conn| {
            let header = conn
                .query_row(
                    "SELECT db_family, db_label, created_at, last_active_at
                     FROM sessions WHERE session_id = ?1",
                    params![session_id.to_string()],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, i64>(2)?,
                            row.get::<_, i64>(3)?,
                        ))
                    },
                )
                .optional()
                .map_err(storage("query session database"))?;

            let Some((family, label, created_at, last_active_at)) = header else {
                return Ok(None);
            };

            let turns = Self::load_turns(conn, session_id)?;
            Ok(Some(Session {
                session_id,
                turns,
                database: DatabaseDescriptor::new(family, label),
                created_at: millis_to_datetime(created_at),
                last_active_at: millis_to_datetime(last_active_at),
            }))
        })
    }

    fn clear(&self, session_id: SessionId) -> Result<bool> {
        let removed = self.db.with_conn(|conn| {
            conn.execute(
                "DELETE FROM sessions WHERE session_id = ?1",
                params![session_id.to_string()],
            )
            .map_err(storage("clear session"))
        })?;
        if removed > 0 {
            info!(session_id = %session_id, "Session cleared");
        }
        Ok(removed > 0)
    }

    fn list_sessions(&self) -> Result<Vec<SessionSummary>> {
        self.db.with_conn(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT s.session_id, s.db_family, s.db_label, s.created_at, s.last_active_at,
                            (SELECT COUNT(*) FROM turns t WHERE t.session_id = s.session_id)
                     FROM sessions s
                     ORDER BY s.last_active_at DESC",
                )
                .map_err(storage("query session database"))?;

            let rows = stmt
                .query_map([], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, i64>(3)?,
                        row.get::<_, i64>(4)?,
                        row.get::<_, i64>(5)?,
                    ))
                })
                .map_err(storage("query session database"))?;

            let mut out = Vec::new();
            for row in rows {
                let (id, family, label, created_at, last_active_at, turn_count) =
                    row.map_err(storage("query session database"))?;
                out.push(SessionSummary {
                    session_id: parse_session_id(&id)?,
                    database: DatabaseDescriptor::new(family, label),
                    turn_count: turn_count as usize,
                    created_at: millis_to_datetime(created_at),
                    last_active_at: millis_to_datetime(last_active_at),
                });
            }
            Ok(out)
        })
    }

    fn purge_inactive(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let removed = self.db.with_conn(|conn| {
            conn.execute(
                "DELETE FROM sessions WHERE last_active_at < ?1",
                params![cutoff.timestamp_millis()],
            )
            .map_err(storage("purge sessions"))
        })?;
        info!(removed, cutoff = %cutoff, "Inactive sessions purged");
        Ok(removed)
    }
}

// =============================================================================
// Row conversion
// =============================================================================

struct TurnRow {
    turn_id: String,
    timestamp: i64,
    raw_utterance: String,
    resolved_utterance: String,
    classification: String,
    generated_sql: Option<String>,
    query_spec: Option<String>,
    result_summary: Option<String>,
    chart_hint: Option<String>,
    failure: Option<String>,
}

impl TurnRow {
    fn into_turn(self, session_id: SessionId) -> Result<Turn> {
        let turn_id = Uuid::parse_str(&self.turn_id)
            .map_err(|e| AskError::Storage(format!("Invalid turn id: {}", e)))?;
        let classification: QueryClass = self
            .classification
            .parse()
            .map_err(AskError::Storage)?;
        let query_spec: Option<ResolvedQuerySpec> = self
            .query_spec
            .as_deref()
            .map(serde_json::from_str)
            .transpose()?;
        let result_summary: Option<ResultSummary> = self
            .result_summary
            .as_deref()
            .map(serde_json::from_str)
            .transpose()?;
        let failure: Option<TurnFailure> =
            self.failure.as_deref().map(serde_json::from_str).transpose()?;

        Ok(Turn {
            turn_id: TurnId(turn_id),
            session_id,
            timestamp: millis_to_datetime(self.timestamp),
            raw_utterance: self.raw_utterance,
            resolved_utterance: self.resolved_utterance,
            classification,
            generated_sql: self.generated_sql,
            query_spec,
            result_summary,
            chart_hint: self.chart_hint.as_deref().and_then(parse_chart_hint),
            failure,
        })
    }
}

fn parse_chart_hint(s: &str) -> Option<ChartHint> {
    match s {
        "bar" => Some(ChartHint::Bar),
        "line" => Some(ChartHint::Line),
        "histogram" => Some(ChartHint::Histogram),
        "table" => Some(ChartHint::Table),
        _ => None,
    }
}

fn parse_session_id(s: &str) -> Result<SessionId> {
    s.parse()
        .map_err(|e| AskError::Storage(format!("Invalid session id: {}", e)))
}

fn millis_to_datetime(millis: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(millis).single().unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use askdb_core::types::{ColumnSummary, ColumnType, FailureKind};
    use chrono::Duration;

    fn make_store() -> SqliteSessionStore {
        SqliteSessionStore::in_memory().unwrap()
    }

    fn make_descriptor() -> DatabaseDescriptor {
        DatabaseDescriptor::new("sqlite", "shop.db")
    }

    fn make_turn(session_id: SessionId, utterance: &str) -> Turn {
        let mut turn = Turn::new(session_id, utterance);
        turn.classification = QueryClass::Data;
        turn.generated_sql = Some("SELECT * FROM sales".to_string());
        turn.query_spec = Some(ResolvedQuerySpec::rows("sales"));
        turn.result_summary = Some(ResultSummary {
            row_count: 3,
            columns: vec![ColumnSummary::new("amount", ColumnType::Float)],
        });
        turn.chart_hint = Some(ChartHint::Table);
        turn
    }

    // ---- Create / get ----

    #[test]
    fn test_create_and_get_empty_session() {
        let store = make_store();
        let id = SessionId::new();
        store.create_session(id, make_descriptor()).unwrap();

        let session = store.get_session(id).unwrap().unwrap();
        assert_eq!(session.session_id, id);
        assert!(session.turns.is_empty());
        assert_eq!(session.database.label, "shop.db");
    }

    #[test]
    fn test_get_unknown_session_is_none() {
        assert!(make_store().get_session(SessionId::new()).unwrap().is_none());
    }

    #[test]
    fn test_create_duplicate_session_fails() {
        let store = make_store();
        let id = SessionId::new();
        store.create_session(id, make_descriptor()).unwrap();
        assert!(matches!(
            store.create_session(id, make_descriptor()),
            Err(AskError::Storage(_))
        ));
    }

    // ---- Append ----

    #[test]
    fn test_append_preserves_order_and_fields() {
        let store = make_store();
        let id = SessionId::new();
        store.create_session(id, make_descriptor()).unwrap();

        let first = make_turn(id, "show sales");
        let mut second = make_turn(id, "what about 2020?");
        second.classification = QueryClass::FollowUp;
        second.failure = Some(TurnFailure::new(FailureKind::Timeout, "query timed out"));
        second.result_summary = None;

        store.append_turn(id, &first).unwrap();
        store.append_turn(id, &second).unwrap();

        let session = store.get_session(id).unwrap().unwrap();
        assert_eq!(session.turns.len(), 2);
        assert_eq!(session.turns[0], first_with_millis(&first));
        assert_eq!(session.turns[1].classification, QueryClass::FollowUp);
        assert_eq!(
            session.turns[1].failure.as_ref().unwrap().kind,
            FailureKind::Timeout
        );
        assert!(session.turns[1].result_summary.is_none());
    }

    /// Stored timestamps keep millisecond precision.
    fn first_with_millis(turn: &Turn) -> Turn {
        let mut t = turn.clone();
        t.timestamp = millis_to_datetime(turn.timestamp.timestamp_millis());
        t
    }

    #[test]
    fn test_append_to_unknown_session_fails() {
        let store = make_store();
        let id = SessionId::new();
        let err = store.append_turn(id, &make_turn(id, "x")).unwrap_err();
        assert!(matches!(err, AskError::SessionNotFound(_)));
    }

    #[test]
    fn test_append_rejects_foreign_turn() {
        let store = make_store();
        let id = SessionId::new();
        store.create_session(id, make_descriptor()).unwrap();
        let other = make_turn(SessionId::new(), "x");
        assert!(store.append_turn(id, &other).is_err());
        assert!(store.get_session(id).unwrap().unwrap().turns.is_empty());
    }

    #[test]
    fn test_append_same_turn_twice_fails() {
        let store = make_store();
        let id = SessionId::new();
        store.create_session(id, make_descriptor()).unwrap();
        let turn = make_turn(id, "x");
        store.append_turn(id, &turn).unwrap();
        assert!(store.append_turn(id, &turn).is_err());
        assert_eq!(store.get_session(id).unwrap().unwrap().turns.len(), 1);
    }

    #[test]
    fn test_append_updates_last_active() {
        let store = make_store();
        let id = SessionId::new();
        let created = store.create_session(id, make_descriptor()).unwrap();
        let mut turn = make_turn(id, "x");
        turn.timestamp = created.created_at + Duration::minutes(5);
        store.append_turn(id, &turn).unwrap();

        let session = store.get_session(id).unwrap().unwrap();
        assert!(session.last_active_at > created.created_at);
    }

    #[test]
    fn test_sessions_are_isolated() {
        let store = make_store();
        let a = SessionId::new();
        let b = SessionId::new();
        store.create_session(a, make_descriptor()).unwrap();
        store.create_session(b, make_descriptor()).unwrap();
        store.append_turn(a, &make_turn(a, "a1")).unwrap();
        store.append_turn(b, &make_turn(b, "b1")).unwrap();
        store.append_turn(a, &make_turn(a, "a2")).unwrap();

        let session_a = store.get_session(a).unwrap().unwrap();
        let raws: Vec<&str> = session_a
            .turns
            .iter()
            .map(|t| t.raw_utterance.as_str())
            .collect();
        assert_eq!(raws, vec!["a1", "a2"]);
        assert_eq!(store.get_session(b).unwrap().unwrap().turns.len(), 1);
    }

    // ---- Clear / list / purge ----

    #[test]
    fn test_clear_removes_session_and_turns() {
        let store = make_store();
        let id = SessionId::new();
        store.create_session(id, make_descriptor()).unwrap();
        store.append_turn(id, &make_turn(id, "x")).unwrap();

        assert!(store.clear(id).unwrap());
        assert!(store.get_session(id).unwrap().is_none());
        assert!(!store.clear(id).unwrap());
    }

    #[test]
    fn test_list_sessions_counts_turns() {
        let store = make_store();
        let a = SessionId::new();
        store.create_session(a, make_descriptor()).unwrap();
        store.append_turn(a, &make_turn(a, "x")).unwrap();
        store.append_turn(a, &make_turn(a, "y")).unwrap();
        store.create_session(SessionId::new(), make_descriptor()).unwrap();

        let sessions = store.list_sessions().unwrap();
        assert_eq!(sessions.len(), 2);
        let entry = sessions.iter().find(|s| s.session_id == a).unwrap();
        assert_eq!(entry.turn_count, 2);
    }

    #[test]
    fn test_purge_inactive_only_removes_old_sessions() {
        let store = make_store();
        let old = SessionId::new();
        let fresh = SessionId::new();
        store.create_session(old, make_descriptor()).unwrap();
        store.create_session(fresh, make_descriptor()).unwrap();

        let mut recent = make_turn(fresh, "x");
        recent.timestamp = Utc::now() + Duration::days(10);
        store.append_turn(fresh, &recent).unwrap();

        let removed = store
            .purge_inactive(Utc::now() + Duration::days(1))
            .unwrap();
        assert_eq!(removed, 1);
        assert!(store.get_session(old).unwrap().is_none());
        assert!(store.get_session(fresh).unwrap().is_some());
    }

    #[test]
    fn test_file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sessions.db");
        let id = SessionId::new();
        {
            let store = SqliteSessionStore::open(&path).unwrap();
            store.create_session(id, make_descriptor()).unwrap();
            store.append_turn(id, &make_turn(id, "persisted")).unwrap();
        }
        let store = SqliteSessionStore::open(&path).unwrap();
        let session = store.get_session(id).unwrap().unwrap();
        assert_eq!(session.turns[0].raw_utterance, "persisted");
    }
}
