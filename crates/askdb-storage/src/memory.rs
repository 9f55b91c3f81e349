//! In-memory session store.
//!
//! Each session sits behind its own mutex, so appends to one session are
//! serialized while different sessions proceed independently. The outer map
//! lock is only held long enough to find or insert a session handle.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Utc};

use askdb_core::error::{AskError, Result};
use askdb_core::types::{DatabaseDescriptor, Session, SessionId, SessionSummary, Turn};

use crate::session_store::{check_turn_owner, SessionStore};

#[derive(Default)]
pub struct InMemorySessionStore {
    sessions: RwLock<HashMap<SessionId, Arc<Mutex<Session>>>>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn handle(&self, session_id: SessionId) -> Result<Option<Arc<Mutex<Session>>>> {
        let map = self
            .sessions
            .read()
            .map_err(|e| AskError::Storage(format!("Session map lock poisoned: {}", e)))?;
        Ok(map.get(&session_id).cloned())
    }
}

fn lock_session(handle: &Mutex<Session>) -> Result<std::sync::MutexGuard<'_, Session>> {
    handle
        .lock()
        .map_err(|e| AskError::Storage(format!("Session lock poisoned: {}", e)))
}

impl SessionStore for InMemorySessionStore {
    fn create_session(
        &self,
        session_id: SessionId,
        database: DatabaseDescriptor,
    ) -> Result<Session> {
        let mut map = self
            .sessions
            .write()
            .map_err(|e| AskError::Storage(format!("Session map lock poisoned: {}", e)))?;
        if map.contains_key(&session_id) {
            return Err(AskError::Storage(format!(
                "Session {} already exists",
                session_id
            )));
        }
        let session = Session::new(session_id, database);
        map.insert(session_id, Arc::new(Mutex::new(session.clone())));
        Ok(session)
    }

    fn append_turn(&self, session_id: SessionId, turn: &Turn) -> Result<()> {
        check_turn_owner(session_id, turn)?;
        let handle = self
            .handle(session_id)?
            .ok_or_else(|| AskError::SessionNotFound(session_id.to_string()))?;
        let mut session = lock_session(&handle)?;
        if session.turns.iter().any(|t| t.turn_id == turn.turn_id) {
            return Err(AskError::Storage(format!(
                "Turn {} already appended",
                turn.turn_id
            )));
        }
        if turn.timestamp > session.last_active_at {
            session.last_active_at = turn.timestamp;
        }
        session.turns.push(turn.clone());
        Ok(())
    }

    fn get_session(&self, session_id: SessionId) -> Result<Option<Session>> {
        match self.handle(session_id)? {
            Some(handle) => Ok(Some(lock_session(&handle)?.clone())),
            None => Ok(None),
        }
    }

    fn clear(&self, session_id: SessionId) -> Result<bool> {
        let mut map = self
            .sessions
            .write()
            .map_err(|e| AskError::Storage(format!("Session map lock poisoned: {}", e)))?;
        Ok(map.remove(&session_id).is_some())
    }

    fn list_sessions(&self) -> Result<Vec<SessionSummary>> {
        let handles: Vec<Arc<Mutex<Session>>> = {
            let map = self
                .sessions
                .read()
                .map_err(|e| AskError::Storage(format!("Session map lock poisoned: {}", e)))?;
            map.values().cloned().collect()
        };

        let mut out = Vec::with_capacity(handles.len());
        for handle in handles {
            let session = lock_session(&handle)?;
            out.push(SessionSummary {
                session_id: session.session_id,
                database: session.database.clone(),
                turn_count: session.turns.len(),
                created_at: session.created_at,
                last_active_at: session.last_active_at,
            });
        }
        out.sort_by(|a, b| b.last_active_at.cmp(&a.last_active_at));
        Ok(out)
    }

    fn purge_inactive(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let mut map = self
            .sessions
            .write()
            .map_err(|e| AskError::Storage(format!("Session map lock poisoned: {}", e)))?;
        let mut stale = Vec::new();
        for (id, handle) in map.iter() {
            if lock_session(handle)?.last_active_at < cutoff {
                stale.push(*id);
            }
        }
        for id in &stale {
            map.remove(id);
        }
        Ok(stale.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use askdb_core::types::QueryClass;
    use chrono::Duration;

    fn make_store_with_session() -> (InMemorySessionStore, SessionId) {
        let store = InMemorySessionStore::new();
        let id = SessionId::new();
        store
            .create_session(id, DatabaseDescriptor::new("sqlite", "mem"))
            .unwrap();
        (store, id)
    }

    #[test]
    fn test_append_and_get() {
        let (store, id) = make_store_with_session();
        let mut turn = Turn::new(id, "show sales");
        turn.classification = QueryClass::Data;
        store.append_turn(id, &turn).unwrap();

        let session = store.get_session(id).unwrap().unwrap();
        assert_eq!(session.turns, vec![turn]);
    }

    #[test]
    fn test_append_unknown_session() {
        let store = InMemorySessionStore::new();
        let id = SessionId::new();
        assert!(matches!(
            store.append_turn(id, &Turn::new(id, "x")),
            Err(AskError::SessionNotFound(_))
        ));
    }

    #[test]
    fn test_duplicate_turn_rejected() {
        let (store, id) = make_store_with_session();
        let turn = Turn::new(id, "x");
        store.append_turn(id, &turn).unwrap();
        assert!(store.append_turn(id, &turn).is_err());
    }

    #[test]
    fn test_clear_and_purge() {
        let (store, id) = make_store_with_session();
        let other = SessionId::new();
        store
            .create_session(other, DatabaseDescriptor::new("sqlite", "mem"))
            .unwrap();

        assert!(store.clear(id).unwrap());
        assert!(store.get_session(id).unwrap().is_none());

        let removed = store.purge_inactive(Utc::now() + Duration::hours(1)).unwrap();
        assert_eq!(removed, 1);
        assert!(store.list_sessions().unwrap().is_empty());
    }

    #[test]
    fn test_concurrent_appends_to_one_session_are_all_kept() {
        let (store, id) = make_store_with_session();
        let store = Arc::new(store);

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    for j in 0..25 {
                        let turn = Turn::new(id, format!("t{i}-{j}"));
                        store.append_turn(id, &turn).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(store.get_session(id).unwrap().unwrap().turns.len(), 200);
    }
}
