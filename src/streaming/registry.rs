//! Process-wide session registry
//!
//! The only globally mutable collection on the streaming hot path. Keyed by
//! logical channel id, with atomic get-or-create and keyed remove. Sessions
//! remove themselves on death; the registry never reaps on its own.
//!
//! Per-source and per-user active counts are derived from the live map at
//! decision time, so admission always sees registry membership, never a
//! stale side table.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;

use super::session::StreamSession;

#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<i64, Arc<StreamSession>>>,
}

impl SessionRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn get(&self, channel_id: i64) -> Option<Arc<StreamSession>> {
        self.sessions.read().await.get(&channel_id).cloned()
    }

    /// Atomic check-then-insert. The factory runs at most once; concurrent
    /// callers either both observe the existing session or exactly one
    /// creates it. Returns `(session, created)`.
    pub async fn get_or_create<F>(&self, channel_id: i64, factory: F) -> (Arc<StreamSession>, bool)
    where
        F: FnOnce() -> Arc<StreamSession>,
    {
        let mut sessions = self.sessions.write().await;
        if let Some(existing) = sessions.get(&channel_id) {
            return (existing.clone(), false);
        }
        let session = factory();
        sessions.insert(channel_id, session.clone());
        info!(
            channel_id,
            total = sessions.len(),
            "Registered stream session"
        );
        (session, true)
    }

    /// Remove only if the current entry is this exact session instance, so
    /// a dying session can never delete its racing replacement.
    pub async fn remove_if_same(&self, channel_id: i64, session: &Arc<StreamSession>) -> bool {
        let mut sessions = self.sessions.write().await;
        match sessions.get(&channel_id) {
            Some(current) if Arc::ptr_eq(current, session) => {
                sessions.remove(&channel_id);
                info!(
                    channel_id,
                    total = sessions.len(),
                    "Removed stream session"
                );
                true
            }
            _ => false,
        }
    }

    pub async fn active_count_for_source(&self, source_id: i64) -> usize {
        self.sessions
            .read()
            .await
            .values()
            .filter(|s| !s.is_dead() && s.source_id == source_id)
            .count()
    }

    pub async fn active_count_for_user(&self, username: &str) -> usize {
        self.sessions
            .read()
            .await
            .values()
            .filter(|s| !s.is_dead() && s.username.as_deref() == Some(username))
            .count()
    }

    pub async fn snapshot(&self) -> Vec<Arc<StreamSession>> {
        self.sessions.read().await.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    /// Destroy every live session. Used on shutdown and in tests.
    pub async fn shutdown_all(&self) {
        let sessions = self.snapshot().await;
        for session in sessions {
            session.destroy("shutdown").await;
        }
    }
}
