//! Active relay session tracking, read-only observability.
//!
//! Entries are scoped to the request task that created them, so the table
//! cannot accumulate stale sessions. Correctness never depends on this
//! module; quota enforcement lives in [`crate::quota`].

use std::collections::HashMap;
use std::time::Instant;

use serde::Serialize;
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub id: Uuid,
    pub channel_id: String,
    pub provider_id: String,
    pub started_at: Instant,
}

/// API view of one active session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionView {
    pub id: Uuid,
    pub channel_id: String,
    pub provider_id: String,
    pub elapsed_secs: u64,
}

#[derive(Debug, Default)]
pub struct ActiveSessions {
    sessions: RwLock<HashMap<Uuid, SessionInfo>>,
}

impl ActiveSessions {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn begin(&self, channel_id: &str, provider_id: &str) -> Uuid {
        let id = Uuid::new_v4();
        let info = SessionInfo {
            id,
            channel_id: channel_id.to_string(),
            provider_id: provider_id.to_string(),
            started_at: Instant::now(),
        };
        self.sessions.write().await.insert(id, info);
        id
    }

    pub async fn end(&self, id: Uuid) {
        self.sessions.write().await.remove(&id);
    }

    pub async fn snapshot(&self) -> Vec<SessionView> {
        self.sessions
            .read()
            .await
            .values()
            .map(|s| SessionView {
                id: s.id,
                channel_id: s.channel_id.clone(),
                provider_id: s.provider_id.clone(),
                elapsed_secs: s.started_at.elapsed().as_secs(),
            })
            .collect()
    }

    pub async fn count(&self) -> usize {
        self.sessions.read().await.len()
    }
}
