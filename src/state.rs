//! Shared application state and the sandbox session registry.

use crate::backend::ContainerHandle;
use crate::sandbox::SandboxManager;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

/// Host ports allocated to a sandbox's services at spawn time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExposedEndpoints {
    pub desktop: Option<u16>,
    pub shell: Option<u16>,
}

/// One live sandbox container.
#[derive(Debug)]
pub struct SandboxSession {
    pub id: String,
    pub challenge_id: String,
    pub spawned_at: DateTime<Utc>,
    pub endpoints: ExposedEndpoints,
    pub handle: ContainerHandle,
    /// Serializes terminate/reset/exec against this sandbox.
    pub op_lock: Mutex<()>,
}

impl SandboxSession {
    pub fn new(
        handle: ContainerHandle,
        challenge_id: impl Into<String>,
        endpoints: ExposedEndpoints,
    ) -> Self {
        Self {
            id: handle.id().to_string(),
            challenge_id: challenge_id.into(),
            spawned_at: Utc::now(),
            endpoints,
            handle,
            op_lock: Mutex::new(()),
        }
    }
}

/// Listing view of a session.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub challenge_id: String,
    pub spawned_at: DateTime<Utc>,
}

/// Thread-safe map of container id to session.
///
/// Cloning shares the same underlying map.
#[derive(Clone, Default)]
pub struct SandboxRegistry {
    sessions: Arc<RwLock<HashMap<String, Arc<SandboxSession>>>>,
}

impl SandboxRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, session: SandboxSession) -> Arc<SandboxSession> {
        let session = Arc::new(session);
        self.sessions
            .write()
            .await
            .insert(session.id.clone(), session.clone());
        session
    }

    pub async fn get(&self, id: &str) -> Option<Arc<SandboxSession>> {
        self.sessions.read().await.get(id).cloned()
    }

    pub async fn contains(&self, id: &str) -> bool {
        self.sessions.read().await.contains_key(id)
    }

    pub async fn remove(&self, id: &str) -> Option<Arc<SandboxSession>> {
        self.sessions.write().await.remove(id)
    }

    pub async fn ids(&self) -> Vec<String> {
        self.sessions.read().await.keys().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    /// Snapshot of all sessions, oldest first.
    pub async fn summaries(&self) -> Vec<SessionSummary> {
        let sessions = self.sessions.read().await;
        let mut list: Vec<SessionSummary> = sessions
            .values()
            .map(|s| SessionSummary {
                challenge_id: s.challenge_id.clone(),
                spawned_at: s.spawned_at,
            })
            .collect();
        list.sort_by_key(|s| s.spawned_at);
        list
    }
}

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<SandboxManager>,
}

impl AppState {
    pub fn new(manager: SandboxManager) -> Self {
        Self {
            manager: Arc::new(manager),
        }
    }
}
