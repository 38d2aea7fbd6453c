//! Shared application state and the session registry.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tracing::debug;

use crate::sandbox::Sandbox;

/// A live session: its directory plus the lock serializing calls against it.
#[derive(Debug)]
pub struct Session {
    pub id: String,
    pub root: PathBuf,
    pub created_at: Instant,
    pub last_used: Instant,
    lock: Arc<Mutex<()>>,
}

impl Session {
    fn new(id: &str, root: PathBuf) -> Self {
        let now = Instant::now();
        Self {
            id: id.to_string(),
            root,
            created_at: now,
            last_used: now,
            lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn is_busy(&self) -> bool {
        self.lock.try_lock().is_err()
    }

    fn info(&self, now: Instant) -> SessionInfo {
        SessionInfo {
            id: self.id.clone(),
            age_secs: now.duration_since(self.created_at).as_secs(),
            idle_secs: now.duration_since(self.last_used).as_secs(),
            busy: self.is_busy(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionInfo {
    pub id: String,
    pub age_secs: u64,
    pub idle_secs: u64,
    pub busy: bool,
}

/// In-memory session table. Only the directories persist across restarts;
/// [`SessionRegistry::register`] re-adopts them at startup.
#[derive(Debug, Clone, Default)]
pub struct SessionRegistry {
    sessions: Arc<RwLock<HashMap<String, Session>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the session's lock, registering the session on first use.
    /// The guard is held for the whole call against the session.
    ///
    /// A session removed while this call waited leaves the waiter holding a
    /// lock nobody else will find, so the call starts over on the current
    /// entry (re-registering the session if needed).
    pub async fn acquire(&self, id: &str, root: PathBuf) -> OwnedMutexGuard<()> {
        loop {
            let lock = {
                let mut sessions = self.sessions.write().await;
                let session = sessions
                    .entry(id.to_string())
                    .or_insert_with(|| Session::new(id, root.clone()));
                session.last_used = Instant::now();
                session.lock.clone()
            };
            let guard = lock.clone().lock_owned().await;

            let mut sessions = self.sessions.write().await;
            match sessions.get_mut(id) {
                Some(session) if Arc::ptr_eq(&session.lock, &lock) => {
                    session.last_used = Instant::now();
                    return guard;
                }
                _ => debug!(session_id = id, "Session replaced while waiting, retrying"),
            }
        }
    }

    /// Record a session without locking it. Existing entries are left alone.
    pub async fn register(&self, id: &str, root: PathBuf) {
        self.sessions
            .write()
            .await
            .entry(id.to_string())
            .or_insert_with(|| Session::new(id, root));
    }

    pub async fn touch(&self, id: &str) {
        if let Some(session) = self.sessions.write().await.get_mut(id) {
            session.last_used = Instant::now();
        }
    }

    pub async fn root(&self, id: &str) -> Option<PathBuf> {
        self.sessions.read().await.get(id).map(|s| s.root.clone())
    }

    pub async fn get(&self, id: &str) -> Option<SessionInfo> {
        let now = Instant::now();
        self.sessions.read().await.get(id).map(|s| s.info(now))
    }

    pub async fn list(&self) -> Vec<SessionInfo> {
        let now = Instant::now();
        let mut list: Vec<SessionInfo> = self
            .sessions
            .read()
            .await
            .values()
            .map(|s| s.info(now))
            .collect();
        list.sort_by(|a, b| a.id.cmp(&b.id));
        list
    }

    /// Wait for in-flight calls on the session, then drop it from the table.
    /// The returned guard keeps new calls that already hold the old lock out
    /// while the caller deletes the directory.
    pub async fn remove(&self, id: &str) -> Option<(PathBuf, OwnedMutexGuard<()>)> {
        let lock = self.sessions.read().await.get(id)?.lock.clone();
        let guard = lock.lock_owned().await;
        let session = self.sessions.write().await.remove(id)?;
        Some((session.root, guard))
    }

    /// Remove and return sessions idle for longer than `ttl`. Busy sessions
    /// are skipped.
    pub async fn take_expired(&self, ttl: Duration) -> Vec<(String, PathBuf, OwnedMutexGuard<()>)> {
        let mut sessions = self.sessions.write().await;
        let now = Instant::now();

        let expired: Vec<String> = sessions
            .iter()
            .filter(|(_, s)| now.duration_since(s.last_used) > ttl)
            .map(|(id, _)| id.clone())
            .collect();

        let mut taken = Vec::new();
        for id in expired {
            let Some(session) = sessions.get(&id) else { continue };
            let Ok(guard) = session.lock.clone().try_lock_owned() else {
                continue;
            };
            if let Some(session) = sessions.remove(&id) {
                taken.push((id, session.root, guard));
            }
        }
        taken
    }
}

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub sandbox: Arc<Sandbox>,
}

impl AppState {
    pub fn new(sandbox: Sandbox) -> Self {
        Self {
            sandbox: Arc::new(sandbox),
        }
    }
}
