//! Session lifecycle management.
//!
//! [`SessionManager`] is the single authority for creating, looking up, and
//! destroying sessions. One session exists per WebSocket connection; the
//! manager enforces `max_sessions`, sweeps sessions whose client has gone
//! quiet, and guarantees that a destroyed session first cancels whatever
//! process it was running — a dropped connection never leaks a process
//! group.
//!
//! ## Concurrency
//!
//! The session map is an ordered map behind an `RwLock`. Lookups take a read lock;
//! create/remove/sweep take the write lock, and `create` holds it across the
//! limit-check and insert to prevent TOCTOU races.

pub mod runner;
pub mod session;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tracing::info;
use uuid::Uuid;

use crate::proc::ProcState;
pub use session::Session;

/// Manages the pool of active sessions.
///
/// Cloneable — all clones share the same inner `Arc<RwLock<...>>`.
#[derive(Clone)]
pub struct SessionManager {
    sessions: Arc<RwLock<BTreeMap<String, Arc<Session>>>>,
    max_sessions: usize,
}

impl SessionManager {
    pub fn new(max_sessions: usize) -> Self {
        Self {
            sessions: Arc::new(RwLock::new(BTreeMap::new())),
            max_sessions,
        }
    }

    /// Create a session for a new connection. Fails when the pool is full;
    /// the write lock is held through the check-and-insert.
    pub async fn create(&self) -> Result<Arc<Session>, String> {
        let mut sessions = self.sessions.write().await;
        if sessions.len() >= self.max_sessions {
            return Err(format!("Session limit reached (max {})", self.max_sessions));
        }
        let id = Uuid::new_v4().to_string();
        let session = Arc::new(Session::new(id.clone()));
        sessions.insert(id.clone(), Arc::clone(&session));
        info!("Session {id} created, total: {}", sessions.len());
        Ok(session)
    }

    pub async fn get(&self, session_id: &str) -> Option<Arc<Session>> {
        self.sessions.read().await.get(session_id).cloned()
    }

    pub async fn count(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub fn max_sessions(&self) -> usize {
        self.max_sessions
    }

    /// Remove a session (connection closed). Cancels any running process
    /// before the record is freed.
    pub async fn remove(&self, session_id: &str) {
        let removed = self.sessions.write().await.remove(session_id);
        if let Some(session) = removed {
            session.cancel_active().await;
            info!("Session {session_id} destroyed");
        }
    }

    /// Reap sessions idle beyond `idle_timeout` with nothing running. The
    /// protocol loop notices via `Session::closed` and closes the socket;
    /// actual removal happens through the normal disconnect path.
    pub async fn sweep(&self, idle_timeout: Duration) -> Vec<String> {
        let mut reaped = Vec::new();
        let sessions = self.sessions.read().await;
        for (id, session) in sessions.iter() {
            if session.idle_for() > idle_timeout && !session.is_busy().await {
                info!("Session {id} idle for {:?}, reaping", session.idle_for());
                session.closed.notify_one();
                reaped.push(id.clone());
            }
        }
        reaped
    }

    /// Shutdown sweep: SIGTERM every active process group at once, wait up
    /// to 3 s for exits, then SIGKILL stragglers and drop all records.
    pub async fn shutdown_all(&self) {
        let mut sessions = self.sessions.write().await;
        let count = sessions.len();
        if count == 0 {
            return;
        }

        let mut controllers = Vec::new();
        for (id, session) in sessions.iter() {
            if let Some(controller) = session.controller().await {
                controller.term_now();
                info!("Session {id}: SIGTERM sent (shutdown)");
                controllers.push(controller);
            }
            session.closed.notify_one();
        }

        let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
        loop {
            let mut all_exited = true;
            for controller in &controllers {
                if controller.state().await != ProcState::Exited {
                    all_exited = false;
                    break;
                }
            }
            if all_exited || tokio::time::Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        for controller in &controllers {
            if controller.state().await != ProcState::Exited {
                controller.kill_now();
            }
        }

        sessions.clear();
        info!("Shut down {count} session(s)");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_enforces_the_cap() {
        let mgr = SessionManager::new(2);
        let _a = mgr.create().await.unwrap();
        let _b = mgr.create().await.unwrap();
        let err = mgr.create().await.unwrap_err();
        assert!(err.contains("Session limit reached"));
        assert_eq!(mgr.count().await, 2);
    }

    #[tokio::test]
    async fn remove_frees_a_slot() {
        let mgr = SessionManager::new(1);
        let session = mgr.create().await.unwrap();
        assert!(mgr.create().await.is_err());
        mgr.remove(&session.id).await;
        assert!(mgr.create().await.is_ok());
    }

    #[tokio::test]
    async fn session_ids_are_unique() {
        let mgr = SessionManager::new(10);
        let a = mgr.create().await.unwrap();
        let b = mgr.create().await.unwrap();
        assert_ne!(a.id, b.id);
    }

    #[tokio::test]
    async fn sweep_flags_only_idle_sessions() {
        let mgr = SessionManager::new(10);
        let session = mgr.create().await.unwrap();
        // Fresh session — not idle yet.
        assert!(mgr.sweep(Duration::from_secs(60)).await.is_empty());
        // Zero timeout makes everything idle.
        tokio::time::sleep(Duration::from_millis(10)).await;
        let reaped = mgr.sweep(Duration::ZERO).await;
        assert_eq!(reaped, vec![session.id.clone()]);
    }
}
