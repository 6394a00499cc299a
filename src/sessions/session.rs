//! Per-connection session record.
//!
//! A [`Session`] is bound to exactly one WebSocket connection and owns at
//! most one running process at a time. The record itself is small — the
//! execution driver holds the heavy state — but it is the rendezvous point
//! between the protocol loop (which dispatches `control`), the driver (which
//! clears the active slot on completion), and the reaper (which closes idle
//! connections).

use std::sync::Mutex as StdMutex;
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, Notify};

use crate::proc::GroupController;

/// One WebSocket connection's server-side state.
#[derive(Debug)]
pub struct Session {
    pub id: String,
    pub created_at: Instant,
    /// Last request (or connect) time, for the idle reaper.
    last_activity: StdMutex<Instant>,
    /// Controller of the currently running execution, if any.
    active: Mutex<Option<GroupController>>,
    /// Fired by the reaper or shutdown to make the protocol loop close the
    /// connection.
    pub closed: Notify,
}

impl Session {
    pub fn new(id: String) -> Self {
        Self {
            id,
            created_at: Instant::now(),
            last_activity: StdMutex::new(Instant::now()),
            active: Mutex::new(None),
            closed: Notify::new(),
        }
    }

    /// Record client activity.
    pub fn touch(&self) {
        if let Ok(mut last) = self.last_activity.lock() {
            *last = Instant::now();
        }
    }

    /// Time since the last client request.
    pub fn idle_for(&self) -> Duration {
        self.last_activity
            .lock()
            .map_or(Duration::ZERO, |last| last.elapsed())
    }

    /// Exclusive access to the active-execution slot. The execute path holds
    /// this across the busy-check and spawn so two concurrent `execute`
    /// requests cannot both win.
    pub async fn active_slot(&self) -> tokio::sync::MutexGuard<'_, Option<GroupController>> {
        self.active.lock().await
    }

    /// Clone of the active execution's controller, if one is running.
    pub async fn controller(&self) -> Option<GroupController> {
        self.active.lock().await.clone()
    }

    /// Whether an execution is currently active.
    pub async fn is_busy(&self) -> bool {
        self.active.lock().await.is_some()
    }

    /// Clear the active slot. Called by the driver after the terminal
    /// notification.
    pub async fn finish_execution(&self) {
        *self.active.lock().await = None;
    }

    /// Cancel any running execution. Used on disconnect, reap, and shutdown;
    /// errors are ignored because the process may already be gone.
    pub async fn cancel_active(&self) {
        if let Some(controller) = self.controller().await {
            let _ = controller.apply(crate::proc::ControlKind::Cancel).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fresh_session_is_idle_and_not_busy() {
        let session = Session::new("s1".to_string());
        assert!(!session.is_busy().await);
        assert!(session.idle_for() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn active_slot_gates_busy_state() {
        let session = Session::new("s1".to_string());
        {
            let mut slot = session.active_slot().await;
            assert!(slot.is_none());
            *slot = Some(GroupController::new(0, Duration::from_secs(1)));
        }
        assert!(session.is_busy().await);
        session.finish_execution().await;
        assert!(!session.is_busy().await);
    }

    #[tokio::test]
    async fn cancel_active_without_execution_is_harmless() {
        let session = Session::new("s1".to_string());
        session.cancel_active().await;
    }
}
