//! Registry of live terminal sessions and the heartbeat supervisor.
//!
//! Each connection task owns its [`Session`](session::Session) outright. The
//! [`SessionRegistry`] only holds what other tasks need to reach it: a
//! liveness flag and a control channel. It enforces `max_sessions`, drives
//! the heartbeat, and signals every session on shutdown.
//!
//! ## Heartbeat
//!
//! Every tick, a session whose liveness flag is still `false` (no pong since
//! the previous tick) is evicted; every other session has its flag cleared
//! and is sent a probe. A pong sets the flag again. A peer that never answers
//! is therefore evicted within two ticks of its last pong.
//!
//! ## Concurrency
//!
//! The map is behind an `RwLock`. `register` holds the write lock across the
//! limit check and insert so concurrent connects cannot overshoot the limit.

pub mod coalescer;
pub mod rate;
pub mod session;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::RegistryError;
use crate::util::short_id;

/// Pending control requests per session.
const CONTROL_QUEUE: usize = 8;

/// How long `shutdown` waits for sessions to tear down.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(3);

/// Requests from the registry to a connection task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionControl {
    /// Send a liveness probe (WebSocket ping).
    Probe,
    /// No probe was acknowledged; drop the transport without a close frame.
    Evict,
    /// The server is stopping; close with a normal close frame.
    Shutdown,
}

/// What a connection task gets back from [`SessionRegistry::register`].
pub struct Registration {
    /// Set to `true` whenever the peer acknowledges a probe.
    pub liveness: Arc<AtomicBool>,
    pub control: mpsc::Receiver<SessionControl>,
}

struct RegistryEntry {
    liveness: Arc<AtomicBool>,
    control: mpsc::Sender<SessionControl>,
}

/// Cloneable handle; all clones share one map.
#[derive(Clone)]
pub struct SessionRegistry {
    sessions: Arc<RwLock<HashMap<String, RegistryEntry>>>,
    max_sessions: usize,
}

impl SessionRegistry {
    pub fn new(max_sessions: usize) -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            max_sessions,
        }
    }

    /// Admit a session. Fails when `max_sessions` are already live.
    pub async fn register(&self, session_id: &str) -> Result<Registration, RegistryError> {
        let mut sessions = self.sessions.write().await;
        if sessions.len() >= self.max_sessions {
            return Err(RegistryError::Full(sessions.len()));
        }
        let liveness = Arc::new(AtomicBool::new(true));
        let (tx, rx) = mpsc::channel(CONTROL_QUEUE);
        sessions.insert(
            session_id.to_string(),
            RegistryEntry {
                liveness: Arc::clone(&liveness),
                control: tx,
            },
        );
        info!(
            session_id = %short_id(session_id),
            "Session registered, active: {}",
            sessions.len()
        );
        Ok(Registration {
            liveness,
            control: rx,
        })
    }

    pub async fn remove(&self, session_id: &str) -> bool {
        let mut sessions = self.sessions.write().await;
        let removed = sessions.remove(session_id).is_some();
        if removed {
            info!(
                session_id = %short_id(session_id),
                "Session removed, active: {}",
                sessions.len()
            );
        }
        removed
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    /// One supervisor pass. Returns the ids of evicted sessions.
    pub async fn heartbeat_tick(&self) -> Vec<String> {
        let mut sessions = self.sessions.write().await;
        let mut evicted = Vec::new();
        let mut gone = Vec::new();
        for (id, entry) in sessions.iter() {
            let was_alive = entry.liveness.swap(false, Ordering::SeqCst);
            let request = if was_alive {
                SessionControl::Probe
            } else {
                SessionControl::Evict
            };
            match entry.control.try_send(request) {
                Ok(()) if request == SessionControl::Evict => {
                    warn!(session_id = %short_id(id), "No pong since last heartbeat, evicting");
                    evicted.push(id.clone());
                }
                Ok(()) => {}
                // A busy task still holds its receiver; it gets the next tick.
                Err(mpsc::error::TrySendError::Full(_)) => {
                    debug!(session_id = %short_id(id), "Control queue full, skipping");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => gone.push(id.clone()),
            }
        }
        // Tasks that exited without deregistering.
        for id in gone {
            sessions.remove(&id);
        }
        evicted
    }

    /// Run [`heartbeat_tick`](Self::heartbeat_tick) every `period`.
    pub fn spawn_heartbeat(&self, period: Duration) -> JoinHandle<()> {
        let registry = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            // The first tick completes immediately; skip it so new sessions
            // get a full period before their first probe.
            interval.tick().await;
            loop {
                interval.tick().await;
                registry.heartbeat_tick().await;
            }
        })
    }

    /// Ask every session to close, then wait up to 3 s for them to finish.
    pub async fn shutdown(&self) {
        let count = {
            let sessions = self.sessions.read().await;
            for entry in sessions.values() {
                let _ = entry.control.try_send(SessionControl::Shutdown);
            }
            sessions.len()
        };
        if count == 0 {
            return;
        }
        info!("Closing {count} session(s)");

        let deadline = tokio::time::Instant::now() + SHUTDOWN_GRACE;
        while tokio::time::Instant::now() < deadline {
            if self.is_empty().await {
                info!("All sessions closed");
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        let remaining = self.len().await;
        warn!("{remaining} session(s) still open after shutdown grace period");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_register_enforces_limit() {
        let registry = SessionRegistry::new(2);
        let _a = registry.register("a").await.unwrap();
        let _b = registry.register("b").await.unwrap();
        let err = registry.register("c").await.err().unwrap();
        assert_eq!(err, RegistryError::Full(2));
        assert_eq!(err.code(), "SESSION_LIMIT");

        assert!(registry.remove("a").await);
        assert!(!registry.remove("a").await);
        assert!(registry.register("c").await.is_ok());
        assert_eq!(registry.len().await, 2);
    }

    #[tokio::test]
    async fn test_heartbeat_probes_then_evicts_silent_session() {
        let registry = SessionRegistry::new(4);
        let mut reg = registry.register("silent").await.unwrap();

        assert!(registry.heartbeat_tick().await.is_empty());
        assert_eq!(reg.control.try_recv().unwrap(), SessionControl::Probe);
        assert!(!reg.liveness.load(Ordering::SeqCst));

        // No pong arrived before the next tick.
        assert_eq!(registry.heartbeat_tick().await, vec!["silent".to_string()]);
        assert_eq!(reg.control.try_recv().unwrap(), SessionControl::Evict);
    }

    #[tokio::test]
    async fn test_pong_keeps_session_alive() {
        let registry = SessionRegistry::new(4);
        let mut reg = registry.register("chatty").await.unwrap();
        for _ in 0..3 {
            assert!(registry.heartbeat_tick().await.is_empty());
            assert_eq!(reg.control.try_recv().unwrap(), SessionControl::Probe);
            reg.liveness.store(true, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_full_control_queue_defers_eviction() {
        let registry = SessionRegistry::new(4);
        let mut reg = registry.register("busy").await.unwrap();
        for _ in 0..CONTROL_QUEUE {
            reg.liveness.store(true, Ordering::SeqCst);
            assert!(registry.heartbeat_tick().await.is_empty());
        }
        // Eviction is due but the queue has no room for it.
        assert!(registry.heartbeat_tick().await.is_empty());

        assert_eq!(reg.control.try_recv().unwrap(), SessionControl::Probe);
        assert_eq!(registry.heartbeat_tick().await, vec!["busy".to_string()]);
    }

    #[tokio::test]
    async fn test_heartbeat_drops_abandoned_entries() {
        let registry = SessionRegistry::new(4);
        drop(registry.register("gone").await.unwrap());
        registry.heartbeat_tick().await;
        assert!(registry.is_empty().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_waits_for_sessions() {
        let registry = SessionRegistry::new(4);
        let mut reg = registry.register("s1").await.unwrap();
        let task_registry = registry.clone();
        let task = tokio::spawn(async move {
            if reg.control.recv().await == Some(SessionControl::Shutdown) {
                tokio::time::sleep(Duration::from_millis(200)).await;
                task_registry.remove("s1").await;
            }
        });
        registry.shutdown().await;
        assert!(registry.is_empty().await);
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_gives_up_after_grace() {
        let registry = SessionRegistry::new(4);
        let _stuck = registry.register("stuck").await.unwrap();
        let start = tokio::time::Instant::now();
        registry.shutdown().await;
        assert!(start.elapsed() >= SHUTDOWN_GRACE);
        assert_eq!(registry.len().await, 1);
    }
}
