//! Live session table.

use crate::bridge::BridgeOptions;
use crate::error::{ProxyError, Result};
use crate::registry::ServerRegistry;
use crate::session::{Session, SessionClosed, SessionInfo, SessionKey};
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ManagerStats {
    pub live_sessions: usize,
    pub spawned_total: u64,
    pub expired_total: u64,
}

/// Owns every live session, keyed by (container, server, session id).
pub struct SessionManager {
    registry: Arc<dyn ServerRegistry>,
    bridge_options: BridgeOptions,
    sessions: RwLock<HashMap<SessionKey, Arc<Session>>>,
    closed_tx: mpsc::UnboundedSender<SessionClosed>,
    closed_rx: Mutex<Option<mpsc::UnboundedReceiver<SessionClosed>>>,
    spawned_total: AtomicU64,
    expired_total: AtomicU64,
}

impl SessionManager {
    #[must_use]
    pub fn new(registry: Arc<dyn ServerRegistry>, bridge_options: BridgeOptions) -> Self {
        let (closed_tx, closed_rx) = mpsc::unbounded_channel();
        Self {
            registry,
            bridge_options,
            sessions: RwLock::new(HashMap::new()),
            closed_tx,
            closed_rx: Mutex::new(Some(closed_rx)),
            spawned_total: AtomicU64::new(0),
            expired_total: AtomicU64::new(0),
        }
    }

    /// Notices for sessions whose subprocess exited on its own. Only the first call gets them.
    pub fn take_closed_notices(&self) -> Option<mpsc::UnboundedReceiver<SessionClosed>> {
        self.closed_rx.lock().take()
    }

    /// Reuse the live session named by `session_id`, or spawn a new one.
    ///
    /// Unknown, expired and closed ids are silently replaced by a fresh session. Returns
    /// the session and whether it was created by this call.
    pub async fn get_or_create(
        &self,
        container_id: &str,
        server_name: &str,
        session_id: Option<&str>,
    ) -> Result<(Arc<Session>, bool)> {
        if let Some(session_id) = session_id {
            let key = SessionKey::new(container_id, server_name, session_id);
            // Touch under the read lock: a sweep holds the write lock while it decides,
            // so it either ran before this lookup or sees the fresh activity.
            let existing = self.sessions.read().get(&key).map(|session| {
                session.touch();
                session.clone()
            });
            match existing {
                Some(session) if !session.is_closed() => return Ok((session, false)),
                Some(_) => {
                    tracing::info!(session_id, "session subprocess is gone; replacing session");
                    self.expire(&key, "subprocess closed").await;
                }
                None => {
                    tracing::debug!(session_id, "unknown session id; creating a new session");
                }
            }
        }

        let spec = self.registry.lookup(container_id, server_name).await?;
        let key = SessionKey::new(container_id, server_name, mint_session_id());
        let session = Session::start(
            key.clone(),
            &spec,
            &self.bridge_options,
            self.closed_tx.clone(),
        )?;

        self.spawned_total.fetch_add(1, Ordering::Relaxed);
        self.sessions.write().insert(key.clone(), session.clone());
        tracing::info!(
            container_id,
            server_name,
            session_id = %key.session_id,
            pid = session.pid(),
            "session created"
        );
        Ok((session, true))
    }

    #[must_use]
    pub fn get(&self, key: &SessionKey) -> Option<Arc<Session>> {
        self.sessions.read().get(key).cloned()
    }

    pub fn touch(&self, session: &Session) {
        session.touch();
    }

    /// Stop and remove one session. Returns `false` if it was not registered.
    pub async fn expire(&self, key: &SessionKey, reason: &str) -> bool {
        let removed = self.sessions.write().remove(key);
        let Some(session) = removed else {
            return false;
        };
        self.expired_total.fetch_add(1, Ordering::Relaxed);
        tracing::info!(session = %key, reason, "expiring session");
        session.stop(reason).await;
        true
    }

    /// Stop every session of a container. Returns how many were stopped.
    pub async fn expire_all_for(&self, container_id: &str) -> usize {
        self.expire_where(|key, _| key.container_id == container_id, "container destroyed")
            .await
    }

    /// Stop sessions idle for longer than `threshold` with no call in flight.
    pub async fn expire_idle(&self, threshold: Duration) -> usize {
        self.expire_where(
            |_, session| session.in_flight() == 0 && session.idle_for() > threshold,
            "idle timeout",
        )
        .await
    }

    /// Stop sessions whose container the registry no longer knows.
    pub async fn expire_orphans(&self) -> usize {
        let containers: HashSet<String> = self
            .sessions
            .read()
            .keys()
            .map(|key| key.container_id.clone())
            .collect();

        let mut gone = HashSet::new();
        for container_id in containers {
            if !self.registry.contains_container(&container_id).await {
                gone.insert(container_id);
            }
        }
        if gone.is_empty() {
            return 0;
        }
        self.expire_where(|key, _| gone.contains(&key.container_id), "container removed")
            .await
    }

    /// Stop everything. Used on process shutdown.
    pub async fn shutdown_all(&self) {
        let count = self.expire_where(|_, _| true, "proxy shutting down").await;
        if count > 0 {
            tracing::info!(count, "stopped all sessions");
        }
    }

    async fn expire_where<F>(&self, predicate: F, reason: &str) -> usize
    where
        F: Fn(&SessionKey, &Session) -> bool,
    {
        let removed: Vec<(SessionKey, Arc<Session>)> = {
            let mut sessions = self.sessions.write();
            let keys: Vec<SessionKey> = sessions
                .iter()
                .filter_map(|(key, session)| predicate(key, session.as_ref()).then(|| key.clone()))
                .collect();
            keys.into_iter()
                .filter_map(|key| sessions.remove(&key).map(|session| (key, session)))
                .collect()
        };

        let count = removed.len();
        if count == 0 {
            return 0;
        }
        self.expired_total
            .fetch_add(count as u64, Ordering::Relaxed);

        join_all(removed.iter().map(|(key, session)| async move {
            tracing::info!(session = %key, reason, "expiring session");
            session.stop(reason).await;
        }))
        .await;
        count
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }

    #[must_use]
    pub fn snapshot(&self) -> Vec<SessionInfo> {
        let mut infos: Vec<SessionInfo> =
            self.sessions.read().values().map(|s| s.info()).collect();
        infos.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        infos
    }

    #[must_use]
    pub fn stats(&self) -> ManagerStats {
        ManagerStats {
            live_sessions: self.len(),
            spawned_total: self.spawned_total.load(Ordering::Relaxed),
            expired_total: self.expired_total.load(Ordering::Relaxed),
        }
    }

    /// Look up a session for explicit termination.
    pub fn require(&self, key: &SessionKey) -> Result<Arc<Session>> {
        self.get(key)
            .ok_or_else(|| ProxyError::UnknownSession(key.session_id.clone()))
    }
}

fn mint_session_id() -> String {
    Uuid::new_v4().to_string()
}
