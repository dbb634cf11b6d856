//! Registry owning every live session.

use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    },
};

use futures::future::join_all;
use options_gateway_core::{
    Clock, GatewayConfig, SessionConfig, SessionError, SessionId, SessionStatus, SourceFactory,
    UpstreamError,
};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::{Session, SessionSummary, UpstreamConnection};

/// Registry of sessions.
///
/// The map lock is only held for map bookkeeping; connection I/O always
/// happens after it is released. Per-session state has its own locks, so
/// operations on different sessions do not block each other.
pub struct SessionRegistry {
    sessions: RwLock<HashMap<SessionId, Arc<Session>>>,
    factory: Arc<dyn SourceFactory>,
    gateway: GatewayConfig,
    config: SessionConfig,
    clock: Arc<dyn Clock>,
    next_client: AtomicU32,
}

impl SessionRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new(
        config: SessionConfig,
        gateway: GatewayConfig,
        factory: Arc<dyn SourceFactory>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            factory,
            gateway,
            config,
            clock,
            next_client: AtomicU32::new(0),
        }
    }

    #[must_use]
    pub const fn config(&self) -> &SessionConfig {
        &self.config
    }

    #[must_use]
    pub fn clock(&self) -> &dyn Clock {
        self.clock.as_ref()
    }

    /// Create a session bound to a fresh, not yet connected, connection.
    ///
    /// Sessions already past their idle timeout are evicted first and do not
    /// count toward capacity.
    ///
    /// # Errors
    /// Returns `CapacityExceeded` when the active limit is reached.
    pub async fn create(&self) -> Result<Arc<Session>, SessionError> {
        let now = self.clock.now();
        let mut sessions = self.sessions.write().await;

        let stale: Vec<SessionId> = sessions
            .values()
            .filter(|s| s.expire_if_idle(now, self.config.session_timeout))
            .map(|s| s.id())
            .collect();
        let evicted: Vec<Arc<Session>> = stale.iter().filter_map(|id| sessions.remove(id)).collect();

        if sessions.len() >= self.config.max_active_sessions {
            drop(sessions);
            self.release_all(evicted).await;
            tracing::warn!(
                max = self.config.max_active_sessions,
                "Session capacity reached"
            );
            return Err(SessionError::CapacityExceeded {
                max: self.config.max_active_sessions,
            });
        }

        let id = loop {
            let id = Uuid::new_v4();
            if !sessions.contains_key(&id) {
                break id;
            }
        };
        let offset = self.next_client.fetch_add(1, Ordering::SeqCst);
        let params = self
            .gateway
            .connect_params(offset, self.config.reconnect.connect_timeout);
        let connection =
            UpstreamConnection::new(self.factory.create(), params, self.config.reconnect.clone());
        let session = Arc::new(Session::new(id, connection, now));
        sessions.insert(id, Arc::clone(&session));
        let active = sessions.len();
        drop(sessions);

        tracing::info!(session_id = %id, active, "Created session");
        self.release_all(evicted).await;
        Ok(session)
    }

    /// Look up an active session.
    ///
    /// A session found past its idle timeout is expired on the spot.
    ///
    /// # Errors
    /// Returns `SessionNotFound` if absent, closed or expired.
    pub async fn get(&self, id: SessionId) -> Result<Arc<Session>, SessionError> {
        let session = self
            .sessions
            .read()
            .await
            .get(&id)
            .filter(|s| s.status() == SessionStatus::Active)
            .cloned()
            .ok_or_else(|| SessionError::not_found(id))?;

        if session.idle_for(self.clock.now()) > self.config.session_timeout {
            if let Some(expired) = self.expire_idle(id).await {
                tracing::info!(session_id = %id, "Session expired on access");
                self.release_logged(&expired).await;
            }
            return Err(SessionError::not_found(id));
        }
        Ok(session)
    }

    /// Look up a session without any side effect.
    pub async fn peek(&self, id: SessionId) -> Option<Arc<Session>> {
        self.sessions.read().await.get(&id).cloned()
    }

    /// Mark a session as just used.
    ///
    /// # Errors
    /// Returns `SessionNotFound` if absent or no longer active.
    pub async fn touch(&self, id: SessionId) -> Result<(), SessionError> {
        let session = self.get(id).await?;
        if session.touch(self.clock.now()) {
            Ok(())
        } else {
            Err(SessionError::not_found(id))
        }
    }

    /// Close and remove a session. Removing an unknown id is not an error.
    ///
    /// Returns whether the session existed.
    pub async fn remove(&self, id: SessionId) -> bool {
        let removed = self.sessions.write().await.remove(&id);
        match removed {
            Some(session) => {
                self.release_logged(&session).await;
                tracing::info!(session_id = %id, "Removed session");
                true
            }
            None => false,
        }
    }

    /// Expire and remove a session if it is still idle past the timeout.
    ///
    /// The staleness check is repeated under the registry write lock, so a
    /// session touched since the caller's snapshot survives.
    pub(crate) async fn expire_idle(&self, id: SessionId) -> Option<Arc<Session>> {
        let mut sessions = self.sessions.write().await;
        let now = self.clock.now();
        if !sessions
            .get(&id)
            .is_some_and(|s| s.expire_if_idle(now, self.config.session_timeout))
        {
            return None;
        }
        sessions.remove(&id)
    }

    /// Close a session and disconnect its connection.
    ///
    /// # Errors
    /// Returns the disconnect failure; the session is closed regardless.
    pub async fn release(&self, session: &Session) -> Result<(), UpstreamError> {
        match session.close() {
            Some(connection) => connection.disconnect().await,
            None => Ok(()),
        }
    }

    async fn release_logged(&self, session: &Session) {
        if let Err(err) = self.release(session).await {
            tracing::warn!(session_id = %session.id(), error = %err, "Error disconnecting session");
        }
    }

    async fn release_all(&self, sessions: Vec<Arc<Session>>) {
        join_all(sessions.iter().map(|s| self.release_logged(s))).await;
    }

    /// Summaries of live sessions, oldest first.
    pub async fn list(&self) -> Vec<SessionSummary> {
        let now = self.clock.now();
        let timeout = self.config.session_timeout;
        let sessions = self.sessions.read().await;
        let mut live: Vec<&Arc<Session>> = sessions
            .values()
            .filter(|s| s.status() == SessionStatus::Active && s.idle_for(now) <= timeout)
            .collect();
        live.sort_by_key(|s| (s.created_at(), s.id()));
        live.iter().map(|s| s.summary(now)).collect()
    }

    /// All sessions in creation order, for reaping.
    pub async fn snapshot(&self) -> Vec<Arc<Session>> {
        let mut sessions: Vec<Arc<Session>> = self.sessions.read().await.values().cloned().collect();
        sessions.sort_by_key(|s| (s.created_at(), s.id()));
        sessions
    }

    /// Number of live sessions.
    pub async fn active_count(&self) -> usize {
        let now = self.clock.now();
        self.sessions
            .read()
            .await
            .values()
            .filter(|s| s.idle_for(now) <= self.config.session_timeout)
            .count()
    }

    /// Remove every session and disconnect all connections.
    ///
    /// Returns the number of sessions drained.
    pub async fn drain(&self) -> usize {
        let drained: Vec<Arc<Session>> = {
            let mut sessions = self.sessions.write().await;
            sessions.drain().map(|(_, s)| s).collect()
        };
        let count = drained.len();
        self.release_all(drained).await;
        tracing::info!(count, "Drained sessions");
        count
    }
}
