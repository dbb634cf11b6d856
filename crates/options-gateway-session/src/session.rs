//! Session handle and its summary.

use std::{fmt, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use options_gateway_core::{ConnectionState, SessionId, SessionStatus};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::{sync::MutexGuard, time::Instant};

use crate::UpstreamConnection;

struct Activity {
    status: SessionStatus,
    last_activity: Instant,
}

/// Logical handle binding a client's calls to one upstream connection.
pub struct Session {
    id: SessionId,
    created_at: Instant,
    created_wall: DateTime<Utc>,
    activity: Mutex<Activity>,
    connection: Mutex<Option<Arc<UpstreamConnection>>>,
    serial: tokio::sync::Mutex<()>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

/// Point-in-time view of a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionSummary {
    pub id: SessionId,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub idle_secs: u64,
    pub connection_state: ConnectionState,
}

impl Session {
    pub(crate) fn new(id: SessionId, connection: UpstreamConnection, now: Instant) -> Self {
        Self {
            id,
            created_at: now,
            created_wall: Utc::now(),
            activity: Mutex::new(Activity {
                status: SessionStatus::Active,
                last_activity: now,
            }),
            connection: Mutex::new(Some(Arc::new(connection))),
            serial: tokio::sync::Mutex::new(()),
        }
    }

    #[must_use]
    pub const fn id(&self) -> SessionId {
        self.id
    }

    #[must_use]
    pub const fn created_at(&self) -> Instant {
        self.created_at
    }

    #[must_use]
    pub fn status(&self) -> SessionStatus {
        self.activity.lock().status
    }

    #[must_use]
    pub fn last_activity(&self) -> Instant {
        self.activity.lock().last_activity
    }

    /// Time since the last successful operation.
    #[must_use]
    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_activity())
    }

    /// The session's connection, unless it has been closed.
    #[must_use]
    pub fn connection(&self) -> Option<Arc<UpstreamConnection>> {
        self.connection.lock().clone()
    }

    /// Record activity. Only active sessions are touched, and the timestamp
    /// never moves backwards.
    pub fn touch(&self, now: Instant) -> bool {
        let mut activity = self.activity.lock();
        if activity.status != SessionStatus::Active {
            return false;
        }
        activity.last_activity = activity.last_activity.max(now);
        true
    }

    /// Flip to `Expired` if idle longer than `timeout` as of `now`.
    ///
    /// The idle check and the flip happen under one lock, so a concurrent
    /// `touch` either lands before (and the session survives) or after (and
    /// is ignored).
    pub(crate) fn expire_if_idle(&self, now: Instant, timeout: Duration) -> bool {
        let mut activity = self.activity.lock();
        let idle = now.saturating_duration_since(activity.last_activity);
        if activity.status == SessionStatus::Active && idle > timeout {
            activity.status = SessionStatus::Expired;
            true
        } else {
            false
        }
    }

    /// Mark closed and hand back the connection for release.
    pub(crate) fn close(&self) -> Option<Arc<UpstreamConnection>> {
        {
            let mut activity = self.activity.lock();
            if activity.status.can_transition_to(SessionStatus::Closed) {
                activity.status = SessionStatus::Closed;
            }
        }
        self.connection.lock().take()
    }

    /// Serialize operations on this session.
    pub(crate) async fn serialize(&self) -> MutexGuard<'_, ()> {
        self.serial.lock().await
    }

    /// Snapshot for stats.
    #[must_use]
    pub fn summary(&self, now: Instant) -> SessionSummary {
        let (status, last_activity) = {
            let activity = self.activity.lock();
            (activity.status, activity.last_activity)
        };
        let idle = now.saturating_duration_since(last_activity);
        let idle_wall = chrono::Duration::from_std(idle).unwrap_or_else(|_| chrono::Duration::zero());

        SessionSummary {
            id: self.id,
            status,
            created_at: self.created_wall,
            last_activity_at: Utc::now() - idle_wall,
            idle_secs: idle.as_secs(),
            connection_state: self
                .connection()
                .map_or(ConnectionState::Disconnected, |c| c.state()),
        }
    }
}
