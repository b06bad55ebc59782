//! Session registry with durable resume records
//!
//! Maps external session ids to live sessions and to the backend-native id
//! used to resume them. Every mutation of the records is written through to
//! the [`SessionStore`].

mod store;

pub use store::{RecordMap, STORE_FILE, SessionStore};

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::approval::{ApprovalCoordinator, SessionLookup};
use crate::session::AgentSession;
use crate::types::identifiers::{RunnerId, SessionId};
use crate::types::session::SessionRecord;

/// Default age after which an inactive record is purged
pub const DEFAULT_SESSION_MAX_AGE: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Live sessions plus their durable records
pub struct SessionRegistry {
    live: HashMap<SessionId, Arc<dyn AgentSession>>,
    records: RecordMap,
    store: SessionStore,
    max_age: Duration,
}

impl std::fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("live", &self.live.keys().collect::<Vec<_>>())
            .field("records", &self.records.len())
            .field("store", &self.store)
            .finish()
    }
}

impl SessionRegistry {
    /// Open the registry, loading whatever the store holds
    #[must_use]
    pub fn open(store: SessionStore, max_age: Duration) -> Self {
        let records = store.load();
        log::info!(
            "Loaded {} session record(s) from {}",
            records.len(),
            store.path().display()
        );
        Self {
            live: HashMap::new(),
            records,
            store,
            max_age,
        }
    }

    /// Backend id to resume `session_id` with
    ///
    /// A stored backend id always wins over `requested`, since the backend
    /// may have moved on without the controller knowing.
    #[must_use]
    pub fn resolve_resume_id(&self, session_id: &SessionId, requested: Option<&str>) -> Option<String> {
        let stored = self
            .records
            .get(session_id)
            .and_then(|r| r.backend_session_id.clone());
        if let (Some(stored), Some(requested)) = (&stored, requested)
            && stored != requested
        {
            log::info!(
                "Session {session_id}: resuming stored backend id {stored} instead of requested {requested}"
            );
        }
        stored.or_else(|| requested.map(str::to_string))
    }

    /// Register a started session
    pub fn insert(&mut self, session: Arc<dyn AgentSession>, mut record: SessionRecord) {
        let session_id = session.session_id().clone();
        if let Some(existing) = self.records.get(&session_id) {
            record.created_at = existing.created_at;
            if record.backend_session_id.is_none() {
                record.backend_session_id.clone_from(&existing.backend_session_id);
            }
        }
        self.live.insert(session_id.clone(), session);
        self.records.insert(session_id, record);
        self.persist();
    }

    /// Live session for `session_id`
    #[must_use]
    pub fn get(&self, session_id: &SessionId) -> Option<Arc<dyn AgentSession>> {
        self.live.get(session_id).cloned()
    }

    /// Durable record for `session_id`
    #[must_use]
    pub fn record(&self, session_id: &SessionId) -> Option<&SessionRecord> {
        self.records.get(session_id)
    }

    /// All durable records
    #[must_use]
    pub const fn records(&self) -> &RecordMap {
        &self.records
    }

    /// Ids of live sessions
    #[must_use]
    pub fn live_ids(&self) -> Vec<SessionId> {
        self.live.keys().cloned().collect()
    }

    /// Number of live sessions
    #[must_use]
    pub fn len(&self) -> usize {
        self.live.len()
    }

    /// Whether no session is live
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }

    /// Record activity on a session
    pub fn touch(&mut self, session_id: &SessionId) {
        self.touch_at(session_id, Utc::now());
    }

    /// Record activity on a session at `now`
    pub fn touch_at(&mut self, session_id: &SessionId, now: DateTime<Utc>) {
        if let Some(record) = self.records.get_mut(session_id) {
            record.last_activity_at = now;
            self.persist();
        }
    }

    /// Store the backend-native id learned from a running session
    pub fn set_backend_session_id(&mut self, session_id: &SessionId, backend_session_id: String) {
        let Some(record) = self.records.get_mut(session_id) else {
            return;
        };
        if record.backend_session_id.as_deref() == Some(backend_session_id.as_str()) {
            return;
        }
        record.backend_session_id = Some(backend_session_id);
        record.last_activity_at = Utc::now();
        self.persist();
    }

    /// End a session: close it, drop its record and its pending approvals
    ///
    /// Returns `false` if nothing was known about the session.
    pub async fn end_session(
        &mut self,
        session_id: &SessionId,
        approvals: &mut ApprovalCoordinator,
    ) -> bool {
        let live = self.live.remove(session_id);
        let record = self.records.remove(session_id);
        let dropped = approvals.remove_for_session(session_id);
        if !dropped.is_empty() {
            log::info!(
                "Session {session_id} ended with {} pending approval(s) dropped",
                dropped.len()
            );
        }
        if record.is_some() {
            self.persist();
        }

        if let Some(session) = &live
            && let Err(e) = session.close().await
        {
            log::warn!("Failed to close session {session_id}: {e}");
        }
        live.is_some() || record.is_some()
    }

    /// Forget a live session whose backend exited, keeping its record
    pub fn detach(&mut self, session_id: &SessionId) -> Option<Arc<dyn AgentSession>> {
        self.live.remove(session_id)
    }

    /// Purge records inactive for longer than the max age
    ///
    /// Records of live sessions are kept. Returns the purged ids.
    pub fn sweep_stale(&mut self) -> Vec<SessionId> {
        self.sweep_stale_at(Utc::now())
    }

    /// [`sweep_stale`](Self::sweep_stale) as of `now`
    pub fn sweep_stale_at(&mut self, now: DateTime<Utc>) -> Vec<SessionId> {
        let Ok(max_age) = chrono::Duration::from_std(self.max_age) else {
            return Vec::new();
        };
        let stale: Vec<SessionId> = self
            .records
            .iter()
            .filter(|(id, r)| r.last_activity_at < now - max_age && !self.live.contains_key(*id))
            .map(|(id, _)| id.clone())
            .collect();

        if !stale.is_empty() {
            for id in &stale {
                self.records.remove(id);
            }
            log::info!("Purged {} stale session record(s)", stale.len());
            self.persist();
        }
        stale
    }

    /// Take every live session, e.g. for shutdown
    pub fn drain_live(&mut self) -> Vec<Arc<dyn AgentSession>> {
        self.live.drain().map(|(_, session)| session).collect()
    }

    fn persist(&self) {
        if let Err(e) = self.store.save(&self.records) {
            log::error!("Failed to persist session registry: {e}");
        }
    }
}

impl SessionLookup for SessionRegistry {
    fn runner_for_session(&self, session_id: &SessionId) -> Option<RunnerId> {
        self.records
            .get(session_id)
            .and_then(|record| record.runner_id.clone())
    }
}
