//! Outstanding approval tracking across reconnects and restarts

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::time::Duration;

use crate::registry::SessionRegistry;
use crate::types::approval::{ApprovalAnswer, ApprovalPrompt, PendingApproval};
use crate::types::identifiers::{RequestId, RunnerId, SessionId};

use super::ApprovalSink;
use super::lock::{ClaimOutcome, ReissueLock};
use super::routing::{RouteTarget, SessionLookup, route};

/// Default time an approval waits for a decision
pub const DEFAULT_APPROVAL_TTL: Duration = Duration::from_secs(30 * 60);

/// Default reissue dedup window
pub const DEFAULT_REISSUE_COOLDOWN: Duration = Duration::from_secs(5);

/// Why approvals are being resent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReissueReason {
    /// The controller channel came back
    Reconnect,
    /// The controller asked for a permission sync
    SyncRequest,
    /// An operator asked for a resend
    Manual,
}

impl ReissueReason {
    /// Stable name used in lock keys and logs
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Reconnect => "reconnect",
            Self::SyncRequest => "sync_request",
            Self::Manual => "manual",
        }
    }
}

/// Result of resending one approval
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReissueOutcome {
    /// Delivered to this many runners
    Sent(usize),
    /// Collapsed into a reissue that already happened within the cooldown
    Deduplicated,
    /// No connected runner accepted the approval
    Undelivered,
    /// The approval is unknown or expired
    NotFound,
}

/// Result of applying a controller decision
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecisionOutcome {
    /// The decision reached the owning session
    Applied {
        /// Session the decision was applied to
        session_id: SessionId,
    },
    /// The approval is unknown, expired or its session is gone
    Expired,
}

/// Owner of every pending approval on this runner
#[derive(Debug)]
pub struct ApprovalCoordinator {
    pending: HashMap<RequestId, PendingApproval>,
    // Pruned on access but not yet handed to the runner
    expired: Vec<PendingApproval>,
    channel_runners: HashMap<String, RunnerId>,
    lock: ReissueLock,
    ttl: Duration,
}

impl ApprovalCoordinator {
    /// Create a coordinator with the given reissue lock and TTL
    #[must_use]
    pub fn new(lock: ReissueLock, ttl: Duration) -> Self {
        Self {
            pending: HashMap::new(),
            expired: Vec::new(),
            channel_runners: HashMap::new(),
            lock,
            ttl,
        }
    }

    /// Reissue lock namespace
    #[must_use]
    pub const fn lock(&self) -> &ReissueLock {
        &self.lock
    }

    /// Remember which runner serves a chat channel or thread
    pub fn note_channel(&mut self, channel: impl Into<String>, runner_id: RunnerId) {
        self.channel_runners.insert(channel.into(), runner_id);
    }

    /// Number of pending approvals (expired entries included until pruned)
    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Whether nothing is pending
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Look up a live approval
    pub fn get(&mut self, request_id: &RequestId) -> Option<&PendingApproval> {
        self.get_at(request_id, Utc::now())
    }

    /// Look up a live approval as of `now`
    pub fn get_at(&mut self, request_id: &RequestId, now: DateTime<Utc>) -> Option<&PendingApproval> {
        self.expire_at(now);
        self.pending.get(request_id)
    }

    /// Live approvals of one session
    pub fn pending_for_session(&mut self, session_id: &SessionId) -> Vec<PendingApproval> {
        self.expire_at(Utc::now());
        self.pending
            .values()
            .filter(|p| &p.session_id == session_id)
            .cloned()
            .collect()
    }

    /// Track a freshly raised prompt and deliver it
    ///
    /// Raising an id that is already pending refreshes the prompt but keeps
    /// its original `first_seen_at`.
    pub fn raise(
        &mut self,
        prompt: ApprovalPrompt,
        session_id: SessionId,
        runner_id: Option<RunnerId>,
        origin_channel: Option<String>,
        sink: &dyn ApprovalSink,
        sessions: &dyn SessionLookup,
    ) -> usize {
        self.raise_at(prompt, session_id, runner_id, origin_channel, sink, sessions, Utc::now())
    }

    /// [`raise`](Self::raise) as of `now`
    #[allow(clippy::too_many_arguments)]
    pub fn raise_at(
        &mut self,
        prompt: ApprovalPrompt,
        session_id: SessionId,
        runner_id: Option<RunnerId>,
        origin_channel: Option<String>,
        sink: &dyn ApprovalSink,
        sessions: &dyn SessionLookup,
        now: DateTime<Utc>,
    ) -> usize {
        self.expire_at(now);

        let mut entry =
            PendingApproval::from_prompt(prompt, session_id, runner_id, origin_channel, now);
        if let Some(existing) = self.pending.get(&entry.request_id) {
            entry.first_seen_at = existing.first_seen_at;
            entry.resend_count = existing.resend_count;
        }

        let delivered = self.deliver(&entry, None, sink, sessions);
        if delivered == 0 {
            log::warn!(
                "Approval {} for session {} not delivered; it will be resent on reconnect",
                entry.request_id,
                entry.session_id
            );
        }
        self.pending.insert(entry.request_id.clone(), entry);
        delivered
    }

    /// Resend one approval, deduplicated per (request id, reason)
    pub fn reissue(
        &mut self,
        request_id: &RequestId,
        reason: ReissueReason,
        explicit: Option<&RunnerId>,
        sink: &dyn ApprovalSink,
        sessions: &dyn SessionLookup,
    ) -> ReissueOutcome {
        self.reissue_at(request_id, reason, explicit, sink, sessions, Utc::now())
    }

    /// [`reissue`](Self::reissue) as of `now`
    pub fn reissue_at(
        &mut self,
        request_id: &RequestId,
        reason: ReissueReason,
        explicit: Option<&RunnerId>,
        sink: &dyn ApprovalSink,
        sessions: &dyn SessionLookup,
        now: DateTime<Utc>,
    ) -> ReissueOutcome {
        self.expire_at(now);
        let Some(entry) = self.pending.get(request_id).cloned() else {
            return ReissueOutcome::NotFound;
        };

        let key = format!("{request_id}__{}", reason.as_str());
        match self.lock.try_claim_at(&key, now) {
            ClaimOutcome::Claimed => {}
            ClaimOutcome::Held => {
                log::debug!("Reissue of {request_id} ({}) already done", reason.as_str());
                return ReissueOutcome::Deduplicated;
            }
            ClaimOutcome::FailedOpen => return ReissueOutcome::Deduplicated,
        }

        let delivered = self.deliver(&entry, explicit, sink, sessions);
        if delivered == 0 {
            return ReissueOutcome::Undelivered;
        }
        if let Some(entry) = self.pending.get_mut(request_id) {
            entry.last_sent_at = now;
            entry.resend_count += 1;
        }
        ReissueOutcome::Sent(delivered)
    }

    /// Resend every live approval, e.g. after a reconnect
    pub fn reissue_all(
        &mut self,
        reason: ReissueReason,
        explicit: Option<&RunnerId>,
        sink: &dyn ApprovalSink,
        sessions: &dyn SessionLookup,
    ) -> Vec<(RequestId, ReissueOutcome)> {
        self.reissue_all_at(reason, explicit, sink, sessions, Utc::now())
    }

    /// [`reissue_all`](Self::reissue_all) as of `now`
    pub fn reissue_all_at(
        &mut self,
        reason: ReissueReason,
        explicit: Option<&RunnerId>,
        sink: &dyn ApprovalSink,
        sessions: &dyn SessionLookup,
        now: DateTime<Utc>,
    ) -> Vec<(RequestId, ReissueOutcome)> {
        self.expire_at(now);
        let mut ids: Vec<RequestId> = self.pending.keys().cloned().collect();
        ids.sort_by_key(|id| self.pending.get(id).map(|p| p.first_seen_at));

        ids.into_iter()
            .map(|id| {
                let outcome = self.reissue_at(&id, reason, explicit, sink, sessions, now);
                (id, outcome)
            })
            .collect()
    }

    /// Drop approvals older than the TTL
    ///
    /// Returns every entry that expired since the last call, including those
    /// dropped while serving other operations. Idempotent.
    pub fn prune_expired(&mut self) -> Vec<PendingApproval> {
        self.prune_expired_at(Utc::now())
    }

    /// [`prune_expired`](Self::prune_expired) as of `now`
    pub fn prune_expired_at(&mut self, now: DateTime<Utc>) -> Vec<PendingApproval> {
        self.expire_at(now);
        std::mem::take(&mut self.expired)
    }

    fn expire_at(&mut self, now: DateTime<Utc>) {
        let Ok(ttl) = chrono::Duration::from_std(self.ttl) else {
            return;
        };
        let ids: Vec<RequestId> = self
            .pending
            .values()
            .filter(|p| p.is_expired(now, ttl))
            .map(|p| p.request_id.clone())
            .collect();

        for id in ids {
            if let Some(p) = self.pending.remove(&id) {
                log::info!("Approval {} for session {} expired", p.request_id, p.session_id);
                self.expired.push(p);
            }
        }
    }

    /// Forget an approval without applying a decision
    pub fn remove(&mut self, request_id: &RequestId) -> Option<PendingApproval> {
        self.pending.remove(request_id)
    }

    /// Forget every approval of a session; returns the removed ids
    pub fn remove_for_session(&mut self, session_id: &SessionId) -> Vec<RequestId> {
        let ids: Vec<RequestId> = self
            .pending
            .values()
            .filter(|p| &p.session_id == session_id)
            .map(|p| p.request_id.clone())
            .collect();
        for id in &ids {
            self.pending.remove(id);
        }
        self.expired.retain(|p| &p.session_id != session_id);
        ids
    }

    /// Apply a controller decision to the owning session
    ///
    /// Unknown or expired ids, and sessions that are gone or no longer hold
    /// the prompt, are reported as [`DecisionOutcome::Expired`].
    pub async fn apply_decision(
        &mut self,
        request_id: &RequestId,
        answer: ApprovalAnswer,
        sessions: &SessionRegistry,
    ) -> DecisionOutcome {
        self.expire_at(Utc::now());
        let Some(entry) = self.pending.remove(request_id) else {
            log::info!("Decision for unknown or expired approval {request_id}");
            return DecisionOutcome::Expired;
        };

        let Some(session) = sessions.get(&entry.session_id) else {
            log::info!(
                "Decision for approval {request_id} arrived after session {} ended",
                entry.session_id
            );
            return DecisionOutcome::Expired;
        };

        match session
            .send_approval(answer.option_number, answer.message, Some(request_id.clone()))
            .await
        {
            Ok(()) => DecisionOutcome::Applied {
                session_id: entry.session_id,
            },
            Err(e) => {
                log::warn!("Session {} rejected decision for {request_id}: {e}", entry.session_id);
                DecisionOutcome::Expired
            }
        }
    }

    fn deliver(
        &self,
        entry: &PendingApproval,
        explicit: Option<&RunnerId>,
        sink: &dyn ApprovalSink,
        sessions: &dyn SessionLookup,
    ) -> usize {
        let connected = sink.connected_runners();
        match route(entry, explicit, sessions, &self.channel_runners, &connected) {
            RouteTarget::Runner(runner) => usize::from(sink.deliver(&runner, entry)),
            RouteTarget::Broadcast => connected
                .iter()
                .filter(|runner| sink.deliver(runner, entry))
                .count(),
        }
    }
}
