//! Runner selection for approvals that outlived their connection

use std::collections::HashMap;

use crate::types::approval::PendingApproval;
use crate::types::identifiers::{RequestId, RunnerId, SessionId};

/// Lookup of the runner currently hosting a session
pub trait SessionLookup {
    /// Runner hosting `session_id`, if known
    fn runner_for_session(&self, session_id: &SessionId) -> Option<RunnerId>;
}

impl SessionLookup for HashMap<SessionId, RunnerId> {
    fn runner_for_session(&self, session_id: &SessionId) -> Option<RunnerId> {
        self.get(session_id).cloned()
    }
}

/// Where an approval should be delivered
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteTarget {
    /// A single connected runner
    Runner(RunnerId),
    /// Every connected runner
    Broadcast,
}

/// Minimum digits of a unix-millis suffix
const MILLIS_DIGITS: usize = 10;

/// Recover the session id from a `{sessionId}-{unixMillis}` request id
///
/// # Examples
/// ```
/// use runner_agent::approval::session_from_request_id;
/// use runner_agent::types::{RequestId, SessionId};
///
/// let id = RequestId::new("thread-42-1718000000000");
/// assert_eq!(session_from_request_id(&id), Some(SessionId::new("thread-42")));
/// assert_eq!(session_from_request_id(&RequestId::new("req_1_abc")), None);
/// ```
#[must_use]
pub fn session_from_request_id(request_id: &RequestId) -> Option<SessionId> {
    let (session, suffix) = request_id.as_str().rsplit_once('-')?;
    let is_millis = suffix.len() >= MILLIS_DIGITS && suffix.chars().all(|c| c.is_ascii_digit());
    (is_millis && !session.is_empty()).then(|| SessionId::new(session))
}

/// Pick a delivery target for `entry`
///
/// Candidates are tried in order and the first one that is connected wins:
/// the caller's explicit runner, the runner stored on the entry, the runner
/// of the session parsed from the request id, and the runner last seen on
/// the originating channel. With none connected the approval is broadcast.
#[must_use]
pub fn route(
    entry: &PendingApproval,
    explicit: Option<&RunnerId>,
    sessions: &dyn SessionLookup,
    channel_hints: &HashMap<String, RunnerId>,
    connected: &[RunnerId],
) -> RouteTarget {
    let parsed = session_from_request_id(&entry.request_id)
        .and_then(|session| sessions.runner_for_session(&session));
    let hinted = entry
        .origin_channel
        .as_ref()
        .and_then(|channel| channel_hints.get(channel))
        .cloned();

    [explicit.cloned(), entry.runner_id.clone(), parsed, hinted]
        .into_iter()
        .flatten()
        .find(|candidate| connected.contains(candidate))
        .map_or(RouteTarget::Broadcast, RouteTarget::Runner)
}
