//! Identity reconciliation (§4.5.2): merges `ensure`/`status`-derived
//! backend identity with persisted identity under monotonic rules (I3,
//! P3).

use chrono::Utc;

use crate::model::{IdentitySource, IdentityState, SessionIdentity};

/// Merge `incoming` identity information on top of `current`, per the
/// rules in §4.5.2:
///
/// - An empty `incoming` never regresses `current`.
/// - Per-field, the value with the newer `lastUpdatedAt` wins.
/// - `state` may only advance `pending → resolved`, never the reverse —
///   `incoming` from `status` can upgrade, nothing downgrades it.
#[must_use]
pub fn reconcile(
    current: Option<&SessionIdentity>,
    incoming: &SessionIdentity,
) -> SessionIdentity {
    if incoming.is_empty() {
        if let Some(current) = current {
            return current.clone();
        }
        return incoming.clone();
    }

    let Some(current) = current else {
        return incoming.clone();
    };

    let incoming_is_newer = incoming.last_updated_at >= current.last_updated_at;

    let acpx_session_id = pick_field(
        &current.acpx_session_id,
        &incoming.acpx_session_id,
        incoming_is_newer,
    );
    let agent_session_id = pick_field(
        &current.agent_session_id,
        &incoming.agent_session_id,
        incoming_is_newer,
    );
    let acpx_record_id = pick_field(
        &current.acpx_record_id,
        &incoming.acpx_record_id,
        incoming_is_newer,
    );

    let state = match (current.state, incoming.state) {
        (IdentityState::Resolved, _) => IdentityState::Resolved,
        (IdentityState::Pending, IdentityState::Resolved) => IdentityState::Resolved,
        (IdentityState::Pending, IdentityState::Pending) => IdentityState::Pending,
    };

    let source = if incoming_is_newer {
        incoming.source
    } else {
        current.source
    };

    SessionIdentity {
        state,
        source,
        acpx_session_id,
        agent_session_id,
        acpx_record_id,
        last_updated_at: current.last_updated_at.max(incoming.last_updated_at),
    }
}

fn pick_field(current: &Option<String>, incoming: &Option<String>, incoming_is_newer: bool) -> Option<String> {
    match (current, incoming) {
        (_, Some(v)) if incoming_is_newer => Some(v.clone()),
        (Some(v), _) => Some(v.clone()),
        (None, Some(v)) => Some(v.clone()),
        (None, None) => None,
    }
}

/// Build a fresh `pending` identity from ensure-derived ids, or `None` if
/// ensure returned no ids at all (§4.5 `initializeSession`: "seeded with
/// ensure-derived identity (state=pending if any ids present, else
/// pending without ids)").
#[must_use]
pub fn from_ensure(
    acpx_session_id: Option<String>,
    agent_session_id: Option<String>,
) -> SessionIdentity {
    SessionIdentity {
        state: IdentityState::Pending,
        source: IdentitySource::Ensure,
        acpx_session_id,
        agent_session_id,
        acpx_record_id: None,
        last_updated_at: Utc::now(),
    }
}

/// Build an identity fragment from a `getStatus` response.
#[must_use]
pub fn from_status(
    backend_session_id: Option<String>,
    agent_session_id: Option<String>,
    acpx_record_id: Option<String>,
) -> SessionIdentity {
    SessionIdentity {
        state: IdentityState::Resolved,
        source: IdentitySource::Status,
        acpx_session_id: backend_session_id,
        agent_session_id,
        acpx_record_id,
        last_updated_at: Utc::now(),
    }
}
