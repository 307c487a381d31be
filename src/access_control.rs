//! Access-Control Engine (§4.6): evaluates DM policy, group policy, and
//! allowlists; issues pairing challenges for unknown DM senders.

use chrono::{DateTime, Utc};
use tracing::instrument;

use crate::config::{ChannelPolicy, DmPolicy, GroupPolicy};
use crate::model::PairingRequest;
use crate::persistence::pairing_repo::PairingStore;

/// Why a message was blocked (§4.6 rules).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockReason {
    /// Group messages are rejected outright for this channel.
    GroupPolicyDisabled,
    /// Group policy is `allowlist` but the allowlist is empty.
    GroupPolicyEmptyAllowlist,
    /// Group policy is `allowlist` and the sender is not on it.
    GroupPolicyNotAllowlisted,
    /// DMs are rejected outright for this channel.
    DmPolicyDisabled,
    /// DM policy is `allowlist` and the sender is not on it.
    DmPolicyNotAllowlisted,
}

impl BlockReason {
    /// The stable code string, e.g. `GROUP_POLICY_DISABLED`.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::GroupPolicyDisabled => "GROUP_POLICY_DISABLED",
            Self::GroupPolicyEmptyAllowlist => "GROUP_POLICY_EMPTY_ALLOWLIST",
            Self::GroupPolicyNotAllowlisted => "GROUP_POLICY_NOT_ALLOWLISTED",
            Self::DmPolicyDisabled => "DM_POLICY_DISABLED",
            Self::DmPolicyNotAllowlisted => "DM_POLICY_NOT_ALLOWLISTED",
        }
    }
}

/// The access-control decision for one inbound message.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// The message may proceed through the rest of the pipeline.
    Allow,
    /// The message is rejected; no reply is sent to the sender.
    Block(BlockReason),
    /// The sender is unknown under a `pairing` DM policy; a one-time code
    /// was issued (or already live) and should be relayed back to them.
    Pairing {
        /// The one-time code to show the sender.
        code: String,
        /// `true` if this is a freshly generated code, `false` if an
        /// existing live pairing request was found.
        freshly_created: bool,
    },
}

fn normalize(raw: &str) -> String {
    raw.trim_start_matches('@').to_lowercase()
}

fn matches_allowlist(sender_id: &str, sender_name: Option<&str>, allowlist: &[String]) -> bool {
    let sender_id = normalize(sender_id);
    let sender_name = sender_name.map(normalize);
    allowlist
        .iter()
        .any(|entry| *entry == sender_id || sender_name.as_deref() == Some(entry.as_str()))
}

/// Evaluate access control for a group message (§4.6).
#[must_use]
pub fn evaluate_group(policy: &ChannelPolicy, sender_id: &str, sender_name: Option<&str>) -> Decision {
    match policy.group_policy {
        GroupPolicy::Disabled => Decision::Block(BlockReason::GroupPolicyDisabled),
        GroupPolicy::Open => Decision::Allow,
        GroupPolicy::Allowlist => {
            let allowlist = policy.effective_group_allow_from();
            if allowlist.is_empty() {
                Decision::Block(BlockReason::GroupPolicyEmptyAllowlist)
            } else if matches_allowlist(sender_id, sender_name, &allowlist) {
                Decision::Allow
            } else {
                Decision::Block(BlockReason::GroupPolicyNotAllowlisted)
            }
        }
    }
}

/// Evaluate access control for a direct message (§4.6). `store_allow_from`
/// is the pairing-store contribution (accepted pairing requests) merged
/// into `effectiveAllowFrom`; it never applies to group policy.
///
/// When the DM policy is `pairing` and the sender is not already
/// allowlisted, issues (or reuses) a pairing code via `pairing_store` —
/// unless `message_timestamp` is older than the configured grace window,
/// in which case the message is silently blocked instead (§4.6 "do not
/// reply for messages older than a grace window").
///
/// # Errors
///
/// Returns a persistence error if the pairing store write fails.
#[instrument(skip(pairing_store, store_allow_from))]
pub async fn evaluate_dm(
    policy: &ChannelPolicy,
    channel: &str,
    account_id: &str,
    sender_id: &str,
    sender_name: Option<&str>,
    store_allow_from: &[String],
    message_timestamp: DateTime<Utc>,
    pairing_grace_ms: i64,
    pairing_store: &PairingStore,
) -> crate::Result<Decision> {
    match policy.dm_policy {
        DmPolicy::Disabled => Ok(Decision::Block(BlockReason::DmPolicyDisabled)),
        DmPolicy::Open => Ok(Decision::Allow),
        DmPolicy::Allowlist => {
            let allowlist = policy.effective_allow_from(store_allow_from);
            if matches_allowlist(sender_id, sender_name, &allowlist) {
                Ok(Decision::Allow)
            } else {
                Ok(Decision::Block(BlockReason::DmPolicyNotAllowlisted))
            }
        }
        DmPolicy::Pairing => {
            let allowlist = policy.effective_allow_from(store_allow_from);
            if matches_allowlist(sender_id, sender_name, &allowlist) {
                return Ok(Decision::Allow);
            }

            let age_ms = (Utc::now() - message_timestamp).num_milliseconds();
            if age_ms > pairing_grace_ms {
                return Ok(Decision::Block(BlockReason::DmPolicyNotAllowlisted));
            }

            let (code, freshly_created) = pairing_store
                .upsert_channel_pairing_request(channel, account_id, sender_id, None)
                .await?;
            Ok(Decision::Pairing { code, freshly_created })
        }
    }
}

/// Whether `text` is a recognized control command: starts with `/` or one
/// of `command_prefixes` (§4.6).
#[must_use]
pub fn is_control_command(text: &str, command_prefixes: &[String]) -> bool {
    let trimmed = text.trim_start();
    command_prefixes.iter().any(|prefix| trimmed.starts_with(prefix.as_str())) || trimmed.starts_with('/')
}

/// Command gating (§4.6): a control command requires the sender to be
/// allowlisted under the DM allowlist if in a DM, else under the group
/// allowlist. Unauthorized control commands in groups are dropped
/// silently — callers check this before invoking the command handler.
#[must_use]
pub fn is_command_authorized(
    policy: &ChannelPolicy,
    is_group: bool,
    sender_id: &str,
    sender_name: Option<&str>,
    store_allow_from: &[String],
) -> bool {
    let allowlist = if is_group {
        policy.effective_group_allow_from()
    } else {
        policy.effective_allow_from(store_allow_from)
    };
    allowlist.is_empty() || matches_allowlist(sender_id, sender_name, &allowlist)
}

/// Reconstruct a full pairing record for a redeemed code, if still live.
///
/// # Errors
///
/// Returns a persistence error if the query fails.
pub async fn find_pairing_by_code(pairing_store: &PairingStore, code: &str) -> crate::Result<Option<PairingRequest>> {
    pairing_store.find_by_code(code).await
}
