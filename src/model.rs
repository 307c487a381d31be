//! Shared data types for the session control plane and inbound pipeline.
//!
//! Kept in one module because almost every other module (persistence, the
//! session manager, the inbound pipeline, the reply dispatcher) shares the
//! same small vocabulary of records — splitting them per-module would just
//! scatter `use` statements without buying any real isolation.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Session mode: whether a runtime handle is reused across turns or torn
/// down after one.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionMode {
    /// Reused across turns until explicitly closed or idle-evicted.
    Persistent,
    /// Closed immediately after its first completed turn.
    Oneshot,
}

/// Per-session state machine (§4.5.4).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// No active turn; last turn (if any) completed successfully or was
    /// cleanly cancelled.
    Idle,
    /// A turn is in flight.
    Running,
    /// The last turn failed.
    Error,
}

/// Where an identity fragment was most recently observed.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum IdentitySource {
    /// Supplied by `ensureSession`.
    Ensure,
    /// Corroborated by a subsequent `getStatus` call.
    Status,
}

/// Whether backend-assigned identifiers are provisional or corroborated.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum IdentityState {
    /// `ensure` returned preliminary ids; not yet corroborated.
    Pending,
    /// A `status` call corroborated the ids.
    Resolved,
}

/// Backend-assigned identity for a session, reconciled over time (§4.5.2).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SessionIdentity {
    /// Whether the ids are provisional or corroborated.
    pub state: IdentityState,
    /// Which call most recently contributed to this identity.
    pub source: IdentitySource,
    /// Backend-local session identifier (ACP-x terminology).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub acpx_session_id: Option<String>,
    /// Agent-local session identifier.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_session_id: Option<String>,
    /// Backend record identifier used for observability/resume.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub acpx_record_id: Option<String>,
    /// Timestamp of the most recent field-level update.
    pub last_updated_at: DateTime<Utc>,
}

impl SessionIdentity {
    /// True iff none of the identifier fields are populated.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.acpx_session_id.is_none()
            && self.agent_session_id.is_none()
            && self.acpx_record_id.is_none()
    }
}

/// Persisted runtime options, carried across restarts (§3).
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct RuntimeOptions {
    /// Backend-specific runtime mode (e.g. `"chat"`, `"agentic"`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub runtime_mode: Option<String>,
    /// Model identifier.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Named permission profile.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub permission_profile: Option<String>,
    /// Per-turn timeout, in seconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,
    /// Working directory override. Must be absolute when present (I4).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
}

impl RuntimeOptions {
    /// Deterministic digest used as the applied-control signature
    /// (§4.5.3): sorted keys, normalized (stringified) values, so
    /// semantically-identical options always produce the same signature
    /// regardless of field insertion order.
    #[must_use]
    pub fn signature(&self) -> String {
        let mut fields: BTreeMap<&'static str, String> = BTreeMap::new();
        if let Some(v) = &self.runtime_mode {
            fields.insert("runtimeMode", v.clone());
        }
        if let Some(v) = &self.model {
            fields.insert("model", v.clone());
        }
        if let Some(v) = &self.permission_profile {
            fields.insert("permissionProfile", v.clone());
        }
        if let Some(v) = self.timeout_seconds {
            fields.insert("timeoutSeconds", v.to_string());
        }
        if let Some(v) = &self.cwd {
            fields.insert("cwd", v.clone());
        }
        fields
            .into_iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join("&")
    }

    /// Merge `patch` on top of `self`, keeping unset `patch` fields as-is.
    #[must_use]
    pub fn merged_with(&self, patch: &Self) -> Self {
        Self {
            runtime_mode: patch.runtime_mode.clone().or_else(|| self.runtime_mode.clone()),
            model: patch.model.clone().or_else(|| self.model.clone()),
            permission_profile: patch
                .permission_profile
                .clone()
                .or_else(|| self.permission_profile.clone()),
            timeout_seconds: patch.timeout_seconds.or(self.timeout_seconds),
            cwd: patch.cwd.clone().or_else(|| self.cwd.clone()),
        }
    }
}

/// Persisted per-session ACP metadata (§3).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SessionAcpMeta {
    /// Which ACP runtime backend owns the session.
    pub backend: String,
    /// Agent identity routed to.
    pub agent: String,
    /// Backend-local handle name.
    pub runtime_session_name: String,
    /// Reconciled backend identity, if any has been observed yet.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub identity: Option<SessionIdentity>,
    /// Persistent vs. oneshot.
    pub mode: SessionMode,
    /// Persisted runtime options.
    #[serde(default)]
    pub runtime_options: RuntimeOptions,
    /// Working directory, if set independently of `runtimeOptions.cwd`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    /// Current state-machine state.
    pub state: SessionState,
    /// Timestamp of the most recent activity (ensure, turn, status).
    pub last_activity_at: DateTime<Utc>,
    /// Last turn failure message, if `state == Error`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// A prefix used to recognize ACP-shaped session keys (§3): a key of the
/// form `agent:<agentId>:acp:<id>` is ACP-shaped; the manager fails closed
/// when such a key lacks metadata.
pub fn is_acp_shaped(session_key: &str) -> bool {
    let mut parts = session_key.splitn(3, ':');
    matches!(
        (parts.next(), parts.next(), parts.next()),
        (Some("agent"), Some(_), Some(rest)) if rest.starts_with("acp:")
    )
}

/// Build a session key of the form `agent:<agentId>:<scope>`.
#[must_use]
pub fn session_key(agent_id: &str, scope: &str) -> String {
    format!("agent:{agent_id}:{scope}")
}

/// The result of resolving a session key against the metadata store.
#[derive(Debug, Clone, PartialEq)]
pub enum ResolvedSession {
    /// No metadata exists and the key is not ACP-shaped — not an error,
    /// just "this session has no ACP state".
    None,
    /// The key is ACP-shaped but metadata is missing — fail closed.
    Stale,
    /// Metadata found.
    Ready(SessionAcpMeta),
}

/// A single streamed event from a runtime's `runTurn` event sequence
/// (§4.4).
#[derive(Debug, Clone, PartialEq)]
pub enum RuntimeEvent {
    /// Incremental text content.
    TextDelta {
        /// The text fragment.
        text: String,
    },
    /// A tool invocation result.
    ToolResult {
        /// Tool name.
        tool: String,
        /// Rendered/raw output.
        output: String,
        /// Media urls produced by the tool, if any.
        media_urls: Vec<String>,
    },
    /// An in-band error. Consumers must keep draining the stream after
    /// this event to respect backend ordering, then raise once the stream
    /// ends.
    Error {
        /// Backend-reported error code (normalized into [`crate::errors::AcpErrorCode`]
        /// by the manager, not here — this is the raw backend string).
        code: String,
        /// Human-readable detail.
        message: String,
    },
    /// Terminal event: the turn's event stream is complete.
    Done {
        /// Backend-reported stop reason, if any.
        stop_reason: Option<String>,
    },
}

/// Turn submission mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnMode {
    /// A fresh user turn.
    Prompt,
    /// Mid-turn steering input.
    Steer,
}

/// Backend capability advertisement (§4.4).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuntimeCapabilities {
    /// Control operations the backend supports (e.g. `"setMode"`,
    /// `"setConfigOption"`).
    pub controls: Vec<String>,
    /// Config option keys the backend accepts via `setConfigOption`.
    pub config_option_keys: Option<Vec<String>>,
}

impl RuntimeCapabilities {
    /// Whether the backend advertises support for a named control.
    #[must_use]
    pub fn supports(&self, control: &str) -> bool {
        self.controls.iter().any(|c| c == control)
    }

    /// Whether the backend accepts a named config option key. Absent
    /// `config_option_keys` means "no restriction" — any key is accepted
    /// as long as `setConfigOption` itself is advertised.
    #[must_use]
    pub fn accepts_config_key(&self, key: &str) -> bool {
        match &self.config_option_keys {
            Some(keys) => keys.iter().any(|k| k == key),
            None => true,
        }
    }
}

/// Backend status snapshot (§4.4, optional capability).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuntimeStatus {
    /// Short human-readable summary.
    pub summary: String,
    /// Corroborated backend session id, if any.
    pub backend_session_id: Option<String>,
    /// Corroborated agent session id, if any.
    pub agent_session_id: Option<String>,
    /// Backend record id, if any.
    pub acpx_record_id: Option<String>,
    /// Free-form details.
    pub details: Option<serde_json::Value>,
}

/// An inbound frame delivered by a transport adapter (§6).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InboundFrame {
    /// Transport/provider identifier (e.g. `"slack"`, `"discord"`).
    pub provider: String,
    /// Logical surface within the provider (e.g. a workspace or guild id).
    pub surface: String,
    /// Account identifier the message arrived on.
    pub account_id: String,
    /// Sender identifier.
    pub sender_id: String,
    /// Sender display name, if known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sender_name: Option<String>,
    /// Conversation identifier (channel, DM thread, etc).
    pub conversation_id: String,
    /// Whether this conversation is a group (vs. a 1:1 DM).
    pub is_group: bool,
    /// Thread identifier, if the transport supports threading.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
    /// Transport-provided message identifier, used for dedup.
    pub message_id: String,
    /// Message text.
    #[serde(default)]
    pub text: String,
    /// Media references attached to the message.
    #[serde(default)]
    pub media_refs: Vec<String>,
    /// Transport-reported timestamp.
    pub timestamp: DateTime<Utc>,
    /// Id of a message this one replies to, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_to_id: Option<String>,
}

impl InboundFrame {
    /// Conversation-scoped key used by the debouncer, history aggregator,
    /// and mention gate: distinct per (provider, account, conversation).
    #[must_use]
    pub fn conversation_key(&self) -> String {
        format!("{}:{}:{}", self.provider, self.account_id, self.conversation_id)
    }

    /// Dedup key: distinct per (channel, account, message id) (§4.7).
    #[must_use]
    pub fn dedup_key(&self) -> String {
        format!("{}:{}:{}", self.provider, self.account_id, self.message_id)
    }

    /// Whether this frame carries any media.
    #[must_use]
    pub fn has_media(&self) -> bool {
        !self.media_refs.is_empty()
    }
}

/// An outbound reply payload (§4.11).
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct ReplyPayload {
    /// Text content, if any.
    pub text: Option<String>,
    /// A single media url.
    pub media_url: Option<String>,
    /// Multiple media urls.
    pub media_urls: Vec<String>,
    /// Whether this payload is an internal reasoning trace that must never
    /// reach a user-facing sink.
    pub is_reasoning: bool,
    /// Whether audio content should be delivered as a voice note rather
    /// than a file attachment.
    pub audio_as_voice: bool,
}

impl ReplyPayload {
    /// A plain text reply.
    #[must_use]
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            ..Self::default()
        }
    }

    /// All media urls (the singular and plural fields combined).
    #[must_use]
    pub fn all_media_urls(&self) -> Vec<String> {
        let mut urls = self.media_urls.clone();
        if let Some(u) = &self.media_url {
            if !urls.contains(u) {
                urls.insert(0, u.clone());
            }
        }
        urls
    }
}

/// A single pending-history entry (§3, §4.8).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    /// Display name (or id) of the sender.
    pub sender: String,
    /// Message body.
    pub body: String,
    /// Original transport timestamp, if known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    /// Original transport message id, if known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
}

/// A pairing challenge issued to an unknown DM sender (§3, §4.6).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PairingRequest {
    /// Channel/provider id.
    pub channel: String,
    /// Account id the pairing was issued on.
    pub account_id: String,
    /// Sender id the pairing is tied to.
    pub id: String,
    /// One-time pairing code.
    pub code: String,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Arbitrary caller-supplied metadata.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<serde_json::Value>,
}
