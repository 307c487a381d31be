//! Global configuration parsing and validation.
//!
//! Covers exactly the subset of the wider OpenClaw configuration surface
//! this crate consumes: the ACP session-manager knobs, per-channel
//! access-control policy, command gating, and the default send policy.
//! Loading the full application config (secrets, transport credentials,
//! per-transport wizards) is an external collaborator's job.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::{AppError, Result};

/// DM access policy for a channel.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DmPolicy {
    /// Any sender may DM.
    Open,
    /// Unknown senders are issued a pairing challenge.
    Pairing,
    /// Only senders on the allowlist may DM.
    Allowlist,
    /// DMs are rejected outright.
    Disabled,
}

/// Group access policy for a channel.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum GroupPolicy {
    /// Any group message is processed.
    Open,
    /// Only senders on the group allowlist may trigger processing.
    Allowlist,
    /// Group messages are rejected outright.
    Disabled,
}

/// The default action when no more specific send policy applies.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SendPolicyDefault {
    /// Allow sends absent a more specific rule.
    Allow,
    /// Deny sends absent a more specific rule.
    Deny,
}

/// Per-channel access-control and dispatch policy. Hot-reloadable via
/// [`crate::config_watcher::ConfigWatcher`] — `acp.*` and other
/// process-lifetime settings are not covered by hot reload.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct ChannelPolicy {
    /// Group access policy.
    pub group_policy: GroupPolicy,
    /// DM access policy.
    pub dm_policy: DmPolicy,
    /// Explicit DM allowlist (normalized on load: `@` stripped, lowercased).
    pub allow_from: Vec<String>,
    /// Explicit group allowlist; falls back to `allow_from` when unset.
    pub group_allow_from: Option<Vec<String>>,
    /// Whether a group message must carry an explicit mention to be processed.
    pub require_mention: bool,
    /// Maximum characters per outbound transport chunk.
    pub text_chunk_limit: usize,
    /// Maximum bytes accepted for a single inbound media reference.
    pub media_max_bytes: u64,
    /// Maximum pending-history entries retained per conversation.
    pub history_limit: usize,
    /// Bot/agent aliases that count as an explicit mention in group text
    /// (§4.9), in addition to a transport-detected @-mention.
    pub mention_aliases: Vec<String>,
    /// Per-account direct-trigger prefix (e.g. `"!"`) that implicitly
    /// mentions the bot when a group message starts with it (§4.9).
    pub on_char_prefix: Option<String>,
    /// Prefixes recognized as control commands, beyond the hardcoded `/`
    /// (§4.6 "a configured bang prefix").
    pub command_prefixes: Vec<String>,
}

impl Default for ChannelPolicy {
    fn default() -> Self {
        Self {
            group_policy: GroupPolicy::Open,
            dm_policy: DmPolicy::Open,
            allow_from: Vec::new(),
            group_allow_from: None,
            require_mention: true,
            text_chunk_limit: 3_500,
            media_max_bytes: 25 * 1024 * 1024,
            history_limit: 20,
            mention_aliases: Vec::new(),
            on_char_prefix: None,
            command_prefixes: vec!["/".to_owned()],
        }
    }
}

impl ChannelPolicy {
    /// `allowFrom` merged with pairing-store contributions, de-duplicated
    /// and normalized (leading `@` stripped, lowercased). `storeAllowFrom`
    /// is the runtime contribution from accepted pairing requests; it is
    /// never baked into config.
    #[must_use]
    pub fn effective_allow_from(&self, store_allow_from: &[String]) -> Vec<String> {
        merge_normalized(&self.allow_from, store_allow_from)
    }

    /// `groupAllowFrom` if explicitly set, else `allowFrom`. Pairing-store
    /// entries never propagate into the group allowlist.
    #[must_use]
    pub fn effective_group_allow_from(&self) -> Vec<String> {
        match &self.group_allow_from {
            Some(list) => normalize_all(list),
            None => normalize_all(&self.allow_from),
        }
    }
}

fn normalize(raw: &str) -> String {
    raw.trim_start_matches('@').to_lowercase()
}

fn normalize_all(raw: &[String]) -> Vec<String> {
    raw.iter().map(|s| normalize(s)).collect()
}

fn merge_normalized(a: &[String], b: &[String]) -> Vec<String> {
    let mut out = normalize_all(a);
    for item in normalize_all(b) {
        if !out.contains(&item) {
            out.push(item);
        }
    }
    out
}

/// ACP streaming-reply coalescing knobs (§6 `acp.stream.*`).
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StreamConfig {
    /// Idle window (ms) used to coalesce consecutive `text_delta` events
    /// into a single block reply.
    pub coalesce_idle_ms: u64,
    /// Maximum characters per streamed block reply chunk.
    pub max_chunk_chars: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            coalesce_idle_ms: 400,
            max_chunk_chars: 1_800,
        }
    }
}

/// ACP runtime lifecycle knobs (§6 `acp.runtime.*`).
#[derive(Debug, Clone, Copy, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeLifecycleConfig {
    /// Idle time-to-live, in minutes, before a cached handle becomes an
    /// eviction candidate.
    pub ttl_minutes: f64,
}

impl Default for RuntimeLifecycleConfig {
    fn default() -> Self {
        Self { ttl_minutes: 30.0 }
    }
}

/// Dispatch-policy knobs (§6 `acp.dispatch.*`).
#[derive(Debug, Clone, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct DispatchConfig {
    /// Whether ACP-shaped session keys are allowed to route to the ACP
    /// session manager at all.
    pub enabled: bool,
}

/// Top-level ACP configuration (§6 `acp.*`).
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct AcpConfig {
    /// Whether ACP is enabled process-wide.
    pub enabled: bool,
    /// Which registered backend id owns new sessions by default.
    pub backend: String,
    /// Inbound-dispatch routing policy.
    pub dispatch: DispatchConfig,
    /// Agents permitted to route through ACP. Empty means "no restriction".
    pub allowed_agents: Vec<String>,
    /// Global cap on concurrently cached runtime handles.
    pub max_concurrent_sessions: u32,
    /// Idle-eviction and TTL knobs.
    pub runtime: RuntimeLifecycleConfig,
    /// Streaming-reply coalescing knobs.
    pub stream: StreamConfig,
}

impl Default for AcpConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            backend: "default".to_owned(),
            dispatch: DispatchConfig { enabled: true },
            allowed_agents: Vec::new(),
            max_concurrent_sessions: 8,
            runtime: RuntimeLifecycleConfig::default(),
            stream: StreamConfig::default(),
        }
    }
}

/// Control-command gating knobs (§6 `commands.*`).
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CommandsConfig {
    /// Whether command authorization consults access-control allowlists
    /// (vs. treating every sender as authorized).
    pub use_access_groups: bool,
    /// Whether free-text slash/bang commands are recognized at all.
    pub text: bool,
}

impl Default for CommandsConfig {
    fn default() -> Self {
        Self {
            use_access_groups: true,
            text: true,
        }
    }
}

/// `session.sendPolicy.*` knobs.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SendPolicyConfig {
    /// Default action absent a more specific rule.
    pub default: SendPolicyDefault,
}

impl Default for SendPolicyConfig {
    fn default() -> Self {
        Self {
            default: SendPolicyDefault::Allow,
        }
    }
}

/// `session.*` knobs.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct SessionConfig {
    /// Outbound send policy.
    pub send_policy: SendPolicyConfig,
}

/// Inbound-pipeline knobs (§4.6-§4.10 ambient tuning, not spelled out as
/// `cfg.*` paths in §6 but required to construct the dedup/debounce/
/// pairing components the pipeline owns).
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct InboundConfig {
    /// Text that fast-aborts an active session when it arrives as a
    /// message body (§4.10 step 1), matched case-insensitively.
    pub abort_commands: Vec<String>,
    /// Dedup entry TTL, in milliseconds (§4.7).
    pub dedup_ttl_ms: i64,
    /// Dedup map max size before oldest-first eviction (§4.7).
    pub dedup_max_size: usize,
    /// Debounce idle window, in milliseconds (§4.7).
    pub debounce_idle_ms: u64,
    /// Pairing code lifetime, in milliseconds (§9).
    pub pairing_ttl_ms: i64,
    /// Messages older than this grace window (ms) never trigger a fresh
    /// pairing reply (§4.6 "do not reply for messages older than a grace
    /// window").
    pub pairing_grace_ms: i64,
}

impl Default for InboundConfig {
    fn default() -> Self {
        Self {
            abort_commands: vec!["/abort".to_owned(), "/stop".to_owned()],
            dedup_ttl_ms: 5 * 60_000,
            dedup_max_size: 2_000,
            debounce_idle_ms: 1_200,
            pairing_ttl_ms: 15 * 60_000,
            pairing_grace_ms: 60_000,
        }
    }
}

/// Global configuration parsed from `config.toml`.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct GlobalConfig {
    /// Absolute path used to validate `cwd` overrides and as the default
    /// process-backed runtime working directory.
    pub workspace_root: PathBuf,
    /// ACP session-manager configuration.
    pub acp: AcpConfig,
    /// Per-channel access-control policy, keyed by channel id (e.g.
    /// `"slack"`, `"discord"`, `"mattermost"`).
    pub channels: HashMap<String, ChannelPolicy>,
    /// Control-command gating.
    pub commands: CommandsConfig,
    /// Session-level send policy.
    pub session: SessionConfig,
    /// Inbound dedup/debounce/pairing tuning.
    pub inbound: InboundConfig,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            workspace_root: PathBuf::from("."),
            acp: AcpConfig::default(),
            channels: HashMap::new(),
            commands: CommandsConfig::default(),
            inbound: InboundConfig::default(),
            session: SessionConfig::default(),
        }
    }
}

impl GlobalConfig {
    /// Load and validate configuration from a TOML file path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read or contains
    /// invalid TOML, or if validation fails.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|err| AppError::Config(format!("failed to read config: {err}")))?;
        Self::from_toml_str(&raw)
    }

    /// Parse configuration from a TOML string and validate it.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Look up a channel's policy, falling back to the default policy if
    /// the channel has no explicit entry.
    #[must_use]
    pub fn channel_policy(&self, channel: &str) -> ChannelPolicy {
        self.channels.get(channel).cloned().unwrap_or_default()
    }

    /// Validate configuration invariants before any session work starts:
    /// a nonzero admission cap, an absolute workspace root, and no
    /// duplicate channel keys (guaranteed by `HashMap` but checked for
    /// case-insensitive collisions, which TOML would otherwise let through
    /// as two distinct keys routing to the same transport).
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` describing the first violation found.
    fn validate(&self) -> Result<()> {
        if self.acp.max_concurrent_sessions == 0 {
            return Err(AppError::Config(
                "acp.maxConcurrentSessions must be greater than zero".into(),
            ));
        }

        if !self.workspace_root.is_absolute() {
            return Err(AppError::Config(
                "workspaceRoot must be an absolute path".into(),
            ));
        }

        let mut seen = std::collections::HashSet::new();
        for key in self.channels.keys() {
            let lower = key.to_lowercase();
            if !seen.insert(lower) {
                return Err(AppError::Config(format!(
                    "duplicate channel key (case-insensitive collision): {key}"
                )));
            }
        }

        Ok(())
    }

    /// Validate a `cwd` override supplied via `runtimeOptions` or
    /// `initializeSession`: must be an absolute path. Used by both session
    /// initialization and `updateSessionRuntimeOptions`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Acp` with code `InvalidRuntimeOption` if `cwd`
    /// is not absolute.
    pub fn validate_cwd(cwd: &str) -> Result<()> {
        if Path::new(cwd).is_absolute() {
            Ok(())
        } else {
            Err(AppError::acp(
                crate::errors::AcpErrorCode::InvalidRuntimeOption,
                format!("cwd must be an absolute path: {cwd}"),
            ))
        }
    }
}
