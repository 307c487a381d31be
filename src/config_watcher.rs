//! Hot-reload watcher for per-channel access-control policy in `config.toml`.
//!
//! [`ConfigWatcher`] uses the `notify` crate to watch the configuration
//! file for changes. When a change is detected it re-parses only the
//! `[channels.*]` tables and atomically swaps the shared
//! `Arc<RwLock<HashMap<String, ChannelPolicy>>>` the access-control engine
//! reads from. `acp.*` and other process-lifetime settings require a
//! restart and are never touched by this watcher.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use serde::Deserialize;
use tracing::{info, warn};

use crate::config::ChannelPolicy;
use crate::{AppError, Result};

/// Minimal TOML structure used for hot-reload parsing — only `channels`
/// is extracted, so the rest of the file (including `acp.*`, which this
/// watcher never reloads) does not need to be a fully valid
/// [`crate::config::GlobalConfig`].
#[derive(Debug, Deserialize)]
struct ChannelsOnlyConfig {
    #[serde(default)]
    channels: HashMap<String, ChannelPolicy>,
}

/// Parse only the `[channels.*]` tables from a config file.
///
/// # Errors
///
/// Returns `AppError::Config` if the file cannot be read or contains
/// invalid TOML in the `channels` section.
pub(crate) fn parse_channel_policies(path: &Path) -> Result<HashMap<String, ChannelPolicy>> {
    let raw = std::fs::read_to_string(path)
        .map_err(|err| AppError::Config(format!("failed to read config for hot-reload: {err}")))?;
    let parsed: ChannelsOnlyConfig = toml::from_str(&raw)
        .map_err(|err| AppError::Config(format!("failed to parse channels from config: {err}")))?;
    Ok(parsed.channels)
}

fn is_config_change(event: &Event) -> bool {
    matches!(
        event.kind,
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
    )
}

/// Hot-reload watcher for per-channel access-control policy.
///
/// Holds a [`notify`] file-system watcher alive for its own lifetime.
/// Dropping a `ConfigWatcher` stops the underlying OS watch, so callers
/// must keep it alive for as long as hot-reload is needed.
pub struct ConfigWatcher {
    _watcher: RecommendedWatcher,
    policies: Arc<RwLock<HashMap<String, ChannelPolicy>>>,
}

impl ConfigWatcher {
    /// Create a new `ConfigWatcher` that watches `config_path` for changes.
    ///
    /// Parses the initial `channels` table at creation time. If the file
    /// cannot be read or parsed, the watcher starts with an empty policy
    /// map (every channel falls back to [`ChannelPolicy::default`]) and
    /// logs a warning — non-fatal so the process can still start.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the `notify` watcher itself cannot be
    /// created.
    pub fn new(config_path: &Path) -> Result<Self> {
        let initial = parse_channel_policies(config_path).unwrap_or_else(|err| {
            warn!(%err, path = %config_path.display(), "failed to load initial channel policies; starting empty");
            HashMap::new()
        });

        let policies: Arc<RwLock<HashMap<String, ChannelPolicy>>> =
            Arc::new(RwLock::new(initial));
        let policies_for_callback = Arc::clone(&policies);
        let path_for_callback: PathBuf = config_path.to_path_buf();

        let mut watcher = notify::recommended_watcher(
            move |result: std::result::Result<Event, notify::Error>| match result {
                Ok(event) if is_config_change(&event) => {
                    match parse_channel_policies(&path_for_callback) {
                        Ok(new_policies) => match policies_for_callback.write() {
                            Ok(mut guard) => {
                                *guard = new_policies;
                                info!(
                                    path = %path_for_callback.display(),
                                    "hot-reloaded channel access-control policy"
                                );
                            }
                            Err(err) => {
                                warn!(%err, "channel policy RwLock poisoned during hot-reload");
                            }
                        },
                        Err(err) => {
                            warn!(
                                %err,
                                path = %path_for_callback.display(),
                                "failed to reload channel policy — keeping previous values"
                            );
                        }
                    }
                }
                Err(err) => {
                    warn!(%err, "config file watcher error");
                }
                _ => {}
            },
        )
        .map_err(|err| AppError::Config(format!("failed to create config file watcher: {err}")))?;

        let watch_target = config_path
            .parent()
            .filter(|p| p != &Path::new(""))
            .unwrap_or(config_path);

        watcher
            .watch(watch_target, RecursiveMode::NonRecursive)
            .map_err(|err| {
                AppError::Config(format!(
                    "failed to watch config path '{}': {err}",
                    watch_target.display()
                ))
            })?;

        info!(
            path = %config_path.display(),
            "config watcher started for channel policy hot-reload"
        );

        Ok(Self {
            _watcher: watcher,
            policies,
        })
    }

    /// Return a clone of the shared channel-policy map `Arc`.
    #[must_use]
    pub fn policies(&self) -> Arc<RwLock<HashMap<String, ChannelPolicy>>> {
        Arc::clone(&self.policies)
    }

    /// Resolve the current (possibly hot-reloaded) policy for a channel,
    /// falling back to [`ChannelPolicy::default`] if the channel has no
    /// explicit entry.
    #[must_use]
    pub fn channel_policy(&self, channel: &str) -> ChannelPolicy {
        let guard = self
            .policies
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        guard.get(channel).cloned().unwrap_or_default()
    }
}
