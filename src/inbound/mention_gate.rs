//! Mention & Command Gating (§4.9): decides whether a group message
//! should proceed past access control into the dispatch pipeline, or be
//! recorded in history and dropped.

use crate::access_control::is_control_command;
use crate::config::ChannelPolicy;

/// Whether `text` carries an explicit mention: either the transport
/// already detected an @-mention of the bot, or the text contains one of
/// the routed agent's configured aliases.
#[must_use]
pub fn is_explicit_mention(text: &str, mention_aliases: &[String], transport_detected_mention: bool) -> bool {
    if transport_detected_mention {
        return true;
    }
    let lower = text.to_lowercase();
    mention_aliases.iter().any(|alias| !alias.is_empty() && lower.contains(&alias.to_lowercase()))
}

/// Whether `text` starts with the per-account on-char direct-trigger
/// prefix, which implicitly mentions the bot (§4.9).
#[must_use]
pub fn is_on_char_triggered(text: &str, on_char_prefix: Option<&str>) -> bool {
    match on_char_prefix {
        Some(prefix) if !prefix.is_empty() => text.trim_start().starts_with(prefix),
        _ => false,
    }
}

/// Decide whether a group message should proceed (§4.9): always when
/// `requireMention` is off; otherwise only on an explicit mention, an
/// on-char-prefix trigger, or an authorized control command.
#[must_use]
pub fn should_process_group_message(
    text: &str,
    policy: &ChannelPolicy,
    transport_detected_mention: bool,
    command_authorized: bool,
) -> bool {
    if !policy.require_mention {
        return true;
    }

    if is_explicit_mention(text, &policy.mention_aliases, transport_detected_mention)
        || is_on_char_triggered(text, policy.on_char_prefix.as_deref())
    {
        return true;
    }

    is_control_command(text, &policy.command_prefixes) && command_authorized
}
