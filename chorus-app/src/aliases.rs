//! Sender alias resolution and message rewriting.
//!
//! Pure functions: derive a display label from the sender identity, apply
//! per-sender overrides and ordered regex rewrite rules, and normalize the
//! body before it enters a room's history.

use crate::config::MessageAliasRule;
use anyhow::{Result, anyhow};
use chorus_channels::{RoomMessageKind, UserId};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// The wire unit exchanged with the model: serialized as the JSON content of
/// a `user` turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub from: String,
    pub message: String,
}

#[derive(Debug, Clone)]
pub struct RewriteRule {
    regex: Regex,
    alias: String,
}

pub fn compile_rules(rules: &[MessageAliasRule]) -> Result<Vec<RewriteRule>> {
    rules
        .iter()
        .map(|rule| {
            Ok(RewriteRule {
                regex: Regex::new(&rule.pattern)
                    .map_err(|e| anyhow!("invalid message alias pattern {:?}: {e}", rule.pattern))?,
                alias: rule.alias.clone(),
            })
        })
        .collect()
}

/// Resolve a raw room event into a [`ChatMessage`], or `None` when no label
/// can be derived from the sender identity (the message is dropped).
pub fn resolve_message(
    sender: &UserId,
    body: &str,
    kind: RoomMessageKind,
    overrides: &HashMap<String, String>,
    rules: &[RewriteRule],
) -> Option<ChatMessage> {
    let label = match overrides.get(sender.as_str()) {
        Some(label) => label.clone(),
        None => local_part(sender.as_str())?.to_string(),
    };
    if label.is_empty() {
        return None;
    }

    let mut message = ChatMessage {
        from: label,
        message: normalize_quotes(body),
    };

    for rule in rules {
        let Some(captures) = rule.regex.captures(&message.message) else {
            continue;
        };
        let Some(rewritten) = captures.get(1).map(|m| m.as_str()) else {
            continue;
        };
        if rewritten.is_empty() {
            continue;
        }
        message.message = rewritten.to_string();
        message.from = rule.alias.clone();
        break;
    }

    if kind == RoomMessageKind::Emote {
        message.message = format!("*{} {}", message.from, message.message);
    }

    Some(message)
}

/// `@name:server` → `name`.
fn local_part(sender: &str) -> Option<&str> {
    let rest = sender.strip_prefix('@')?;
    let (local, _server) = rest.split_once(':')?;
    if local.is_empty() { None } else { Some(local) }
}

fn normalize_quotes(body: &str) -> String {
    body.chars()
        .map(|c| match c {
            '\u{2018}' | '\u{2019}' => '\'',
            '\u{201C}' | '\u{201D}' => '"',
            other => other,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rules(pairs: &[(&str, &str)]) -> Vec<RewriteRule> {
        let configured: Vec<MessageAliasRule> = pairs
            .iter()
            .map(|(pattern, alias)| MessageAliasRule {
                pattern: (*pattern).to_string(),
                alias: (*alias).to_string(),
            })
            .collect();
        compile_rules(&configured).expect("rules compile")
    }

    fn sender(id: &str) -> UserId {
        UserId::new(id)
    }

    #[test]
    fn derives_label_from_local_part() {
        let msg = resolve_message(
            &sender("@sally:example.org"),
            "hello",
            RoomMessageKind::Text,
            &HashMap::new(),
            &[],
        )
        .expect("resolves");
        assert_eq!(msg.from, "sally");
        assert_eq!(msg.message, "hello");
    }

    #[test]
    fn override_beats_local_part() {
        let overrides =
            HashMap::from([("@sally:example.org".to_string(), "Sal".to_string())]);
        let msg = resolve_message(
            &sender("@sally:example.org"),
            "hello",
            RoomMessageKind::Text,
            &overrides,
            &[],
        )
        .expect("resolves");
        assert_eq!(msg.from, "Sal");
    }

    #[test]
    fn malformed_sender_drops_the_message() {
        for bad in ["sally", "@:example.org", "@sally", ""] {
            assert!(
                resolve_message(
                    &sender(bad),
                    "hello",
                    RoomMessageKind::Text,
                    &HashMap::new(),
                    &[]
                )
                .is_none(),
                "expected {bad:?} to be dropped"
            );
        }
    }

    #[test]
    fn normalizes_typographic_quotes() {
        let msg = resolve_message(
            &sender("@bob:example.org"),
            "\u{2018}hi\u{2019} \u{201C}there\u{201D}",
            RoomMessageKind::Text,
            &HashMap::new(),
            &[],
        )
        .expect("resolves");
        assert_eq!(msg.message, "'hi' \"there\"");
    }

    #[test]
    fn first_matching_rule_wins_and_stops() {
        let rules = rules(&[
            ("^bridge: <(?:[^>]+)> (.*)$", "first"),
            ("^bridge: (.*)$", "second"),
        ]);
        let msg = resolve_message(
            &sender("@bridge:example.org"),
            "bridge: <irc-user> hi folks",
            RoomMessageKind::Text,
            &HashMap::new(),
            &rules,
        )
        .expect("resolves");
        assert_eq!(msg.from, "first");
        assert_eq!(msg.message, "hi folks");
    }

    #[test]
    fn unmatched_rules_leave_the_message_alone() {
        let rules = rules(&[("^bridge: (.*)$", "bridge")]);
        let msg = resolve_message(
            &sender("@sally:example.org"),
            "regular message",
            RoomMessageKind::Text,
            &HashMap::new(),
            &rules,
        )
        .expect("resolves");
        assert_eq!(msg.from, "sally");
        assert_eq!(msg.message, "regular message");
    }

    #[test]
    fn emote_prefixes_the_rewritten_label() {
        let rules = rules(&[("^relay: (.*)$", "robot")]);
        let msg = resolve_message(
            &sender("@relay:example.org"),
            "relay: dances",
            RoomMessageKind::Emote,
            &HashMap::new(),
            &rules,
        )
        .expect("resolves");
        assert_eq!(msg.message, "*robot dances");
    }

    #[test]
    fn resolution_is_idempotent_on_identical_input() {
        let rules = rules(&[("^bridge: (.*)$", "bridge")]);
        let overrides = HashMap::from([("@x:example.org".to_string(), "X".to_string())]);
        let once = resolve_message(
            &sender("@x:example.org"),
            "bridge: hi",
            RoomMessageKind::Text,
            &overrides,
            &rules,
        );
        let twice = resolve_message(
            &sender("@x:example.org"),
            "bridge: hi",
            RoomMessageKind::Text,
            &overrides,
            &rules,
        );
        assert_eq!(once, twice);
    }
}
