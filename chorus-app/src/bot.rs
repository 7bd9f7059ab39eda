//! Per-persona runtime: receives room events from the channel client and
//! dispatches them into per-room state machines.
//!
//! The dispatch loop is the serialization point. Admitting a message into a
//! room happens here, before the handling task is spawned, so a room's
//! history always reflects arrival order even though handling itself is
//! concurrent.

use crate::aliases::{self, RewriteRule};
use crate::config::PersonaConfig;
use crate::room::Room;
use anyhow::{Context, Result};
use chorus_channels::{RoomClient, RoomId, RoomMessage};
use chorus_llm::ChatBackend;
use dashmap::DashMap;
use regex::Regex;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Everything a room needs to handle a message for one persona.
pub struct BotContext {
    pub persona: PersonaConfig,
    /// Whole-word, case-sensitive match on the persona's username.
    pub mention: regex::Regex,
    pub rules: Vec<RewriteRule>,
    pub client: Arc<dyn RoomClient>,
    pub backend: Arc<dyn ChatBackend>,
}

impl BotContext {
    pub fn new(
        persona: PersonaConfig,
        client: Arc<dyn RoomClient>,
        backend: Arc<dyn ChatBackend>,
    ) -> Result<Self> {
        let mention = Regex::new(&format!(r"\b{}\b", regex::escape(&persona.username)))
            .with_context(|| format!("mention pattern for {:?}", persona.username))?;
        let rules = aliases::compile_rules(&persona.message_aliases)?;
        Ok(Self {
            persona,
            mention,
            rules,
            client,
            backend,
        })
    }
}

pub struct BotRuntime {
    ctx: Arc<BotContext>,
    rooms: DashMap<RoomId, Arc<Room>>,
}

impl BotRuntime {
    pub fn new(ctx: Arc<BotContext>) -> Arc<Self> {
        Arc::new(Self {
            ctx,
            rooms: DashMap::new(),
        })
    }

    /// Start the channel client and pump its events until the stream ends.
    #[tracing::instrument(level = "info", skip_all, fields(persona = %self.ctx.persona.username))]
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let (tx, mut rx) = mpsc::channel(64);
        self.ctx.client.start(tx).await?;
        tracing::info!("persona runtime started");
        while let Some(event) = rx.recv().await {
            if let Err(error) = self.handle(event).await {
                tracing::warn!(%error, "failed to dispatch room event");
            }
        }
        tracing::info!("event stream closed, persona runtime stopping");
        Ok(())
    }

    /// Resolve one event and hand it to its room. Admission runs inline;
    /// the rest of the handling is spawned.
    pub(crate) async fn handle(self: &Arc<Self>, event: RoomMessage) -> Result<()> {
        let Some(message) = aliases::resolve_message(
            &event.sender,
            &event.body,
            event.kind,
            &self.ctx.persona.aliases,
            &self.ctx.rules,
        ) else {
            tracing::debug!(sender = %event.sender, "dropping event with unusable sender");
            return Ok(());
        };

        let room = self
            .rooms
            .entry(event.room_id.clone())
            .or_insert_with(|| Arc::new(Room::new(event.room_id.clone())))
            .clone();

        let admission = room.admit(&message).await?;
        let ctx = self.ctx.clone();
        tokio::spawn(async move {
            if let Err(error) = room.process(&ctx, admission, message, event.event_id).await {
                tracing::warn!(%error, room = %room.id(), "message handling failed");
            }
        });
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn room(&self, id: &RoomId) -> Option<Arc<Room>> {
        self.rooms.get(id).map(|r| r.clone())
    }

    #[cfg(test)]
    pub(crate) fn room_count(&self) -> usize {
        self.rooms.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aliases::ChatMessage;
    use crate::config::RespondPolicy;
    use crate::testutil::{FakeRoomClient, ScriptedBackend};
    use chorus_channels::{EventId, RoomMessageKind, UserId};
    use chorus_llm::Role;
    use std::collections::HashMap;

    fn persona() -> PersonaConfig {
        PersonaConfig {
            model: "llama3".to_string(),
            homeserver_url: "https://matrix.example.org".to_string(),
            user_id: "@george:example.org".to_string(),
            access_token: Some("token".to_string()),
            username: "george".to_string(),
            password: "pw".to_string(),
            reactions: false,
            respond: RespondPolicy::Mentioned,
            ollama_url: "http://localhost:11434".to_string(),
            aliases: HashMap::new(),
            message_aliases: vec![crate::config::MessageAliasRule {
                pattern: "^relay: (.*)$".to_string(),
                alias: "relay".to_string(),
            }],
            system_prompts: vec!["You are george.".to_string()],
        }
    }

    fn runtime() -> (Arc<BotRuntime>, Arc<ScriptedBackend>) {
        let client = Arc::new(FakeRoomClient::new("@george:example.org"));
        let backend = Arc::new(ScriptedBackend::new());
        let ctx = Arc::new(
            BotContext::new(persona(), client, backend.clone()).expect("context"),
        );
        (BotRuntime::new(ctx), backend)
    }

    fn event(room: &str, sender: &str, body: &str, id: &str) -> RoomMessage {
        RoomMessage {
            room_id: RoomId::new(room),
            event_id: EventId::new(id),
            sender: UserId::new(sender),
            kind: RoomMessageKind::Text,
            body: body.to_string(),
        }
    }

    #[tokio::test]
    async fn events_land_in_per_room_histories_in_arrival_order() {
        let (rt, _backend) = runtime();
        for (i, body) in ["first", "second", "third"].iter().enumerate() {
            rt.handle(event("!a:x", "@sally:x", body, &format!("$a{i}")))
                .await
                .expect("handle");
        }
        rt.handle(event("!b:x", "@sally:x", "elsewhere", "$b0"))
            .await
            .expect("handle");

        assert_eq!(rt.room_count(), 2);
        let room_a = rt.room(&RoomId::new("!a:x")).expect("room a");
        let turns = room_a.turns().await;
        assert_eq!(turns.len(), 3);
        assert!(turns.iter().all(|t| t.role == Role::User));
        assert!(turns[0].content.contains("first"));
        assert!(turns[2].content.contains("third"));
    }

    #[tokio::test]
    async fn unusable_sender_creates_no_room() {
        let (rt, backend) = runtime();
        rt.handle(event("!a:x", "not-a-user-id", "hello", "$a0"))
            .await
            .expect("handle");

        assert_eq!(rt.room_count(), 0);
        assert_eq!(backend.calls(), 0);
    }

    #[tokio::test]
    async fn rewrite_rules_apply_before_history() {
        let (rt, _backend) = runtime();
        rt.handle(event("!a:x", "@bridge:x", "relay: hi from irc", "$a0"))
            .await
            .expect("handle");

        let room = rt.room(&RoomId::new("!a:x")).expect("room");
        let turns = room.turns().await;
        let parsed: ChatMessage = serde_json::from_str(&turns[0].content).expect("json");
        assert_eq!(parsed.from, "relay");
        assert_eq!(parsed.message, "hi from irc");
    }

    #[test]
    fn mention_matching_is_case_sensitive() {
        let client = Arc::new(FakeRoomClient::new("@george:example.org"));
        let backend = Arc::new(ScriptedBackend::new());
        let ctx = BotContext::new(persona(), client, backend).expect("context");
        assert!(ctx.mention.is_match("george, are you there?"));
        assert!(!ctx.mention.is_match("George, are you there?"));
    }

    #[test]
    fn mention_regex_escapes_the_username() {
        let mut p = persona();
        p.username = "c++bot".to_string();
        let client = Arc::new(FakeRoomClient::new("@c:x"));
        let backend = Arc::new(ScriptedBackend::new());
        let ctx = BotContext::new(p, client, backend).expect("context");
        assert!(ctx.mention.is_match("ping c++bot please"));
        assert!(!ctx.mention.is_match("cbot"));
    }
}
