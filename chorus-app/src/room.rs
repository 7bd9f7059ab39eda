//! Per-room conversation state machine.
//!
//! Each room owns its rolling turn window, running summary, and the
//! coordination state that keeps generations serialized: a busy flag while a
//! summarization is in flight, a single-slot waiter for messages that arrive
//! during it, and the cancellation token of the active response generation.
//!
//! Message handling is split in two. `admit` runs on the dispatcher before
//! any suspension, so history order always matches arrival order; `process`
//! runs on a spawned task and may suspend while streaming or while parked in
//! the waiter slot.

use crate::aliases::ChatMessage;
use crate::bot::BotContext;
use crate::config::RespondPolicy;
use crate::reactions;
use crate::reply::{PersonaReply, ReplyShape, SummaryReply, reply_schema, summary_schema};
use anyhow::Result;
use chorus_channels::{EventId, RoomId};
use chorus_llm::{ChatRequest, Turn, generate};
use std::time::Duration;
use tokio::sync::{Mutex, oneshot};
use tokio_util::sync::CancellationToken;

/// Rolling window threshold: exceeding this triggers a summarization.
pub const WINDOW_TURNS: usize = 30;

const TYPING_TIMEOUT: Duration = Duration::from_secs(120);

const SUMMARIZE_INSTRUCTION: &str = "Given a summary of the conversation so far and the \
    conversation that has happened since you must concisely update the summary. The summary \
    MUST be no more than 200 words.\nExample:\n{\"summary\":\"sally was asking about good \
    computers to buy. george recommended she look into thinkpads. bob shared his elaborate \
    breakfast of waffles and pancakes.\"}";

const SUMMARIZE_CLOSING: &str = "Write an updated summary for the conversation.";

pub struct Room {
    id: RoomId,
    state: Mutex<RoomState>,
}

#[derive(Default)]
struct RoomState {
    turns: Vec<Turn>,
    summary: String,
    busy: bool,
    /// Single-slot continuation for a message that arrived while busy.
    /// Installing a new waiter resolves the previous one with `false`.
    waiter: Option<oneshot::Sender<bool>>,
    /// Sticky "this room owes a reply" signal.
    respond: bool,
    active: Option<CancellationToken>,
    admit_seq: u64,
    active_seq: u64,
}

/// Outcome of admitting a message: either handle it now, or park until the
/// in-flight summarization resolves the waiter slot.
pub enum Admission {
    Proceed { seq: u64 },
    Wait { seq: u64, rx: oneshot::Receiver<bool> },
}

impl Room {
    pub fn new(id: RoomId) -> Self {
        Self {
            id,
            state: Mutex::new(RoomState::default()),
        }
    }

    pub fn id(&self) -> &RoomId {
        &self.id
    }

    /// Append the message to history and claim a handling slot. Runs before
    /// any suspension so appends happen in arrival order.
    pub async fn admit(&self, msg: &ChatMessage) -> Result<Admission> {
        let mut st = self.state.lock().await;
        st.turns.push(Turn::user(serde_json::to_string(msg)?));
        st.admit_seq += 1;
        let seq = st.admit_seq;

        if st.busy {
            // A newer arrival supersedes whoever was already waiting.
            if let Some(previous) = st.waiter.take() {
                let _ = previous.send(false);
            }
            let (tx, rx) = oneshot::channel();
            st.waiter = Some(tx);
            return Ok(Admission::Wait { seq, rx });
        }
        Ok(Admission::Proceed { seq })
    }

    /// Drive one admitted message through summarization and the respond
    /// decision. Failures along the generation path degrade to "no action
    /// this turn"; only unexpected serialization errors propagate.
    #[tracing::instrument(level = "debug", skip_all, fields(room = %self.id))]
    pub async fn process(
        &self,
        ctx: &BotContext,
        admission: Admission,
        msg: ChatMessage,
        event_id: EventId,
    ) -> Result<()> {
        let seq = match admission {
            Admission::Proceed { seq } => seq,
            Admission::Wait { seq, rx } => {
                if !matches!(rx.await, Ok(true)) {
                    tracing::debug!("superseded while waiting on busy room");
                    return Ok(());
                }
                seq
            }
        };

        if self.maybe_summarize(ctx).await? {
            // Control passed to the pending waiter; this call is done.
            return Ok(());
        }

        // Cancel any stale in-flight generation and take the slot, unless an
        // even newer arrival already owns it.
        let token = {
            let mut st = self.state.lock().await;
            let mentioned = ctx.mention.is_match(&msg.message);
            if ctx.persona.respond == RespondPolicy::Always || mentioned {
                st.respond = true;
            }
            if seq < st.active_seq {
                None
            } else {
                if let Some(previous) = st.active.take() {
                    previous.cancel();
                }
                let token = CancellationToken::new();
                st.active = Some(token.clone());
                st.active_seq = seq;
                Some(token)
            }
        };

        if let Err(error) = ctx.client.send_read_receipt(&self.id, &event_id).await {
            tracing::warn!(%error, "failed to send read receipt");
        }

        let Some(cancel) = token else {
            return Ok(());
        };

        let (turns, summary, must_respond) = {
            let st = self.state.lock().await;
            (st.turns.clone(), st.summary.clone(), st.respond)
        };

        // A mentioned-only persona with reactions off has nothing to generate
        // unless it owes a reply.
        if ctx.persona.respond == RespondPolicy::Mentioned
            && !must_respond
            && !ctx.persona.reactions
        {
            return Ok(());
        }

        let shape = if must_respond {
            ReplyShape::MandatoryMessage
        } else if ctx.persona.respond == RespondPolicy::Sometimes {
            ReplyShape::OptionalMessage
        } else {
            ReplyShape::NoMessage
        };
        let request = self.response_request(ctx, &summary, turns, shape);

        if must_respond {
            if let Err(error) = ctx
                .client
                .set_typing(&self.id, true, TYPING_TIMEOUT)
                .await
            {
                tracing::warn!(%error, "failed to set typing");
            }
        }

        let outcome = generate::<PersonaReply>(ctx.backend.as_ref(), &cancel, request).await;
        let Some(reply) = outcome.complete() else {
            return Ok(());
        };
        let reply = match reply.validated(shape, &ctx.persona.username) {
            Ok(reply) => reply,
            Err(reason) => {
                tracing::warn!(%reason, "discarding invalid reply");
                return Ok(());
            }
        };

        if ctx.persona.reactions && reply.feeling != reactions::NO_FEELING {
            match reactions::glyph(&reply.feeling) {
                Some(glyph) => {
                    if let Err(error) =
                        ctx.client.send_reaction(&self.id, &event_id, glyph).await
                    {
                        tracing::warn!(%error, "failed to send reaction");
                    }
                }
                None => tracing::warn!(feeling = %reply.feeling, "no glyph for feeling"),
            }
        }

        // React-only outcome: nothing to send, history untouched, and the
        // respond flag keeps whatever it was.
        let Some(body) = reply.message.clone().filter(|m| !m.is_empty()) else {
            return Ok(());
        };

        {
            let mut st = self.state.lock().await;
            if st.active_seq == seq {
                st.active = None;
            }
            st.turns.push(Turn::assistant(serde_json::to_string(&reply)?));
        }

        if let Err(error) = ctx.client.send_text(&self.id, &body).await {
            tracing::warn!(%error, "failed to send reply text");
        }
        if let Err(error) = ctx
            .client
            .set_typing(&self.id, false, Duration::ZERO)
            .await
        {
            tracing::debug!(%error, "failed to clear typing");
        }

        self.state.lock().await.respond = false;
        Ok(())
    }

    /// Trim and summarize when the window has overflowed. Returns true when
    /// control was handed to a pending waiter and this call must stop.
    async fn maybe_summarize(&self, ctx: &BotContext) -> Result<bool> {
        let job = {
            let mut st = self.state.lock().await;
            if st.turns.len() <= WINDOW_TURNS {
                None
            } else {
                st.busy = true;
                let take = trim_count(st.turns.len());
                let removed: Vec<Turn> = st.turns.drain(..take).collect();
                Some((removed, st.summary.clone()))
            }
        };
        let Some((removed, summary)) = job else {
            return Ok(false);
        };

        tracing::debug!(trimmed = removed.len(), "summarizing older history");
        let request = summary_request(&ctx.persona.model, &summary, removed);
        let outcome = generate::<SummaryReply>(
            ctx.backend.as_ref(),
            &CancellationToken::new(),
            request,
        )
        .await;

        let mut st = self.state.lock().await;
        if let Some(reply) = outcome.complete() {
            tracing::info!(summary = %reply.summary, "room summary updated");
            st.summary = reply.summary;
        }
        st.busy = false;
        if let Some(waiter) = st.waiter.take() {
            let _ = waiter.send(true);
            return Ok(true);
        }
        Ok(false)
    }

    fn response_request(
        &self,
        ctx: &BotContext,
        summary: &str,
        turns: Vec<Turn>,
        shape: ReplyShape,
    ) -> ChatRequest {
        let username = &ctx.persona.username;
        let mut messages: Vec<Turn> = ctx
            .persona
            .system_prompts
            .iter()
            .map(Turn::system)
            .collect();
        messages.push(summary_turn(summary));
        messages.extend(turns);
        let feelings: Vec<&str> = reactions::names().collect();
        messages.push(Turn::system(format!(
            "Respond in JSON whether {username} responds (yes, no) and how {username} is \
             feeling (none, {}), and optionally the response message.",
            feelings.join(", ")
        )));
        ChatRequest {
            model: ctx.persona.model.clone(),
            messages,
            format: reply_schema(shape, username),
        }
    }
}

/// How many oldest turns a summarization removes: at least half the window,
/// or everything past it when history has grown larger.
pub fn trim_count(len: usize) -> usize {
    (WINDOW_TURNS / 2).max(len - WINDOW_TURNS)
}

fn summary_turn(summary: &str) -> Turn {
    Turn::system(format!(
        "The summary of the conversation so far is: {}",
        serde_json::json!({ "summary": summary })
    ))
}

fn summary_request(model: &str, summary: &str, removed: Vec<Turn>) -> ChatRequest {
    let mut messages = vec![Turn::system(SUMMARIZE_INSTRUCTION), summary_turn(summary)];
    messages.extend(removed);
    messages.push(Turn::system(SUMMARIZE_CLOSING));
    ChatRequest {
        model: model.to_string(),
        messages,
        format: summary_schema(),
    }
}

#[cfg(test)]
impl Room {
    pub(crate) async fn turns(&self) -> Vec<Turn> {
        self.state.lock().await.turns.clone()
    }

    pub(crate) async fn summary(&self) -> String {
        self.state.lock().await.summary.clone()
    }

    pub(crate) async fn owes_reply(&self) -> bool {
        self.state.lock().await.respond
    }
}
