//! Shared fakes for state-machine tests: a scripted model backend and a
//! recording room client.

use anyhow::Result;
use chorus_channels::{EventId, RoomClient, RoomId, RoomMessage, UserId};
use chorus_llm::{ChatBackend, ChatRequest, ChunkStream, LlmError, StreamChunk};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;

/// Backend that hands out pre-queued chunk streams in FIFO order and records
/// every request it sees.
pub struct ScriptedBackend {
    streams: Mutex<Vec<mpsc::UnboundedReceiver<chorus_llm::Result<StreamChunk>>>>,
    requests: Mutex<Vec<ChatRequest>>,
    calls: AtomicUsize,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self {
            streams: Mutex::new(Vec::new()),
            requests: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
        }
    }

    /// Queue a stream and keep its sender: the stream stays open until the
    /// test sends `Done` or drops the sender.
    pub fn push_stream(&self) -> mpsc::UnboundedSender<chorus_llm::Result<StreamChunk>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.streams.lock().expect("lock").push(rx);
        tx
    }

    /// Queue a stream that immediately yields `json` and completes.
    pub fn push_json(&self, json: &str) {
        let tx = self.push_stream();
        send_json(&tx, json);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<ChatRequest> {
        self.requests.lock().expect("lock").clone()
    }

    /// Block until the backend has seen at least `n` calls.
    pub async fn wait_for_calls(&self, n: usize) {
        for _ in 0..500 {
            if self.calls() >= n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        panic!("backend never reached {n} call(s); saw {}", self.calls());
    }
}

pub fn send_json(tx: &mpsc::UnboundedSender<chorus_llm::Result<StreamChunk>>, json: &str) {
    let _ = tx.send(Ok(StreamChunk::Delta {
        content: json.to_string(),
    }));
    let _ = tx.send(Ok(StreamChunk::Done));
}

#[async_trait::async_trait]
impl ChatBackend for ScriptedBackend {
    async fn chat_stream(&self, request: ChatRequest) -> chorus_llm::Result<ChunkStream> {
        self.requests.lock().expect("lock").push(request);
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut streams = self.streams.lock().expect("lock");
        if streams.is_empty() {
            return Err(LlmError::Http("no scripted stream queued".to_string()));
        }
        let rx = streams.remove(0);
        Ok(Box::pin(futures_util::stream::unfold(
            rx,
            |mut rx| async move { rx.recv().await.map(|item| (item, rx)) },
        )))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SentCall {
    ReadReceipt { event: String },
    Typing { active: bool },
    Reaction { event: String, key: String },
    Text { body: String },
}

/// Room client that records every network side effect in order.
pub struct FakeRoomClient {
    user_id: UserId,
    calls: Mutex<Vec<SentCall>>,
}

impl FakeRoomClient {
    pub fn new(user_id: &str) -> Self {
        Self {
            user_id: UserId::new(user_id),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<SentCall> {
        self.calls.lock().expect("lock").clone()
    }

    pub fn texts(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                SentCall::Text { body } => Some(body),
                _ => None,
            })
            .collect()
    }

    pub fn reactions(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                SentCall::Reaction { key, .. } => Some(key),
                _ => None,
            })
            .collect()
    }

    fn record(&self, call: SentCall) {
        self.calls.lock().expect("lock").push(call);
    }
}

#[async_trait::async_trait]
impl RoomClient for FakeRoomClient {
    fn user_id(&self) -> &UserId {
        &self.user_id
    }

    async fn start(&self, _tx: mpsc::Sender<RoomMessage>) -> Result<()> {
        Ok(())
    }

    async fn send_text(&self, _room: &RoomId, body: &str) -> Result<EventId> {
        self.record(SentCall::Text {
            body: body.to_string(),
        });
        Ok(EventId::new("$sent"))
    }

    async fn send_reaction(&self, _room: &RoomId, event: &EventId, key: &str) -> Result<()> {
        self.record(SentCall::Reaction {
            event: event.to_string(),
            key: key.to_string(),
        });
        Ok(())
    }

    async fn send_read_receipt(&self, _room: &RoomId, event: &EventId) -> Result<()> {
        self.record(SentCall::ReadReceipt {
            event: event.to_string(),
        });
        Ok(())
    }

    async fn set_typing(&self, _room: &RoomId, active: bool, _timeout: Duration) -> Result<()> {
        self.record(SentCall::Typing { active });
        Ok(())
    }
}
