use crate::error::Result;
use futures_util::Stream;
use serde::{Deserialize, Serialize};
use std::pin::Pin;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// One role-tagged entry in a room's conversation history.
///
/// For `user` and `assistant` turns the content is a serialized JSON object
/// (chat message or persona reply); for `system` turns it is free text.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub content: String,
}

impl Turn {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// A structured chat exchange: ordered turns plus a JSON-schema output
/// constraint the backend enforces on the generated text.
#[derive(Debug, Clone, Serialize)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<Turn>,
    pub format: serde_json::Value,
}

#[derive(Debug, Clone)]
pub enum StreamChunk {
    Delta { content: String },
    Done,
}

pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<StreamChunk>> + Send>>;

/// Seam over the model backend. The production implementation is
/// [`crate::OllamaClient`]; tests substitute scripted streams.
#[async_trait::async_trait]
pub trait ChatBackend: Send + Sync {
    /// Submit `request` for streaming generation. Dropping the returned
    /// stream aborts the backend call.
    async fn chat_stream(&self, request: ChatRequest) -> Result<ChunkStream>;
}
