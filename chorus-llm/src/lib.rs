//! Streaming chat client for the Ollama wire protocol.
//!
//! Pure HTTP client plus the cancellation-aware generation adapter used by
//! the room state machine.

mod error;
mod generate;
mod ollama;
mod types;

pub use error::{LlmError, Result};
pub use generate::{GenOutcome, generate};
pub use ollama::{KEEP_ALIVE_SECS, OllamaClient};
pub use types::{ChatBackend, ChatRequest, ChunkStream, Role, StreamChunk, Turn};
