use crate::types::{EventId, RoomId, RoomMessage, UserId};
use anyhow::Result;
use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::mpsc;

#[async_trait]
pub trait RoomClient: Send + Sync {
    /// The persona's own network identity; used for self-filtering.
    fn user_id(&self) -> &UserId;

    /// Start receiving events. Push to tx for each inbound room message.
    async fn start(&self, tx: mpsc::Sender<RoomMessage>) -> Result<()>;

    /// Send a plain text message into a room.
    async fn send_text(&self, room: &RoomId, body: &str) -> Result<EventId>;

    /// Annotate an event with a reaction glyph.
    async fn send_reaction(&self, room: &RoomId, event: &EventId, key: &str) -> Result<()>;

    /// Mark an event as read.
    async fn send_read_receipt(&self, room: &RoomId, event: &EventId) -> Result<()>;

    /// Toggle the typing indicator; `timeout` bounds how long the server
    /// keeps it active when `active` is true.
    async fn set_typing(&self, room: &RoomId, active: bool, timeout: Duration) -> Result<()>;
}
