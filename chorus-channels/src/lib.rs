//! Messaging-network client for chorus personas.
//!
//! The `RoomClient` trait is the seam the bot runtime talks through; the
//! Matrix implementation converts homeserver sync events to `RoomMessage`
//! values and sends text, reactions, receipts, and typing state back.

mod matrix;
mod traits;
mod types;

pub use matrix::{MatrixClient, MatrixCredentials};
pub use traits::RoomClient;
pub use types::{EventId, RoomId, RoomMessage, RoomMessageKind, UserId};
