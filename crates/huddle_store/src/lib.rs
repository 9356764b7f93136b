#![forbid(unsafe_code)]

pub mod error;
pub mod keys;
pub mod memory;
pub mod models;
pub mod redis;
pub mod subscription;

use async_trait::async_trait;
use huddle_domain::{ChatMessage, ClientId, RoomId};

pub use crate::error::StoreError;
pub use crate::memory::MemoryStore;
pub use crate::models::{ClientInfo, RoomStats};
pub use crate::redis::RedisStore;
pub use crate::subscription::{RoomEvent, RoomSubscription};

/// Typed surface over the shared key-value + pub/sub substrate.
///
/// Mutations are atomic at pipeline granularity only; no operation spans a
/// cross-key transaction. Every substrate error propagates to the caller.
#[async_trait]
pub trait Store: Send + Sync {
	/// Register a client: client→room mapping, membership, meta, room
	/// liveness bookkeeping. All keys carry the 24 h TTL where specified.
	async fn add_client(&self, info: &ClientInfo) -> Result<(), StoreError>;

	/// Remove a client and, if its room became empty, wipe the room
	/// (membership, meta, history, active-set entry) in one atomic step.
	/// Fails with [`StoreError::ClientNotFound`] when the client is absent.
	async fn remove_client(&self, id: ClientId) -> Result<(), StoreError>;

	async fn client_room(&self, id: ClientId) -> Result<RoomId, StoreError>;
	async fn client_info(&self, id: ClientId) -> Result<ClientInfo, StoreError>;
	async fn client_exists(&self, id: ClientId) -> Result<bool, StoreError>;

	async fn room_members(&self, room: &RoomId) -> Result<Vec<String>, StoreError>;
	async fn room_member_count(&self, room: &RoomId) -> Result<u64, StoreError>;
	async fn is_member(&self, id: ClientId, room: &RoomId) -> Result<bool, StoreError>;
	async fn active_rooms(&self) -> Result<Vec<String>, StoreError>;
	async fn room_stats(&self, room: &RoomId) -> Result<RoomStats, StoreError>;
	async fn room_exists(&self, room: &RoomId) -> Result<bool, StoreError>;

	/// Publish a serialized record on the room's channel.
	async fn publish_message(&self, room: &RoomId, msg: &ChatMessage) -> Result<(), StoreError>;

	/// Append to room history, trimmed to the newest 100 entries.
	async fn save_message(&self, room: &RoomId, msg: &ChatMessage) -> Result<(), StoreError>;

	/// Newest-first history. Limits outside `1..=100` fall back to 50.
	async fn recent_messages(&self, room: &RoomId, limit: i64) -> Result<Vec<ChatMessage>, StoreError>;

	/// Wipe everything about a room, including its clients.
	async fn clear_room(&self, room: &RoomId) -> Result<(), StoreError>;

	/// Pattern-subscribe to every room channel at once.
	async fn subscribe_all_rooms(&self) -> Result<RoomSubscription, StoreError>;

	/// Substrate liveness probe.
	async fn ping(&self) -> Result<(), StoreError>;
}

/// Clamp a caller-supplied history limit into the supported window.
pub(crate) fn clamp_history_limit(limit: i64) -> i64 {
	if limit <= 0 || limit > keys::HISTORY_LIMIT { 50 } else { limit }
}
