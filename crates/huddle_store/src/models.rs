#![forbid(unsafe_code)]

use chrono::{DateTime, Utc};
use huddle_domain::{ClientId, RoomId};
use serde::{Deserialize, Serialize};

/// Persisted client record. Written on register, deleted on unregister.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientInfo {
	pub id: ClientId,
	pub room_id: RoomId,
	pub joined_at: DateTime<Utc>,
	#[serde(default, skip_serializing_if = "String::is_empty")]
	pub user_agent: String,
}

impl ClientInfo {
	/// Record for a client joining `room` right now.
	pub fn joining(id: ClientId, room_id: RoomId, user_agent: impl Into<String>) -> Self {
		Self {
			id,
			room_id,
			joined_at: Utc::now(),
			user_agent: user_agent.into(),
		}
	}
}

/// Point-in-time view of one room.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomStats {
	pub room_id: String,
	pub clients_count: u64,
	#[serde(default)]
	pub created_at: Option<DateTime<Utc>>,
	#[serde(default)]
	pub last_seen: Option<DateTime<Utc>>,
}
