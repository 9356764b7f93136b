#![forbid(unsafe_code)]

//! Literal key schema shared by every relay instance. Relays on different
//! hosts must agree on these byte-for-byte, so nothing here is configurable.

/// TTL applied to per-client keys and room history.
pub const CLIENT_TTL_SECS: u64 = 24 * 60 * 60;

/// Upper bound on stored history entries per room.
pub const HISTORY_LIMIT: i64 = 100;

/// Pattern matching every room's pub/sub channel.
pub const ALL_ROOMS_PATTERN: &str = "room:*";

/// `client:<id>` → room id.
pub fn client(id: &str) -> String {
	format!("client:{id}")
}

/// `client:<id>:meta` → hash `{joined_at, user_agent}`.
pub fn client_meta(id: &str) -> String {
	format!("client:{id}:meta")
}

/// `room:<id>:clients` → set of client ids.
pub fn room_clients(room: &str) -> String {
	format!("room:{room}:clients")
}

/// `room:<id>:meta` → hash `{created_at, last_seen}`.
pub fn room_meta(room: &str) -> String {
	format!("room:{room}:meta")
}

/// `room:<id>:messages` → list, newest at head.
pub fn room_messages(room: &str) -> String {
	format!("room:{room}:messages")
}

/// `room:<id>` → pub/sub channel for room fan-out.
pub fn room_channel(room: &str) -> String {
	format!("room:{room}")
}

/// `rooms:active` → set of rooms with at least one member.
pub fn active_rooms() -> &'static str {
	"rooms:active"
}

/// Recover the room id from a pub/sub channel name.
pub fn room_of_channel(channel: &str) -> Option<&str> {
	channel.strip_prefix("room:")
}
