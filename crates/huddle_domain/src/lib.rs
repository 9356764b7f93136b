#![forbid(unsafe_code)]

use core::fmt;
use core::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Errors for parsing identifiers from strings.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseIdError {
	#[error("empty value")]
	Empty,
	#[error("invalid client id: {0}")]
	InvalidClientId(String),
}

/// Server-assigned client identity, stable for the life of one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(Uuid);

impl ClientId {
	/// Mint a fresh identity for a new connection.
	pub fn generate() -> Self {
		Self(Uuid::new_v4())
	}

	/// Canonical hyphenated UUID form.
	pub fn to_canonical(&self) -> String {
		self.0.to_string()
	}

	/// 8-char prefix used in human-facing log lines.
	pub fn short(&self) -> String {
		let s = self.0.to_string();
		s[..8].to_string()
	}
}

impl fmt::Display for ClientId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		self.0.fmt(f)
	}
}

impl FromStr for ClientId {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let s = s.trim();
		if s.is_empty() {
			return Err(ParseIdError::Empty);
		}
		Uuid::parse_str(s)
			.map(Self)
			.map_err(|_| ParseIdError::InvalidClientId(s.to_string()))
	}
}

/// Opaque room identifier. Client-supplied at upgrade time or server-assigned.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomId(String);

impl RoomId {
	/// Create a non-empty `RoomId`.
	pub fn new(id: impl Into<String>) -> Result<Self, ParseIdError> {
		let id = id.into();
		if id.trim().is_empty() {
			return Err(ParseIdError::Empty);
		}
		Ok(Self(id))
	}

	/// Mint a fresh UUID-named room for upgrades that carry no `?room`.
	pub fn generated() -> Self {
		Self(Uuid::new_v4().to_string())
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}

	pub fn into_string(self) -> String {
		self.0
	}
}

impl fmt::Display for RoomId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl FromStr for RoomId {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		RoomId::new(s.to_string())
	}
}

/// Sender id used on the wire: a client id, or the literal `system`.
pub const SYSTEM_SENDER: &str = "system";

/// Normalized chat record as published on the substrate and relayed to peers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
	#[serde(rename = "type")]
	pub kind: String,
	pub from: String,
	pub room_id: String,
	pub content: String,
	pub timestamp: DateTime<Utc>,
}

impl ChatMessage {
	/// Build a chat record stamped with the current time.
	pub fn chat(from: impl Into<String>, room: &RoomId, content: impl Into<String>) -> Self {
		Self {
			kind: "chat".to_string(),
			from: from.into(),
			room_id: room.as_str().to_string(),
			content: content.into(),
			timestamp: Utc::now(),
		}
	}

	pub fn to_json(&self) -> Result<String, serde_json::Error> {
		serde_json::to_string(self)
	}

	pub fn from_json(data: &str) -> Result<Self, serde_json::Error> {
		serde_json::from_str(data)
	}
}

/// First frame the server writes on a fresh connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WelcomeFrame {
	#[serde(rename = "type")]
	pub kind: String,
	#[serde(rename = "clientId")]
	pub client_id: String,
	#[serde(rename = "roomId")]
	pub room_id: String,
}

impl WelcomeFrame {
	pub fn new(client: ClientId, room: &RoomId) -> Self {
		Self {
			kind: "welcome".to_string(),
			client_id: client.to_canonical(),
			room_id: room.as_str().to_string(),
		}
	}
}

/// Media credential frame delivered after registration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenFrame {
	#[serde(rename = "type")]
	pub kind: String,
	pub token: String,
	#[serde(rename = "livekitUrl")]
	pub livekit_url: String,
	pub room: String,
	pub identity: String,
}

impl TokenFrame {
	pub fn new(token: String, livekit_url: String, room: &RoomId, identity: ClientId) -> Self {
		Self {
			kind: "livekit-token".to_string(),
			token,
			livekit_url,
			room: room.as_str().to_string(),
			identity: identity.to_canonical(),
		}
	}
}

/// String wrapper that never leaks its contents through Debug/Display/serde.
#[derive(Clone, PartialEq, Eq)]
pub struct SecretString(String);

impl SecretString {
	pub fn new(s: impl Into<String>) -> Self {
		Self(s.into())
	}

	/// Access the inner secret string.
	pub fn expose(&self) -> &str {
		&self.0
	}
}

impl fmt::Debug for SecretString {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("SecretString(<redacted>)")
	}
}

impl fmt::Display for SecretString {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("<redacted>")
	}
}

impl Serialize for SecretString {
	fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
	where
		S: serde::Serializer,
	{
		serializer.serialize_str("")
	}
}

impl<'de> Deserialize<'de> for SecretString {
	fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
	where
		D: serde::Deserializer<'de>,
	{
		let s = String::deserialize(deserializer)?;
		Ok(Self(s))
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn client_id_roundtrips_through_canonical_form() {
		let id = ClientId::generate();
		let parsed: ClientId = id.to_canonical().parse().expect("canonical form parses");
		assert_eq!(id, parsed);
	}

	#[test]
	fn client_id_short_is_an_eight_char_prefix() {
		let id = ClientId::generate();
		let short = id.short();
		assert_eq!(short.len(), 8);
		assert!(id.to_canonical().starts_with(&short));
	}

	#[test]
	fn client_id_rejects_garbage() {
		assert!(matches!("".parse::<ClientId>(), Err(ParseIdError::Empty)));
		assert!(matches!(
			"not-a-uuid".parse::<ClientId>(),
			Err(ParseIdError::InvalidClientId(_))
		));
	}

	#[test]
	fn room_id_rejects_blank() {
		assert!(RoomId::new("   ").is_err());
		assert!(RoomId::new("standup").is_ok());
	}

	#[test]
	fn chat_message_roundtrips() {
		let room = RoomId::new("x").unwrap();
		let msg = ChatMessage::chat(ClientId::generate().to_canonical(), &room, "hi");

		let json = msg.to_json().unwrap();
		let back = ChatMessage::from_json(&json).unwrap();
		assert_eq!(msg, back);
	}

	#[test]
	fn chat_message_wire_field_names() {
		let room = RoomId::new("x").unwrap();
		let msg = ChatMessage::chat("a", &room, "hi");
		let v: serde_json::Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();

		assert_eq!(v["type"], "chat");
		assert_eq!(v["from"], "a");
		assert_eq!(v["room_id"], "x");
		assert_eq!(v["content"], "hi");
		assert!(v["timestamp"].is_string());
	}

	#[test]
	fn welcome_and_token_frames_use_camel_case_keys() {
		let room = RoomId::new("x").unwrap();
		let id = ClientId::generate();

		let welcome = serde_json::to_value(WelcomeFrame::new(id, &room)).unwrap();
		assert_eq!(welcome["type"], "welcome");
		assert_eq!(welcome["clientId"], id.to_canonical());
		assert_eq!(welcome["roomId"], "x");

		let token = serde_json::to_value(TokenFrame::new("t".into(), "wss://lk".into(), &room, id)).unwrap();
		assert_eq!(token["type"], "livekit-token");
		assert_eq!(token["livekitUrl"], "wss://lk");
		assert_eq!(token["identity"], id.to_canonical());
	}

	proptest::proptest! {
		#[test]
		fn chat_message_roundtrips_for_any_content(
			content in ".*",
			room in "[a-zA-Z0-9_-]{1,32}",
		) {
			let room = RoomId::new(room).unwrap();
			let msg = ChatMessage::chat("sender", &room, content);
			let back = ChatMessage::from_json(&msg.to_json().unwrap()).unwrap();
			proptest::prop_assert_eq!(&msg, &back);
		}
	}

	#[test]
	fn secret_string_redacts_everywhere() {
		let s = SecretString::new("hunter2");
		assert_eq!(format!("{s}"), "<redacted>");
		assert_eq!(format!("{s:?}"), "SecretString(<redacted>)");
		assert_eq!(serde_json::to_string(&s).unwrap(), "\"\"");
		assert_eq!(s.expose(), "hunter2");
	}
}
