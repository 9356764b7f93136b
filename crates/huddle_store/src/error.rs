#![forbid(unsafe_code)]

use thiserror::Error;

/// Errors surfaced by the store adapter. Substrate failures propagate
/// unchanged; the missing-record cases get their own variants so callers
/// can treat a double-unregister as a warning rather than an error.
#[derive(Debug, Error)]
pub enum StoreError {
	#[error("client not found")]
	ClientNotFound,

	#[error("room not found")]
	RoomNotFound,

	#[error(transparent)]
	Redis(#[from] redis::RedisError),

	#[error("serialize record: {0}")]
	Serialize(#[from] serde_json::Error),
}

impl StoreError {
	/// True for the missing-record variants.
	pub fn is_not_found(&self) -> bool {
		matches!(self, StoreError::ClientNotFound | StoreError::RoomNotFound)
	}
}
