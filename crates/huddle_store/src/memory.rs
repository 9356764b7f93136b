#![forbid(unsafe_code)]

//! In-process [`Store`] backend with loop-back publish. Backs the hub unit
//! tests and the WebSocket smoke tests, and lets a single relay run without
//! a substrate for local demos. Not shared across processes.

use std::collections::{BTreeSet, HashMap, VecDeque};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use huddle_domain::{ChatMessage, ClientId, RoomId};
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::StoreError;
use crate::models::{ClientInfo, RoomStats};
use crate::subscription::{RoomEvent, RoomSubscription, SUBSCRIPTION_QUEUE_CAPACITY};
use crate::{Store, clamp_history_limit, keys};

#[derive(Default)]
struct RoomState {
	members: BTreeSet<String>,
	created_at: Option<i64>,
	last_seen: Option<i64>,
	/// Newest first, bounded to [`keys::HISTORY_LIMIT`].
	messages: VecDeque<String>,
}

#[derive(Default)]
struct State {
	clients: HashMap<String, ClientInfo>,
	rooms: HashMap<String, RoomState>,
	active: BTreeSet<String>,
	subscribers: Vec<mpsc::Sender<RoomEvent>>,
}

impl State {
	/// Same cleanup the substrate script performs: a member leaves, and an
	/// emptied room loses its meta, history, and active-set entry.
	fn remove_member(&mut self, room: &str, id: &str) {
		let Some(entry) = self.rooms.get_mut(room) else {
			return;
		};
		entry.members.remove(id);
		if entry.members.is_empty() {
			self.rooms.remove(room);
			self.active.remove(room);
		}
	}
}

#[derive(Default)]
pub struct MemoryStore {
	state: Mutex<State>,
}

impl MemoryStore {
	pub fn new() -> Self {
		Self::default()
	}
}

#[async_trait]
impl Store for MemoryStore {
	async fn add_client(&self, info: &ClientInfo) -> Result<(), StoreError> {
		let mut state = self.state.lock().await;
		let id = info.id.to_canonical();
		let room = info.room_id.as_str().to_string();
		let now = Utc::now().timestamp();

		state.clients.insert(id.clone(), info.clone());

		let entry = state.rooms.entry(room.clone()).or_default();
		entry.members.insert(id);
		entry.last_seen = Some(now);
		entry.created_at.get_or_insert(now);

		state.active.insert(room);
		Ok(())
	}

	async fn remove_client(&self, id: ClientId) -> Result<(), StoreError> {
		let mut state = self.state.lock().await;
		let id = id.to_canonical();

		let Some(info) = state.clients.remove(&id) else {
			return Err(StoreError::ClientNotFound);
		};

		let room = info.room_id.as_str().to_string();
		state.remove_member(&room, &id);
		Ok(())
	}

	async fn client_room(&self, id: ClientId) -> Result<RoomId, StoreError> {
		let state = self.state.lock().await;
		state
			.clients
			.get(&id.to_canonical())
			.map(|info| info.room_id.clone())
			.ok_or(StoreError::ClientNotFound)
	}

	async fn client_info(&self, id: ClientId) -> Result<ClientInfo, StoreError> {
		let state = self.state.lock().await;
		state
			.clients
			.get(&id.to_canonical())
			.cloned()
			.ok_or(StoreError::ClientNotFound)
	}

	async fn client_exists(&self, id: ClientId) -> Result<bool, StoreError> {
		let state = self.state.lock().await;
		Ok(state.clients.contains_key(&id.to_canonical()))
	}

	async fn room_members(&self, room: &RoomId) -> Result<Vec<String>, StoreError> {
		let state = self.state.lock().await;
		Ok(state
			.rooms
			.get(room.as_str())
			.map(|r| r.members.iter().cloned().collect())
			.unwrap_or_default())
	}

	async fn room_member_count(&self, room: &RoomId) -> Result<u64, StoreError> {
		let state = self.state.lock().await;
		Ok(state.rooms.get(room.as_str()).map(|r| r.members.len() as u64).unwrap_or(0))
	}

	async fn is_member(&self, id: ClientId, room: &RoomId) -> Result<bool, StoreError> {
		let state = self.state.lock().await;
		Ok(state
			.rooms
			.get(room.as_str())
			.is_some_and(|r| r.members.contains(&id.to_canonical())))
	}

	async fn active_rooms(&self) -> Result<Vec<String>, StoreError> {
		let state = self.state.lock().await;
		Ok(state.active.iter().cloned().collect())
	}

	async fn room_stats(&self, room: &RoomId) -> Result<RoomStats, StoreError> {
		let state = self.state.lock().await;
		let entry = state.rooms.get(room.as_str());

		Ok(RoomStats {
			room_id: room.as_str().to_string(),
			clients_count: entry.map(|r| r.members.len() as u64).unwrap_or(0),
			created_at: entry
				.and_then(|r| r.created_at)
				.and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0)),
			last_seen: entry
				.and_then(|r| r.last_seen)
				.and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0)),
		})
	}

	async fn room_exists(&self, room: &RoomId) -> Result<bool, StoreError> {
		let state = self.state.lock().await;
		Ok(state.rooms.get(room.as_str()).is_some_and(|r| !r.members.is_empty()))
	}

	async fn publish_message(&self, room: &RoomId, msg: &ChatMessage) -> Result<(), StoreError> {
		let payload = msg.to_json()?;
		let channel = keys::room_channel(room.as_str());

		let mut state = self.state.lock().await;
		state.subscribers.retain(|tx| !tx.is_closed());
		for tx in &state.subscribers {
			if tx
				.try_send(RoomEvent {
					channel: channel.clone(),
					payload: payload.clone(),
				})
				.is_err()
			{
				warn!(room = %room, "memory store subscriber queue full, dropping event");
			}
		}
		Ok(())
	}

	async fn save_message(&self, room: &RoomId, msg: &ChatMessage) -> Result<(), StoreError> {
		let payload = msg.to_json()?;

		let mut state = self.state.lock().await;
		let entry = state.rooms.entry(room.as_str().to_string()).or_default();
		entry.messages.push_front(payload);
		entry.messages.truncate(keys::HISTORY_LIMIT as usize);
		Ok(())
	}

	async fn recent_messages(&self, room: &RoomId, limit: i64) -> Result<Vec<ChatMessage>, StoreError> {
		let limit = clamp_history_limit(limit) as usize;
		let state = self.state.lock().await;

		let Some(entry) = state.rooms.get(room.as_str()) else {
			return Ok(Vec::new());
		};

		Ok(entry
			.messages
			.iter()
			.take(limit)
			.filter_map(|raw| ChatMessage::from_json(raw).ok())
			.collect())
	}

	async fn clear_room(&self, room: &RoomId) -> Result<(), StoreError> {
		let mut state = self.state.lock().await;

		if let Some(entry) = state.rooms.remove(room.as_str()) {
			for id in entry.members {
				state.clients.remove(&id);
			}
		}
		state.active.remove(room.as_str());
		Ok(())
	}

	async fn subscribe_all_rooms(&self) -> Result<RoomSubscription, StoreError> {
		let (tx, rx) = mpsc::channel(SUBSCRIPTION_QUEUE_CAPACITY);
		let mut state = self.state.lock().await;
		state.subscribers.push(tx);
		Ok(RoomSubscription::new(rx, CancellationToken::new()))
	}

	async fn ping(&self) -> Result<(), StoreError> {
		Ok(())
	}
}
