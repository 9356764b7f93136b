#![forbid(unsafe_code)]

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use huddle_domain::{ChatMessage, ClientId, RoomId};
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::StoreError;
use crate::models::{ClientInfo, RoomStats};
use crate::subscription::{RoomEvent, RoomSubscription, SUBSCRIPTION_QUEUE_CAPACITY};
use crate::{Store, clamp_history_limit, keys};

/// Removal plus empty-room cleanup in one server-side step, so a concurrent
/// register cannot slip between the membership removal and the wipe.
///
/// KEYS: membership set, client key, client meta, room meta, room history,
/// active-rooms set. ARGV: client id, room id. Returns 1 when the room was
/// wiped.
const REMOVE_CLIENT_SCRIPT: &str = r#"
redis.call('SREM', KEYS[1], ARGV[1])
redis.call('DEL', KEYS[2])
redis.call('DEL', KEYS[3])
if redis.call('SCARD', KEYS[1]) == 0 then
	redis.call('DEL', KEYS[1])
	redis.call('DEL', KEYS[4])
	redis.call('DEL', KEYS[5])
	redis.call('SREM', KEYS[6], ARGV[2])
	return 1
end
return 0
"#;

/// Redis-backed [`Store`]. Commands run over a shared [`ConnectionManager`];
/// the pattern subscription gets its own pub/sub connection.
#[derive(Clone)]
pub struct RedisStore {
	client: redis::Client,
	manager: ConnectionManager,
}

impl RedisStore {
	/// Connect and build the shared command connection.
	pub async fn connect(url: &str) -> Result<Self, StoreError> {
		let client = redis::Client::open(url)?;
		let manager = ConnectionManager::new(client.clone()).await?;
		Ok(Self { client, manager })
	}

	fn conn(&self) -> ConnectionManager {
		self.manager.clone()
	}
}

fn parse_unix_field(map: &HashMap<String, String>, field: &str) -> Option<DateTime<Utc>> {
	let secs = map.get(field)?.parse::<i64>().ok()?;
	DateTime::<Utc>::from_timestamp(secs, 0)
}

#[async_trait]
impl Store for RedisStore {
	async fn add_client(&self, info: &ClientInfo) -> Result<(), StoreError> {
		let mut conn = self.conn();
		let id = info.id.to_canonical();
		let room = info.room_id.as_str();
		let now = Utc::now().timestamp();

		let _: () = redis::pipe()
			.set_ex(keys::client(&id), room, keys::CLIENT_TTL_SECS)
			.ignore()
			.sadd(keys::room_clients(room), &id)
			.ignore()
			.hset_multiple(
				keys::client_meta(&id),
				&[
					("joined_at", info.joined_at.timestamp().to_string()),
					("user_agent", info.user_agent.clone()),
				],
			)
			.ignore()
			.expire(keys::client_meta(&id), keys::CLIENT_TTL_SECS as i64)
			.ignore()
			.hset(keys::room_meta(room), "last_seen", now)
			.ignore()
			.hset_nx(keys::room_meta(room), "created_at", now)
			.ignore()
			.sadd(keys::active_rooms(), room)
			.ignore()
			.query_async(&mut conn)
			.await?;

		Ok(())
	}

	async fn remove_client(&self, id: ClientId) -> Result<(), StoreError> {
		let mut conn = self.conn();
		let id = id.to_canonical();

		let room: Option<String> = conn.get(keys::client(&id)).await?;
		let Some(room) = room else {
			return Err(StoreError::ClientNotFound);
		};

		let wiped: i64 = redis::Script::new(REMOVE_CLIENT_SCRIPT)
			.key(keys::room_clients(&room))
			.key(keys::client(&id))
			.key(keys::client_meta(&id))
			.key(keys::room_meta(&room))
			.key(keys::room_messages(&room))
			.key(keys::active_rooms())
			.arg(&id)
			.arg(&room)
			.invoke_async(&mut conn)
			.await?;

		if wiped == 1 {
			debug!(room = %room, "room emptied, state wiped");
		}

		Ok(())
	}

	async fn client_room(&self, id: ClientId) -> Result<RoomId, StoreError> {
		let mut conn = self.conn();
		let room: Option<String> = conn.get(keys::client(&id.to_canonical())).await?;
		let room = room.ok_or(StoreError::ClientNotFound)?;
		RoomId::new(room).map_err(|_| StoreError::ClientNotFound)
	}

	async fn client_info(&self, id: ClientId) -> Result<ClientInfo, StoreError> {
		let room = self.client_room(id).await?;

		let mut conn = self.conn();
		let meta: HashMap<String, String> = conn.hgetall(keys::client_meta(&id.to_canonical())).await?;

		let joined_at = parse_unix_field(&meta, "joined_at").unwrap_or(DateTime::UNIX_EPOCH);
		let user_agent = meta.get("user_agent").cloned().unwrap_or_default();

		Ok(ClientInfo {
			id,
			room_id: room,
			joined_at,
			user_agent,
		})
	}

	async fn client_exists(&self, id: ClientId) -> Result<bool, StoreError> {
		let mut conn = self.conn();
		Ok(conn.exists(keys::client(&id.to_canonical())).await?)
	}

	async fn room_members(&self, room: &RoomId) -> Result<Vec<String>, StoreError> {
		let mut conn = self.conn();
		Ok(conn.smembers(keys::room_clients(room.as_str())).await?)
	}

	async fn room_member_count(&self, room: &RoomId) -> Result<u64, StoreError> {
		let mut conn = self.conn();
		Ok(conn.scard(keys::room_clients(room.as_str())).await?)
	}

	async fn is_member(&self, id: ClientId, room: &RoomId) -> Result<bool, StoreError> {
		let mut conn = self.conn();
		Ok(conn
			.sismember(keys::room_clients(room.as_str()), id.to_canonical())
			.await?)
	}

	async fn active_rooms(&self) -> Result<Vec<String>, StoreError> {
		let mut conn = self.conn();
		Ok(conn.smembers(keys::active_rooms()).await?)
	}

	async fn room_stats(&self, room: &RoomId) -> Result<RoomStats, StoreError> {
		let clients_count = self.room_member_count(room).await?;

		let mut conn = self.conn();
		let meta: HashMap<String, String> = conn.hgetall(keys::room_meta(room.as_str())).await?;

		Ok(RoomStats {
			room_id: room.as_str().to_string(),
			clients_count,
			created_at: parse_unix_field(&meta, "created_at"),
			last_seen: parse_unix_field(&meta, "last_seen"),
		})
	}

	async fn room_exists(&self, room: &RoomId) -> Result<bool, StoreError> {
		let mut conn = self.conn();
		Ok(conn.exists(keys::room_clients(room.as_str())).await?)
	}

	async fn publish_message(&self, room: &RoomId, msg: &ChatMessage) -> Result<(), StoreError> {
		let payload = msg.to_json()?;
		let mut conn = self.conn();
		let _: i64 = conn.publish(keys::room_channel(room.as_str()), payload).await?;
		Ok(())
	}

	async fn save_message(&self, room: &RoomId, msg: &ChatMessage) -> Result<(), StoreError> {
		let payload = msg.to_json()?;
		let key = keys::room_messages(room.as_str());
		let mut conn = self.conn();

		let _: () = redis::pipe()
			.lpush(&key, payload)
			.ignore()
			.ltrim(&key, 0, (keys::HISTORY_LIMIT - 1) as isize)
			.ignore()
			.expire(&key, keys::CLIENT_TTL_SECS as i64)
			.ignore()
			.query_async(&mut conn)
			.await?;

		Ok(())
	}

	async fn recent_messages(&self, room: &RoomId, limit: i64) -> Result<Vec<ChatMessage>, StoreError> {
		let limit = clamp_history_limit(limit);
		let mut conn = self.conn();
		let raw: Vec<String> = conn
			.lrange(keys::room_messages(room.as_str()), 0, (limit - 1) as isize)
			.await?;

		let mut messages = Vec::with_capacity(raw.len());
		for item in raw {
			match ChatMessage::from_json(&item) {
				Ok(msg) => messages.push(msg),
				Err(e) => debug!(room = %room, error = %e, "skipping unparseable history entry"),
			}
		}

		Ok(messages)
	}

	async fn clear_room(&self, room: &RoomId) -> Result<(), StoreError> {
		let members = self.room_members(room).await?;
		let mut conn = self.conn();

		let mut pipe = redis::pipe();
		for id in &members {
			pipe.del(keys::client(id)).ignore();
			pipe.del(keys::client_meta(id)).ignore();
		}
		pipe.del(keys::room_clients(room.as_str())).ignore();
		pipe.del(keys::room_meta(room.as_str())).ignore();
		pipe.del(keys::room_messages(room.as_str())).ignore();
		pipe.srem(keys::active_rooms(), room.as_str()).ignore();

		let _: () = pipe.query_async(&mut conn).await?;
		Ok(())
	}

	async fn subscribe_all_rooms(&self) -> Result<RoomSubscription, StoreError> {
		let mut pubsub = self.client.get_async_pubsub().await?;
		pubsub.psubscribe(keys::ALL_ROOMS_PATTERN).await?;

		let (tx, rx) = mpsc::channel(SUBSCRIPTION_QUEUE_CAPACITY);
		let cancel = CancellationToken::new();
		let forwarder_cancel = cancel.clone();

		tokio::spawn(async move {
			let mut stream = pubsub.on_message();
			loop {
				tokio::select! {
					_ = forwarder_cancel.cancelled() => break,
					msg = stream.next() => {
						let Some(msg) = msg else {
							warn!("all-rooms subscription stream ended");
							break;
						};

						let channel = msg.get_channel_name().to_string();
						let payload: String = match msg.get_payload() {
							Ok(p) => p,
							Err(e) => {
								warn!(channel = %channel, error = %e, "invalid payload on room channel");
								continue;
							}
						};

						if tx.send(RoomEvent { channel, payload }).await.is_err() {
							break;
						}
					}
				}
			}
			debug!("all-rooms subscription forwarder exited");
		});

		Ok(RoomSubscription::new(rx, cancel))
	}

	async fn ping(&self) -> Result<(), StoreError> {
		let mut conn = self.conn();
		let _: String = redis::cmd("PING").query_async(&mut conn).await?;
		Ok(())
	}
}
