#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;

use huddle_domain::{ChatMessage, ClientId, RoomId, TokenFrame};
use huddle_store::{ClientInfo, Store};
use tokio::sync::{RwLock, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::livekit::LiveKitConfig;
use crate::server::session::Session;

/// Queue depth for inbound frames awaiting dispatch.
pub const BROADCAST_QUEUE_CAPACITY: usize = 100;

/// One inbound frame awaiting normalization and publish. `from` is the
/// server-assigned id of the connection the frame arrived on; nothing the
/// client wrote can influence it.
#[derive(Debug)]
pub struct BroadcastMsg {
	pub payload: String,
	pub room: RoomId,
	pub from: ClientId,
}

/// The connection map is written only by the dispatcher loop; the
/// subscriber loop walks it under the read side. Removal from the map
/// strictly precedes dropping the outbound sender, so a racing fan-out
/// send observes a closed channel at worst.
type ConnectionMap = Arc<RwLock<HashMap<ClientId, Session>>>;

/// Central dispatcher: owns the connection map, serializes register /
/// unregister / broadcast events, and bridges local events to the store.
pub struct Hub {
	connections: ConnectionMap,
	register_rx: mpsc::Receiver<Session>,
	unregister_rx: mpsc::Receiver<Session>,
	broadcast_rx: mpsc::Receiver<BroadcastMsg>,
	handle: HubHandle,
	store: Arc<dyn Store>,
	livekit: LiveKitConfig,
	cancel: CancellationToken,
}

/// Cloneable ingress surface of the [`Hub`].
#[derive(Clone)]
pub struct HubHandle {
	register_tx: mpsc::Sender<Session>,
	unregister_tx: mpsc::Sender<Session>,
	broadcast_tx: mpsc::Sender<BroadcastMsg>,
	store: Arc<dyn Store>,
}

impl Hub {
	pub fn new(store: Arc<dyn Store>, livekit: LiveKitConfig, cancel: CancellationToken) -> Self {
		let (register_tx, register_rx) = mpsc::channel(1);
		let (unregister_tx, unregister_rx) = mpsc::channel(1);
		let (broadcast_tx, broadcast_rx) = mpsc::channel(BROADCAST_QUEUE_CAPACITY);

		let handle = HubHandle {
			register_tx,
			unregister_tx,
			broadcast_tx,
			store: Arc::clone(&store),
		};

		Self {
			connections: Arc::new(RwLock::new(HashMap::new())),
			register_rx,
			unregister_rx,
			broadcast_rx,
			handle,
			store,
			livekit,
			cancel,
		}
	}

	pub fn handle(&self) -> HubHandle {
		self.handle.clone()
	}

	/// Run the dispatcher until the cancellation token fires. The
	/// subscriber loop is started as a sibling task before any event is
	/// processed, so a locally published message cannot outrun it.
	pub async fn run(mut self) {
		let subscriber = match self.store.subscribe_all_rooms().await {
			Ok(sub) => Some(tokio::spawn(run_subscriber(
				sub,
				Arc::clone(&self.connections),
				self.cancel.clone(),
			))),
			Err(e) => {
				error!(error = %e, "failed to subscribe to room channels, fan-out disabled");
				None
			}
		};

		loop {
			tokio::select! {
				_ = self.cancel.cancelled() => break,
				Some(session) = self.register_rx.recv() => self.handle_register(session).await,
				Some(session) = self.unregister_rx.recv() => self.handle_unregister(session).await,
				Some(msg) = self.broadcast_rx.recv() => self.handle_broadcast(msg).await,
				else => break,
			}
		}

		self.shutdown().await;
		if let Some(task) = subscriber {
			let _ = task.await;
		}
	}

	async fn handle_register(&mut self, session: Session) {
		let info = ClientInfo::joining(session.id, session.room.clone(), session.user_agent.clone());
		if let Err(e) = self.store.add_client(&info).await {
			error!(
				room = %session.room,
				client = %session.id.short(),
				error = %e,
				"failed to persist client record"
			);
		}

		self.connections.write().await.insert(session.id, session.clone());
		metrics::gauge!("huddle_server_active_sessions").increment(1.0);

		self.send_media_token(&session);
		info!(room = %session.room, client = %session.id.short(), "client joined room");
	}

	fn send_media_token(&self, session: &Session) {
		let token = match self.livekit.mint_token(&session.room, session.id) {
			Ok(token) => token,
			Err(e) => {
				warn!(
					room = %session.room,
					client = %session.id.short(),
					error = %e,
					"failed to mint media token"
				);
				return;
			}
		};

		let frame = TokenFrame::new(token, self.livekit.api_url.clone(), &session.room, session.id);
		let payload = match serde_json::to_string(&frame) {
			Ok(payload) => payload,
			Err(e) => {
				warn!(client = %session.id.short(), error = %e, "failed to encode token frame");
				return;
			}
		};

		match session.try_outbound(payload) {
			Ok(()) => {
				metrics::counter!("huddle_server_tokens_issued_total").increment(1);
				debug!(room = %session.room, client = %session.id.short(), "media token sent");
			}
			Err(mpsc::error::TrySendError::Full(_)) => {
				warn!(
					room = %session.room,
					client = %session.id.short(),
					"client slow, dropping media token"
				);
			}
			Err(mpsc::error::TrySendError::Closed(_)) => {}
		}
	}

	async fn handle_unregister(&mut self, session: Session) {
		match self.store.remove_client(session.id).await {
			Ok(()) => {}
			Err(e) if e.is_not_found() => {
				warn!(
					room = %session.room,
					client = %session.id.short(),
					"unregister for unknown client"
				);
			}
			Err(e) => {
				error!(
					room = %session.room,
					client = %session.id.short(),
					error = %e,
					"failed to remove client record"
				);
			}
		}

		// Removal from the map gates the close, so the queue is closed at
		// most once per session and never for an id that was re-registered.
		let removed = self.connections.write().await.remove(&session.id);
		if let Some(removed) = removed {
			removed.close_outbound();
			metrics::gauge!("huddle_server_active_sessions").decrement(1.0);
		}

		info!(room = %session.room, client = %session.id.short(), "client left room");
	}

	async fn handle_broadcast(&mut self, msg: BroadcastMsg) {
		let content = match extract_content(&msg.payload) {
			Ok(content) => content,
			Err(e) => {
				error!(
					room = %msg.room,
					client = %msg.from.short(),
					error = %e,
					"malformed client frame, dropping"
				);
				return;
			}
		};

		let record = ChatMessage::chat(msg.from.to_canonical(), &msg.room, content);

		if let Err(e) = self.store.publish_message(&msg.room, &record).await {
			error!(
				room = %msg.room,
				client = %msg.from.short(),
				error = %e,
				"failed to publish message"
			);
		} else {
			metrics::counter!("huddle_server_messages_published_total").increment(1);
		}

		// History is non-authoritative; append failures are swallowed.
		if let Err(e) = self.store.save_message(&msg.room, &record).await {
			debug!(room = %msg.room, error = %e, "history append failed");
		}
	}

	async fn shutdown(&mut self) {
		let mut connections = self.connections.write().await;
		let sessions = connections.len();
		// Writers end on their closed queues; readers end once the writer
		// finishes the websocket. The hub never touches the sockets.
		for session in connections.values() {
			session.close_outbound();
		}
		connections.clear();
		metrics::gauge!("huddle_server_active_sessions").set(0.0);
		info!(sessions, "hub stopped");
	}
}

impl HubHandle {
	/// Hand a freshly built session to the dispatcher.
	pub async fn register(&self, session: Session) {
		if self.register_tx.send(session).await.is_err() {
			debug!("register after hub stopped");
		}
	}

	/// Retire a session. Safe to call more than once for the same id.
	pub async fn unregister(&self, session: Session) {
		if self.unregister_tx.send(session).await.is_err() {
			debug!("unregister after hub stopped");
		}
	}

	/// Non-blocking hand-off of an inbound frame to the dispatcher. A full
	/// dispatch queue drops the frame rather than stalling the reader.
	pub fn broadcast_from(&self, payload: String, room: &RoomId, from: ClientId) {
		let msg = BroadcastMsg {
			payload,
			room: room.clone(),
			from,
		};
		match self.broadcast_tx.try_send(msg) {
			Ok(()) => {}
			Err(mpsc::error::TrySendError::Full(_)) => {
				warn!(room = %room, client = %from.short(), "broadcast queue full, dropping frame");
				metrics::counter!("huddle_server_broadcast_dropped_total").increment(1);
			}
			Err(mpsc::error::TrySendError::Closed(_)) => {}
		}
	}

	pub async fn room_members(&self, room: &RoomId) -> Result<Vec<String>, huddle_store::StoreError> {
		self.store.room_members(room).await
	}

	pub async fn room_member_count(&self, room: &RoomId) -> Result<u64, huddle_store::StoreError> {
		self.store.room_member_count(room).await
	}
}

/// Pull the human-readable text out of a client frame: `message` first,
/// then `content`, else the raw payload. Frames that do not parse as a
/// JSON object are a protocol error and the frame is dropped.
fn extract_content(payload: &str) -> Result<String, serde_json::Error> {
	let obj: serde_json::Map<String, serde_json::Value> = serde_json::from_str(payload)?;

	for key in ["message", "content"] {
		if let Some(text) = obj.get(key).and_then(|v| v.as_str()) {
			return Ok(text.to_string());
		}
	}

	Ok(payload.to_string())
}

/// Sibling loop: receives every room channel's traffic and fans each
/// record out to local same-room sessions, suppressing the originator.
async fn run_subscriber(
	mut sub: huddle_store::RoomSubscription,
	connections: ConnectionMap,
	cancel: CancellationToken,
) {
	loop {
		let event = tokio::select! {
			_ = cancel.cancelled() => break,
			ev = sub.next() => match ev {
				Some(ev) => ev,
				None => {
					warn!("room subscription ended");
					break;
				}
			},
		};

		let Some(channel_room) = huddle_store::keys::room_of_channel(&event.channel) else {
			warn!(channel = %event.channel, "event on a non-room channel, dropping");
			continue;
		};

		let record = match ChatMessage::from_json(&event.payload) {
			Ok(record) => record,
			Err(e) => {
				error!(channel = %event.channel, error = %e, "unparseable room event, dropping");
				continue;
			}
		};
		// A mismatch between the channel and the payload's room means a
		// publisher wrote to the wrong channel; don't fan it out.
		if record.room_id != channel_room {
			warn!(
				channel = %event.channel,
				room = %record.room_id,
				"room mismatch between channel and payload, dropping"
			);
			continue;
		}
		let from: Option<ClientId> = record.from.parse().ok();

		let connections = connections.read().await;
		for session in connections.values() {
			if session.room.as_str() != record.room_id {
				continue;
			}
			if from.is_some_and(|id| id == session.id) {
				continue;
			}

			match session.try_outbound(event.payload.clone()) {
				Ok(()) => {
					metrics::counter!("huddle_server_fanout_messages_total").increment(1);
				}
				Err(mpsc::error::TrySendError::Full(_)) => {
					warn!(
						room = %session.room,
						client = %session.id.short(),
						"client slow, dropping message"
					);
					metrics::counter!("huddle_server_fanout_dropped_total").increment(1);
				}
				Err(mpsc::error::TrySendError::Closed(_)) => {}
			}
		}
	}

	sub.close();
	debug!("subscriber loop exited");
}
