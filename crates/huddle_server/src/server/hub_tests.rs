#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use huddle_domain::{ClientId, RoomId, SecretString};
use huddle_store::{MemoryStore, Store};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::livekit::LiveKitConfig;
use crate::server::hub::{Hub, HubHandle};
use crate::server::session::Session;

fn livekit() -> LiveKitConfig {
	LiveKitConfig {
		api_key: "devkey".to_string(),
		api_url: "wss://livekit.local".to_string(),
		api_secret: SecretString::new("devsecret-devsecret"),
		token_ttl: Duration::from_secs(60),
	}
}

struct TestHub {
	handle: HubHandle,
	store: Arc<MemoryStore>,
	cancel: CancellationToken,
	task: JoinHandle<()>,
}

fn start_hub() -> TestHub {
	let store = Arc::new(MemoryStore::new());
	let cancel = CancellationToken::new();
	let hub = Hub::new(Arc::clone(&store) as Arc<dyn Store>, livekit(), cancel.clone());
	let handle = hub.handle();
	let task = tokio::spawn(hub.run());

	TestHub {
		handle,
		store,
		cancel,
		task,
	}
}

async fn connect(handle: &HubHandle, room: &str, capacity: usize) -> (Session, mpsc::Receiver<String>) {
	let (session, rx) = Session::new(
		ClientId::generate(),
		RoomId::new(room).expect("valid room id"),
		"test-agent",
		capacity,
	);
	handle.register(session.clone()).await;
	(session, rx)
}

async fn recv_frame(rx: &mut mpsc::Receiver<String>) -> String {
	timeout(Duration::from_millis(500), rx.recv())
		.await
		.expect("expected frame within timeout")
		.expect("queue open")
}

async fn expect_silence(rx: &mut mpsc::Receiver<String>) {
	let got = timeout(Duration::from_millis(200), rx.recv()).await;
	assert!(got.is_err(), "expected no frame, got: {got:?}");
}

fn room(id: &str) -> RoomId {
	RoomId::new(id).expect("valid room id")
}

#[tokio::test]
async fn register_persists_client_and_delivers_media_token() {
	let hub = start_hub();
	let (session, mut rx) = connect(&hub.handle, "x", 8).await;

	let frame: serde_json::Value = serde_json::from_str(&recv_frame(&mut rx).await).unwrap();
	assert_eq!(frame["type"], "livekit-token");
	assert_eq!(frame["room"], "x");
	assert_eq!(frame["identity"], session.id.to_canonical());
	assert_eq!(frame["livekitUrl"], "wss://livekit.local");
	assert!(frame["token"].as_str().unwrap().split('.').count() == 3);

	assert!(hub.store.client_exists(session.id).await.unwrap());
	assert!(
		hub.handle
			.room_members(&room("x"))
			.await
			.unwrap()
			.contains(&session.id.to_canonical())
	);
	assert_eq!(hub.handle.room_member_count(&room("x")).await.unwrap(), 1);
	assert!(hub.store.active_rooms().await.unwrap().contains(&"x".to_string()));
}

#[tokio::test]
async fn fanout_reaches_room_peers_but_never_the_sender() {
	let hub = start_hub();
	let (a, mut rx_a) = connect(&hub.handle, "x", 8).await;
	let (_b, mut rx_b) = connect(&hub.handle, "x", 8).await;
	let (_c, mut rx_c) = connect(&hub.handle, "y", 8).await;

	// Consume the token frames so only chat traffic remains.
	recv_frame(&mut rx_a).await;
	recv_frame(&mut rx_b).await;
	recv_frame(&mut rx_c).await;

	hub.handle.broadcast_from(r#"{"message":"hi"}"#.to_string(), &a.room, a.id);

	let frame: serde_json::Value = serde_json::from_str(&recv_frame(&mut rx_b).await).unwrap();
	assert_eq!(frame["type"], "chat");
	assert_eq!(frame["from"], a.id.to_canonical());
	assert_eq!(frame["room_id"], "x");
	assert_eq!(frame["content"], "hi");

	expect_silence(&mut rx_a).await;
	expect_silence(&mut rx_c).await;
}

#[tokio::test]
async fn spoofed_from_field_is_overwritten() {
	let hub = start_hub();
	let (a, mut rx_a) = connect(&hub.handle, "x", 8).await;
	let (_b, mut rx_b) = connect(&hub.handle, "x", 8).await;
	recv_frame(&mut rx_a).await;
	recv_frame(&mut rx_b).await;

	hub.handle
		.broadcast_from(r#"{"content":"hello","from":"spoofed"}"#.to_string(), &a.room, a.id);

	let frame: serde_json::Value = serde_json::from_str(&recv_frame(&mut rx_b).await).unwrap();
	assert_eq!(frame["from"], a.id.to_canonical());
	assert_eq!(frame["content"], "hello");
}

#[tokio::test]
async fn malformed_frames_are_dropped_and_the_hub_keeps_serving() {
	let hub = start_hub();
	let (a, mut rx_a) = connect(&hub.handle, "x", 8).await;
	let (_b, mut rx_b) = connect(&hub.handle, "x", 8).await;
	recv_frame(&mut rx_a).await;
	recv_frame(&mut rx_b).await;

	hub.handle.broadcast_from("not json".to_string(), &a.room, a.id);
	expect_silence(&mut rx_b).await;

	hub.handle.broadcast_from(r#"{"message":"still here"}"#.to_string(), &a.room, a.id);
	let frame: serde_json::Value = serde_json::from_str(&recv_frame(&mut rx_b).await).unwrap();
	assert_eq!(frame["content"], "still here");
}

#[tokio::test]
async fn frames_without_known_keys_fall_back_to_the_raw_payload() {
	let hub = start_hub();
	let (a, mut rx_a) = connect(&hub.handle, "x", 8).await;
	let (_b, mut rx_b) = connect(&hub.handle, "x", 8).await;
	recv_frame(&mut rx_a).await;
	recv_frame(&mut rx_b).await;

	hub.handle.broadcast_from(r#"{"foo":1}"#.to_string(), &a.room, a.id);

	let frame: serde_json::Value = serde_json::from_str(&recv_frame(&mut rx_b).await).unwrap();
	assert_eq!(frame["content"], r#"{"foo":1}"#);
}

#[tokio::test]
async fn slow_client_loses_messages_while_peers_keep_receiving() {
	let hub = start_hub();
	let (a, mut rx_a) = connect(&hub.handle, "x", 8).await;
	// Capacity 1, and the token frame is left in the queue, so every
	// fan-out toward this session finds it full.
	let (_slow, _rx_slow) = connect(&hub.handle, "x", 1).await;
	let (_c, mut rx_c) = connect(&hub.handle, "x", 8).await;
	recv_frame(&mut rx_a).await;
	recv_frame(&mut rx_c).await;

	for i in 0..3 {
		hub.handle
			.broadcast_from(format!(r#"{{"message":"m{i}"}}"#), &a.room, a.id);
	}

	for i in 0..3 {
		let frame: serde_json::Value = serde_json::from_str(&recv_frame(&mut rx_c).await).unwrap();
		assert_eq!(frame["content"], format!("m{i}"));
	}

	let history = hub.store.recent_messages(&room("x"), 10).await.unwrap();
	assert_eq!(history.len(), 3);
	assert_eq!(history[0].content, "m2");
}

#[tokio::test]
async fn system_messages_reach_every_room_member() {
	let hub = start_hub();
	let (a, mut rx_a) = connect(&hub.handle, "x", 8).await;
	let (_b, mut rx_b) = connect(&hub.handle, "x", 8).await;
	recv_frame(&mut rx_a).await;
	recv_frame(&mut rx_b).await;

	// Records published without a session (sender "system") have no
	// originator to suppress.
	let record = huddle_domain::ChatMessage::chat(huddle_domain::SYSTEM_SENDER, &a.room, "maintenance soon");
	hub.store.publish_message(&a.room, &record).await.unwrap();

	for rx in [&mut rx_a, &mut rx_b] {
		let frame: serde_json::Value = serde_json::from_str(&recv_frame(rx).await).unwrap();
		assert_eq!(frame["from"], "system");
		assert_eq!(frame["content"], "maintenance soon");
	}
}

#[tokio::test]
async fn unregister_closes_the_queue_once_and_double_unregister_is_tolerated() {
	let hub = start_hub();
	let (session, mut rx) = connect(&hub.handle, "x", 8).await;
	recv_frame(&mut rx).await;

	hub.handle.unregister(session.clone()).await;

	// The close is observable to senders and the store record is gone.
	let deadline = tokio::time::Instant::now() + Duration::from_millis(500);
	loop {
		if session.try_outbound("late".to_string()).is_err() {
			break;
		}
		assert!(tokio::time::Instant::now() < deadline, "queue never closed");
		tokio::time::sleep(Duration::from_millis(10)).await;
	}
	assert!(!hub.store.client_exists(session.id).await.unwrap());
	assert!(!hub.store.room_exists(&room("x")).await.unwrap());

	// Second unregister of the same id: not-found from the store, no close
	// to repeat, and the hub keeps serving.
	hub.handle.unregister(session.clone()).await;
	let (_d, mut rx_d) = connect(&hub.handle, "x", 8).await;
	recv_frame(&mut rx_d).await;
}

#[tokio::test]
async fn shutdown_closes_every_outbound_queue() {
	let hub = start_hub();
	let (a, mut rx_a) = connect(&hub.handle, "x", 8).await;
	let (b, mut rx_b) = connect(&hub.handle, "y", 8).await;
	recv_frame(&mut rx_a).await;
	recv_frame(&mut rx_b).await;

	hub.cancel.cancel();
	timeout(Duration::from_secs(1), hub.task)
		.await
		.expect("hub stops within timeout")
		.expect("hub task not panicked");

	assert!(a.try_outbound("late".to_string()).is_err());
	assert!(b.try_outbound("late".to_string()).is_err());
}
