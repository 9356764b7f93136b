#![forbid(unsafe_code)]

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use huddle_domain::{ClientId, RoomId};
use hyper::upgrade::Upgraded;
use hyper_util::rt::TokioIo;
use tokio::sync::mpsc;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Outbound queue depth per session.
pub const OUTBOUND_QUEUE_CAPACITY: usize = 256;

/// Server-side websocket over an upgraded HTTP connection.
pub type ClientSocket = WebSocketStream<TokioIo<Upgraded>>;

/// Hub-facing handle for one connected client. The socket halves live in
/// the reader and writer tasks; everything else sees only this handle and
/// its bounded outbound queue.
///
/// The queue is closed by cancelling `closed` — the hub is the only
/// caller, on unregister and on shutdown, always after the session has
/// left the connection map.
#[derive(Debug, Clone)]
pub struct Session {
	pub id: ClientId,
	pub room: RoomId,
	pub user_agent: String,
	outbound: mpsc::Sender<String>,
	closed: CancellationToken,
}

impl Session {
	/// Build a session handle plus the receiver its writer task drains.
	pub fn new(
		id: ClientId,
		room: RoomId,
		user_agent: impl Into<String>,
		outbound_capacity: usize,
	) -> (Self, mpsc::Receiver<String>) {
		let (outbound, rx) = mpsc::channel(outbound_capacity);
		(
			Self {
				id,
				room,
				user_agent: user_agent.into(),
				outbound,
				closed: CancellationToken::new(),
			},
			rx,
		)
	}

	/// Non-blocking enqueue toward the client. Senders must treat `Full` as
	/// a slow client and drop; `Closed` means the session is already gone.
	pub fn try_outbound(&self, text: String) -> Result<(), mpsc::error::TrySendError<String>> {
		if self.closed.is_cancelled() {
			return Err(mpsc::error::TrySendError::Closed(text));
		}
		self.outbound.try_send(text)
	}

	/// Close the outbound queue. Hub-only; idempotent by construction, but
	/// the hub guards it behind removal from the connection map so it runs
	/// at most once per session.
	pub fn close_outbound(&self) {
		self.closed.cancel();
	}

	/// Token the writer task watches for the queue close.
	pub fn closed_token(&self) -> CancellationToken {
		self.closed.clone()
	}
}

/// Drain the outbound queue into the socket. Returns on the first write
/// error; when the hub closes the queue, finishes the websocket with a
/// close frame. Never closes the queue itself.
pub async fn run_writer(
	mut outbound: mpsc::Receiver<String>,
	closed: CancellationToken,
	mut sink: SplitSink<ClientSocket, Message>,
) {
	loop {
		let text = tokio::select! {
			_ = closed.cancelled() => break,
			msg = outbound.recv() => match msg {
				Some(text) => text,
				None => break,
			},
		};

		if let Err(e) = sink.send(Message::text(text)).await {
			debug!(error = %e, "socket write failed, writer exiting");
			return;
		}
	}

	// Frames enqueued before the close still go out.
	while let Ok(text) = outbound.try_recv() {
		if sink.send(Message::text(text)).await.is_err() {
			return;
		}
	}

	let _ = sink.close().await;
}

/// Blocking read loop. Each text/binary frame is handed to `on_frame`; the
/// loop ends on close or read error. Going-away and abnormal-closure are
/// routine; any other close code gets logged.
pub async fn run_reader<F>(mut stream: SplitStream<ClientSocket>, session: &Session, mut on_frame: F)
where
	F: FnMut(String),
{
	while let Some(frame) = stream.next().await {
		match frame {
			Ok(Message::Text(text)) => on_frame(text.to_string()),
			Ok(Message::Binary(data)) => on_frame(String::from_utf8_lossy(&data).into_owned()),
			Ok(Message::Close(reason)) => {
				if let Some(frame) = reason {
					match frame.code {
						CloseCode::Away | CloseCode::Abnormal => {}
						code => warn!(
							room = %session.room,
							client = %session.id.short(),
							code = u16::from(code),
							reason = %frame.reason,
							"unexpected close code"
						),
					}
				}
				break;
			}
			// Ping/pong is answered by the protocol layer.
			Ok(_) => {}
			Err(e) => {
				debug!(
					room = %session.room,
					client = %session.id.short(),
					error = %e,
					"socket read failed"
				);
				break;
			}
		}
	}
}
