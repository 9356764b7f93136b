#![forbid(unsafe_code)]

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Queue depth between the substrate forwarder and the subscriber loop.
pub const SUBSCRIPTION_QUEUE_CAPACITY: usize = 256;

/// One message received on a room channel.
#[derive(Debug, Clone)]
pub struct RoomEvent {
	/// Channel the message arrived on (`room:<id>`).
	pub channel: String,
	/// Verbatim published payload.
	pub payload: String,
}

/// Live all-rooms subscription: a bounded stream of [`RoomEvent`]s plus a
/// close handle. The backing forwarder task exits once `close` is called
/// or the substrate connection ends, after which `next` returns `None`.
pub struct RoomSubscription {
	rx: mpsc::Receiver<RoomEvent>,
	cancel: CancellationToken,
}

impl RoomSubscription {
	pub fn new(rx: mpsc::Receiver<RoomEvent>, cancel: CancellationToken) -> Self {
		Self { rx, cancel }
	}

	/// Next event, or `None` once the subscription is closed.
	pub async fn next(&mut self) -> Option<RoomEvent> {
		tokio::select! {
			_ = self.cancel.cancelled() => None,
			ev = self.rx.recv() => ev,
		}
	}

	/// Stop the subscription; the forwarder task observes this and exits.
	pub fn close(&self) {
		self.cancel.cancel();
	}
}

impl Drop for RoomSubscription {
	fn drop(&mut self) {
		self.cancel.cancel();
	}
}
