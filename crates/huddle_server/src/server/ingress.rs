#![forbid(unsafe_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::header;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use huddle_domain::{ClientId, RoomId, WelcomeFrame};

use crate::server::hub::HubHandle;
use crate::server::session::{ClientSocket, OUTBOUND_QUEUE_CAPACITY, Session, run_reader, run_writer};

/// Readiness flag served on `/readyz`; flipped once the store answered the
/// startup ping and the listener is bound.
#[derive(Clone, Default)]
pub struct Readiness {
	ready: Arc<AtomicBool>,
}

impl Readiness {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn mark_ready(&self) {
		self.ready.store(true, Ordering::Relaxed);
	}

	pub fn is_ready(&self) -> bool {
		self.ready.load(Ordering::Relaxed)
	}
}

/// Accept loop. Each connection gets its own http1 task with upgrades
/// enabled; the loop ends when the cancellation token fires.
pub async fn run_http_server(listener: TcpListener, hub: HubHandle, readiness: Readiness, cancel: CancellationToken) {
	loop {
		let (stream, remote) = tokio::select! {
			_ = cancel.cancelled() => break,
			accepted = listener.accept() => match accepted {
				Ok(conn) => conn,
				Err(e) => {
					warn!(error = %e, "accept failed");
					continue;
				}
			},
		};

		metrics::counter!("huddle_server_connections_total").increment(1);
		debug!(%remote, "accepted connection");

		let io = TokioIo::new(stream);
		let hub = hub.clone();
		let readiness = readiness.clone();
		tokio::spawn(async move {
			let service = service_fn(move |req| handle_request(req, hub.clone(), readiness.clone()));
			if let Err(e) = http1::Builder::new().serve_connection(io, service).with_upgrades().await {
				debug!(error = %e, "http connection error");
			}
		});
	}

	info!("stopped accepting connections");
}

async fn handle_request(
	req: Request<Incoming>,
	hub: HubHandle,
	readiness: Readiness,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
	if req.method() != Method::GET {
		return Ok(status_response(StatusCode::METHOD_NOT_ALLOWED));
	}

	match req.uri().path() {
		"/" => Ok(serve_index().await),
		"/ws" => Ok(upgrade_websocket(req, hub)),
		"/healthz" => Ok(Response::builder()
			.status(StatusCode::OK)
			.body(Full::new(Bytes::from_static(b"ok")))
			.unwrap()),
		"/readyz" => {
			if readiness.is_ready() {
				Ok(Response::builder()
					.status(StatusCode::OK)
					.body(Full::new(Bytes::from_static(b"ready")))
					.unwrap())
			} else {
				Ok(Response::builder()
					.status(StatusCode::SERVICE_UNAVAILABLE)
					.body(Full::new(Bytes::from_static(b"not-ready")))
					.unwrap())
			}
		}
		_ => Ok(status_response(StatusCode::NOT_FOUND)),
	}
}

fn status_response(status: StatusCode) -> Response<Full<Bytes>> {
	Response::builder()
		.status(status)
		.body(Full::new(Bytes::new()))
		.unwrap()
}

/// `GET /` serves `index.html` from the working directory.
async fn serve_index() -> Response<Full<Bytes>> {
	match tokio::fs::read("index.html").await {
		Ok(contents) => Response::builder()
			.status(StatusCode::OK)
			.header(header::CONTENT_TYPE, "text/html; charset=utf-8")
			.body(Full::new(Bytes::from(contents)))
			.unwrap(),
		Err(e) => {
			debug!(error = %e, "index.html not readable");
			status_response(StatusCode::NOT_FOUND)
		}
	}
}

/// Validate the upgrade request, answer 101, and hand the upgraded socket
/// to a session task.
fn upgrade_websocket(mut req: Request<Incoming>, hub: HubHandle) -> Response<Full<Bytes>> {
	let headers = req.headers();

	let upgrade_requested = headers
		.get(header::UPGRADE)
		.and_then(|v| v.to_str().ok())
		.is_some_and(|v| v.eq_ignore_ascii_case("websocket"));
	let version_ok = headers
		.get(header::SEC_WEBSOCKET_VERSION)
		.and_then(|v| v.to_str().ok())
		.is_some_and(|v| v == "13");
	let Some(key) = headers.get(header::SEC_WEBSOCKET_KEY) else {
		return status_response(StatusCode::BAD_REQUEST);
	};
	if !upgrade_requested || !version_ok {
		return status_response(StatusCode::BAD_REQUEST);
	}

	let accept = derive_accept_key(key.as_bytes());
	let room = room_from_query(req.uri().query());
	let user_agent = headers
		.get(header::USER_AGENT)
		.and_then(|v| v.to_str().ok())
		.unwrap_or_default()
		.to_string();

	tokio::spawn(async move {
		match hyper::upgrade::on(&mut req).await {
			Ok(upgraded) => {
				let io = TokioIo::new(upgraded);
				let socket = WebSocketStream::from_raw_socket(io, Role::Server, None).await;
				serve_session(socket, room, user_agent, hub).await;
			}
			Err(e) => warn!(error = %e, "websocket upgrade failed"),
		}
	});

	Response::builder()
		.status(StatusCode::SWITCHING_PROTOCOLS)
		.header(header::UPGRADE, "websocket")
		.header(header::CONNECTION, "Upgrade")
		.header(header::SEC_WEBSOCKET_ACCEPT, accept)
		.body(Full::new(Bytes::new()))
		.unwrap()
}

/// Room from the `room` query parameter, or a fresh server-assigned one.
fn room_from_query(query: Option<&str>) -> RoomId {
	query
		.and_then(|q| {
			url::form_urlencoded::parse(q.as_bytes())
				.find(|(k, _)| k == "room")
				.map(|(_, v)| v.into_owned())
		})
		.and_then(|v| RoomId::new(v).ok())
		.unwrap_or_else(RoomId::generated)
}

/// One connected client: register, welcome, then writer and reader tasks
/// in that order. The reader returning drives the unregister.
async fn serve_session(mut socket: ClientSocket, room: RoomId, user_agent: String, hub: HubHandle) {
	let (session, outbound_rx) = Session::new(ClientId::generate(), room, user_agent, OUTBOUND_QUEUE_CAPACITY);

	hub.register(session.clone()).await;
	info!(room = %session.room, client = %session.id.short(), "client connected");

	// The welcome goes straight to the socket; the writer is not draining
	// the queue yet, so this frame always precedes the media token.
	match serde_json::to_string(&WelcomeFrame::new(session.id, &session.room)) {
		Ok(frame) => {
			if let Err(e) = socket.send(Message::text(frame)).await {
				warn!(client = %session.id.short(), error = %e, "failed to send welcome");
			}
		}
		Err(e) => warn!(client = %session.id.short(), error = %e, "failed to encode welcome"),
	}

	let (sink, stream) = socket.split();

	let writer = tokio::spawn(run_writer(outbound_rx, session.closed_token(), sink));

	let reader_session = session.clone();
	let reader_hub = hub.clone();
	let reader = tokio::spawn(async move {
		let callback_session = reader_session.clone();
		let callback_hub = reader_hub.clone();
		run_reader(stream, &reader_session, move |payload| {
			callback_hub.broadcast_from(payload, &callback_session.room, callback_session.id);
		})
		.await;
	});

	let _ = reader.await;
	hub.unregister(session).await;
	let _ = writer.await;
}
