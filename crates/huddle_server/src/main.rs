#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use huddle_store::{RedisStore, Store};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use huddle_server::config;
use huddle_server::livekit::LiveKitConfig;
use huddle_server::server::hub::Hub;
use huddle_server::server::ingress::{Readiness, run_http_server};

/// How long a graceful shutdown may take to drain before the process exits.
const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(10);

fn init_tracing(default_level: &str) {
	let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| default_level.to_string());

	tracing_subscriber::registry()
		.with(tracing_subscriber::EnvFilter::new(filter))
		.with(tracing_subscriber::fmt::layer().with_target(false))
		.init();
}

fn init_metrics(bind: Option<&str>) {
	let Some(bind) = bind else {
		return;
	};

	match bind.parse::<SocketAddr>() {
		Ok(addr) => {
			if let Err(e) = metrics_exporter_prometheus::PrometheusBuilder::new()
				.with_http_listener(addr)
				.install()
			{
				warn!(error = %e, "failed to start metrics exporter");
			} else {
				info!(%addr, "metrics exporter listening");
			}
		}
		Err(e) => {
			warn!(error = %e, %bind, "invalid metrics bind address (expected host:port)");
		}
	}
}

async fn wait_for_shutdown_signal() {
	#[cfg(unix)]
	{
		use tokio::signal::unix::{SignalKind, signal};

		match signal(SignalKind::terminate()) {
			Ok(mut sigterm) => {
				tokio::select! {
					_ = tokio::signal::ctrl_c() => {}
					_ = sigterm.recv() => {}
				}
			}
			Err(e) => {
				warn!(error = %e, "failed to install SIGTERM handler, falling back to ctrl-c");
				let _ = tokio::signal::ctrl_c().await;
			}
		}
	}

	#[cfg(not(unix))]
	{
		let _ = tokio::signal::ctrl_c().await;
	}
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	let config_path = config::config_path();
	let cfg = config::load_config_from_path(&config_path)?;

	init_tracing(&cfg.logger.level);
	info!(path = %config_path.display(), "loaded config (toml + env overrides)");
	init_metrics(cfg.server.metrics_bind.as_deref());

	let store = Arc::new(
		RedisStore::connect(&cfg.redis.url())
			.await
			.context("connect to redis")?,
	);
	store.ping().await.context("redis ping failed")?;
	info!(host = %cfg.redis.host, port = cfg.redis.port, "connected to redis");

	let cancel = CancellationToken::new();
	let livekit = LiveKitConfig::new(&cfg.livekit);
	let hub = Hub::new(Arc::clone(&store) as Arc<dyn Store>, livekit, cancel.clone());
	let handle = hub.handle();
	let hub_task = tokio::spawn(hub.run());

	let bind_addr = cfg.server.bind_addr();
	let addr: SocketAddr = bind_addr
		.parse()
		.with_context(|| format!("invalid server bind address: {bind_addr}"))?;
	let listener = TcpListener::bind(addr).await.with_context(|| format!("bind {addr}"))?;
	info!(%addr, "relay listening");

	let readiness = Readiness::new();
	readiness.mark_ready();
	let server_task = tokio::spawn(run_http_server(listener, handle, readiness, cancel.clone()));

	wait_for_shutdown_signal().await;
	info!("shutting down gracefully");

	// Stop accepting upgrades and stop the hub; sessions tear down as
	// writers finish their queues.
	cancel.cancel();
	let drained = tokio::time::timeout(SHUTDOWN_DEADLINE, async {
		let _ = server_task.await;
		let _ = hub_task.await;
	})
	.await;
	if drained.is_err() {
		warn!(deadline_secs = SHUTDOWN_DEADLINE.as_secs(), "drain deadline exceeded");
	}

	// The substrate client closes after the hub has stopped.
	drop(store);
	info!("server stopped");

	Ok(())
}
