#![forbid(unsafe_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context as _, anyhow, bail};
use huddle_domain::SecretString;
use serde::Deserialize;
use tracing::info;

/// Default token validity handed to media clients.
pub const DEFAULT_TOKEN_TTL: Duration = Duration::from_secs(8 * 60 * 60);

/// Config path: `config.toml` in the working directory, or `HUDDLE_CONFIG`.
pub fn config_path() -> PathBuf {
	std::env::var("HUDDLE_CONFIG")
		.ok()
		.filter(|v| !v.trim().is_empty())
		.map(PathBuf::from)
		.unwrap_or_else(|| PathBuf::from("config.toml"))
}

/// Load the relay config from TOML and env overrides.
pub fn load_config() -> anyhow::Result<Config> {
	load_config_from_path(&config_path())
}

/// Same as `load_config` but with an explicit config path.
pub fn load_config_from_path(path: &Path) -> anyhow::Result<Config> {
	let file_cfg = read_toml_if_exists(path)
		.with_context(|| format!("read config from {}", path.display()))?
		.unwrap_or_default();

	let mut cfg = Config::from_file(file_cfg);
	apply_env_overrides(&mut cfg);
	cfg.validate()?;

	Ok(cfg)
}

/// Relay config (v1).
#[derive(Debug, Clone)]
pub struct Config {
	pub livekit: LiveKitSettings,
	pub redis: RedisSettings,
	pub server: ServerSettings,
	pub logger: LoggerSettings,
}

/// Credentials for the external media SFU.
#[derive(Debug, Clone)]
pub struct LiveKitSettings {
	/// API key id. Required.
	pub key: String,
	/// Client-facing SFU URL. Required.
	pub url: String,
	/// Signing secret. Required.
	pub secret: SecretString,
	/// Validity of minted access tokens.
	pub token_ttl: Duration,
}

/// Substrate connection settings.
#[derive(Debug, Clone)]
pub struct RedisSettings {
	pub host: String,
	pub port: u16,
	pub password: Option<SecretString>,
	pub db: i64,
}

impl RedisSettings {
	/// Connection URL for the substrate client.
	pub fn url(&self) -> String {
		match &self.password {
			Some(password) => format!("redis://:{}@{}:{}/{}", password.expose(), self.host, self.port, self.db),
			None => format!("redis://{}:{}/{}", self.host, self.port, self.db),
		}
	}
}

impl Default for RedisSettings {
	fn default() -> Self {
		Self {
			host: "localhost".to_string(),
			port: 6379,
			password: None,
			db: 0,
		}
	}
}

/// Listener settings.
#[derive(Debug, Clone)]
pub struct ServerSettings {
	pub host: String,
	pub port: u16,
	/// Optional Prometheus exporter bind address (host:port).
	pub metrics_bind: Option<String>,
}

impl ServerSettings {
	pub fn bind_addr(&self) -> String {
		format!("{}:{}", self.host, self.port)
	}
}

impl Default for ServerSettings {
	fn default() -> Self {
		Self {
			host: "127.0.0.1".to_string(),
			port: 8080,
			metrics_bind: None,
		}
	}
}

#[derive(Debug, Clone)]
pub struct LoggerSettings {
	pub level: String,
}

impl Default for LoggerSettings {
	fn default() -> Self {
		Self {
			level: "info".to_string(),
		}
	}
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileConfig {
	#[serde(default)]
	livekit: FileLiveKitSettings,

	#[serde(default)]
	redis: FileRedisSettings,

	#[serde(default)]
	server: FileServerSettings,

	#[serde(default)]
	logger: FileLoggerSettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileLiveKitSettings {
	key: Option<String>,
	url: Option<String>,
	secret: Option<String>,
	token_ttl_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileRedisSettings {
	host: Option<String>,
	port: Option<u16>,
	password: Option<String>,
	db: Option<i64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileServerSettings {
	host: Option<String>,
	port: Option<u16>,
	metrics_bind: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileLoggerSettings {
	level: Option<String>,
}

impl Config {
	fn from_file(file: FileConfig) -> Self {
		let redis_defaults = RedisSettings::default();
		let server_defaults = ServerSettings::default();

		Self {
			livekit: LiveKitSettings {
				key: file.livekit.key.map(|s| s.trim().to_string()).unwrap_or_default(),
				url: file.livekit.url.map(|s| s.trim().to_string()).unwrap_or_default(),
				secret: SecretString::new(file.livekit.secret.map(|s| s.trim().to_string()).unwrap_or_default()),
				token_ttl: file
					.livekit
					.token_ttl_secs
					.filter(|v| *v > 0)
					.map(Duration::from_secs)
					.unwrap_or(DEFAULT_TOKEN_TTL),
			},
			redis: RedisSettings {
				host: file.redis.host.filter(|s| !s.trim().is_empty()).unwrap_or(redis_defaults.host),
				port: file.redis.port.unwrap_or(redis_defaults.port),
				password: file.redis.password.filter(|s| !s.is_empty()).map(SecretString::new),
				db: file.redis.db.unwrap_or(redis_defaults.db),
			},
			server: ServerSettings {
				host: file
					.server
					.host
					.filter(|s| !s.trim().is_empty())
					.unwrap_or(server_defaults.host),
				port: file.server.port.unwrap_or(server_defaults.port),
				metrics_bind: file.server.metrics_bind.filter(|s| !s.trim().is_empty()),
			},
			logger: LoggerSettings {
				level: file
					.logger
					.level
					.filter(|s| !s.trim().is_empty())
					.unwrap_or_else(|| LoggerSettings::default().level),
			},
		}
	}

	fn validate(&self) -> anyhow::Result<()> {
		if self.livekit.key.is_empty() {
			bail!("config: missing required field livekit.key");
		}
		if self.livekit.url.is_empty() {
			bail!("config: missing required field livekit.url");
		}
		if self.livekit.secret.expose().is_empty() {
			bail!("config: missing required field livekit.secret");
		}
		Ok(())
	}
}

fn read_toml_if_exists(path: &Path) -> anyhow::Result<Option<FileConfig>> {
	match fs::read_to_string(path) {
		Ok(s) => {
			let cfg: FileConfig = toml::from_str(&s).context("parse TOML")?;
			Ok(Some(cfg))
		}
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
		Err(e) => Err(anyhow!(e).context("read config file")),
	}
}

fn apply_env_overrides(cfg: &mut Config) {
	if let Ok(v) = std::env::var("HUDDLE_LIVEKIT_KEY") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.livekit.key = v;
			info!("livekit config: key overridden by env");
		}
	}

	if let Ok(v) = std::env::var("HUDDLE_LIVEKIT_URL") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.livekit.url = v;
			info!("livekit config: url overridden by env");
		}
	}

	if let Ok(v) = std::env::var("HUDDLE_LIVEKIT_SECRET") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.livekit.secret = SecretString::new(v);
			info!("livekit config: secret overridden by env");
		}
	}

	if let Ok(v) = std::env::var("HUDDLE_LIVEKIT_TOKEN_TTL_SECS")
		&& let Ok(secs) = v.trim().parse::<u64>()
		&& secs > 0
	{
		cfg.livekit.token_ttl = Duration::from_secs(secs);
		info!(secs, "livekit config: token_ttl overridden by env");
	}

	if let Ok(v) = std::env::var("HUDDLE_REDIS_HOST") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.redis.host = v;
			info!("redis config: host overridden by env");
		}
	}

	if let Ok(v) = std::env::var("HUDDLE_REDIS_PORT")
		&& let Ok(port) = v.trim().parse::<u16>()
	{
		cfg.redis.port = port;
		info!(port, "redis config: port overridden by env");
	}

	if let Ok(v) = std::env::var("HUDDLE_REDIS_PASSWORD")
		&& !v.is_empty()
	{
		cfg.redis.password = Some(SecretString::new(v));
		info!("redis config: password overridden by env");
	}

	if let Ok(v) = std::env::var("HUDDLE_REDIS_DB")
		&& let Ok(db) = v.trim().parse::<i64>()
	{
		cfg.redis.db = db;
		info!(db, "redis config: db overridden by env");
	}

	if let Ok(v) = std::env::var("HUDDLE_SERVER_HOST") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.server.host = v;
			info!("server config: host overridden by env");
		}
	}

	if let Ok(v) = std::env::var("HUDDLE_SERVER_PORT")
		&& let Ok(port) = v.trim().parse::<u16>()
	{
		cfg.server.port = port;
		info!(port, "server config: port overridden by env");
	}

	if let Ok(v) = std::env::var("HUDDLE_METRICS_BIND") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.server.metrics_bind = Some(v);
			info!("server config: metrics_bind overridden by env");
		}
	}

	if let Ok(v) = std::env::var("HUDDLE_LOG_LEVEL") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.logger.level = v;
			info!("logger config: level overridden by env");
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn full_file() -> FileConfig {
		toml::from_str(
			r#"
			[livekit]
			key = "api-key"
			url = "wss://livekit.example.com"
			secret = "sekrit"

			[redis]
			host = "redis.internal"
			port = 6380
			password = "p"
			db = 2

			[server]
			host = "0.0.0.0"
			port = 9000

			[logger]
			level = "debug"
			"#,
		)
		.expect("valid TOML")
	}

	#[test]
	fn full_config_parses_and_validates() {
		let cfg = Config::from_file(full_file());
		cfg.validate().expect("valid config");

		assert_eq!(cfg.livekit.key, "api-key");
		assert_eq!(cfg.livekit.token_ttl, DEFAULT_TOKEN_TTL);
		assert_eq!(cfg.redis.url(), "redis://:p@redis.internal:6380/2");
		assert_eq!(cfg.server.bind_addr(), "0.0.0.0:9000");
		assert_eq!(cfg.logger.level, "debug");
	}

	#[test]
	fn defaults_fill_in_everything_but_livekit() {
		let cfg = Config::from_file(FileConfig::default());

		assert_eq!(cfg.redis.host, "localhost");
		assert_eq!(cfg.redis.port, 6379);
		assert_eq!(cfg.redis.db, 0);
		assert_eq!(cfg.redis.url(), "redis://localhost:6379/0");
		assert_eq!(cfg.server.bind_addr(), "127.0.0.1:8080");
		assert_eq!(cfg.logger.level, "info");
	}

	#[test]
	fn missing_livekit_fields_fail_validation() {
		let cfg = Config::from_file(FileConfig::default());
		let err = cfg.validate().unwrap_err();
		assert!(err.to_string().contains("livekit.key"));

		let mut file = full_file();
		file.livekit.secret = Some("   ".to_string());
		let err = Config::from_file(file).validate().unwrap_err();
		assert!(err.to_string().contains("livekit.secret"));
	}

	#[test]
	fn custom_token_ttl_is_honored() {
		let mut file = full_file();
		file.livekit.token_ttl_secs = Some(60);
		let cfg = Config::from_file(file);
		assert_eq!(cfg.livekit.token_ttl, Duration::from_secs(60));
	}
}
