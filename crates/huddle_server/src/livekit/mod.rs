#![forbid(unsafe_code)]

use std::time::Duration;

use anyhow::{Context as _, anyhow};
use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use hmac::{Hmac, Mac};
use huddle_domain::{ClientId, RoomId, SecretString};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::util::time::unix_secs_now;

/// Credentials and endpoint of the external media SFU.
#[derive(Debug, Clone)]
pub struct LiveKitConfig {
	pub api_key: String,
	pub api_url: String,
	pub api_secret: SecretString,
	pub token_ttl: Duration,
}

#[derive(Debug, Serialize)]
struct Header {
	alg: &'static str,
	typ: &'static str,
}

/// Join grant scoped to a single room.
#[derive(Debug, Serialize, Deserialize)]
pub struct VideoGrant {
	pub room: String,
	#[serde(rename = "roomJoin")]
	pub room_join: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
	pub iss: String,
	pub sub: String,
	pub nbf: u64,
	pub exp: u64,
	pub video: VideoGrant,
}

impl LiveKitConfig {
	pub fn new(cfg: &crate::config::LiveKitSettings) -> Self {
		Self {
			api_key: cfg.key.clone(),
			api_url: cfg.url.clone(),
			api_secret: cfg.secret.clone(),
			token_ttl: cfg.token_ttl,
		}
	}

	/// Mint a bearer token granting `identity` join rights to `room`.
	///
	/// HS256 JWT per the SFU's contract: issuer is the API key, subject is
	/// the identity, and the video grant names exactly one joinable room.
	pub fn mint_token(&self, room: &RoomId, identity: ClientId) -> anyhow::Result<String> {
		let now = unix_secs_now();
		let claims = Claims {
			iss: self.api_key.clone(),
			sub: identity.to_canonical(),
			nbf: now,
			exp: now
				.checked_add(self.token_ttl.as_secs())
				.ok_or_else(|| anyhow!("token ttl overflows"))?,
			video: VideoGrant {
				room: room.as_str().to_string(),
				room_join: true,
			},
		};

		let header = serde_json::to_vec(&Header {
			alg: "HS256",
			typ: "JWT",
		})
		.context("encode token header")?;
		let payload = serde_json::to_vec(&claims).context("encode token claims")?;

		let signing_input = format!(
			"{}.{}",
			URL_SAFE_NO_PAD.encode(header),
			URL_SAFE_NO_PAD.encode(payload)
		);
		let signature = sign(signing_input.as_bytes(), self.api_secret.expose().as_bytes())?;

		Ok(format!("{signing_input}.{}", URL_SAFE_NO_PAD.encode(signature)))
	}
}

fn sign(input: &[u8], secret: &[u8]) -> anyhow::Result<Vec<u8>> {
	if secret.is_empty() {
		return Err(anyhow!("empty signing secret"));
	}
	let mut mac = Hmac::<Sha256>::new_from_slice(secret).map_err(|_| anyhow!("invalid signing secret"))?;
	mac.update(input);
	Ok(mac.finalize().into_bytes().to_vec())
}

#[cfg(test)]
mod tests {
	use super::*;

	fn config() -> LiveKitConfig {
		LiveKitConfig {
			api_key: "api-key".to_string(),
			api_url: "wss://livekit.example.com".to_string(),
			api_secret: SecretString::new("sekrit-sekrit-sekrit"),
			token_ttl: Duration::from_secs(8 * 60 * 60),
		}
	}

	fn decode_segment<T: serde::de::DeserializeOwned>(segment: &str) -> T {
		let raw = URL_SAFE_NO_PAD.decode(segment).expect("base64url segment");
		serde_json::from_slice(&raw).expect("segment is JSON")
	}

	#[test]
	fn token_has_three_base64url_segments() {
		let cfg = config();
		let token = cfg.mint_token(&RoomId::new("standup").unwrap(), ClientId::generate()).unwrap();

		let parts: Vec<&str> = token.split('.').collect();
		assert_eq!(parts.len(), 3);
		assert!(parts.iter().all(|p| !p.contains('=')));

		let header: serde_json::Value = decode_segment(parts[0]);
		assert_eq!(header["alg"], "HS256");
		assert_eq!(header["typ"], "JWT");
	}

	#[test]
	fn claims_carry_the_grant_and_ttl() {
		let cfg = config();
		let room = RoomId::new("standup").unwrap();
		let identity = ClientId::generate();
		let token = cfg.mint_token(&room, identity).unwrap();

		let claims: Claims = decode_segment(token.split('.').nth(1).unwrap());
		assert_eq!(claims.iss, "api-key");
		assert_eq!(claims.sub, identity.to_canonical());
		assert_eq!(claims.video.room, "standup");
		assert!(claims.video.room_join);
		assert_eq!(claims.exp - claims.nbf, 8 * 60 * 60);
	}

	#[test]
	fn signature_verifies_against_the_secret() {
		let cfg = config();
		let token = cfg.mint_token(&RoomId::new("x").unwrap(), ClientId::generate()).unwrap();

		let (signing_input, sig_b64) = token.rsplit_once('.').unwrap();
		let expected = sign(signing_input.as_bytes(), cfg.api_secret.expose().as_bytes()).unwrap();
		let provided = URL_SAFE_NO_PAD.decode(sig_b64).unwrap();
		assert_eq!(expected, provided);

		let forged = sign(signing_input.as_bytes(), b"wrong-secret").unwrap();
		assert_ne!(forged, provided);
	}

	#[test]
	fn empty_secret_is_a_signing_error() {
		let mut cfg = config();
		cfg.api_secret = SecretString::new("");
		let err = cfg.mint_token(&RoomId::new("x").unwrap(), ClientId::generate()).unwrap_err();
		assert!(err.to_string().contains("signing secret"));
	}
}
