#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, anyhow};
use reqwest::StatusCode;
use serde::Deserialize;

use crate::session::SessionPool;

pub const DEFAULT_API_BASE_URL: &str = "https://kick.com";

/// Unauthenticated client for Kick's public web API.
#[derive(Clone)]
pub struct KickClient {
	base_url: String,
	pool: Arc<SessionPool>,
	lookup_timeout: Duration,
}

impl KickClient {
	pub fn new(base_url: impl Into<String>, pool: Arc<SessionPool>) -> Self {
		Self {
			base_url: base_url.into(),
			pool,
			lookup_timeout: Duration::from_secs(10),
		}
	}

	pub fn with_lookup_timeout(mut self, timeout: Duration) -> Self {
		self.lookup_timeout = timeout;
		self
	}

	pub fn base_url(&self) -> &str {
		&self.base_url
	}

	/// `GET {base}/api/v2/channels/{slug}` and read `chatroom.id`.
	///
	/// `Ok(None)` when the channel exists but the body carries no chatroom id.
	pub async fn fetch_chatroom_id(&self, slug: &str) -> anyhow::Result<Option<u64>> {
		let url = format!(
			"{}/api/v2/channels/{}",
			self.base_url.trim_end_matches('/'),
			urlencoding::encode(slug)
		);

		let session = self.pool.acquire().await?;
		let resp = session
			.get(url)
			.header("Accept", "application/json")
			.header("User-Agent", self.pool.config().user_agent.as_str())
			.timeout(self.lookup_timeout)
			.send()
			.await
			.context("kick get channel")?;

		if resp.status() != StatusCode::OK {
			return Err(anyhow!("kick get channel failed: status={}", resp.status()));
		}

		let body: KickChannelV2Response = resp.json().await.context("parse kick channel response")?;
		Ok(body.chatroom.and_then(|c| c.id))
	}
}

#[derive(Debug, Deserialize)]
struct KickChannelV2Response {
	#[serde(default)]
	chatroom: Option<KickChatroom>,
}

#[derive(Debug, Deserialize)]
struct KickChatroom {
	#[serde(default)]
	id: Option<u64>,
}
