#![forbid(unsafe_code)]

use std::sync::Arc;

use anyhow::Context as _;
use async_trait::async_trait;
use kickwatch_domain::Notification;
use kickwatch_platform::{PersistenceError, Persister, SecretString, SessionPool};
use reqwest::StatusCode;
use tracing::{debug, warn};

use super::NotificationRow;

const TABLE: &str = "kick_notifications";

/// Inserts rows through the Supabase REST interface (PostgREST).
pub struct SupabasePersister {
	endpoint: String,
	anon_key: SecretString,
	pool: Arc<SessionPool>,
}

impl SupabasePersister {
	pub fn new(base_url: &str, anon_key: SecretString, pool: Arc<SessionPool>) -> Self {
		let endpoint = format!("{}/rest/v1/{TABLE}", base_url.trim_end_matches('/'));
		Self {
			endpoint,
			anon_key,
			pool,
		}
	}
}

#[async_trait]
impl Persister for SupabasePersister {
	fn name(&self) -> &'static str {
		"supabase"
	}

	async fn save(&self, n: &Notification) -> Result<(), PersistenceError> {
		let session = self.pool.acquire().await?;
		let resp = session
			.post(&self.endpoint)
			.header("apikey", self.anon_key.expose())
			.bearer_auth(self.anon_key.expose())
			.json(&NotificationRow::from(n))
			.send()
			.await
			.context("post supabase row")?;

		let status = resp.status();
		if status == StatusCode::CREATED {
			debug!(channel = %n.message.channel.name, "notification persisted");
			return Ok(());
		}

		let body = resp.text().await.unwrap_or_default();
		warn!(status = status.as_u16(), body = %body, "supabase rejected notification");
		Err(PersistenceError::Status {
			status: status.as_u16(),
		})
	}
}
