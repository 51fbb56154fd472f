#![forbid(unsafe_code)]

use std::collections::HashMap;

use kickwatch_domain::{Channel, ChannelName, ChatroomId, Platform};
use thiserror::Error;
use tracing::{debug, info, warn};

use super::client::KickClient;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ResolutionError {
	#[error("no chatroom id for '{channel}': lookup failed and no fallback id is configured")]
	Unresolved { channel: String },
}

/// Maps channel slugs to chatroom ids: live lookup first, static table second.
#[derive(Clone)]
pub struct ChannelResolver {
	client: KickClient,
	fallback: HashMap<String, ChatroomId>,
}

impl ChannelResolver {
	pub fn new(client: KickClient, fallback: HashMap<String, ChatroomId>) -> Self {
		let fallback = fallback
			.into_iter()
			.map(|(name, id)| (name.trim().to_ascii_lowercase(), id))
			.collect();
		Self { client, fallback }
	}

	fn fallback_for(&self, name: &ChannelName) -> Option<ChatroomId> {
		self.fallback.get(&name.as_str().to_ascii_lowercase()).copied()
	}

	/// One lookup, no retries.
	pub async fn resolve(&self, name: &ChannelName) -> Result<ChatroomId, ResolutionError> {
		match self.client.fetch_chatroom_id(name.as_str()).await {
			Ok(Some(id)) => {
				debug!(channel = %name, chatroom_id = id, "chatroom id resolved via lookup");
				return Ok(ChatroomId::new(id));
			}
			Ok(None) => {
				warn!(channel = %name, "channel lookup returned no chatroom id");
			}
			Err(e) => {
				warn!(channel = %name, error = %format!("{e:#}"), "channel lookup failed");
			}
		}

		match self.fallback_for(name) {
			Some(id) => {
				info!(channel = %name, chatroom_id = %id, "using fallback chatroom id");
				Ok(id)
			}
			None => Err(ResolutionError::Unresolved {
				channel: name.to_string(),
			}),
		}
	}

	pub async fn resolve_channel(&self, name: &ChannelName) -> Result<Channel, ResolutionError> {
		let id = self.resolve(name).await?;
		Ok(Channel::new(Platform::Kick, name.clone(), id))
	}

	/// Resolve in order, skipping channels that cannot be resolved.
	pub async fn resolve_all(&self, names: &[ChannelName]) -> Vec<Channel> {
		let mut out = Vec::with_capacity(names.len());
		for name in names {
			match self.resolve_channel(name).await {
				Ok(ch) => out.push(ch),
				Err(e) => warn!(channel = %name, error = %e, "skipping channel"),
			}
		}
		out
	}
}

#[cfg(test)]
mod tests {
	use std::sync::Arc;

	use hyper::StatusCode;

	use super::*;
	use crate::session::{SessionConfig, SessionPool};
	use crate::testing::spawn_http_stub;

	fn resolver(base: &str, fallback: &[(&str, u64)]) -> ChannelResolver {
		let pool = Arc::new(SessionPool::new(SessionConfig {
			user_agent: "kickwatch-test/1".to_string(),
			..SessionConfig::default()
		}));
		let fallback = fallback
			.iter()
			.map(|(k, v)| (k.to_string(), ChatroomId::new(*v)))
			.collect();
		ChannelResolver::new(KickClient::new(base, pool), fallback)
	}

	fn name(s: &str) -> ChannelName {
		ChannelName::new(s).unwrap()
	}

	#[tokio::test]
	async fn lookup_success_wins_over_fallback() {
		let (addr, seen) = spawn_http_stub(StatusCode::OK, r#"{"id":9,"chatroom":{"id":4242}}"#).await;
		let r = resolver(&format!("http://{addr}"), &[("testchan", 123)]);

		let id = r.resolve(&name("testchan")).await.unwrap();
		assert_eq!(id, ChatroomId::new(4242));

		let seen = seen.lock().clone();
		assert_eq!(seen.len(), 1);
		assert_eq!(seen[0].path, "/api/v2/channels/testchan");
		assert_eq!(seen[0].user_agent.as_deref(), Some("kickwatch-test/1"));
	}

	#[tokio::test]
	async fn non_success_status_uses_fallback() {
		let (addr, _) = spawn_http_stub(StatusCode::FORBIDDEN, "{}").await;
		let r = resolver(&format!("http://{addr}"), &[("TestChan", 123)]);
		assert_eq!(r.resolve(&name("testchan")).await.unwrap(), ChatroomId::new(123));
	}

	#[tokio::test]
	async fn unreachable_lookup_uses_fallback() {
		let r = resolver("http://127.0.0.1:1", &[("testchan", 123)]);
		assert_eq!(r.resolve(&name("testchan")).await.unwrap(), ChatroomId::new(123));
	}

	#[tokio::test]
	async fn missing_id_and_no_fallback_fails() {
		let (addr, _) = spawn_http_stub(StatusCode::NOT_FOUND, "{}").await;
		let r = resolver(&format!("http://{addr}"), &[]);
		let err = r.resolve(&name("ghost")).await.unwrap_err();
		assert_eq!(
			err,
			ResolutionError::Unresolved {
				channel: "ghost".to_string()
			}
		);
	}

	#[tokio::test]
	async fn ok_body_without_chatroom_uses_fallback() {
		let (addr, _) = spawn_http_stub(StatusCode::OK, r#"{"id":1}"#).await;
		let r = resolver(&format!("http://{addr}"), &[("testchan", 7)]);
		assert_eq!(r.resolve(&name("testchan")).await.unwrap(), ChatroomId::new(7));
	}

	#[tokio::test]
	async fn resolve_all_skips_unresolvable_channels() {
		let r = resolver("http://127.0.0.1:1", &[("a", 1), ("c", 3)]);
		let chans = r.resolve_all(&[name("a"), name("b"), name("c")]).await;
		let got: Vec<(String, u64)> = chans.iter().map(|c| (c.name.to_string(), c.id.get())).collect();
		assert_eq!(got, vec![("a".to_string(), 1), ("c".to_string(), 3)]);
		assert!(chans.iter().all(|c| c.platform == Platform::Kick));
	}
}
