#![forbid(unsafe_code)]

use std::sync::Arc;

use anyhow::Context as _;
use async_trait::async_trait;
use kickwatch_domain::{MessageType, Notification};
use kickwatch_platform::{DeliveryError, Notifier, SecretString, SessionPool};
use reqwest::StatusCode;
use serde_json::{Value, json};
use tracing::{debug, warn};

/// Kick brand green.
const KICK_COLOR: u32 = 0x53FC18;
/// Discord rejects embed field values longer than this.
const FIELD_VALUE_LIMIT: usize = 1024;

/// Posts each notification as a single embed to a Discord webhook.
pub struct DiscordWebhookNotifier {
	webhook_url: SecretString,
	pool: Arc<SessionPool>,
}

impl DiscordWebhookNotifier {
	pub fn new(webhook_url: SecretString, pool: Arc<SessionPool>) -> Self {
		Self { webhook_url, pool }
	}
}

fn truncate(s: &str) -> String {
	s.chars().take(FIELD_VALUE_LIMIT).collect()
}

fn verb(t: MessageType) -> &'static str {
	match t {
		MessageType::Mention => "mentioned",
		MessageType::Reply => "replied to",
	}
}

fn field(name: &str, value: &str, inline: bool) -> Value {
	json!({ "name": name, "value": truncate(value), "inline": inline })
}

pub(crate) fn build_embed(n: &Notification) -> Value {
	let msg = &n.message;
	let platform = msg.channel.platform.display_name();

	let mut fields = Vec::with_capacity(4);
	if let Some(original) = n.original_message.as_deref() {
		fields.push(field("Original Message", original, false));
	}
	fields.push(field("Message", &msg.content, false));
	fields.push(field("Channel", &format!("[{}]({})", msg.channel.name, n.url), true));
	fields.push(field("User", &msg.sender, true));

	json!({
		"title": format!("\u{1F514} {} on {}", msg.message_type, platform),
		"description": format!(
			"**{}** {} you in **{}**",
			msg.sender,
			verb(msg.message_type),
			msg.channel.name
		),
		"color": KICK_COLOR,
		"fields": fields,
		"timestamp": msg.timestamp,
		"footer": { "text": format!("{platform} Notification") },
	})
}

#[async_trait]
impl Notifier for DiscordWebhookNotifier {
	fn name(&self) -> &'static str {
		"discord"
	}

	async fn send(&self, n: &Notification) -> Result<(), DeliveryError> {
		let payload = json!({ "embeds": [build_embed(n)] });
		let session = self.pool.acquire().await?;
		let resp = session
			.post(self.webhook_url.expose())
			.json(&payload)
			.send()
			.await
			.context("post discord webhook")?;

		let status = resp.status();
		if status == StatusCode::NO_CONTENT || status == StatusCode::OK {
			debug!(channel = %n.message.channel.name, kind = %n.message_type(), "discord notification sent");
			return Ok(());
		}

		let body = resp.text().await.unwrap_or_default();
		warn!(status = status.as_u16(), body = %body, "discord webhook rejected notification");
		Err(DeliveryError::Status {
			status: status.as_u16(),
		})
	}
}

#[cfg(test)]
mod tests {
	use kickwatch_domain::{Channel, ChannelName, ChatroomId, NotificationMessage, Platform};
	use kickwatch_platform::SessionConfig;

	use super::*;
	use crate::adapters::testing::spawn_capture_stub;

	fn notification(kind: MessageType, content: &str, original: Option<&str>) -> Notification {
		let channel = Channel::new(Platform::Kick, ChannelName::new("testchan").unwrap(), ChatroomId::new(123));
		Notification {
			url: channel.url(),
			message: NotificationMessage {
				content: content.to_string(),
				sender: "alice".to_string(),
				timestamp: "2024-05-01T12:00:00+00:00".to_string(),
				channel,
				message_type: kind,
			},
			original_message: original.map(str::to_string),
		}
	}

	#[test]
	fn mention_embed_layout() {
		let e = build_embed(&notification(MessageType::Mention, "@bob hi", None));
		assert_eq!(e["title"], "\u{1F514} Mention on Kick");
		assert_eq!(e["description"], "**alice** mentioned you in **testchan**");
		assert_eq!(e["color"], 0x53FC18);
		assert_eq!(e["footer"]["text"], "Kick Notification");
		assert_eq!(e["timestamp"], "2024-05-01T12:00:00+00:00");

		let names: Vec<&str> = e["fields"]
			.as_array()
			.unwrap()
			.iter()
			.map(|f| f["name"].as_str().unwrap())
			.collect();
		assert_eq!(names, ["Message", "Channel", "User"]);
		assert_eq!(e["fields"][1]["value"], "[testchan](https://kick.com/testchan)");
		assert_eq!(e["fields"][1]["inline"], true);
	}

	#[test]
	fn reply_embed_leads_with_original_message() {
		let e = build_embed(&notification(MessageType::Reply, "sure", Some("anyone up?")));
		assert_eq!(e["description"], "**alice** replied to you in **testchan**");
		assert_eq!(e["fields"][0]["name"], "Original Message");
		assert_eq!(e["fields"][0]["value"], "anyone up?");
		assert_eq!(e["fields"][1]["name"], "Message");
	}

	#[test]
	fn long_values_are_truncated_on_char_boundaries() {
		let long = "é".repeat(2000);
		let e = build_embed(&notification(MessageType::Mention, &long, None));
		assert_eq!(e["fields"][0]["value"].as_str().unwrap().chars().count(), 1024);
	}

	#[tokio::test]
	async fn posts_embed_and_accepts_no_content() {
		let (addr, seen) = spawn_capture_stub(hyper::StatusCode::NO_CONTENT).await;
		let pool = Arc::new(SessionPool::new(SessionConfig::default()));
		let notifier = DiscordWebhookNotifier::new(SecretString::new(format!("http://{addr}/api/webhooks/1/t")), pool);

		notifier
			.send(&notification(MessageType::Mention, "@bob hi", None))
			.await
			.expect("delivered");

		let seen = seen.lock();
		assert_eq!(seen.len(), 1);
		assert_eq!(seen[0].method, "POST");
		assert_eq!(seen[0].path, "/api/webhooks/1/t");
		assert_eq!(seen[0].body["embeds"][0]["fields"][0]["value"], "@bob hi");
	}

	#[tokio::test]
	async fn non_success_status_is_a_delivery_error() {
		let (addr, _seen) = spawn_capture_stub(hyper::StatusCode::TOO_MANY_REQUESTS).await;
		let pool = Arc::new(SessionPool::new(SessionConfig::default()));
		let notifier = DiscordWebhookNotifier::new(SecretString::new(format!("http://{addr}/hook")), pool);

		let err = notifier
			.send(&notification(MessageType::Mention, "@bob", None))
			.await
			.unwrap_err();
		assert!(matches!(err, DeliveryError::Status { status: 429 }));
	}
}
