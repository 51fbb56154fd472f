#![forbid(unsafe_code)]

mod discord;
mod null;
mod sql;
mod supabase;

#[cfg(test)]
mod testing;

pub use discord::DiscordWebhookNotifier;
pub use null::{DisabledPersister, LogNotifier};
pub use sql::SqlPersister;
pub use supabase::SupabasePersister;

use kickwatch_domain::Notification;
use serde::Serialize;

/// Flat record shape shared by every persistence backend (`kick_notifications`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub(crate) struct NotificationRow<'a> {
	pub platform: &'static str,
	#[serde(rename = "type")]
	pub kind: &'static str,
	pub channel: &'a str,
	pub username: &'a str,
	pub message: &'a str,
	pub timestamp: &'a str,
	pub url: &'a str,
	pub original_message: Option<&'a str>,
}

impl<'a> From<&'a Notification> for NotificationRow<'a> {
	fn from(n: &'a Notification) -> Self {
		let m = &n.message;
		Self {
			platform: m.channel.platform.display_name(),
			kind: m.message_type.as_str(),
			channel: m.channel.name.as_str(),
			username: &m.sender,
			message: &m.content,
			timestamp: &m.timestamp,
			url: &n.url,
			original_message: n.original_message.as_deref(),
		}
	}
}
