#![forbid(unsafe_code)]

use kickwatch_domain::{Channel, MessageType, Notification, NotificationMessage};

use super::pusher::{ChatMessageKind, ChatPayload};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
	Mention,
	Reply { original_message: Option<String> },
	None,
}

impl Classification {
	pub fn message_type(&self) -> Option<MessageType> {
		match self {
			Self::Mention => Some(MessageType::Mention),
			Self::Reply { .. } => Some(MessageType::Reply),
			Self::None => None,
		}
	}
}

/// Decides whether a chat message concerns the watched user.
#[derive(Debug, Clone)]
pub struct MessageClassifier {
	target: String,
	mention: String,
}

impl MessageClassifier {
	/// An empty `target` disables classification.
	pub fn new(target: &str) -> Self {
		let target = target.trim().trim_start_matches('@').to_lowercase();
		let mention = format!("@{target}");
		Self { target, mention }
	}

	pub fn target(&self) -> &str {
		&self.target
	}

	fn is_target(&self, username: &str) -> bool {
		username.trim().to_lowercase() == self.target
	}

	pub fn classify(&self, payload: &ChatPayload) -> Classification {
		if self.target.is_empty() || self.is_target(&payload.sender.username) {
			return Classification::None;
		}

		if payload.kind == ChatMessageKind::Reply && payload.original_sender().is_some_and(|s| self.is_target(s)) {
			let original_message = payload
				.original_message()
				.map(|m| m.to_plain_text())
				.filter(|s| !s.trim().is_empty());
			return Classification::Reply { original_message };
		}

		if payload.content.to_lowercase().contains(&self.mention) {
			return Classification::Mention;
		}

		Classification::None
	}

	/// Classify and build the notification for qualifying messages.
	pub fn notification_for(&self, payload: &ChatPayload, channel: &Channel) -> Option<Notification> {
		let classification = self.classify(payload);
		let message_type = classification.message_type()?;
		let original_message = match classification {
			Classification::Reply { original_message } => original_message,
			_ => None,
		};

		let timestamp = payload
			.created_at
			.clone()
			.filter(|s| !s.trim().is_empty())
			.unwrap_or_else(|| chrono::Utc::now().to_rfc3339());

		Some(Notification {
			message: NotificationMessage {
				content: payload.content.clone(),
				sender: payload.sender.username.clone(),
				timestamp,
				channel: channel.clone(),
				message_type,
			},
			original_message,
			url: channel.url(),
		})
	}
}
