#![forbid(unsafe_code)]

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Supported chat platforms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
	Kick,
}

impl Platform {
	/// Stable string identifier.
	pub const fn as_str(self) -> &'static str {
		match self {
			Platform::Kick => "kick",
		}
	}

	/// Human-facing name used in notifications.
	pub const fn display_name(self) -> &'static str {
		match self {
			Platform::Kick => "Kick",
		}
	}

	/// Public URL of a channel page.
	pub fn channel_url(self, channel: &ChannelName) -> String {
		match self {
			Platform::Kick => format!("https://kick.com/{}", channel.as_str()),
		}
	}
}

impl fmt::Display for Platform {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// Errors for parsing identifiers from strings.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseIdError {
	#[error("empty value")]
	Empty,
	#[error("unknown platform: {0}")]
	UnknownPlatform(String),
	#[error("invalid format: {0}")]
	InvalidFormat(String),
}

impl FromStr for Platform {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let s = s.trim();
		if s.is_empty() {
			return Err(ParseIdError::Empty);
		}

		match s.to_ascii_lowercase().as_str() {
			"kick" => Ok(Platform::Kick),
			other => Err(ParseIdError::UnknownPlatform(other.to_string())),
		}
	}
}

/// Channel slug as typed in configuration (e.g. `zombiebarricades`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelName(String);

impl ChannelName {
	/// Create a non-empty, trimmed `ChannelName`.
	pub fn new(name: impl Into<String>) -> Result<Self, ParseIdError> {
		let name = name.into();
		let trimmed = name.trim();
		if trimmed.is_empty() {
			return Err(ParseIdError::Empty);
		}
		if trimmed.contains('/') || trimmed.chars().any(char::is_whitespace) {
			return Err(ParseIdError::InvalidFormat(format!("channel name: {trimmed}")));
		}
		Ok(Self(trimmed.to_string()))
	}
	pub fn as_str(&self) -> &str {
		&self.0
	}
	pub fn into_string(self) -> String {
		self.0
	}
}

impl fmt::Display for ChannelName {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl FromStr for ChannelName {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		ChannelName::new(s.to_string())
	}
}

/// Numeric chatroom identifier on the monitored platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChatroomId(u64);

impl ChatroomId {
	pub const fn new(id: u64) -> Self {
		Self(id)
	}

	pub const fn get(self) -> u64 {
		self.0
	}

	/// Pusher channel carrying this chatroom's messages (`chatrooms.{id}.v2`).
	pub fn pusher_channel(self) -> String {
		format!("chatrooms.{}.v2", self.0)
	}
}

impl fmt::Display for ChatroomId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

impl FromStr for ChatroomId {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let s = s.trim();
		if s.is_empty() {
			return Err(ParseIdError::Empty);
		}
		s.parse::<u64>()
			.map(ChatroomId)
			.map_err(|_| ParseIdError::InvalidFormat(format!("chatroom id: {s}")))
	}
}

/// A resolved, monitored channel. Immutable once resolved.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Channel {
	pub name: ChannelName,
	pub id: ChatroomId,
	pub platform: Platform,
}

impl Channel {
	pub fn new(platform: Platform, name: ChannelName, id: ChatroomId) -> Self {
		Self { name, id, platform }
	}

	pub fn url(&self) -> String {
		self.platform.channel_url(&self.name)
	}
}

impl fmt::Display for Channel {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}:{}({})", self.platform, self.name, self.id)
	}
}

/// Why a chat message is worth relaying.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
	Mention,
	Reply,
}

impl MessageType {
	pub const fn as_str(self) -> &'static str {
		match self {
			MessageType::Mention => "Mention",
			MessageType::Reply => "Reply",
		}
	}
}

impl fmt::Display for MessageType {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// The chat message that triggered a notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationMessage {
	pub content: String,
	pub sender: String,
	/// RFC3339 timestamp as reported by the platform (or receipt time).
	pub timestamp: String,
	pub channel: Channel,
	pub message_type: MessageType,
}

/// Relayed notification; transient, never stored by the ingestion core.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
	pub message: NotificationMessage,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub original_message: Option<String>,
	pub url: String,
}

impl Notification {
	pub fn message_type(&self) -> MessageType {
		self.message.message_type
	}

	pub fn channel(&self) -> &Channel {
		&self.message.channel
	}
}
