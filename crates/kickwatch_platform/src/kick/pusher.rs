#![forbid(unsafe_code)]

//! Pusher wire frames as spoken by Kick chat.
//!
//! Every frame is `{"event": .., "data": .., "channel": ..}`. Pusher double-encodes `data`: it is
//! usually a JSON *string* holding another JSON document, so decoding happens in two steps.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer};
use serde_json::{Value, json};
use thiserror::Error;

pub const EVENT_CONNECTION_ESTABLISHED: &str = "pusher:connection_established";
pub const EVENT_PING: &str = "pusher:ping";
pub const EVENT_PONG: &str = "pusher:pong";
pub const EVENT_SUBSCRIBE: &str = "pusher:subscribe";
pub const EVENT_SUBSCRIPTION_SUCCEEDED: &str = "pusher_internal:subscription_succeeded";
pub const EVENT_ERROR: &str = "pusher:error";
pub const EVENT_CHAT_MESSAGE: &str = r"App\Events\ChatMessageEvent";

#[derive(Debug, Error)]
pub enum ProtocolError {
	#[error("malformed frame: {0}")]
	Malformed(#[source] serde_json::Error),
	#[error("malformed '{event}' payload: {source}")]
	Payload {
		event: String,
		#[source]
		source: serde_json::Error,
	},
}

/// One inbound socket frame before interpretation.
#[derive(Debug, Clone, Deserialize)]
pub struct RawFrame {
	pub event: String,
	#[serde(default)]
	pub data: Value,
	#[serde(default)]
	pub channel: Option<String>,
}

impl RawFrame {
	pub fn parse(text: &str) -> Result<Self, ProtocolError> {
		serde_json::from_str(text).map_err(ProtocolError::Malformed)
	}

	/// Decode `data`, unwrapping the string encoding when present.
	pub fn data_as<T: DeserializeOwned>(&self) -> Result<T, ProtocolError> {
		let res = match &self.data {
			Value::String(s) => serde_json::from_str(s),
			other => serde_json::from_value(other.clone()),
		};
		res.map_err(|source| ProtocolError::Payload {
			event: self.event.clone(),
			source,
		})
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ConnectionEstablished {
	pub socket_id: String,
	#[serde(default)]
	pub activity_timeout: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct PusherErrorData {
	#[serde(default)]
	pub code: Option<i64>,
	#[serde(default)]
	pub message: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatMessageKind {
	#[default]
	#[serde(alias = "message")]
	Normal,
	Reply,
	#[serde(other)]
	Other,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ChatSender {
	pub username: String,
}

/// A quoted message, either `{"content": ..}` or bare text.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum OriginalMessage {
	Text(String),
	Structured(serde_json::Map<String, Value>),
	Other(Value),
}

impl OriginalMessage {
	/// Plain text of the quoted message; the structured form prefers its `content` field.
	pub fn to_plain_text(&self) -> String {
		match self {
			Self::Text(s) => s.clone(),
			Self::Structured(map) => match map.get("content") {
				Some(Value::String(s)) => s.clone(),
				Some(v) => v.to_string(),
				None => Value::Object(map.clone()).to_string(),
			},
			Self::Other(v) => v.to_string(),
		}
	}
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ChatMetadata {
	#[serde(default, deserialize_with = "or_default")]
	pub original_sender: Option<ChatSender>,
	#[serde(default)]
	pub original_message: Option<OriginalMessage>,
}

/// Chat message carried by [`EVENT_CHAT_MESSAGE`].
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ChatPayload {
	#[serde(default)]
	pub id: Option<Value>,
	#[serde(default, deserialize_with = "string_or_null")]
	pub content: String,
	#[serde(rename = "type", default, deserialize_with = "or_default")]
	pub kind: ChatMessageKind,
	pub sender: ChatSender,
	#[serde(default, deserialize_with = "or_default")]
	pub metadata: Option<ChatMetadata>,
	#[serde(default, deserialize_with = "or_default")]
	pub created_at: Option<String>,
}

/// Optional fields fall back to their default when their shape is unexpected.
fn or_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
	D: Deserializer<'de>,
	T: DeserializeOwned + Default,
{
	let value = Value::deserialize(deserializer)?;
	Ok(serde_json::from_value(value).unwrap_or_default())
}

fn string_or_null<'de, D>(deserializer: D) -> Result<String, D::Error>
where
	D: Deserializer<'de>,
{
	Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_default())
}

impl ChatPayload {
	pub fn original_sender(&self) -> Option<&str> {
		self.metadata
			.as_ref()
			.and_then(|m| m.original_sender.as_ref())
			.map(|s| s.username.as_str())
	}

	pub fn original_message(&self) -> Option<&OriginalMessage> {
		self.metadata.as_ref().and_then(|m| m.original_message.as_ref())
	}
}

/// Interpreted inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
	ConnectionEstablished(ConnectionEstablished),
	SubscriptionSucceeded { channel: Option<String> },
	Ping,
	Pong,
	Error(PusherErrorData),
	ChatMessage { channel: Option<String>, payload: ChatPayload },
	Other { event: String, channel: Option<String> },
}

impl InboundFrame {
	pub fn decode(text: &str) -> Result<Self, ProtocolError> {
		let raw = RawFrame::parse(text)?;
		Self::from_raw(raw)
	}

	pub fn from_raw(raw: RawFrame) -> Result<Self, ProtocolError> {
		Ok(match raw.event.as_str() {
			EVENT_CONNECTION_ESTABLISHED => Self::ConnectionEstablished(raw.data_as()?),
			EVENT_SUBSCRIPTION_SUCCEEDED => Self::SubscriptionSucceeded { channel: raw.channel },
			EVENT_PING => Self::Ping,
			EVENT_PONG => Self::Pong,
			// Error bodies vary between servers; an unreadable one is still an error frame.
			EVENT_ERROR => Self::Error(raw.data_as().unwrap_or_default()),
			EVENT_CHAT_MESSAGE => {
				let payload = raw.data_as()?;
				Self::ChatMessage {
					channel: raw.channel,
					payload,
				}
			}
			_ => Self::Other {
				event: raw.event,
				channel: raw.channel,
			},
		})
	}
}

/// Client → server frame.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundFrame(Value);

impl OutboundFrame {
	pub fn subscribe(channel: &str) -> Self {
		Self(json!({ "event": EVENT_SUBSCRIBE, "data": { "auth": "", "channel": channel } }))
	}

	pub fn pong() -> Self {
		Self(json!({ "event": EVENT_PONG, "data": {} }))
	}

	pub fn event(&self) -> &str {
		self.0.get("event").and_then(Value::as_str).unwrap_or_default()
	}

	pub fn as_value(&self) -> &Value {
		&self.0
	}

	pub fn to_text(&self) -> String {
		self.0.to_string()
	}
}
