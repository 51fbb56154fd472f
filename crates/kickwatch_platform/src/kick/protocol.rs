#![forbid(unsafe_code)]

use std::fmt;

use kickwatch_domain::Channel;
use tracing::{debug, info, warn};

use super::pusher::{ChatPayload, InboundFrame, OutboundFrame};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolState {
	Connecting,
	Established,
	Subscribed,
	Closed,
}

impl fmt::Display for ProtocolState {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(match self {
			Self::Connecting => "connecting",
			Self::Established => "established",
			Self::Subscribed => "subscribed",
			Self::Closed => "closed",
		})
	}
}

/// What the socket owner must do after feeding a frame in.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
	Send(OutboundFrame),
	Deliver(Box<ChatPayload>),
}

/// Pure interpreter for one chatroom subscription; owns no IO.
#[derive(Debug)]
pub struct ProtocolStateMachine {
	channel: Channel,
	pusher_channel: String,
	state: ProtocolState,
	socket_id: Option<String>,
	dropped: u64,
}

impl ProtocolStateMachine {
	pub fn new(channel: Channel) -> Self {
		let pusher_channel = channel.id.pusher_channel();
		Self {
			channel,
			pusher_channel,
			state: ProtocolState::Connecting,
			socket_id: None,
			dropped: 0,
		}
	}

	pub fn state(&self) -> ProtocolState {
		self.state
	}

	pub fn socket_id(&self) -> Option<&str> {
		self.socket_id.as_deref()
	}

	/// Frames dropped as malformed, unsubscribed or foreign.
	pub fn dropped(&self) -> u64 {
		self.dropped
	}

	pub fn channel(&self) -> &Channel {
		&self.channel
	}

	pub fn close(&mut self) {
		self.state = ProtocolState::Closed;
	}

	fn drop_frame(&mut self, reason: &'static str) {
		self.dropped = self.dropped.saturating_add(1);
		metrics::counter!("kickwatch_frames_dropped_total", "reason" => reason).increment(1);
	}

	fn is_foreign(&self, frame_channel: Option<&str>) -> bool {
		frame_channel.is_some_and(|c| c != self.pusher_channel)
	}

	/// Interpret one text frame.
	pub fn handle_text(&mut self, text: &str) -> Option<Action> {
		if self.state == ProtocolState::Closed {
			return None;
		}
		metrics::counter!("kickwatch_frames_total").increment(1);

		let frame = match InboundFrame::decode(text) {
			Ok(f) => f,
			Err(e) => {
				debug!(channel = %self.channel.name, error = %e, "dropping unparseable frame");
				self.drop_frame("malformed");
				return None;
			}
		};
		self.handle_frame(frame)
	}

	pub fn handle_frame(&mut self, frame: InboundFrame) -> Option<Action> {
		if self.state == ProtocolState::Closed {
			return None;
		}

		match frame {
			InboundFrame::ConnectionEstablished(est) => {
				if self.state != ProtocolState::Connecting {
					debug!(channel = %self.channel.name, state = %self.state, "ignoring repeated connection_established");
					return None;
				}
				info!(
					channel = %self.channel.name,
					socket_id = %est.socket_id,
					activity_timeout = ?est.activity_timeout,
					"pusher connection established"
				);
				self.socket_id = Some(est.socket_id);
				self.state = ProtocolState::Established;
				Some(Action::Send(OutboundFrame::subscribe(&self.pusher_channel)))
			}
			InboundFrame::SubscriptionSucceeded { channel } => {
				if self.state != ProtocolState::Established || self.is_foreign(channel.as_deref()) {
					debug!(channel = %self.channel.name, state = %self.state, ?channel, "ignoring subscription_succeeded");
					return None;
				}
				info!(channel = %self.channel.name, chatroom = %self.pusher_channel, "subscribed to chatroom");
				self.state = ProtocolState::Subscribed;
				None
			}
			InboundFrame::Ping => Some(Action::Send(OutboundFrame::pong())),
			InboundFrame::Pong => None,
			InboundFrame::Error(err) => {
				warn!(channel = %self.channel.name, code = ?err.code, message = ?err.message, "pusher error");
				None
			}
			InboundFrame::ChatMessage { channel, payload } => {
				if self.state != ProtocolState::Subscribed {
					self.drop_frame("unsubscribed");
					return None;
				}
				if self.is_foreign(channel.as_deref()) {
					debug!(channel = %self.channel.name, frame_channel = ?channel, "dropping chat message for another chatroom");
					self.drop_frame("foreign");
					return None;
				}
				Some(Action::Deliver(Box::new(payload)))
			}
			InboundFrame::Other { event, .. } => {
				debug!(channel = %self.channel.name, %event, "ignoring event");
				None
			}
		}
	}
}
