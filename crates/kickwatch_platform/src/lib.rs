#![forbid(unsafe_code)]

pub mod dispatch;
pub mod kick;
pub mod session;

#[cfg(test)]
mod testing;

use std::fmt;

use uuid::Uuid;

pub use dispatch::{
	DeliveryError, DispatchConfig, DispatchStats, NotificationDispatcher, NotificationSink, Notifier, PersistenceError,
	Persister,
};
pub use session::{Session, SessionConfig, SessionPool};

/// Wrapper that redacts in logs.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct SecretString(String);

impl SecretString {
	pub fn new(s: impl Into<String>) -> Self {
		Self(s.into())
	}

	/// Access the inner secret string.
	pub fn expose(&self) -> &str {
		&self.0
	}

	pub fn is_empty(&self) -> bool {
		self.0.trim().is_empty()
	}
}

impl fmt::Debug for SecretString {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("SecretString(<redacted>)")
	}
}

impl fmt::Display for SecretString {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("<redacted>")
	}
}

/// Generate an opaque connection id.
pub fn new_connection_id() -> String {
	Uuid::new_v4().to_string()
}
