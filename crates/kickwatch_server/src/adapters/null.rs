#![forbid(unsafe_code)]

use async_trait::async_trait;
use kickwatch_domain::Notification;
use kickwatch_platform::{DeliveryError, Notifier, PersistenceError, Persister};
use tracing::info;

/// Notifier used when no webhook is configured: the notification only reaches the log.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
	fn name(&self) -> &'static str {
		"log"
	}

	async fn send(&self, n: &Notification) -> Result<(), DeliveryError> {
		info!(
			kind = %n.message_type(),
			channel = %n.message.channel.name,
			sender = %n.message.sender,
			content = %n.message.content,
			"notification (no webhook configured)"
		);
		Ok(())
	}
}

/// Persistence turned off. Always reports success.
pub struct DisabledPersister;

#[async_trait]
impl Persister for DisabledPersister {
	fn name(&self) -> &'static str {
		"disabled"
	}

	async fn save(&self, _n: &Notification) -> Result<(), PersistenceError> {
		Ok(())
	}
}
