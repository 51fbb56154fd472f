#![forbid(unsafe_code)]

use anyhow::{Context, anyhow};
use async_trait::async_trait;
use kickwatch_domain::Notification;
use kickwatch_platform::{PersistenceError, Persister};
use tracing::info;

use super::NotificationRow;

const SQLITE_SCHEMA: &str = "CREATE TABLE IF NOT EXISTS kick_notifications (\
	id INTEGER PRIMARY KEY AUTOINCREMENT, \
	platform TEXT NOT NULL, \
	type TEXT NOT NULL, \
	channel TEXT NOT NULL, \
	username TEXT NOT NULL, \
	message TEXT NOT NULL, \
	timestamp TEXT NOT NULL, \
	url TEXT NOT NULL, \
	original_message TEXT, \
	created_at INTEGER NOT NULL)";

const POSTGRES_SCHEMA: &str = "CREATE TABLE IF NOT EXISTS kick_notifications (\
	id BIGSERIAL PRIMARY KEY, \
	platform TEXT NOT NULL, \
	type TEXT NOT NULL, \
	channel TEXT NOT NULL, \
	username TEXT NOT NULL, \
	message TEXT NOT NULL, \
	timestamp TEXT NOT NULL, \
	url TEXT NOT NULL, \
	original_message TEXT, \
	created_at TIMESTAMPTZ NOT NULL DEFAULT NOW())";

const MYSQL_SCHEMA: &str = "CREATE TABLE IF NOT EXISTS kick_notifications (\
	id BIGINT AUTO_INCREMENT PRIMARY KEY, \
	platform VARCHAR(32) NOT NULL, \
	type VARCHAR(32) NOT NULL, \
	channel VARCHAR(255) NOT NULL, \
	username VARCHAR(255) NOT NULL, \
	message TEXT NOT NULL, \
	timestamp VARCHAR(64) NOT NULL, \
	url TEXT NOT NULL, \
	original_message TEXT, \
	created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP)";

/// Writes notifications into a `kick_notifications` table, created on connect.
#[derive(Clone)]
pub struct SqlPersister {
	backend: SqlBackend,
}

#[derive(Clone)]
enum SqlBackend {
	Sqlite(sqlx::SqlitePool),
	Postgres(sqlx::PgPool),
	Mysql(sqlx::MySqlPool),
}

impl SqlPersister {
	pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
		let backend = if database_url.starts_with("sqlite:") {
			let pool = sqlx::SqlitePool::connect(database_url).await.context("connect sqlite")?;
			sqlx::query(SQLITE_SCHEMA)
				.execute(&pool)
				.await
				.context("create kick_notifications (sqlite)")?;
			SqlBackend::Sqlite(pool)
		} else if database_url.starts_with("postgres:") || database_url.starts_with("postgresql:") {
			let pool = sqlx::PgPool::connect(database_url).await.context("connect postgres")?;
			sqlx::query(POSTGRES_SCHEMA)
				.execute(&pool)
				.await
				.context("create kick_notifications (postgres)")?;
			SqlBackend::Postgres(pool)
		} else if database_url.starts_with("mysql:") || database_url.starts_with("mariadb:") {
			let pool = sqlx::MySqlPool::connect(database_url).await.context("connect mysql")?;
			sqlx::query(MYSQL_SCHEMA)
				.execute(&pool)
				.await
				.context("create kick_notifications (mysql)")?;
			SqlBackend::Mysql(pool)
		} else {
			return Err(anyhow!("unsupported database_url (expected sqlite:, postgres: or mysql:)"));
		};

		info!(backend = backend.name(), "sql persistence ready");
		Ok(Self { backend })
	}

	async fn insert(&self, row: &NotificationRow<'_>) -> anyhow::Result<()> {
		match &self.backend {
			SqlBackend::Sqlite(pool) => {
				sqlx::query(
					"INSERT INTO kick_notifications \
					(platform, type, channel, username, message, timestamp, url, original_message, created_at) \
					VALUES (?, ?, ?, ?, ?, ?, ?, ?, strftime('%s','now'))",
				)
				.bind(row.platform)
				.bind(row.kind)
				.bind(row.channel)
				.bind(row.username)
				.bind(row.message)
				.bind(row.timestamp)
				.bind(row.url)
				.bind(row.original_message)
				.execute(pool)
				.await
				.context("insert kick_notifications (sqlite)")?;
			}
			SqlBackend::Postgres(pool) => {
				sqlx::query(
					"INSERT INTO kick_notifications \
					(platform, type, channel, username, message, timestamp, url, original_message) \
					VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
				)
				.bind(row.platform)
				.bind(row.kind)
				.bind(row.channel)
				.bind(row.username)
				.bind(row.message)
				.bind(row.timestamp)
				.bind(row.url)
				.bind(row.original_message)
				.execute(pool)
				.await
				.context("insert kick_notifications (postgres)")?;
			}
			SqlBackend::Mysql(pool) => {
				sqlx::query(
					"INSERT INTO kick_notifications \
					(platform, type, channel, username, message, timestamp, url, original_message) \
					VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
				)
				.bind(row.platform)
				.bind(row.kind)
				.bind(row.channel)
				.bind(row.username)
				.bind(row.message)
				.bind(row.timestamp)
				.bind(row.url)
				.bind(row.original_message)
				.execute(pool)
				.await
				.context("insert kick_notifications (mysql)")?;
			}
		}
		Ok(())
	}
}

impl SqlBackend {
	fn name(&self) -> &'static str {
		match self {
			SqlBackend::Sqlite(_) => "sqlite",
			SqlBackend::Postgres(_) => "postgres",
			SqlBackend::Mysql(_) => "mysql",
		}
	}
}

#[async_trait]
impl Persister for SqlPersister {
	fn name(&self) -> &'static str {
		self.backend.name()
	}

	async fn save(&self, n: &Notification) -> Result<(), PersistenceError> {
		self.insert(&NotificationRow::from(n)).await?;
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use kickwatch_domain::{Channel, ChannelName, ChatroomId, MessageType, NotificationMessage, Platform};
	use sqlx::Row as _;

	use super::*;

	fn mention(sender: &str) -> Notification {
		let channel = Channel::new(Platform::Kick, ChannelName::new("testchan").unwrap(), ChatroomId::new(123));
		Notification {
			url: channel.url(),
			message: NotificationMessage {
				content: "@bob hi".to_string(),
				sender: sender.to_string(),
				timestamp: "2024-05-01T12:00:00+00:00".to_string(),
				channel,
				message_type: MessageType::Mention,
			},
			original_message: None,
		}
	}

	fn sqlite_url(dir: &tempfile::TempDir) -> String {
		format!("sqlite://{}?mode=rwc", dir.path().join("kickwatch.db").display())
	}

	#[tokio::test]
	async fn sqlite_rows_are_written() {
		let dir = tempfile::tempdir().expect("tempdir");
		let persister = SqlPersister::connect(&sqlite_url(&dir)).await.expect("connect");
		assert_eq!(persister.name(), "sqlite");

		persister.save(&mention("alice")).await.expect("save");
		persister.save(&mention("carol")).await.expect("save");

		let SqlBackend::Sqlite(pool) = &persister.backend else {
			panic!("expected sqlite backend");
		};
		let rows = sqlx::query("SELECT platform, type, username, original_message FROM kick_notifications ORDER BY id")
			.fetch_all(pool)
			.await
			.expect("select");
		assert_eq!(rows.len(), 2);
		assert_eq!(rows[0].get::<String, _>("platform"), "Kick");
		assert_eq!(rows[0].get::<String, _>("type"), "Mention");
		assert_eq!(rows[0].get::<String, _>("username"), "alice");
		assert_eq!(rows[0].get::<Option<String>, _>("original_message"), None);
		assert_eq!(rows[1].get::<String, _>("username"), "carol");
	}

	#[tokio::test]
	async fn reconnecting_keeps_existing_table() {
		let dir = tempfile::tempdir().expect("tempdir");
		let url = sqlite_url(&dir);
		SqlPersister::connect(&url)
			.await
			.expect("connect")
			.save(&mention("alice"))
			.await
			.expect("save");

		let again = SqlPersister::connect(&url).await.expect("reconnect");
		let SqlBackend::Sqlite(pool) = &again.backend else {
			panic!("expected sqlite backend");
		};
		let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM kick_notifications")
			.fetch_one(pool)
			.await
			.expect("count");
		assert_eq!(count, 1);
	}

	#[tokio::test]
	async fn unknown_scheme_is_rejected() {
		assert!(SqlPersister::connect("redis://localhost").await.is_err());
	}
}
