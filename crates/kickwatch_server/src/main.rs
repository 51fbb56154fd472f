#![forbid(unsafe_code)]

mod adapters;
mod config;
mod server;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context as _, anyhow};
use kickwatch_domain::ChannelName;
use kickwatch_platform::kick::{ChannelResolver, KickClient, KickMonitor, MonitorConfig, SupervisorConfig};
use kickwatch_platform::{DispatchConfig, NotificationDispatcher, Notifier, Persister, SessionConfig, SessionPool};
use kickwatch_util::breaker::CircuitBreakerConfig;
use kickwatch_util::endpoint::{PusherEndpoint, validate_ws_url};
use kickwatch_util::tasks::TaskSupervisor;
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use url::Url;

use crate::adapters::{DisabledPersister, DiscordWebhookNotifier, LogNotifier, SqlPersister, SupabasePersister};
use crate::config::{KickSettings, PersistenceSettings, ServerConfig};
use crate::server::health::{HealthState, spawn_health_server};

fn usage_and_exit() -> ! {
	eprintln!(
		"Usage: kickwatch_server [--config path]\n\
\n\
Options:\n\
\t--config  Config file (default: ~/.kickwatch/config.toml)\n\
\t--help    Show this help\n\
"
	);
	std::process::exit(2)
}

struct Args {
	config: Option<PathBuf>,
}

fn parse_args() -> Args {
	let mut config = None;

	let mut it = std::env::args().skip(1);
	while let Some(arg) = it.next() {
		match arg.as_str() {
			"--help" | "-h" => usage_and_exit(),
			"--config" | "-c" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				if v.trim().is_empty() {
					eprintln!("--config must be non-empty");
					usage_and_exit();
				}
				config = Some(PathBuf::from(v));
			}
			other => {
				eprintln!("Unknown argument: {other}");
				usage_and_exit();
			}
		}
	}

	Args { config }
}

fn init_rustls_crypto_provider() {
	let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
}

fn init_tracing() {
	let filter = std::env::var("RUST_LOG")
		.unwrap_or_else(|_| "info,kickwatch_server=debug,kickwatch_platform=debug".to_string());

	let otlp_endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
		.ok()
		.map(|v| v.trim().to_string())
		.filter(|v| !v.is_empty());
	let base = tracing_subscriber::registry()
		.with(tracing_subscriber::EnvFilter::new(filter))
		.with(tracing_subscriber::fmt::layer().with_target(false));

	if let Some(endpoint) = otlp_endpoint {
		use opentelemetry::global;
		use opentelemetry::trace::TracerProvider as _;
		use opentelemetry_otlp::WithExportConfig;

		match opentelemetry_otlp::SpanExporter::builder()
			.with_tonic()
			.with_endpoint(endpoint.clone())
			.build()
		{
			Ok(exporter) => {
				let tracer_provider = opentelemetry_sdk::trace::SdkTracerProvider::builder()
					.with_batch_exporter(exporter)
					.build();
				let tracer = tracer_provider.tracer("kickwatch_server");
				global::set_tracer_provider(tracer_provider);

				let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);
				base.with(otel_layer).init();
				info!(endpoint = %endpoint, "otlp tracing enabled");
			}
			Err(e) => {
				base.init();
				warn!(error = %e, "failed to initialize otlp tracing");
			}
		}
	} else {
		base.init();
	}
}

fn init_metrics(bind: Option<&str>) {
	let Some(bind) = bind else {
		return;
	};

	match bind.parse::<std::net::SocketAddr>() {
		Ok(addr) => {
			if let Err(e) = metrics_exporter_prometheus::PrometheusBuilder::new()
				.with_http_listener(addr)
				.install()
			{
				warn!(error = %e, "failed to start metrics exporter");
			} else {
				info!(%addr, "metrics exporter listening");
			}
		}
		Err(e) => {
			warn!(error = %e, %bind, "invalid metrics bind address (expected host:port)");
		}
	}
}

/// The explicit override wins; otherwise the URL is derived from app key + cluster.
fn pusher_ws_url(kick: &KickSettings) -> anyhow::Result<Url> {
	let raw = match kick.pusher_ws_url.as_deref() {
		Some(url) => {
			validate_ws_url(url).map_err(|e| anyhow!(e))?;
			url.to_string()
		}
		None => PusherEndpoint::new(&kick.pusher_cluster, &kick.pusher_app_key)
			.map_err(|e| anyhow!(e))?
			.ws_url(),
	};
	Url::parse(&raw).with_context(|| format!("parse pusher websocket url {raw}"))
}

fn channel_names(kick: &KickSettings) -> Vec<ChannelName> {
	kick.channels
		.iter()
		.filter_map(|c| match ChannelName::new(c.as_str()) {
			Ok(name) => Some(name),
			Err(e) => {
				warn!(channel = %c, error = %e, "ignoring invalid channel name");
				None
			}
		})
		.collect()
}

fn build_notifier(cfg: &ServerConfig, pool: &Arc<SessionPool>) -> Arc<dyn Notifier> {
	match cfg.discord.webhook_url.clone() {
		Some(url) => {
			info!("discord webhook notifications enabled");
			Arc::new(DiscordWebhookNotifier::new(url, Arc::clone(pool)))
		}
		None => {
			warn!("no discord webhook configured; notifications are only logged");
			Arc::new(LogNotifier)
		}
	}
}

async fn build_persister(p: &PersistenceSettings, pool: &Arc<SessionPool>) -> anyhow::Result<Arc<dyn Persister>> {
	if let (Some(url), Some(key)) = (p.supabase_url.as_deref(), p.supabase_anon_key.clone()) {
		info!("supabase persistence enabled");
		return Ok(Arc::new(SupabasePersister::new(url, key, Arc::clone(pool))));
	}
	if let Some(database_url) = p.database_url.as_deref() {
		return Ok(Arc::new(SqlPersister::connect(database_url).await?));
	}
	info!("persistence disabled");
	Ok(Arc::new(DisabledPersister))
}

async fn shutdown_signal() {
	#[cfg(unix)]
	{
		use tokio::signal::unix::{SignalKind, signal};

		match signal(SignalKind::terminate()) {
			Ok(mut term) => {
				tokio::select! {
					_ = tokio::signal::ctrl_c() => info!("received ctrl-c"),
					_ = term.recv() => info!("received SIGTERM"),
				}
				return;
			}
			Err(e) => warn!(error = %e, "failed to install SIGTERM handler"),
		}
	}

	match tokio::signal::ctrl_c().await {
		Ok(()) => info!("received ctrl-c"),
		Err(e) => error!(error = %e, "failed to listen for ctrl-c"),
	}
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	init_rustls_crypto_provider();
	init_tracing();

	let args = parse_args();

	let config_path = match args.config {
		Some(path) => path,
		None => crate::config::default_config_path()?,
	};
	let cfg = crate::config::load_server_config_from_path(&config_path)?;
	info!(path = %config_path.display(), "loaded config (toml + env overrides)");

	init_metrics(cfg.server.metrics_bind.as_deref());

	let channels = channel_names(&cfg.kick);
	if channels.is_empty() {
		return Err(anyhow!("no kick channels configured"));
	}
	let ws_url = pusher_ws_url(&cfg.kick)?;

	let pool = Arc::new(SessionPool::new(SessionConfig {
		user_agent: cfg.kick.user_agent.clone(),
		..SessionConfig::default()
	}));

	let tasks = TaskSupervisor::new();
	let breaker = CircuitBreakerConfig {
		failure_threshold: cfg.breaker.failure_threshold,
		recovery_timeout: cfg.breaker.recovery_timeout,
	};

	let dispatcher = NotificationDispatcher::new(
		DispatchConfig {
			queue_capacity: cfg.dispatch.queue_capacity,
			workers: cfg.dispatch.workers,
			notifier_timeout: cfg.dispatch.notifier_timeout,
			persister_timeout: cfg.dispatch.persister_timeout,
			breaker,
		},
		build_notifier(&cfg, &pool),
		build_persister(&cfg.persistence, &pool).await?,
	);
	dispatcher.start(&tasks);

	let client = KickClient::new(cfg.kick.api_base_url.clone(), Arc::clone(&pool))
		.with_lookup_timeout(cfg.kick.lookup_timeout);
	let fallback: HashMap<_, _> = cfg.kick.fallback_chatroom_ids.clone().into_iter().collect();
	let resolver = ChannelResolver::new(client, fallback);

	let mut supervisor = SupervisorConfig::new(ws_url);
	supervisor.reconnect_min_delay = cfg.kick.reconnect_min_delay;
	supervisor.reconnect_max_delay = cfg.kick.reconnect_max_delay;
	supervisor.max_reconnect_attempts = cfg.kick.max_reconnect_attempts;
	supervisor.connect_timeout = cfg.kick.connect_timeout;

	let monitor = KickMonitor::new(
		MonitorConfig {
			target_username: cfg.kick.username.clone(),
			channels,
			supervisor,
			breaker,
			heartbeat_interval: cfg.server.heartbeat_interval,
		},
		resolver,
		Arc::clone(&pool),
		Arc::new(dispatcher.clone()),
		tasks.clone(),
	);

	let health_state = HealthState::new();
	if let Some(bind) = cfg.server.health_bind.as_deref() {
		match bind.parse::<std::net::SocketAddr>() {
			Ok(addr) => match spawn_health_server(addr, health_state.clone(), &tasks).await {
				Ok(addr) => info!(%addr, "health server listening"),
				Err(e) => warn!(error = %e, %addr, "failed to start health server"),
			},
			Err(e) => warn!(error = %e, %bind, "invalid health bind address (expected host:port)"),
		}
	}

	if let Err(e) = monitor.start().await {
		monitor.shutdown(cfg.server.shutdown_timeout).await;
		return Err(e.context("start kick monitor"));
	}
	health_state.mark_ready();

	shutdown_signal().await;
	health_state.mark_not_ready();

	let report = monitor.shutdown(cfg.server.shutdown_timeout).await;
	let stats = dispatcher.stats();
	info!(
		finished = report.finished,
		aborted = report.aborted,
		submitted = stats.submitted,
		delivered = stats.delivered,
		persisted = stats.persisted,
		evicted = stats.evicted,
		"kickwatch_server stopped"
	);

	Ok(())
}
