#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use kickwatch_util::tasks::TaskSupervisor;
use tokio::net::TcpListener;
use tracing::{info, warn};

/// Readiness flag: set once every channel is resolved and its supervisor started, cleared on shutdown.
#[derive(Clone, Default)]
pub struct HealthState {
	ready: Arc<AtomicBool>,
}

impl HealthState {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn mark_ready(&self) {
		self.ready.store(true, Ordering::Relaxed);
	}

	pub fn mark_not_ready(&self) {
		self.ready.store(false, Ordering::Relaxed);
	}

	pub fn is_ready(&self) -> bool {
		self.ready.load(Ordering::Relaxed)
	}
}

/// Bind `bind` and serve `/healthz` + `/readyz` as a task of `tasks` until they are cancelled.
pub async fn spawn_health_server(
	bind: SocketAddr,
	state: HealthState,
	tasks: &TaskSupervisor,
) -> anyhow::Result<SocketAddr> {
	let listener = TcpListener::bind(bind).await?;
	let addr = listener.local_addr()?;
	let cancel = tasks.token();
	tasks.spawn("health", async move {
		tokio::select! {
			_ = cancel.cancelled() => info!("health server stopped"),
			res = run_health_server(listener, state) => {
				if let Err(err) = res {
					warn!(error = %err, "health server stopped");
				}
			}
		}
	});
	Ok(addr)
}

async fn run_health_server(listener: TcpListener, state: HealthState) -> anyhow::Result<()> {
	loop {
		let (stream, _addr) = listener.accept().await?;
		let io = TokioIo::new(stream);
		let state = state.clone();
		tokio::spawn(async move {
			let service = service_fn(move |req| handle_health(req, state.clone()));
			if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
				warn!(error = %err, "health connection error");
			}
		});
	}
}

fn reply(status: StatusCode, body: &'static [u8]) -> Response<Full<Bytes>> {
	let mut resp = Response::new(Full::new(Bytes::from_static(body)));
	*resp.status_mut() = status;
	resp
}

async fn handle_health(req: Request<Incoming>, state: HealthState) -> Result<Response<Full<Bytes>>, hyper::Error> {
	if req.method() != Method::GET {
		return Ok(reply(StatusCode::METHOD_NOT_ALLOWED, b""));
	}

	Ok(match req.uri().path() {
		"/healthz" => reply(StatusCode::OK, b"ok"),
		"/readyz" if state.is_ready() => reply(StatusCode::OK, b"ready"),
		"/readyz" => reply(StatusCode::SERVICE_UNAVAILABLE, b"not-ready"),
		_ => reply(StatusCode::NOT_FOUND, b""),
	})
}
