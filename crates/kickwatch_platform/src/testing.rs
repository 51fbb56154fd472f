#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use parking_lot::Mutex;
use tokio::net::TcpListener;

/// Request line and user agent seen by [`spawn_http_stub`].
#[derive(Debug, Clone)]
pub(crate) struct SeenRequest {
	pub path: String,
	pub user_agent: Option<String>,
}

/// Serve `status` + `body` for every request on an ephemeral local port.
pub(crate) async fn spawn_http_stub(status: StatusCode, body: &'static str) -> (SocketAddr, Arc<Mutex<Vec<SeenRequest>>>) {
	let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind stub");
	let addr = listener.local_addr().expect("stub addr");
	let seen = Arc::new(Mutex::new(Vec::new()));
	let seen_srv = Arc::clone(&seen);

	tokio::spawn(async move {
		loop {
			let Ok((stream, _)) = listener.accept().await else {
				return;
			};
			let seen = Arc::clone(&seen_srv);
			tokio::spawn(async move {
				let service = service_fn(move |req: Request<Incoming>| {
					seen.lock().push(SeenRequest {
						path: req.uri().path().to_string(),
						user_agent: req
							.headers()
							.get("user-agent")
							.and_then(|v| v.to_str().ok())
							.map(str::to_string),
					});
					async move {
						Ok::<_, hyper::Error>(
							Response::builder()
								.status(status)
								.header("content-type", "application/json")
								.body(Full::new(Bytes::from_static(body.as_bytes())))
								.expect("stub response"),
						)
					}
				});
				let _ = http1::Builder::new().serve_connection(TokioIo::new(stream), service).await;
			});
		}
	});

	(addr, seen)
}
