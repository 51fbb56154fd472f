#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::{BodyExt as _, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{HeaderMap, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use parking_lot::Mutex;
use tokio::net::TcpListener;

#[derive(Debug, Clone)]
pub(crate) struct Captured {
	pub method: String,
	pub path: String,
	pub headers: HeaderMap,
	pub body: serde_json::Value,
}

impl Captured {
	pub fn header(&self, name: &str) -> Option<&str> {
		self.headers.get(name).and_then(|v| v.to_str().ok())
	}
}

/// Answer every request with `status` and record it, JSON body included.
pub(crate) async fn spawn_capture_stub(status: StatusCode) -> (SocketAddr, Arc<Mutex<Vec<Captured>>>) {
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
					let seen = Arc::clone(&seen);
					async move {
						let (parts, body) = req.into_parts();
						let bytes = body.collect().await?.to_bytes();
						seen.lock().push(Captured {
							method: parts.method.to_string(),
							path: parts.uri.path().to_string(),
							headers: parts.headers,
							body: serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null),
						});
						Ok::<_, hyper::Error>(
							Response::builder()
								.status(status)
								.body(Full::new(Bytes::new()))
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
