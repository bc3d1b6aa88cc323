//! Accept loops for the metadata and health listeners.

// std
use std::convert::Infallible;
// crates.io
use bytes::Bytes;
use http::{Request, Response, StatusCode, header};
use http_body_util::Full;
use hyper::{body::Incoming, server::conn::http1, service::service_fn};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
// self
use crate::{
	_prelude::*,
	http::router::{BoxFuture, Router},
	metrics,
};

/// Async readiness probe consulted by `/readyz`.
pub type ReadyCheck = Arc<dyn Fn() -> BoxFuture<bool> + Send + Sync>;

/// Serve the metadata directory until the context is canceled.
///
/// In-flight connections get `grace` to finish once shutdown starts.
pub async fn serve_metadata(
	listener: TcpListener,
	router: Arc<Router>,
	ctx: CancellationToken,
	grace: Duration,
) -> Result<()> {
	if let Ok(addr) = listener.local_addr() {
		tracing::info!(%addr, "metadata server listening");
	}

	loop {
		let (stream, peer) = tokio::select! {
			accepted = listener.accept() => accepted?,
			_ = ctx.cancelled() => return Ok(()),
		};
		let io = TokioIo::new(stream);
		let router = router.clone();
		let ctx = ctx.clone();

		tokio::spawn(async move {
			let svc = service_fn(move |request: Request<Incoming>| {
				let router = router.clone();

				async move {
					let started = Instant::now();
					let (parts, _) = request.into_parts();
					let response =
						router.dispatch(&parts.method, &parts.uri, &parts.headers, peer).await;
					let status = response.status().as_u16();
					// Unmatched paths share one label so probing cannot blow
					// up metric cardinality.
					let route =
						if status == 404 { "unmatched" } else { parts.uri.path() };

					metrics::record_request(route, status, started.elapsed());
					tracing::debug!(
						peer = %peer,
						path = parts.uri.path(),
						status,
						"request served"
					);

					Ok::<_, Infallible>(response.map(|body| Full::new(Bytes::from(body))))
				}
			});
			let conn = http1::Builder::new().serve_connection(io, svc);

			tokio::pin!(conn);
			tokio::select! {
				result = conn.as_mut() => {
					if let Err(err) = result {
						tracing::debug!(peer = %peer, error = %err, "connection error");
					}
				},
				_ = ctx.cancelled() => {
					conn.as_mut().graceful_shutdown();

					let _ = tokio::time::timeout(grace, conn).await;
				},
			}
		});
	}
}

/// Serve `/healthz`, `/readyz`, and `/metrics` on the internal port.
pub async fn serve_health(
	listener: TcpListener,
	ready: ReadyCheck,
	ctx: CancellationToken,
) -> Result<()> {
	if let Ok(addr) = listener.local_addr() {
		tracing::info!(%addr, "health server listening");
	}

	loop {
		let (stream, _) = tokio::select! {
			accepted = listener.accept() => accepted?,
			_ = ctx.cancelled() => return Ok(()),
		};
		let io = TokioIo::new(stream);
		let ready = ready.clone();

		tokio::spawn(async move {
			let svc = service_fn(move |request: Request<Incoming>| {
				let ready = ready.clone();

				async move { Ok::<_, Infallible>(health_response(request.uri().path(), ready).await) }
			});

			if let Err(err) = http1::Builder::new().serve_connection(io, svc).await {
				tracing::debug!(error = %err, "health connection error");
			}
		});
	}
}

async fn health_response(path: &str, ready: ReadyCheck) -> Response<Full<Bytes>> {
	let (status, body) = match path {
		"/healthz" => (StatusCode::OK, "ok".to_owned()),
		"/readyz" =>
			if ready().await {
				(StatusCode::OK, "ok".to_owned())
			} else {
				(StatusCode::SERVICE_UNAVAILABLE, "not ready".to_owned())
			},
		"/metrics" => match metrics::prometheus_handle() {
			Some(handle) => (StatusCode::OK, handle.render()),
			None => (StatusCode::SERVICE_UNAVAILABLE, "metrics exporter not installed".to_owned()),
		},
		_ => (StatusCode::NOT_FOUND, "not found".to_owned()),
	};
	let mut response = Response::new(Full::new(Bytes::from(body)));

	*response.status_mut() = status;
	response.headers_mut().insert(
		header::CONTENT_TYPE,
		http::HeaderValue::from_static("text/plain; charset=utf-8"),
	);

	response
}

#[cfg(test)]
mod tests {
	// self
	use super::*;
	use crate::http::router::{Payload, handler};

	#[tokio::test]
	async fn serves_requests_and_stops_on_cancellation() {
		let mut router = Router::new();

		router.route("/probe/value", handler(|_| async { Ok(Payload::Text("42".into())) }));

		let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
		let addr = listener.local_addr().unwrap();
		let ctx = CancellationToken::new();
		let server = tokio::spawn(serve_metadata(
			listener,
			Arc::new(router),
			ctx.clone(),
			Duration::from_secs(1),
		));
		let body = reqwest::get(format!("http://{addr}/probe/value"))
			.await
			.unwrap()
			.text()
			.await
			.unwrap();

		assert_eq!(body, "42");

		ctx.cancel();
		server.await.unwrap().unwrap();
	}

	#[tokio::test]
	async fn health_endpoints_reflect_readiness() {
		let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
		let addr = listener.local_addr().unwrap();
		let ctx = CancellationToken::new();
		let ready: ReadyCheck = Arc::new(|| Box::pin(async { false }));
		let server = tokio::spawn(serve_health(listener, ready, ctx.clone()));
		let healthz = reqwest::get(format!("http://{addr}/healthz")).await.unwrap();

		assert_eq!(healthz.status().as_u16(), 200);

		let readyz = reqwest::get(format!("http://{addr}/readyz")).await.unwrap();

		assert_eq!(readyz.status().as_u16(), 503);

		ctx.cancel();
		server.await.unwrap().unwrap();
	}
}
