// Originally derived from https://github.com/istio/ztunnel (Apache 2.0 licensed)

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use fleet_core::drain::DrainWatcher;
use hyper::Request;
use prometheus_client::encoding::text::encode;
use prometheus_client::registry::Registry;

use super::hyper_helpers;
use crate::http::{Address, Response};

pub struct Server {
	s: hyper_helpers::Server<Mutex<Registry>>,
}

impl Server {
	pub async fn new(addr: Address, drain_rx: DrainWatcher, registry: Registry) -> anyhow::Result<Self> {
		hyper_helpers::Server::<Mutex<Registry>>::bind("stats", addr, drain_rx, Mutex::new(registry))
			.await
			.map(|s| Server { s })
	}

	pub fn address(&self) -> SocketAddr {
		self.s.address()
	}

	pub fn spawn(self) {
		self.s.spawn(|registry, req| async move {
			match req.uri().path() {
				"/metrics" | "/stats/prometheus" => Ok(handle_metrics(registry, req).await),
				_ => Ok(hyper_helpers::empty_response(hyper::StatusCode::NOT_FOUND)),
			}
		})
	}
}

async fn handle_metrics(reg: Arc<Mutex<Registry>>, req: Request<hyper::body::Incoming>) -> Response {
	let mut buf = String::new();
	let reg = reg.lock().expect("mutex");
	if let Err(err) = encode(&mut buf, &reg) {
		return ::http::Response::builder()
			.status(hyper::StatusCode::INTERNAL_SERVER_ERROR)
			.body(crate::http::Body::new(bytes::Bytes::from(err.to_string())))
			.expect("builder with known status code should not fail");
	}

	let response_content_type = content_type(&req);

	::http::Response::builder()
		.status(hyper::StatusCode::OK)
		.header(hyper::header::CONTENT_TYPE, response_content_type)
		.body(crate::http::Body::new(bytes::Bytes::from(buf)))
		.expect("builder with known status code should not fail")
}

#[derive(Default)]
enum ContentType {
	#[default]
	PlainText,
	OpenMetrics,
}

impl From<ContentType> for &str {
	fn from(c: ContentType) -> Self {
		match c {
			ContentType::PlainText => "text/plain; charset=utf-8",
			ContentType::OpenMetrics => "application/openmetrics-text;charset=utf-8;version=1.0.0",
		}
	}
}

#[inline(always)]
fn content_type<T>(req: &Request<T>) -> &str {
	req
		.headers()
		.get_all(http::header::ACCEPT)
		.iter()
		.find_map(|v| match v.to_str().unwrap_or_default().to_lowercase().split(';').collect::<Vec<_>>().first() {
			Some(&"application/openmetrics-text") => Some(ContentType::OpenMetrics),
			_ => None,
		})
		.unwrap_or_default()
		.into()
}

#[cfg(test)]
mod tests {
	#[test]
	fn content_type_falls_back_to_plaintext() {
		let req = http::Request::builder().header("Accept", "application/json").body(()).unwrap();
		assert_eq!(super::content_type(&req), "text/plain; charset=utf-8");
	}

	#[test]
	fn content_type_honors_openmetrics() {
		let req = http::Request::builder().header("Accept", "application/openmetrics-text; q=1").body(()).unwrap();
		assert_eq!(super::content_type(&req), "application/openmetrics-text;charset=utf-8;version=1.0.0");
	}
}
