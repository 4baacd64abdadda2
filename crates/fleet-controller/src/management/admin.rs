// Originally derived from https://github.com/istio/ztunnel (Apache 2.0 licensed)

use std::collections::HashMap;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use fleet_core::drain::DrainWatcher;
use fleet_core::version::BuildInfo;
use fleet_core::{signal, telemetry};
use hyper::Request;
use hyper::body::Incoming;
use tokio::time;
use tracing::{info, warn};
use tracing_subscriber::filter;

use super::hyper_helpers::{Server, empty_response, plaintext_response};
use crate::http::{Address, Response};

struct State {
	shutdown_trigger: signal::ShutdownTrigger,
	termination_min_deadline: Duration,
}

pub struct Service {
	s: Server<State>,
}

impl Service {
	pub async fn new(
		addr: Address,
		shutdown_trigger: signal::ShutdownTrigger,
		termination_min_deadline: Duration,
		drain_rx: DrainWatcher,
	) -> anyhow::Result<Self> {
		Server::<State>::bind(
			"admin",
			addr,
			drain_rx,
			State {
				shutdown_trigger,
				termination_min_deadline,
			},
		)
		.await
		.map(|s| Service { s })
	}

	pub fn address(&self) -> SocketAddr {
		self.s.address()
	}

	pub fn spawn(self) {
		self.s.spawn(|state, req| async move {
			match req.uri().path() {
				"/quitquitquit" => Ok(handle_server_shutdown(state.shutdown_trigger.clone(), req, state.termination_min_deadline).await),
				"/logging" => Ok(handle_logging(req).await),
				"/version" => Ok(plaintext_response(hyper::StatusCode::OK, format!("{}\n", BuildInfo::new()))),
				_ => Ok(empty_response(hyper::StatusCode::NOT_FOUND)),
			}
		})
	}
}

async fn handle_server_shutdown(shutdown_trigger: signal::ShutdownTrigger, req: Request<Incoming>, self_term_wait: Duration) -> Response {
	match *req.method() {
		hyper::Method::POST => {
			match time::timeout(self_term_wait, shutdown_trigger.shutdown_now()).await {
				Ok(()) => info!("shutdown completed gracefully"),
				Err(_) => warn!("graceful shutdown did not complete in {:?}, terminating now", self_term_wait),
			}
			plaintext_response(hyper::StatusCode::OK, "shutdown now\n".into())
		},
		_ => empty_response(hyper::StatusCode::METHOD_NOT_ALLOWED),
	}
}

static HELP_STRING: &str = "
usage: POST /logging\t\t\t\t\t\t(To list current level)
usage: POST /logging?level=<level>\t\t\t\t(To change global levels)
usage: POST /logging?level={mod1}:{level1},{mod2}:{level2}\t(To change specific mods' logging level)

hint: loglevel:\terror|warn|info|debug|trace|off
";
async fn handle_logging(req: Request<Incoming>) -> Response {
	match *req.method() {
		hyper::Method::POST => {
			let qp: HashMap<String, String> = req
				.uri()
				.query()
				.map(|v| url::form_urlencoded::parse(v.as_bytes()).into_owned().collect())
				.unwrap_or_default();
			let level = qp.get("level").cloned();
			let reset = qp.get("reset").cloned();
			if level.is_some() || reset.is_some() {
				change_log_level(reset.is_some(), &level.unwrap_or_default())
			} else {
				list_loggers()
			}
		},
		_ => plaintext_response(hyper::StatusCode::METHOD_NOT_ALLOWED, format!("invalid HTTP method\n {HELP_STRING}")),
	}
}

fn list_loggers() -> Response {
	match telemetry::get_current_loglevel() {
		Ok(loglevel) => plaintext_response(hyper::StatusCode::OK, format!("current log level is {loglevel}\n")),
		Err(err) => plaintext_response(hyper::StatusCode::INTERNAL_SERVER_ERROR, format!("failed to get the log level: {err}\n {HELP_STRING}")),
	}
}

fn validate_log_level(level: &str) -> anyhow::Result<()> {
	for clause in level.split(',') {
		match clause {
			"off" | "error" | "warn" | "info" | "debug" | "trace" => continue,
			s if s.contains('=') => {
				filter::Targets::from_str(s)?;
			},
			s => anyhow::bail!("level {s} is invalid"),
		}
	}
	Ok(())
}

fn change_log_level(reset: bool, level: &str) -> Response {
	if !reset && level.is_empty() {
		return list_loggers();
	}
	if !level.is_empty() {
		if validate_log_level(level).is_err() {
			return plaintext_response(hyper::StatusCode::BAD_REQUEST, format!("invalid level provided: {level}\n{HELP_STRING}"));
		};
	}
	match telemetry::set_level(reset, level) {
		Ok(_) => list_loggers(),
		Err(e) => plaintext_response(hyper::StatusCode::BAD_REQUEST, format!("failed to set new level: {e}\n{HELP_STRING}")),
	}
}
