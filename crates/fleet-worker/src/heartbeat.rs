use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use fleet_proto::HeartbeatRequest;
use reqwest::StatusCode;
use tracing::{error, info, warn};

use crate::client::MtlsClientFactory;
use crate::registration;

const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(5);
const CONSECUTIVE_FAILURES_BEFORE_DISCONNECT: u32 = 2;

/// Shared liveness flag the health endpoint reads. `true` once registration
/// is held and the heartbeat loop believes the controller still knows about
/// this worker.
#[derive(Clone, Default)]
pub struct ConnectionState {
	connected: Arc<AtomicBool>,
}

impl ConnectionState {
	pub fn is_connected(&self) -> bool {
		self.connected.load(Ordering::Relaxed)
	}

	fn set(&self, connected: bool) {
		self.connected.store(connected, Ordering::Relaxed);
	}
}

/// Drives the heartbeat loop until `drain` fires: posts a heartbeat every
/// `heartbeat_interval`; on two consecutive failures, marks the connection
/// disconnected and re-registers; an immediate `404` re-registers without
/// waiting for the failure count to build up.
pub async fn run(
	client_factory: Arc<MtlsClientFactory>,
	controller_url: String,
	worker_id: String,
	endpoint: String,
	capabilities: Vec<fleet_proto::CapabilityDefinition>,
	heartbeat_interval: Duration,
	state: ConnectionState,
	mut drain: fleet_core::drain::DrainWatcher,
) {
	state.set(true);
	let mut consecutive_failures = 0u32;
	let mut ticker = tokio::time::interval(heartbeat_interval);

	loop {
		tokio::select! {
			_ = ticker.tick() => {
				match send_heartbeat(&client_factory, &controller_url, &worker_id, HEARTBEAT_TIMEOUT).await {
					Ok(()) => {
						consecutive_failures = 0;
						state.set(true);
					}
					Err(HeartbeatOutcome::UnknownWorker) => {
						warn!(worker_id = %worker_id, "controller reports unknown worker, re-registering immediately");
						reregister(&client_factory, &controller_url, &worker_id, &endpoint, &capabilities, &state).await;
						consecutive_failures = 0;
					}
					Err(HeartbeatOutcome::Transient(reason)) => {
						consecutive_failures += 1;
						warn!(worker_id = %worker_id, reason, consecutive_failures, "heartbeat failed");
						if consecutive_failures >= CONSECUTIVE_FAILURES_BEFORE_DISCONNECT {
							state.set(false);
							reregister(&client_factory, &controller_url, &worker_id, &endpoint, &capabilities, &state).await;
							consecutive_failures = 0;
						}
					}
				}
			}
			_ = drain.clone().wait_for_drain() => {
				info!(worker_id = %worker_id, "heartbeat loop draining");
				return;
			}
		}
	}
}

enum HeartbeatOutcome {
	UnknownWorker,
	Transient(String),
}

async fn send_heartbeat(client_factory: &MtlsClientFactory, controller_url: &str, worker_id: &str, timeout: Duration) -> Result<(), HeartbeatOutcome> {
	let client = client_factory.client().map_err(|e| HeartbeatOutcome::Transient(e.to_string()))?;
	let resp = client
		.post(format!("{controller_url}/v1/workers/{worker_id}/heartbeat"))
		.timeout(timeout)
		.json(&HeartbeatRequest::default())
		.send()
		.await
		.map_err(|e| HeartbeatOutcome::Transient(e.to_string()))?;

	match resp.status() {
		status if status.is_success() => Ok(()),
		StatusCode::NOT_FOUND => Err(HeartbeatOutcome::UnknownWorker),
		status => Err(HeartbeatOutcome::Transient(format!("controller returned {status}"))),
	}
}

async fn reregister(client_factory: &MtlsClientFactory, controller_url: &str, worker_id: &str, endpoint: &str, capabilities: &[fleet_proto::CapabilityDefinition], state: &ConnectionState) {
	match registration::register(client_factory, controller_url, worker_id, endpoint, capabilities.to_vec()).await {
		Ok(_) => state.set(true),
		Err(err) => {
			error!(worker_id = %worker_id, %err, "re-registration failed");
			state.set(false);
		},
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn connection_state_defaults_to_disconnected() {
		let state = ConnectionState::default();
		assert!(!state.is_connected());
	}

	#[test]
	fn connection_state_reflects_last_set_value() {
		let state = ConnectionState::default();
		state.set(true);
		assert!(state.is_connected());
		state.set(false);
		assert!(!state.is_connected());
	}

	#[test]
	fn connection_state_clones_share_the_same_flag() {
		let state = ConnectionState::default();
		let clone = state.clone();
		clone.set(true);
		assert!(state.is_connected());
	}
}
