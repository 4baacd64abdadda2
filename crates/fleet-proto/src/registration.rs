use serde::{Deserialize, Serialize};

use crate::capability::CapabilityDefinition;

/// Lifecycle state of a worker as tracked by the controller's `WorkerRegistry`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerState {
	Registered,
	Healthy,
	Degraded,
	Expired,
	Revoked,
}

impl WorkerState {
	/// Whether a worker in this state is eligible to receive a dispatched job
	/// under the default (non `tolerate-degraded`) route policy.
	pub fn is_routable_strict(&self) -> bool {
		matches!(self, WorkerState::Healthy)
	}

	/// Whether a worker in this state is eligible to receive a dispatched job
	/// when `route_policy=tolerate-degraded`.
	pub fn is_routable_tolerant(&self) -> bool {
		matches!(self, WorkerState::Healthy | WorkerState::Degraded)
	}
}

/// Body of `POST /v1/workers/register`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterRequest {
	pub worker_id: String,
	pub endpoint: String,
	pub capabilities: Vec<CapabilityDefinition>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterResponse {
	pub registration_token: String,
	pub assigned_state: WorkerState,
}

/// Body of `POST /v1/workers/{id}/heartbeat`. Workers may attach arbitrary
/// metrics; the controller does not interpret them beyond logging.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HeartbeatRequest {
	#[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
	pub metrics: serde_json::Map<String, serde_json::Value>,
}
