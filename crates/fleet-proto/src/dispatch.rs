use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::version::Version;

/// Routing tolerance requested by the dispatcher.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RoutePolicy {
	/// Only `HEALTHY` workers are eligible.
	#[default]
	Strict,
	/// `HEALTHY` and `DEGRADED` workers are both eligible.
	TolerateDegraded,
	/// Route to a remote mesh peer when no local candidate exists.
	Any,
}

/// Body of `POST /v1/dispatch`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchRequest {
	pub capability_id: String,
	pub required_version: Version,
	#[serde(default)]
	pub required_constraints: BTreeMap<String, String>,
	#[serde(default)]
	pub route_policy: RoutePolicy,
	pub payload: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "kebab-case")]
pub enum DispatchResult {
	Dispatched {
		worker_id: String,
		result: serde_json::Value,
	},
	UnsatisfiedCapability {
		capability_id: String,
		reason: String,
	},
}
