use std::collections::BTreeMap;

use fleet_proto::{RoutePolicy, Version};

use crate::capability_registry::{CapabilityRegistry, worker_satisfies};
use crate::registry::WorkerRegistry;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteDecision {
	Dispatch { worker_id: String },
	Unsatisfied { reason: &'static str },
}

/// Implements the capability-routing algorithm: look up indexed candidates,
/// filter by compatibility and health, then prefer same-node affinity and
/// least-recently-dispatched, breaking ties on worker id. No silent
/// fallback — an empty candidate set after filtering is reported, not
/// papered over.
pub fn route(
	capability_registry: &CapabilityRegistry,
	worker_registry: &WorkerRegistry,
	capability_id: &str,
	required_version: &Version,
	required_constraints: &BTreeMap<String, String>,
	route_policy: RoutePolicy,
	affinity_node: Option<&str>,
) -> RouteDecision {
	let candidates = capability_registry.candidates(capability_id);
	if candidates.is_empty() {
		return RouteDecision::Unsatisfied { reason: "no worker advertises this capability" };
	}

	let mut eligible: Vec<_> = candidates
		.into_iter()
		.filter_map(|id| worker_registry.get(&id))
		.filter(|record| worker_satisfies(&record.capabilities, capability_id, required_version, required_constraints))
		.filter(|record| match route_policy {
			RoutePolicy::TolerateDegraded => record.state.is_routable_tolerant(),
			RoutePolicy::Strict | RoutePolicy::Any => record.state.is_routable_strict(),
		})
		.collect();

	if eligible.is_empty() {
		return RouteDecision::Unsatisfied {
			reason: "no healthy worker satisfies the requested version and constraints",
		};
	}

	eligible.sort_by(|a, b| {
		let a_key = (!affinity_node.is_some_and(|n| a.endpoint == n), a.last_dispatched, a.worker_id.clone());
		let b_key = (!affinity_node.is_some_and(|n| b.endpoint == n), b.last_dispatched, b.worker_id.clone());
		a_key.cmp(&b_key)
	});

	let winner = eligible.into_iter().next().expect("checked non-empty above");
	RouteDecision::Dispatch { worker_id: winner.worker_id }
}

#[cfg(test)]
mod tests {
	use std::time::Duration;

	use fleet_proto::{CapabilityDefinition, ErrorCodeDef, IoContract};
	use serde_json::json;

	use super::*;

	fn def() -> CapabilityDefinition {
		CapabilityDefinition {
			id: "document.convert".to_string(),
			version: Version::new(1, 0, 0),
			io_contract: IoContract {
				input_schema: json!({"type": "object"}),
				output_schema: json!({"type": "object"}),
				error_codes: vec![ErrorCodeDef {
					code: "E".to_string(),
					description: "d".to_string(),
				}],
			},
			constraints: BTreeMap::new(),
			tags: vec![],
		}
	}

	fn setup() -> (CapabilityRegistry, WorkerRegistry) {
		let caps = CapabilityRegistry::new();
		let workers = WorkerRegistry::new();
		(caps, workers)
	}

	#[test]
	fn unsatisfied_when_no_candidate_registered() {
		let (caps, workers) = setup();
		let decision = route(&caps, &workers, "document.convert", &Version::new(1, 0, 0), &BTreeMap::new(), RoutePolicy::Strict, None);
		assert!(matches!(decision, RouteDecision::Unsatisfied { .. }));
	}

	#[test]
	fn unsatisfied_when_candidate_unhealthy() {
		let (caps, workers) = setup();
		workers.register("w1", "https://w1", vec![def()], "fp1").unwrap();
		caps.insert_worker("w1", &[def()]);
		let decision = route(&caps, &workers, "document.convert", &Version::new(1, 0, 0), &BTreeMap::new(), RoutePolicy::Strict, None);
		assert!(matches!(decision, RouteDecision::Unsatisfied { .. }));
	}

	#[test]
	fn dispatches_to_healthy_worker() {
		let (caps, workers) = setup();
		workers.register("w1", "https://w1", vec![def()], "fp1").unwrap();
		workers.heartbeat("w1").unwrap();
		caps.insert_worker("w1", &[def()]);
		let decision = route(&caps, &workers, "document.convert", &Version::new(1, 0, 0), &BTreeMap::new(), RoutePolicy::Strict, None);
		assert_eq!(decision, RouteDecision::Dispatch { worker_id: "w1".to_string() });
	}

	#[test]
	fn prefers_least_recently_dispatched() {
		let (caps, workers) = setup();
		workers.register("w1", "https://w1", vec![def()], "fp1").unwrap();
		workers.register("w2", "https://w2", vec![def()], "fp2").unwrap();
		workers.heartbeat("w1").unwrap();
		workers.heartbeat("w2").unwrap();
		caps.insert_worker("w1", &[def()]);
		caps.insert_worker("w2", &[def()]);
		workers.mark_dispatched("w1");
		std::thread::sleep(Duration::from_millis(5));
		let decision = route(&caps, &workers, "document.convert", &Version::new(1, 0, 0), &BTreeMap::new(), RoutePolicy::Strict, None);
		assert_eq!(decision, RouteDecision::Dispatch { worker_id: "w2".to_string() });
	}
}
