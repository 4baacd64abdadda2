use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, RwLock};

use fleet_proto::{CapabilityDefinition, Version, capability::is_compatible};

/// Maps `capability_id` to the set of worker ids currently advertising a
/// compatible definition. Kept separate from `WorkerRegistry` so routing
/// lookups never need to scan every worker record.
#[derive(Clone, Default)]
pub struct CapabilityRegistry {
	inner: Arc<RwLock<HashMap<String, HashSet<String>>>>,
}

impl CapabilityRegistry {
	pub fn new() -> Self {
		Self::default()
	}

	/// Indexes every capability a worker advertises. Call after a successful
	/// `WorkerRegistry::register`.
	pub fn insert_worker(&self, worker_id: &str, capabilities: &[CapabilityDefinition]) {
		let mut inner = self.inner.write().expect("capability registry lock poisoned");
		for cap in capabilities {
			inner.entry(cap.id.clone()).or_default().insert(worker_id.to_string());
		}
	}

	/// Removes a worker from every capability it was indexed under. Call on
	/// expiry, revocation, or deregistration.
	pub fn remove_worker(&self, worker_id: &str) {
		let mut inner = self.inner.write().expect("capability registry lock poisoned");
		for workers in inner.values_mut() {
			workers.remove(worker_id);
		}
		inner.retain(|_, workers| !workers.is_empty());
	}

	/// Returns the worker ids currently indexed under `capability_id`,
	/// regardless of compatibility — callers filter with `is_compatible`
	/// against each worker's own advertised definition.
	pub fn candidates(&self, capability_id: &str) -> Vec<String> {
		self.inner.read().expect("capability registry lock poisoned").get(capability_id).map(|s| s.iter().cloned().collect()).unwrap_or_default()
	}
}

/// Checks whether `worker_defs` contains a definition for `capability_id`
/// that satisfies the requested version and constraints.
pub fn worker_satisfies(worker_defs: &[CapabilityDefinition], capability_id: &str, requested_version: &Version, requested_constraints: &BTreeMap<String, String>) -> bool {
	worker_defs.iter().filter(|d| d.id == capability_id).any(|d| is_compatible(requested_version, requested_constraints, d))
}

#[cfg(test)]
mod tests {
	use serde_json::json;

	use super::*;
	use fleet_proto::{ErrorCodeDef, IoContract};

	fn def(id: &str) -> CapabilityDefinition {
		CapabilityDefinition {
			id: id.to_string(),
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

	#[test]
	fn indexes_and_removes_workers() {
		let reg = CapabilityRegistry::new();
		reg.insert_worker("w1", &[def("document.convert")]);
		assert_eq!(reg.candidates("document.convert"), vec!["w1".to_string()]);
		reg.remove_worker("w1");
		assert!(reg.candidates("document.convert").is_empty());
	}

	#[test]
	fn satisfies_checks_version_and_constraints() {
		let defs = vec![def("document.convert")];
		assert!(worker_satisfies(&defs, "document.convert", &Version::new(1, 0, 0), &BTreeMap::new()));
		assert!(!worker_satisfies(&defs, "document.convert", &Version::new(2, 0, 0), &BTreeMap::new()));
		assert!(!worker_satisfies(&defs, "image.resize", &Version::new(1, 0, 0), &BTreeMap::new()));
	}
}
