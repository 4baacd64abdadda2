use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use fleet_proto::{CapabilityDefinition, WorkerState};
use tracing::info;
use uuid::Uuid;

/// A worker's registration record, as tracked by the `WorkerRegistry`.
#[derive(Debug, Clone)]
pub struct WorkerRecord {
	pub worker_id: String,
	pub endpoint: String,
	pub capabilities: Vec<CapabilityDefinition>,
	pub state: WorkerState,
	pub cert_fingerprint: String,
	pub registration_token: String,
	pub last_seen: Instant,
	/// Monotonically increasing per-worker dispatch counter, consulted by the
	/// router's least-recently-dispatched tiebreak.
	pub last_dispatched: Instant,
}

/// Why a worker's record was retained past removal from the capability
/// registry — kept briefly for audit lookups.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TombstoneReason {
	Expired,
	Revoked,
}

#[derive(Debug, Clone)]
pub struct Tombstone {
	pub cert_fingerprint: String,
	pub reason: TombstoneReason,
	pub at: Instant,
}

const TOMBSTONE_RETENTION: Duration = Duration::from_secs(300);

#[derive(Default)]
struct Inner {
	workers: HashMap<String, WorkerRecord>,
	tombstones: HashMap<String, Tombstone>,
	/// Worker ids temporarily barred from re-registering after a revoke, per
	/// the grace-window deny list.
	deny_until: HashMap<String, Instant>,
}

/// The controller's single source of truth for worker identity and
/// lifecycle state. A single `RwLock` guards all registry mutation: at the
/// fleet sizes this system targets, a writer lock held only for the
/// duration of a map mutation is not a measured bottleneck, and it keeps
/// "reads see a coherent view" trivially true.
#[derive(Clone, Default)]
pub struct WorkerRegistry {
	inner: Arc<RwLock<Inner>>,
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
	#[error("worker {0:?} is already registered under a different certificate")]
	FingerprintMismatch(String),
	#[error("worker {0:?} is temporarily barred from re-registration")]
	DenyListed(String),
	#[error("worker {0:?} is not registered")]
	Unknown(String),
}

impl WorkerRegistry {
	pub fn new() -> Self {
		Self::default()
	}

	/// Registers a worker, enforcing the fingerprint-binding rule: a
	/// re-registration with a different certificate fingerprint is rejected
	/// unless the existing registration is `EXPIRED` or `REVOKED`.
	pub fn register(&self, worker_id: &str, endpoint: &str, capabilities: Vec<CapabilityDefinition>, cert_fingerprint: &str) -> Result<String, RegistryError> {
		let mut inner = self.inner.write().expect("registry lock poisoned");

		if let Some(until) = inner.deny_until.get(worker_id) {
			if Instant::now() < *until {
				return Err(RegistryError::DenyListed(worker_id.to_string()));
			}
		}

		if let Some(existing) = inner.workers.get(worker_id) {
			let reusable = matches!(existing.state, WorkerState::Expired | WorkerState::Revoked);
			if existing.cert_fingerprint != cert_fingerprint && !reusable {
				return Err(RegistryError::FingerprintMismatch(worker_id.to_string()));
			}
			if existing.cert_fingerprint == cert_fingerprint {
				// Idempotent re-registration: per the testable-properties
				// contract, return the existing token rather than minting a
				// new one.
				return Ok(existing.registration_token.clone());
			}
		}

		let token = Uuid::new_v4().to_string();
		let now = Instant::now();
		inner.workers.insert(
			worker_id.to_string(),
			WorkerRecord {
				worker_id: worker_id.to_string(),
				endpoint: endpoint.to_string(),
				capabilities,
				state: WorkerState::Registered,
				cert_fingerprint: cert_fingerprint.to_string(),
				registration_token: token.clone(),
				last_seen: now,
				last_dispatched: now - Duration::from_secs(3600),
			},
		);
		inner.tombstones.remove(worker_id);
		info!(worker_id, "worker registered");
		Ok(token)
	}

	/// Updates `last_seen` and transitions `REGISTERED`/`DEGRADED` → `HEALTHY`.
	/// Returns `Err` for unknown workers so the caller can answer `404`.
	pub fn heartbeat(&self, worker_id: &str) -> Result<(), RegistryError> {
		let mut inner = self.inner.write().expect("registry lock poisoned");
		let record = inner.workers.get_mut(worker_id).ok_or_else(|| RegistryError::Unknown(worker_id.to_string()))?;
		record.last_seen = Instant::now();
		if matches!(record.state, WorkerState::Registered | WorkerState::Degraded) {
			record.state = WorkerState::Healthy;
		}
		Ok(())
	}

	pub fn deregister(&self, worker_id: &str) {
		self.inner.write().expect("registry lock poisoned").workers.remove(worker_id);
	}

	pub fn get(&self, worker_id: &str) -> Option<WorkerRecord> {
		self.inner.read().expect("registry lock poisoned").workers.get(worker_id).cloned()
	}

	pub fn list(&self) -> Vec<WorkerRecord> {
		self.inner.read().expect("registry lock poisoned").workers.values().cloned().collect()
	}

	pub fn mark_dispatched(&self, worker_id: &str) {
		if let Some(record) = self.inner.write().expect("registry lock poisoned").workers.get_mut(worker_id) {
			record.last_dispatched = Instant::now();
		}
	}

	/// Applies the expiry-sweeper policy: degrade on `heartbeat_grace`,
	/// expire (and tombstone) on `worker_timeout`. Returns
	/// the set of worker ids that transitioned to `EXPIRED` this sweep, so
	/// the caller can evict them from the `CapabilityRegistry`.
	pub fn sweep(&self, heartbeat_grace: Duration, worker_timeout: Duration) -> Vec<String> {
		let mut inner = self.inner.write().expect("registry lock poisoned");
		let now = Instant::now();
		let mut expired = Vec::new();
		for record in inner.workers.values_mut() {
			let age = now.duration_since(record.last_seen);
			if age > worker_timeout && !matches!(record.state, WorkerState::Expired) {
				record.state = WorkerState::Expired;
				expired.push(record.worker_id.clone());
			} else if age > heartbeat_grace && matches!(record.state, WorkerState::Healthy) {
				record.state = WorkerState::Degraded;
			}
		}
		for id in &expired {
			if let Some(record) = inner.workers.get(id) {
				inner.tombstones.insert(
					id.clone(),
					Tombstone {
						cert_fingerprint: record.cert_fingerprint.clone(),
						reason: TombstoneReason::Expired,
						at: now,
					},
				);
			}
		}
		inner.tombstones.retain(|_, t| now.duration_since(t.at) < TOMBSTONE_RETENTION);
		expired
	}

	/// Revokes a worker: removes it from the registry, tombstones it, and
	/// bars re-registration for `deny_window`.
	pub fn revoke(&self, worker_id: &str, deny_window: Duration) -> bool {
		let mut inner = self.inner.write().expect("registry lock poisoned");
		let Some(record) = inner.workers.remove(worker_id) else {
			return false;
		};
		inner.tombstones.insert(
			worker_id.to_string(),
			Tombstone {
				cert_fingerprint: record.cert_fingerprint,
				reason: TombstoneReason::Revoked,
				at: Instant::now(),
			},
		);
		inner.deny_until.insert(worker_id.to_string(), Instant::now() + deny_window);
		true
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn registration_is_idempotent_for_same_fingerprint() {
		let reg = WorkerRegistry::new();
		let t1 = reg.register("w1", "https://w1:9000", vec![], "fp-1").unwrap();
		let t2 = reg.register("w1", "https://w1:9000", vec![], "fp-1").unwrap();
		assert_eq!(t1, t2);
	}

	#[test]
	fn registration_rejects_fingerprint_change_while_active() {
		let reg = WorkerRegistry::new();
		reg.register("w1", "https://w1:9000", vec![], "fp-1").unwrap();
		assert!(matches!(reg.register("w1", "https://w1:9000", vec![], "fp-2"), Err(RegistryError::FingerprintMismatch(_))));
	}

	#[test]
	fn heartbeat_transitions_registered_to_healthy() {
		let reg = WorkerRegistry::new();
		reg.register("w1", "https://w1:9000", vec![], "fp-1").unwrap();
		reg.heartbeat("w1").unwrap();
		assert_eq!(reg.get("w1").unwrap().state, WorkerState::Healthy);
	}

	#[test]
	fn heartbeat_from_unknown_worker_errors() {
		let reg = WorkerRegistry::new();
		assert!(matches!(reg.heartbeat("ghost"), Err(RegistryError::Unknown(_))));
	}

	#[test]
	fn revoke_bars_reregistration_during_window() {
		let reg = WorkerRegistry::new();
		reg.register("w1", "https://w1:9000", vec![], "fp-1").unwrap();
		assert!(reg.revoke("w1", Duration::from_secs(60)));
		assert!(matches!(reg.register("w1", "https://w1:9000", vec![], "fp-2"), Err(RegistryError::DenyListed(_))));
	}
}
