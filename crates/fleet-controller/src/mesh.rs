use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use fleet_proto::WorkerState;
use tracing::{debug, info};

/// A remote controller's view of one of its workers, as exchanged in a
/// periodic mesh snapshot.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct RemoteWorker {
	pub worker_id: String,
	pub capability_ids: Vec<String>,
	pub state: WorkerState,
	pub endpoint: String,
	pub last_seen_unix_ms: u64,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct MeshSnapshot {
	pub origin_endpoint: String,
	pub seq: u64,
	pub workers: Vec<RemoteWorker>,
}

struct Entry {
	worker: RemoteWorker,
	seq: u64,
	received_at: Instant,
}

/// The controller's view of remote peers' workers, kept last-writer-wins per
/// `worker_id` keyed on `(endpoint, seq)`. Never consulted unless local
/// routing has no satisfier and the caller opted into `route_policy=any`.
#[derive(Clone, Default)]
pub struct MeshState {
	inner: Arc<RwLock<HashMap<String, Entry>>>,
}

impl MeshState {
	pub fn new() -> Self {
		Self::default()
	}

	/// Merges an incoming snapshot from `snapshot.origin_endpoint`, applying
	/// last-writer-wins on `(endpoint, seq)` per worker.
	pub fn apply(&self, snapshot: MeshSnapshot) {
		let mut inner = self.inner.write().expect("mesh state lock poisoned");
		for worker in snapshot.workers {
			let key = worker.worker_id.clone();
			let should_replace = match inner.get(&key) {
				Some(existing) => existing.seq < snapshot.seq || (existing.seq == snapshot.seq && existing.worker.endpoint == snapshot.origin_endpoint),
				None => true,
			};
			if should_replace {
				debug!(worker_id = %key, origin = %snapshot.origin_endpoint, seq = snapshot.seq, "mesh state updated");
				inner.insert(
					key,
					Entry {
						worker,
						seq: snapshot.seq,
						received_at: Instant::now(),
					},
				);
			}
		}
	}

	/// Returns a remote candidate for `capability_id`, if any survives the
	/// same staleness window as local expiry.
	pub fn candidate(&self, capability_id: &str, max_age: Duration) -> Option<RemoteWorker> {
		let inner = self.inner.read().expect("mesh state lock poisoned");
		let now = Instant::now();
		inner
			.values()
			.filter(|e| now.duration_since(e.received_at) < max_age)
			.find(|e| e.worker.state == WorkerState::Healthy && e.worker.capability_ids.iter().any(|c| c == capability_id))
			.map(|e| e.worker.clone())
	}

	/// Evicts entries older than `max_age`. Called on the same schedule as
	/// the local expiry sweeper, per the mesh-state design decision.
	pub fn evict_stale(&self, max_age: Duration) -> usize {
		let mut inner = self.inner.write().expect("mesh state lock poisoned");
		let before = inner.len();
		let now = Instant::now();
		inner.retain(|_, e| now.duration_since(e.received_at) < max_age);
		let evicted = before - inner.len();
		if evicted > 0 {
			info!(evicted, "evicted stale mesh entries");
		}
		evicted
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn snapshot(seq: u64, worker_id: &str, state: WorkerState) -> MeshSnapshot {
		MeshSnapshot {
			origin_endpoint: "https://peer-1".to_string(),
			seq,
			workers: vec![RemoteWorker {
				worker_id: worker_id.to_string(),
				capability_ids: vec!["document.convert".to_string()],
				state,
				endpoint: "https://peer-1".to_string(),
				last_seen_unix_ms: 0,
			}],
		}
	}

	#[test]
	fn later_sequence_wins() {
		let mesh = MeshState::new();
		mesh.apply(snapshot(1, "w1", WorkerState::Degraded));
		mesh.apply(snapshot(2, "w1", WorkerState::Healthy));
		let candidate = mesh.candidate("document.convert", Duration::from_secs(60)).unwrap();
		assert_eq!(candidate.state, WorkerState::Healthy);
	}

	#[test]
	fn stale_entries_are_evicted() {
		let mesh = MeshState::new();
		mesh.apply(snapshot(1, "w1", WorkerState::Healthy));
		let evicted = mesh.evict_stale(Duration::from_secs(0));
		assert_eq!(evicted, 1);
		assert!(mesh.candidate("document.convert", Duration::from_secs(60)).is_none());
	}
}
