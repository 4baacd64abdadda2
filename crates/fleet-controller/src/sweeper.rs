use std::time::Duration;

use tracing::info;

use crate::capability_registry::CapabilityRegistry;
use crate::registry::WorkerRegistry;

/// Runs the expiry sweeper on `cleanup_interval` until the drain signal
/// fires: transitions stale workers to `DEGRADED`/`EXPIRED` and evicts
/// expired ones from the capability index so the router stops seeing them.
pub async fn run(worker_registry: WorkerRegistry, capability_registry: CapabilityRegistry, cleanup_interval: Duration, heartbeat_grace: Duration, worker_timeout: Duration, drain: fleet_core::drain::DrainWatcher) {
	let mut ticker = tokio::time::interval(cleanup_interval);
	loop {
		tokio::select! {
			_ = ticker.tick() => {
				let expired = worker_registry.sweep(heartbeat_grace, worker_timeout);
				for worker_id in &expired {
					capability_registry.remove_worker(worker_id);
					info!(worker_id, "worker expired, evicted from capability registry");
				}
			}
			_ = drain.clone().wait_for_drain() => {
				info!("expiry sweeper draining");
				return;
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use fleet_proto::WorkerState;

	use super::*;

	#[tokio::test(start_paused = true)]
	async fn sweep_expires_and_evicts_stale_worker() {
		let workers = WorkerRegistry::new();
		let caps = CapabilityRegistry::new();
		workers.register("w1", "https://w1", vec![], "fp1").unwrap();
		workers.heartbeat("w1").unwrap();
		caps.insert_worker("w1", &[]);

		tokio::time::advance(Duration::from_secs(200)).await;

		let expired = workers.sweep(Duration::from_secs(90), Duration::from_secs(120));
		assert_eq!(expired, vec!["w1".to_string()]);
		assert_eq!(workers.get("w1").unwrap().state, WorkerState::Expired);
	}
}
