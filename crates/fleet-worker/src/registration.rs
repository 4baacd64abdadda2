use std::time::Duration;

use fleet_proto::{CapabilityDefinition, RegisterRequest, RegisterResponse};
use tracing::{info, warn};

use crate::client::MtlsClientFactory;

const REGISTER_TIMEOUT: Duration = Duration::from_secs(15);
const RETRY_BACKOFFS: &[Duration] = &[Duration::from_secs(1), Duration::from_secs(2), Duration::from_secs(4)];

#[derive(Debug, thiserror::Error)]
pub enum RegistrationError {
	#[error("controller unreachable after exhausting retries: {0}")]
	Exhausted(String),
	#[error("controller rejected registration: {0}")]
	Rejected(String),
}

/// Submits `POST /v1/workers/register`, retrying transient failures with the
/// same exponential backoff schedule used for CSR submission. Exhausting the
/// schedule is fatal to the worker's startup.
pub async fn register(client_factory: &MtlsClientFactory, controller_url: &str, worker_id: &str, endpoint: &str, capabilities: Vec<CapabilityDefinition>) -> Result<RegisterResponse, RegistrationError> {
	let body = RegisterRequest {
		worker_id: worker_id.to_string(),
		endpoint: endpoint.to_string(),
		capabilities,
	};

	let mut last_err = String::new();
	for (attempt, backoff) in std::iter::once(Duration::ZERO).chain(RETRY_BACKOFFS.iter().copied()).enumerate() {
		if attempt > 0 {
			warn!(attempt, backoff_secs = backoff.as_secs(), "retrying worker registration");
			tokio::time::sleep(backoff).await;
		}

		let client = match client_factory.client() {
			Ok(c) => c,
			Err(err) => {
				last_err = err.to_string();
				continue;
			},
		};

		let result = client.post(format!("{controller_url}/v1/workers/register")).timeout(REGISTER_TIMEOUT).json(&body).send().await;

		match result {
			Ok(resp) if resp.status().is_success() => {
				let parsed: RegisterResponse = resp.json().await.map_err(|e| RegistrationError::Rejected(e.to_string()))?;
				info!(worker_id, assigned_state = ?parsed.assigned_state, "worker registered");
				return Ok(parsed);
			},
			Ok(resp) if resp.status().is_client_error() => {
				let status = resp.status();
				let text = resp.text().await.unwrap_or_default();
				return Err(RegistrationError::Rejected(format!("{status}: {text}")));
			},
			Ok(resp) => {
				last_err = format!("controller returned {}", resp.status());
			},
			Err(err) => {
				last_err = err.to_string();
			},
		}
	}

	Err(RegistrationError::Exhausted(last_err))
}

/// Submits `DELETE /v1/workers/{id}`. Best-effort: shutdown proceeds
/// regardless of the outcome.
pub async fn deregister(client_factory: &MtlsClientFactory, controller_url: &str, worker_id: &str) {
	let client = match client_factory.client() {
		Ok(c) => c,
		Err(err) => {
			warn!(%err, "skipping deregistration, no mTLS client available");
			return;
		},
	};
	match client.delete(format!("{controller_url}/v1/workers/{worker_id}")).send().await {
		Ok(resp) if resp.status().is_success() => info!(worker_id, "worker deregistered"),
		Ok(resp) => warn!(worker_id, status = %resp.status(), "deregistration rejected"),
		Err(err) => warn!(worker_id, %err, "deregistration request failed"),
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn exhausted_error_mentions_the_last_failure() {
		let err = RegistrationError::Exhausted("connection refused".to_string());
		assert!(err.to_string().contains("connection refused"));
		assert!(err.to_string().contains("exhausting retries"));
	}

	#[test]
	fn rejected_error_mentions_the_controller_response() {
		let err = RegistrationError::Rejected("409: duplicate worker_id".to_string());
		assert!(err.to_string().contains("duplicate worker_id"));
	}

	#[test]
	fn retry_backoff_schedule_is_increasing() {
		assert!(RETRY_BACKOFFS.windows(2).all(|pair| pair[0] < pair[1]));
	}
}
