use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Extension, Path, State};
use axum::middleware::{self, Next};
use axum::response::IntoResponse;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use fleet_ca::Identity;
use fleet_proto::{DispatchRequest, DispatchResult, HeartbeatRequest, RegisterRequest, RegisterResponse, capability};
use http::{Request, StatusCode};
use serde::Serialize;
use tower::limit::ConcurrencyLimitLayer;

use crate::audit::{self, AuditEvent};
use crate::capability_registry::CapabilityRegistry;
use crate::error::ApiError;
use crate::mtls_accept::{CertFingerprint, PeerIdentity};
use crate::registry::{RegistryError, WorkerRegistry};
use crate::router::{RouteDecision, route};

#[derive(Clone)]
pub struct AppState {
	pub workers: WorkerRegistry,
	pub capabilities: CapabilityRegistry,
	pub revoke_deny_window: Duration,
	pub ca_service_url: String,
	pub http: reqwest::Client,
}

/// Bound on in-flight `/v1/*` requests before the controller starts shedding
/// load with `429`, per the backpressure implementation note.
const MAX_CONCURRENT_REQUESTS: usize = 512;

pub fn router(state: AppState) -> Router {
	Router::new()
		.route("/v1/workers/register", post(register))
		.route("/v1/workers/{id}/heartbeat", post(heartbeat))
		.route("/v1/workers/{id}", delete(deregister))
		.route("/v1/workers", get(list_workers))
		.route("/v1/workers/{id}/revoke", post(revoke))
		.route("/v1/dispatch", post(dispatch))
		.layer(middleware::from_fn(require_identity))
		.layer(ConcurrencyLimitLayer::new(MAX_CONCURRENT_REQUESTS))
		.with_state(Arc::new(state))
}

/// Rejects any request whose connection never yielded a verified peer
/// identity. Every route under this router is mTLS-only; an identity-less
/// request means the TLS layer accepted an unauthenticated peer, which
/// should never happen given the controller's `ClientCertVerifier`, but the
/// middleware exists so a misconfiguration fails closed rather than open.
async fn require_identity(Extension(peer): Extension<PeerIdentity>, mut req: Request<axum::body::Body>, next: Next) -> axum::response::Response {
	let (Some(identity), Some(fingerprint)) = (peer.identity, peer.fingerprint) else {
		audit::record(AuditEvent::UntrustedCertificate {
			peer_addr: "0.0.0.0:0".parse().expect("static addr"),
		});
		return StatusCode::UNAUTHORIZED.into_response();
	};
	req.extensions_mut().insert(identity);
	req.extensions_mut().insert(CertFingerprint(fingerprint));
	next.run(req).await
}

fn require_admin(identity: &Identity, path: &str) -> Result<(), ApiError> {
	if identity.is_admin() {
		Ok(())
	} else {
		audit::record(AuditEvent::InsufficientPrivilege {
			identity: &identity.to_string(),
			path,
		});
		Err(ApiError::InsufficientPrivilege)
	}
}

async fn register(
	State(state): State<Arc<AppState>>,
	Extension(identity): Extension<Identity>,
	Extension(CertFingerprint(fingerprint)): Extension<CertFingerprint>,
	Json(body): Json<RegisterRequest>,
) -> Result<Json<RegisterResponse>, ApiError> {
	if let Some(worker_id) = identity.worker_id() {
		if worker_id != body.worker_id {
			return Err(ApiError::InsufficientPrivilege);
		}
	}

	let mut violations = Vec::new();
	for cap in &body.capabilities {
		if let Err(errs) = capability::validate(cap) {
			violations.extend(errs.into_iter().map(|e| e.to_string()));
		}
	}
	if !violations.is_empty() {
		return Err(ApiError::SchemaViolation(violations.join("; ")));
	}

	let token = state.workers.register(&body.worker_id, &body.endpoint, body.capabilities.clone(), &fingerprint).map_err(|e| match e {
		RegistryError::FingerprintMismatch(_) => ApiError::FingerprintMismatch,
		RegistryError::DenyListed(_) => ApiError::DenyListed,
		RegistryError::Unknown(_) => unreachable!("register never returns Unknown"),
	})?;
	state.capabilities.insert_worker(&body.worker_id, &body.capabilities);

	let assigned_state = state.workers.get(&body.worker_id).map(|r| r.state).unwrap_or(fleet_proto::WorkerState::Registered);
	Ok(Json(RegisterResponse {
		registration_token: token,
		assigned_state,
	}))
}

async fn heartbeat(State(state): State<Arc<AppState>>, Extension(identity): Extension<Identity>, Path(id): Path<String>, Json(_body): Json<HeartbeatRequest>) -> Result<StatusCode, ApiError> {
	if identity.worker_id().is_some_and(|w| w != id) {
		return Err(ApiError::InsufficientPrivilege);
	}
	state.workers.heartbeat(&id).map_err(|_| ApiError::UnknownWorker(id))?;
	Ok(StatusCode::OK)
}

async fn deregister(State(state): State<Arc<AppState>>, Extension(identity): Extension<Identity>, Path(id): Path<String>) -> Result<StatusCode, ApiError> {
	if identity.worker_id().is_some_and(|w| w != id) {
		return Err(ApiError::InsufficientPrivilege);
	}
	state.workers.deregister(&id);
	state.capabilities.remove_worker(&id);
	Ok(StatusCode::NO_CONTENT)
}

#[derive(Serialize)]
struct WorkerSummary {
	worker_id: String,
	endpoint: String,
	state: fleet_proto::WorkerState,
	capability_ids: Vec<String>,
}

async fn list_workers(State(state): State<Arc<AppState>>, Extension(identity): Extension<Identity>) -> Result<Json<Vec<WorkerSummary>>, ApiError> {
	require_admin(&identity, "/v1/workers")?;
	let workers = state
		.workers
		.list()
		.into_iter()
		.map(|r| WorkerSummary {
			worker_id: r.worker_id,
			endpoint: r.endpoint,
			state: r.state,
			capability_ids: r.capabilities.into_iter().map(|c| c.id).collect(),
		})
		.collect();
	Ok(Json(workers))
}

async fn revoke(State(state): State<Arc<AppState>>, Extension(identity): Extension<Identity>, Path(id): Path<String>) -> Result<StatusCode, ApiError> {
	let path = format!("/v1/workers/{id}/revoke");
	require_admin(&identity, &path)?;
	state.capabilities.remove_worker(&id);
	state.workers.revoke(&id, state.revoke_deny_window);
	instruct_ca_revoke(&state, &id).await;
	Ok(StatusCode::ACCEPTED)
}

/// Tells the CA to revoke the worker's certificate by serial, so the
/// revocation shows up in `/v1/revocations` and the mTLS verifier starts
/// rejecting it on its next poll. Best-effort: the registry has already
/// removed the worker either way, and the CA's own revocation list is the
/// source of truth an operator can reconcile against if this call fails.
async fn instruct_ca_revoke(state: &AppState, worker_id: &str) {
	#[derive(serde::Serialize)]
	struct RevokeRequest<'a> {
		identity: &'a str,
	}
	let identity = format!("fleet://fleet.local/worker/{worker_id}");
	let url = format!("{}/v1/revoke", state.ca_service_url.trim_end_matches('/'));
	match state.http.post(&url).json(&RevokeRequest { identity: &identity }).send().await.and_then(|r| r.error_for_status()) {
		Ok(_) => tracing::debug!(worker_id, "requested certificate revocation from CA"),
		Err(err) => tracing::warn!(worker_id, %err, "failed to request certificate revocation from CA"),
	}
}

async fn dispatch(State(state): State<Arc<AppState>>, Extension(_identity): Extension<Identity>, Json(body): Json<DispatchRequest>) -> Result<Json<DispatchResult>, ApiError> {
	let decision = route(&state.capabilities, &state.workers, &body.capability_id, &body.required_version, &body.required_constraints, body.route_policy, None);
	match decision {
		RouteDecision::Dispatch { worker_id } => {
			state.workers.mark_dispatched(&worker_id);
			// Forwarding the payload to the worker's own HTTP surface is out
			// of scope for the controller's routing responsibility; callers
			// needing synchronous job results talk to the worker directly
			// once routed.
			Ok(Json(DispatchResult::Dispatched {
				worker_id,
				result: serde_json::json!({ "routed": true }),
			}))
		},
		RouteDecision::Unsatisfied { reason } => Ok(Json(DispatchResult::UnsatisfiedCapability {
			capability_id: body.capability_id,
			reason: reason.to_string(),
		})),
	}
}

#[cfg(test)]
mod tests {
	use fleet_proto::Version;

	use super::*;

	fn state() -> Arc<AppState> {
		Arc::new(AppState {
			workers: WorkerRegistry::new(),
			capabilities: CapabilityRegistry::new(),
			revoke_deny_window: Duration::from_secs(60),
			ca_service_url: "https://fleet-ca.invalid".to_string(),
			http: reqwest::Client::new(),
		})
	}

	#[tokio::test]
	async fn dispatch_reports_unsatisfied_when_no_candidate() {
		let st = state();
		let body = DispatchRequest {
			capability_id: "document.convert".to_string(),
			required_version: Version::new(1, 0, 0),
			required_constraints: Default::default(),
			route_policy: Default::default(),
			payload: serde_json::json!({}),
		};
		let identity = Identity::Admin { trust_domain: "fleet.local".to_string() };
		let result = dispatch(State(st), Extension(identity), Json(body)).await.unwrap();
		assert!(matches!(result.0, DispatchResult::UnsatisfiedCapability { .. }));
	}
}
