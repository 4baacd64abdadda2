use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;

use crate::heartbeat::ConnectionState;

#[derive(Clone)]
struct HealthState {
	connection: ConnectionState,
}

/// `GET /health/live` always succeeds once the process is serving requests.
/// `GET /health/ready` succeeds only while registration is held.
pub fn routes(connection: ConnectionState) -> Router {
	Router::new()
		.route("/health/live", get(live))
		.route("/health/ready", get(ready))
		.with_state(HealthState { connection })
}

async fn live() -> StatusCode {
	StatusCode::OK
}

async fn ready(State(state): State<HealthState>) -> StatusCode {
	if state.connection.is_connected() {
		StatusCode::OK
	} else {
		StatusCode::SERVICE_UNAVAILABLE
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn live_always_reports_ok() {
		assert_eq!(live().await, StatusCode::OK);
	}

	#[tokio::test]
	async fn ready_reports_ok_once_connected() {
		let connection = ConnectionState::default();
		connection.set(true);
		let state = HealthState { connection };
		assert_eq!(ready(State(state)).await, StatusCode::OK);
	}

	#[tokio::test]
	async fn ready_reports_unavailable_before_connected() {
		let state = HealthState { connection: ConnectionState::default() };
		assert_eq!(ready(State(state)).await, StatusCode::SERVICE_UNAVAILABLE);
	}
}
