use axum::Json;
use axum::response::{IntoResponse, Response};
use http::StatusCode;
use serde::Serialize;
use uuid::Uuid;

/// The shape every HTTP-surfaced error takes, regardless of its internal
/// cause. Internal errors (CA I/O, cert bundle loading) propagate as
/// `anyhow::Error` up to the handler boundary and are only converted to this
/// shape there — never earlier.
#[derive(Debug, Clone, Serialize)]
pub struct ApiErrorBody {
	pub reason_code: &'static str,
	pub message: String,
	pub correlation_id: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
	#[error("malformed request: {0}")]
	Malformed(String),
	#[error("capability manifest invalid: {0}")]
	SchemaViolation(String),
	#[error("worker {0:?} not found")]
	UnknownWorker(String),
	#[error("certificate fingerprint does not match existing registration")]
	FingerprintMismatch,
	#[error("worker is temporarily barred from re-registration")]
	DenyListed,
	#[error("caller's certificate does not grant admin privileges")]
	InsufficientPrivilege,
	#[error("no worker satisfies capability {capability_id:?}: {reason}")]
	UnsatisfiedCapability { capability_id: String, reason: String },
	#[error("controller is overloaded, retry later")]
	Overloaded,
	#[error("internal error: {0}")]
	Internal(#[from] anyhow::Error),
}

impl ApiError {
	fn reason_code(&self) -> &'static str {
		match self {
			ApiError::Malformed(_) => "malformed-request",
			ApiError::SchemaViolation(_) => "schema-violation",
			ApiError::UnknownWorker(_) => "unknown-worker",
			ApiError::FingerprintMismatch => "fingerprint-mismatch",
			ApiError::DenyListed => "deny-listed",
			ApiError::InsufficientPrivilege => "insufficient-privilege",
			ApiError::UnsatisfiedCapability { .. } => "unsatisfied-capability",
			ApiError::Overloaded => "overloaded",
			ApiError::Internal(_) => "internal-error",
		}
	}

	fn status(&self) -> StatusCode {
		match self {
			ApiError::Malformed(_) | ApiError::SchemaViolation(_) => StatusCode::BAD_REQUEST,
			ApiError::UnknownWorker(_) => StatusCode::NOT_FOUND,
			ApiError::FingerprintMismatch | ApiError::DenyListed => StatusCode::CONFLICT,
			ApiError::InsufficientPrivilege => StatusCode::FORBIDDEN,
			ApiError::UnsatisfiedCapability { .. } => StatusCode::UNPROCESSABLE_ENTITY,
			ApiError::Overloaded => StatusCode::TOO_MANY_REQUESTS,
			ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
		}
	}
}

impl IntoResponse for ApiError {
	fn into_response(self) -> Response {
		let correlation_id = Uuid::new_v4().to_string();
		let status = self.status();
		if status == StatusCode::INTERNAL_SERVER_ERROR {
			tracing::error!(correlation_id, error = %self, "internal error handling request");
		}
		let body = ApiErrorBody {
			reason_code: self.reason_code(),
			message: self.to_string(),
			correlation_id,
		};
		(status, Json(body)).into_response()
	}
}
