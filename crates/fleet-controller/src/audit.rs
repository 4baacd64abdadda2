use tracing::warn;

/// Security-relevant events the controller must surface in structured logs,
/// per the error-handling design's authentication/authorization taxonomy.
/// These are logged at `warn` even on the happy path of a rejection, since
/// every occurrence is worth an operator's attention.
#[derive(Debug, Clone)]
pub enum AuditEvent<'a> {
	/// A peer presented a certificate that failed chain or revocation
	/// validation at the TLS layer.
	UntrustedCertificate { peer_addr: std::net::SocketAddr },
	/// A peer's certificate serial is on the revocation list.
	Revoked { worker_id: &'a str, serial: &'a str },
	/// A worker-identity certificate was used to call an admin-only endpoint.
	InsufficientPrivilege { identity: &'a str, path: &'a str },
}

pub fn record(event: AuditEvent<'_>) {
	match event {
		AuditEvent::UntrustedCertificate { peer_addr } => {
			warn!(event = "untrusted-certificate", %peer_addr, "rejected connection with untrusted certificate");
		},
		AuditEvent::Revoked { worker_id, serial } => {
			warn!(event = "revoked", worker_id, serial, "rejected connection with revoked certificate");
		},
		AuditEvent::InsufficientPrivilege { identity, path } => {
			warn!(event = "insufficient-privilege", identity, path, "denied admin endpoint to non-admin identity");
		},
	}
}
