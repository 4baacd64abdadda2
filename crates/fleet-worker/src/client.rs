use std::sync::{Arc, Mutex};

use fleet_ca::{CaClient, CertificateState, Identity, WorkloadCertificate};

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
	#[error("certificate not yet available")]
	NotReady,
	#[error("{0}")]
	Ca(#[from] fleet_ca::Error),
	#[error("{0}")]
	Http(#[from] reqwest::Error),
}

struct Cached {
	cert: Arc<WorkloadCertificate>,
	client: reqwest::Client,
}

/// Lazily builds and rebuilds an mTLS `reqwest::Client` from the worker's
/// current certificate. Connection pooling is reused across calls as long as
/// the certificate hasn't rotated; a rotation swaps the pool rather than
/// mutating it in place, so in-flight requests on the old pool complete
/// uninterrupted.
pub struct MtlsClientFactory {
	ca_client: Arc<CaClient>,
	controller_identity: Identity,
	cached: Mutex<Option<Cached>>,
}

impl MtlsClientFactory {
	pub fn new(ca_client: Arc<CaClient>, controller_identity: Identity) -> Self {
		Self {
			ca_client,
			controller_identity,
			cached: Mutex::new(None),
		}
	}

	/// Returns a client presenting the worker's current mTLS identity,
	/// rebuilding the pool only if the certificate rotated since the last
	/// call.
	pub fn client(&self) -> Result<reqwest::Client, ClientError> {
		let CertificateState::Available(cert) = self.ca_client.current() else {
			return Err(ClientError::NotReady);
		};

		let mut guard = self.cached.lock().expect("mtls client cache lock poisoned");
		if let Some(existing) = guard.as_ref() {
			if Arc::ptr_eq(&existing.cert, &cert) {
				return Ok(existing.client.clone());
			}
		}

		let client = self.build(&cert)?;
		*guard = Some(Cached { cert, client: client.clone() });
		Ok(client)
	}

	fn build(&self, cert: &Arc<WorkloadCertificate>) -> Result<reqwest::Client, ClientError> {
		let mut roots = rustls::RootCertStore::empty();
		let certs = rustls_pemfile::certs(&mut cert.bundle.ca_pem.as_bytes()).collect::<Result<Vec<_>, _>>().map_err(|e| fleet_ca::Error::CertificatesInvalid(e.to_string()))?;
		for c in certs {
			roots.add(c).map_err(|e| fleet_ca::Error::CertificatesInvalid(e.to_string()))?;
		}

		let tls_config = fleet_ca::tls::client_config(vec![cert.leaf_der()?], cert.key_der()?, Arc::new(roots), vec![self.controller_identity.clone()])?;

		Ok(reqwest::Client::builder().use_preconfigured_tls(tls_config).build()?)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn not_ready_error_has_a_stable_message() {
		assert_eq!(ClientError::NotReady.to_string(), "certificate not yet available");
	}
}
