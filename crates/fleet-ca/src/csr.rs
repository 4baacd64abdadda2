use rcgen::{CertificateParams, KeyPair, SanType, PKCS_ECDSA_P256_SHA256};

use crate::identity::Identity;

/// A freshly generated keypair and the PEM-encoded CSR derived from it, ready
/// to submit to the CA. The private key never leaves the process that
/// generated it; only the CSR crosses the wire.
pub struct CertSign {
	pub csr_pem: String,
	pub private_key_pem: String,
}

pub struct CsrOptions {
	pub san: Identity,
}

impl CsrOptions {
	pub fn generate(self) -> Result<CertSign, crate::error::Error> {
		let key_pair =
			KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256).map_err(|e| crate::error::Error::Csr(std::sync::Arc::new(e.into())))?;
		let mut params = CertificateParams::new(Vec::new()).map_err(|e| crate::error::Error::Csr(std::sync::Arc::new(e.into())))?;
		params.subject_alt_names = vec![SanType::URI(
			self.san
				.to_string()
				.try_into()
				.map_err(|e: rcgen::Error| crate::error::Error::Csr(std::sync::Arc::new(e.into())))?,
		)];
		let csr = params
			.serialize_request(&key_pair)
			.map_err(|e| crate::error::Error::Csr(std::sync::Arc::new(e.into())))?;
		Ok(CertSign {
			csr_pem: csr.pem().map_err(|e| crate::error::Error::Csr(std::sync::Arc::new(e.into())))?,
			private_key_pem: key_pair.serialize_pem(),
		})
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn generates_csr_for_worker_identity() {
		let opts = CsrOptions {
			san: Identity::Worker {
				trust_domain: "cluster.local".to_string(),
				worker_id: "w-1".to_string(),
			},
		};
		let signed = opts.generate().unwrap();
		assert!(signed.csr_pem.contains("CERTIFICATE REQUEST"));
		assert!(signed.private_key_pem.contains("PRIVATE KEY"));
	}
}
