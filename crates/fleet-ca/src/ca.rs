use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use rcgen::{
	CertificateParams, CertificateSigningRequestParams, DnType, Issuer, KeyPair, KeyUsagePurpose, SanType,
	PKCS_ECDSA_P256_SHA256,
};
use time::{Duration, OffsetDateTime};
use tracing::{debug, info};

use crate::error::Error;
use crate::identity::Identity;

fn der_to_pem(label: &str, der: &[u8]) -> String {
	use base64::Engine;
	let encoded = base64::engine::general_purpose::STANDARD.encode(der);
	let mut out = format!("-----BEGIN {label}-----\n");
	for chunk in encoded.as_bytes().chunks(64) {
		out.push_str(std::str::from_utf8(chunk).expect("base64 output is ascii"));
		out.push('\n');
	}
	out.push_str(&format!("-----END {label}-----\n"));
	out
}

/// Default leaf certificate lifetime: 24 hours. Workers and admin clients are
/// expected to rotate well before this, via `fleet-ca`'s refresh-at-25%-
/// remaining policy.
pub const DEFAULT_LEAF_TTL: Duration = Duration::hours(24);
/// Upper bound a CSR's requested validity may not exceed.
pub const MAX_LEAF_TTL: Duration = Duration::days(7);

/// A freshly signed leaf certificate and the validity window the CA decided
/// on, independent of whatever the CSR itself requested.
pub struct IssuedCertificate {
	pub leaf_pem: String,
	pub leaf_der: Vec<u8>,
	pub not_before: OffsetDateTime,
	pub not_after: OffsetDateTime,
}

/// Issues and tracks revocation for leaf certificates under a single
/// self-signed root. The root never leaves the controller process; only
/// signed leaves and the root's public certificate cross the wire.
pub struct CertificateAuthority {
	root_cert_der: Vec<u8>,
	root_cert_pem: String,
	root_key: KeyPair,
	trust_domain: String,
	revoked: HashSet<String>,
	/// Latest serial issued per identity, so a revoke-by-identity request
	/// (the only shape the controller has a reason to make) can be turned
	/// into the serial-keyed revocation the mTLS verifier checks.
	issued: HashMap<String, String>,
}

impl CertificateAuthority {
	/// Generates a fresh self-signed root, valid for ten years.
	pub fn new(trust_domain: impl Into<String>) -> Result<Self, Error> {
		let trust_domain = trust_domain.into();
		info!(%trust_domain, "generating new root certificate authority");

		let key_pair = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256).map_err(|e| Error::Csr(Arc::new(e.into())))?;
		let mut params = CertificateParams::new(Vec::new()).map_err(|e| Error::Csr(Arc::new(e.into())))?;
		params.distinguished_name.push(DnType::CommonName, format!("fleet-ca.{trust_domain}"));
		params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
		params.key_usages = vec![
			KeyUsagePurpose::KeyCertSign,
			KeyUsagePurpose::CrlSign,
			KeyUsagePurpose::DigitalSignature,
		];
		let now = OffsetDateTime::now_utc();
		params.not_before = now - Duration::hours(1);
		params.not_after = now + Duration::days(3650);

		let cert = params.self_signed(&key_pair).map_err(|e| Error::Csr(Arc::new(e.into())))?;

		Ok(Self {
			root_cert_der: cert.der().to_vec(),
			root_cert_pem: cert.pem(),
			root_key: key_pair,
			trust_domain,
			revoked: HashSet::new(),
			issued: HashMap::new(),
		})
	}

	/// Restores a CA from a previously generated root cert/key pair (loaded
	/// from `CERT_DIR` on controller restart).
	pub fn from_existing(trust_domain: impl Into<String>, cert_der: Vec<u8>, key_der: Vec<u8>) -> Result<Self, Error> {
		let key_pair = KeyPair::try_from(key_der.as_slice()).map_err(|e| Error::InvalidRootCert(e.to_string()))?;
		let (_, parsed) = x509_parser::prelude::X509Certificate::from_der(&cert_der)
			.map_err(|e| Error::InvalidRootCert(e.to_string()))?;
		let root_cert_pem = der_to_pem("CERTIFICATE", &cert_der);
		let _ = parsed;
		Ok(Self {
			root_cert_der: cert_der,
			root_cert_pem,
			root_key: key_pair,
			trust_domain: trust_domain.into(),
			revoked: HashSet::new(),
			issued: HashMap::new(),
		})
	}

	pub fn root_cert_pem(&self) -> &str {
		&self.root_cert_pem
	}

	pub fn root_cert_der(&self) -> &[u8] {
		&self.root_cert_der
	}

	/// PEM-encoded root private key, for persisting the CA's root across
	/// process restarts. Never sent over the wire.
	pub fn root_key_pem(&self) -> String {
		self.root_key.serialize_pem()
	}

	pub fn trust_domain(&self) -> &str {
		&self.trust_domain
	}

	/// Signs a PEM-encoded CSR, embedding `identity` as the single SAN URI
	/// regardless of whatever SANs the CSR itself requested — the CA decides
	/// identity, the requester only proves possession of the key.
	pub fn issue(&mut self, csr_pem: &str, identity: &Identity, requested_ttl: Option<Duration>) -> Result<IssuedCertificate, Error> {
		if identity.trust_domain() != self.trust_domain {
			return Err(Error::CsrRejected(format!(
				"identity trust domain {:?} does not match CA trust domain {:?}",
				identity.trust_domain(),
				self.trust_domain
			)));
		}

		let mut params =
			CertificateSigningRequestParams::from_pem(csr_pem).map_err(|e| Error::Csr(Arc::new(e.into())))?;
		params.params.distinguished_name = rcgen::DistinguishedName::new();
		params.params.distinguished_name.push(DnType::CommonName, identity.to_string());
		params.params.subject_alt_names = vec![SanType::URI(
			identity
				.to_string()
				.try_into()
				.map_err(|e: rcgen::Error| Error::Csr(Arc::new(e.into())))?,
		)];
		params.params.is_ca = rcgen::IsCa::NoCa;
		params.params.key_usages = vec![KeyUsagePurpose::DigitalSignature, KeyUsagePurpose::KeyEncipherment];
		params.params.extended_key_usages = vec![
			rcgen::ExtendedKeyUsagePurpose::ServerAuth,
			rcgen::ExtendedKeyUsagePurpose::ClientAuth,
		];

		let ttl = requested_ttl.unwrap_or(DEFAULT_LEAF_TTL).min(MAX_LEAF_TTL);
		let now = OffsetDateTime::now_utc();
		let not_before = now - Duration::hours(1);
		let not_after = now + ttl;
		params.params.not_before = not_before;
		params.params.not_after = not_after;

		let issuer = Issuer::from_ca_cert_der(&self.root_cert_der, self.root_key.clone())
			.map_err(|e| Error::Csr(Arc::new(e.into())))?;
		let cert = params.signed_by(&issuer).map_err(|e| Error::Csr(Arc::new(e.into())))?;
		let der = cert.der().to_vec();

		let (_, parsed) = x509_parser::prelude::X509Certificate::from_der(&der).map_err(|e| Error::Csr(Arc::new(e.into())))?;
		self.issued.insert(identity.to_string(), parsed.raw_serial_as_string());

		debug!(%identity, "issued leaf certificate");
		Ok(IssuedCertificate {
			leaf_pem: cert.pem(),
			leaf_der: der,
			not_before,
			not_after,
		})
	}

	pub fn revoke(&mut self, serial_hex: impl Into<String>) {
		self.revoked.insert(serial_hex.into());
	}

	/// Revokes the most recently issued certificate for `identity`, the only
	/// shape a caller outside the CA has a reason to request. Returns the
	/// serial that was revoked, or `None` if nothing has ever been issued to
	/// that identity.
	pub fn revoke_identity(&mut self, identity: &str) -> Option<String> {
		let serial = self.issued.get(identity)?.clone();
		self.revoked.insert(serial.clone());
		Some(serial)
	}

	pub fn is_revoked(&self, serial_hex: &str) -> bool {
		self.revoked.contains(serial_hex)
	}

	pub fn revoked_serials(&self) -> impl Iterator<Item = &String> {
		self.revoked.iter()
	}
}

impl std::fmt::Debug for CertificateAuthority {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("CertificateAuthority")
			.field("trust_domain", &self.trust_domain)
			.field("root_key", &"[REDACTED]")
			.field("revoked_count", &self.revoked.len())
			.finish_non_exhaustive()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::csr::CsrOptions;

	#[test]
	fn root_is_self_signed_and_valid() {
		let ca = CertificateAuthority::new("cluster.local").unwrap();
		assert!(ca.root_cert_pem().contains("CERTIFICATE"));
	}

	#[test]
	fn issues_leaf_for_worker_csr() {
		let mut ca = CertificateAuthority::new("cluster.local").unwrap();
		let identity = Identity::Worker {
			trust_domain: "cluster.local".to_string(),
			worker_id: "w-1".to_string(),
		};
		let signed = CsrOptions { san: identity.clone() }.generate().unwrap();
		let issued = ca.issue(&signed.csr_pem, &identity, None).unwrap();
		assert!(issued.leaf_pem.contains("CERTIFICATE"));
	}

	#[test]
	fn rejects_identity_outside_trust_domain() {
		let mut ca = CertificateAuthority::new("cluster.local").unwrap();
		let identity = Identity::Worker {
			trust_domain: "other.local".to_string(),
			worker_id: "w-1".to_string(),
		};
		let signed = CsrOptions { san: identity.clone() }.generate().unwrap();
		assert!(ca.issue(&signed.csr_pem, &identity, None).is_err());
	}

	#[test]
	fn revoke_identity_revokes_latest_issued_serial() {
		let mut ca = CertificateAuthority::new("cluster.local").unwrap();
		let identity = Identity::Worker {
			trust_domain: "cluster.local".to_string(),
			worker_id: "w-1".to_string(),
		};
		let signed = CsrOptions { san: identity.clone() }.generate().unwrap();
		ca.issue(&signed.csr_pem, &identity, None).unwrap();
		let serial = ca.revoke_identity(&identity.to_string()).unwrap();
		assert!(ca.is_revoked(&serial));
	}

	#[test]
	fn revoke_identity_unknown_returns_none() {
		let mut ca = CertificateAuthority::new("cluster.local").unwrap();
		assert!(ca.revoke_identity("fleet://cluster.local/worker/nobody").is_none());
	}

	#[test]
	fn debug_redacts_key() {
		let ca = CertificateAuthority::new("cluster.local").unwrap();
		let debug = format!("{ca:?}");
		assert!(debug.contains("REDACTED"));
	}

	#[test]
	fn revocation_round_trips() {
		let mut ca = CertificateAuthority::new("cluster.local").unwrap();
		assert!(!ca.is_revoked("abc"));
		ca.revoke("abc");
		assert!(ca.is_revoked("abc"));
	}
}
