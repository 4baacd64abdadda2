use std::fmt;
use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::server::WebPkiClientVerifier;
use rustls::{DigitallySignedStruct, DistinguishedName, RootCertStore, SignatureScheme};
use rustls_pki_types::{CertificateDer, ServerName, UnixTime};
use x509_parser::extensions::GeneralName;
use x509_parser::prelude::{FromDer, X509Certificate};

use crate::identity::Identity;
use crate::revocation::RevocationList;

/// Extracts every `fleet://` SAN URI from a leaf certificate.
pub fn identities(cert: &X509Certificate) -> anyhow::Result<Vec<Identity>> {
	let mut out = Vec::new();
	for ext in cert.extensions() {
		if let x509_parser::extensions::ParsedExtension::SubjectAlternativeName(san) = ext.parsed_extension() {
			for name in &san.general_names {
				if let GeneralName::URI(uri) = name {
					if let Ok(id) = uri.parse::<Identity>() {
						out.push(id);
					}
				}
			}
		}
	}
	Ok(out)
}

fn leaf_identities(end_entity: &CertificateDer<'_>) -> Result<Vec<Identity>, rustls::Error> {
	let (_, cert) = X509Certificate::from_der(end_entity.as_ref())
		.map_err(|e| rustls::Error::General(format!("failed to parse leaf certificate: {e}")))?;
	identities(&cert).map_err(|e| rustls::Error::General(e.to_string()))
}

fn serial_hex(end_entity: &CertificateDer<'_>) -> Result<String, rustls::Error> {
	let (_, cert) = X509Certificate::from_der(end_entity.as_ref())
		.map_err(|e| rustls::Error::General(format!("failed to parse leaf certificate: {e}")))?;
	Ok(cert.raw_serial_as_string())
}

/// Client-cert verifier used by the controller and workers' inbound mTLS
/// listeners. Delegates chain validation to a standard webpki verifier, then
/// additionally rejects any certificate whose serial appears on the
/// revocation list.
pub struct RevocationAwareClientVerifier {
	inner: Arc<dyn ClientCertVerifier>,
	revoked: RevocationList,
}

impl RevocationAwareClientVerifier {
	pub fn new(inner: Arc<dyn ClientCertVerifier>, revoked: RevocationList) -> Self {
		Self { inner, revoked }
	}
}

impl fmt::Debug for RevocationAwareClientVerifier {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("RevocationAwareClientVerifier")
			.field("revoked_count", &self.revoked.len())
			.finish()
	}
}

impl ClientCertVerifier for RevocationAwareClientVerifier {
	fn offer_client_auth(&self) -> bool {
		true
	}

	fn client_auth_mandatory(&self) -> bool {
		true
	}

	fn root_hint_subjects(&self) -> &[DistinguishedName] {
		self.inner.root_hint_subjects()
	}

	fn verify_client_cert(
		&self,
		end_entity: &CertificateDer<'_>,
		intermediates: &[CertificateDer<'_>],
		now: UnixTime,
	) -> Result<ClientCertVerified, rustls::Error> {
		let verified = self.inner.verify_client_cert(end_entity, intermediates, now)?;
		let serial = serial_hex(end_entity)?;
		if self.revoked.is_revoked(&serial) {
			return Err(rustls::Error::General(format!("certificate {serial} is revoked")));
		}
		Ok(verified)
	}

	fn verify_tls12_signature(
		&self,
		message: &[u8],
		cert: &CertificateDer<'_>,
		dss: &DigitallySignedStruct,
	) -> Result<HandshakeSignatureValid, rustls::Error> {
		self.inner.verify_tls12_signature(message, cert, dss)
	}

	fn verify_tls13_signature(
		&self,
		message: &[u8],
		cert: &CertificateDer<'_>,
		dss: &DigitallySignedStruct,
	) -> Result<HandshakeSignatureValid, rustls::Error> {
		self.inner.verify_tls13_signature(message, cert, dss)
	}

	fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
		self.inner.supported_verify_schemes()
	}
}

/// Server-cert verifier used by outbound mTLS clients (workers dialing the
/// controller, the controller dialing a worker's push endpoint, if any).
/// Chain validation delegates to the standard webpki verifier, built fresh
/// for every call against `roots`; afterwards the peer's SAN identity must be
/// one of `expected`.
pub struct ServerIdentityVerifier {
	roots: Arc<RootCertStore>,
	expected: Vec<Identity>,
	inner: Arc<dyn ClientCertVerifier>,
}

impl ServerIdentityVerifier {
	pub fn new(roots: Arc<RootCertStore>, expected: Vec<Identity>) -> Result<Self, crate::error::Error> {
		// webpki's server-verification building block lives behind the
		// client-auth verifier API; we reuse it purely for chain validation
		// against `roots` and layer our own SAN check on top.
		let inner = WebPkiClientVerifier::builder_with_provider(roots.clone(), super::tls::provider())
			.allow_unauthenticated()
			.build()
			.map_err(crate::error::Error::Verifier)?;
		Ok(Self { roots, expected, inner })
	}
}

impl fmt::Debug for ServerIdentityVerifier {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("ServerIdentityVerifier")
			.field("expected", &self.expected.iter().map(Identity::to_string).collect::<Vec<_>>())
			.finish()
	}
}

impl ServerCertVerifier for ServerIdentityVerifier {
	fn verify_server_cert(
		&self,
		end_entity: &CertificateDer<'_>,
		intermediates: &[CertificateDer<'_>],
		_server_name: &ServerName<'_>,
		_ocsp_response: &[u8],
		now: UnixTime,
	) -> Result<ServerCertVerified, rustls::Error> {
		// SAN-URI identity stands in for DNS-name verification here; there is
		// no hostname check against `_server_name`.
		self.inner.verify_client_cert(end_entity, intermediates, now)?;

		let found = leaf_identities(end_entity)?;
		if !found.iter().any(|id| self.expected.contains(id)) {
			return Err(rustls::Error::General(format!(
				"peer identity {found:?} is not in the expected set {:?}",
				self.expected
			)));
		}
		let _ = &self.roots;
		Ok(ServerCertVerified::assertion())
	}

	fn verify_tls12_signature(
		&self,
		message: &[u8],
		cert: &CertificateDer<'_>,
		dss: &DigitallySignedStruct,
	) -> Result<HandshakeSignatureValid, rustls::Error> {
		self.inner.verify_tls12_signature(message, cert, dss)
	}

	fn verify_tls13_signature(
		&self,
		message: &[u8],
		cert: &CertificateDer<'_>,
		dss: &DigitallySignedStruct,
	) -> Result<HandshakeSignatureValid, rustls::Error> {
		self.inner.verify_tls13_signature(message, cert, dss)
	}

	fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
		self.inner.supported_verify_schemes()
	}
}

/// Extracts the identity a peer presented on an already-completed handshake,
/// from the connection's verified peer certificate chain.
pub fn identity_from_peer_certs(chain: &[CertificateDer<'static>]) -> Option<Identity> {
	let end_entity = chain.first()?;
	leaf_identities(end_entity).ok()?.into_iter().next()
}
