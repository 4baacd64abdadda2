use std::sync::Arc;

use rustls::crypto::CryptoProvider;
use rustls::server::{ClientCertVerifier, WebPkiClientVerifier};
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;

use crate::identity::Identity;
use crate::revocation::RevocationList;
use crate::verifier::{RevocationAwareClientVerifier, ServerIdentityVerifier};

pub const ALL_TLS_VERSIONS: &[&rustls::SupportedProtocolVersion] = &[&rustls::version::TLS13];

/// The process-wide crypto provider. We restrict to ring's default cipher
/// suite list rather than accepting whatever the platform default install
/// exposes, so a dependency upgrade can't silently widen what this binary
/// will negotiate.
pub fn provider() -> Arc<CryptoProvider> {
	Arc::new(rustls::crypto::ring::default_provider())
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
	#[error("tls handshake failed: {0}")]
	Handshake(#[from] std::io::Error),
	#[error("{0}")]
	Anyhow(#[from] anyhow::Error),
}

/// Accepts a single mTLS connection on an already-established byte stream.
/// There is no plaintext fallback path: a peer that does not present a valid
/// client certificate never reaches the application.
pub async fn accept<IO>(io: IO, cfg: Arc<ServerConfig>) -> Result<TlsStream<IO>, Error>
where
	IO: AsyncRead + AsyncWrite + Unpin,
{
	let acceptor = TlsAcceptor::from(cfg);
	Ok(acceptor.accept(io).await?)
}

/// Builds the server-side TLS config: requires and verifies a client
/// certificate signed by `roots`, consulting `revoked` on every handshake.
pub fn server_config(
	cert_chain: Vec<rustls_pki_types::CertificateDer<'static>>,
	private_key: rustls_pki_types::PrivateKeyDer<'static>,
	roots: Arc<RootCertStore>,
	revoked: RevocationList,
) -> Result<ServerConfig, crate::error::Error> {
	let base: Arc<dyn ClientCertVerifier> = WebPkiClientVerifier::builder_with_provider(roots, provider())
		.build()
		.map_err(crate::error::Error::Verifier)?;
	let verifier = Arc::new(RevocationAwareClientVerifier::new(base, revoked));
	let mut cfg = ServerConfig::builder_with_provider(provider())
		.with_protocol_versions(ALL_TLS_VERSIONS)?
		.with_client_cert_verifier(verifier)
		.with_single_cert(cert_chain, private_key)
		.map_err(crate::error::Error::Rustls)?;
	cfg.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
	Ok(cfg)
}

/// Builds a server-auth-only TLS config: no client certificate is requested
/// or verified. Used solely by the CA's own listener, which by definition
/// serves callers that do not yet hold a certificate.
pub fn server_config_no_client_auth(
	cert_chain: Vec<rustls_pki_types::CertificateDer<'static>>,
	private_key: rustls_pki_types::PrivateKeyDer<'static>,
) -> Result<ServerConfig, crate::error::Error> {
	let mut cfg = ServerConfig::builder_with_provider(provider())
		.with_protocol_versions(ALL_TLS_VERSIONS)?
		.with_no_client_auth()
		.with_single_cert(cert_chain, private_key)
		.map_err(crate::error::Error::Rustls)?;
	cfg.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
	Ok(cfg)
}

/// Builds the client-side TLS config used by workers and admin clients to
/// dial the controller: presents `cert_chain`/`private_key` and verifies the
/// peer is one of `expected` under `roots`.
pub fn client_config(
	cert_chain: Vec<rustls_pki_types::CertificateDer<'static>>,
	private_key: rustls_pki_types::PrivateKeyDer<'static>,
	roots: Arc<RootCertStore>,
	expected: Vec<Identity>,
) -> Result<ClientConfig, crate::error::Error> {
	let verifier = Arc::new(ServerIdentityVerifier::new(roots, expected)?);
	let cfg = ClientConfig::builder_with_provider(provider())
		.with_protocol_versions(ALL_TLS_VERSIONS)?
		.dangerous()
		.with_custom_certificate_verifier(verifier)
		.with_client_auth_cert(cert_chain, private_key)
		.map_err(crate::error::Error::Rustls)?;
	Ok(cfg)
}
