use std::sync::Arc;

use rustls::server::VerifierBuilderError;

#[derive(Clone, Debug, thiserror::Error)]
pub enum Error {
	#[error("CA unreachable: {0}")]
	CaUnavailable(Arc<anyhow::Error>),
	#[error("csr rejected: {0}")]
	CsrRejected(String),
	#[error("empty certificate response from CA")]
	EmptyResponse,
	#[error("invalid csr: {0}")]
	Csr(Arc<anyhow::Error>),
	#[error("invalid root certificate: {0}")]
	InvalidRootCert(String),
	#[error("certificate invalid: {0}")]
	CertificatesInvalid(String),
	#[error("rustls: {0}")]
	Rustls(#[from] rustls::Error),
	#[error("rustls verifier: {0}")]
	Verifier(#[from] VerifierBuilderError),
	#[error("certificate expired")]
	Expired,
	#[error("certificate not ready")]
	NotReady,
	#[error("io: {0}")]
	Io(Arc<std::io::Error>),
}

impl From<std::io::Error> for Error {
	fn from(value: std::io::Error) -> Self {
		Error::Io(Arc::new(value))
	}
}
