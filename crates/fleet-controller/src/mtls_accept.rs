use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use axum_server::accept::Accept;
use axum_server::tls_rustls::RustlsAcceptor;
use fleet_ca::Identity;
use sha2::Digest;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::server::TlsStream;

/// The identity and certificate fingerprint extracted from a peer's verified
/// client certificate, injected into request extensions for every connection
/// accepted on the mTLS control-plane listener. Both fields are `None` only
/// for connections that shouldn't exist (the `ClientCertVerifier` rejects
/// anonymous peers before the handshake completes) — handlers should still
/// treat a missing identity as unauthenticated rather than panicking.
#[derive(Clone, Debug)]
pub struct PeerIdentity {
	pub identity: Option<Identity>,
	pub fingerprint: Option<String>,
}

/// SHA-256 fingerprint of a peer's leaf certificate, once authenticated and
/// threaded past `require_identity` into handler extensions.
#[derive(Clone, Debug)]
pub struct CertFingerprint(pub String);

/// SHA-256 of the peer's leaf certificate, hex-encoded — the binding key
/// `WorkerRegistry` checks a re-registration against.
fn fingerprint_of_leaf(leaf_der: &[u8]) -> String {
	hex::encode(sha2::Sha256::digest(leaf_der))
}

/// Wraps axum-server's Rustls acceptor, extracting the verified peer
/// identity from the completed handshake and threading it into the inner
/// service via request extensions, the way axum's own mTLS examples do.
#[derive(Clone)]
pub struct MtlsAcceptor {
	inner: RustlsAcceptor,
}

impl MtlsAcceptor {
	pub fn new(inner: RustlsAcceptor) -> Self {
		Self { inner }
	}
}

#[derive(Clone)]
struct WithIdentity<S> {
	inner: S,
	identity: PeerIdentity,
}

impl<S, Req> tower::Service<Req> for WithIdentity<S>
where
	S: tower::Service<Req>,
	Req: Extend1<PeerIdentity>,
{
	type Response = S::Response;
	type Error = S::Error;
	type Future = S::Future;

	fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
		self.inner.poll_ready(cx)
	}

	fn call(&mut self, mut req: Req) -> Self::Future {
		req.insert(self.identity.clone());
		self.inner.call(req)
	}
}

/// A tiny seam so `WithIdentity` can work for any axum request type without
/// depending on axum's concrete `http::Request<B>` here.
pub trait Extend1<T> {
	fn insert(&mut self, value: T);
}

impl<B> Extend1<PeerIdentity> for http::Request<B> {
	fn insert(&mut self, value: PeerIdentity) {
		self.extensions_mut().insert(value);
	}
}

impl<I, S> Accept<I, S> for MtlsAcceptor
where
	I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
	S: Send + 'static,
{
	type Stream = TlsStream<I>;
	type Service = WithIdentity<S>;
	type Future = Pin<Box<dyn Future<Output = std::io::Result<(Self::Stream, Self::Service)>> + Send>>;

	fn accept(&self, stream: I, service: S) -> Self::Future {
		let inner = self.inner.clone();
		Box::pin(async move {
			let (stream, service) = inner.accept(stream, service).await?;
			let (_, conn) = stream.get_ref();
			let certs = conn.peer_certificates();
			let identity = certs.and_then(|certs| fleet_ca::verifier::identity_from_peer_certs(certs));
			let fingerprint = certs.and_then(|certs| certs.first()).map(|leaf| fingerprint_of_leaf(leaf.as_ref()));
			Ok((stream, WithIdentity { inner: service, identity: PeerIdentity { identity, fingerprint } }))
		})
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn fingerprint_is_stable_for_identical_der() {
		let der = b"not a real certificate, just some bytes";
		assert_eq!(fingerprint_of_leaf(der), fingerprint_of_leaf(der));
	}

	#[test]
	fn fingerprint_differs_for_different_der() {
		let a = fingerprint_of_leaf(b"leaf one");
		let b = fingerprint_of_leaf(b"leaf two");
		assert_ne!(a, b);
	}

	#[test]
	fn fingerprint_is_hex_encoded_sha256() {
		let digest = fingerprint_of_leaf(b"leaf");
		assert_eq!(digest.len(), 64);
		assert!(digest.chars().all(|c| c.is_ascii_hexdigit()));
	}
}
