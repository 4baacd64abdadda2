use std::path::{Path, PathBuf};

use rustls_pki_types::{CertificateDer, PrivateKeyDer};
use time::OffsetDateTime;
use tracing::info;

use crate::error::Error;

/// The three PEM files that make up a workload's on-disk identity: its leaf
/// certificate, its private key, and the CA root it should trust.
pub struct CertificateBundle {
	pub leaf_pem: String,
	pub key_pem: String,
	pub ca_pem: String,
	pub not_after: OffsetDateTime,
}

impl CertificateBundle {
	pub fn parse_leaf_der(&self) -> Result<CertificateDer<'static>, Error> {
		let mut cursor = self.leaf_pem.as_bytes();
		let cert = rustls_pemfile::certs(&mut cursor)
			.next()
			.ok_or_else(|| Error::CertificatesInvalid("no certificate in leaf PEM".to_string()))?
			.map_err(|e| Error::CertificatesInvalid(e.to_string()))?;
		Ok(cert)
	}

	pub fn parse_key_der(&self) -> Result<PrivateKeyDer<'static>, Error> {
		let mut cursor = self.key_pem.as_bytes();
		rustls_pemfile::private_key(&mut cursor)
			.map_err(|e| Error::CertificatesInvalid(e.to_string()))?
			.ok_or_else(|| Error::CertificatesInvalid("no private key in key PEM".to_string()))
	}

	pub fn is_expired(&self, now: OffsetDateTime) -> bool {
		now >= self.not_after
	}

	/// Whether this bundle should be proactively rotated: the remaining
	/// validity window has fallen below 25% of the time since `not_before`.
	pub fn needs_refresh(&self, not_before: OffsetDateTime, now: OffsetDateTime) -> bool {
		let total = self.not_after - not_before;
		if total.is_negative() || total.is_zero() {
			return true;
		}
		let remaining = self.not_after - now;
		remaining.as_seconds_f64() <= total.as_seconds_f64() * 0.25
	}

	/// Atomically persists the bundle to `dir` as `client.crt`, `client.key`,
	/// and `ca.crt`: each file is written to a sibling temp path, fsynced, then
	/// renamed into place, so a reader never observes a half-written file.
	pub async fn write_to(&self, dir: &Path) -> Result<(), Error> {
		fs_err::tokio::create_dir_all(dir).await?;
		write_atomic(dir, "client.crt", self.leaf_pem.as_bytes(), None).await?;
		write_atomic(dir, "client.key", self.key_pem.as_bytes(), Some(0o600)).await?;
		write_atomic(dir, "ca.crt", self.ca_pem.as_bytes(), None).await?;
		info!(dir = %dir.display(), "wrote certificate bundle");
		Ok(())
	}

	pub async fn load_from(dir: &Path, not_after: OffsetDateTime) -> Result<Self, Error> {
		let leaf_pem = fs_err::tokio::read_to_string(dir.join("client.crt")).await?;
		let key_pem = fs_err::tokio::read_to_string(dir.join("client.key")).await?;
		let ca_pem = fs_err::tokio::read_to_string(dir.join("ca.crt")).await?;
		Ok(Self {
			leaf_pem,
			key_pem,
			ca_pem,
			not_after,
		})
	}

	/// Validates a bundle loaded from disk before it is trusted: the leaf must
	/// not be expired, must be signed by the accompanying CA root, and its
	/// public key must match the accompanying private key. A caller that finds
	/// no usable bundle (missing files or a failed validation) should fall
	/// back to bootstrapping a fresh certificate from the CA.
	pub fn validate(&self, now: OffsetDateTime) -> Result<(), Error> {
		if self.is_expired(now) {
			return Err(Error::Expired);
		}

		let leaf_der = self.parse_leaf_der()?;
		let (_, leaf) = x509_parser::prelude::X509Certificate::from_der(leaf_der.as_ref())
			.map_err(|e| Error::CertificatesInvalid(format!("leaf certificate does not parse: {e}")))?;

		let mut ca_cursor = self.ca_pem.as_bytes();
		let ca_der = rustls_pemfile::certs(&mut ca_cursor)
			.next()
			.ok_or_else(|| Error::CertificatesInvalid("no certificate in CA PEM".to_string()))?
			.map_err(|e| Error::CertificatesInvalid(e.to_string()))?;
		let (_, ca_cert) = x509_parser::prelude::X509Certificate::from_der(ca_der.as_ref())
			.map_err(|e| Error::CertificatesInvalid(format!("CA certificate does not parse: {e}")))?;

		leaf.verify_signature(Some(ca_cert.public_key()))
			.map_err(|e| Error::CertificatesInvalid(format!("leaf is not signed by the accompanying CA root: {e}")))?;

		let key_der = self.parse_key_der()?;
		let rng = ring::rand::SystemRandom::new();
		let key_pair = ring::signature::EcdsaKeyPair::from_pkcs8(&ring::signature::ECDSA_P256_SHA256_ASN1_SIGNING, key_der.secret_der(), &rng)
			.map_err(|_| Error::CertificatesInvalid("private key does not parse as a PKCS8 EC key".to_string()))?;
		if key_pair.public_key().as_ref() != leaf.public_key().subject_public_key.data.as_ref() {
			return Err(Error::CertificatesInvalid("private key does not match the leaf certificate's public key".to_string()));
		}

		Ok(())
	}
}

async fn write_atomic(dir: &Path, name: &str, contents: &[u8], #[cfg_attr(not(unix), allow(unused_variables))] mode: Option<u32>) -> Result<(), Error> {
	let tmp: PathBuf = dir.join(format!(".{name}.tmp"));
	let dest = dir.join(name);
	let mut file = fs_err::tokio::File::create(&tmp).await?;
	#[cfg(unix)]
	if let Some(mode) = mode {
		use std::os::unix::fs::PermissionsExt;
		fs_err::tokio::set_permissions(&tmp, std::fs::Permissions::from_mode(mode)).await?;
	}
	use tokio::io::AsyncWriteExt;
	file.write_all(contents).await?;
	file.sync_all().await?;
	fs_err::tokio::rename(&tmp, &dest).await?;
	Ok(())
}

/// Resolution order for the directory a `CertificateBundle` is persisted to:
/// an explicit override, then a well-known in-container path, then a
/// user-home fallback for local development.
pub fn resolve_cert_dir(explicit: Option<&str>) -> PathBuf {
	if let Some(explicit) = explicit {
		return PathBuf::from(explicit);
	}
	let container_path = PathBuf::from("/var/run/fleet/certs");
	if container_path.parent().is_some_and(|p| p.exists()) {
		return container_path;
	}
	dirs_fallback().join(".fleet").join("certs")
}

fn dirs_fallback() -> PathBuf {
	std::env::var_os("HOME").map(PathBuf::from).unwrap_or_else(|| PathBuf::from("."))
}

#[cfg(test)]
mod tests {
	use super::*;
	use time::Duration;
	use crate::identity::Identity;

	fn bundle(not_after: OffsetDateTime) -> CertificateBundle {
		CertificateBundle {
			leaf_pem: "leaf".to_string(),
			key_pem: "key".to_string(),
			ca_pem: "ca".to_string(),
			not_after,
		}
	}

	#[test]
	fn detects_expiry() {
		let now = OffsetDateTime::now_utc();
		let b = bundle(now - Duration::hours(1));
		assert!(b.is_expired(now));
	}

	#[test]
	fn needs_refresh_near_expiry() {
		let not_before = OffsetDateTime::now_utc() - Duration::hours(23);
		let not_after = OffsetDateTime::now_utc() + Duration::hours(1);
		let b = bundle(not_after);
		assert!(b.needs_refresh(not_before, OffsetDateTime::now_utc()));
	}

	#[test]
	fn does_not_need_refresh_when_fresh() {
		let not_before = OffsetDateTime::now_utc() - Duration::hours(1);
		let not_after = OffsetDateTime::now_utc() + Duration::hours(23);
		let b = bundle(not_after);
		assert!(!b.needs_refresh(not_before, OffsetDateTime::now_utc()));
	}

	#[tokio::test]
	async fn round_trips_through_disk() {
		let dir = std::env::temp_dir().join(format!("fleet-ca-test-{}", std::process::id()));
		let b = bundle(OffsetDateTime::now_utc() + Duration::hours(1));
		b.write_to(&dir).await.unwrap();
		let loaded = CertificateBundle::load_from(&dir, b.not_after).await.unwrap();
		assert_eq!(loaded.leaf_pem, "leaf");
		fs_err::tokio::remove_dir_all(&dir).await.unwrap();
	}

	#[cfg(unix)]
	#[tokio::test]
	async fn client_key_is_written_owner_only() {
		use std::os::unix::fs::PermissionsExt;
		let dir = std::env::temp_dir().join(format!("fleet-ca-test-perms-{}", std::process::id()));
		let b = bundle(OffsetDateTime::now_utc() + Duration::hours(1));
		b.write_to(&dir).await.unwrap();
		let perms = tokio::fs::metadata(dir.join("client.key")).await.unwrap().permissions();
		assert_eq!(perms.mode() & 0o777, 0o600);
		fs_err::tokio::remove_dir_all(&dir).await.unwrap();
	}

	fn real_bundle() -> CertificateBundle {
		let mut ca = crate::ca::CertificateAuthority::new("fleet.local").unwrap();
		let identity = Identity::Worker {
			trust_domain: "fleet.local".to_string(),
			worker_id: "w-1".to_string(),
		};
		let signed = crate::csr::CsrOptions { san: identity.clone() }.generate().unwrap();
		let issued = ca.issue(&signed.csr_pem, &identity, None).unwrap();
		CertificateBundle {
			leaf_pem: issued.leaf_pem,
			key_pem: signed.private_key_pem,
			ca_pem: ca.root_cert_pem().to_string(),
			not_after: issued.not_after,
		}
	}

	#[test]
	fn validate_accepts_a_self_consistent_bundle() {
		let b = real_bundle();
		b.validate(OffsetDateTime::now_utc()).unwrap();
	}

	#[test]
	fn validate_rejects_an_expired_bundle() {
		let mut b = real_bundle();
		b.not_after = OffsetDateTime::now_utc() - Duration::hours(1);
		assert!(matches!(b.validate(OffsetDateTime::now_utc()), Err(Error::Expired)));
	}

	#[test]
	fn validate_rejects_a_key_that_does_not_match_the_leaf() {
		let mut b = real_bundle();
		let other = real_bundle();
		b.key_pem = other.key_pem;
		assert!(matches!(b.validate(OffsetDateTime::now_utc()), Err(Error::CertificatesInvalid(_))));
	}

	#[test]
	fn validate_rejects_a_leaf_not_signed_by_the_given_root() {
		let mut b = real_bundle();
		let other = real_bundle();
		b.ca_pem = other.ca_pem;
		assert!(matches!(b.validate(OffsetDateTime::now_utc()), Err(Error::CertificatesInvalid(_))));
	}
}
