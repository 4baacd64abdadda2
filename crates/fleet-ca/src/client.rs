use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use rustls_pki_types::{CertificateDer, PrivateKeyDer};
use time::OffsetDateTime;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::bundle::CertificateBundle;
use crate::csr::CsrOptions;
use crate::error::Error;
use crate::identity::Identity;

/// Observable lifecycle events a `CaClient` emits while bootstrapping and
/// rotating its certificate. Surfaced to callers purely for logging/metrics;
/// nothing downstream acts on the enum itself.
#[derive(Debug, Clone)]
pub enum Event {
	CsrGenerated { identity: Identity },
	CsrSubmitted { identity: Identity, attempt: u32 },
	CertIssued { identity: Identity, not_after: OffsetDateTime },
	CertRotated { identity: Identity, not_after: OffsetDateTime },
	CaUnavailable { reason: String },
	CsrFailed { reason: String },
}

pub type EventHandler = Arc<dyn Fn(Event) + Send + Sync>;

fn log_event(ev: &Event) {
	match ev {
		Event::CsrGenerated { identity } => info!(%identity, "CSR_GENERATED"),
		Event::CsrSubmitted { identity, attempt } => info!(%identity, attempt, "CSR_SUBMITTED"),
		Event::CertIssued { identity, not_after } => info!(%identity, %not_after, "CERT_ISSUED"),
		Event::CertRotated { identity, not_after } => info!(%identity, %not_after, "CERT_ROTATED"),
		Event::CaUnavailable { reason } => warn!(reason, "CA_UNAVAILABLE"),
		Event::CsrFailed { reason } => warn!(reason, "CSR_FAILED"),
	}
}

#[derive(Clone)]
pub struct Config {
	pub ca_service_url: String,
	pub identity: Identity,
	pub cert_dir: PathBuf,
	pub bootstrap_max_attempts: u32,
	pub bootstrap_attempt_timeout: StdDuration,
}

impl Default for Config {
	fn default() -> Self {
		Self {
			ca_service_url: "https://fleet-ca:8443".to_string(),
			identity: Identity::Admin {
				trust_domain: "cluster.local".to_string(),
			},
			cert_dir: PathBuf::from("/var/run/fleet/certs"),
			bootstrap_max_attempts: 3,
			bootstrap_attempt_timeout: StdDuration::from_secs(10),
		}
	}
}

#[derive(serde::Serialize)]
struct CsrSubmission {
	csr_pem: String,
	identity: String,
}

#[derive(serde::Deserialize)]
struct CsrResponse {
	leaf_pem: String,
	ca_pem: String,
	not_before: String,
	not_after: String,
}

pub struct WorkloadCertificate {
	pub bundle: CertificateBundle,
	pub not_before: OffsetDateTime,
	pub identity: Identity,
}

impl WorkloadCertificate {
	pub fn is_expired(&self) -> bool {
		self.bundle.is_expired(OffsetDateTime::now_utc())
	}

	/// Instant at which this certificate should be proactively rotated: when
	/// 25% or less of its total validity window remains.
	pub fn refresh_at(&self) -> Instant {
		let total = self.bundle.not_after - self.not_before;
		let trigger = self.not_before + total * 0.75;
		let remaining = trigger - OffsetDateTime::now_utc();
		let remaining = remaining.max(time::Duration::ZERO);
		Instant::now() + StdDuration::from_secs_f64(remaining.as_seconds_f64().max(0.0))
	}

	pub fn leaf_der(&self) -> Result<CertificateDer<'static>, Error> {
		self.bundle.parse_leaf_der()
	}

	pub fn key_der(&self) -> Result<PrivateKeyDer<'static>, Error> {
		self.bundle.parse_key_der()
	}
}

#[derive(Clone)]
pub enum CertificateState {
	NotReady,
	Available(Arc<WorkloadCertificate>),
	Error(Error),
}

/// Owns a worker or admin client's mTLS identity: bootstraps a certificate
/// from the CA on startup, then rotates it in the background for the
/// lifetime of the process.
pub struct CaClient {
	state: watch::Receiver<CertificateState>,
	_fetcher_handle: tokio::task::JoinHandle<()>,
}

impl CaClient {
	pub async fn new(config: Config, handlers: Vec<EventHandler>) -> Result<Self, Error> {
		let (tx, rx) = watch::channel(CertificateState::NotReady);
		let http = reqwest::Client::builder()
			.timeout(config.bootstrap_attempt_timeout)
			.build()
			.map_err(|e| Error::CaUnavailable(Arc::new(e.into())))?;

		let cert = match load_existing(&config).await {
			Some(cert) => {
				info!(identity = %config.identity, "loaded existing certificate bundle from disk");
				cert
			},
			None => {
				bootstrap(&http, &config, &handlers).await?;
				fetch_and_store(&http, &config, &handlers).await?
			},
		};
		tx.send(CertificateState::Available(Arc::new(cert))).ok();

		let handle = tokio::spawn(run_fetcher(http, config, tx, handlers));
		Ok(Self {
			state: rx,
			_fetcher_handle: handle,
		})
	}

	pub fn get_identity(&self) -> Identity {
		match &*self.state.borrow() {
			CertificateState::Available(cert) => cert.identity.clone(),
			_ => Identity::Admin {
				trust_domain: "cluster.local".to_string(),
			},
		}
	}

	pub fn current(&self) -> CertificateState {
		self.state.borrow().clone()
	}

	pub async fn wait_for_certificate(&self) -> Result<Arc<WorkloadCertificate>, Error> {
		let mut rx = self.state.clone();
		loop {
			if let CertificateState::Available(cert) = &*rx.borrow() {
				return Ok(cert.clone());
			}
			rx.changed().await.map_err(|_| Error::NotReady)?;
		}
	}
}

/// Retries the first certificate fetch with exponential backoff (1s, 2s, 4s)
/// before giving up: a controller or worker that cannot reach the CA at
/// startup should fail fast rather than limp along without an identity.
async fn bootstrap(http: &reqwest::Client, config: &Config, handlers: &[EventHandler]) -> Result<(), Error> {
	let mut delay = StdDuration::from_secs(1);
	let mut last_err = None;
	for attempt in 1..=config.bootstrap_max_attempts {
		match tokio::time::timeout(config.bootstrap_attempt_timeout, probe(http, config)).await {
			Ok(Ok(())) => return Ok(()),
			Ok(Err(e)) => last_err = Some(e),
			Err(_) => last_err = Some(Error::CaUnavailable(Arc::new(anyhow::anyhow!("probe timed out")))),
		}
		emit(
			handlers,
			Event::CaUnavailable {
				reason: format!("bootstrap attempt {attempt}/{} failed", config.bootstrap_max_attempts),
			},
		);
		if attempt < config.bootstrap_max_attempts {
			tokio::time::sleep(delay).await;
			delay *= 2;
		}
	}
	Err(last_err.unwrap_or(Error::NotReady))
}

/// Loads and validates a certificate bundle already persisted under
/// `config.cert_dir`, returning `None` if no bundle is present or the one on
/// disk fails validation (expired, doesn't chain to its own CA PEM, or the
/// key doesn't match the leaf) — either case falls back to bootstrapping a
/// fresh certificate from the CA rather than treating it as fatal.
async fn load_existing(config: &Config) -> Option<WorkloadCertificate> {
	let leaf_der = {
		let leaf_pem = fs_err::tokio::read_to_string(config.cert_dir.join("client.crt")).await.ok()?;
		let mut cursor = leaf_pem.as_bytes();
		rustls_pemfile::certs(&mut cursor).next()?.ok()?
	};
	let (_, leaf) = x509_parser::prelude::X509Certificate::from_der(leaf_der.as_ref()).ok()?;
	let not_before = time::OffsetDateTime::from_unix_timestamp(leaf.validity().not_before.timestamp()).ok()?;
	let not_after = time::OffsetDateTime::from_unix_timestamp(leaf.validity().not_after.timestamp()).ok()?;

	let bundle = CertificateBundle::load_from(&config.cert_dir, not_after).await.ok()?;
	if let Err(err) = bundle.validate(time::OffsetDateTime::now_utc()) {
		warn!(%err, "discarding invalid on-disk certificate bundle");
		return None;
	}

	Some(WorkloadCertificate {
		bundle,
		not_before,
		identity: config.identity.clone(),
	})
}

async fn probe(http: &reqwest::Client, config: &Config) -> Result<(), Error> {
	http.get(format!("{}/v1/healthz", config.ca_service_url))
		.send()
		.await
		.map_err(|e| Error::CaUnavailable(Arc::new(e.into())))?;
	Ok(())
}

fn emit(handlers: &[EventHandler], ev: Event) {
	log_event(&ev);
	for h in handlers {
		h(ev.clone());
	}
}

/// CSR submission retries 3 times with the same 1s/2s/4s backoff as the
/// liveness probe; a CA-side rejection (4xx) is not worth retrying.
const CSR_SUBMIT_MAX_ATTEMPTS: u32 = 3;

async fn fetch_and_store(http: &reqwest::Client, config: &Config, handlers: &[EventHandler]) -> Result<WorkloadCertificate, Error> {
	let signed = CsrOptions {
		san: config.identity.clone(),
	}
	.generate()?;
	emit(
		handlers,
		Event::CsrGenerated {
			identity: config.identity.clone(),
		},
	);

	let body = submit_csr(http, config, handlers, &signed.csr_pem).await?;
	let not_before = time::OffsetDateTime::parse(&body.not_before, &time::format_description::well_known::Rfc3339)
		.map_err(|e| Error::CertificatesInvalid(e.to_string()))?;
	let not_after = time::OffsetDateTime::parse(&body.not_after, &time::format_description::well_known::Rfc3339)
		.map_err(|e| Error::CertificatesInvalid(e.to_string()))?;

	let bundle = CertificateBundle {
		leaf_pem: body.leaf_pem,
		key_pem: signed.private_key_pem,
		ca_pem: body.ca_pem,
		not_after,
	};
	bundle.write_to(&config.cert_dir).await?;

	emit(
		handlers,
		Event::CertIssued {
			identity: config.identity.clone(),
			not_after,
		},
	);

	Ok(WorkloadCertificate {
		bundle,
		not_before,
		identity: config.identity.clone(),
	})
}

/// Submits a CSR to the CA, retrying transient failures (connection errors,
/// 5xx) up to `CSR_SUBMIT_MAX_ATTEMPTS` times with exponential backoff. A
/// 4xx response is a definitive CA-side rejection and returns immediately.
async fn submit_csr(http: &reqwest::Client, config: &Config, handlers: &[EventHandler], csr_pem: &str) -> Result<CsrResponse, Error> {
	let mut delay = StdDuration::from_secs(1);
	let mut last_err: Option<Error> = None;

	for attempt in 1..=CSR_SUBMIT_MAX_ATTEMPTS {
		emit(
			handlers,
			Event::CsrSubmitted {
				identity: config.identity.clone(),
				attempt,
			},
		);
		let result = http
			.post(format!("{}/v1/csr", config.ca_service_url))
			.json(&CsrSubmission {
				csr_pem: csr_pem.to_string(),
				identity: config.identity.to_string(),
			})
			.send()
			.await;

		match result {
			Ok(resp) if resp.status().is_success() => {
				return resp.json().await.map_err(|e| Error::CsrRejected(e.to_string()));
			},
			Ok(resp) if resp.status().is_client_error() => {
				let reason = format!("CA returned {}", resp.status());
				emit(handlers, Event::CsrFailed { reason: reason.clone() });
				return Err(Error::CsrRejected(reason));
			},
			Ok(resp) => {
				let reason = format!("CA returned {}", resp.status());
				emit(handlers, Event::CaUnavailable { reason: reason.clone() });
				last_err = Some(Error::CsrRejected(reason));
			},
			Err(e) => {
				let err = Error::CaUnavailable(Arc::new(e.into()));
				emit(handlers, Event::CaUnavailable { reason: err.to_string() });
				last_err = Some(err);
			},
		}

		if attempt < CSR_SUBMIT_MAX_ATTEMPTS {
			tokio::time::sleep(delay).await;
			delay *= 2;
		}
	}

	let reason = last_err.map(|e| e.to_string()).unwrap_or_else(|| "CSR submission exhausted retries".to_string());
	emit(handlers, Event::CsrFailed { reason: reason.clone() });
	Err(Error::CsrRejected(reason))
}

async fn run_fetcher(http: reqwest::Client, config: Config, tx: watch::Sender<CertificateState>, handlers: Vec<EventHandler>) {
	loop {
		let sleep_until = match &*tx.borrow() {
			CertificateState::Available(cert) => cert.refresh_at(),
			_ => Instant::now() + StdDuration::from_secs(1),
		};
		tokio::time::sleep_until(sleep_until).await;

		match fetch_and_store(&http, &config, &handlers).await {
			Ok(cert) => {
				emit(
					&handlers,
					Event::CertRotated {
						identity: config.identity.clone(),
						not_after: cert.bundle.not_after,
					},
				);
				tx.send(CertificateState::Available(Arc::new(cert))).ok();
			}
			Err(e) => {
				warn!(error = %e, "certificate rotation failed, will retry in 5s");
				let _ = tx.send(CertificateState::Error(e));
				tokio::time::sleep(StdDuration::from_secs(5)).await;
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn refresh_at_triggers_at_75_percent_elapsed() {
		let not_before = OffsetDateTime::now_utc() - time::Duration::hours(18);
		let not_after = OffsetDateTime::now_utc() + time::Duration::hours(6);
		let cert = WorkloadCertificate {
			bundle: CertificateBundle {
				leaf_pem: String::new(),
				key_pem: String::new(),
				ca_pem: String::new(),
				not_after,
			},
			not_before,
			identity: Identity::Admin {
				trust_domain: "cluster.local".to_string(),
			},
		};
		// 75% of a 24h window has already elapsed, so the refresh instant
		// should already be due (approximately now).
		assert!(cert.refresh_at() <= Instant::now() + StdDuration::from_secs(1));
	}

	fn scratch_dir(tag: &str) -> PathBuf {
		let dir = std::env::temp_dir().join(format!("fleet-ca-client-test-{tag}-{}", std::process::id()));
		let _ = std::fs::remove_dir_all(&dir);
		dir
	}

	fn worker_identity() -> Identity {
		Identity::Worker {
			trust_domain: "fleet.local".to_string(),
			worker_id: "w-1".to_string(),
		}
	}

	async fn persist_real_bundle(dir: &std::path::Path, identity: &Identity) {
		let mut ca = crate::ca::CertificateAuthority::new("fleet.local").unwrap();
		let signed = CsrOptions { san: identity.clone() }.generate().unwrap();
		let issued = ca.issue(&signed.csr_pem, identity, None).unwrap();
		let bundle = CertificateBundle {
			leaf_pem: issued.leaf_pem,
			key_pem: signed.private_key_pem,
			ca_pem: ca.root_cert_pem().to_string(),
			not_after: issued.not_after,
		};
		bundle.write_to(dir).await.unwrap();
	}

	#[tokio::test]
	async fn load_existing_recovers_a_valid_bundle_from_disk() {
		let dir = scratch_dir("valid");
		let identity = worker_identity();
		persist_real_bundle(&dir, &identity).await;

		let config = Config {
			cert_dir: dir.clone(),
			identity: identity.clone(),
			..Default::default()
		};
		let cert = load_existing(&config).await.expect("a valid bundle should load");
		assert_eq!(cert.identity, identity);
		assert!(!cert.is_expired());

		std::fs::remove_dir_all(&dir).ok();
	}

	#[tokio::test]
	async fn load_existing_returns_none_when_no_bundle_is_present() {
		let dir = scratch_dir("missing");
		let config = Config {
			cert_dir: dir.clone(),
			identity: worker_identity(),
			..Default::default()
		};
		assert!(load_existing(&config).await.is_none());
	}

	#[tokio::test]
	async fn load_existing_discards_an_expired_bundle() {
		let dir = scratch_dir("expired");
		let identity = worker_identity();
		let mut ca = crate::ca::CertificateAuthority::new("fleet.local").unwrap();
		let signed = CsrOptions { san: identity.clone() }.generate().unwrap();
		// A negative requested TTL back-dates not_after into the past, so the
		// leaf certificate itself (not just the in-memory wrapper) is expired.
		let issued = ca.issue(&signed.csr_pem, &identity, Some(-time::Duration::hours(2))).unwrap();
		let bundle = CertificateBundle {
			leaf_pem: issued.leaf_pem,
			key_pem: signed.private_key_pem,
			ca_pem: ca.root_cert_pem().to_string(),
			not_after: issued.not_after,
		};
		bundle.write_to(&dir).await.unwrap();

		let config = Config {
			cert_dir: dir.clone(),
			identity,
			..Default::default()
		};
		assert!(load_existing(&config).await.is_none());

		std::fs::remove_dir_all(&dir).ok();
	}
}
