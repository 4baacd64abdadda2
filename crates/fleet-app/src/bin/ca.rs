use std::net::SocketAddr;
use std::process::ExitCode;
use std::sync::{Arc, RwLock};

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use fleet_ca::ca::CertificateAuthority;
use fleet_ca::identity::Identity;
use fleet_core::{signal, telemetry, version};
use rcgen::{CertificateParams, DnType, KeyPair, PKCS_ECDSA_P256_SHA256, SanType};
use rustls_pki_types::{CertificateDer, PrivateKeyDer};
use serde::{Deserialize, Serialize};
use time::format_description::well_known::Rfc3339;
use tracing::{error, info};

#[cfg(feature = "jemalloc")]
#[global_allocator]
static ALLOC: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

#[derive(Parser, Debug)]
#[command(about, long_about = None)]
#[command(disable_version_flag = true)]
struct Args {
	#[arg(short = 'V', value_name = "version")]
	version_short: bool,

	#[arg(long = "version")]
	version_long: bool,
}

fn main() -> ExitCode {
	let _log_flush = telemetry::setup_logging();

	let args = Args::parse();
	if args.version_short {
		println!("{}", version::BuildInfo::new().version);
		return ExitCode::SUCCESS;
	}
	if args.version_long {
		println!("{}", version::BuildInfo::new());
		return ExitCode::SUCCESS;
	}

	tokio::runtime::Builder::new_multi_thread()
		.enable_all()
		.build()
		.expect("failed to build tokio runtime")
		.block_on(run())
}

async fn run() -> ExitCode {
	let trust_domain = std::env::var("TRUST_DOMAIN").unwrap_or_else(|_| "fleet.local".to_string());
	let listen_addr: SocketAddr = match std::env::var("CA_LISTEN_ADDR").unwrap_or_else(|_| "0.0.0.0:8443".to_string()).parse() {
		Ok(addr) => addr,
		Err(err) => {
			error!(%err, "invalid CA_LISTEN_ADDR");
			return ExitCode::from(1);
		},
	};
	let cert_dir = fleet_ca::bundle::resolve_cert_dir(std::env::var("CERT_DIR").ok().as_deref());

	let ca = match load_or_bootstrap_root(&trust_domain, &cert_dir).await {
		Ok(ca) => ca,
		Err(err) => {
			error!(%err, "failed to establish root certificate authority");
			return ExitCode::from(3);
		},
	};
	info!(%trust_domain, "certificate authority root ready");

	let (listener_cert_der, listener_key_der) = match self_signed_listener_cert(&trust_domain) {
		Ok(pair) => pair,
		Err(err) => {
			error!(%err, "failed to generate listener certificate");
			return ExitCode::from(3);
		},
	};
	let tls_config = match fleet_ca::tls::server_config_no_client_auth(vec![listener_cert_der], listener_key_der) {
		Ok(cfg) => cfg,
		Err(err) => {
			error!(%err, "failed to build listener TLS config");
			return ExitCode::from(1);
		},
	};
	let rustls_config = axum_server::tls_rustls::RustlsConfig::from_config(Arc::new(tls_config));

	let shutdown = signal::Shutdown::new();

	let state = Arc::new(AppState { ca: RwLock::new(ca) });
	let app = router(state);

	let handle = axum_server::Handle::new();
	let serve_handle = handle.clone();
	tokio::spawn(async move {
		if let Err(err) = axum_server::bind_rustls(listen_addr, rustls_config).handle(serve_handle).serve(app.into_make_service()).await {
			error!(%err, "CA listener terminated");
		}
	});

	info!(%listen_addr, version = %version::BuildInfo::new(), "certificate authority service started");
	shutdown.wait().await;
	info!("certificate authority shutting down");
	handle.graceful_shutdown(Some(std::time::Duration::from_secs(10)));
	ExitCode::SUCCESS
}

struct AppState {
	ca: RwLock<CertificateAuthority>,
}

fn router(state: Arc<AppState>) -> Router {
	Router::new()
		.route("/v1/csr", post(submit_csr))
		.route("/v1/ca", get(root_cert))
		.route("/v1/revocations", get(revocations))
		.route("/v1/revoke", post(revoke))
		.route("/v1/healthz", get(healthz))
		.with_state(state)
}

#[derive(Deserialize)]
struct CsrSubmission {
	csr_pem: String,
	identity: String,
}

#[derive(Serialize)]
struct CsrResponse {
	leaf_pem: String,
	ca_pem: String,
	not_before: String,
	not_after: String,
}

async fn submit_csr(State(state): State<Arc<AppState>>, Json(body): Json<CsrSubmission>) -> axum::response::Response {
	let identity: Identity = match body.identity.parse() {
		Ok(id) => id,
		Err(err) => return (StatusCode::BAD_REQUEST, err.to_string()).into_response(),
	};

	let mut ca = state.ca.write().expect("certificate authority lock poisoned");
	match ca.issue(&body.csr_pem, &identity, None) {
		Ok(issued) => {
			let Ok(not_before) = issued.not_before.format(&Rfc3339) else {
				return (StatusCode::INTERNAL_SERVER_ERROR, "failed to format not_before").into_response();
			};
			let Ok(not_after) = issued.not_after.format(&Rfc3339) else {
				return (StatusCode::INTERNAL_SERVER_ERROR, "failed to format not_after").into_response();
			};
			Json(CsrResponse {
				leaf_pem: issued.leaf_pem,
				ca_pem: ca.root_cert_pem().to_string(),
				not_before,
				not_after,
			})
			.into_response()
		},
		Err(err) => (StatusCode::BAD_REQUEST, err.to_string()).into_response(),
	}
}

#[derive(Serialize)]
struct RootResponse {
	ca_pem: String,
}

async fn root_cert(State(state): State<Arc<AppState>>) -> Json<RootResponse> {
	let ca = state.ca.read().expect("certificate authority lock poisoned");
	Json(RootResponse { ca_pem: ca.root_cert_pem().to_string() })
}

#[derive(Serialize)]
struct RevocationsResponse {
	serials: Vec<String>,
}

async fn revocations(State(state): State<Arc<AppState>>) -> Json<RevocationsResponse> {
	let ca = state.ca.read().expect("certificate authority lock poisoned");
	Json(RevocationsResponse {
		serials: ca.revoked_serials().cloned().collect(),
	})
}

#[derive(Deserialize)]
struct RevokeRequest {
	identity: String,
}

#[derive(Serialize)]
struct RevokeResponse {
	serial: String,
}

/// The controller's counterpart to revoking a worker in its own registry:
/// looks up the serial most recently issued to `identity` and adds it to the
/// revocation set the CA serves at `/v1/revocations`.
async fn revoke(State(state): State<Arc<AppState>>, Json(body): Json<RevokeRequest>) -> axum::response::Response {
	let mut ca = state.ca.write().expect("certificate authority lock poisoned");
	match ca.revoke_identity(&body.identity) {
		Some(serial) => Json(RevokeResponse { serial }).into_response(),
		None => (StatusCode::NOT_FOUND, format!("no certificate has been issued to {:?}", body.identity)).into_response(),
	}
}

async fn healthz() -> StatusCode {
	StatusCode::OK
}

/// Loads a previously persisted root cert/key pair from `cert_dir`, or
/// generates and persists a fresh one if none exists yet. The root survives
/// process restarts so leaves it already issued remain valid against it.
async fn load_or_bootstrap_root(trust_domain: &str, cert_dir: &std::path::Path) -> anyhow::Result<CertificateAuthority> {
	let root_crt = cert_dir.join("root.crt");
	let root_key = cert_dir.join("root.key");
	if root_crt.exists() && root_key.exists() {
		let cert_pem = fs_err::tokio::read_to_string(&root_crt).await?;
		let key_pem = fs_err::tokio::read_to_string(&root_key).await?;
		let cert_der = rustls_pemfile::certs(&mut cert_pem.as_bytes()).next().ok_or_else(|| anyhow::anyhow!("root.crt has no certificate"))??;
		let key_der = rustls_pemfile::private_key(&mut key_pem.as_bytes())?.ok_or_else(|| anyhow::anyhow!("root.key has no private key"))?;
		info!(dir = %cert_dir.display(), "loaded existing root certificate authority");
		return Ok(CertificateAuthority::from_existing(trust_domain, cert_der.to_vec(), key_der.secret_der().to_vec())?);
	}

	let ca = CertificateAuthority::new(trust_domain)?;
	fs_err::tokio::create_dir_all(cert_dir).await?;
	fs_err::tokio::write(&root_crt, ca.root_cert_pem()).await?;
	fs_err::tokio::write(&root_key, ca.root_key_pem()).await?;
	info!(dir = %cert_dir.display(), "persisted newly generated root certificate authority");
	Ok(ca)
}

/// Builds a short-lived, self-signed DNS-identified certificate for the CA's
/// own plain-HTTPS listener. This is distinct from the `fleet://` leaves the
/// CA issues to workloads: it authenticates the service endpoint itself, not
/// a fleet identity, so a bootstrapping client can establish transport trust
/// before it has any certificate of its own.
fn self_signed_listener_cert(trust_domain: &str) -> anyhow::Result<(CertificateDer<'static>, PrivateKeyDer<'static>)> {
	let key_pair = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256)?;
	let hostname = format!("fleet-ca.{trust_domain}");
	let mut params = CertificateParams::new(Vec::new())?;
	params.distinguished_name.push(DnType::CommonName, hostname.clone());
	params.subject_alt_names = vec![SanType::DnsName(hostname.try_into()?)];
	params.key_usages = vec![rcgen::KeyUsagePurpose::DigitalSignature, rcgen::KeyUsagePurpose::KeyEncipherment];
	params.extended_key_usages = vec![rcgen::ExtendedKeyUsagePurpose::ServerAuth];
	let now = time::OffsetDateTime::now_utc();
	params.not_before = now - time::Duration::hours(1);
	params.not_after = now + time::Duration::days(30);
	let cert = params.self_signed(&key_pair)?;
	Ok((CertificateDer::from(cert.der().to_vec()), PrivateKeyDer::Pkcs8(key_pair.serialize_der().into())))
}

#[cfg(test)]
mod tests {
	use x509_parser::prelude::FromDer;

	use super::*;

	fn scratch_dir(tag: &str) -> std::path::PathBuf {
		let dir = std::env::temp_dir().join(format!("fleet-ca-test-{tag}-{}", std::process::id()));
		let _ = std::fs::remove_dir_all(&dir);
		dir
	}

	#[tokio::test]
	async fn bootstrap_persists_and_reload_recovers_the_same_root() {
		let dir = scratch_dir("bootstrap");
		let first = load_or_bootstrap_root("fleet.local", &dir).await.unwrap();
		let root_pem = first.root_cert_pem().to_string();

		let second = load_or_bootstrap_root("fleet.local", &dir).await.unwrap();
		assert_eq!(second.root_cert_pem(), root_pem);

		std::fs::remove_dir_all(&dir).ok();
	}

	#[test]
	fn listener_cert_carries_the_trust_domain_hostname() {
		let (cert_der, _key) = self_signed_listener_cert("fleet.local").unwrap();
		let (_, parsed) = x509_parser::prelude::X509Certificate::from_der(cert_der.as_ref()).unwrap();
		let cn = parsed.subject().iter_common_name().next().unwrap().as_str().unwrap();
		assert_eq!(cn, "fleet-ca.fleet.local");
	}

	#[tokio::test]
	async fn revoke_then_revocations_reports_the_serial() {
		let dir = scratch_dir("revoke");
		let ca = load_or_bootstrap_root("fleet.local", &dir).await.unwrap();
		let state = Arc::new(AppState { ca: RwLock::new(ca) });

		let identity: Identity = "fleet://fleet.local/worker/w-1".parse().unwrap();
		let signed = fleet_ca::csr::CsrOptions { san: identity.clone() }.generate().unwrap();
		{
			let mut ca = state.ca.write().unwrap();
			ca.issue(&signed.csr_pem, &identity, None).unwrap();
		}

		let resp = revoke(State(state.clone()), Json(RevokeRequest { identity: identity.to_string() })).await.into_response();
		assert_eq!(resp.status(), StatusCode::OK);

		let revocations = revocations(State(state.clone())).await.0;
		assert_eq!(revocations.serials.len(), 1);

		std::fs::remove_dir_all(&dir).ok();
	}

	#[tokio::test]
	async fn revoke_unknown_identity_reports_not_found() {
		let dir = scratch_dir("revoke-unknown");
		let ca = load_or_bootstrap_root("fleet.local", &dir).await.unwrap();
		let state = Arc::new(AppState { ca: RwLock::new(ca) });

		let resp = revoke(State(state), Json(RevokeRequest { identity: "fleet://fleet.local/worker/ghost".to_string() })).await.into_response();
		assert_eq!(resp.status(), StatusCode::NOT_FOUND);

		std::fs::remove_dir_all(&dir).ok();
	}
}
