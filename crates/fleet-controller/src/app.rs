use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use fleet_ca::{CaClient, CaClientConfig, CertificateState};
use fleet_core::{drain, readiness, signal};
use prometheus_client::registry::Registry;
use rustls::RootCertStore;
use tracing::info;

use crate::api::{self, AppState};
use crate::capability_registry::CapabilityRegistry;
use crate::config::Config;
use crate::mtls_accept::MtlsAcceptor;
use crate::registry::WorkerRegistry;
use crate::sweeper;

/// Drives the controller's full startup sequence: bind the plaintext
/// admin/readiness/metrics listeners, bootstrap the CA client and mTLS
/// control-plane listener, and wire the worker/capability registries and
/// expiry sweeper into shared state.
pub async fn run(config: Arc<Config>) -> anyhow::Result<Bound> {
	let shutdown = signal::Shutdown::new();
	let (drain_tx, drain_rx) = drain::new();
	let ready = readiness::Ready::new();

	let ca_task = ready.register_task("ca-client-bootstrap");
	let ca_client = Arc::new(
		CaClient::new(
			CaClientConfig {
				ca_service_url: config.ca_service_url.clone(),
				identity: fleet_ca::Identity::Controller {
					trust_domain: "fleet.local".to_string(),
				},
				cert_dir: config.cert_dir.as_deref().map(std::path::PathBuf::from).unwrap_or_else(|| fleet_ca::bundle::resolve_cert_dir(None)),
				..Default::default()
			},
			Vec::new(),
		)
		.await
		.context("bootstrapping CA client")?,
	);
	drop(ca_task);

	let readiness_server = crate::management::readiness_server::Server::new(config.readiness_addr, drain_rx.clone(), ready.clone()).await.context("readiness server starts")?;
	readiness_server.spawn();

	let mut registry = Registry::default();
	let admin_server = crate::management::admin::Service::new(config.admin_addr, shutdown.trigger(), config.shutdown_grace, drain_rx.clone()).await.context("admin server starts")?;
	admin_server.spawn();

	let metrics_server = crate::management::metrics_server::Server::new(config.metrics_addr, drain_rx.clone(), std::mem::take(&mut registry)).await.context("metrics server starts")?;
	metrics_server.spawn();

	let revoked = fleet_ca::revocation::RevocationList::new();
	tokio::spawn(poll_revocations(config.ca_service_url.clone(), revoked.clone(), config.cleanup_interval, drain_rx.clone()));

	let workers = WorkerRegistry::new();
	let capabilities = CapabilityRegistry::new();

	tokio::spawn(sweeper::run(workers.clone(), capabilities.clone(), config.cleanup_interval, config.heartbeat_grace, config.worker_timeout, drain_rx.clone()));

	let state = AppState {
		workers: workers.clone(),
		capabilities: capabilities.clone(),
		revoke_deny_window: config.revoke_deny_window,
		ca_service_url: config.ca_service_url.clone(),
		http: reqwest::Client::new(),
	};
	let app = api::router(state);

	let CertificateState::Available(bundle) = ca_client.current() else {
		anyhow::bail!("CA client bootstrap did not yield a certificate");
	};
	let roots = build_root_store(&bundle.bundle.ca_pem)?;
	let tls_config = fleet_ca::tls::server_config(vec![bundle.leaf_der()?], bundle.key_der()?, roots, revoked)?;
	let rustls_config = axum_server::tls_rustls::RustlsConfig::from_config(Arc::new(tls_config));
	let acceptor = MtlsAcceptor::new(axum_server::tls_rustls::RustlsAcceptor::new(rustls_config));

	let control_plane_addr = control_plane_bind_addr(&config.controller_url)?;
	let control_plane_handle = axum_server::Handle::new();
	let serve_handle = control_plane_handle.clone();
	tokio::spawn(async move {
		if let Err(err) = axum_server::bind(control_plane_addr).acceptor(acceptor).handle(serve_handle).serve(app.into_make_service()).await {
			tracing::error!(%err, "control-plane listener terminated");
		}
	});

	info!("controller started");

	Ok(Bound {
		shutdown,
		drain_tx,
		control_plane_handle,
		_ca_client: ca_client,
	})
}

pub struct Bound {
	pub shutdown: signal::Shutdown,
	drain_tx: drain::DrainTrigger,
	control_plane_handle: axum_server::Handle,
	_ca_client: Arc<CaClient>,
}

impl Bound {
	pub async fn wait_termination(self) -> anyhow::Result<()> {
		self.shutdown.wait().await;
		self.drain_tx.start_drain_and_wait(drain::DrainMode::Graceful).await;
		self.control_plane_handle.graceful_shutdown(Some(Duration::from_secs(5)));
		Ok(())
	}
}

/// Builds a root store from the CA's own PEM chain, as handed back by the
/// bootstrap CSR response. The controller trusts exactly this chain for
/// verifying worker and admin client certificates.
fn build_root_store(ca_pem: &str) -> anyhow::Result<Arc<RootCertStore>> {
	let mut roots = RootCertStore::empty();
	let certs = rustls_pemfile::certs(&mut ca_pem.as_bytes()).collect::<Result<Vec<_>, _>>().context("parsing CA certificate chain")?;
	for cert in certs {
		roots.add(cert).context("adding CA certificate to root store")?;
	}
	Ok(Arc::new(roots))
}

/// Parses `controller_url` (an `https://host:port` URI, per `CONTROLLER_URL`)
/// down to the socket address the control-plane listener binds.
fn control_plane_bind_addr(controller_url: &str) -> anyhow::Result<std::net::SocketAddr> {
	let uri: http::Uri = controller_url.parse().context("parsing CONTROLLER_URL")?;
	let authority = uri.authority().ok_or_else(|| anyhow::anyhow!("CONTROLLER_URL {controller_url:?} has no authority"))?;
	let host = authority.host();
	let port = authority.port_u16().unwrap_or(9443);
	let host = if host == "localhost" { "127.0.0.1" } else { host };
	format!("{host}:{port}").parse().with_context(|| format!("CONTROLLER_URL {controller_url:?} does not resolve to a bindable socket address"))
}

/// Polls the CA's revocation list on `interval` and replaces the listener's
/// in-memory deny-set, per the pull-based revocation design decision.
async fn poll_revocations(ca_service_url: String, revoked: fleet_ca::revocation::RevocationList, interval: Duration, drain: drain::DrainWatcher) {
	#[derive(serde::Deserialize)]
	struct RevocationsResponse {
		serials: Vec<String>,
	}

	let client = reqwest::Client::new();
	let url = format!("{}/v1/revocations", ca_service_url.trim_end_matches('/'));
	let mut ticker = tokio::time::interval(interval);
	ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

	loop {
		tokio::select! {
			_ = ticker.tick() => {
				match client.get(&url).send().await.and_then(|r| r.error_for_status()) {
					Ok(resp) => match resp.json::<RevocationsResponse>().await {
						Ok(body) => {
							let count = body.serials.len();
							revoked.replace(body.serials);
							tracing::debug!(count, "refreshed revocation list");
						},
						Err(err) => tracing::warn!(%err, "malformed revocations response"),
					},
					Err(err) => tracing::warn!(%err, "failed to poll revocation list"),
				}
			},
			_ = drain.clone().wait_for_drain() => {
				return;
			},
		}
	}
}
