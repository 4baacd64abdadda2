use std::sync::Arc;

use async_trait::async_trait;
use axum::Router;
use fleet_ca::{CaClient, CaClientConfig, CertificateState, Identity};
use fleet_core::{drain, readiness, signal};
use fleet_proto::CapabilityDefinition;
use tracing::{error, info};

use crate::client::MtlsClientFactory;
use crate::config::Config;
use crate::health;
use crate::heartbeat::{self, ConnectionState};
use crate::registration;

/// The hook points a capability implementation provides; the runtime drives
/// lifecycle entirely through ordinary calls on this trait, never through
/// inheritance or dynamic dispatch beyond the single `Arc<dyn WorkerApp>`
/// shared between the HTTP router and the heartbeat loop.
#[async_trait]
pub trait WorkerApp: Send + Sync + 'static {
	/// The capability manifest this worker advertises on registration.
	fn get_capabilities(&self) -> Vec<CapabilityDefinition>;

	/// Mounts capability-specific routes onto the base router. The base
	/// already owns `/health/live` and `/health/ready`.
	fn setup_routes(&self, router: Router) -> Router {
		router
	}

	/// Called once the mTLS identity is available and before registration is
	/// attempted. Returning an error aborts startup.
	async fn on_startup(&self) -> anyhow::Result<()> {
		Ok(())
	}

	/// Called after deregistration, before the process exits.
	async fn on_shutdown(&self) {}
}

/// Drives a `WorkerApp` through the full lifecycle: certificate bootstrap,
/// registration, heartbeat, mTLS capability listener, and graceful
/// shutdown/deregistration.
pub struct WorkerRuntime<A: WorkerApp> {
	config: Config,
	app: Arc<A>,
}

impl<A: WorkerApp> WorkerRuntime<A> {
	pub fn new(config: Config, app: A) -> Self {
		Self { config, app: Arc::new(app) }
	}

	pub async fn run(self) -> anyhow::Result<()> {
		let Self { config, app } = self;
		let shutdown = signal::Shutdown::new();
		let (drain_tx, drain_rx) = drain::new();
		let ready = readiness::Ready::new();

		let ca_task = ready.register_task("worker-ca-bootstrap");
		let ca_client = Arc::new(
			CaClient::new(
				CaClientConfig {
					ca_service_url: config.ca_service_url.clone(),
					identity: Identity::Worker {
						trust_domain: "fleet.local".to_string(),
						worker_id: config.worker_id.clone(),
					},
					cert_dir: config.cert_dir.as_deref().map(std::path::PathBuf::from).unwrap_or_else(|| fleet_ca::bundle::resolve_cert_dir(None)),
					..Default::default()
				},
				Vec::new(),
			)
			.await?,
		);
		drop(ca_task);

		app.on_startup().await?;

		let client_factory = Arc::new(MtlsClientFactory::new(
			ca_client.clone(),
			Identity::Controller {
				trust_domain: "fleet.local".to_string(),
			},
		));

		registration::register(&client_factory, &config.controller_url, &config.worker_id, &config.endpoint, config.capabilities.clone()).await?;

		let connection_state = ConnectionState::default();
		let heartbeat_task = tokio::spawn(heartbeat::run(
			client_factory.clone(),
			config.controller_url.clone(),
			config.worker_id.clone(),
			config.endpoint.clone(),
			config.capabilities.clone(),
			config.heartbeat_interval,
			connection_state.clone(),
			drain_rx.clone(),
		));

		let router = app.setup_routes(health::routes(connection_state));

		let CertificateState::Available(cert) = ca_client.current() else {
			anyhow::bail!("worker certificate bootstrap did not yield a certificate");
		};
		let mut roots = rustls::RootCertStore::empty();
		let chain = rustls_pemfile::certs(&mut cert.bundle.ca_pem.as_bytes()).collect::<Result<Vec<_>, _>>()?;
		for c in chain {
			roots.add(c)?;
		}
		let revoked = fleet_ca::revocation::RevocationList::new();
		let tls_config = fleet_ca::tls::server_config(vec![cert.leaf_der()?], cert.key_der()?, Arc::new(roots), revoked)?;
		let rustls_config = axum_server::tls_rustls::RustlsConfig::from_config(Arc::new(tls_config));

		let handle = axum_server::Handle::new();
		let serve_handle = handle.clone();
		let listen_addr = config.listen_addr;
		tokio::spawn(async move {
			if let Err(err) = axum_server::bind_rustls(listen_addr, rustls_config).handle(serve_handle).serve(router.into_make_service()).await {
				error!(%err, "worker listener terminated");
			}
		});

		info!(worker_id = %config.worker_id, "worker started");

		shutdown.wait().await;
		info!(worker_id = %config.worker_id, "worker shutting down");

		heartbeat_task.abort();
		handle.graceful_shutdown(Some(config.shutdown_grace));
		registration::deregister(&client_factory, &config.controller_url, &config.worker_id).await;
		app.on_shutdown().await;
		// Every other watcher was a clone held by the aborted heartbeat task;
		// drop this one too so no watcher remains and the wait below completes.
		drop(drain_rx);
		drain_tx.start_drain_and_wait(drain::DrainMode::Graceful).await;

		Ok(())
	}
}
