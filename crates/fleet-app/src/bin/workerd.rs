use std::process::ExitCode;

use async_trait::async_trait;
use axum::Json;
use axum::routing::post;
use clap::Parser;
use fleet_core::{telemetry, version};
use fleet_proto::{CapabilityDefinition, ErrorCodeDef, IoContract, Version as CapabilityVersion};
use fleet_worker::{WorkerApp, WorkerRuntime};
use serde_json::{Value, json};
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

/// A minimal stand-in capability implementation: echoes its input back
/// under `result`. Real capability workers (document conversion, email
/// parsing, image classification, and the like) plug into `WorkerRuntime`
/// the same way, by implementing `WorkerApp` and supplying their own
/// manifest and routes.
struct EchoWorker;

#[async_trait]
impl WorkerApp for EchoWorker {
	fn get_capabilities(&self) -> Vec<CapabilityDefinition> {
		vec![CapabilityDefinition {
			id: "echo.passthrough".to_string(),
			version: CapabilityVersion::new(1, 0, 0),
			io_contract: IoContract {
				input_schema: json!({"type": "object"}),
				output_schema: json!({"type": "object"}),
				error_codes: vec![ErrorCodeDef {
					code: "INVALID_INPUT".to_string(),
					description: "input was not a JSON object".to_string(),
				}],
			},
			constraints: Default::default(),
			tags: vec!["demo".to_string()],
		}]
	}

	fn setup_routes(&self, router: axum::Router) -> axum::Router {
		router.route("/v1/jobs/echo.passthrough", post(echo))
	}
}

async fn echo(Json(payload): Json<Value>) -> Json<Value> {
	Json(json!({ "result": payload }))
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
	let worker_id = match std::env::var("WORKER_ID") {
		Ok(id) => id,
		Err(_) => {
			error!("WORKER_ID is required");
			return ExitCode::from(1);
		},
	};

	let app = EchoWorker;
	let config = match fleet_worker::parse_config(worker_id, app.get_capabilities()) {
		Ok(c) => c,
		Err(err) => {
			error!(%err, "invalid configuration");
			return ExitCode::from(1);
		},
	};

	info!(version = %version::BuildInfo::new(), "starting worker");

	match WorkerRuntime::new(config, app).run().await {
		Ok(()) => ExitCode::SUCCESS,
		Err(err) => {
			error!(%err, "worker terminated with error");
			ExitCode::from(1)
		},
	}
}
