use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use fleet_core::{telemetry, version};
use tracing::{error, info};

#[cfg(feature = "jemalloc")]
#[global_allocator]
static ALLOC: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

lazy_static::lazy_static! {
	static ref LONG_VERSION: &'static str = Box::leak(version::BuildInfo::new().to_string().into_boxed_str());
}

#[derive(Parser, Debug)]
#[command(about, long_about = None)]
#[command(disable_version_flag = true)]
struct Args {
	/// Print version (as a simple version string)
	#[arg(short = 'V', value_name = "version")]
	version_short: bool,

	/// Print version (as JSON)
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
	let config = match fleet_controller::parse_config() {
		Ok(c) => Arc::new(c),
		Err(err) => {
			error!(%err, "invalid configuration");
			return ExitCode::from(1);
		},
	};

	info!(version = %version::BuildInfo::new(), "starting controller");

	let bound = match fleet_controller::run(config).await {
		Ok(b) => b,
		Err(err) => {
			error!(%err, "controller failed to start");
			return ExitCode::from(1);
		},
	};

	match bound.wait_termination().await {
		Ok(()) => ExitCode::SUCCESS,
		Err(err) => {
			error!(%err, "controller terminated with error");
			ExitCode::from(1)
		},
	}
}
