use std::env;
use std::str::FromStr;
use std::time::Duration;

use fleet_proto::CapabilityDefinition;

/// A worker's full startup configuration, built once from the environment.
/// `capabilities` is supplied by the embedding binary (the subclass knows
/// its own manifest) rather than parsed from an env var.
#[derive(Debug, Clone)]
pub struct Config {
	pub worker_id: String,
	pub endpoint: String,
	pub capabilities: Vec<CapabilityDefinition>,
	pub controller_url: String,
	pub ca_service_url: String,
	pub cert_dir: Option<String>,
	pub heartbeat_interval: Duration,
	pub worker_timeout: Duration,
	pub shutdown_grace: Duration,
	pub listen_addr: std::net::SocketAddr,
	pub environment_label: String,
}

const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(45);
const DEFAULT_WORKER_TIMEOUT: Duration = Duration::from_secs(120);
const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// Builds a worker's configuration from the environment. `worker_id` and
/// `capabilities` come from the embedding binary since they describe the
/// specific capability implementation, not generic runtime wiring.
pub fn parse_config(worker_id: impl Into<String>, capabilities: Vec<CapabilityDefinition>) -> anyhow::Result<Config> {
	let worker_id = worker_id.into();
	let listen_addr: std::net::SocketAddr = parse::<String>("WORKER_LISTEN_ADDR")?.unwrap_or_else(|| "0.0.0.0:9444".to_string()).parse()?;
	let endpoint = parse::<String>("WORKER_ENDPOINT")?.unwrap_or_else(|| format!("https://{listen_addr}"));

	Ok(Config {
		worker_id,
		endpoint,
		capabilities,
		controller_url: env::var("CONTROLLER_URL").map_err(|_| anyhow::anyhow!("CONTROLLER_URL is required"))?,
		ca_service_url: env::var("CA_SERVICE_URL").map_err(|_| anyhow::anyhow!("CA_SERVICE_URL is required"))?,
		cert_dir: parse("CERT_DIR")?,
		heartbeat_interval: parse_duration_default("WORKER_HEARTBEAT_INTERVAL", DEFAULT_HEARTBEAT_INTERVAL)?,
		worker_timeout: parse_duration_default("WORKER_TIMEOUT", DEFAULT_WORKER_TIMEOUT)?,
		shutdown_grace: parse_duration_default("WORKER_SHUTDOWN_GRACE", DEFAULT_SHUTDOWN_GRACE)?,
		listen_addr,
		environment_label: parse_default("CRANK_ENVIRONMENT", "production".to_string())?,
	})
}

fn parse<T: FromStr>(env: &str) -> anyhow::Result<Option<T>>
where
	<T as FromStr>::Err: ToString,
{
	match env::var(env) {
		Ok(val) => val.parse().map(Some).map_err(|e: <T as FromStr>::Err| anyhow::anyhow!("invalid env var {}={} ({})", env, val, e.to_string())),
		Err(_) => Ok(None),
	}
}

fn parse_default<T: FromStr>(env: &str, default: T) -> anyhow::Result<T>
where
	<T as FromStr>::Err: std::error::Error + Sync + Send,
{
	parse(env).map(|v| v.unwrap_or(default))
}

fn parse_duration(env: &str) -> anyhow::Result<Option<Duration>> {
	parse::<String>(env)?.map(|ds| duration_str::parse(&ds).map_err(|e| anyhow::anyhow!("invalid env var {}={} ({})", env, ds, e))).transpose()
}

fn parse_duration_default(env: &str, default: Duration) -> anyhow::Result<Duration> {
	parse_duration(env).map(|v| v.unwrap_or(default))
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn parse_duration_default_falls_back() {
		assert_eq!(parse_duration_default("FLEET_WORKER_TEST_UNSET_DURATION", Duration::from_secs(5)).unwrap(), Duration::from_secs(5));
	}
}
