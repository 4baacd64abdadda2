use std::env;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use crate::http::Address;

#[derive(Debug, Clone)]
pub struct Config {
	pub cert_dir: Option<String>,
	pub ca_service_url: String,
	pub controller_url: String,
	pub heartbeat_interval: Duration,
	pub worker_timeout: Duration,
	pub cleanup_interval: Duration,
	pub heartbeat_grace: Duration,
	pub environment_label: String,
	pub admin_addr: Address,
	pub readiness_addr: Address,
	pub metrics_addr: Address,
	pub shutdown_grace: Duration,
	pub num_worker_threads: usize,
	pub revoke_deny_window: Duration,
}

const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(45);
const DEFAULT_WORKER_TIMEOUT: Duration = Duration::from_secs(120);
const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_secs(30);
const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(30);
const DEFAULT_REVOKE_DENY_WINDOW: Duration = Duration::from_secs(300);

/// Builds the controller's configuration once at startup from environment
/// variables. Validation errors abort before any socket is opened.
pub fn parse_config() -> anyhow::Result<Config> {
	let ipv6_localhost_enabled = true;

	let heartbeat_interval = parse_duration_default("WORKER_HEARTBEAT_INTERVAL", DEFAULT_HEARTBEAT_INTERVAL)?;
	let worker_timeout = parse_duration_default("WORKER_TIMEOUT", DEFAULT_WORKER_TIMEOUT)?;
	let cleanup_interval = parse_duration_default("WORKER_CLEANUP_INTERVAL", DEFAULT_CLEANUP_INTERVAL)?;
	let heartbeat_grace = parse_duration("WORKER_HEARTBEAT_GRACE")?.unwrap_or(heartbeat_interval * 2);

	let admin_addr = parse::<String>("ADMIN_ADDR")?.map(|addr| Address::new(ipv6_localhost_enabled, &addr)).transpose()?.unwrap_or(Address::Localhost(ipv6_localhost_enabled, 9901));
	let readiness_addr = parse::<String>("READINESS_ADDR")?
		.map(|addr| Address::new(ipv6_localhost_enabled, &addr))
		.transpose()?
		.unwrap_or(Address::SocketAddr(SocketAddr::new(std::net::IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED), 9902)));
	let metrics_addr = parse::<String>("METRICS_ADDR")?
		.map(|addr| Address::new(ipv6_localhost_enabled, &addr))
		.transpose()?
		.unwrap_or(Address::SocketAddr(SocketAddr::new(std::net::IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED), 9903)));

	Ok(Config {
		cert_dir: parse("CERT_DIR")?,
		ca_service_url: empty_to_none(parse::<String>("CA_SERVICE_URL")?)
			.map(|uri| validate_uri(Some(uri)))
			.transpose()?
			.flatten()
			.ok_or_else(|| anyhow::anyhow!("CA_SERVICE_URL is required"))?,
		controller_url: empty_to_none(parse::<String>("CONTROLLER_URL")?)
			.map(|uri| validate_uri(Some(uri)))
			.transpose()?
			.flatten()
			.ok_or_else(|| anyhow::anyhow!("CONTROLLER_URL is required"))?,
		heartbeat_interval,
		worker_timeout,
		cleanup_interval,
		heartbeat_grace,
		environment_label: parse_default("CRANK_ENVIRONMENT", "production".to_string())?,
		admin_addr,
		readiness_addr,
		metrics_addr,
		shutdown_grace: parse_duration_default("SHUTDOWN_GRACE", DEFAULT_SHUTDOWN_GRACE)?,
		num_worker_threads: parse_worker_threads()?,
		revoke_deny_window: DEFAULT_REVOKE_DENY_WINDOW,
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

pub fn empty_to_none<A: AsRef<str>>(inp: Option<A>) -> Option<A> {
	if let Some(inner) = &inp {
		if inner.as_ref().is_empty() {
			return None;
		}
	}
	inp
}

fn validate_uri(uri_str: Option<String>) -> anyhow::Result<Option<String>> {
	let Some(uri_str) = uri_str else {
		return Ok(uri_str);
	};
	let uri = http::Uri::try_from(&uri_str)?;
	if uri.scheme().is_none() {
		return Ok(Some("https://".to_owned() + &uri_str));
	}
	Ok(Some(uri_str))
}

/// Supports both a fixed integer and an `N%` fraction of `num_cpus::get()`.
fn parse_worker_threads() -> anyhow::Result<usize> {
	match parse::<String>("WORKER_THREADS")? {
		Some(value) => {
			if let Some(percent_str) = value.strip_suffix('%') {
				let percent: f64 = percent_str.parse().map_err(|e| anyhow::anyhow!("invalid percentage: {}", e))?;
				if percent <= 0.0 || percent > 100.0 {
					anyhow::bail!("percentage must be between 0 and 100".to_string())
				}
				let cpu_count = get_cpu_count()?;
				let threads = ((cpu_count as f64 * percent / 100.0).ceil() as usize).max(1);
				Ok(threads)
			} else {
				value.parse::<usize>().map_err(|e| anyhow::anyhow!("invalid number: {}", e))
			}
		},
		None => get_cpu_count(),
	}
}

fn get_cpu_count() -> anyhow::Result<usize> {
	match parse::<usize>("CPU_LIMIT")? {
		Some(limit) => Ok(limit),
		None => Ok(num_cpus::get()),
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn empty_to_none_collapses_empty_string() {
		assert_eq!(empty_to_none(Some("".to_string())), None);
		assert_eq!(empty_to_none(Some("x".to_string())), Some("x".to_string()));
	}

	#[test]
	fn validate_uri_adds_default_scheme() {
		assert_eq!(validate_uri(Some("ca.internal:8443".to_string())).unwrap(), Some("https://ca.internal:8443".to_string()));
	}
}
