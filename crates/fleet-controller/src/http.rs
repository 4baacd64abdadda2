use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::str::FromStr;

use bytes::Bytes;
use http_body_util::Full;

pub type Body = Full<Bytes>;
pub type Response = ::http::Response<Body>;

/// A bind target for a plaintext management listener (admin, readiness,
/// metrics). Distinguishes a localhost-only bind from a wildcard one so the
/// same `ADMIN_ADDR`/`READINESS_ADDR` parsing handles both `:PORT` shorthands
/// and full `host:port` overrides.
#[derive(Debug, Clone, Copy)]
pub enum Address {
	Localhost(bool, u16),
	SocketAddr(SocketAddr),
}

impl Address {
	pub fn new(ipv6_enabled: bool, s: &str) -> anyhow::Result<Self> {
		if let Some(port) = s.strip_prefix(':') {
			return Ok(Address::Localhost(ipv6_enabled, port.parse()?));
		}
		Ok(Address::SocketAddr(SocketAddr::from_str(s)?))
	}

	pub fn into_iter(self) -> impl Iterator<Item = SocketAddr> {
		match self {
			Address::Localhost(true, port) => vec![
				SocketAddr::new(IpAddr::V6(Ipv6Addr::LOCALHOST), port),
				SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port),
			]
			.into_iter(),
			Address::Localhost(false, port) => vec![SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)].into_iter(),
			Address::SocketAddr(a) => vec![a].into_iter(),
		}
	}
}

impl std::fmt::Display for Address {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			Address::Localhost(_, port) => write!(f, "localhost:{port}"),
			Address::SocketAddr(a) => write!(f, "{a}"),
		}
	}
}
