use std::fmt;
use std::str::FromStr;

/// A peer identity encoded as a SAN URI of the form
/// `fleet://<trust-domain>/worker/<worker-id>` or `fleet://<trust-domain>/admin`.
///
/// This is the only identity format the CA issues and the only one the mTLS
/// verifiers accept; any other SAN URI shape is rejected at parse time.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Identity {
	Worker {
		trust_domain: String,
		worker_id: String,
	},
	Admin {
		trust_domain: String,
	},
	Controller {
		trust_domain: String,
	},
}

impl Identity {
	pub fn trust_domain(&self) -> &str {
		match self {
			Identity::Worker { trust_domain, .. } => trust_domain,
			Identity::Admin { trust_domain } => trust_domain,
			Identity::Controller { trust_domain } => trust_domain,
		}
	}

	pub fn worker_id(&self) -> Option<&str> {
		match self {
			Identity::Worker { worker_id, .. } => Some(worker_id),
			_ => None,
		}
	}

	pub fn is_admin(&self) -> bool {
		matches!(self, Identity::Admin { .. })
	}

	pub fn is_controller(&self) -> bool {
		matches!(self, Identity::Controller { .. })
	}
}

impl fmt::Display for Identity {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Identity::Worker {
				trust_domain,
				worker_id,
			} => write!(f, "fleet://{trust_domain}/worker/{worker_id}"),
			Identity::Admin { trust_domain } => write!(f, "fleet://{trust_domain}/admin"),
			Identity::Controller { trust_domain } => write!(f, "fleet://{trust_domain}/controller"),
		}
	}
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum IdentityParseError {
	#[error("identity URI {0:?} is missing the fleet:// scheme")]
	BadScheme(String),
	#[error("identity URI {0:?} is missing a trust domain")]
	MissingTrustDomain(String),
	#[error("identity URI {0:?} has an unrecognized path shape")]
	BadPath(String),
}

impl FromStr for Identity {
	type Err = IdentityParseError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let rest = s
			.strip_prefix("fleet://")
			.ok_or_else(|| IdentityParseError::BadScheme(s.to_string()))?;
		let mut parts = rest.splitn(2, '/');
		let trust_domain = parts.next().filter(|s| !s.is_empty());
		let Some(trust_domain) = trust_domain else {
			return Err(IdentityParseError::MissingTrustDomain(s.to_string()));
		};
		let path = parts.next().unwrap_or_default();
		match path.split_once('/') {
			Some(("worker", worker_id)) if !worker_id.is_empty() => Ok(Identity::Worker {
				trust_domain: trust_domain.to_string(),
				worker_id: worker_id.to_string(),
			}),
			_ if path == "admin" => Ok(Identity::Admin {
				trust_domain: trust_domain.to_string(),
			}),
			_ if path == "controller" => Ok(Identity::Controller {
				trust_domain: trust_domain.to_string(),
			}),
			_ => Err(IdentityParseError::BadPath(s.to_string())),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn round_trips_worker() {
		let id = Identity::Worker {
			trust_domain: "cluster.local".to_string(),
			worker_id: "w-1".to_string(),
		};
		assert_eq!(id.to_string().parse::<Identity>().unwrap(), id);
	}

	#[test]
	fn round_trips_admin() {
		let id = Identity::Admin {
			trust_domain: "cluster.local".to_string(),
		};
		assert_eq!(id.to_string().parse::<Identity>().unwrap(), id);
	}

	#[test]
	fn rejects_missing_scheme() {
		assert!(matches!(
			"http://cluster.local/admin".parse::<Identity>(),
			Err(IdentityParseError::BadScheme(_))
		));
	}

	#[test]
	fn rejects_unknown_path() {
		assert!(matches!(
			"fleet://cluster.local/nobody".parse::<Identity>(),
			Err(IdentityParseError::BadPath(_))
		));
	}
}
