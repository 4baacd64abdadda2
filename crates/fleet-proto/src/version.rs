use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// A semantic `MAJOR.MINOR.PATCH` version, as advertised by a capability.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Version {
	pub major: u32,
	pub minor: u32,
	pub patch: u32,
}

impl Version {
	pub fn new(major: u32, minor: u32, patch: u32) -> Self {
		Self { major, minor, patch }
	}

	/// `self` can satisfy a request for `requested` if the major versions are
	/// identical and `self >= requested` on the minor.patch ordering.
	pub fn satisfies(&self, requested: &Version) -> bool {
		self.major == requested.major
			&& (self.minor, self.patch) >= (requested.minor, requested.patch)
	}
}

impl PartialOrd for Version {
	fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
		Some(self.cmp(other))
	}
}

impl Ord for Version {
	fn cmp(&self, other: &Self) -> Ordering {
		(self.major, self.minor, self.patch).cmp(&(other.major, other.minor, other.patch))
	}
}

impl fmt::Display for Version {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
	}
}

#[derive(Debug, thiserror::Error)]
#[error("invalid version {0:?}: expected MAJOR.MINOR.PATCH")]
pub struct InvalidVersion(pub String);

impl FromStr for Version {
	type Err = InvalidVersion;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let mut parts = s.split('.');
		let (Some(major), Some(minor), Some(patch), None) =
			(parts.next(), parts.next(), parts.next(), parts.next())
		else {
			return Err(InvalidVersion(s.to_string()));
		};
		let parse = |p: &str| p.parse::<u32>().map_err(|_| InvalidVersion(s.to_string()));
		Ok(Version {
			major: parse(major)?,
			minor: parse(minor)?,
			patch: parse(patch)?,
		})
	}
}

impl TryFrom<String> for Version {
	type Error = InvalidVersion;
	fn try_from(value: String) -> Result<Self, Self::Error> {
		value.parse()
	}
}

impl From<Version> for String {
	fn from(value: Version) -> Self {
		value.to_string()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn parses_valid() {
		let v: Version = "1.2.3".parse().unwrap();
		assert_eq!(v, Version::new(1, 2, 3));
	}

	#[test]
	fn rejects_malformed() {
		assert!("1.2".parse::<Version>().is_err());
		assert!("1.2.3.4".parse::<Version>().is_err());
		assert!("a.b.c".parse::<Version>().is_err());
		assert!("1.2.x".parse::<Version>().is_err());
	}

	#[test]
	fn satisfies_requires_equal_major_and_gte_minor_patch() {
		let advertised = Version::new(1, 2, 0);
		assert!(advertised.satisfies(&Version::new(1, 2, 0)));
		assert!(advertised.satisfies(&Version::new(1, 1, 9)));
		assert!(!advertised.satisfies(&Version::new(1, 3, 0)));
		assert!(!advertised.satisfies(&Version::new(2, 0, 0)));
	}

	#[test]
	fn display_round_trips() {
		let v = Version::new(4, 5, 6);
		assert_eq!(v.to_string().parse::<Version>().unwrap(), v);
	}
}
