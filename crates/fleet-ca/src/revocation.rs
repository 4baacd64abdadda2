use std::collections::HashSet;
use std::sync::{Arc, RwLock};

/// A serial-number set consulted by the mTLS client-cert verifier on every
/// handshake. Populated by polling the CA's revocation feed; consulting it is
/// synchronous and lock-only so it can run inside rustls's verifier callback.
#[derive(Clone, Default)]
pub struct RevocationList {
	inner: Arc<RwLock<HashSet<String>>>,
}

impl RevocationList {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn is_revoked(&self, serial: &str) -> bool {
		self.inner.read().expect("revocation list lock poisoned").contains(serial)
	}

	pub fn replace(&self, serials: impl IntoIterator<Item = String>) {
		let mut guard = self.inner.write().expect("revocation list lock poisoned");
		guard.clear();
		guard.extend(serials);
	}

	pub fn revoke(&self, serial: String) {
		self.inner.write().expect("revocation list lock poisoned").insert(serial);
	}

	pub fn len(&self) -> usize {
		self.inner.read().expect("revocation list lock poisoned").len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn tracks_revoked_serials() {
		let list = RevocationList::new();
		assert!(!list.is_revoked("abc"));
		list.revoke("abc".to_string());
		assert!(list.is_revoked("abc"));
	}

	#[test]
	fn replace_resets_set() {
		let list = RevocationList::new();
		list.revoke("abc".to_string());
		list.replace(["def".to_string()]);
		assert!(!list.is_revoked("abc"));
		assert!(list.is_revoked("def"));
	}
}
