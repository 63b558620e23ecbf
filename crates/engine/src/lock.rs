//! Distributed mutexes over the KV store.
//!
//! A lock is a key holding a per-acquirer UUID with a wall-clock expiry, so
//! a crashed replica can never hold a lock for longer than the TTL.
//! Acquisition is atomic set-if-absent; release is compare-and-delete, so
//! releasing a lock someone else has since acquired is a no-op.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::Result;
use crate::kv::KvStore;

pub const ALERT_LOCK_TTL: Duration = Duration::from_secs(60);
pub const GROUP_LOCK_TTL: Duration = Duration::from_secs(30);

#[derive(Clone)]
pub struct LockManager {
	kv: Arc<dyn KvStore>,
}

impl LockManager {
	pub fn new(kv: Arc<dyn KvStore>) -> Self {
		Self { kv }
	}

	/// Non-blocking acquire; `None` means another holder has the lock.
	pub async fn try_acquire(&self, name: &str, ttl: Duration) -> Result<Option<LockGuard>> {
		let key = format!("lock:{name}");
		let holder = Uuid::new_v4().to_string();

		if self.kv.set_nx_ex(&key, &holder, ttl).await? {
			debug!(%key, "acquired lock");
			Ok(Some(LockGuard {
				kv: self.kv.clone(),
				key,
				holder,
			}))
		} else {
			debug!(%key, "lock is held elsewhere");
			Ok(None)
		}
	}

	/// Per-fingerprint lock guarding direct (non-grouped) sends.
	pub async fn try_acquire_alert(&self, fingerprint: &str) -> Result<Option<LockGuard>> {
		self.try_acquire(&format!("alert:{fingerprint}"), ALERT_LOCK_TTL)
			.await
	}

	/// Per-group lock giving one replica exclusive send rights.
	pub async fn try_acquire_group(&self, group_key: &str) -> Result<Option<LockGuard>> {
		self.try_acquire(&format!("group:{group_key}"), GROUP_LOCK_TTL)
			.await
	}
}

/// Held lock; release explicitly. If the holder crashes, the TTL bounds
/// how long the lock outlives it.
pub struct LockGuard {
	kv: Arc<dyn KvStore>,
	key: String,
	holder: String,
}

impl LockGuard {
	pub async fn release(self) {
		match self.kv.compare_and_delete(&self.key, &self.holder).await {
			Ok(true) => debug!(key = %self.key, "released lock"),
			Ok(false) => warn!(key = %self.key, "lock expired before release"),
			Err(err) => warn!(key = %self.key, "failed to release lock: {err}"),
		}
	}
}
