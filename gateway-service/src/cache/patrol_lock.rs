//! Per-patrol write leases.
//!
//! `SET NX EX` with a per-invocation nonce; release goes through a Lua
//! compare-and-delete so only the holder can release. The 60 s TTL frees
//! the lease if a holder crashes mid-write.

use rand::RngCore;
use redis_utils::{with_timeout, Keyspace, SharedConnectionManager};
use tracing::debug;

use crate::error::{AppError, Result};

/// Lease lifetime; generously above the 10 s upstream timeout.
pub const LOCK_TTL_SECS: u64 = 60;

/// Release only when the stored nonce is still ours.
const RELEASE_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

/// An acquired lease. Dropping it without `release` leaves expiry to Redis.
#[derive(Debug, Clone)]
pub struct PatrolLock {
    pub key: String,
    pub nonce: String,
}

#[derive(Clone)]
pub struct PatrolLockManager {
    redis: SharedConnectionManager,
    keyspace: Keyspace,
}

impl PatrolLockManager {
    pub fn new(redis: SharedConnectionManager, keyspace: Keyspace) -> Self {
        Self { redis, keyspace }
    }

    fn lock_key(&self, section_id: i64, patrol_id: &str) -> String {
        self.keyspace
            .key(&format!("patrol:lock:{section_id}:{patrol_id}"))
    }

    fn new_nonce() -> String {
        let mut bytes = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut bytes);
        hex::encode(bytes)
    }

    /// Try to take the lease. `None` means somebody else holds it.
    pub async fn acquire(&self, section_id: i64, patrol_id: &str) -> Result<Option<PatrolLock>> {
        let key = self.lock_key(section_id, patrol_id);
        let nonce = Self::new_nonce();
        let mut conn = self.redis.lock().await.clone();

        let acquired: Option<String> = with_timeout(async {
            redis::cmd("SET")
                .arg(&key)
                .arg(&nonce)
                .arg("NX")
                .arg("EX")
                .arg(LOCK_TTL_SECS)
                .query_async(&mut conn)
                .await
        })
        .await
        .map_err(AppError::Redis)?;

        if acquired.is_some() {
            debug!(key = %key, "Acquired patrol lock");
            Ok(Some(PatrolLock { key, nonce }))
        } else {
            debug!(key = %key, "Patrol lock contended");
            Ok(None)
        }
    }

    /// Compare-and-delete release. Returns false when the lease had already
    /// expired or was taken over.
    pub async fn release(&self, lock: &PatrolLock) -> Result<bool> {
        let mut conn = self.redis.lock().await.clone();
        let script = redis::Script::new(RELEASE_SCRIPT);
        let deleted: i64 = with_timeout(async {
            script
                .key(&lock.key)
                .arg(&lock.nonce)
                .invoke_async(&mut conn)
                .await
        })
        .await
        .map_err(AppError::Redis)?;
        Ok(deleted == 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_key_includes_section_and_patrol() {
        let ks = Keyspace::new("osmgw");
        // Exercise only the key construction; no Redis involved.
        let key = ks.key(&format!("patrol:lock:{}:{}", 1001, "101"));
        assert_eq!(key, "osmgw:patrol:lock:1001:101");
    }

    #[test]
    fn release_script_is_compare_and_delete() {
        assert!(RELEASE_SCRIPT.contains("GET"));
        assert!(RELEASE_SCRIPT.contains("DEL"));
        assert!(RELEASE_SCRIPT.contains("ARGV[1]"));
    }

    #[test]
    fn nonces_are_unique_per_invocation() {
        let a = PatrolLockManager::new_nonce();
        let b = PatrolLockManager::new_nonce();
        assert_ne!(a, b);
        assert_eq!(a.len(), 32);
    }
}
