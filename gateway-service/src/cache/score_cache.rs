//! Patrol-score cache.
//!
//! Freshness lives *inside* the cached value (`valid_until`), while the
//! Redis TTL is the much longer fallback-retention window. A stale entry
//! is still a good answer when the upstream is down or blocking.

use chrono::{DateTime, Utc};
use redis_utils::{with_timeout, Keyspace, SharedConnectionManager};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::{AppError, Result};
use crate::metrics::SCORE_CACHE_EVENTS;
use crate::models::{Patrol, RateLimitState};

/// 15 s micro-cache for the ad-hoc branch.
const ADHOC_TTL_SECS: u64 = 15;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedPatrolScores {
    pub patrols: Vec<Patrol>,
    pub cached_at: DateTime<Utc>,
    pub valid_until: DateTime<Utc>,
    pub rate_limit_state: RateLimitState,
}

impl CachedPatrolScores {
    pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        now < self.valid_until
    }
}

#[derive(Clone)]
pub struct ScoreCache {
    redis: SharedConnectionManager,
    keyspace: Keyspace,
    fallback_ttl: Duration,
}

impl ScoreCache {
    pub fn new(
        redis: SharedConnectionManager,
        keyspace: Keyspace,
        fallback_ttl_secs: u64,
    ) -> Self {
        Self {
            redis,
            keyspace,
            fallback_ttl: Duration::from_secs(fallback_ttl_secs),
        }
    }

    fn scores_key(&self, osm_user_id: i64, section_id: i64) -> String {
        self.keyspace
            .key(&format!("patrol_scores:{osm_user_id}:{section_id}"))
    }

    fn adhoc_key(&self, osm_user_id: i64) -> String {
        self.keyspace.key(&format!("adhoc_scores:{osm_user_id}"))
    }

    /// Read whatever is cached, fresh or stale; the caller decides what a
    /// past `valid_until` means.
    pub async fn read(
        &self,
        osm_user_id: i64,
        section_id: i64,
    ) -> Result<Option<CachedPatrolScores>> {
        let key = self.scores_key(osm_user_id, section_id);
        let mut conn = self.redis.lock().await.clone();

        let raw: Option<String> = with_timeout(async {
            redis::cmd("GET").arg(&key).query_async(&mut conn).await
        })
        .await
        .map_err(|e| {
            SCORE_CACHE_EVENTS.with_label_values(&["error"]).inc();
            AppError::Redis(e)
        })?;

        match raw {
            Some(data) => {
                let cached: CachedPatrolScores = serde_json::from_str(&data).map_err(|e| {
                    warn!("Discarding undecodable patrol score cache entry: {}", e);
                    SCORE_CACHE_EVENTS.with_label_values(&["error"]).inc();
                    AppError::Internal(format!("cache deserialization error: {e}"))
                })?;
                debug!(user = osm_user_id, section = section_id, "Score cache hit");
                Ok(Some(cached))
            }
            None => {
                debug!(user = osm_user_id, section = section_id, "Score cache miss");
                SCORE_CACHE_EVENTS.with_label_values(&["miss"]).inc();
                Ok(None)
            }
        }
    }

    /// Write a fresh entry. `ttl` is the governor-dictated validity window;
    /// the Redis key itself is retained for the whole fallback window.
    pub async fn write(
        &self,
        osm_user_id: i64,
        section_id: i64,
        patrols: Vec<Patrol>,
        ttl: Duration,
        rate_limit_state: RateLimitState,
    ) -> Result<CachedPatrolScores> {
        let now = Utc::now();
        let entry = CachedPatrolScores {
            patrols,
            cached_at: now,
            valid_until: now + chrono::Duration::seconds(ttl.as_secs() as i64),
            rate_limit_state,
        };
        self.store(
            &self.scores_key(osm_user_id, section_id),
            &entry,
            self.fallback_ttl,
        )
        .await?;
        Ok(entry)
    }

    /// Re-stamp a stale entry so it keeps serving through a known block
    /// window, and advertise the degradation.
    pub async fn extend_validity(
        &self,
        osm_user_id: i64,
        section_id: i64,
        mut entry: CachedPatrolScores,
        new_valid_until: DateTime<Utc>,
        rate_limit_state: RateLimitState,
    ) -> Result<CachedPatrolScores> {
        if new_valid_until > entry.valid_until {
            entry.valid_until = new_valid_until;
        }
        entry.rate_limit_state = rate_limit_state;
        self.store(
            &self.scores_key(osm_user_id, section_id),
            &entry,
            self.fallback_ttl,
        )
        .await?;
        Ok(entry)
    }

    pub async fn read_adhoc(&self, osm_user_id: i64) -> Result<Option<CachedPatrolScores>> {
        let key = self.adhoc_key(osm_user_id);
        let mut conn = self.redis.lock().await.clone();
        let raw: Option<String> = with_timeout(async {
            redis::cmd("GET").arg(&key).query_async(&mut conn).await
        })
        .await
        .map_err(AppError::Redis)?;
        Ok(raw.and_then(|data| serde_json::from_str(&data).ok()))
    }

    pub async fn write_adhoc(
        &self,
        osm_user_id: i64,
        patrols: Vec<Patrol>,
    ) -> Result<CachedPatrolScores> {
        let now = Utc::now();
        let entry = CachedPatrolScores {
            patrols,
            cached_at: now,
            valid_until: now + chrono::Duration::seconds(ADHOC_TTL_SECS as i64),
            rate_limit_state: RateLimitState::None,
        };
        self.store(
            &self.adhoc_key(osm_user_id),
            &entry,
            Duration::from_secs(ADHOC_TTL_SECS),
        )
        .await?;
        Ok(entry)
    }

    /// Drop the ad-hoc micro-cache after a write so the next read sees the
    /// new score immediately.
    pub async fn invalidate_adhoc(&self, osm_user_id: i64) -> Result<()> {
        let key = self.adhoc_key(osm_user_id);
        let mut conn = self.redis.lock().await.clone();
        with_timeout(async {
            redis::cmd("DEL").arg(&key).query_async::<_, ()>(&mut conn).await
        })
        .await
        .map_err(AppError::Redis)?;
        Ok(())
    }

    async fn store(
        &self,
        key: &str,
        entry: &CachedPatrolScores,
        retention: Duration,
    ) -> Result<()> {
        let data = serde_json::to_string(entry)?;
        let mut conn = self.redis.lock().await.clone();
        with_timeout(async {
            redis::cmd("SET")
                .arg(key)
                .arg(&data)
                .arg("EX")
                .arg(retention.as_secs())
                .query_async::<_, ()>(&mut conn)
                .await
        })
        .await
        .map_err(|e| {
            warn!("Failed to write patrol score cache: {}", e);
            SCORE_CACHE_EVENTS.with_label_values(&["error"]).inc();
            AppError::Redis(e)
        })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn freshness_is_decided_by_valid_until() {
        let now = Utc::now();
        let entry = CachedPatrolScores {
            patrols: vec![],
            cached_at: now - chrono::Duration::minutes(10),
            valid_until: now + chrono::Duration::minutes(1),
            rate_limit_state: RateLimitState::None,
        };
        assert!(entry.is_fresh(now));
        assert!(!entry.is_fresh(now + chrono::Duration::minutes(2)));
    }

    #[test]
    fn cached_entry_round_trips_through_json() {
        let now = Utc::now();
        let entry = CachedPatrolScores {
            patrols: vec![Patrol {
                id: "101".into(),
                name: "Eagles".into(),
                score: 42,
            }],
            cached_at: now,
            valid_until: now + chrono::Duration::minutes(5),
            rate_limit_state: RateLimitState::Degraded,
        };
        let json = serde_json::to_string(&entry).unwrap();
        let back: CachedPatrolScores = serde_json::from_str(&json).unwrap();
        assert_eq!(back.patrols, entry.patrols);
        assert_eq!(back.rate_limit_state, RateLimitState::Degraded);
        assert_eq!(back.valid_until, entry.valid_until);
    }
}
