//! Ad-hoc branch: devices enrolled with section 0 never touch the
//! upstream. Scores live in Postgres with a 15 s Redis micro-cache in
//! front.

use sqlx::PgPool;

use crate::cache::{CachedPatrolScores, ScoreCache};
use crate::db::adhoc_repo;
use crate::error::Result;

#[derive(Clone)]
pub struct AdhocService {
    db: PgPool,
    cache: ScoreCache,
}

/// Scores plus where they came from.
pub struct AdhocScores {
    pub entry: CachedPatrolScores,
    pub from_cache: bool,
}

impl AdhocService {
    pub fn new(db: PgPool, cache: ScoreCache) -> Self {
        Self { db, cache }
    }

    pub async fn scores(&self, osm_user_id: i64) -> Result<AdhocScores> {
        let now = chrono::Utc::now();
        if let Some(cached) = self.cache.read_adhoc(osm_user_id).await? {
            if cached.is_fresh(now) {
                return Ok(AdhocScores {
                    entry: cached,
                    from_cache: true,
                });
            }
        }

        let patrols = adhoc_repo::list(&self.db, osm_user_id).await?;
        let entry = self.cache.write_adhoc(osm_user_id, patrols).await?;
        Ok(AdhocScores {
            entry,
            from_cache: false,
        })
    }

    /// Apply a delta; `None` means the patrol does not exist.
    pub async fn apply_delta(
        &self,
        osm_user_id: i64,
        patrol_id: &str,
        delta: i64,
    ) -> Result<Option<i64>> {
        let new_score = adhoc_repo::apply_delta(&self.db, osm_user_id, patrol_id, delta).await?;
        if new_score.is_some() {
            // Drop the micro-cache so the next poll sees the new value.
            let _ = self.cache.invalidate_adhoc(osm_user_id).await;
        }
        Ok(new_score)
    }
}
