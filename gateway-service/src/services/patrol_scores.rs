//! Patrol-score read path.
//!
//! Cache first, upstream second, stale cache as the last line of defense.
//! Freshness is the governor's call (adaptive TTL from the remaining
//! quota); a stale entry is re-stamped to cover any known block window
//! rather than dropped.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::PgPool;
use std::sync::Arc;
use tracing::debug;

use crate::cache::{CachedPatrolScores, ScoreCache};
use crate::db::device_repo;
use crate::error::{AppError, Result};
use crate::metrics::SCORE_CACHE_EVENTS;
use crate::models::{DeviceAuthorization, Patrol, RateLimitState};
use crate::osm::OsmClient;
use crate::services::adhoc::AdhocService;

#[derive(Debug, Serialize)]
pub struct PatrolScoreResponse {
    pub patrols: Vec<Patrol>,
    pub from_cache: bool,
    pub cached_at: DateTime<Utc>,
    pub cache_expires_at: DateTime<Utc>,
    pub rate_limit_state: RateLimitState,
}

impl PatrolScoreResponse {
    fn from_entry(entry: CachedPatrolScores, from_cache: bool) -> Self {
        Self {
            patrols: entry.patrols,
            from_cache,
            cached_at: entry.cached_at,
            cache_expires_at: entry.valid_until,
            rate_limit_state: entry.rate_limit_state,
        }
    }
}

#[derive(Clone)]
pub struct PatrolScoreService {
    db: PgPool,
    cache: ScoreCache,
    osm: Arc<OsmClient>,
    adhoc: AdhocService,
}

impl PatrolScoreService {
    pub fn new(db: PgPool, cache: ScoreCache, osm: Arc<OsmClient>, adhoc: AdhocService) -> Self {
        Self {
            db,
            cache,
            osm,
            adhoc,
        }
    }

    /// Device read: term info is persisted on the device row.
    pub async fn get_for_device(
        &self,
        device: &DeviceAuthorization,
        access_token: &str,
    ) -> Result<PatrolScoreResponse> {
        let osm_user_id = device
            .osm_user_id
            .ok_or_else(|| AppError::Internal("authorized device without osm user".into()))?;
        let section_id = device
            .section_id
            .ok_or_else(|| AppError::Internal("authorized device without section".into()))?;
        self.get(osm_user_id, access_token, section_id, Some(device))
            .await
    }

    /// Admin read: the term is resolved from the profile on every refresh.
    pub async fn get_for_admin(
        &self,
        osm_user_id: i64,
        access_token: &str,
        section_id: i64,
    ) -> Result<PatrolScoreResponse> {
        self.get(osm_user_id, access_token, section_id, None).await
    }

    async fn get(
        &self,
        osm_user_id: i64,
        access_token: &str,
        section_id: i64,
        device: Option<&DeviceAuthorization>,
    ) -> Result<PatrolScoreResponse> {
        // Section 0 never touches the upstream.
        if section_id == 0 {
            let scores = self.adhoc.scores(osm_user_id).await?;
            return Ok(PatrolScoreResponse::from_entry(
                scores.entry,
                scores.from_cache,
            ));
        }

        let now = Utc::now();
        let stale = match self.cache.read(osm_user_id, section_id).await {
            Ok(Some(cached)) if cached.is_fresh(now) => {
                SCORE_CACHE_EVENTS.with_label_values(&["hit"]).inc();
                return Ok(PatrolScoreResponse::from_entry(cached, true));
            }
            Ok(other) => other,
            // A cache outage must not take the read path down.
            Err(_) => None,
        };

        match self
            .fetch_fresh(osm_user_id, access_token, section_id, device)
            .await
        {
            Ok(entry) => Ok(PatrolScoreResponse::from_entry(entry, false)),
            Err(err) => {
                self.stale_fallback(osm_user_id, section_id, stale, err)
                    .await
            }
        }
    }

    /// Term discovery, upstream fetch, and cache write.
    async fn fetch_fresh(
        &self,
        osm_user_id: i64,
        access_token: &str,
        section_id: i64,
        device: Option<&DeviceAuthorization>,
    ) -> Result<CachedPatrolScores> {
        let term_id = self
            .resolve_term(osm_user_id, access_token, section_id, device)
            .await?;

        let (patrols, info) = self
            .osm
            .fetch_patrols(access_token, osm_user_id, section_id, &term_id)
            .await?;

        let governor = self.osm.governor();
        let (ttl, state) = match info.remaining {
            Some(remaining) => (
                governor.ttl_for_remaining(remaining),
                governor.state_for_remaining(remaining),
            ),
            None => (governor.default_ttl(), RateLimitState::None),
        };

        self.cache
            .write(osm_user_id, section_id, patrols, ttl, state)
            .await
    }

    async fn resolve_term(
        &self,
        osm_user_id: i64,
        access_token: &str,
        section_id: i64,
        device: Option<&DeviceAuthorization>,
    ) -> Result<String> {
        let now = Utc::now();
        if let Some(device) = device {
            if !device.term_needs_refresh(now) {
                if let Some(term_id) = &device.term_id {
                    return Ok(term_id.clone());
                }
            }
        }

        let profile = self
            .osm
            .fetch_profile(access_token, Some(osm_user_id))
            .await?;
        let term = profile
            .active_term(section_id, now.date_naive())
            .ok_or(AppError::NotInTerm)?;

        if let Some(device) = device {
            device_repo::update_term(&self.db, &device.device_code, &term.term_id, term.end_date)
                .await?;
        }

        debug!(
            user = osm_user_id,
            section = section_id,
            term = %term.term_id,
            "Resolved active term"
        );
        Ok(term.term_id.clone())
    }

    /// Upstream failed: serve the stale entry when one exists, re-stamped
    /// so it stays valid across the known block window.
    async fn stale_fallback(
        &self,
        osm_user_id: i64,
        section_id: i64,
        stale: Option<CachedPatrolScores>,
        err: AppError,
    ) -> Result<PatrolScoreResponse> {
        let Some(entry) = stale else {
            return Err(err);
        };

        let now = Utc::now();
        let (state, extend_to) = match &err {
            AppError::UserBlocked { retry_after, .. } => (
                RateLimitState::UserTemporaryBlock,
                now + chrono::Duration::seconds((*retry_after).max(1)),
            ),
            AppError::ServiceBlocked => {
                let until = self
                    .osm
                    .governor()
                    .service_blocked_until()
                    .await
                    .ok()
                    .flatten()
                    .unwrap_or_else(|| now + chrono::Duration::seconds(3600));
                (RateLimitState::ServiceBlocked, until)
            }
            AppError::Upstream(_) | AppError::RefreshFailed => (
                RateLimitState::Degraded,
                now + chrono::Duration::seconds(60),
            ),
            // Revocation, missing term, and local faults are not masked by
            // stale data.
            _ => return Err(err),
        };

        SCORE_CACHE_EVENTS.with_label_values(&["stale_hit"]).inc();
        let entry = self
            .cache
            .extend_validity(osm_user_id, section_id, entry, extend_to, state)
            .await?;
        Ok(PatrolScoreResponse::from_entry(entry, true))
    }
}
