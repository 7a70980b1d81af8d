//! Durable score outbox.
//!
//! Device writes land here first; a background worker claims rows per
//! `(user, section, patrol)` tuple, folds the deltas into one absolute
//! upstream write, and retries transient failures with exponential
//! backoff. A revoked grant freezes the user's rows until re-enrollment.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::db::{device_repo, outbox_repo};
use crate::error::{AppError, Result};
use crate::metrics::{OUTBOX_ENTRIES_TOTAL, OUTBOX_PENDING_DEPTH};
use crate::osm::refresh::{needs_refresh, refresh_with, RefreshOutcome};
use crate::osm::{redact_token, OsmClient};
use crate::services::score_update::{Outcome, ScoreUpdateRequest, ScoreUpdateService};

/// Tuples examined per worker pass.
const CLAIM_BATCH: i64 = 100;

/// Retry backoff: 60 s doubling per attempt, capped at one hour.
pub fn backoff_delay(attempt_count: i32) -> chrono::Duration {
    let attempt = attempt_count.max(1) as u32;
    let secs = 60u64
        .saturating_mul(1u64 << (attempt - 1).min(10))
        .min(3600);
    chrono::Duration::seconds(secs as i64)
}

#[derive(Debug, Clone, Deserialize)]
pub struct OutboxEnqueueItem {
    #[serde(alias = "patrolId")]
    pub patrol_id: String,
    pub delta: i64,
    pub idempotency_key: String,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum EnqueueOutcome {
    Queued { id: i64 },
    Duplicate,
}

#[derive(Debug, Clone, Serialize)]
pub struct EnqueueResult {
    pub patrol_id: String,
    #[serde(flatten)]
    pub outcome: EnqueueOutcome,
}

#[derive(Clone)]
pub struct OutboxService {
    db: PgPool,
}

impl OutboxService {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }

    /// Queue deltas, rejecting idempotency keys already seen (exact match
    /// or shared base prefix).
    pub async fn enqueue(
        &self,
        osm_user_id: i64,
        section_id: i64,
        items: &[OutboxEnqueueItem],
    ) -> Result<Vec<EnqueueResult>> {
        let mut results = Vec::with_capacity(items.len());
        for item in items {
            if item.idempotency_key.trim().is_empty() {
                return Err(AppError::Validation("idempotency_key is required".into()));
            }
            let outcome = if outbox_repo::key_already_seen(
                &self.db,
                osm_user_id,
                &item.idempotency_key,
            )
            .await?
            {
                debug!(key = %item.idempotency_key, "Duplicate outbox submission ignored");
                OUTBOX_ENTRIES_TOTAL.with_label_values(&["duplicate"]).inc();
                EnqueueOutcome::Duplicate
            } else {
                let id = outbox_repo::insert(
                    &self.db,
                    osm_user_id,
                    section_id,
                    &item.patrol_id,
                    item.delta,
                    &item.idempotency_key,
                )
                .await?;
                OUTBOX_ENTRIES_TOTAL.with_label_values(&["created"]).inc();
                EnqueueOutcome::Queued { id }
            };
            results.push(EnqueueResult {
                patrol_id: item.patrol_id.clone(),
                outcome,
            });
        }
        Ok(results)
    }

    /// Un-applied delta per patrol, for optimistic display.
    pub async fn pending_deltas_by_section(
        &self,
        osm_user_id: i64,
        section_id: i64,
    ) -> Result<HashMap<String, i64>> {
        Ok(
            outbox_repo::pending_deltas_by_section(&self.db, osm_user_id, section_id)
                .await?
                .into_iter()
                .collect(),
        )
    }
}

/// Background worker: single task per process; horizontal scaling rides on
/// the SKIP LOCKED claim.
pub struct OutboxWorker {
    db: PgPool,
    osm: Arc<OsmClient>,
    updates: ScoreUpdateService,
    interval: Duration,
}

impl OutboxWorker {
    pub fn new(
        db: PgPool,
        osm: Arc<OsmClient>,
        updates: ScoreUpdateService,
        interval: Duration,
    ) -> Self {
        Self {
            db,
            osm,
            updates,
            interval,
        }
    }

    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        info!(
            interval_secs = self.interval.as_secs(),
            "Outbox worker starting"
        );
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("Outbox worker shutting down");
                    break;
                }
                _ = tokio::time::sleep(self.interval) => {
                    if let Err(e) = self.pass().await {
                        error!("Outbox worker pass failed: {}", e);
                    }
                }
            }
        }
    }

    /// One pass: claim every due tuple and try to drain it.
    async fn pass(&self) -> Result<()> {
        let tuples = outbox_repo::select_due_tuples(&self.db, CLAIM_BATCH).await?;
        if tuples.is_empty() {
            self.update_depth_gauge().await;
            return Ok(());
        }

        debug!(tuples = tuples.len(), "Outbox worker claiming work");

        // One token resolution per user per pass.
        let mut tokens: HashMap<i64, Option<String>> = HashMap::new();

        for (osm_user_id, section_id, patrol_id) in tuples {
            let token = match tokens.get(&osm_user_id) {
                Some(cached) => cached.clone(),
                None => {
                    let resolved = self.resolve_user_token(osm_user_id).await?;
                    tokens.insert(osm_user_id, resolved.clone());
                    resolved
                }
            };
            let Some(token) = token else { continue };

            self.drain_tuple(osm_user_id, &token, section_id, &patrol_id)
                .await?;
        }

        self.update_depth_gauge().await;
        Ok(())
    }

    async fn drain_tuple(
        &self,
        osm_user_id: i64,
        access_token: &str,
        section_id: i64,
        patrol_id: &str,
    ) -> Result<()> {
        // Claim inside a transaction; SKIP LOCKED keeps parallel workers
        // off each other's rows.
        let mut tx = self.db.begin().await?;
        let rows = outbox_repo::claim_tuple(&mut tx, osm_user_id, section_id, patrol_id).await?;
        tx.commit().await?;

        if rows.is_empty() {
            return Ok(());
        }

        let ids: Vec<i64> = rows.iter().map(|r| r.id).collect();
        let total_delta: i64 = rows.iter().map(|r| r.points_delta).sum();
        let max_attempt = rows.iter().map(|r| r.attempt_count).max().unwrap_or(1);

        debug!(
            user = osm_user_id,
            section = section_id,
            patrol = patrol_id,
            rows = ids.len(),
            delta = total_delta,
            "Applying aggregated outbox delta"
        );

        let request = [ScoreUpdateRequest {
            patrol_id: patrol_id.to_string(),
            delta: total_delta,
        }];
        let applied = self
            .updates
            .update(osm_user_id, access_token, section_id, &request)
            .await;

        match applied {
            Ok(results) => {
                let outcome = results
                    .into_iter()
                    .next()
                    .map(|r| r.outcome)
                    .unwrap_or(Outcome::Permanent {
                        reason: "empty result from write path".into(),
                    });
                self.settle(osm_user_id, &ids, max_attempt, outcome).await
            }
            Err(err) => {
                let outcome = match &err {
                    AppError::UserBlocked { retry_after, .. } => Outcome::Temporary {
                        retry_after: (*retry_after).max(1) as u64,
                        reason: "upstream rate limit".into(),
                    },
                    AppError::ServiceBlocked => Outcome::Temporary {
                        retry_after: 600,
                        reason: "upstream service blocked".into(),
                    },
                    AppError::GrantRevoked => Outcome::AuthRevoked {
                        reason: "upstream grant revoked".into(),
                    },
                    AppError::NotInTerm => Outcome::Temporary {
                        retry_after: 3600,
                        reason: "no active term".into(),
                    },
                    other => Outcome::Temporary {
                        retry_after: 60,
                        reason: other.to_string(),
                    },
                };
                self.settle(osm_user_id, &ids, max_attempt, outcome).await
            }
        }
    }

    async fn settle(
        &self,
        osm_user_id: i64,
        ids: &[i64],
        max_attempt: i32,
        outcome: Outcome,
    ) -> Result<()> {
        match outcome {
            Outcome::Success { .. } => {
                outbox_repo::mark_completed(&self.db, ids).await?;
                OUTBOX_ENTRIES_TOTAL
                    .with_label_values(&["completed"])
                    .inc_by(ids.len() as u64);
            }
            Outcome::Temporary {
                retry_after,
                reason,
            } => {
                let backoff = backoff_delay(max_attempt);
                let floor = chrono::Duration::seconds(retry_after as i64);
                let next_retry: DateTime<Utc> = Utc::now() + backoff.max(floor);
                outbox_repo::mark_failed(&self.db, ids, &reason, next_retry).await?;
                OUTBOX_ENTRIES_TOTAL
                    .with_label_values(&["failed"])
                    .inc_by(ids.len() as u64);
            }
            Outcome::AuthRevoked { .. } => {
                let frozen = outbox_repo::quarantine_user(&self.db, osm_user_id).await?;
                warn!(
                    user = osm_user_id,
                    frozen = frozen,
                    "Quarantined outbox entries after revocation"
                );
                OUTBOX_ENTRIES_TOTAL
                    .with_label_values(&["auth_revoked"])
                    .inc_by(frozen);
            }
            Outcome::Permanent { reason } => {
                // Keep retrying on the long backoff; retention reaps rows
                // that never recover.
                let next_retry = Utc::now() + backoff_delay(max_attempt.max(6));
                outbox_repo::mark_failed(&self.db, ids, &reason, next_retry).await?;
                OUTBOX_ENTRIES_TOTAL
                    .with_label_values(&["failed"])
                    .inc_by(ids.len() as u64);
            }
        }
        Ok(())
    }

    /// Find token material for a user, refreshing when near expiry. `None`
    /// parks the user's rows (quarantine or transient skip).
    async fn resolve_user_token(&self, osm_user_id: i64) -> Result<Option<String>> {
        let Some(device) = device_repo::find_authorized_by_osm_user(&self.db, osm_user_id).await?
        else {
            warn!(
                user = osm_user_id,
                "No authorized enrollment for queued work; quarantining"
            );
            let frozen = outbox_repo::quarantine_user(&self.db, osm_user_id).await?;
            OUTBOX_ENTRIES_TOTAL
                .with_label_values(&["auth_revoked"])
                .inc_by(frozen);
            return Ok(None);
        };

        let (Some(access_token), Some(refresh_token), Some(expiry)) = (
            device.osm_access_token.clone(),
            device.osm_refresh_token.clone(),
            device.osm_token_expiry,
        ) else {
            // Inconsistent row; treat like a revocation.
            let frozen = outbox_repo::quarantine_user(&self.db, osm_user_id).await?;
            OUTBOX_ENTRIES_TOTAL
                .with_label_values(&["auth_revoked"])
                .inc_by(frozen);
            return Ok(None);
        };

        if !needs_refresh(expiry, Utc::now()) {
            return Ok(Some(access_token));
        }

        let db = self.db.clone();
        let device_code = device.device_code.clone();
        let db_revoke = self.db.clone();
        let device_code_revoke = device.device_code.clone();

        let outcome = refresh_with(
            &self.osm,
            &refresh_token,
            &redact_token(&device.device_code),
            move |access, refresh, expiry| async move {
                device_repo::update_osm_tokens(&db, &device_code, &access, &refresh, expiry)
                    .await
                    .map_err(AppError::from)
            },
            move || async move {
                device_repo::revoke(&db_revoke, &device_code_revoke)
                    .await
                    .map_err(AppError::from)
            },
        )
        .await;

        match outcome {
            RefreshOutcome::Refreshed(token) => Ok(Some(token)),
            RefreshOutcome::TokenRevoked => {
                let frozen = outbox_repo::quarantine_user(&self.db, osm_user_id).await?;
                warn!(
                    user = osm_user_id,
                    frozen = frozen,
                    "Grant revoked during outbox drain; rows quarantined"
                );
                OUTBOX_ENTRIES_TOTAL
                    .with_label_values(&["auth_revoked"])
                    .inc_by(frozen);
                Ok(None)
            }
            // Transient: leave rows pending for the next pass.
            RefreshOutcome::RefreshFailed => Ok(None),
        }
    }

    async fn update_depth_gauge(&self) {
        if let Ok(depth) = outbox_repo::pending_depth(&self.db).await {
            OUTBOX_PENDING_DEPTH.set(depth);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_from_sixty_seconds() {
        assert_eq!(backoff_delay(1).num_seconds(), 60);
        assert_eq!(backoff_delay(2).num_seconds(), 120);
        assert_eq!(backoff_delay(3).num_seconds(), 240);
        assert_eq!(backoff_delay(4).num_seconds(), 480);
        assert_eq!(backoff_delay(5).num_seconds(), 960);
        assert_eq!(backoff_delay(6).num_seconds(), 1920);
    }

    #[test]
    fn backoff_caps_at_one_hour() {
        assert_eq!(backoff_delay(7).num_seconds(), 3600);
        assert_eq!(backoff_delay(30).num_seconds(), 3600);
    }

    #[test]
    fn backoff_treats_zero_attempts_as_first() {
        assert_eq!(backoff_delay(0).num_seconds(), 60);
    }

    #[test]
    fn enqueue_outcome_serializes_with_status_tag() {
        let json = serde_json::to_value(EnqueueResult {
            patrol_id: "101".into(),
            outcome: EnqueueOutcome::Queued { id: 7 },
        })
        .unwrap();
        assert_eq!(json["status"], "queued");
        assert_eq!(json["id"], 7);

        let json = serde_json::to_value(EnqueueResult {
            patrol_id: "101".into(),
            outcome: EnqueueOutcome::Duplicate,
        })
        .unwrap();
        assert_eq!(json["status"], "duplicate");
    }

    #[test]
    fn enqueue_item_accepts_camel_case() {
        let parsed: OutboxEnqueueItem = serde_json::from_str(
            r#"{"patrolId": "101", "delta": 1, "idempotency_key": "k1"}"#,
        )
        .unwrap();
        assert_eq!(parsed.patrol_id, "101");
        assert_eq!(parsed.idempotency_key, "k1");
    }
}
