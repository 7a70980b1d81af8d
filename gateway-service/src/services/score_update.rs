//! Direct score-write path.
//!
//! Used by the admin UI (immediate feedback) and by the outbox worker
//! (durable path). The upstream endpoint is an absolute setter, so the
//! read-modify-write is guarded by per-patrol Redis leases, and a single
//! upstream failure abandons the remaining requests with a templated
//! outcome.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;

use crate::cache::{PatrolLock, PatrolLockManager};
use crate::error::{AppError, Result};
use crate::osm::{OsmClient, OsmError};
use crate::services::adhoc::AdhocService;

/// Lock contention is reported as retryable after roughly half the lease.
const LOCK_RETRY_AFTER_SECS: u64 = 30;

#[derive(Debug, Clone, Deserialize)]
pub struct ScoreUpdateRequest {
    #[serde(alias = "patrolId")]
    pub patrol_id: String,
    pub delta: i64,
}

/// Per-item outcome, tagged for the admin UI.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Outcome {
    Success { new_score: i64 },
    Temporary { retry_after: u64, reason: String },
    AuthRevoked { reason: String },
    Permanent { reason: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct UpdateResult {
    pub patrol_id: String,
    #[serde(flatten)]
    pub outcome: Outcome,
}

/// Template outcome for a request abandoned because an earlier one failed.
pub fn outcome_from_error(err: &OsmError) -> Outcome {
    match err {
        OsmError::UserBlocked { retry_after } => Outcome::Temporary {
            retry_after: (*retry_after).max(1) as u64,
            reason: "upstream rate limit".into(),
        },
        OsmError::ServiceBlocked => Outcome::Temporary {
            retry_after: 60,
            reason: "upstream service blocked".into(),
        },
        OsmError::Network(e) => Outcome::Temporary {
            retry_after: 30,
            reason: format!("network error: {e}"),
        },
        OsmError::Http { status, .. } if *status >= 500 => Outcome::Temporary {
            retry_after: 30,
            reason: format!("upstream HTTP {status}"),
        },
        OsmError::Unauthorized => Outcome::AuthRevoked {
            reason: "upstream grant revoked".into(),
        },
        OsmError::Http { status, .. } => Outcome::Permanent {
            reason: format!("upstream HTTP {status}"),
        },
        OsmError::Decode(e) => Outcome::Permanent {
            reason: format!("unintelligible upstream response: {e}"),
        },
    }
}

#[derive(Clone)]
pub struct ScoreUpdateService {
    osm: Arc<OsmClient>,
    locks: PatrolLockManager,
    adhoc: AdhocService,
}

impl ScoreUpdateService {
    pub fn new(osm: Arc<OsmClient>, locks: PatrolLockManager, adhoc: AdhocService) -> Self {
        Self { osm, locks, adhoc }
    }

    /// Apply the requests in order against one section. Outcomes line up
    /// with the input; idempotency is the caller's concern on this path.
    pub async fn update(
        &self,
        osm_user_id: i64,
        access_token: &str,
        section_id: i64,
        requests: &[ScoreUpdateRequest],
    ) -> Result<Vec<UpdateResult>> {
        if requests.is_empty() {
            return Ok(Vec::new());
        }

        if section_id == 0 {
            return self.update_adhoc(osm_user_id, requests).await;
        }

        // Resolve the active term; no term, no writes.
        let profile = self
            .osm
            .fetch_profile(access_token, Some(osm_user_id))
            .await?;
        let term = profile
            .active_term(section_id, chrono::Utc::now().date_naive())
            .ok_or(AppError::NotInTerm)?
            .term_id
            .clone();

        // One lease per distinct patrol; the ones we miss get a retryable
        // outcome without touching the upstream.
        let mut locks: HashMap<String, Option<PatrolLock>> = HashMap::new();
        for request in requests {
            if !locks.contains_key(&request.patrol_id) {
                let lock = self.locks.acquire(section_id, &request.patrol_id).await?;
                locks.insert(request.patrol_id.clone(), lock);
            }
        }

        let results = self
            .apply_with_locks(osm_user_id, access_token, section_id, &term, requests, &locks)
            .await;

        // Leases are always released, pass or fail, and only by the owner.
        for lock in locks.values().flatten() {
            if let Err(e) = self.locks.release(lock).await {
                warn!("Failed to release patrol lock {}: {}", lock.key, e);
            }
        }

        results
    }

    async fn apply_with_locks(
        &self,
        osm_user_id: i64,
        access_token: &str,
        section_id: i64,
        term_id: &str,
        requests: &[ScoreUpdateRequest],
        locks: &HashMap<String, Option<PatrolLock>>,
    ) -> Result<Vec<UpdateResult>> {
        // Authoritative read before any write.
        let (patrols, _) = self
            .osm
            .fetch_patrols(access_token, osm_user_id, section_id, term_id)
            .await?;
        let mut scores: HashMap<String, i64> =
            patrols.into_iter().map(|p| (p.id, p.score)).collect();

        let mut results = Vec::with_capacity(requests.len());
        let mut abandon_template: Option<Outcome> = None;

        for request in requests {
            if let Some(template) = &abandon_template {
                results.push(UpdateResult {
                    patrol_id: request.patrol_id.clone(),
                    outcome: template.clone(),
                });
                continue;
            }

            let holds_lock = locks
                .get(&request.patrol_id)
                .map(|l| l.is_some())
                .unwrap_or(false);
            if !holds_lock {
                results.push(UpdateResult {
                    patrol_id: request.patrol_id.clone(),
                    outcome: Outcome::Temporary {
                        retry_after: LOCK_RETRY_AFTER_SECS,
                        reason: "patrol is being updated by another writer".into(),
                    },
                });
                continue;
            }

            let Some(current) = scores.get(&request.patrol_id).copied() else {
                results.push(UpdateResult {
                    patrol_id: request.patrol_id.clone(),
                    outcome: Outcome::Permanent {
                        reason: "unknown patrol for this section".into(),
                    },
                });
                continue;
            };

            let new_score = current + request.delta;
            match self
                .osm
                .update_patrol_points(
                    access_token,
                    osm_user_id,
                    section_id,
                    &request.patrol_id,
                    new_score,
                )
                .await
            {
                Ok(_) => {
                    scores.insert(request.patrol_id.clone(), new_score);
                    results.push(UpdateResult {
                        patrol_id: request.patrol_id.clone(),
                        outcome: Outcome::Success { new_score },
                    });
                }
                Err(err) => {
                    let outcome = outcome_from_error(&err);
                    warn!(
                        patrol = %request.patrol_id,
                        section = section_id,
                        "Score write failed, abandoning remaining requests: {}",
                        err
                    );
                    results.push(UpdateResult {
                        patrol_id: request.patrol_id.clone(),
                        outcome: outcome.clone(),
                    });
                    abandon_template = Some(outcome);
                }
            }
        }

        Ok(results)
    }

    async fn update_adhoc(
        &self,
        osm_user_id: i64,
        requests: &[ScoreUpdateRequest],
    ) -> Result<Vec<UpdateResult>> {
        let mut results = Vec::with_capacity(requests.len());
        for request in requests {
            let outcome = match self
                .adhoc
                .apply_delta(osm_user_id, &request.patrol_id, request.delta)
                .await?
            {
                Some(new_score) => Outcome::Success { new_score },
                None => Outcome::Permanent {
                    reason: "unknown ad-hoc patrol".into(),
                },
            };
            results.push(UpdateResult {
                patrol_id: request.patrol_id.clone(),
                outcome,
            });
        }
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_classes_map_to_outcome_templates() {
        match outcome_from_error(&OsmError::UserBlocked { retry_after: 1800 }) {
            Outcome::Temporary { retry_after, .. } => assert_eq!(retry_after, 1800),
            other => panic!("expected temporary, got {other:?}"),
        }
        assert!(matches!(
            outcome_from_error(&OsmError::ServiceBlocked),
            Outcome::Temporary { retry_after: 60, .. }
        ));
        assert!(matches!(
            outcome_from_error(&OsmError::Network("timeout".into())),
            Outcome::Temporary { retry_after: 30, .. }
        ));
        assert!(matches!(
            outcome_from_error(&OsmError::Http { status: 503, body: String::new() }),
            Outcome::Temporary { .. }
        ));
        assert!(matches!(
            outcome_from_error(&OsmError::Unauthorized),
            Outcome::AuthRevoked { .. }
        ));
        assert!(matches!(
            outcome_from_error(&OsmError::Http { status: 404, body: String::new() }),
            Outcome::Permanent { .. }
        ));
    }

    #[test]
    fn outcome_serializes_with_status_tag() {
        let json = serde_json::to_value(UpdateResult {
            patrol_id: "101".into(),
            outcome: Outcome::Success { new_score: 45 },
        })
        .unwrap();
        assert_eq!(json["patrol_id"], "101");
        assert_eq!(json["status"], "success");
        assert_eq!(json["new_score"], 45);

        let json = serde_json::to_value(UpdateResult {
            patrol_id: "102".into(),
            outcome: Outcome::Temporary {
                retry_after: 30,
                reason: "locked".into(),
            },
        })
        .unwrap();
        assert_eq!(json["status"], "temporary");
        assert_eq!(json["retry_after"], 30);
    }

    #[test]
    fn request_accepts_camel_case_patrol_id() {
        let parsed: ScoreUpdateRequest =
            serde_json::from_str(r#"{"patrolId": "101", "delta": 2}"#).unwrap();
        assert_eq!(parsed.patrol_id, "101");
        assert_eq!(parsed.delta, 2);
    }
}
