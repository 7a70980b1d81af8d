//! Upstream OSM client.
//!
//! All traffic to the upstream flows through [`OsmClient::execute`], which
//! consults the rate-limit governor before the wire and feeds it the
//! response headers after. Failures collapse into [`OsmError`]; callers
//! branch on the class, not on status codes.

use chrono::Utc;
use reqwest::RequestBuilder;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

pub mod ratelimit;
pub mod refresh;
pub mod types;

pub use ratelimit::{parse_rate_headers, RateLimitGovernor, UpstreamRateInfo};
pub use refresh::{refresh_with, RefreshOutcome};
pub use types::{OsmPatrol, OsmSection, OsmTerm, PatrolsResponse, TokenResponse, UserProfile};

use crate::config::OsmConfig;
use crate::error::AppError;
use crate::metrics::{UPSTREAM_REQUESTS_TOTAL, UPSTREAM_REQUEST_DURATION_SECONDS};
use crate::models::Patrol;

const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(10);
const ERROR_BODY_LIMIT: usize = 512;

/// Failure classes for upstream calls.
#[derive(Debug, Error)]
pub enum OsmError {
    /// The bearer token (or refresh grant) was rejected.
    #[error("upstream rejected the credentials")]
    Unauthorized,

    /// 429 with a per-user Retry-After.
    #[error("user temporarily blocked upstream ({retry_after}s)")]
    UserBlocked { retry_after: i64 },

    /// X-Blocked: the whole service is locked out.
    #[error("upstream blocked the service")]
    ServiceBlocked,

    /// Any other non-2xx.
    #[error("upstream returned HTTP {status}")]
    Http { status: u16, body: String },

    #[error("network error talking upstream: {0}")]
    Network(String),

    #[error("failed to decode upstream response: {0}")]
    Decode(String),
}

impl OsmError {
    /// Transient failures are retried by the outbox; the rest need human
    /// or re-enrollment intervention.
    pub fn is_transient(&self) -> bool {
        match self {
            OsmError::Network(_) | OsmError::ServiceBlocked => true,
            OsmError::UserBlocked { .. } => true,
            OsmError::Http { status, .. } => *status >= 500,
            OsmError::Unauthorized | OsmError::Decode(_) => false,
        }
    }

    fn outcome_label(&self) -> &'static str {
        match self {
            OsmError::Unauthorized => "unauthorized",
            OsmError::UserBlocked { .. } => "user_blocked",
            OsmError::ServiceBlocked => "service_blocked",
            OsmError::Http { .. } => "http_error",
            OsmError::Network(_) => "network_error",
            OsmError::Decode(_) => "decode_error",
        }
    }
}

impl From<OsmError> for AppError {
    fn from(err: OsmError) -> Self {
        match err {
            OsmError::Unauthorized => AppError::GrantRevoked,
            OsmError::UserBlocked { retry_after } => AppError::UserBlocked {
                retry_after,
                blocked_until: (Utc::now() + chrono::Duration::seconds(retry_after)).timestamp(),
            },
            OsmError::ServiceBlocked => AppError::ServiceBlocked,
            other => AppError::Upstream(other.to_string()),
        }
    }
}

/// Render a secret for log output: everything but the last four chars.
pub fn redact_token(token: &str) -> String {
    if token.len() <= 4 {
        "****".to_string()
    } else {
        format!("****{}", &token[token.len() - 4..])
    }
}

/// Apply the published patrol filtering rules and the name sort.
///
/// Dropped: `patrolid <= 0` (Leaders / Young Leaders), the synthetic
/// "unallocated" bucket, and patrols with no members. The sort is plain
/// byte-wise (case-sensitive) on the name.
pub fn filter_patrols(raw: PatrolsResponse) -> Vec<Patrol> {
    let mut patrols: Vec<Patrol> = raw
        .into_values()
        .filter(|p| {
            if p.members.is_empty() {
                return false;
            }
            if p.patrol_id.eq_ignore_ascii_case("unallocated")
                || p.name.eq_ignore_ascii_case("unallocated")
            {
                return false;
            }
            if let Ok(numeric) = p.patrol_id.parse::<i64>() {
                if numeric <= 0 {
                    return false;
                }
            }
            true
        })
        .map(|p| Patrol {
            id: p.patrol_id,
            name: p.name,
            score: p.points,
        })
        .collect();
    patrols.sort_by(|a, b| a.name.cmp(&b.name));
    patrols
}

#[derive(Clone)]
pub struct OsmClient {
    http: reqwest::Client,
    config: OsmConfig,
    governor: RateLimitGovernor,
}

impl OsmClient {
    pub fn new(config: OsmConfig, governor: RateLimitGovernor) -> Self {
        let http = reqwest::Client::builder()
            .timeout(UPSTREAM_TIMEOUT)
            .build()
            .expect("failed to build upstream HTTP client");
        Self {
            http,
            config,
            governor,
        }
    }

    pub fn governor(&self) -> &RateLimitGovernor {
        &self.governor
    }

    /// Browser redirect target for the authorization-code flow.
    pub fn authorize_url(&self, state: &str) -> String {
        format!(
            "{}/oauth/authorize?client_id={}&redirect_uri={}&response_type=code&state={}&scope={}",
            self.config.domain,
            urlencoding::encode(&self.config.client_id),
            urlencoding::encode(&self.config.redirect_uri),
            urlencoding::encode(state),
            urlencoding::encode(&self.config.scope),
        )
    }

    /// `grant_type=authorization_code` exchange at the callback.
    pub async fn exchange_code(&self, code: &str) -> Result<TokenResponse, OsmError> {
        let req = self
            .http
            .post(format!("{}/oauth/token", self.config.domain))
            .form(&[
                ("grant_type", "authorization_code"),
                ("code", code),
                ("client_id", self.config.client_id.as_str()),
                ("client_secret", self.config.client_secret.as_str()),
                ("redirect_uri", self.config.redirect_uri.as_str()),
            ]);
        let (_, _, body) = self.execute("token", None, req).await?;
        serde_json::from_str(&body).map_err(|e| OsmError::Decode(e.to_string()))
    }

    /// `grant_type=refresh_token`. A 400 `invalid_grant` means the user
    /// revoked the grant upstream and is reported as `Unauthorized`.
    pub async fn refresh_token(&self, refresh_token: &str) -> Result<TokenResponse, OsmError> {
        let req = self
            .http
            .post(format!("{}/oauth/token", self.config.domain))
            .form(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token),
                ("client_id", self.config.client_id.as_str()),
                ("client_secret", self.config.client_secret.as_str()),
            ]);
        match self.execute("token", None, req).await {
            Ok((_, _, body)) => {
                serde_json::from_str(&body).map_err(|e| OsmError::Decode(e.to_string()))
            }
            Err(OsmError::Http { status: 400, body }) if body.contains("invalid_grant") => {
                Err(OsmError::Unauthorized)
            }
            Err(e) => Err(e),
        }
    }

    /// `GET /oauth/resource`: the user profile with sections and terms.
    pub async fn fetch_profile(
        &self,
        access_token: &str,
        osm_user_id: Option<i64>,
    ) -> Result<UserProfile, OsmError> {
        let req = self
            .http
            .get(format!("{}/oauth/resource", self.config.domain))
            .bearer_auth(access_token);
        let (_, _, body) = self.execute("resource", osm_user_id, req).await?;
        serde_json::from_str::<types::ProfileEnvelope>(&body)
            .map(|env| env.data)
            .map_err(|e| OsmError::Decode(e.to_string()))
    }

    /// Patrols with members for one section/term, already filtered and
    /// sorted. The rate info is returned so the caller can derive the
    /// cache TTL.
    pub async fn fetch_patrols(
        &self,
        access_token: &str,
        osm_user_id: i64,
        section_id: i64,
        term_id: &str,
    ) -> Result<(Vec<Patrol>, UpstreamRateInfo), OsmError> {
        let req = self
            .http
            .get(format!("{}/ext/members/patrols/", self.config.domain))
            .query(&[
                ("action", "getPatrolsWithPeople"),
                ("sectionid", &section_id.to_string()),
                ("termid", term_id),
            ])
            .bearer_auth(access_token);
        let (_, info, body) = self.execute("patrols", Some(osm_user_id), req).await?;
        let raw: PatrolsResponse =
            serde_json::from_str(&body).map_err(|e| OsmError::Decode(e.to_string()))?;
        Ok((filter_patrols(raw), info))
    }

    /// Absolute-value score write. The upstream endpoint is a setter, not
    /// an incrementer; callers own the read-modify-write.
    pub async fn update_patrol_points(
        &self,
        access_token: &str,
        osm_user_id: i64,
        section_id: i64,
        patrol_id: &str,
        points: i64,
    ) -> Result<UpstreamRateInfo, OsmError> {
        let req = self
            .http
            .post(format!(
                "{}/ext/members/patrols/?action=updatePatrolPoints&sectionid={}",
                self.config.domain, section_id
            ))
            .form(&[("patrolid", patrol_id), ("points", &points.to_string())])
            .bearer_auth(access_token);
        let (_, info, body) = self.execute("update_points", Some(osm_user_id), req).await?;

        // Success is the empty array; anything else is an upstream error
        // masquerading as 200.
        match serde_json::from_str::<serde_json::Value>(&body) {
            Ok(serde_json::Value::Array(items)) if items.is_empty() => Ok(info),
            Ok(other) => Err(OsmError::Decode(format!(
                "unexpected update response: {other}"
            ))),
            Err(e) => Err(OsmError::Decode(e.to_string())),
        }
    }

    /// One round-trip to OSM: governor short-circuits, the wire call,
    /// header bookkeeping, and failure classification.
    async fn execute(
        &self,
        endpoint: &'static str,
        osm_user_id: Option<i64>,
        req: RequestBuilder,
    ) -> Result<(u16, UpstreamRateInfo, String), OsmError> {
        if let Some(user) = osm_user_id {
            if let Ok(Some(until)) = self.governor.user_blocked_until(user).await {
                let retry_after = (until - Utc::now()).num_seconds().max(1);
                UPSTREAM_REQUESTS_TOTAL
                    .with_label_values(&[endpoint, "user_blocked_short_circuit"])
                    .inc();
                return Err(OsmError::UserBlocked { retry_after });
            }
        }
        if let Ok(Some(_)) = self.governor.service_blocked_until().await {
            UPSTREAM_REQUESTS_TOTAL
                .with_label_values(&[endpoint, "service_blocked_short_circuit"])
                .inc();
            return Err(OsmError::ServiceBlocked);
        }

        let timer = UPSTREAM_REQUEST_DURATION_SECONDS
            .with_label_values(&[endpoint])
            .start_timer();
        let result = req.send().await;
        timer.observe_duration();

        let resp = match result {
            Ok(resp) => resp,
            Err(e) => {
                let err = OsmError::Network(e.to_string());
                UPSTREAM_REQUESTS_TOTAL
                    .with_label_values(&[endpoint, err.outcome_label()])
                    .inc();
                warn!(endpoint = endpoint, "Upstream request failed: {}", e);
                return Err(err);
            }
        };

        let status = resp.status().as_u16();
        let info = parse_rate_headers(resp.headers());
        if let Err(e) = self
            .governor
            .record_response(osm_user_id, status, &info)
            .await
        {
            warn!("Failed to record rate-limit state: {}", e);
        }

        let body = resp
            .text()
            .await
            .map_err(|e| OsmError::Network(e.to_string()))?;

        debug!(
            endpoint = endpoint,
            status = status,
            remaining = ?info.remaining,
            "Upstream response"
        );

        let classified = if info.blocked {
            Some(OsmError::ServiceBlocked)
        } else {
            match status {
                200..=299 => None,
                401 => Some(OsmError::Unauthorized),
                429 => Some(OsmError::UserBlocked {
                    retry_after: info.retry_after.unwrap_or(60).max(1),
                }),
                s => Some(OsmError::Http {
                    status: s,
                    body: body.chars().take(ERROR_BODY_LIMIT).collect(),
                }),
            }
        };

        match classified {
            Some(err) => {
                UPSTREAM_REQUESTS_TOTAL
                    .with_label_values(&[endpoint, err.outcome_label()])
                    .inc();
                Err(err)
            }
            None => {
                UPSTREAM_REQUESTS_TOTAL
                    .with_label_values(&[endpoint, "ok"])
                    .inc();
                Ok((status, info, body))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn patrol(id: &str, name: &str, points: i64, member_count: usize) -> OsmPatrol {
        OsmPatrol {
            patrol_id: id.to_string(),
            name: name.to_string(),
            points,
            members: vec![serde_json::json!({"scoutid": 1}); member_count],
        }
    }

    #[test]
    fn filtering_drops_leaders_unallocated_and_empty() {
        let mut raw: PatrolsResponse = HashMap::new();
        raw.insert("101".into(), patrol("101", "Eagles", 42, 3));
        raw.insert("102".into(), patrol("102", "Hawks", 7, 2));
        raw.insert("-2".into(), patrol("-2", "Leaders", 0, 4));
        raw.insert("-3".into(), patrol("-3", "Young Leaders", 0, 2));
        raw.insert("unallocated".into(), patrol("unallocated", "unallocated", 0, 5));
        raw.insert("103".into(), patrol("103", "Empty", 9, 0));

        let filtered = filter_patrols(raw);
        let ids: Vec<&str> = filtered.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, vec!["101", "102"]);
    }

    #[test]
    fn sort_is_case_sensitive_lexicographic() {
        let mut raw: PatrolsResponse = HashMap::new();
        raw.insert("1".into(), patrol("1", "alpha", 0, 1));
        raw.insert("2".into(), patrol("2", "Beta", 0, 1));
        raw.insert("3".into(), patrol("3", "Alpha", 0, 1));

        let names: Vec<String> = filter_patrols(raw).into_iter().map(|p| p.name).collect();
        // Uppercase sorts before lowercase in byte order.
        assert_eq!(names, vec!["Alpha", "Beta", "alpha"]);
    }

    #[test]
    fn redaction_keeps_only_a_suffix() {
        let token = "at_super_secret_value_1234";
        let redacted = redact_token(token);
        assert_eq!(redacted, "****1234");
        assert!(!redacted.contains("secret"));
        assert_eq!(redact_token("ab"), "****");
    }

    #[test]
    fn transient_classification() {
        assert!(OsmError::Network("timeout".into()).is_transient());
        assert!(OsmError::ServiceBlocked.is_transient());
        assert!(OsmError::UserBlocked { retry_after: 60 }.is_transient());
        assert!(OsmError::Http { status: 503, body: String::new() }.is_transient());
        assert!(!OsmError::Http { status: 404, body: String::new() }.is_transient());
        assert!(!OsmError::Unauthorized.is_transient());
    }

    #[test]
    fn user_blocked_maps_to_429_app_error() {
        let app: AppError = OsmError::UserBlocked { retry_after: 1800 }.into();
        match app {
            AppError::UserBlocked {
                retry_after,
                blocked_until,
            } => {
                assert_eq!(retry_after, 1800);
                assert!(blocked_until > Utc::now().timestamp());
            }
            other => panic!("expected UserBlocked, got {other:?}"),
        }
    }
}
