//! Upstream rate-limit governor.
//!
//! Every OSM response passes through here. The governor extracts the
//! quota headers, converts the remaining quota into the adaptive cache
//! TTL, and persists the two block states (per-user 429, service-wide
//! `X-Blocked`) in Redis so every instance sees them. Nothing outside
//! this module reads those keys.

use chrono::{DateTime, Utc};
use redis_utils::{with_timeout, Keyspace, SharedConnectionManager};
use reqwest::header::HeaderMap;
use std::time::Duration;
use tracing::warn;

use crate::config::RateLimitThresholds;
use crate::error::{AppError, Result};
use crate::metrics::SERVICE_BLOCKED;
use crate::models::RateLimitState;

/// Quota and control headers extracted from one upstream response.
#[derive(Debug, Clone, Default)]
pub struct UpstreamRateInfo {
    pub limit: Option<i64>,
    pub remaining: Option<i64>,
    pub reset_seconds: Option<i64>,
    pub retry_after: Option<i64>,
    pub blocked: bool,
    pub deprecated: bool,
}

fn header_i64(headers: &HeaderMap, name: &str) -> Option<i64> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<i64>().ok())
}

/// Parse the rate-limit surface of an upstream response.
pub fn parse_rate_headers(headers: &HeaderMap) -> UpstreamRateInfo {
    UpstreamRateInfo {
        limit: header_i64(headers, "X-RateLimit-Limit"),
        remaining: header_i64(headers, "X-RateLimit-Remaining"),
        reset_seconds: header_i64(headers, "X-RateLimit-Reset"),
        retry_after: header_i64(headers, "Retry-After"),
        blocked: headers.contains_key("X-Blocked"),
        deprecated: headers.contains_key("X-Deprecated"),
    }
}

/// Cache validity dictated by the remaining quota. Thresholds are
/// inclusive on the lower bound: exactly 200 remaining still earns the
/// 5-minute window.
pub fn adaptive_ttl(thresholds: &RateLimitThresholds, remaining: i64) -> Duration {
    let secs = if remaining > thresholds.caution {
        60
    } else if remaining >= thresholds.warning {
        300
    } else if remaining >= thresholds.critical {
        600
    } else if remaining >= thresholds.floor {
        900
    } else {
        1800
    };
    Duration::from_secs(secs)
}

/// Degradation label for a successful response.
pub fn state_for_remaining(thresholds: &RateLimitThresholds, remaining: i64) -> RateLimitState {
    if remaining >= thresholds.caution {
        RateLimitState::None
    } else {
        RateLimitState::Degraded
    }
}

#[derive(Clone)]
pub struct RateLimitGovernor {
    redis: SharedConnectionManager,
    keyspace: Keyspace,
    thresholds: RateLimitThresholds,
}

impl RateLimitGovernor {
    pub fn new(
        redis: SharedConnectionManager,
        keyspace: Keyspace,
        thresholds: RateLimitThresholds,
    ) -> Self {
        Self {
            redis,
            keyspace,
            thresholds,
        }
    }

    pub fn ttl_for_remaining(&self, remaining: i64) -> Duration {
        adaptive_ttl(&self.thresholds, remaining)
    }

    pub fn state_for_remaining(&self, remaining: i64) -> RateLimitState {
        state_for_remaining(&self.thresholds, remaining)
    }

    /// TTL when a response carried no quota headers at all; assume the
    /// worst tier short of a block.
    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(900)
    }

    fn user_block_key(&self, osm_user_id: i64) -> String {
        self.keyspace.key(&format!("user_blocked:{osm_user_id}"))
    }

    fn service_block_key(&self) -> String {
        self.keyspace.key("service_blocked")
    }

    fn rate_record_key(&self, osm_user_id: i64) -> String {
        self.keyspace.key(&format!("ratelimit:osm:{osm_user_id}"))
    }

    /// Record the outcome of one upstream call.
    pub async fn record_response(
        &self,
        osm_user_id: Option<i64>,
        status: u16,
        info: &UpstreamRateInfo,
    ) -> Result<()> {
        if info.deprecated {
            warn!("Upstream flagged this API as deprecated (X-Deprecated header)");
        }

        let mut conn = self.redis.lock().await.clone();

        if let (Some(user), Some(remaining)) = (osm_user_id, info.remaining) {
            let record = serde_json::json!({
                "remaining": remaining,
                "limit": info.limit,
                "reset_seconds": info.reset_seconds,
                "observed_at": Utc::now().timestamp(),
            });
            let ttl = info.reset_seconds.unwrap_or(3600).max(1);
            with_timeout(async {
                redis::cmd("SET")
                    .arg(self.rate_record_key(user))
                    .arg(record.to_string())
                    .arg("EX")
                    .arg(ttl)
                    .query_async::<_, ()>(&mut conn)
                    .await
            })
            .await
            .map_err(AppError::Redis)?;
        }

        if status == 429 {
            if let Some(user) = osm_user_id {
                let retry_after = info.retry_after.unwrap_or(60).max(1);
                let until = Utc::now() + chrono::Duration::seconds(retry_after);
                warn!(
                    user = user,
                    retry_after = retry_after,
                    "Upstream applied a per-user temporary block"
                );
                with_timeout(async {
                    redis::cmd("SET")
                        .arg(self.user_block_key(user))
                        .arg(until.timestamp())
                        .arg("EX")
                        .arg(retry_after)
                        .query_async::<_, ()>(&mut conn)
                        .await
                })
                .await
                .map_err(AppError::Redis)?;
            }
        }

        if info.blocked {
            let ttl = info
                .retry_after
                .or(info.reset_seconds)
                .unwrap_or(3600)
                .max(1);
            let until = Utc::now() + chrono::Duration::seconds(ttl);
            warn!(ttl = ttl, "Upstream blocked the whole service (X-Blocked)");
            SERVICE_BLOCKED.set(1);
            with_timeout(async {
                redis::cmd("SET")
                    .arg(self.service_block_key())
                    .arg(until.timestamp())
                    .arg("EX")
                    .arg(ttl)
                    .query_async::<_, ()>(&mut conn)
                    .await
            })
            .await
            .map_err(AppError::Redis)?;
        }

        Ok(())
    }

    /// Per-user short-circuit: when the user is blocked, return when the
    /// block lifts.
    pub async fn user_blocked_until(&self, osm_user_id: i64) -> Result<Option<DateTime<Utc>>> {
        let mut conn = self.redis.lock().await.clone();
        let raw: Option<String> = with_timeout(async {
            redis::cmd("GET")
                .arg(self.user_block_key(osm_user_id))
                .query_async(&mut conn)
                .await
        })
        .await
        .map_err(AppError::Redis)?;
        Ok(raw
            .and_then(|s| s.parse::<i64>().ok())
            .and_then(|ts| DateTime::<Utc>::from_timestamp(ts, 0))
            .filter(|until| *until > Utc::now()))
    }

    /// Service-wide short-circuit.
    pub async fn service_blocked_until(&self) -> Result<Option<DateTime<Utc>>> {
        let mut conn = self.redis.lock().await.clone();
        let raw: Option<String> = with_timeout(async {
            redis::cmd("GET")
                .arg(self.service_block_key())
                .query_async(&mut conn)
                .await
        })
        .await
        .map_err(AppError::Redis)?;
        let until = raw
            .and_then(|s| s.parse::<i64>().ok())
            .and_then(|ts| DateTime::<Utc>::from_timestamp(ts, 0))
            .filter(|until| *until > Utc::now());
        if until.is_none() {
            SERVICE_BLOCKED.set(0);
        }
        Ok(until)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::{HeaderName, HeaderValue};

    fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (k, v) in pairs {
            map.insert(
                HeaderName::from_bytes(k.as_bytes()).unwrap(),
                HeaderValue::from_str(v).unwrap(),
            );
        }
        map
    }

    fn governor_thresholds() -> RateLimitThresholds {
        RateLimitThresholds {
            caution: 500,
            warning: 200,
            critical: 100,
            floor: 50,
        }
    }

    fn ttl_secs(remaining: i64) -> u64 {
        adaptive_ttl(&governor_thresholds(), remaining).as_secs()
    }

    #[test]
    fn ttl_ladder_boundaries_are_inclusive_on_the_lower_bound() {
        assert_eq!(ttl_secs(501), 60);
        assert_eq!(ttl_secs(500), 300);
        assert_eq!(ttl_secs(200), 300);
        assert_eq!(ttl_secs(199), 600);
        assert_eq!(ttl_secs(100), 600);
        assert_eq!(ttl_secs(99), 900);
        assert_eq!(ttl_secs(50), 900);
        assert_eq!(ttl_secs(49), 1800);
        assert_eq!(ttl_secs(0), 1800);
    }

    #[test]
    fn remaining_150_earns_ten_minutes() {
        assert_eq!(ttl_secs(150), 600);
    }

    #[test]
    fn state_is_none_at_caution_and_degraded_below() {
        let t = governor_thresholds();
        assert_eq!(state_for_remaining(&t, 500), RateLimitState::None);
        assert_eq!(state_for_remaining(&t, 501), RateLimitState::None);
        assert_eq!(state_for_remaining(&t, 499), RateLimitState::Degraded);
    }

    #[test]
    fn parse_reads_all_quota_headers() {
        let map = headers(&[
            ("X-RateLimit-Limit", "1000"),
            ("X-RateLimit-Remaining", "150"),
            ("X-RateLimit-Reset", "3600"),
        ]);
        let info = parse_rate_headers(&map);
        assert_eq!(info.limit, Some(1000));
        assert_eq!(info.remaining, Some(150));
        assert_eq!(info.reset_seconds, Some(3600));
        assert!(!info.blocked);
        assert!(!info.deprecated);
    }

    #[test]
    fn parse_reads_control_headers() {
        let map = headers(&[
            ("Retry-After", "1800"),
            ("X-Blocked", "1"),
            ("X-Deprecated", "true"),
        ]);
        let info = parse_rate_headers(&map);
        assert_eq!(info.retry_after, Some(1800));
        assert!(info.blocked);
        assert!(info.deprecated);
    }

    #[test]
    fn parse_tolerates_garbage_values() {
        let map = headers(&[("X-RateLimit-Remaining", "lots")]);
        let info = parse_rate_headers(&map);
        assert_eq!(info.remaining, None);
    }
}
