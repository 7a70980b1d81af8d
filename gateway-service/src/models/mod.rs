//! Domain records persisted by the gateway.
//!
//! Status enums carry their own transition tables; repositories store them
//! as text and refuse to load unknown values.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle of a device enrollment.
///
/// Transitions are monotone along the declaration order; `Denied` and
/// `Revoked` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceStatus {
    Pending,
    AwaitingSection,
    Authorized,
    Denied,
    Revoked,
}

impl DeviceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceStatus::Pending => "pending",
            DeviceStatus::AwaitingSection => "awaiting_section",
            DeviceStatus::Authorized => "authorized",
            DeviceStatus::Denied => "denied",
            DeviceStatus::Revoked => "revoked",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(DeviceStatus::Pending),
            "awaiting_section" => Some(DeviceStatus::AwaitingSection),
            "authorized" => Some(DeviceStatus::Authorized),
            "denied" => Some(DeviceStatus::Denied),
            "revoked" => Some(DeviceStatus::Revoked),
            _ => None,
        }
    }

    /// Whether moving to `next` is a legal transition.
    pub fn can_transition_to(&self, next: DeviceStatus) -> bool {
        use DeviceStatus::*;
        match (self, next) {
            // Denied is reachable from any pre-terminal state
            (Pending, Denied) | (AwaitingSection, Denied) => true,
            (Pending, AwaitingSection) => true,
            (AwaitingSection, Authorized) => true,
            (Authorized, Revoked) => true,
            _ => false,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, DeviceStatus::Denied | DeviceStatus::Revoked)
    }
}

/// The unit of device enrollment. Owns the upstream OSM token material
/// exclusively; devices only ever see their own `device_access_token`.
#[derive(Debug, Clone)]
pub struct DeviceAuthorization {
    pub device_code: String,
    pub user_code: Option<String>,
    pub client_id: String,
    pub created_by_id: Option<Uuid>,
    pub status: DeviceStatus,
    pub expires_at: DateTime<Utc>,
    pub osm_access_token: Option<String>,
    pub osm_refresh_token: Option<String>,
    pub osm_token_expiry: Option<DateTime<Utc>>,
    pub osm_user_id: Option<i64>,
    pub section_id: Option<i64>,
    pub device_access_token: Option<String>,
    pub term_id: Option<String>,
    pub term_checked_at: Option<DateTime<Utc>>,
    pub term_end_date: Option<NaiveDate>,
    pub created_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
}

impl DeviceAuthorization {
    /// True when the pre-authorization window has lapsed. Only meaningful
    /// before `authorized`; authorized devices never expire by time.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        !matches!(
            self.status,
            DeviceStatus::Authorized | DeviceStatus::Revoked
        ) && now > self.expires_at
    }

    /// Term info needs a refresh when it was never fetched, is older than
    /// 24 hours, or the cached term has ended.
    pub fn term_needs_refresh(&self, now: DateTime<Utc>) -> bool {
        if self.term_id.is_none() {
            return true;
        }
        match self.term_checked_at {
            None => true,
            Some(checked) => {
                if now - checked > chrono::Duration::hours(24) {
                    return true;
                }
                match self.term_end_date {
                    Some(end) => now.date_naive() > end,
                    None => true,
                }
            }
        }
    }
}

/// Short-lived handle tying a browser's OSM login back to a device
/// authorization. The session id doubles as the OAuth `state` parameter.
/// `device_code = None` marks an admin login with no device attached.
#[derive(Debug, Clone)]
pub struct WebSession {
    pub session_id: String,
    pub device_code: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl WebSession {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }
}

/// Cookie-backed admin browser session. Owns its own OSM token pair,
/// refreshed through the same contract as device-owned tokens.
#[derive(Debug, Clone)]
pub struct AdminSession {
    pub session_id: String,
    pub csrf_token: String,
    pub osm_user_id: i64,
    pub osm_access_token: String,
    pub osm_refresh_token: String,
    pub osm_token_expiry: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Whitelist entry. The surrogate id is referenced from device rows so a
/// client_id rotation does not orphan history.
#[derive(Debug, Clone)]
pub struct AllowedClient {
    pub id: Uuid,
    pub client_id: String,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Outbox entry states. `Completed` is terminal; `AuthRevoked` rows are
/// frozen until the user re-enrolls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboxStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    AuthRevoked,
}

impl OutboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboxStatus::Pending => "pending",
            OutboxStatus::Processing => "processing",
            OutboxStatus::Completed => "completed",
            OutboxStatus::Failed => "failed",
            OutboxStatus::AuthRevoked => "auth_revoked",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(OutboxStatus::Pending),
            "processing" => Some(OutboxStatus::Processing),
            "completed" => Some(OutboxStatus::Completed),
            "failed" => Some(OutboxStatus::Failed),
            "auth_revoked" => Some(OutboxStatus::AuthRevoked),
            _ => None,
        }
    }
}

/// Durable write intent: one score delta for one patrol.
#[derive(Debug, Clone)]
pub struct OutboxEntry {
    pub id: i64,
    pub osm_user_id: i64,
    pub section_id: i64,
    pub patrol_id: String,
    pub points_delta: i64,
    pub idempotency_key: String,
    pub status: OutboxStatus,
    pub attempt_count: i32,
    pub last_error: Option<String>,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub processed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// A scored patrol as served to devices and the admin UI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Patrol {
    pub id: String,
    pub name: String,
    pub score: i64,
}

/// Degradation advertised alongside every patrol-score response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RateLimitState {
    None,
    Degraded,
    UserTemporaryBlock,
    ServiceBlocked,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_status_round_trips() {
        for s in [
            DeviceStatus::Pending,
            DeviceStatus::AwaitingSection,
            DeviceStatus::Authorized,
            DeviceStatus::Denied,
            DeviceStatus::Revoked,
        ] {
            assert_eq!(DeviceStatus::parse(s.as_str()), Some(s));
        }
        assert_eq!(DeviceStatus::parse("nonsense"), None);
    }

    #[test]
    fn transitions_are_monotone_and_terminal() {
        use DeviceStatus::*;
        assert!(Pending.can_transition_to(AwaitingSection));
        assert!(AwaitingSection.can_transition_to(Authorized));
        assert!(Authorized.can_transition_to(Revoked));
        assert!(Pending.can_transition_to(Denied));
        assert!(AwaitingSection.can_transition_to(Denied));

        // no going backwards
        assert!(!Authorized.can_transition_to(Pending));
        assert!(!AwaitingSection.can_transition_to(Pending));
        // terminals stay terminal
        assert!(!Denied.can_transition_to(Pending));
        assert!(!Revoked.can_transition_to(Authorized));
        assert!(Denied.is_terminal());
        assert!(Revoked.is_terminal());
    }

    #[test]
    fn authorized_devices_do_not_time_out() {
        let now = Utc::now();
        let dev = DeviceAuthorization {
            device_code: "dc".into(),
            user_code: None,
            client_id: "c".into(),
            created_by_id: None,
            status: DeviceStatus::Authorized,
            expires_at: now - chrono::Duration::hours(1),
            osm_access_token: Some("a".into()),
            osm_refresh_token: Some("r".into()),
            osm_token_expiry: Some(now),
            osm_user_id: Some(1),
            section_id: Some(1001),
            device_access_token: Some("t".into()),
            term_id: None,
            term_checked_at: None,
            term_end_date: None,
            created_at: now,
            last_used_at: None,
        };
        assert!(!dev.is_expired(now));

        let mut pending = dev.clone();
        pending.status = DeviceStatus::Pending;
        assert!(pending.is_expired(now));
    }

    #[test]
    fn term_refresh_rules() {
        let now = Utc::now();
        let mut dev = DeviceAuthorization {
            device_code: "dc".into(),
            user_code: None,
            client_id: "c".into(),
            created_by_id: None,
            status: DeviceStatus::Authorized,
            expires_at: now,
            osm_access_token: None,
            osm_refresh_token: None,
            osm_token_expiry: None,
            osm_user_id: None,
            section_id: None,
            device_access_token: None,
            term_id: Some("t1".into()),
            term_checked_at: Some(now - chrono::Duration::hours(1)),
            term_end_date: Some(now.date_naive() + chrono::Duration::days(30)),
            created_at: now,
            last_used_at: None,
        };
        assert!(!dev.term_needs_refresh(now));

        dev.term_checked_at = Some(now - chrono::Duration::hours(25));
        assert!(dev.term_needs_refresh(now));

        dev.term_checked_at = Some(now - chrono::Duration::hours(1));
        dev.term_end_date = Some(now.date_naive() - chrono::Duration::days(1));
        assert!(dev.term_needs_refresh(now));

        dev.term_id = None;
        assert!(dev.term_needs_refresh(now));
    }

    #[test]
    fn rate_limit_state_serializes_screaming() {
        assert_eq!(
            serde_json::to_string(&RateLimitState::UserTemporaryBlock).unwrap(),
            "\"USER_TEMPORARY_BLOCK\""
        );
        assert_eq!(
            serde_json::to_string(&RateLimitState::None).unwrap(),
            "\"NONE\""
        );
    }
}
