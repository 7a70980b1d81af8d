//! RFC-8628-style device authorization state machine.
//!
//! Devices obtain a `(device_code, user_code)` pair, poll the token
//! endpoint, and eventually receive a server-minted device access token.
//! The OSM token pair won along the way never leaves this server.

use chrono::Utc;
use redis_utils::{with_timeout, Keyspace, SharedConnectionManager};
use serde::Serialize;
use sqlx::PgPool;
use tracing::{info, warn};

use crate::config::DeviceFlowConfig;
use crate::db::{client_repo, device_repo};
use crate::error::{AppError, Result};
use crate::metrics::DEVICE_POLL_TOTAL;
use crate::models::{DeviceAuthorization, DeviceStatus};
use crate::services::tokens::{generate_opaque_token, generate_user_code, normalize_user_code};

/// Collision retries for user-code minting.
const USER_CODE_RETRIES: usize = 5;

/// Interval penalty applied on each premature poll (seconds).
const SLOW_DOWN_STEP: u64 = 5;

/// The advertised interval never grows beyond this.
const MAX_POLL_INTERVAL: u64 = 60;

#[derive(Debug, Serialize)]
pub struct DeviceAuthorizationResponse {
    pub device_code: String,
    pub user_code: String,
    pub verification_uri: String,
    pub verification_uri_complete: String,
    pub expires_in: i64,
    pub interval: u64,
}

/// Outcome of one token poll.
#[derive(Debug)]
pub enum PollOutcome {
    /// Authorized: the server-minted device access token.
    Token(String),
    Pending,
    SlowDown { interval: u64 },
    Expired,
    Denied,
}

#[derive(Clone)]
pub struct DeviceFlowService {
    db: PgPool,
    redis: SharedConnectionManager,
    keyspace: Keyspace,
    config: DeviceFlowConfig,
    verification_uri: String,
}

impl DeviceFlowService {
    pub fn new(
        db: PgPool,
        redis: SharedConnectionManager,
        keyspace: Keyspace,
        config: DeviceFlowConfig,
        verification_uri: String,
    ) -> Self {
        Self {
            db,
            redis,
            keyspace,
            config,
            verification_uri,
        }
    }

    /// `POST /device/authorize`: mint a `(device_code, user_code)` pair for
    /// a whitelisted public client.
    pub async fn begin(&self, client_id: &str) -> Result<DeviceAuthorizationResponse> {
        let client = client_repo::find_enabled(&self.db, client_id)
            .await?
            .ok_or(AppError::UnknownClient)?;

        let device_code = generate_opaque_token();
        let expires_at = Utc::now() + chrono::Duration::seconds(self.config.code_expiry_secs);

        let mut user_code = None;
        for _ in 0..USER_CODE_RETRIES {
            let candidate = generate_user_code();
            if device_repo::find_by_user_code(&self.db, &candidate)
                .await?
                .is_none()
            {
                user_code = Some(candidate);
                break;
            }
        }
        let user_code = user_code.ok_or_else(|| {
            AppError::Internal("exhausted user-code retries; alphabet space saturated".into())
        })?;

        device_repo::insert(
            &self.db,
            &device_code,
            &user_code,
            client_id,
            client.id,
            expires_at,
        )
        .await?;

        info!(client_id = client_id, user_code = %user_code, "Device enrollment started");

        let verification_uri_complete =
            format!("{}?code={}", self.verification_uri, user_code);
        Ok(DeviceAuthorizationResponse {
            device_code,
            user_code,
            verification_uri: self.verification_uri.clone(),
            verification_uri_complete,
            expires_in: self.config.code_expiry_secs,
            interval: self.config.poll_interval_secs,
        })
    }

    /// `POST /device/token`: one poll of the device-code grant.
    pub async fn poll(&self, device_code: &str, client_id: &str) -> Result<PollOutcome> {
        // Interval enforcement first, so storms never reach the database.
        if let Some(interval) = self.enforce_poll_interval(device_code).await? {
            DEVICE_POLL_TOTAL.with_label_values(&["slow_down"]).inc();
            return Ok(PollOutcome::SlowDown { interval });
        }

        let Some(device) = device_repo::find_by_device_code(&self.db, device_code).await? else {
            DEVICE_POLL_TOTAL.with_label_values(&["expired"]).inc();
            return Ok(PollOutcome::Expired);
        };

        if device.client_id != client_id {
            DEVICE_POLL_TOTAL.with_label_values(&["denied"]).inc();
            return Ok(PollOutcome::Denied);
        }

        let now = Utc::now();
        let outcome = match device.status {
            DeviceStatus::Authorized => {
                let token = device.device_access_token.clone().ok_or_else(|| {
                    AppError::Internal("authorized device row without access token".into())
                })?;
                device_repo::touch_last_used(&self.db, device_code).await?;
                PollOutcome::Token(token)
            }
            DeviceStatus::Denied | DeviceStatus::Revoked => PollOutcome::Denied,
            DeviceStatus::Pending | DeviceStatus::AwaitingSection => {
                if device.is_expired(now) {
                    PollOutcome::Expired
                } else {
                    PollOutcome::Pending
                }
            }
        };

        let label = match &outcome {
            PollOutcome::Token(_) => "authorized",
            PollOutcome::Pending => "pending",
            PollOutcome::SlowDown { .. } => "slow_down",
            PollOutcome::Expired => "expired",
            PollOutcome::Denied => "denied",
        };
        DEVICE_POLL_TOTAL.with_label_values(&[label]).inc();

        Ok(outcome)
    }

    /// `POST /device`: resolve a human-typed user code to its pending
    /// enrollment. Consumed or expired codes are rejected.
    pub async fn entry(&self, raw_user_code: &str) -> Result<DeviceAuthorization> {
        let user_code = normalize_user_code(raw_user_code)
            .ok_or_else(|| AppError::Validation("malformed user code".into()))?;

        let device = device_repo::find_by_user_code(&self.db, &user_code)
            .await?
            .ok_or_else(|| AppError::NotFound("unknown user code".into()))?;

        if device.status != DeviceStatus::Pending {
            warn!(user_code = %user_code, status = device.status.as_str(), "Rejected reused user code");
            return Err(AppError::Validation("code already used".into()));
        }
        if device.is_expired(Utc::now()) {
            return Err(AppError::Validation("code expired".into()));
        }

        Ok(device)
    }

    /// Server-side minimum poll interval. Returns `Some(new_interval)` when
    /// the device polled too soon; the advertised interval only ever grows.
    async fn enforce_poll_interval(&self, device_code: &str) -> Result<Option<u64>> {
        let last_key = self.keyspace.key(&format!("poll:last:{device_code}"));
        let interval_key = self.keyspace.key(&format!("poll:interval:{device_code}"));
        let mut conn = self.redis.lock().await.clone();

        let advertised: u64 = with_timeout(async {
            redis::cmd("GET").arg(&interval_key).query_async::<_, Option<u64>>(&mut conn).await
        })
        .await
        .map_err(AppError::Redis)?
        .unwrap_or(self.config.poll_interval_secs);

        // Marker lives exactly one interval; if it is still there, the
        // device polled early.
        let acquired: Option<String> = with_timeout(async {
            redis::cmd("SET")
                .arg(&last_key)
                .arg("1")
                .arg("NX")
                .arg("EX")
                .arg(advertised.max(1))
                .query_async(&mut conn)
                .await
        })
        .await
        .map_err(AppError::Redis)?;

        if acquired.is_some() {
            return Ok(None);
        }

        let tightened = (advertised + SLOW_DOWN_STEP).min(MAX_POLL_INTERVAL);
        with_timeout(async {
            redis::cmd("SET")
                .arg(&interval_key)
                .arg(tightened)
                .arg("EX")
                .arg(self.config.code_expiry_secs.max(60))
                .query_async::<_, ()>(&mut conn)
                .await
        })
        .await
        .map_err(AppError::Redis)?;

        Ok(Some(tightened))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slow_down_penalty_is_bounded() {
        let mut interval = 5u64;
        for _ in 0..100 {
            interval = (interval + SLOW_DOWN_STEP).min(MAX_POLL_INTERVAL);
        }
        assert_eq!(interval, MAX_POLL_INTERVAL);
    }

    #[test]
    fn penalty_only_grows() {
        let start = 5u64;
        let next = (start + SLOW_DOWN_STEP).min(MAX_POLL_INTERVAL);
        assert!(next > start);
    }
}
