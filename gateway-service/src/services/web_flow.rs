//! Browser half of the enrollment: the authorization-code exchange
//! against OSM, joined to the device flow by a short-lived web session
//! whose id doubles as the OAuth `state`.

use chrono::Utc;
use serde::Serialize;
use sqlx::PgPool;
use std::sync::Arc;
use tracing::{info, warn};

use crate::db::{device_repo, outbox_repo, session_repo};
use crate::error::{AppError, Result};
use crate::metrics::OUTBOX_ENTRIES_TOTAL;
use crate::models::{AdminSession, DeviceStatus};
use crate::osm::OsmClient;
use crate::services::tokens::generate_opaque_token;

/// Web sessions expire 15 minutes after creation.
const WEB_SESSION_TTL_MINUTES: i64 = 15;

/// Admin cookie sessions live a day, sliding.
pub const ADMIN_SESSION_TTL_HOURS: i64 = 24;

#[derive(Debug, Clone, Serialize)]
pub struct SectionChoice {
    pub section_id: i64,
    pub section_name: String,
}

/// What the callback produced.
pub enum CallbackResult {
    /// Device enrollment: show the section picker.
    SectionPicker {
        device_code: String,
        sections: Vec<SectionChoice>,
    },
    /// Admin login: a cookie session was created.
    Admin(AdminSession),
    /// The user refused at OSM.
    Denied,
}

#[derive(Clone)]
pub struct WebFlowService {
    db: PgPool,
    osm: Arc<OsmClient>,
}

impl WebFlowService {
    pub fn new(db: PgPool, osm: Arc<OsmClient>) -> Self {
        Self { db, osm }
    }

    /// Start the browser leg for a device enrollment: create the state
    /// session and hand back the OSM authorize URL.
    pub async fn start_device(&self, device_code: &str) -> Result<String> {
        let device = device_repo::find_by_device_code(&self.db, device_code)
            .await?
            .ok_or_else(|| AppError::NotFound("unknown device code".into()))?;
        if device.status != DeviceStatus::Pending || device.is_expired(Utc::now()) {
            return Err(AppError::Validation("enrollment no longer pending".into()));
        }

        let session_id = generate_opaque_token();
        session_repo::create_web_session(
            &self.db,
            &session_id,
            Some(device_code),
            Utc::now() + chrono::Duration::minutes(WEB_SESSION_TTL_MINUTES),
        )
        .await?;

        Ok(self.osm.authorize_url(&session_id))
    }

    /// Start an admin login: same flow, no device bound to the state.
    pub async fn start_admin(&self) -> Result<String> {
        let session_id = generate_opaque_token();
        session_repo::create_web_session(
            &self.db,
            &session_id,
            None,
            Utc::now() + chrono::Duration::minutes(WEB_SESSION_TTL_MINUTES),
        )
        .await?;
        Ok(self.osm.authorize_url(&session_id))
    }

    /// `GET /oauth/callback`: validate the state, exchange the code, and
    /// route by what the session was bridging.
    pub async fn callback(
        &self,
        code: Option<&str>,
        state: &str,
        error: Option<&str>,
    ) -> Result<CallbackResult> {
        let session = session_repo::find_web_session(&self.db, state)
            .await?
            .ok_or_else(|| AppError::Authentication("unknown or reused state".into()))?;

        // One shot: the state is consumed whatever happens next.
        session_repo::delete_web_session(&self.db, state).await?;

        if session.is_expired(Utc::now()) {
            return Err(AppError::Authentication("login session expired".into()));
        }

        if let Some(err) = error {
            warn!(error = err, "User refused authorization at OSM");
            if let Some(device_code) = session.device_code.as_deref() {
                device_repo::mark_denied(&self.db, device_code).await?;
            }
            return Ok(CallbackResult::Denied);
        }

        let code = code.ok_or_else(|| {
            AppError::Validation("callback carried neither code nor error".into())
        })?;

        let tokens = self.osm.exchange_code(code).await?;
        let expiry = Utc::now() + chrono::Duration::seconds(tokens.expires_in);
        let profile = self.osm.fetch_profile(&tokens.access_token, None).await?;

        match session.device_code.as_deref() {
            Some(device_code) => {
                device_repo::store_osm_tokens(
                    &self.db,
                    device_code,
                    &tokens.access_token,
                    &tokens.refresh_token,
                    expiry,
                    profile.user_id,
                )
                .await?;

                info!(user = profile.user_id, "Device enrollment awaiting section selection");

                let sections = profile
                    .sections
                    .iter()
                    .map(|s| SectionChoice {
                        section_id: s.section_id,
                        section_name: s.section_name.clone(),
                    })
                    .collect();
                Ok(CallbackResult::SectionPicker {
                    device_code: device_code.to_string(),
                    sections,
                })
            }
            None => {
                let session = AdminSession {
                    session_id: generate_opaque_token(),
                    csrf_token: generate_opaque_token(),
                    osm_user_id: profile.user_id,
                    osm_access_token: tokens.access_token,
                    osm_refresh_token: tokens.refresh_token,
                    osm_token_expiry: expiry,
                    created_at: Utc::now(),
                    expires_at: Utc::now() + chrono::Duration::hours(ADMIN_SESSION_TTL_HOURS),
                };
                session_repo::create_admin_session(&self.db, &session).await?;
                info!(user = profile.user_id, "Admin session created");
                Ok(CallbackResult::Admin(session))
            }
        }
    }

    /// Section chosen in the picker: validate it against the profile, mint
    /// the device access token, and thaw any quarantined outbox work.
    pub async fn select_section(&self, device_code: &str, section_id: i64) -> Result<String> {
        let device = device_repo::find_by_device_code(&self.db, device_code)
            .await?
            .ok_or_else(|| AppError::NotFound("unknown device code".into()))?;

        if device.status != DeviceStatus::AwaitingSection {
            return Err(AppError::Validation(
                "device is not awaiting section selection".into(),
            ));
        }

        let access_token = device
            .osm_access_token
            .as_deref()
            .ok_or_else(|| AppError::Internal("awaiting_section row without tokens".into()))?;
        let osm_user_id = device
            .osm_user_id
            .ok_or_else(|| AppError::Internal("awaiting_section row without user".into()))?;

        // Section 0 selects ad-hoc mode and needs no upstream validation.
        if section_id != 0 {
            let profile = self.osm.fetch_profile(access_token, Some(osm_user_id)).await?;
            if profile.section(section_id).is_none() {
                return Err(AppError::Validation(format!(
                    "section {section_id} does not belong to this user"
                )));
            }
        }

        let device_access_token = generate_opaque_token();
        device_repo::authorize(&self.db, device_code, section_id, &device_access_token).await?;

        // A fresh grant un-freezes work parked by an earlier revocation.
        let recovered = outbox_repo::recover_auth_revoked(&self.db, osm_user_id).await?;
        if recovered > 0 {
            info!(
                user = osm_user_id,
                recovered = recovered,
                "Recovered quarantined outbox entries after re-enrollment"
            );
            OUTBOX_ENTRIES_TOTAL
                .with_label_values(&["recovered"])
                .inc_by(recovered);
        }

        info!(user = osm_user_id, section = section_id, "Device authorized");

        Ok(device_access_token)
    }
}
