//! Request authentication.
//!
//! Devices present the server-minted bearer token; the admin SPA presents
//! a session cookie plus a CSRF header on state-changing calls. Both
//! paths refresh the underlying OSM token pair when it is within five
//! minutes of expiry, through the same refresher contract.

use actix_web::dev::{forward_ready, Service, ServiceRequest, ServiceResponse, Transform};
use actix_web::http::{header, Method};
use actix_web::{Error, HttpMessage, HttpRequest};
use chrono::Utc;
use futures::future::{ready, Ready};
use sqlx::PgPool;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::sync::Arc;
use tracing::warn;

use crate::db::{device_repo, outbox_repo, session_repo};
use crate::error::AppError;
use crate::metrics::OUTBOX_ENTRIES_TOTAL;
use crate::models::{AdminSession, DeviceAuthorization};
use crate::osm::refresh::{needs_refresh, refresh_with, RefreshOutcome};
use crate::osm::{redact_token, OsmClient};
use crate::services::web_flow::ADMIN_SESSION_TTL_HOURS;

/// Admin session cookie name.
pub const SESSION_COOKIE: &str = "gw_session";
/// CSRF header required on state-changing admin calls.
pub const CSRF_HEADER: &str = "X-CSRF-Token";

/// The user handle attached to every authenticated request.
#[derive(Debug, Clone)]
pub struct AuthedUser {
    pub osm_user_id: i64,
    pub access_token: String,
}

/// The device row behind a bearer-authenticated request.
#[derive(Debug, Clone)]
pub struct AuthedDevice(pub DeviceAuthorization);

/// The admin session behind a cookie-authenticated request.
#[derive(Debug, Clone)]
pub struct AuthedAdmin(pub AdminSession);

pub fn authed_user(req: &HttpRequest) -> Result<AuthedUser, AppError> {
    req.extensions()
        .get::<AuthedUser>()
        .cloned()
        .ok_or_else(|| AppError::Authentication("request not authenticated".into()))
}

pub fn authed_device(req: &HttpRequest) -> Result<DeviceAuthorization, AppError> {
    req.extensions()
        .get::<AuthedDevice>()
        .map(|d| d.0.clone())
        .ok_or_else(|| AppError::Authentication("request not authenticated".into()))
}

pub fn authed_admin(req: &HttpRequest) -> Result<AdminSession, AppError> {
    req.extensions()
        .get::<AuthedAdmin>()
        .map(|a| a.0.clone())
        .ok_or_else(|| AppError::Authentication("request not authenticated".into()))
}

/// Shared dependencies for both authenticators.
#[derive(Clone)]
pub struct AuthState {
    pub db: PgPool,
    pub osm: Arc<OsmClient>,
}

fn bearer_token(req: &ServiceRequest) -> Option<String> {
    req.headers()
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
}

/// Resolve a device bearer token to a user handle, refreshing the OSM
/// pair when needed.
async fn authenticate_device(
    state: &AuthState,
    token: &str,
) -> Result<(DeviceAuthorization, AuthedUser), AppError> {
    let device = device_repo::find_by_access_token(&state.db, token)
        .await?
        .ok_or_else(|| AppError::Authentication("unknown or revoked device token".into()))?;

    let osm_user_id = device
        .osm_user_id
        .ok_or_else(|| AppError::Internal("authorized device without osm user".into()))?;
    let access_token = device
        .osm_access_token
        .clone()
        .ok_or_else(|| AppError::Internal("authorized device without osm tokens".into()))?;
    let refresh_token = device
        .osm_refresh_token
        .clone()
        .ok_or_else(|| AppError::Internal("authorized device without refresh token".into()))?;
    let expiry = device
        .osm_token_expiry
        .ok_or_else(|| AppError::Internal("authorized device without token expiry".into()))?;

    let access_token = if needs_refresh(expiry, Utc::now()) {
        let db = state.db.clone();
        let device_code = device.device_code.clone();
        let db_revoked = state.db.clone();
        let device_code_revoked = device.device_code.clone();

        let outcome = refresh_with(
            &state.osm,
            &refresh_token,
            &redact_token(&device.device_code),
            move |access, refresh, expiry| async move {
                device_repo::update_osm_tokens(&db, &device_code, &access, &refresh, expiry)
                    .await
                    .map_err(AppError::from)
            },
            move || async move {
                device_repo::revoke(&db_revoked, &device_code_revoked)
                    .await
                    .map_err(AppError::from)?;
                // Pending write intents are frozen until re-enrollment.
                let frozen = outbox_repo::quarantine_user(&db_revoked, osm_user_id)
                    .await
                    .map_err(AppError::from)?;
                if frozen > 0 {
                    OUTBOX_ENTRIES_TOTAL
                        .with_label_values(&["auth_revoked"])
                        .inc_by(frozen);
                }
                Ok(())
            },
        )
        .await;

        match outcome {
            RefreshOutcome::Refreshed(token) => token,
            RefreshOutcome::TokenRevoked => return Err(AppError::GrantRevoked),
            RefreshOutcome::RefreshFailed => return Err(AppError::RefreshFailed),
        }
    } else {
        access_token
    };

    device_repo::touch_last_used(&state.db, &device.device_code).await?;

    Ok((
        device,
        AuthedUser {
            osm_user_id,
            access_token,
        },
    ))
}

/// Resolve an admin session cookie, enforcing CSRF on writes.
async fn authenticate_admin(
    state: &AuthState,
    session_id: &str,
    method: &Method,
    csrf_header: Option<&str>,
) -> Result<(AdminSession, AuthedUser), AppError> {
    let session = session_repo::find_admin_session(&state.db, session_id)
        .await?
        .ok_or_else(|| AppError::Authentication("unknown session".into()))?;

    if session.expires_at < Utc::now() {
        session_repo::delete_admin_session(&state.db, session_id).await?;
        return Err(AppError::Authentication("session expired".into()));
    }

    let state_changing = !matches!(*method, Method::GET | Method::HEAD | Method::OPTIONS);
    if state_changing && csrf_header != Some(session.csrf_token.as_str()) {
        warn!(user = session.osm_user_id, "CSRF token mismatch on admin write");
        return Err(AppError::CsrfRejected);
    }

    let access_token = if needs_refresh(session.osm_token_expiry, Utc::now()) {
        let db = state.db.clone();
        let sid = session.session_id.clone();
        let db_revoked = state.db.clone();
        let sid_revoked = session.session_id.clone();

        let outcome = refresh_with(
            &state.osm,
            &session.osm_refresh_token,
            &redact_token(&session.session_id),
            move |access, refresh, expiry| async move {
                session_repo::update_admin_tokens(&db, &sid, &access, &refresh, expiry)
                    .await
                    .map_err(AppError::from)
            },
            move || async move {
                session_repo::delete_admin_session(&db_revoked, &sid_revoked)
                    .await
                    .map_err(AppError::from)
            },
        )
        .await;

        match outcome {
            RefreshOutcome::Refreshed(token) => token,
            RefreshOutcome::TokenRevoked => return Err(AppError::GrantRevoked),
            RefreshOutcome::RefreshFailed => return Err(AppError::RefreshFailed),
        }
    } else {
        session.osm_access_token.clone()
    };

    // Sliding window.
    session_repo::extend_admin_session(
        &state.db,
        &session.session_id,
        Utc::now() + chrono::Duration::hours(ADMIN_SESSION_TTL_HOURS),
    )
    .await?;

    let user = AuthedUser {
        osm_user_id: session.osm_user_id,
        access_token,
    };
    Ok((session, user))
}

/// Bearer-token authenticator for the device API.
pub struct DeviceAuthMiddleware {
    pub state: AuthState,
}

impl<S, B> Transform<S, ServiceRequest> for DeviceAuthMiddleware
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type Transform = DeviceAuthMiddlewareService<S>;
    type InitError = ();
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(DeviceAuthMiddlewareService {
            service: Rc::new(service),
            state: self.state.clone(),
        }))
    }
}

pub struct DeviceAuthMiddlewareService<S> {
    service: Rc<S>,
    state: AuthState,
}

impl<S, B> Service<ServiceRequest> for DeviceAuthMiddlewareService<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>>>>;

    forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let service = self.service.clone();
        let state = self.state.clone();

        Box::pin(async move {
            let token = bearer_token(&req)
                .ok_or_else(|| AppError::Authentication("missing bearer token".into()))?;

            let (device, user) = authenticate_device(&state, &token).await?;
            req.extensions_mut().insert(AuthedDevice(device));
            req.extensions_mut().insert(user);

            service.call(req).await
        })
    }
}

/// Cookie + CSRF authenticator for the admin API.
pub struct AdminAuthMiddleware {
    pub state: AuthState,
}

impl<S, B> Transform<S, ServiceRequest> for AdminAuthMiddleware
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type Transform = AdminAuthMiddlewareService<S>;
    type InitError = ();
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(AdminAuthMiddlewareService {
            service: Rc::new(service),
            state: self.state.clone(),
        }))
    }
}

pub struct AdminAuthMiddlewareService<S> {
    service: Rc<S>,
    state: AuthState,
}

impl<S, B> Service<ServiceRequest> for AdminAuthMiddlewareService<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>>>>;

    forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let service = self.service.clone();
        let state = self.state.clone();

        Box::pin(async move {
            let session_id = req
                .request()
                .cookie(SESSION_COOKIE)
                .map(|c| c.value().to_string())
                .ok_or_else(|| AppError::Authentication("missing session cookie".into()))?;
            let csrf = req
                .headers()
                .get(CSRF_HEADER)
                .and_then(|v| v.to_str().ok())
                .map(|v| v.to_string());

            let (session, user) =
                authenticate_admin(&state, &session_id, req.method(), csrf.as_deref()).await?;
            req.extensions_mut().insert(AuthedAdmin(session));
            req.extensions_mut().insert(user);

            service.call(req).await
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::test::TestRequest;

    #[test]
    fn bearer_extraction_requires_the_scheme() {
        let req = TestRequest::default()
            .insert_header((header::AUTHORIZATION, "Bearer at_1"))
            .to_srv_request();
        assert_eq!(bearer_token(&req).as_deref(), Some("at_1"));

        let req = TestRequest::default()
            .insert_header((header::AUTHORIZATION, "Basic dXNlcjpwdw=="))
            .to_srv_request();
        assert_eq!(bearer_token(&req), None);

        let req = TestRequest::default().to_srv_request();
        assert_eq!(bearer_token(&req), None);

        let req = TestRequest::default()
            .insert_header((header::AUTHORIZATION, "Bearer "))
            .to_srv_request();
        assert_eq!(bearer_token(&req), None);
    }
}
