//! Device-facing endpoints: enrollment start, token polling, and the
//! user-code entry page.
//!
//! The token endpoint speaks RFC-8628 error strings in a bare
//! `{"error": ...}` body; everything else uses the standard envelope.

use actix_web::{web, HttpResponse};
use serde::Deserialize;
use serde_json::json;

use crate::app_state::AppState;
use crate::error::{AppError, Result};
use crate::handlers::pages;
use crate::services::PollOutcome;

pub const DEVICE_CODE_GRANT: &str = "urn:ietf:params:oauth:grant-type:device_code";

#[derive(Debug, Deserialize)]
pub struct DeviceAuthorizeForm {
    pub client_id: String,
}

#[derive(Debug, Deserialize)]
pub struct DeviceTokenForm {
    pub grant_type: String,
    pub device_code: String,
    pub client_id: String,
}

#[derive(Debug, Deserialize)]
pub struct UserCodeForm {
    pub user_code: String,
}

#[derive(Debug, Deserialize)]
pub struct EntryPageQuery {
    pub code: Option<String>,
}

fn oauth_error(error: &str) -> HttpResponse {
    HttpResponse::BadRequest().json(json!({ "error": error }))
}

/// `POST /device/authorize`
pub async fn authorize(
    state: web::Data<AppState>,
    form: web::Form<DeviceAuthorizeForm>,
) -> Result<HttpResponse> {
    match state.device_flow.begin(&form.client_id).await {
        Ok(response) => Ok(HttpResponse::Ok().json(response)),
        Err(AppError::UnknownClient) => Ok(oauth_error("unauthorized_client")),
        Err(e) => Err(e),
    }
}

/// `POST /device/token`
pub async fn token(
    state: web::Data<AppState>,
    form: web::Form<DeviceTokenForm>,
) -> Result<HttpResponse> {
    if form.grant_type != DEVICE_CODE_GRANT {
        return Ok(oauth_error("unsupported_grant_type"));
    }

    let outcome = state
        .device_flow
        .poll(&form.device_code, &form.client_id)
        .await?;

    Ok(match outcome {
        PollOutcome::Token(access_token) => HttpResponse::Ok().json(json!({
            "access_token": access_token,
            "token_type": "Bearer",
        })),
        PollOutcome::Pending => oauth_error("authorization_pending"),
        PollOutcome::SlowDown { interval } => HttpResponse::BadRequest().json(json!({
            "error": "slow_down",
            "interval": interval,
        })),
        PollOutcome::Expired => oauth_error("expired_token"),
        PollOutcome::Denied => oauth_error("access_denied"),
    })
}

/// `GET /device`: the user-code entry form, optionally prefilled from the
/// `verification_uri_complete` QR link.
pub async fn entry_page(query: web::Query<EntryPageQuery>) -> HttpResponse {
    HttpResponse::Ok()
        .content_type("text/html; charset=utf-8")
        .body(pages::user_code_entry(query.code.as_deref()))
}

/// `POST /device`: resolve the typed code and bounce the browser to OSM.
pub async fn entry_submit(
    state: web::Data<AppState>,
    form: web::Form<UserCodeForm>,
) -> Result<HttpResponse> {
    let device = state.device_flow.entry(&form.user_code).await?;
    let redirect = state.web_flow.start_device(&device.device_code).await?;
    Ok(HttpResponse::Found()
        .insert_header(("Location", redirect))
        .finish())
}
