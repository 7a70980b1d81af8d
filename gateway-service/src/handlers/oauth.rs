//! Browser OAuth endpoints: admin login start, the shared OSM callback,
//! and section selection for device enrollments.

use actix_web::cookie::{Cookie, SameSite};
use actix_web::{web, HttpResponse};
use serde::Deserialize;

use crate::app_state::AppState;
use crate::error::Result;
use crate::handlers::pages;
use crate::middleware::auth::SESSION_COOKIE;
use crate::services::CallbackResult;

#[derive(Debug, Deserialize)]
pub struct CallbackQuery {
    pub code: Option<String>,
    pub state: String,
    pub error: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct SelectSectionForm {
    pub device_code: String,
    pub section_id: i64,
}

/// `GET`/`POST /oauth/authorize`: start an admin login.
pub async fn authorize(state: web::Data<AppState>) -> Result<HttpResponse> {
    let redirect = state.web_flow.start_admin().await?;
    Ok(HttpResponse::Found()
        .insert_header(("Location", redirect))
        .finish())
}

/// `GET /oauth/callback`: the return leg from OSM, shared by device
/// enrollments and admin logins (the state decides which).
pub async fn callback(
    state: web::Data<AppState>,
    query: web::Query<CallbackQuery>,
) -> Result<HttpResponse> {
    let result = state
        .web_flow
        .callback(
            query.code.as_deref(),
            &query.state,
            query.error.as_deref(),
        )
        .await?;

    Ok(match result {
        CallbackResult::SectionPicker {
            device_code,
            sections,
        } => {
            let select_path = format!("{}/select-section", state.config.app.oauth_path_prefix);
            HttpResponse::Ok()
                .content_type("text/html; charset=utf-8")
                .body(pages::section_picker(&device_code, &sections, &select_path))
        }
        CallbackResult::Admin(session) => {
            let cookie = Cookie::build(SESSION_COOKIE, session.session_id.clone())
                .path("/")
                .http_only(true)
                .secure(true)
                .same_site(SameSite::Lax)
                .finish();
            HttpResponse::Found()
                .cookie(cookie)
                .insert_header(("Location", "/"))
                .finish()
        }
        CallbackResult::Denied => HttpResponse::Ok()
            .content_type("text/html; charset=utf-8")
            .body(pages::authorization_declined()),
    })
}

/// `POST /oauth/select-section`: finish a device enrollment.
pub async fn select_section(
    state: web::Data<AppState>,
    form: web::Form<SelectSectionForm>,
) -> Result<HttpResponse> {
    state
        .web_flow
        .select_section(&form.device_code, form.section_id)
        .await?;
    Ok(HttpResponse::Ok()
        .content_type("text/html; charset=utf-8")
        .body(pages::device_authorized()))
}
