//! Cookie-authenticated admin API backing the single-page app.
//!
//! State-changing endpoints additionally require the CSRF header; that is
//! enforced by the admin auth middleware before these handlers run.

use actix_web::{web, HttpRequest, HttpResponse};
use serde::Deserialize;
use serde_json::json;

use crate::app_state::AppState;
use crate::db::device_repo;
use crate::error::{AppError, Result};
use crate::middleware::{authed_admin, authed_user};
use crate::services::ScoreUpdateRequest;

#[derive(Debug, Deserialize)]
pub struct AdminScoreBody {
    pub updates: Vec<ScoreUpdateRequest>,
}

/// `GET /api/admin/session`: who am I, plus the CSRF token the SPA must
/// echo on writes.
pub async fn session(req: HttpRequest) -> Result<HttpResponse> {
    let session = authed_admin(&req)?;
    Ok(HttpResponse::Ok().json(json!({
        "osm_user_id": session.osm_user_id,
        "csrf_token": session.csrf_token,
        "expires_at": session.expires_at,
    })))
}

/// `GET /api/admin/sections`: the user's OSM sections plus the ad-hoc
/// pseudo-section.
pub async fn sections(state: web::Data<AppState>, req: HttpRequest) -> Result<HttpResponse> {
    let user = authed_user(&req)?;
    let profile = state
        .osm
        .fetch_profile(&user.access_token, Some(user.osm_user_id))
        .await?;

    let mut sections: Vec<serde_json::Value> = profile
        .sections
        .iter()
        .map(|s| {
            json!({
                "section_id": s.section_id,
                "section_name": s.section_name,
            })
        })
        .collect();
    sections.push(json!({
        "section_id": 0,
        "section_name": "Ad-hoc teams",
    }));

    Ok(HttpResponse::Ok().json(json!({ "sections": sections })))
}

/// `GET /api/admin/sections/{id}/scores`: current scores plus the
/// not-yet-applied outbox deltas for optimistic display.
pub async fn section_scores(
    state: web::Data<AppState>,
    req: HttpRequest,
    path: web::Path<i64>,
) -> Result<HttpResponse> {
    let user = authed_user(&req)?;
    let section_id = path.into_inner();

    let scores = state
        .patrol_scores
        .get_for_admin(user.osm_user_id, &user.access_token, section_id)
        .await?;
    let pending = state
        .outbox
        .pending_deltas_by_section(user.osm_user_id, section_id)
        .await?;

    Ok(HttpResponse::Ok().json(json!({
        "scores": scores,
        "pending_deltas": pending,
    })))
}

/// `POST /api/admin/sections/{id}/scores`: the direct write path, with
/// per-patrol outcomes surfaced inline.
pub async fn update_section_scores(
    state: web::Data<AppState>,
    req: HttpRequest,
    path: web::Path<i64>,
    body: web::Json<AdminScoreBody>,
) -> Result<HttpResponse> {
    let user = authed_user(&req)?;
    let section_id = path.into_inner();

    if body.updates.is_empty() {
        return Err(AppError::Validation("updates must not be empty".into()));
    }

    let results = state
        .score_updates
        .update(
            user.osm_user_id,
            &user.access_token,
            section_id,
            &body.updates,
        )
        .await?;

    Ok(HttpResponse::Ok().json(json!({ "results": results })))
}

/// `GET /api/admin/scoreboards`: enrollments belonging to this user.
pub async fn scoreboards(state: web::Data<AppState>, req: HttpRequest) -> Result<HttpResponse> {
    let user = authed_user(&req)?;
    let devices = device_repo::list_by_osm_user(&state.db, user.osm_user_id).await?;

    let scoreboards: Vec<serde_json::Value> = devices
        .iter()
        .map(|d| {
            json!({
                "status": d.status,
                "section_id": d.section_id,
                "created_at": d.created_at,
                "last_used_at": d.last_used_at,
            })
        })
        .collect();

    Ok(HttpResponse::Ok().json(json!({ "scoreboards": scoreboards })))
}
