//! Bearer-token device API: patrol scores and score deltas.

use actix_web::{web, HttpRequest, HttpResponse};
use serde::Deserialize;
use serde_json::json;

use crate::app_state::AppState;
use crate::error::{AppError, Result};
use crate::middleware::{authed_device, authed_user};
use crate::services::outbox::OutboxEnqueueItem;

#[derive(Debug, Deserialize)]
pub struct ScoreUpdateBody {
    pub updates: Vec<OutboxEnqueueItem>,
}

/// `GET /api/v1/patrols`
pub async fn get_patrols(state: web::Data<AppState>, req: HttpRequest) -> Result<HttpResponse> {
    let user = authed_user(&req)?;
    let device = authed_device(&req)?;
    let response = state
        .patrol_scores
        .get_for_device(&device, &user.access_token)
        .await?;
    Ok(HttpResponse::Ok().json(response))
}

/// `POST /api/v1/patrols`: durable enqueue; the outbox worker applies the
/// deltas upstream.
pub async fn post_patrols(
    state: web::Data<AppState>,
    req: HttpRequest,
    body: web::Json<ScoreUpdateBody>,
) -> Result<HttpResponse> {
    let user = authed_user(&req)?;
    let device = authed_device(&req)?;
    let section_id = device
        .section_id
        .ok_or_else(|| AppError::Internal("authorized device without section".into()))?;

    if body.updates.is_empty() {
        return Err(AppError::Validation("updates must not be empty".into()));
    }

    let results = state
        .outbox
        .enqueue(user.osm_user_id, section_id, &body.updates)
        .await?;

    Ok(HttpResponse::Accepted().json(json!({ "results": results })))
}
