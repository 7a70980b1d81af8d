use sqlx::PgPool;
use std::sync::Arc;

use crate::config::Config;
use crate::osm::OsmClient;
use crate::services::{
    DeviceFlowService, OutboxService, PatrolScoreService, ScoreUpdateService, WebFlowService,
};

/// Everything the HTTP handlers need, shared via `web::Data`.
pub struct AppState {
    pub db: PgPool,
    pub config: Config,
    pub osm: Arc<OsmClient>,
    pub device_flow: DeviceFlowService,
    pub web_flow: WebFlowService,
    pub patrol_scores: PatrolScoreService,
    pub score_updates: ScoreUpdateService,
    pub outbox: OutboxService,
}
