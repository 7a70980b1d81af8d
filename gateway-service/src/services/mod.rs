pub mod adhoc;
pub mod device_flow;
pub mod outbox;
pub mod patrol_scores;
pub mod score_update;
pub mod tokens;
pub mod web_flow;

pub use adhoc::AdhocService;
pub use device_flow::{DeviceAuthorizationResponse, DeviceFlowService, PollOutcome};
pub use outbox::{OutboxService, OutboxWorker};
pub use patrol_scores::{PatrolScoreResponse, PatrolScoreService};
pub use score_update::{ScoreUpdateRequest, ScoreUpdateService};
pub use web_flow::{CallbackResult, WebFlowService};
