pub mod patrol_lock;
pub mod score_cache;

pub use patrol_lock::{PatrolLock, PatrolLockManager};
pub use score_cache::{CachedPatrolScores, ScoreCache};
