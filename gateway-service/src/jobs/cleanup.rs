//! Periodic cleanup sweepers.
//!
//! Expired web sessions, expired pre-authorization device codes,
//! long-idle devices, expired admin sessions, and outbox retention all
//! run on one cadence. Every sweep is a bounded DELETE; a failed sweep
//! logs and waits for the next tick.

use sqlx::PgPool;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio::time::sleep;
use tracing::{error, info};

use crate::db::{device_repo, outbox_repo, session_repo};

pub struct CleanupJob {
    db: PgPool,
    interval: Duration,
    idle_device_days: i64,
}

impl CleanupJob {
    pub fn new(db: PgPool, interval: Duration, idle_device_days: i64) -> Self {
        Self {
            db,
            interval,
            idle_device_days,
        }
    }

    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        info!(
            interval_secs = self.interval.as_secs(),
            idle_device_days = self.idle_device_days,
            "Cleanup job starting"
        );
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("Cleanup job shutting down");
                    break;
                }
                _ = sleep(self.interval) => {
                    let started = Instant::now();
                    match self.sweep().await {
                        Ok(total) => {
                            if total > 0 {
                                info!(
                                    removed = total,
                                    duration_ms = started.elapsed().as_millis() as u64,
                                    "Cleanup sweep finished"
                                );
                            }
                        }
                        Err(e) => error!("Cleanup sweep failed: {}", e),
                    }
                }
            }
        }
    }

    async fn sweep(&self) -> Result<u64, sqlx::Error> {
        let web_sessions = session_repo::delete_expired_web_sessions(&self.db).await?;
        let admin_sessions = session_repo::delete_expired_admin_sessions(&self.db).await?;
        let stale_codes = device_repo::delete_expired_preauth(&self.db).await?;
        let idle_devices = device_repo::delete_idle(&self.db, self.idle_device_days).await?;
        let outbox_rows = outbox_repo::purge_retention(&self.db).await?;

        if stale_codes > 0 || idle_devices > 0 {
            info!(
                stale_codes = stale_codes,
                idle_devices = idle_devices,
                "Reaped device enrollments"
            );
        }

        Ok(web_sessions + admin_sessions + stale_codes + idle_devices + outbox_rows)
    }
}
