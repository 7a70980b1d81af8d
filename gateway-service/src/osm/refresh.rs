//! Token refresher.
//!
//! One contract serves both owners of OSM token pairs (device rows and
//! admin sessions): the caller binds `on_success` / `on_revoked` closures
//! over its own storage, and the refresh path never branches on who owns
//! the token.

use chrono::{DateTime, Utc};
use std::future::Future;
use tracing::{info, warn};

use super::{redact_token, OsmClient, OsmError};
use crate::error::AppError;

/// Refresh when the stored expiry is within this window.
pub const REFRESH_MARGIN_SECS: i64 = 300;

#[derive(Debug)]
pub enum RefreshOutcome {
    /// New pair persisted; carries the fresh access token.
    Refreshed(String),
    /// The upstream grant is gone; stored material has been cleared.
    TokenRevoked,
    /// Transient upstream trouble; stored tokens untouched.
    RefreshFailed,
}

/// True when `expiry` is close enough that the caller should refresh
/// before using the stored access token.
pub fn needs_refresh(expiry: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    expiry - now < chrono::Duration::seconds(REFRESH_MARGIN_SECS)
}

/// Run one refresh against the upstream token endpoint.
///
/// `identifier` is a redacted handle used only for logging. `on_success`
/// persists the rotated pair; `on_revoked` clears stored material (and,
/// for an admin session, deletes the session).
pub async fn refresh_with<S, SF, R, RF>(
    client: &OsmClient,
    refresh_token: &str,
    identifier: &str,
    on_success: S,
    on_revoked: R,
) -> RefreshOutcome
where
    S: FnOnce(String, String, DateTime<Utc>) -> SF,
    SF: Future<Output = Result<(), AppError>>,
    R: FnOnce() -> RF,
    RF: Future<Output = Result<(), AppError>>,
{
    match client.refresh_token(refresh_token).await {
        Ok(tokens) => {
            let expiry = Utc::now() + chrono::Duration::seconds(tokens.expires_in);
            if let Err(e) = on_success(
                tokens.access_token.clone(),
                tokens.refresh_token.clone(),
                expiry,
            )
            .await
            {
                // The upstream rotation already happened; losing the persist
                // only means the next request refreshes again.
                warn!(
                    identifier = identifier,
                    "Refreshed upstream token but failed to persist the new pair: {}", e
                );
            }
            info!(
                identifier = identifier,
                token = %redact_token(&tokens.access_token),
                "Refreshed upstream token"
            );
            RefreshOutcome::Refreshed(tokens.access_token)
        }
        Err(OsmError::Unauthorized) => {
            warn!(
                identifier = identifier,
                "Upstream reports the grant revoked; clearing stored tokens"
            );
            if let Err(e) = on_revoked().await {
                warn!(
                    identifier = identifier,
                    "Failed to clear revoked token material: {}", e
                );
            }
            RefreshOutcome::TokenRevoked
        }
        Err(e) => {
            warn!(identifier = identifier, "Token refresh failed: {}", e);
            RefreshOutcome::RefreshFailed
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refresh_window_is_five_minutes() {
        let now = Utc::now();
        assert!(needs_refresh(now + chrono::Duration::seconds(299), now));
        assert!(needs_refresh(now - chrono::Duration::seconds(10), now));
        assert!(!needs_refresh(now + chrono::Duration::seconds(301), now));
    }
}
