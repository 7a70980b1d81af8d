pub mod auth;
pub mod rate_limit;

pub use auth::{
    authed_admin, authed_device, authed_user, AdminAuthMiddleware, AuthState,
    DeviceAuthMiddleware,
};
pub use rate_limit::{RateLimitConfig, RateLimitMiddleware};
