//! OAuth bridge and API mediator between input-constrained scoreboard
//! devices and the upstream Online Scout Manager API.
//!
//! Devices enroll through an RFC-8628-style device flow; the browser leg
//! runs an authorization-code exchange against OSM. OSM tokens never leave
//! this server: devices hold only a server-minted bearer token. Reads go
//! through a rate-limit-aware cache with stale fallback; writes land in a
//! durable outbox drained by a background worker.

pub mod app_state;
pub mod cache;
pub mod config;
pub mod db;
pub mod error;
pub mod handlers;
pub mod jobs;
pub mod metrics;
pub mod middleware;
pub mod models;
pub mod osm;
pub mod services;

pub use app_state::AppState;
pub use config::Config;
