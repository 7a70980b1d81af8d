/// Configuration management for the gateway.
///
/// Everything is environment-driven. Defaults are chosen so that a local
/// `docker compose up postgres redis` plus the two OSM client credentials
/// is enough to boot the service.
use serde::{Deserialize, Serialize};

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// HTTP listener and public-facing URL settings
    pub app: AppConfig,
    /// Upstream OSM settings
    pub osm: OsmConfig,
    /// Database configuration
    pub database: DatabaseConfig,
    /// Cache (Redis) configuration
    pub cache: CacheConfig,
    /// Device-flow tunables
    pub device: DeviceFlowConfig,
    /// Upstream rate-limit thresholds driving the adaptive cache TTL
    pub ratelimit: RateLimitThresholds,
    /// Background job cadence
    pub jobs: JobConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Server host to bind to
    pub host: String,
    /// Server port to bind to
    pub port: u16,
    /// Public domain devices and browsers are told to visit (no scheme)
    pub exposed_domain: String,
    /// Mount point of the browser OAuth endpoints
    pub oauth_path_prefix: String,
    /// Mount point of the device endpoints
    pub device_path_prefix: String,
    /// Mount point of the bearer-token API
    pub api_path_prefix: String,
    /// Comma-separated CORS origins for the admin SPA
    pub cors_allowed_origins: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OsmConfig {
    /// Upstream base URL, e.g. "https://www.onlinescoutmanager.co.uk"
    pub domain: String,
    /// Confidential client id registered with OSM
    pub client_id: String,
    /// Confidential client secret, never sent to devices
    pub client_secret: String,
    /// Callback URL registered with OSM; derived from the exposed domain
    /// when not set explicitly
    pub redirect_uri: String,
    /// Requested scope
    pub scope: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    pub url: String,
    /// Prefix for every Redis key written by this deployment
    pub key_prefix: String,
    /// Retention window for stale patrol-score fallback (seconds)
    pub fallback_ttl_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceFlowConfig {
    /// Lifetime of a pending device/user code pair (seconds)
    pub code_expiry_secs: i64,
    /// Minimum polling interval advertised to devices (seconds)
    pub poll_interval_secs: u64,
    /// Max `POST /device/authorize` calls per IP per minute
    pub authorize_rate_limit: u32,
    /// Max user-code entry attempts per IP per minute
    pub entry_rate_limit: u32,
}

/// Remaining-quota thresholds for the adaptive cache TTL ladder.
/// Above `caution` the cache is kept fresh; below `floor` the gateway
/// leans hard on the cache.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RateLimitThresholds {
    pub caution: i64,
    pub warning: i64,
    pub critical: i64,
    pub floor: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobConfig {
    /// Cleanup sweep interval (seconds)
    pub cleanup_interval_secs: u64,
    /// Authorized/revoked devices idle longer than this are deleted (days)
    pub idle_device_days: i64,
    /// Outbox worker wake-up interval (seconds)
    pub worker_interval_secs: u64,
    /// Deprecated env seed for the client whitelist; the DB table wins
    pub allowed_client_ids: Vec<String>,
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, String> {
        let exposed_domain = env_or("EXPOSED_DOMAIN", "localhost:8080");
        let oauth_path_prefix = env_or("OAUTH_PATH_PREFIX", "/oauth");
        let redirect_uri = std::env::var("OSM_REDIRECT_URI").unwrap_or_else(|_| {
            format!("https://{}{}/callback", exposed_domain, oauth_path_prefix)
        });

        let client_id =
            std::env::var("OSM_CLIENT_ID").map_err(|_| "OSM_CLIENT_ID is required".to_string())?;
        let client_secret = std::env::var("OSM_CLIENT_SECRET")
            .map_err(|_| "OSM_CLIENT_SECRET is required".to_string())?;

        Ok(Config {
            app: AppConfig {
                host: env_or("HOST", "0.0.0.0"),
                port: env_parse("PORT", 8080u16),
                exposed_domain,
                oauth_path_prefix,
                device_path_prefix: env_or("DEVICE_PATH_PREFIX", "/device"),
                api_path_prefix: env_or("API_PATH_PREFIX", "/api"),
                cors_allowed_origins: env_or("CORS_ALLOWED_ORIGINS", "*"),
            },
            osm: OsmConfig {
                domain: env_or("OSM_DOMAIN", "https://www.onlinescoutmanager.co.uk"),
                client_id,
                client_secret,
                redirect_uri,
                scope: env_or("OSM_SCOPE", "section:member:read section:programme:read"),
            },
            database: DatabaseConfig {
                url: env_or("DATABASE_URL", "postgresql://localhost/osm_gateway"),
                max_connections: env_parse("DATABASE_MAX_CONNECTIONS", 20u32),
            },
            cache: CacheConfig {
                url: env_or("REDIS_URL", "redis://localhost:6379"),
                key_prefix: env_or("REDIS_KEY_PREFIX", "osmgw"),
                fallback_ttl_secs: env_parse("CACHE_FALLBACK_TTL", 691_200u64),
            },
            device: DeviceFlowConfig {
                code_expiry_secs: env_parse("DEVICE_CODE_EXPIRY", 900i64),
                poll_interval_secs: env_parse("DEVICE_POLL_INTERVAL", 5u64),
                authorize_rate_limit: env_parse("DEVICE_AUTHORIZE_RATE_LIMIT", 10u32),
                entry_rate_limit: env_parse("DEVICE_ENTRY_RATE_LIMIT", 10u32),
            },
            ratelimit: RateLimitThresholds {
                caution: env_parse("RATE_LIMIT_CAUTION", 500i64),
                warning: env_parse("RATE_LIMIT_WARNING", 200i64),
                critical: env_parse("RATE_LIMIT_CRITICAL", 100i64),
                floor: 50,
            },
            jobs: JobConfig {
                cleanup_interval_secs: env_parse("CLEANUP_INTERVAL", 300u64),
                idle_device_days: env_parse("IDLE_DEVICE_DAYS", 90i64),
                worker_interval_secs: env_parse("OUTBOX_WORKER_INTERVAL", 10u64),
                allowed_client_ids: std::env::var("ALLOWED_CLIENT_IDS")
                    .unwrap_or_default()
                    .split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect(),
            },
        })
    }

    /// Public URL of the user-code entry page shown on device displays.
    pub fn verification_uri(&self) -> String {
        format!("https://{}{}", self.app.exposed_domain, self.app.device_path_prefix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verification_uri_uses_exposed_domain() {
        let cfg = Config {
            app: AppConfig {
                host: "0.0.0.0".into(),
                port: 8080,
                exposed_domain: "scores.example.org".into(),
                oauth_path_prefix: "/oauth".into(),
                device_path_prefix: "/device".into(),
                api_path_prefix: "/api".into(),
                cors_allowed_origins: "*".into(),
            },
            osm: OsmConfig {
                domain: "https://osm.example".into(),
                client_id: "cid".into(),
                client_secret: "secret".into(),
                redirect_uri: "https://scores.example.org/oauth/callback".into(),
                scope: "section:member:read".into(),
            },
            database: DatabaseConfig {
                url: "postgresql://localhost/x".into(),
                max_connections: 5,
            },
            cache: CacheConfig {
                url: "redis://localhost".into(),
                key_prefix: "osmgw".into(),
                fallback_ttl_secs: 691_200,
            },
            device: DeviceFlowConfig {
                code_expiry_secs: 900,
                poll_interval_secs: 5,
                authorize_rate_limit: 10,
                entry_rate_limit: 10,
            },
            ratelimit: RateLimitThresholds {
                caution: 500,
                warning: 200,
                critical: 100,
                floor: 50,
            },
            jobs: JobConfig {
                cleanup_interval_secs: 300,
                idle_device_days: 90,
                worker_interval_secs: 10,
                allowed_client_ids: vec![],
            },
        };
        assert_eq!(cfg.verification_uri(), "https://scores.example.org/device");
    }
}
