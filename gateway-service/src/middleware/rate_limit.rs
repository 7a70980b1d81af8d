//! Redis fixed-window rate limiting, keyed by source IP.
//!
//! Guards the unauthenticated device-flow endpoints (enrollment start and
//! user-code entry). Fails open: an unreachable Redis must not take the
//! enrollment path down with it.

use actix_web::dev::{forward_ready, Service, ServiceRequest, ServiceResponse, Transform};
use actix_web::Error;
use futures::future::{ready, Ready};
use redis_utils::{with_timeout, Keyspace, SharedConnectionManager};
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use tracing::warn;

use crate::error::AppError;

#[derive(Clone)]
pub struct RateLimitConfig {
    /// Requests allowed per window.
    pub max_requests: u32,
    /// Window length in seconds.
    pub window_seconds: u64,
    /// Key segment naming the protected surface.
    pub scope: &'static str,
}

#[derive(Clone)]
pub struct RateLimitMiddleware {
    config: RateLimitConfig,
    redis: SharedConnectionManager,
    keyspace: Keyspace,
}

impl RateLimitMiddleware {
    pub fn new(
        config: RateLimitConfig,
        redis: SharedConnectionManager,
        keyspace: Keyspace,
    ) -> Self {
        Self {
            config,
            redis,
            keyspace,
        }
    }
}

impl<S, B> Transform<S, ServiceRequest> for RateLimitMiddleware
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type Transform = RateLimitMiddlewareService<S>;
    type InitError = ();
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(RateLimitMiddlewareService {
            service: Rc::new(service),
            config: self.config.clone(),
            redis: self.redis.clone(),
            keyspace: self.keyspace.clone(),
        }))
    }
}

pub struct RateLimitMiddlewareService<S> {
    service: Rc<S>,
    config: RateLimitConfig,
    redis: SharedConnectionManager,
    keyspace: Keyspace,
}

impl<S, B> Service<ServiceRequest> for RateLimitMiddlewareService<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>>>>;

    forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let service = self.service.clone();
        let config = self.config.clone();
        let redis = self.redis.clone();
        let keyspace = self.keyspace.clone();

        Box::pin(async move {
            let ip = req
                .connection_info()
                .realip_remote_addr()
                .unwrap_or("unknown")
                .to_string();
            let key = keyspace.key(&format!("ratelimit:{}:{}", config.scope, ip));

            match check_window(&redis, &key, &config).await {
                Ok(None) => {}
                Ok(Some(retry_after)) => {
                    warn!(
                        scope = config.scope,
                        ip = %ip,
                        "Rate limit exceeded"
                    );
                    return Err(AppError::RateLimitExceeded {
                        retry_after: retry_after.max(1),
                    }
                    .into());
                }
                Err(e) => {
                    // Fail open.
                    warn!(
                        scope = config.scope,
                        "Rate limit check failed, allowing request: {}", e
                    );
                }
            }

            service.call(req).await
        })
    }
}

/// Returns `Some(retry_after)` when the caller is over the limit.
async fn check_window(
    redis: &SharedConnectionManager,
    key: &str,
    config: &RateLimitConfig,
) -> Result<Option<u64>, redis::RedisError> {
    let mut conn = redis.lock().await.clone();

    let count: u32 = with_timeout(async {
        redis::cmd("INCR").arg(key).query_async(&mut conn).await
    })
    .await?;

    if count == 1 {
        with_timeout(async {
            redis::cmd("EXPIRE")
                .arg(key)
                .arg(config.window_seconds)
                .query_async::<_, ()>(&mut conn)
                .await
        })
        .await?;
    }

    if count <= config.max_requests {
        return Ok(None);
    }

    let ttl: i64 = with_timeout(async {
        redis::cmd("TTL").arg(key).query_async(&mut conn).await
    })
    .await?;

    Ok(Some(if ttl > 0 {
        ttl as u64
    } else {
        config.window_seconds
    }))
}
