use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use redis_utils::{Keyspace, RedisPool};
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use gateway_service::app_state::AppState;
use gateway_service::handlers::{self, health::HealthState};
use gateway_service::jobs::cleanup::CleanupJob;
use gateway_service::middleware::{
    AdminAuthMiddleware, AuthState, DeviceAuthMiddleware, RateLimitConfig, RateLimitMiddleware,
};
use gateway_service::osm::{OsmClient, RateLimitGovernor};
use gateway_service::services::{
    AdhocService, DeviceFlowService, OutboxService, OutboxWorker, PatrolScoreService,
    ScoreUpdateService, WebFlowService,
};
use gateway_service::{db, metrics, Config};

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut terminate =
            signal(SignalKind::terminate()).expect("Failed to install SIGTERM handler");

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {},
            _ = terminate.recv() => {},
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    }
}

#[actix_web::main]
async fn main() -> io::Result<()> {
    // Container healthcheck shortcut: `gateway-service healthcheck`
    {
        let mut args = std::env::args();
        let _bin = args.next();
        if let Some(cmd) = args.next() {
            if cmd == "healthcheck" {
                let port = std::env::var("PORT").unwrap_or_else(|_| "8080".to_string());
                let url = format!("http://127.0.0.1:{port}/healthz");
                match reqwest::Client::new().get(&url).send().await {
                    Ok(resp) if resp.status().is_success() => return Ok(()),
                    Ok(resp) => {
                        eprintln!("healthcheck HTTP status: {}", resp.status());
                        return Err(io::Error::new(io::ErrorKind::Other, "healthcheck failed"));
                    }
                    Err(e) => {
                        eprintln!("healthcheck HTTP error: {e}");
                        return Err(io::Error::new(io::ErrorKind::Other, "healthcheck error"));
                    }
                }
            }
        }
    }

    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,actix_web=debug,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = match Config::from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            tracing::error!("Configuration loading failed: {e}");
            eprintln!("ERROR: Failed to load configuration: {e}");
            std::process::exit(1);
        }
    };

    tracing::info!("Starting gateway-service v{}", env!("CARGO_PKG_VERSION"));

    let db_pool = match db::create_pool(&config.database.url, config.database.max_connections).await
    {
        Ok(pool) => pool,
        Err(e) => {
            tracing::error!("Database pool creation failed: {e}");
            eprintln!("ERROR: Failed to create database pool: {e}");
            std::process::exit(1);
        }
    };

    db::ensure_schema(&db_pool).await.map_err(|e| {
        io::Error::new(io::ErrorKind::Other, format!("schema bootstrap failed: {e}"))
    })?;

    // Fold the deprecated env whitelist into the authoritative table.
    db::client_repo::seed_from_env(&db_pool, &config.jobs.allowed_client_ids)
        .await
        .map_err(|e| {
            io::Error::new(io::ErrorKind::Other, format!("client seed failed: {e}"))
        })?;

    let redis_pool = RedisPool::connect(&config.cache.url).await.map_err(|e| {
        io::Error::new(
            io::ErrorKind::Other,
            format!("Failed to initialize Redis connection: {e}"),
        )
    })?;
    let redis = redis_pool.manager();
    let keyspace = Keyspace::new(&config.cache.key_prefix);

    tracing::info!("Connected to PostgreSQL and Redis");

    // Core components, leaves first.
    let governor = RateLimitGovernor::new(redis.clone(), keyspace.clone(), config.ratelimit);
    let osm = Arc::new(OsmClient::new(config.osm.clone(), governor));

    let score_cache = gateway_service::cache::ScoreCache::new(
        redis.clone(),
        keyspace.clone(),
        config.cache.fallback_ttl_secs,
    );
    let patrol_locks =
        gateway_service::cache::PatrolLockManager::new(redis.clone(), keyspace.clone());

    let adhoc = AdhocService::new(db_pool.clone(), score_cache.clone());
    let patrol_scores = PatrolScoreService::new(
        db_pool.clone(),
        score_cache.clone(),
        osm.clone(),
        adhoc.clone(),
    );
    let score_updates = ScoreUpdateService::new(osm.clone(), patrol_locks, adhoc.clone());
    let outbox = OutboxService::new(db_pool.clone());
    let device_flow = DeviceFlowService::new(
        db_pool.clone(),
        redis.clone(),
        keyspace.clone(),
        config.device.clone(),
        config.verification_uri(),
    );
    let web_flow = WebFlowService::new(db_pool.clone(), osm.clone());

    let app_state = web::Data::new(AppState {
        db: db_pool.clone(),
        config: config.clone(),
        osm: osm.clone(),
        device_flow,
        web_flow,
        patrol_scores,
        score_updates: score_updates.clone(),
        outbox,
    });
    let health_state = web::Data::new(HealthState {
        db: db_pool.clone(),
        redis: redis.clone(),
    });

    let auth_state = AuthState {
        db: db_pool.clone(),
        osm: osm.clone(),
    };

    let authorize_limit = RateLimitConfig {
        max_requests: config.device.authorize_rate_limit,
        window_seconds: 60,
        scope: "device_authorize",
    };
    let entry_limit = RateLimitConfig {
        max_requests: config.device.entry_rate_limit,
        window_seconds: 60,
        scope: "device_entry",
    };

    let bind_address = format!("{}:{}", config.app.host, config.app.port);
    tracing::info!("Starting HTTP server at {bind_address}");

    let server_config = config.clone();
    let server_redis = redis.clone();
    let server_keyspace = keyspace.clone();
    let server = HttpServer::new(move || {
        let cors_builder = Cors::default();
        let mut cors = cors_builder;
        for origin in server_config.app.cors_allowed_origins.split(',') {
            let origin = origin.trim();
            if origin == "*" {
                cors = cors.allow_any_origin();
            } else {
                cors = cors.allowed_origin(origin);
            }
        }
        cors = cors
            .allow_any_method()
            .allow_any_header()
            .supports_credentials()
            .max_age(3600);

        let device_scope = web::scope(&server_config.app.device_path_prefix)
            .service(
                web::resource("/authorize")
                    .wrap(RateLimitMiddleware::new(
                        authorize_limit.clone(),
                        server_redis.clone(),
                        server_keyspace.clone(),
                    ))
                    .route(web::post().to(handlers::device::authorize)),
            )
            .service(web::resource("/token").route(web::post().to(handlers::device::token)))
            .service(
                web::resource("")
                    .wrap(RateLimitMiddleware::new(
                        entry_limit.clone(),
                        server_redis.clone(),
                        server_keyspace.clone(),
                    ))
                    .route(web::get().to(handlers::device::entry_page))
                    .route(web::post().to(handlers::device::entry_submit)),
            );

        let oauth_scope = web::scope(&server_config.app.oauth_path_prefix)
            .service(
                web::resource("/authorize")
                    .route(web::get().to(handlers::oauth::authorize))
                    .route(web::post().to(handlers::oauth::authorize)),
            )
            .service(web::resource("/callback").route(web::get().to(handlers::oauth::callback)))
            .service(
                web::resource("/select-section")
                    .route(web::post().to(handlers::oauth::select_section)),
            );

        let device_api = web::scope(&format!("{}/v1", server_config.app.api_path_prefix))
            .wrap(DeviceAuthMiddleware {
                state: auth_state.clone(),
            })
            .service(
                web::resource("/patrols")
                    .route(web::get().to(handlers::patrols::get_patrols))
                    .route(web::post().to(handlers::patrols::post_patrols)),
            );

        let admin_api = web::scope(&format!("{}/admin", server_config.app.api_path_prefix))
            .wrap(AdminAuthMiddleware {
                state: auth_state.clone(),
            })
            .service(web::resource("/session").route(web::get().to(handlers::admin::session)))
            .service(web::resource("/sections").route(web::get().to(handlers::admin::sections)))
            .service(
                web::resource("/sections/{section_id}/scores")
                    .route(web::get().to(handlers::admin::section_scores))
                    .route(web::post().to(handlers::admin::update_section_scores)),
            )
            .service(
                web::resource("/scoreboards").route(web::get().to(handlers::admin::scoreboards)),
            );

        App::new()
            .app_data(app_state.clone())
            .app_data(health_state.clone())
            .wrap(cors)
            .wrap(tracing_actix_web::TracingLogger::default())
            .route("/metrics", web::get().to(metrics::serve_metrics))
            .route("/healthz", web::get().to(handlers::health::liveness))
            .route("/readyz", web::get().to(handlers::health::readiness))
            .service(device_scope)
            .service(oauth_scope)
            .service(device_api)
            .service(admin_api)
    })
    .bind(&bind_address)?
    .run();

    let server_handle = server.handle();

    let (shutdown_tx, _) = broadcast::channel(1);
    let mut tasks: JoinSet<io::Result<()>> = JoinSet::new();

    tasks.spawn(async move {
        tracing::info!("HTTP server is running");
        server.await
    });

    let worker = OutboxWorker::new(
        db_pool.clone(),
        osm.clone(),
        score_updates,
        Duration::from_secs(config.jobs.worker_interval_secs),
    );
    let worker_shutdown = shutdown_tx.subscribe();
    tasks.spawn(async move {
        worker.run(worker_shutdown).await;
        Ok(())
    });

    let cleanup = CleanupJob::new(
        db_pool.clone(),
        Duration::from_secs(config.jobs.cleanup_interval_secs),
        config.jobs.idle_device_days,
    );
    let cleanup_shutdown = shutdown_tx.subscribe();
    tasks.spawn(async move {
        cleanup.run(cleanup_shutdown).await;
        Ok(())
    });

    let mut first_error: Option<io::Error> = None;

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            result = tasks.join_next() => {
                match result {
                    Some(Ok(Ok(_))) => {
                        tracing::info!("Background task completed");
                    }
                    Some(Ok(Err(e))) => {
                        tracing::error!("Task returned error: {e}");
                        if first_error.is_none() {
                            first_error = Some(e);
                        }
                        let _ = shutdown_tx.send(());
                        server_handle.stop(true).await;
                        tasks.shutdown().await;
                        break;
                    }
                    Some(Err(e)) => {
                        tracing::error!("Task join error: {e}");
                        if first_error.is_none() {
                            first_error = Some(io::Error::new(io::ErrorKind::Other, e.to_string()));
                        }
                        let _ = shutdown_tx.send(());
                        server_handle.stop(true).await;
                        tasks.shutdown().await;
                        break;
                    }
                    None => break,
                }
            }
            _ = &mut shutdown => {
                tracing::info!("Shutdown signal received");
                let _ = shutdown_tx.send(());
                server_handle.stop(true).await;
                tasks.shutdown().await;
                break;
            }
        }
    }

    tracing::info!("gateway-service shutting down");

    match first_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}
