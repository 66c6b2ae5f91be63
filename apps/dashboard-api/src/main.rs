//! Dashboard API: OAuth login, automation CRUD, backtrack replay, redirect
//! links with hit counting, and the contest leaderboard.

mod auth;
mod backtrack;
mod http;

use std::sync::Arc;

use anyhow::Result;
use gf_cache::SharedCache;
use gf_core::GraphClient;
use gf_engine::{rate::AccountRateLimiter, Engine};
use gf_idempotency::{
    IdempotencyConfig, IdempotencyGuard, InMemoryIdemStore, RedisIdemStore, SharedIdemStore,
};
use gf_store::{
    ContestScoringAutomations, MongoAutomationStore, MongoContestStore, MongoDeadLetterStore,
    MongoDeliveryStore, MongoLinkStore, MongoUserStore,
};
use gf_telemetry::install as init_telemetry;

#[tokio::main]
async fn main() -> Result<()> {
    init_telemetry("gramflow-dashboard")?;

    let mongo_uri =
        std::env::var("MONGODB_URI").unwrap_or_else(|_| "mongodb://127.0.0.1:27017".into());
    let db_name = std::env::var("MONGODB_DB").unwrap_or_else(|_| "gramflow".into());

    let idem_cfg = IdempotencyConfig::from_env();
    let db = gf_store::connect(&mongo_uri, &db_name).await?;

    let (cache, idem_store): (Option<SharedCache>, SharedIdemStore) =
        match std::env::var("REDIS_URL") {
            Ok(url) => (
                Some(Arc::new(
                    gf_cache::RedisCache::connect(&url, idem_cfg.namespace.clone()).await?,
                )),
                Arc::new(RedisIdemStore::connect(&url, idem_cfg.namespace.clone()).await?),
            ),
            Err(_) => {
                tracing::warn!("REDIS_URL unset, using in-process cache and dedup");
                (None, Arc::new(InMemoryIdemStore::new()))
            }
        };

    let automations = Arc::new(MongoAutomationStore::new(&db, cache).await?);
    let deliveries = Arc::new(MongoDeliveryStore::new(&db).await?);
    let users = Arc::new(MongoUserStore::new(&db).await?);
    let links = Arc::new(MongoLinkStore::new(&db).await?);
    let contest = Arc::new(MongoContestStore::new(&db).await?);
    let dead_letters = Arc::new(MongoDeadLetterStore::new(&db, "backtrack").await?);

    let http_client = reqwest::Client::new();
    let api = Arc::new(GraphClient::from_env(http_client.clone()));
    let engine = Engine::new(
        Arc::new(ContestScoringAutomations::new(
            automations.clone(),
            contest.clone(),
        )),
        deliveries,
        users.clone(),
        api.clone(),
        dead_letters,
        IdempotencyGuard::new(idem_store, idem_cfg.ttl_hours),
        AccountRateLimiter::from_env(),
    );

    let state = http::AppState {
        engine,
        api,
        credentials: users.clone(),
        automations,
        users,
        links,
        contest,
        auth: Arc::new(auth::AuthConfig::from_env(http_client)?),
    };

    let app = http::router(state);

    let addr: std::net::SocketAddr = std::env::var("BIND")
        .unwrap_or_else(|_| "0.0.0.0:8082".into())
        .parse()?;
    tracing::info!("dashboard-api listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app.into_make_service()).await?;
    Ok(())
}
