//! Instagram webhook ingress: verifies Meta webhook signatures, normalizes
//! comment and messaging events, and runs them through the reply engine.
//!
//! Meta calls `GET /webhook/instagram` once for subscription verification and
//! `POST /webhook/instagram` for events. Dispatch failures are dead-lettered
//! by the engine, so the endpoint answers 200 for any verified payload and
//! Meta does not replay it.

use std::sync::Arc;

use anyhow::Result;
use axum::{
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::get,
    Router,
};
use gf_cache::SharedCache;
use gf_core::{CommentEvent, DmEvent, GraphClient};
use gf_engine::{rate::AccountRateLimiter, Engine};
use gf_idempotency::{
    IdempotencyConfig, IdempotencyGuard, InMemoryIdemStore, RedisIdemStore, SharedIdemStore,
};
use gf_store::{
    ContestScoringAutomations, MongoAutomationStore, MongoContestStore, MongoDeadLetterStore,
    MongoDeliveryStore, MongoUserStore,
};
use gf_telemetry::{install as init_telemetry, record_counter, EventLabels};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use serde_json::Value;
use sha2::Sha256;
use time::{format_description::well_known::Rfc3339, OffsetDateTime};

type HmacSha256 = Hmac<Sha256>;

#[derive(Clone)]
struct AppState {
    engine: Engine,
    app_secret: String,
    verify_token: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_telemetry("gramflow-ingress")?;

    let mongo_uri =
        std::env::var("MONGODB_URI").unwrap_or_else(|_| "mongodb://127.0.0.1:27017".into());
    let db_name = std::env::var("MONGODB_DB").unwrap_or_else(|_| "gramflow".into());
    let app_secret = std::env::var("IG_APP_SECRET")?;
    let verify_token = std::env::var("IG_VERIFY_TOKEN")?;

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
    let contest = Arc::new(MongoContestStore::new(&db).await?);
    let deliveries = Arc::new(MongoDeliveryStore::new(&db).await?);
    let users = Arc::new(MongoUserStore::new(&db).await?);
    let dead_letters = Arc::new(MongoDeadLetterStore::new(&db, "ingress").await?);

    let api = Arc::new(GraphClient::from_env(reqwest::Client::new()));
    let engine = Engine::new(
        Arc::new(ContestScoringAutomations::new(automations, contest)),
        deliveries,
        users,
        api,
        dead_letters,
        IdempotencyGuard::new(idem_store, idem_cfg.ttl_hours),
        AccountRateLimiter::from_env(),
    );

    let state = AppState {
        engine,
        app_secret,
        verify_token,
    };

    let app = router(state);

    let addr: std::net::SocketAddr = std::env::var("BIND")
        .unwrap_or_else(|_| "0.0.0.0:8081".into())
        .parse()?;
    tracing::info!("ingress-instagram listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app.into_make_service()).await?;
    Ok(())
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/webhook/instagram", get(verify).post(receive))
        .route("/healthz", get(healthz))
        .with_state(state)
}

#[derive(Deserialize)]
struct VerifyQs {
    #[serde(rename = "hub.mode")]
    mode: Option<String>,
    #[serde(rename = "hub.challenge")]
    challenge: Option<String>,
    #[serde(rename = "hub.verify_token")]
    token: Option<String>,
}

async fn verify(State(state): State<AppState>, Query(q): Query<VerifyQs>) -> impl IntoResponse {
    if q.mode.as_deref() == Some("subscribe") && q.token.as_deref() == Some(&state.verify_token) {
        (StatusCode::OK, q.challenge.unwrap_or_default())
    } else {
        (StatusCode::FORBIDDEN, "forbidden".to_string())
    }
}

async fn receive(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> impl IntoResponse {
    if !verify_meta_sig(&state.app_secret, &headers, &body) {
        tracing::warn!("invalid instagram webhook signature");
        return StatusCode::UNAUTHORIZED;
    }

    let payload: Value = match serde_json::from_slice(&body) {
        Ok(v) => v,
        Err(e) => {
            tracing::warn!("failed to decode payload: {e}");
            return StatusCode::BAD_REQUEST;
        }
    };

    for event in extract_comment_events(&payload) {
        record_counter(
            "ingress_events_total",
            1,
            &EventLabels::new(&event.account_id).with_surface("comments"),
        );
        match state.engine.process_comment(&event).await {
            Ok(outcome) => {
                tracing::debug!(
                    account = %event.account_id,
                    comment = %event.comment_id,
                    ?outcome,
                    "comment processed"
                );
            }
            Err(err) => {
                tracing::error!(
                    account = %event.account_id,
                    comment = %event.comment_id,
                    error = %err,
                    "comment dispatch failed"
                );
            }
        }
    }

    for event in extract_dm_events(&payload) {
        record_counter(
            "ingress_events_total",
            1,
            &EventLabels::new(&event.account_id).with_surface("dm"),
        );
        match state.engine.process_dm(&event).await {
            Ok(outcome) => {
                tracing::debug!(
                    account = %event.account_id,
                    message = %event.message_id,
                    ?outcome,
                    "dm processed"
                );
            }
            Err(err) => {
                tracing::error!(
                    account = %event.account_id,
                    message = %event.message_id,
                    error = %err,
                    "dm dispatch failed"
                );
            }
        }
    }

    StatusCode::OK
}

async fn healthz() -> impl IntoResponse {
    StatusCode::NO_CONTENT
}

fn verify_meta_sig(app_secret: &str, headers: &HeaderMap, body: &[u8]) -> bool {
    let sig = headers
        .get("X-Hub-Signature-256")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if !sig.starts_with("sha256=") {
        return false;
    }
    let provided = &sig[7..];
    let mut mac = match HmacSha256::new_from_slice(app_secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return false,
    };
    mac.update(body);
    let digest = mac.finalize().into_bytes();
    constant_time_eq(provided.as_bytes(), hex::encode(digest).as_bytes())
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

/// Comment change notifications: `entry[].changes[]` with `field == "comments"`.
fn extract_comment_events(payload: &Value) -> Vec<CommentEvent> {
    let mut out = Vec::new();
    let Some(entries) = payload.get("entry").and_then(|v| v.as_array()) else {
        return out;
    };

    for entry in entries {
        let Some(account_id) = entry.get("id").and_then(|v| v.as_str()) else {
            continue;
        };
        let entry_ts = entry.get("time").and_then(|v| v.as_i64());
        let Some(changes) = entry.get("changes").and_then(|v| v.as_array()) else {
            continue;
        };
        for change in changes {
            if change.get("field").and_then(|v| v.as_str()) != Some("comments") {
                continue;
            }
            let Some(value) = change.get("value") else {
                continue;
            };
            let Some(comment_id) = value.get("id").and_then(|v| v.as_str()) else {
                continue;
            };
            let Some(media_id) = value
                .get("media")
                .and_then(|m| m.get("id"))
                .and_then(|v| v.as_str())
            else {
                continue;
            };
            let Some(commenter_id) = value
                .get("from")
                .and_then(|f| f.get("id"))
                .and_then(|v| v.as_str())
            else {
                continue;
            };
            out.push(CommentEvent {
                account_id: account_id.to_string(),
                media_id: media_id.to_string(),
                comment_id: comment_id.to_string(),
                commenter_id: commenter_id.to_string(),
                commenter_username: value
                    .get("from")
                    .and_then(|f| f.get("username"))
                    .and_then(|v| v.as_str())
                    .map(String::from),
                text: value.get("text").and_then(|v| v.as_str()).map(String::from),
                timestamp: unix_to_rfc3339(entry_ts),
            });
        }
    }
    out
}

/// Messaging notifications: `entry[].messaging[]`. Echoes of our own sends
/// are dropped here; the engine filters by sender id as well.
fn extract_dm_events(payload: &Value) -> Vec<DmEvent> {
    let mut out = Vec::new();
    let Some(entries) = payload.get("entry").and_then(|v| v.as_array()) else {
        return out;
    };

    for entry in entries {
        let Some(account_id) = entry.get("id").and_then(|v| v.as_str()) else {
            continue;
        };
        let Some(messaging) = entry.get("messaging").and_then(|v| v.as_array()) else {
            continue;
        };
        for item in messaging {
            let Some(message) = item.get("message") else {
                continue;
            };
            if message
                .get("is_echo")
                .and_then(|v| v.as_bool())
                .unwrap_or(false)
            {
                continue;
            }
            let Some(sender_id) = item
                .get("sender")
                .and_then(|s| s.get("id"))
                .and_then(|v| v.as_str())
            else {
                continue;
            };
            let Some(message_id) = message.get("mid").and_then(|v| v.as_str()) else {
                continue;
            };
            // Messaging timestamps are milliseconds, unlike entry times.
            let ts = item
                .get("timestamp")
                .and_then(|v| v.as_i64())
                .map(|ms| ms / 1000);
            out.push(DmEvent {
                account_id: account_id.to_string(),
                sender_id: sender_id.to_string(),
                message_id: message_id.to_string(),
                text: message
                    .get("text")
                    .and_then(|v| v.as_str())
                    .map(String::from),
                timestamp: unix_to_rfc3339(ts),
            });
        }
    }
    out
}

fn unix_to_rfc3339(secs: Option<i64>) -> String {
    secs.and_then(|s| OffsetDateTime::from_unix_timestamp(s).ok())
        .unwrap_or_else(OffsetDateTime::now_utc)
        .format(&Rfc3339)
        .unwrap_or_else(|_| "1970-01-01T00:00:00Z".into())
}
