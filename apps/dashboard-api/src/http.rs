//! Router and REST handlers for the dashboard.
//!
//! Handlers talk to storage through the app-local traits below so tests can
//! run the router against in-memory fakes; `main` wires the Mongo
//! repositories in.

use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    extract::{Extension, Path, State},
    http::StatusCode,
    middleware,
    response::{IntoResponse, Redirect, Response},
    routing::{get, post},
    Json, Router,
};
use gf_core::{
    Automation, CoreError, CoreResult, CredentialResolver, FollowGate, InstagramApi,
    ReplyTemplate,
};
use gf_engine::Engine;
use gf_store::{ContestEntry, LinkDoc, MongoAutomationStore, MongoContestStore, MongoLinkStore,
    MongoUserStore, UserDoc};
use serde::Deserialize;
use tower_http::cors::CorsLayer;

use crate::auth::{self, AuthConfig, AuthUser};
use crate::backtrack;

#[async_trait]
pub trait AutomationAdmin: Send + Sync {
    async fn list(&self, account_id: &str) -> CoreResult<Vec<Automation>>;
    async fn get(&self, automation_id: &str) -> CoreResult<Option<Automation>>;
    async fn create(&self, automation: &Automation) -> CoreResult<()>;
    async fn update(&self, automation: &Automation) -> CoreResult<bool>;
    async fn delete(&self, automation_id: &str) -> CoreResult<bool>;
}

#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn upsert_from_oauth(
        &self,
        provider: &str,
        provider_user_id: &str,
        email: Option<String>,
        name: Option<String>,
        ig_user_id: Option<String>,
        ig_access_token: Option<String>,
    ) -> CoreResult<UserDoc>;
}

#[async_trait]
pub trait LinkRepo: Send + Sync {
    async fn create(&self, account_id: &str, target_url: &str) -> CoreResult<LinkDoc>;
    async fn resolve_and_count(&self, code: &str) -> CoreResult<Option<LinkDoc>>;
}

#[async_trait]
pub trait ContestRepo: Send + Sync {
    async fn register(&self, handle: &str, account_id: Option<String>)
        -> CoreResult<ContestEntry>;
    async fn approve(&self, entry_id: &str) -> CoreResult<bool>;
    async fn record_redirect(&self, account_id: &str) -> CoreResult<()>;
    async fn leaderboard(&self, limit: usize) -> CoreResult<Vec<ContestEntry>>;
}

#[async_trait]
impl AutomationAdmin for MongoAutomationStore {
    async fn list(&self, account_id: &str) -> CoreResult<Vec<Automation>> {
        self.list_for_account(account_id).await
    }
    async fn get(&self, automation_id: &str) -> CoreResult<Option<Automation>> {
        MongoAutomationStore::get(self, automation_id).await
    }
    async fn create(&self, automation: &Automation) -> CoreResult<()> {
        MongoAutomationStore::create(self, automation).await
    }
    async fn update(&self, automation: &Automation) -> CoreResult<bool> {
        MongoAutomationStore::update(self, automation).await
    }
    async fn delete(&self, automation_id: &str) -> CoreResult<bool> {
        MongoAutomationStore::delete(self, automation_id).await
    }
}

#[async_trait]
impl UserDirectory for MongoUserStore {
    async fn upsert_from_oauth(
        &self,
        provider: &str,
        provider_user_id: &str,
        email: Option<String>,
        name: Option<String>,
        ig_user_id: Option<String>,
        ig_access_token: Option<String>,
    ) -> CoreResult<UserDoc> {
        MongoUserStore::upsert_from_oauth(
            self,
            provider,
            provider_user_id,
            email,
            name,
            ig_user_id,
            ig_access_token,
        )
        .await
    }
}

#[async_trait]
impl LinkRepo for MongoLinkStore {
    async fn create(&self, account_id: &str, target_url: &str) -> CoreResult<LinkDoc> {
        MongoLinkStore::create(self, account_id, target_url).await
    }
    async fn resolve_and_count(&self, code: &str) -> CoreResult<Option<LinkDoc>> {
        MongoLinkStore::resolve_and_count(self, code).await
    }
}

#[async_trait]
impl ContestRepo for MongoContestStore {
    async fn register(
        &self,
        handle: &str,
        account_id: Option<String>,
    ) -> CoreResult<ContestEntry> {
        MongoContestStore::register(self, handle, account_id).await
    }
    async fn approve(&self, entry_id: &str) -> CoreResult<bool> {
        MongoContestStore::approve(self, entry_id).await
    }
    async fn record_redirect(&self, account_id: &str) -> CoreResult<()> {
        MongoContestStore::record_redirect(self, account_id).await
    }
    async fn leaderboard(&self, limit: usize) -> CoreResult<Vec<ContestEntry>> {
        MongoContestStore::leaderboard(self, limit).await
    }
}

#[derive(Clone)]
pub struct AppState {
    pub engine: Engine,
    pub api: Arc<dyn InstagramApi>,
    pub credentials: Arc<dyn CredentialResolver>,
    pub automations: Arc<dyn AutomationAdmin>,
    pub users: Arc<dyn UserDirectory>,
    pub links: Arc<dyn LinkRepo>,
    pub contest: Arc<dyn ContestRepo>,
    pub auth: Arc<AuthConfig>,
}

pub fn router(state: AppState) -> Router {
    let protected = Router::new()
        .route(
            "/api/automations",
            get(list_automations).post(create_automation),
        )
        .route(
            "/api/automations/{id}",
            get(get_automation)
                .put(update_automation)
                .delete(delete_automation),
        )
        .route("/api/automations/{id}/backtrack", post(backtrack::run))
        .route("/api/links", post(create_link))
        .route("/api/contest/entries", post(register_entry))
        .route("/api/contest/entries/{id}/approve", post(approve_entry))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_auth,
        ));

    Router::new()
        .route("/healthz", get(healthz))
        .route("/auth/{provider}/login", get(auth::login))
        .route("/auth/{provider}/callback", get(auth::callback))
        .route("/r/{code}", get(redirect_link))
        .route("/api/contest/leaderboard", get(leaderboard))
        .merge(protected)
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn healthz() -> impl IntoResponse {
    StatusCode::NO_CONTENT
}

fn error_response(err: CoreError) -> Response {
    let status = match err.code.as_str() {
        "automation_missing" => StatusCode::NOT_FOUND,
        "store_unavailable" => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    tracing::error!(code = %err.code, error = %err, "request failed");
    (
        status,
        Json(serde_json::json!({ "error": err.code, "message": err.message })),
    )
        .into_response()
}

fn require_account(user: &AuthUser) -> Result<String, Response> {
    user.account_id.clone().ok_or_else(|| {
        (
            StatusCode::CONFLICT,
            Json(serde_json::json!({ "error": "no_instagram_account" })),
        )
            .into_response()
    })
}

#[derive(Deserialize)]
pub struct AutomationPayload {
    #[serde(default)]
    pub media_id: Option<String>,
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub respond_to_all: bool,
    #[serde(default)]
    pub comment_reply: Option<String>,
    pub dm_reply: ReplyTemplate,
    #[serde(default)]
    pub follow_gate: Option<FollowGate>,
    /// 0 = unlimited.
    #[serde(default)]
    pub reply_limit: u32,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

async fn list_automations(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
) -> Response {
    let account_id = match require_account(&user) {
        Ok(account_id) => account_id,
        Err(resp) => return resp,
    };
    match state.automations.list(&account_id).await {
        Ok(automations) => Json(automations).into_response(),
        Err(err) => error_response(err),
    }
}

async fn create_automation(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Json(payload): Json<AutomationPayload>,
) -> Response {
    let account_id = match require_account(&user) {
        Ok(account_id) => account_id,
        Err(resp) => return resp,
    };
    let mut automation = Automation::new(account_id, payload.dm_reply);
    automation.media_id = payload.media_id;
    automation.keywords = payload.keywords;
    automation.respond_to_all = payload.respond_to_all;
    automation.comment_reply = payload.comment_reply;
    automation.follow_gate = payload.follow_gate;
    automation.reply_limit = payload.reply_limit;
    automation.replies_left = payload.reply_limit;
    automation.enabled = payload.enabled;

    match state.automations.create(&automation).await {
        Ok(()) => (StatusCode::CREATED, Json(automation)).into_response(),
        Err(err) => error_response(err),
    }
}

async fn get_automation(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<String>,
) -> Response {
    match fetch_owned(&state, &user, &id).await {
        Ok(automation) => Json(automation).into_response(),
        Err(resp) => resp,
    }
}

async fn update_automation(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<String>,
    Json(payload): Json<AutomationPayload>,
) -> Response {
    let mut automation = match fetch_owned(&state, &user, &id).await {
        Ok(automation) => automation,
        Err(resp) => return resp,
    };

    // The store owns `replies_left`: a claim landing between this read and
    // the write must survive, so the counter is never sent with the edit.
    // Changing `reply_limit` resets it to the new value inside the store.
    automation.media_id = payload.media_id;
    automation.keywords = payload.keywords;
    automation.respond_to_all = payload.respond_to_all;
    automation.comment_reply = payload.comment_reply;
    automation.dm_reply = payload.dm_reply;
    automation.follow_gate = payload.follow_gate;
    automation.reply_limit = payload.reply_limit;
    automation.enabled = payload.enabled;
    automation.updated_at = Some(gf_core::now_rfc3339());

    match state.automations.update(&automation).await {
        Ok(true) => match state.automations.get(&id).await {
            Ok(Some(stored)) => Json(stored).into_response(),
            Ok(None) => StatusCode::NOT_FOUND.into_response(),
            Err(err) => error_response(err),
        },
        Ok(false) => StatusCode::NOT_FOUND.into_response(),
        Err(err) => error_response(err),
    }
}

async fn delete_automation(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<String>,
) -> Response {
    if let Err(resp) = fetch_owned(&state, &user, &id).await {
        return resp;
    }
    match state.automations.delete(&id).await {
        Ok(true) => StatusCode::NO_CONTENT.into_response(),
        Ok(false) => StatusCode::NOT_FOUND.into_response(),
        Err(err) => error_response(err),
    }
}

/// Loads an automation and checks it belongs to the caller's account.
pub(crate) async fn fetch_owned(
    state: &AppState,
    user: &AuthUser,
    automation_id: &str,
) -> Result<Automation, Response> {
    let account_id = require_account(user)?;
    match state.automations.get(automation_id).await {
        Ok(Some(automation)) if automation.account_id == account_id => Ok(automation),
        Ok(Some(_)) | Ok(None) => Err(StatusCode::NOT_FOUND.into_response()),
        Err(err) => Err(error_response(err)),
    }
}

#[derive(Deserialize)]
struct CreateLink {
    target_url: String,
}

async fn create_link(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Json(payload): Json<CreateLink>,
) -> Response {
    let account_id = match require_account(&user) {
        Ok(account_id) => account_id,
        Err(resp) => return resp,
    };
    if url::Url::parse(&payload.target_url).is_err() {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({ "error": "invalid_url" })),
        )
            .into_response();
    }
    match state.links.create(&account_id, &payload.target_url).await {
        Ok(link) => (StatusCode::CREATED, Json(link)).into_response(),
        Err(err) => error_response(err),
    }
}

async fn redirect_link(State(state): State<AppState>, Path(code): Path<String>) -> Response {
    match state.links.resolve_and_count(&code).await {
        Ok(Some(link)) => {
            // Counts toward the owner's contest entry, if they have one.
            if let Err(err) = state.contest.record_redirect(&link.account_id).await {
                tracing::debug!(account = %link.account_id, error = %err, "contest redirect update failed");
            }
            Redirect::to(&link.target_url).into_response()
        }
        Ok(None) => StatusCode::NOT_FOUND.into_response(),
        Err(err) => error_response(err),
    }
}

#[derive(Deserialize)]
struct RegisterEntry {
    handle: String,
}

async fn register_entry(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Json(payload): Json<RegisterEntry>,
) -> Response {
    match state
        .contest
        .register(&payload.handle, user.account_id.clone())
        .await
    {
        Ok(entry) => (StatusCode::CREATED, Json(entry)).into_response(),
        Err(err) => error_response(err),
    }
}

async fn approve_entry(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<String>,
) -> Response {
    if !user.admin {
        return StatusCode::FORBIDDEN.into_response();
    }
    match state.contest.approve(&id).await {
        Ok(true) => StatusCode::NO_CONTENT.into_response(),
        Ok(false) => StatusCode::NOT_FOUND.into_response(),
        Err(err) => error_response(err),
    }
}

const LEADERBOARD_LIMIT: usize = 50;

async fn leaderboard(State(state): State<AppState>) -> Response {
    match state.contest.leaderboard(LEADERBOARD_LIMIT).await {
        Ok(entries) => Json(entries).into_response(),
        Err(err) => error_response(err),
    }
}
