//! OAuth login (Google + Instagram) and bearer-JWT session handling.
//!
//! The `state` parameter round-tripped through the provider is
//! `base64url(provider|nonce)`; the callback refuses a state minted for a
//! different provider. A `token_url` starting with `mock://` short-circuits
//! the code exchange for tests.

use std::collections::HashMap;

use axum::{
    extract::{Path, Query, Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Redirect, Response},
    Json,
};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use rand::{distr::Alphanumeric, Rng};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::http::AppState;

const TOKEN_TTL_HOURS: i64 = 72;

#[derive(Clone)]
pub struct ProviderConfig {
    pub authorize_url: String,
    pub token_url: String,
    pub userinfo_url: Option<String>,
    pub client_id: String,
    pub client_secret: String,
    pub redirect_uri: String,
    pub scope: String,
}

#[derive(Clone)]
pub struct AuthConfig {
    pub jwt_secret: String,
    pub providers: HashMap<String, ProviderConfig>,
    pub http: reqwest::Client,
}

impl AuthConfig {
    /// Providers whose client id is configured are enabled; the rest 404.
    pub fn from_env(http: reqwest::Client) -> anyhow::Result<Self> {
        let jwt_secret = std::env::var("JWT_SECRET")?;
        let base_url =
            std::env::var("PUBLIC_BASE_URL").unwrap_or_else(|_| "http://localhost:8082".into());
        let mut providers = HashMap::new();

        if let Ok(client_id) = std::env::var("GOOGLE_CLIENT_ID") {
            providers.insert(
                "google".to_string(),
                ProviderConfig {
                    authorize_url: "https://accounts.google.com/o/oauth2/v2/auth".into(),
                    token_url: std::env::var("GOOGLE_TOKEN_URL")
                        .unwrap_or_else(|_| "https://oauth2.googleapis.com/token".into()),
                    userinfo_url: Some(
                        "https://openidconnect.googleapis.com/v1/userinfo".into(),
                    ),
                    client_id,
                    client_secret: std::env::var("GOOGLE_CLIENT_SECRET").unwrap_or_default(),
                    redirect_uri: format!("{base_url}/auth/google/callback"),
                    scope: "openid email profile".into(),
                },
            );
        }
        if let Ok(client_id) = std::env::var("IG_CLIENT_ID") {
            providers.insert(
                "instagram".to_string(),
                ProviderConfig {
                    authorize_url: "https://api.instagram.com/oauth/authorize".into(),
                    token_url: std::env::var("IG_TOKEN_URL")
                        .unwrap_or_else(|_| "https://api.instagram.com/oauth/access_token".into()),
                    userinfo_url: None,
                    client_id,
                    client_secret: std::env::var("IG_CLIENT_SECRET").unwrap_or_default(),
                    redirect_uri: format!("{base_url}/auth/instagram/callback"),
                    scope: "instagram_business_basic,instagram_business_manage_messages,instagram_business_manage_comments".into(),
                },
            );
        }

        Ok(Self {
            jwt_secret,
            providers,
            http,
        })
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    /// Connected IG business account, when any.
    #[serde(default)]
    pub account: Option<String>,
    #[serde(default)]
    pub admin: bool,
    pub exp: i64,
}

/// Request identity injected by [`require_auth`].
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub user_id: String,
    pub account_id: Option<String>,
    pub admin: bool,
}

pub fn issue_token(
    config: &AuthConfig,
    user_id: &str,
    account_id: Option<String>,
    admin: bool,
) -> anyhow::Result<String> {
    let claims = Claims {
        sub: user_id.to_string(),
        account: account_id,
        admin,
        exp: (OffsetDateTime::now_utc() + time::Duration::hours(TOKEN_TTL_HOURS))
            .unix_timestamp(),
    };
    Ok(encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(config.jwt_secret.as_bytes()),
    )?)
}

pub fn verify_token(config: &AuthConfig, token: &str) -> Option<AuthUser> {
    let data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(config.jwt_secret.as_bytes()),
        &Validation::default(),
    )
    .ok()?;
    Some(AuthUser {
        user_id: data.claims.sub,
        account_id: data.claims.account,
        admin: data.claims.admin,
    })
}

pub async fn require_auth(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Response {
    let token = request
        .headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    let Some(user) = token.and_then(|t| verify_token(&state.auth, t)) else {
        return (
            StatusCode::UNAUTHORIZED,
            Json(serde_json::json!({ "error": "missing or invalid token" })),
        )
            .into_response();
    };
    request.extensions_mut().insert(user);
    next.run(request).await
}

pub async fn login(
    State(state): State<AppState>,
    Path(provider): Path<String>,
) -> impl IntoResponse {
    let Some(config) = state.auth.providers.get(&provider) else {
        return (StatusCode::NOT_FOUND, "unknown provider").into_response();
    };
    let nonce: String = rand::rng()
        .sample_iter(&Alphanumeric)
        .take(12)
        .map(char::from)
        .collect();
    let oauth_state = URL_SAFE_NO_PAD.encode(format!("{provider}|{nonce}"));

    let authorize = format!(
        "{}?client_id={}&redirect_uri={}&scope={}&response_type=code&state={}",
        config.authorize_url,
        urlencoding::encode(&config.client_id),
        urlencoding::encode(&config.redirect_uri),
        urlencoding::encode(&config.scope),
        oauth_state,
    );
    Redirect::temporary(&authorize).into_response()
}

#[derive(Deserialize)]
pub struct CallbackQuery {
    code: String,
    state: String,
}

pub async fn callback(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    Query(query): Query<CallbackQuery>,
) -> Response {
    match handle_callback(&state, &provider, query).await {
        Ok(value) => (StatusCode::OK, Json(value)).into_response(),
        Err(err) => {
            tracing::error!(provider = %provider, error = %err, "oauth callback failed");
            (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({ "error": err.to_string() })),
            )
                .into_response()
        }
    }
}

async fn handle_callback(
    state: &AppState,
    provider: &str,
    query: CallbackQuery,
) -> anyhow::Result<serde_json::Value> {
    let config = state
        .auth
        .providers
        .get(provider)
        .ok_or_else(|| anyhow::anyhow!("unknown provider {provider}"))?;

    let state_provider = decode_state(&query.state)?;
    if state_provider != provider {
        return Err(anyhow::anyhow!("state was minted for another provider"));
    }

    let identity = exchange_code(&state.auth.http, provider, config, &query.code).await?;
    let user = state
        .users
        .upsert_from_oauth(
            provider,
            &identity.provider_user_id,
            identity.email,
            identity.name,
            identity.ig_user_id,
            identity.ig_access_token,
        )
        .await
        .map_err(|err| anyhow::anyhow!("user upsert failed: {err}"))?;

    let token = issue_token(&state.auth, &user.id, user.ig_user_id.clone(), user.is_admin)?;
    Ok(serde_json::json!({
        "token": token,
        "user_id": user.id,
        "account_id": user.ig_user_id,
    }))
}

fn decode_state(raw: &str) -> anyhow::Result<String> {
    let decoded = URL_SAFE_NO_PAD
        .decode(raw)
        .map_err(|err| anyhow::anyhow!("invalid state: {err}"))?;
    let decoded = String::from_utf8(decoded)?;
    let provider = decoded
        .split('|')
        .next()
        .filter(|p| !p.is_empty())
        .ok_or_else(|| anyhow::anyhow!("state missing provider"))?;
    Ok(provider.to_string())
}

struct OAuthIdentity {
    provider_user_id: String,
    email: Option<String>,
    name: Option<String>,
    ig_user_id: Option<String>,
    ig_access_token: Option<String>,
}

async fn exchange_code(
    http: &reqwest::Client,
    provider: &str,
    config: &ProviderConfig,
    code: &str,
) -> anyhow::Result<OAuthIdentity> {
    if config.token_url.starts_with("mock://") {
        return Ok(match provider {
            "instagram" => OAuthIdentity {
                provider_user_id: "17841400000000000".into(),
                email: None,
                name: Some("mockgram".into()),
                ig_user_id: Some("17841400000000000".into()),
                ig_access_token: Some(format!("mock-token:{code}")),
            },
            _ => OAuthIdentity {
                provider_user_id: "mock-google-sub".into(),
                email: Some("creator@example.com".into()),
                name: Some("Mock Creator".into()),
                ig_user_id: None,
                ig_access_token: None,
            },
        });
    }

    let params = [
        ("client_id", config.client_id.as_str()),
        ("client_secret", config.client_secret.as_str()),
        ("grant_type", "authorization_code"),
        ("redirect_uri", config.redirect_uri.as_str()),
        ("code", code),
    ];
    let token_response: serde_json::Value = http
        .post(&config.token_url)
        .form(&params)
        .send()
        .await?
        .error_for_status()?
        .json()
        .await?;

    let access_token = token_response
        .get("access_token")
        .and_then(|v| v.as_str())
        .ok_or_else(|| anyhow::anyhow!("token response missing access_token"))?
        .to_string();

    if provider == "instagram" {
        // The short-lived token response carries the IG user id directly.
        let user_id = token_response
            .get("user_id")
            .map(|v| match v {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .ok_or_else(|| anyhow::anyhow!("token response missing user_id"))?;
        return Ok(OAuthIdentity {
            provider_user_id: user_id.clone(),
            email: None,
            name: None,
            ig_user_id: Some(user_id),
            ig_access_token: Some(access_token),
        });
    }

    let userinfo_url = config
        .userinfo_url
        .as_ref()
        .ok_or_else(|| anyhow::anyhow!("provider has no userinfo endpoint"))?;
    let userinfo: serde_json::Value = http
        .get(userinfo_url)
        .bearer_auth(&access_token)
        .send()
        .await?
        .error_for_status()?
        .json()
        .await?;
    let sub = userinfo
        .get("sub")
        .and_then(|v| v.as_str())
        .ok_or_else(|| anyhow::anyhow!("userinfo missing sub"))?
        .to_string();
    Ok(OAuthIdentity {
        provider_user_id: sub,
        email: userinfo
            .get("email")
            .and_then(|v| v.as_str())
            .map(String::from),
        name: userinfo
            .get("name")
            .and_then(|v| v.as_str())
            .map(String::from),
        ig_user_id: None,
        ig_access_token: None,
    })
}
