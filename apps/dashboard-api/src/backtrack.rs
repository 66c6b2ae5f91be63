//! Backtrack replay: fetch historical comments for an automation's media and
//! run every one through the same engine entry point the webhook uses. The
//! shared idempotency layer makes overlap with live traffic harmless.

use axum::{
    extract::{Extension, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use gf_core::{now_rfc3339, CommentEvent, FetchedComment};
use gf_engine::{Outcome, SkipReason};
use serde::{Deserialize, Serialize};

use crate::auth::AuthUser;
use crate::http::{fetch_owned, AppState};

const MAX_PAGES: usize = 50;

#[derive(Debug, Default, Serialize, PartialEq, Eq)]
pub struct SkippedBreakdown {
    pub duplicate: u64,
    pub no_match: u64,
    pub already_replied: u64,
    pub budget_exhausted: u64,
    pub awaiting_follow: u64,
    pub self_comment: u64,
}

#[derive(Debug, Default, Serialize, PartialEq, Eq)]
pub struct BacktrackSummary {
    pub fetched: u64,
    pub replied: u64,
    pub skipped: SkippedBreakdown,
    pub failed: u64,
}

impl BacktrackSummary {
    fn tally(&mut self, outcome: &Outcome) {
        match outcome {
            Outcome::Replied { .. } => self.replied += 1,
            Outcome::GatePending { .. } => self.skipped.awaiting_follow += 1,
            Outcome::Skipped(reason) => match reason {
                SkipReason::Duplicate => self.skipped.duplicate += 1,
                SkipReason::NoMatch => self.skipped.no_match += 1,
                SkipReason::AlreadyReplied => self.skipped.already_replied += 1,
                SkipReason::AwaitingFollow => self.skipped.awaiting_follow += 1,
                SkipReason::BudgetExhausted => self.skipped.budget_exhausted += 1,
                SkipReason::SelfComment | SkipReason::Echo => self.skipped.self_comment += 1,
                SkipReason::NoCredentials => self.failed += 1,
            },
        }
    }
}

#[derive(Deserialize, Default)]
pub struct BacktrackRequest {
    /// Required when the automation is not bound to a media.
    #[serde(default)]
    pub media_id: Option<String>,
}

pub async fn run(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<String>,
    payload: Option<Json<BacktrackRequest>>,
) -> Response {
    let automation = match fetch_owned(&state, &user, &id).await {
        Ok(automation) => automation,
        Err(resp) => return resp,
    };

    let requested = payload.map(|Json(req)| req).unwrap_or_default();
    let Some(media_id) = requested.media_id.or_else(|| automation.media_id.clone()) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({ "error": "media_id_required" })),
        )
            .into_response();
    };

    let creds = match state.credentials.credentials(&automation.account_id).await {
        Ok(Some(creds)) => creds,
        Ok(None) => {
            return (
                StatusCode::CONFLICT,
                Json(serde_json::json!({ "error": "no_instagram_account" })),
            )
                .into_response();
        }
        Err(err) => {
            tracing::error!(error = %err, "credential lookup failed");
            return StatusCode::SERVICE_UNAVAILABLE.into_response();
        }
    };

    let mut summary = BacktrackSummary::default();
    let mut after: Option<String> = None;

    for _ in 0..MAX_PAGES {
        let page = match state
            .api
            .list_comments(&creds, &media_id, after.as_deref())
            .await
        {
            Ok(page) => page,
            Err(err) => {
                tracing::error!(
                    account = %automation.account_id,
                    media = %media_id,
                    error = %err,
                    "comment fetch failed"
                );
                return (
                    StatusCode::BAD_GATEWAY,
                    Json(serde_json::json!({ "error": err.code, "partial": summary })),
                )
                    .into_response();
            }
        };

        for comment in &page.comments {
            summary.fetched += 1;
            let Some(event) = comment_event(&automation.account_id, &media_id, comment) else {
                summary.failed += 1;
                continue;
            };
            match state.engine.process_comment(&event).await {
                Ok(outcome) => summary.tally(&outcome),
                Err(err) => {
                    tracing::warn!(
                        comment = %event.comment_id,
                        error = %err,
                        "backtrack dispatch failed"
                    );
                    summary.failed += 1;
                }
            }
        }

        after = page.after;
        if after.is_none() {
            break;
        }
    }

    tracing::info!(
        account = %automation.account_id,
        automation = %automation.id,
        media = %media_id,
        fetched = summary.fetched,
        replied = summary.replied,
        failed = summary.failed,
        "backtrack finished"
    );
    Json(summary).into_response()
}

fn comment_event(
    account_id: &str,
    media_id: &str,
    comment: &FetchedComment,
) -> Option<CommentEvent> {
    let commenter_id = comment.from_id.clone()?;
    Some(CommentEvent {
        account_id: account_id.to_string(),
        media_id: media_id.to_string(),
        comment_id: comment.id.clone(),
        commenter_id,
        commenter_username: comment.username.clone(),
        text: comment.text.clone(),
        timestamp: comment.timestamp.clone().unwrap_or_else(now_rfc3339),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tally_maps_outcomes_to_buckets() {
        let mut summary = BacktrackSummary::default();
        summary.tally(&Outcome::Replied {
            automation_id: "a".into(),
            comment_reply_sent: false,
            dm_sent: true,
        });
        summary.tally(&Outcome::GatePending {
            automation_id: "a".into(),
        });
        summary.tally(&Outcome::Skipped(SkipReason::Duplicate));
        summary.tally(&Outcome::Skipped(SkipReason::BudgetExhausted));
        summary.tally(&Outcome::Skipped(SkipReason::SelfComment));

        assert_eq!(summary.replied, 1);
        assert_eq!(summary.skipped.awaiting_follow, 1);
        assert_eq!(summary.skipped.duplicate, 1);
        assert_eq!(summary.skipped.budget_exhausted, 1);
        assert_eq!(summary.skipped.self_comment, 1);
    }

    #[test]
    fn comments_without_author_are_unusable() {
        let comment = FetchedComment {
            id: "c1".into(),
            text: Some("hi".into()),
            from_id: None,
            username: None,
            timestamp: None,
        };
        assert!(comment_event("acct", "media", &comment).is_none());
    }
}
