//! Instagram Graph API surface used by the engine and the backtrack job.

mod creds;
mod sender;

pub use creds::InstagramCredentials;
pub use sender::GraphClient;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::automation::ReplyTemplate;
use crate::error::CoreResult;

/// Result of a send call; `message_id` is the provider-assigned id when the
/// response carried one.
#[derive(Debug, Clone, Default)]
pub struct SendReceipt {
    pub message_id: Option<String>,
    pub raw: Option<Value>,
}

/// One comment as returned by `GET /{media}/comments`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchedComment {
    pub id: String,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub from_id: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub timestamp: Option<String>,
}

/// A page of comments plus the cursor for the next page, if any.
#[derive(Debug, Clone, Default)]
pub struct CommentPage {
    pub comments: Vec<FetchedComment>,
    pub after: Option<String>,
}

/// Everything the engine needs from the Graph API. `GraphClient` is the real
/// implementation; tests substitute fakes at this seam.
#[async_trait]
pub trait InstagramApi: Send + Sync {
    /// Public reply posted under a comment (`POST /{comment}/replies`).
    async fn reply_to_comment(
        &self,
        creds: &InstagramCredentials,
        comment_id: &str,
        text: &str,
    ) -> CoreResult<SendReceipt>;

    /// Private reply DM addressed by comment id.
    async fn send_private_reply(
        &self,
        creds: &InstagramCredentials,
        comment_id: &str,
        template: &ReplyTemplate,
    ) -> CoreResult<SendReceipt>;

    /// Ordinary DM addressed by user id.
    async fn send_direct_message(
        &self,
        creds: &InstagramCredentials,
        recipient_id: &str,
        template: &ReplyTemplate,
    ) -> CoreResult<SendReceipt>;

    /// Whether `user_id` follows the business account.
    async fn is_follower(
        &self,
        creds: &InstagramCredentials,
        user_id: &str,
    ) -> CoreResult<bool>;

    async fn list_comments(
        &self,
        creds: &InstagramCredentials,
        media_id: &str,
        after: Option<&str>,
    ) -> CoreResult<CommentPage>;
}
