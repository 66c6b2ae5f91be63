//! Persistence contracts. Implemented on MongoDB in `gf-store` and with
//! in-memory fakes in engine tests.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::automation::Automation;
use crate::error::CoreResult;
use crate::events::now_rfc3339;
use crate::instagram::InstagramCredentials;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryState {
    Replied,
    AwaitingFollow,
}

/// One row per (automation, recipient): the "already replied?" check and the
/// parking spot for follow-gated replies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryRecord {
    pub automation_id: String,
    pub account_id: String,
    pub recipient_id: String,
    pub state: DeliveryState,
    #[serde(default)]
    pub comment_id: Option<String>,
    pub ts: String,
}

impl DeliveryRecord {
    pub fn replied(
        automation_id: impl Into<String>,
        account_id: impl Into<String>,
        recipient_id: impl Into<String>,
        comment_id: Option<String>,
    ) -> Self {
        Self {
            automation_id: automation_id.into(),
            account_id: account_id.into(),
            recipient_id: recipient_id.into(),
            state: DeliveryState::Replied,
            comment_id,
            ts: now_rfc3339(),
        }
    }

    pub fn awaiting_follow(
        automation_id: impl Into<String>,
        account_id: impl Into<String>,
        recipient_id: impl Into<String>,
        comment_id: Option<String>,
    ) -> Self {
        Self {
            automation_id: automation_id.into(),
            account_id: account_id.into(),
            recipient_id: recipient_id.into(),
            state: DeliveryState::AwaitingFollow,
            comment_id,
            ts: now_rfc3339(),
        }
    }
}

#[async_trait]
pub trait AutomationStore: Send + Sync {
    /// Enabled automations for an account, oldest first.
    async fn list_enabled(&self, account_id: &str) -> CoreResult<Vec<Automation>>;

    /// Atomically takes one unit of the reply budget. Returns `false` when the
    /// budget is exhausted. Unlimited automations always succeed.
    async fn claim_reply_slot(&self, automation_id: &str) -> CoreResult<bool>;

    /// Returns a unit taken by a send that did not happen.
    async fn refund_reply_slot(&self, automation_id: &str) -> CoreResult<()>;

    async fn record_hit(&self, automation_id: &str) -> CoreResult<()>;
}

#[async_trait]
pub trait DeliveryStore: Send + Sync {
    async fn find(
        &self,
        automation_id: &str,
        recipient_id: &str,
    ) -> CoreResult<Option<DeliveryRecord>>;

    async fn put(&self, record: DeliveryRecord) -> CoreResult<()>;

    /// Parked follow-gated deliveries for a recipient across the account.
    async fn awaiting_follow(
        &self,
        account_id: &str,
        recipient_id: &str,
    ) -> CoreResult<Vec<DeliveryRecord>>;

    async fn mark_replied(&self, automation_id: &str, recipient_id: &str) -> CoreResult<()>;

    /// Drops a record outright. Used for parked deliveries whose automation
    /// was deleted, disabled, or lost its gate; they can never be released.
    async fn remove(&self, automation_id: &str, recipient_id: &str) -> CoreResult<()>;
}

/// Error metadata stored alongside each dead-lettered event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterRecord {
    pub account_id: String,
    pub stage: String,
    pub code: String,
    pub message: String,
    pub event_id: String,
    pub envelope: Value,
    pub ts: String,
}

impl DeadLetterRecord {
    pub fn new(
        account_id: impl Into<String>,
        stage: impl Into<String>,
        code: impl Into<String>,
        message: impl Into<String>,
        event_id: impl Into<String>,
        envelope: Value,
    ) -> Self {
        Self {
            account_id: account_id.into(),
            stage: stage.into(),
            code: code.into(),
            message: message.into(),
            event_id: event_id.into(),
            envelope,
            ts: now_rfc3339(),
        }
    }
}

/// Sink for events the engine could not dispatch after the budget was spent.
#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    async fn publish(&self, record: DeadLetterRecord) -> CoreResult<()>;
}

/// Resolves the Graph API credentials stored for an account.
#[async_trait]
pub trait CredentialResolver: Send + Sync {
    async fn credentials(&self, account_id: &str) -> CoreResult<Option<InstagramCredentials>>;
}
