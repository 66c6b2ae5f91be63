use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::events::now_rfc3339;

/// A stored reply rule: trigger keywords (or respond-to-all) on an account's
/// media, a DM template, an optional public comment reply, an optional follow
/// gate, and a reply budget.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Automation {
    pub id: String,
    pub account_id: String,
    /// `None` applies to every media on the account (and to direct messages).
    #[serde(default)]
    pub media_id: Option<String>,
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub respond_to_all: bool,
    /// Public reply posted under the matched comment, when set.
    #[serde(default)]
    pub comment_reply: Option<String>,
    pub dm_reply: ReplyTemplate,
    #[serde(default)]
    pub follow_gate: Option<FollowGate>,
    /// 0 means unlimited.
    #[serde(default)]
    pub reply_limit: u32,
    #[serde(default)]
    pub replies_left: u32,
    #[serde(default)]
    pub hits: u64,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Unix seconds; used for deterministic tie-breaking.
    pub created_at: i64,
    #[serde(default)]
    pub updated_at: Option<String>,
}

fn default_enabled() -> bool {
    true
}

impl Automation {
    pub fn new(account_id: impl Into<String>, dm_reply: ReplyTemplate) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            account_id: account_id.into(),
            media_id: None,
            keywords: Vec::new(),
            respond_to_all: false,
            comment_reply: None,
            dm_reply,
            follow_gate: None,
            reply_limit: 0,
            replies_left: 0,
            hits: 0,
            enabled: true,
            created_at: time::OffsetDateTime::now_utc().unix_timestamp(),
            updated_at: Some(now_rfc3339()),
        }
    }

    pub fn is_unlimited(&self) -> bool {
        self.reply_limit == 0
    }

    /// Rules with no media binding also apply to direct messages.
    pub fn applies_to_dms(&self) -> bool {
        self.media_id.is_none()
    }

    pub fn applies_to_media(&self, media_id: &str) -> bool {
        match &self.media_id {
            Some(bound) => bound == media_id,
            None => true,
        }
    }
}

/// Requires the commenter to follow the account before the real reply goes
/// out. `not_follower_message` is sent first; `follow_up_message` once the
/// follow is observed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FollowGate {
    pub not_follower_message: String,
    pub follow_up_message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkButton {
    pub label: String,
    pub url: String,
}

/// DM payload shape. Rendered to Graph Send API JSON by the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ReplyTemplate {
    Text {
        text: String,
    },
    Buttons {
        text: String,
        buttons: Vec<LinkButton>,
    },
    Image {
        image_url: String,
        text: String,
        buttons: Vec<LinkButton>,
    },
}

impl ReplyTemplate {
    pub fn text(text: impl Into<String>) -> Self {
        ReplyTemplate::Text { text: text.into() }
    }
}
