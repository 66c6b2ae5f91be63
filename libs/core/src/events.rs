use serde::{Deserialize, Serialize};
use time::{format_description::well_known::Rfc3339, OffsetDateTime};

/// Current time as an RFC 3339 string, the timestamp format used in every
/// stored record and wire payload.
pub fn now_rfc3339() -> String {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_else(|_| "1970-01-01T00:00:00Z".into())
}

/// Normalized comment, whether it arrived via webhook or a backtrack fetch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommentEvent {
    pub account_id: String,
    pub media_id: String,
    pub comment_id: String,
    pub commenter_id: String,
    #[serde(default)]
    pub commenter_username: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
    pub timestamp: String,
}

impl CommentEvent {
    /// Dedup key: one reply decision per comment per account.
    pub fn idem_key(&self) -> String {
        format!(
            "{}:{}:{}",
            self.account_id, self.media_id, self.comment_id
        )
    }

    pub fn is_self_comment(&self) -> bool {
        self.commenter_id == self.account_id
    }
}

/// Normalized inbound direct message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DmEvent {
    pub account_id: String,
    pub sender_id: String,
    pub message_id: String,
    #[serde(default)]
    pub text: Option<String>,
    pub timestamp: String,
}

impl DmEvent {
    pub fn idem_key(&self) -> String {
        format!("{}:dm:{}", self.account_id, self.message_id)
    }

    pub fn is_echo(&self) -> bool {
        self.sender_id == self.account_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_comment() -> CommentEvent {
        CommentEvent {
            account_id: "acct".into(),
            media_id: "media".into(),
            comment_id: "c1".into(),
            commenter_id: "user".into(),
            commenter_username: Some("fan".into()),
            text: Some("price?".into()),
            timestamp: "2025-01-01T00:00:00Z".into(),
        }
    }

    #[test]
    fn comment_idem_key_is_scoped() {
        assert_eq!(sample_comment().idem_key(), "acct:media:c1");
    }

    #[test]
    fn self_comments_are_flagged() {
        let mut event = sample_comment();
        assert!(!event.is_self_comment());
        event.commenter_id = "acct".into();
        assert!(event.is_self_comment());
    }

    #[test]
    fn dm_idem_key_uses_dm_namespace() {
        let dm = DmEvent {
            account_id: "acct".into(),
            sender_id: "user".into(),
            message_id: "m1".into(),
            text: None,
            timestamp: "2025-01-01T00:00:00Z".into(),
        };
        assert_eq!(dm.idem_key(), "acct:dm:m1");
    }
}
