use serde::{Deserialize, Serialize};

/// Per-account Graph API credentials, resolved from the user store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstagramCredentials {
    /// The IG business account id, used as the path segment for Send API calls.
    pub ig_user_id: String,
    #[serde(alias = "page_access_token")]
    pub access_token: String,
}

impl InstagramCredentials {
    pub fn new(ig_user_id: impl Into<String>, access_token: impl Into<String>) -> Self {
        Self {
            ig_user_id: ig_user_id.into(),
            access_token: access_token.into(),
        }
    }
}
