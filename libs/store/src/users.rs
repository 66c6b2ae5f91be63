use async_trait::async_trait;
use gf_core::{CoreResult, CredentialResolver, InstagramCredentials};
use mongodb::{
    bson::doc,
    options::{IndexOptions, ReturnDocument},
    Collection, Database, IndexModel,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::store_err;

/// A creator account as persisted after OAuth login.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserDoc {
    pub id: String,
    /// `google` or `instagram`.
    pub provider: String,
    pub provider_user_id: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    /// Filled in once the Instagram business account is connected.
    #[serde(default)]
    pub ig_user_id: Option<String>,
    #[serde(default)]
    pub ig_access_token: Option<String>,
    #[serde(default)]
    pub is_admin: bool,
    pub created_at: String,
}

pub struct MongoUserStore {
    collection: Collection<UserDoc>,
}

impl MongoUserStore {
    pub async fn new(db: &Database) -> CoreResult<Self> {
        let collection = db.collection::<UserDoc>("users");
        collection
            .create_index(
                IndexModel::builder()
                    .keys(doc! { "provider": 1, "provider_user_id": 1 })
                    .options(IndexOptions::builder().unique(true).build())
                    .build(),
            )
            .await
            .map_err(store_err)?;
        Ok(Self { collection })
    }

    /// Creates or refreshes a user after an OAuth callback; identity is
    /// (provider, provider_user_id).
    pub async fn upsert_from_oauth(
        &self,
        provider: &str,
        provider_user_id: &str,
        email: Option<String>,
        name: Option<String>,
        ig_user_id: Option<String>,
        ig_access_token: Option<String>,
    ) -> CoreResult<UserDoc> {
        let mut set = doc! {};
        if let Some(email) = &email {
            set.insert("email", email);
        }
        if let Some(name) = &name {
            set.insert("name", name);
        }
        if let Some(ig_user_id) = &ig_user_id {
            set.insert("ig_user_id", ig_user_id);
        }
        if let Some(token) = &ig_access_token {
            set.insert("ig_access_token", token);
        }

        let updated = self
            .collection
            .find_one_and_update(
                doc! { "provider": provider, "provider_user_id": provider_user_id },
                doc! {
                    "$set": set,
                    "$setOnInsert": {
                        "id": Uuid::new_v4().to_string(),
                        "provider": provider,
                        "provider_user_id": provider_user_id,
                        "is_admin": false,
                        "created_at": gf_core::now_rfc3339(),
                    },
                },
            )
            .upsert(true)
            .return_document(ReturnDocument::After)
            .await
            .map_err(store_err)?;

        updated.ok_or_else(|| {
            gf_core::CoreError::new("store_unavailable", "upsert returned no document")
        })
    }

    pub async fn get(&self, user_id: &str) -> CoreResult<Option<UserDoc>> {
        self.collection
            .find_one(doc! { "id": user_id })
            .await
            .map_err(store_err)
    }

    pub async fn find_by_ig_account(&self, ig_user_id: &str) -> CoreResult<Option<UserDoc>> {
        self.collection
            .find_one(doc! { "ig_user_id": ig_user_id })
            .await
            .map_err(store_err)
    }
}

#[async_trait]
impl CredentialResolver for MongoUserStore {
    async fn credentials(&self, account_id: &str) -> CoreResult<Option<InstagramCredentials>> {
        let user = self.find_by_ig_account(account_id).await?;
        Ok(user.and_then(|u| {
            u.ig_access_token
                .map(|token| InstagramCredentials::new(account_id, token))
        }))
    }
}
