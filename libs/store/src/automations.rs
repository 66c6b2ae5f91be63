use async_trait::async_trait;
use futures::TryStreamExt;
use gf_cache::SharedCache;
use gf_core::{Automation, AutomationStore, CoreError, CoreResult};
use mongodb::{
    bson::{self, doc},
    options::IndexOptions,
    Collection, Database, IndexModel,
};
use tracing::debug;

use crate::store_err;

const CACHE_TTL_DEFAULT_SECS: u64 = 60;

/// Automations repository. `list_for_account` is the hot read on the webhook
/// path and goes through the TTL cache; all writes invalidate the account key.
pub struct MongoAutomationStore {
    collection: Collection<Automation>,
    cache: Option<SharedCache>,
    cache_ttl_s: u64,
}

impl MongoAutomationStore {
    pub async fn new(db: &Database, cache: Option<SharedCache>) -> CoreResult<Self> {
        let collection = db.collection::<Automation>("automations");
        collection
            .create_index(
                IndexModel::builder()
                    .keys(doc! { "id": 1 })
                    .options(IndexOptions::builder().unique(true).build())
                    .build(),
            )
            .await
            .map_err(store_err)?;
        collection
            .create_index(
                IndexModel::builder()
                    .keys(doc! { "account_id": 1, "created_at": 1 })
                    .build(),
            )
            .await
            .map_err(store_err)?;

        let cache_ttl_s = std::env::var("AUTOMATION_CACHE_TTL_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(CACHE_TTL_DEFAULT_SECS);

        Ok(Self {
            collection,
            cache,
            cache_ttl_s,
        })
    }

    fn cache_key(account_id: &str) -> String {
        format!("automations:{account_id}")
    }

    async fn invalidate(&self, account_id: &str) {
        if let Some(cache) = &self.cache {
            if let Err(err) = cache.delete(&Self::cache_key(account_id)).await {
                debug!(account = account_id, error = %err, "cache invalidation failed");
            }
        }
    }

    /// All automations for an account, oldest first, via the read-through
    /// cache. Cache failures degrade to a direct read.
    pub async fn list_for_account(&self, account_id: &str) -> CoreResult<Vec<Automation>> {
        if let Some(cache) = &self.cache {
            if let Ok(Some(cached)) =
                gf_cache::get_json::<Vec<Automation>>(cache.as_ref(), &Self::cache_key(account_id))
                    .await
            {
                return Ok(cached);
            }
        }

        let mut cursor = self
            .collection
            .find(doc! { "account_id": account_id })
            .sort(doc! { "created_at": 1 })
            .await
            .map_err(store_err)?;
        let mut automations = Vec::new();
        while let Some(automation) = cursor.try_next().await.map_err(store_err)? {
            automations.push(automation);
        }

        if let Some(cache) = &self.cache {
            gf_cache::put_json(
                cache.as_ref(),
                &Self::cache_key(account_id),
                &automations,
                self.cache_ttl_s,
            )
            .await
            .ok();
        }
        Ok(automations)
    }

    pub async fn get(&self, automation_id: &str) -> CoreResult<Option<Automation>> {
        self.collection
            .find_one(doc! { "id": automation_id })
            .await
            .map_err(store_err)
    }

    pub async fn create(&self, automation: &Automation) -> CoreResult<()> {
        self.collection
            .insert_one(automation)
            .await
            .map_err(store_err)?;
        self.invalidate(&automation.account_id).await;
        Ok(())
    }

    /// Applies an edit. `replies_left` belongs to the dispatch path
    /// (`claim_reply_slot`/`refund_reply_slot` are atomic `$inc`s), so the
    /// edit never writes back the counter it read; it resets to the new
    /// limit only when `reply_limit` itself changes, inside the same update.
    pub async fn update(&self, automation: &Automation) -> CoreResult<bool> {
        let limit = i64::from(automation.reply_limit);
        let result = self
            .collection
            .update_one(
                doc! { "id": &automation.id },
                vec![doc! { "$set": {
                    "media_id": to_bson(&automation.media_id)?,
                    "keywords": to_bson(&automation.keywords)?,
                    "respond_to_all": automation.respond_to_all,
                    "comment_reply": to_bson(&automation.comment_reply)?,
                    "dm_reply": to_bson(&automation.dm_reply)?,
                    "follow_gate": to_bson(&automation.follow_gate)?,
                    "enabled": automation.enabled,
                    "updated_at": to_bson(&automation.updated_at)?,
                    "replies_left": {
                        "$cond": {
                            "if": { "$eq": ["$reply_limit", limit] },
                            "then": "$replies_left",
                            "else": limit,
                        }
                    },
                    "reply_limit": limit,
                } }],
            )
            .await
            .map_err(store_err)?;
        self.invalidate(&automation.account_id).await;
        Ok(result.matched_count == 1)
    }

    pub async fn delete(&self, automation_id: &str) -> CoreResult<bool> {
        let existing = self.get(automation_id).await?;
        let result = self
            .collection
            .delete_one(doc! { "id": automation_id })
            .await
            .map_err(store_err)?;
        if let Some(automation) = existing {
            self.invalidate(&automation.account_id).await;
        }
        Ok(result.deleted_count == 1)
    }
}

fn to_bson<T: serde::Serialize>(value: &T) -> CoreResult<bson::Bson> {
    bson::to_bson(value).map_err(|err| CoreError::new("encode_failed", err.to_string()))
}

#[async_trait]
impl AutomationStore for MongoAutomationStore {
    async fn list_enabled(&self, account_id: &str) -> CoreResult<Vec<Automation>> {
        let automations = self.list_for_account(account_id).await?;
        Ok(automations.into_iter().filter(|a| a.enabled).collect())
    }

    async fn claim_reply_slot(&self, automation_id: &str) -> CoreResult<bool> {
        // Unlimited rules never touch the counter.
        let unlimited = self
            .collection
            .find_one(doc! { "id": automation_id, "reply_limit": 0 })
            .await
            .map_err(store_err)?;
        if unlimited.is_some() {
            return Ok(true);
        }

        let result = self
            .collection
            .update_one(
                doc! { "id": automation_id, "replies_left": { "$gt": 0 } },
                doc! { "$inc": { "replies_left": -1 } },
            )
            .await
            .map_err(store_err)?;
        Ok(result.modified_count == 1)
    }

    async fn refund_reply_slot(&self, automation_id: &str) -> CoreResult<()> {
        self.collection
            .update_one(
                doc! { "id": automation_id, "reply_limit": { "$gt": 0 } },
                doc! { "$inc": { "replies_left": 1 } },
            )
            .await
            .map_err(store_err)?;
        Ok(())
    }

    async fn record_hit(&self, automation_id: &str) -> CoreResult<()> {
        let result = self
            .collection
            .update_one(
                doc! { "id": automation_id },
                doc! { "$inc": { "hits": 1 } },
            )
            .await
            .map_err(store_err)?;
        if result.matched_count == 0 {
            return Err(CoreError::new(
                "automation_missing",
                format!("no automation with id {automation_id}"),
            ));
        }
        Ok(())
    }
}
