use std::sync::Arc;

use async_trait::async_trait;
use futures::TryStreamExt;
use gf_core::{Automation, AutomationStore, CoreResult};
use mongodb::{
    bson::doc,
    options::IndexOptions,
    Collection, Database, IndexModel,
};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::automations::MongoAutomationStore;
use crate::store_err;

/// One participant in the side contest. Ranked by `hits + redirects`; only
/// approved entries appear on the public leaderboard.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContestEntry {
    pub id: String,
    pub handle: String,
    #[serde(default)]
    pub account_id: Option<String>,
    #[serde(default)]
    pub hits: u64,
    #[serde(default)]
    pub redirects: u64,
    #[serde(default)]
    pub approved: bool,
    pub created_at: String,
}

impl ContestEntry {
    pub fn score(&self) -> u64 {
        self.hits + self.redirects
    }
}

pub struct MongoContestStore {
    collection: Collection<ContestEntry>,
}

impl MongoContestStore {
    pub async fn new(db: &Database) -> CoreResult<Self> {
        let collection = db.collection::<ContestEntry>("contest_entries");
        collection
            .create_index(
                IndexModel::builder()
                    .keys(doc! { "handle": 1 })
                    .options(IndexOptions::builder().unique(true).build())
                    .build(),
            )
            .await
            .map_err(store_err)?;
        Ok(Self { collection })
    }

    pub async fn register(
        &self,
        handle: &str,
        account_id: Option<String>,
    ) -> CoreResult<ContestEntry> {
        let entry = ContestEntry {
            id: Uuid::new_v4().to_string(),
            handle: handle.to_string(),
            account_id,
            hits: 0,
            redirects: 0,
            approved: false,
            created_at: gf_core::now_rfc3339(),
        };
        self.collection
            .insert_one(&entry)
            .await
            .map_err(store_err)?;
        Ok(entry)
    }

    pub async fn approve(&self, entry_id: &str) -> CoreResult<bool> {
        let result = self
            .collection
            .update_one(
                doc! { "id": entry_id },
                doc! { "$set": { "approved": true } },
            )
            .await
            .map_err(store_err)?;
        Ok(result.matched_count == 1)
    }

    pub async fn record_hit(&self, account_id: &str) -> CoreResult<()> {
        self.collection
            .update_one(
                doc! { "account_id": account_id },
                doc! { "$inc": { "hits": 1 } },
            )
            .await
            .map_err(store_err)?;
        Ok(())
    }

    pub async fn record_redirect(&self, account_id: &str) -> CoreResult<()> {
        self.collection
            .update_one(
                doc! { "account_id": account_id },
                doc! { "$inc": { "redirects": 1 } },
            )
            .await
            .map_err(store_err)?;
        Ok(())
    }

    /// Approved entries, best score first. The contest is small, so the sort
    /// happens here rather than in an aggregation pipeline.
    pub async fn leaderboard(&self, limit: usize) -> CoreResult<Vec<ContestEntry>> {
        let mut cursor = self
            .collection
            .find(doc! { "approved": true })
            .await
            .map_err(store_err)?;
        let mut entries = Vec::new();
        while let Some(entry) = cursor.try_next().await.map_err(store_err)? {
            entries.push(entry);
        }
        entries.sort_by(|a, b| b.score().cmp(&a.score()).then(a.handle.cmp(&b.handle)));
        entries.truncate(limit);
        Ok(entries)
    }
}

/// Decorates the automation store so every fired reply also counts toward
/// the account's contest entry, when one exists. Accounts without an entry
/// match nothing and the update is a no-op.
pub struct ContestScoringAutomations {
    inner: Arc<MongoAutomationStore>,
    contest: Arc<MongoContestStore>,
}

impl ContestScoringAutomations {
    pub fn new(inner: Arc<MongoAutomationStore>, contest: Arc<MongoContestStore>) -> Self {
        Self { inner, contest }
    }
}

#[async_trait]
impl AutomationStore for ContestScoringAutomations {
    async fn list_enabled(&self, account_id: &str) -> CoreResult<Vec<Automation>> {
        self.inner.list_enabled(account_id).await
    }

    async fn claim_reply_slot(&self, automation_id: &str) -> CoreResult<bool> {
        self.inner.claim_reply_slot(automation_id).await
    }

    async fn refund_reply_slot(&self, automation_id: &str) -> CoreResult<()> {
        self.inner.refund_reply_slot(automation_id).await
    }

    async fn record_hit(&self, automation_id: &str) -> CoreResult<()> {
        self.inner.record_hit(automation_id).await?;
        match self.inner.get(automation_id).await {
            Ok(Some(automation)) => {
                if let Err(err) = self.contest.record_hit(&automation.account_id).await {
                    debug!(account = %automation.account_id, error = %err, "contest hit update failed");
                }
            }
            Ok(None) => {}
            Err(err) => {
                debug!(automation = automation_id, error = %err, "automation lookup for contest hit failed");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn score_sums_hits_and_redirects() {
        let entry = ContestEntry {
            id: "e1".into(),
            handle: "team".into(),
            account_id: None,
            hits: 3,
            redirects: 4,
            approved: true,
            created_at: gf_core::now_rfc3339(),
        };
        assert_eq!(entry.score(), 7);
    }
}
