use async_trait::async_trait;
use futures::TryStreamExt;
use gf_core::{CoreResult, DeadLetterRecord, DeadLetterSink};
use mongodb::{bson::doc, Collection, Database, IndexModel};
use tracing::info;

use crate::store_err;

/// Mongo-backed sink for events the engine failed to dispatch. This system
/// has no bus, so failed envelopes land in a collection instead of a DLQ
/// subject; the shape of the record is the same.
pub struct MongoDeadLetterStore {
    collection: Collection<DeadLetterRecord>,
    stage: String,
}

impl MongoDeadLetterStore {
    pub async fn new(db: &Database, stage: &str) -> CoreResult<Self> {
        let collection = db.collection::<DeadLetterRecord>("dead_letters");
        collection
            .create_index(
                IndexModel::builder()
                    .keys(doc! { "account_id": 1, "ts": -1 })
                    .build(),
            )
            .await
            .map_err(store_err)?;
        Ok(Self {
            collection,
            stage: stage.to_string(),
        })
    }

    pub async fn list_recent(
        &self,
        account_id: &str,
        limit: i64,
    ) -> CoreResult<Vec<DeadLetterRecord>> {
        let mut cursor = self
            .collection
            .find(doc! { "account_id": account_id })
            .sort(doc! { "ts": -1 })
            .limit(limit)
            .await
            .map_err(store_err)?;
        let mut records = Vec::new();
        while let Some(record) = cursor.try_next().await.map_err(store_err)? {
            records.push(record);
        }
        Ok(records)
    }
}

#[async_trait]
impl DeadLetterSink for MongoDeadLetterStore {
    async fn publish(&self, mut record: DeadLetterRecord) -> CoreResult<()> {
        if record.stage.is_empty() {
            record.stage = self.stage.clone();
        }
        self.collection
            .insert_one(&record)
            .await
            .map_err(store_err)?;
        metrics::counter!(
            "dead_letters_total",
            "account" => record.account_id.clone(),
            "stage" => record.stage.clone(),
            "code" => record.code.clone()
        )
        .increment(1);
        info!(
            account = %record.account_id,
            stage = %record.stage,
            code = %record.code,
            event_id = %record.event_id,
            "dead letter recorded"
        );
        Ok(())
    }
}
