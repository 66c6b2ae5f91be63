use async_trait::async_trait;
use futures::TryStreamExt;
use gf_core::{CoreResult, DeliveryRecord, DeliveryStore};
use mongodb::{
    bson::doc,
    options::IndexOptions,
    Collection, Database, IndexModel,
};

use crate::store_err;

pub struct MongoDeliveryStore {
    collection: Collection<DeliveryRecord>,
}

impl MongoDeliveryStore {
    pub async fn new(db: &Database) -> CoreResult<Self> {
        let collection = db.collection::<DeliveryRecord>("deliveries");
        collection
            .create_index(
                IndexModel::builder()
                    .keys(doc! { "automation_id": 1, "recipient_id": 1 })
                    .options(IndexOptions::builder().unique(true).build())
                    .build(),
            )
            .await
            .map_err(store_err)?;
        collection
            .create_index(
                IndexModel::builder()
                    .keys(doc! { "account_id": 1, "recipient_id": 1, "state": 1 })
                    .build(),
            )
            .await
            .map_err(store_err)?;
        Ok(Self { collection })
    }
}

#[async_trait]
impl DeliveryStore for MongoDeliveryStore {
    async fn find(
        &self,
        automation_id: &str,
        recipient_id: &str,
    ) -> CoreResult<Option<DeliveryRecord>> {
        self.collection
            .find_one(doc! { "automation_id": automation_id, "recipient_id": recipient_id })
            .await
            .map_err(store_err)
    }

    async fn put(&self, record: DeliveryRecord) -> CoreResult<()> {
        // Upsert so a follow-gate park can later be flipped to replied.
        let filter = doc! {
            "automation_id": &record.automation_id,
            "recipient_id": &record.recipient_id,
        };
        let replacement = record;
        self.collection
            .replace_one(filter, &replacement)
            .upsert(true)
            .await
            .map_err(store_err)?;
        Ok(())
    }

    async fn awaiting_follow(
        &self,
        account_id: &str,
        recipient_id: &str,
    ) -> CoreResult<Vec<DeliveryRecord>> {
        let mut cursor = self
            .collection
            .find(doc! {
                "account_id": account_id,
                "recipient_id": recipient_id,
                "state": "awaiting_follow",
            })
            .await
            .map_err(store_err)?;
        let mut records = Vec::new();
        while let Some(record) = cursor.try_next().await.map_err(store_err)? {
            records.push(record);
        }
        Ok(records)
    }

    async fn mark_replied(&self, automation_id: &str, recipient_id: &str) -> CoreResult<()> {
        self.collection
            .update_one(
                doc! { "automation_id": automation_id, "recipient_id": recipient_id },
                doc! { "$set": { "state": "replied", "ts": gf_core::now_rfc3339() } },
            )
            .await
            .map_err(store_err)?;
        Ok(())
    }

    async fn remove(&self, automation_id: &str, recipient_id: &str) -> CoreResult<()> {
        self.collection
            .delete_one(doc! { "automation_id": automation_id, "recipient_id": recipient_id })
            .await
            .map_err(store_err)?;
        Ok(())
    }
}
