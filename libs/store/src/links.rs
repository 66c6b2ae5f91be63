use gf_core::CoreResult;
use mongodb::{
    bson::doc,
    options::IndexOptions,
    Collection, Database, IndexModel,
};
use nanoid::nanoid;
use serde::{Deserialize, Serialize};

use crate::store_err;

const CODE_LEN: usize = 8;

/// A short redirect link handed out in reply templates; visits are counted
/// for the contest leaderboard.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkDoc {
    pub code: String,
    pub account_id: String,
    pub target_url: String,
    #[serde(default)]
    pub redirect_count: u64,
    pub created_at: String,
}

pub struct MongoLinkStore {
    collection: Collection<LinkDoc>,
}

impl MongoLinkStore {
    pub async fn new(db: &Database) -> CoreResult<Self> {
        let collection = db.collection::<LinkDoc>("links");
        collection
            .create_index(
                IndexModel::builder()
                    .keys(doc! { "code": 1 })
                    .options(IndexOptions::builder().unique(true).build())
                    .build(),
            )
            .await
            .map_err(store_err)?;
        Ok(Self { collection })
    }

    pub async fn create(&self, account_id: &str, target_url: &str) -> CoreResult<LinkDoc> {
        let link = LinkDoc {
            code: nanoid!(CODE_LEN),
            account_id: account_id.to_string(),
            target_url: target_url.to_string(),
            redirect_count: 0,
            created_at: gf_core::now_rfc3339(),
        };
        self.collection
            .insert_one(&link)
            .await
            .map_err(store_err)?;
        Ok(link)
    }

    /// Resolves a code and counts the visit in one round trip.
    pub async fn resolve_and_count(&self, code: &str) -> CoreResult<Option<LinkDoc>> {
        self.collection
            .find_one_and_update(
                doc! { "code": code },
                doc! { "$inc": { "redirect_count": 1 } },
            )
            .await
            .map_err(store_err)
    }

    pub async fn get(&self, code: &str) -> CoreResult<Option<LinkDoc>> {
        self.collection
            .find_one(doc! { "code": code })
            .await
            .map_err(store_err)
    }
}
