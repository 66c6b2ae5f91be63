//! MongoDB persistence for Gramflow.
//!
//! Each repository owns one typed collection and ensures its indexes at
//! construction time. Reads that sit on the hot path go through the
//! `gf-cache` TTL layer; every write invalidates the affected key.

use anyhow::{Context, Result};
use mongodb::{Client, Database};

mod automations;
mod contest;
mod dead_letters;
mod deliveries;
mod links;
mod users;

pub use automations::MongoAutomationStore;
pub use contest::{ContestEntry, ContestScoringAutomations, MongoContestStore};
pub use dead_letters::MongoDeadLetterStore;
pub use deliveries::MongoDeliveryStore;
pub use links::{LinkDoc, MongoLinkStore};
pub use users::{MongoUserStore, UserDoc};

/// Connects and pings the configured database.
pub async fn connect(uri: &str, db_name: &str) -> Result<Database> {
    let client = Client::with_uri_str(uri)
        .await
        .with_context(|| format!("connect to mongodb at {uri}"))?;
    let db = client.database(db_name);
    db.run_command(mongodb::bson::doc! { "ping": 1 })
        .await
        .context("mongodb ping")?;
    Ok(db)
}

pub(crate) fn store_err(err: mongodb::error::Error) -> gf_core::CoreError {
    gf_core::CoreError::new("store_unavailable", err.to_string())
        .with_retry(Some(1_000))
        .with_source(err)
}
