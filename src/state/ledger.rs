use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::StateStore;
use crate::error::Result;

/// Ids of items whose files were verified complete on disk.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ledger {
    pub completed_ids: BTreeSet<String>,
    pub last_sync: Option<DateTime<Utc>>,
}

impl Ledger {
    pub fn key(batch: &str) -> String {
        format!("ledger_{batch}")
    }

    pub fn is_complete(&self, id: &str) -> bool {
        self.completed_ids.contains(id)
    }

    /// A missing or unreadable ledger is an empty one.
    pub async fn load(store: &StateStore, batch: &str) -> Self {
        match store.get::<Ledger>(&Self::key(batch)).await {
            Ok(Some(ledger)) => ledger,
            Ok(None) => Ledger::default(),
            Err(err) => {
                warn!(batch, error = %err, "ignoring unreadable ledger");
                Ledger::default()
            }
        }
    }

    pub async fn mark_complete(store: &StateStore, batch: &str, id: &str) -> Result<()> {
        store
            .update(&Self::key(batch), |ledger: &mut Ledger| {
                ledger.completed_ids.insert(id.to_string());
                ledger.last_sync = Some(Utc::now());
            })
            .await?;
        Ok(())
    }
}
