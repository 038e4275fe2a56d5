use std::sync::Arc;

use chrono::Utc;
use exsync_adapters::PracticeSourceClient;
use exsync_core::RawCaseRecord;
use exsync_storage::{payload_hash, PersistenceError, SourceCaseWrite, Store};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, info_span, Instrument};

use crate::SyncError;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullSummary {
    pub fetched: usize,
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub skipped_without_id: usize,
}

/// Copies upstream matters onto cases, keyed by external matter id.
#[derive(Clone)]
pub struct RawCasePull {
    client: PracticeSourceClient,
    store: Arc<dyn Store>,
}

impl RawCasePull {
    pub fn new(client: PracticeSourceClient, store: Arc<dyn Store>) -> Self {
        Self { client, store }
    }

    pub async fn run(&self) -> Result<PullSummary, SyncError> {
        async move {
            let records = self.client.fetch_matters().await?;
            let mut summary = PullSummary {
                fetched: records.len(),
                ..Default::default()
            };

            for value in &records {
                let raw = RawCaseRecord::from_json(value);
                let Some(external_id) = raw.id.clone().filter(|id| !id.trim().is_empty()) else {
                    summary.skipped_without_id += 1;
                    continue;
                };
                // Hash what is stored, so upstream fields we drop never count as a change.
                let canonical = serde_json::to_value(&raw)
                    .map_err(|err| PersistenceError::Serialization(err.to_string()))?;
                let hash = payload_hash(&canonical);

                match self
                    .store
                    .upsert_source_case(&external_id, &raw, &hash, Utc::now())
                    .await?
                {
                    SourceCaseWrite::Inserted(_) => summary.inserted += 1,
                    SourceCaseWrite::Updated(_) => summary.updated += 1,
                    SourceCaseWrite::Unchanged(_) => summary.unchanged += 1,
                }
                debug!(%external_id, "matter stored");
            }

            info!(
                fetched = summary.fetched,
                inserted = summary.inserted,
                updated = summary.updated,
                unchanged = summary.unchanged,
                "raw case pull finished"
            );
            Ok(summary)
        }
        .instrument(info_span!("raw_case_pull"))
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use exsync_adapters::{SourceTransport, StaticToken, TransportError};
    use exsync_storage::MemoryStore;
    use serde_json::{json, Value as JsonValue};
    use std::sync::Mutex;

    struct FixedPages(Mutex<Vec<JsonValue>>);

    #[async_trait]
    impl SourceTransport for FixedPages {
        async fn get_page(
            &self,
            _resource: &str,
            page: usize,
            _page_size: usize,
            _access_token: &str,
        ) -> Result<JsonValue, TransportError> {
            Ok(self.0.lock().unwrap().get(page - 1).cloned().unwrap_or_else(|| json!([])))
        }
    }

    fn pull_over(pages: Vec<JsonValue>, store: Arc<MemoryStore>) -> RawCasePull {
        let client = PracticeSourceClient::new(
            Arc::new(FixedPages(Mutex::new(pages))),
            Arc::new(StaticToken::new("t")),
        );
        RawCasePull::new(client, store)
    }

    #[tokio::test]
    async fn inserts_then_detects_changes() {
        let store = Arc::new(MemoryStore::new());
        let first = pull_over(
            vec![json!([
                {"id": "m-1", "display_name": "Harbor Street Exchange", "buyer_names": "Tom Baker"},
                {"id": "m-2", "display_name": "Elm Court Exchange"},
                {"display_name": "No identifier"}
            ])],
            store.clone(),
        );
        let summary = first.run().await.unwrap();
        assert_eq!(summary.fetched, 3);
        assert_eq!(summary.inserted, 2);
        assert_eq!(summary.skipped_without_id, 1);

        let second = pull_over(
            vec![json!([
                {"id": "m-1", "display_name": "Harbor Street Exchange", "buyer_names": "Tom Baker", "ignored": 1},
                {"id": "m-2", "display_name": "Elm Court Exchange", "seller_names": "Priya Patel"}
            ])],
            store.clone(),
        );
        let summary = second.run().await.unwrap();
        assert_eq!(summary.inserted, 0);
        assert_eq!(summary.unchanged, 1);
        assert_eq!(summary.updated, 1);
        assert_eq!(store.cases().await.len(), 2);
    }
}
