use mnemolite_cache::SharedCache;
use mnemolite_core::model::IndexingStatus;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Status entries outlive a run but not the day; losing one only means
/// the status is re-derived as `not_indexed`.
const STATUS_TTL: Duration = Duration::from_secs(3600);

/// Ephemeral per-repository indexing status, kept in the shared cache.
pub struct StatusStore {
    l2: Arc<dyn SharedCache>,
}

fn status_key(repository: &str) -> String {
    format!("indexing:status:{}", repository)
}

impl StatusStore {
    pub fn new(l2: Arc<dyn SharedCache>) -> Self {
        Self { l2 }
    }

    pub async fn set(&self, status: &IndexingStatus) -> bool {
        match serde_json::to_vec(status) {
            Ok(bytes) => {
                self.l2
                    .set(&status_key(&status.repository), bytes, STATUS_TTL)
                    .await
            }
            Err(err) => {
                warn!(error = %err, "failed to encode indexing status");
                false
            }
        }
    }

    pub async fn get(&self, repository: &str) -> IndexingStatus {
        match self.l2.get(&status_key(repository)).await {
            Some(bytes) => serde_json::from_slice(&bytes)
                .unwrap_or_else(|_| IndexingStatus::not_indexed(repository)),
            None => IndexingStatus::not_indexed(repository),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mnemolite_cache::MemoryCache;
    use mnemolite_core::model::IndexingState;

    #[tokio::test]
    async fn status_round_trips_and_defaults_to_not_indexed() {
        let store = StatusStore::new(Arc::new(MemoryCache::new()));

        assert_eq!(
            store.get("repo").await.state,
            IndexingState::NotIndexed
        );

        let mut status = IndexingStatus::not_indexed("repo");
        status.state = IndexingState::InProgress;
        status.total_files = 12;
        assert!(store.set(&status).await);

        let read = store.get("repo").await;
        assert_eq!(read.state, IndexingState::InProgress);
        assert_eq!(read.total_files, 12);
    }

    #[tokio::test]
    async fn status_survives_l2_outage_by_degrading() {
        let l2 = Arc::new(MemoryCache::new());
        let store = StatusStore::new(l2.clone());

        l2.set_connected(false);
        let mut status = IndexingStatus::not_indexed("repo");
        status.state = IndexingState::InProgress;
        assert!(!store.set(&status).await);
        assert_eq!(store.get("repo").await.state, IndexingState::NotIndexed);
    }
}
