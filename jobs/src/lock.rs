use mnemolite_cache::SharedCache;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

/// Proof of lock ownership; release checks the token so a holder cannot
/// drop a lock that was reclaimed and re-acquired after its TTL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockToken {
    repository: String,
    token: String,
}

impl LockToken {
    pub fn repository(&self) -> &str {
        &self.repository
    }
}

/// Advisory repository lock on the shared cache. Acquisition is a single
/// set-if-not-exists with a TTL larger than the worst-case run; a crashed
/// holder is reclaimed when the TTL lapses.
pub struct RepositoryLock {
    l2: Arc<dyn SharedCache>,
    ttl: Duration,
}

fn lock_key(repository: &str) -> String {
    format!("indexing:lock:{}", repository)
}

impl RepositoryLock {
    pub fn new(l2: Arc<dyn SharedCache>, ttl: Duration) -> Self {
        Self { l2, ttl }
    }

    pub async fn acquire(&self, repository: &str) -> Option<LockToken> {
        let token = Uuid::new_v4().simple().to_string();
        let created = self
            .l2
            .set_nx(&lock_key(repository), token.clone().into_bytes(), self.ttl)
            .await;

        if created {
            debug!(%repository, "repository lock acquired");
            Some(LockToken {
                repository: repository.to_string(),
                token,
            })
        } else {
            None
        }
    }

    /// Best-effort release: only the current owner deletes the key. On
    /// failure the TTL reclaims the lock.
    pub async fn release(&self, token: &LockToken) -> bool {
        let key = lock_key(&token.repository);
        match self.l2.get(&key).await {
            Some(value) if value == token.token.as_bytes() => self.l2.delete(&key).await,
            _ => false,
        }
    }

    pub async fn is_locked(&self, repository: &str) -> bool {
        self.l2.get(&lock_key(repository)).await.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mnemolite_cache::MemoryCache;

    #[tokio::test]
    async fn second_acquire_is_denied_until_release() {
        let l2 = Arc::new(MemoryCache::new());
        let lock = RepositoryLock::new(l2, Duration::from_secs(600));

        let token = lock.acquire("repo").await.expect("first acquire");
        assert!(lock.acquire("repo").await.is_none());

        assert!(lock.release(&token).await);
        assert!(lock.acquire("repo").await.is_some());
    }

    #[tokio::test]
    async fn release_with_stale_token_is_a_noop() {
        let l2 = Arc::new(MemoryCache::new());
        let lock = RepositoryLock::new(l2, Duration::from_millis(20));

        let stale = lock.acquire("repo").await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        // TTL reclaimed the lock; someone else took it.
        let fresh = lock.acquire("repo").await.expect("reclaimed after ttl");
        assert!(!lock.release(&stale).await);
        assert!(lock.is_locked("repo").await);
        assert!(lock.release(&fresh).await);
    }

    #[tokio::test]
    async fn locks_are_scoped_per_repository() {
        let l2 = Arc::new(MemoryCache::new());
        let lock = RepositoryLock::new(l2, Duration::from_secs(600));

        assert!(lock.acquire("repo-a").await.is_some());
        assert!(lock.acquire("repo-b").await.is_some());
    }
}
