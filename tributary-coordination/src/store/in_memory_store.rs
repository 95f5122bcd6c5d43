//! In-memory implementation of the [CoordinationStore] trait for tests and
//! single-instance pipelines that do not want an external dependency.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;

use crate::partition::{PartitionStatus, PartitionStoreItem};
use crate::store::CoordinationStore;

/// All items live in one mutex-guarded map; the mutex stands in for the
/// atomicity a durable backend gets from conditional writes. Clones share
/// the same map, which is what lets tests run several coordinator instances
/// against one "fleet-wide" store.
#[derive(Clone, Default)]
pub struct InMemoryStore {
    inner: Arc<Mutex<BTreeMap<String, PartitionStoreItem>>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CoordinationStore for InMemoryStore {
    async fn initialize(&self) -> crate::Result<()> {
        Ok(())
    }

    async fn try_create_partition(&self, partition_key: &str) -> crate::Result<bool> {
        let mut inner = self.inner.lock().expect("Thread panicked waiting for lock");
        if inner.contains_key(partition_key) {
            return Ok(false);
        }
        inner.insert(
            partition_key.to_string(),
            PartitionStoreItem::new_unassigned(partition_key),
        );
        Ok(true)
    }

    async fn get_partition(
        &self,
        partition_key: &str,
    ) -> crate::Result<Option<PartitionStoreItem>> {
        let inner = self.inner.lock().expect("Thread panicked waiting for lock");
        Ok(inner.get(partition_key).cloned())
    }

    async fn try_acquire_available_partition(
        &self,
        owner_id: &str,
        lease_timeout: Duration,
    ) -> crate::Result<Option<PartitionStoreItem>> {
        let mut inner = self.inner.lock().expect("Thread panicked waiting for lock");
        let now = Utc::now();

        // BTreeMap iteration gives a stable key order, so ties on
        // available_since resolve deterministically.
        let candidate = inner
            .values()
            .filter(|item| item.is_available(now))
            .min_by_key(|item| item.available_since())
            .map(|item| item.source_partition_key.clone());

        let Some(key) = candidate else {
            return Ok(None);
        };

        let item = inner
            .get_mut(&key)
            .expect("candidate key vanished while the lock was held");
        item.partition_owner = Some(owner_id.to_string());
        item.source_partition_status = PartitionStatus::Assigned;
        item.partition_ownership_timeout = Some(now + lease_timeout);
        item.version += 1;
        Ok(Some(item.clone()))
    }

    async fn try_update_partition(&self, item: &PartitionStoreItem) -> crate::Result<bool> {
        let mut inner = self.inner.lock().expect("Thread panicked waiting for lock");
        let Some(stored) = inner.get_mut(&item.source_partition_key) else {
            return Ok(false);
        };
        if stored.version != item.version {
            return Ok(false);
        }
        let mut updated = item.clone();
        updated.version = item.version + 1;
        *stored = updated;
        Ok(true)
    }

    async fn list_acquirable_keys(&self) -> crate::Result<Vec<String>> {
        let inner = self.inner.lock().expect("Thread panicked waiting for lock");
        let now = Utc::now();
        Ok(inner
            .values()
            .filter(|item| item.is_available(now))
            .map(|item| item.source_partition_key.clone())
            .collect())
    }

    async fn list_owned_partitions(
        &self,
        owner_id: &str,
    ) -> crate::Result<Vec<PartitionStoreItem>> {
        let inner = self.inner.lock().expect("Thread panicked waiting for lock");
        Ok(inner
            .values()
            .filter(|item| {
                item.source_partition_status == PartitionStatus::Assigned
                    && item.partition_owner.as_deref() == Some(owner_id)
            })
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;

    const LEASE: Duration = Duration::from_secs(60);

    #[tokio::test]
    async fn test_create_is_idempotent_and_never_clobbers() {
        let store = InMemoryStore::new();

        assert!(store.try_create_partition("p1").await.unwrap());
        assert!(!store.try_create_partition("p1").await.unwrap());

        // claim it, then make sure a re-create does not reset the claim
        let acquired = store
            .try_acquire_available_partition("owner-a", LEASE)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(acquired.source_partition_key, "p1");

        assert!(!store.try_create_partition("p1").await.unwrap());
        let item = store.get_partition("p1").await.unwrap().unwrap();
        assert_eq!(item.source_partition_status, PartitionStatus::Assigned);
        assert_eq!(item.partition_owner.as_deref(), Some("owner-a"));
    }

    #[tokio::test]
    async fn test_acquire_claims_and_stamps_lease() {
        let store = InMemoryStore::new();
        store.try_create_partition("p1").await.unwrap();

        let before = Utc::now();
        let item = store
            .try_acquire_available_partition("owner-a", LEASE)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(item.partition_owner.as_deref(), Some("owner-a"));
        assert_eq!(item.source_partition_status, PartitionStatus::Assigned);
        assert!(item.partition_ownership_timeout.unwrap() >= before + TimeDelta::seconds(59));

        // nothing else to hand out
        assert!(
            store
                .try_acquire_available_partition("owner-b", LEASE)
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn test_acquire_prefers_oldest_eligible() {
        let store = InMemoryStore::new();
        let now = Utc::now();

        // p-closed became eligible 10s ago, p-expired 20s ago
        let mut closed = PartitionStoreItem::new_unassigned("p-closed");
        closed.source_partition_status = PartitionStatus::Closed;
        closed.re_open_at = Some(now - TimeDelta::seconds(10));

        let mut expired = PartitionStoreItem::new_unassigned("p-expired");
        expired.source_partition_status = PartitionStatus::Assigned;
        expired.partition_owner = Some("owner-gone".to_string());
        expired.partition_ownership_timeout = Some(now - TimeDelta::seconds(20));

        {
            let mut inner = store.inner.lock().unwrap();
            inner.insert("p-closed".to_string(), closed);
            inner.insert("p-expired".to_string(), expired);
        }

        let first = store
            .try_acquire_available_partition("owner-a", LEASE)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.source_partition_key, "p-expired");

        let second = store
            .try_acquire_available_partition("owner-a", LEASE)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second.source_partition_key, "p-closed");
    }

    #[tokio::test]
    async fn test_stale_update_is_rejected_and_leaves_item_untouched() {
        let store = InMemoryStore::new();
        store.try_create_partition("p1").await.unwrap();

        let stale = store.get_partition("p1").await.unwrap().unwrap();

        let mut fresh = stale.clone();
        fresh.partition_progress_state = Some("offset=10".to_string());
        assert!(store.try_update_partition(&fresh).await.unwrap());

        // the earlier read now carries an outdated version
        let mut conflicting = stale;
        conflicting.partition_progress_state = Some("offset=0".to_string());
        assert!(!store.try_update_partition(&conflicting).await.unwrap());

        let item = store.get_partition("p1").await.unwrap().unwrap();
        assert_eq!(
            item.partition_progress_state.as_deref(),
            Some("offset=10")
        );
    }

    #[tokio::test]
    async fn test_update_unknown_key_is_a_conditional_failure() {
        let store = InMemoryStore::new();
        let item = PartitionStoreItem::new_unassigned("ghost");
        assert!(!store.try_update_partition(&item).await.unwrap());
    }

    #[tokio::test]
    async fn test_list_acquirable_and_owned() {
        let store = InMemoryStore::new();
        store.try_create_partition("p1").await.unwrap();
        store.try_create_partition("p2").await.unwrap();

        assert_eq!(
            store.list_acquirable_keys().await.unwrap(),
            vec!["p1".to_string(), "p2".to_string()]
        );

        store
            .try_acquire_available_partition("owner-a", LEASE)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(store.list_acquirable_keys().await.unwrap(), vec!["p2"]);
        let owned = store.list_owned_partitions("owner-a").await.unwrap();
        assert_eq!(owned.len(), 1);
        assert_eq!(owned.first().unwrap().source_partition_key, "p1");
        assert!(
            store
                .list_owned_partitions("owner-b")
                .await
                .unwrap()
                .is_empty()
        );
    }
}
