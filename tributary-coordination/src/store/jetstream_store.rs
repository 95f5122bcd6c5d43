//! NATS JetStream KV implementation of the [CoordinationStore] trait. One
//! bucket holds the partition set of one source; the KV entry revision is
//! the whole-row CAS token (`kv.create` gives create-if-absent, `kv.update`
//! with an expected revision gives the conditional write).
//!
//! **Entry format**
//!
//! Key - url-safe base64 of the partition key (partition keys are caller
//! supplied and may contain characters that are not valid in KV keys)
//!
//! Value - JSON serialized [PartitionStoreItem] without its `version` field

use std::time::Duration;

use async_nats::jetstream::Context;
use async_nats::jetstream::kv::{Config as KvConfig, CreateErrorKind, Operation, Store};
use base64::Engine;
use base64::prelude::BASE64_URL_SAFE_NO_PAD;
use bytes::Bytes;
use chrono::Utc;
use futures::TryStreamExt;
use tracing::{debug, info};

use crate::error::Error;
use crate::partition::{PartitionStatus, PartitionStoreItem};
use crate::store::CoordinationStore;

#[derive(Clone)]
pub struct JetStreamStore {
    kv_store: Store,
}

impl JetStreamStore {
    /// Gets or creates the KV bucket for the given source and wraps it.
    /// Every instance of the source runs this with the same bucket name.
    pub async fn new(js_context: Context, bucket_name: &str) -> crate::Result<Self> {
        let kv_store = js_context
            .create_key_value(KvConfig {
                bucket: bucket_name.to_string(),
                description: "tributary source partition coordination".to_string(),
                history: 1,
                ..Default::default()
            })
            .await
            .map_err(|e| {
                Error::Store(format!(
                    "Failed to get or create kv bucket '{bucket_name}': {e:?}"
                ))
            })?;
        info!(bucket_name, "Connected to coordination kv bucket");
        Ok(Self { kv_store })
    }

    fn encode_key(partition_key: &str) -> String {
        BASE64_URL_SAFE_NO_PAD.encode(partition_key)
    }

    fn decode_key(kv_key: &str) -> crate::Result<String> {
        let raw = BASE64_URL_SAFE_NO_PAD
            .decode(kv_key)
            .map_err(|e| Error::Store(format!("Invalid kv key '{kv_key}': {e}")))?;
        String::from_utf8(raw).map_err(|e| Error::Store(format!("Invalid kv key '{kv_key}': {e}")))
    }

    fn encode_item(item: &PartitionStoreItem) -> crate::Result<Bytes> {
        let payload = serde_json::to_vec(item).map_err(|e| {
            Error::Store(format!(
                "Failed to encode partition item {}: {e}",
                item.source_partition_key
            ))
        })?;
        Ok(Bytes::from(payload))
    }

    fn decode_item(payload: &[u8], revision: u64) -> crate::Result<PartitionStoreItem> {
        let mut item: PartitionStoreItem = serde_json::from_slice(payload)
            .map_err(|e| Error::Store(format!("Failed to decode partition item: {e}")))?;
        item.version = revision;
        Ok(item)
    }

    /// Conditional write against the revision carried in `item.version`.
    /// Returns the new revision, or `None` when the row moved on since it
    /// was read. The KV client reports a lost CAS race as an opaque update
    /// error, so a failed update is disambiguated by re-reading the entry
    /// and comparing revisions.
    async fn update_with_revision(&self, item: &PartitionStoreItem) -> crate::Result<Option<u64>> {
        let kv_key = Self::encode_key(&item.source_partition_key);
        let payload = Self::encode_item(item)?;

        match self.kv_store.update(&kv_key, payload, item.version).await {
            Ok(revision) => Ok(Some(revision)),
            Err(update_err) => {
                let entry = self.kv_store.entry(&kv_key).await.map_err(|e| {
                    Error::Store(format!(
                        "Failed to update partition {} and could not re-read it: {e:?}",
                        item.source_partition_key
                    ))
                })?;
                match entry {
                    Some(entry) if entry.revision != item.version => Ok(None),
                    _ => Err(Error::Store(format!(
                        "Failed to update partition {}: {update_err:?}",
                        item.source_partition_key
                    ))),
                }
            }
        }
    }

    /// All items in the bucket, each stamped with its revision.
    async fn list_items(&self) -> crate::Result<Vec<PartitionStoreItem>> {
        let kv_keys: Vec<String> = self
            .kv_store
            .keys()
            .await
            .map_err(|e| Error::Store(format!("Failed to list kv keys: {e:?}")))?
            .try_collect()
            .await
            .map_err(|e| Error::Store(format!("Failed to list kv keys: {e:?}")))?;

        let mut items = Vec::with_capacity(kv_keys.len());
        for kv_key in kv_keys {
            // entries can disappear between the listing and the read
            let Some(entry) = self
                .kv_store
                .entry(&kv_key)
                .await
                .map_err(|e| Error::Store(format!("Failed to read kv key '{kv_key}': {e:?}")))?
            else {
                continue;
            };
            if !matches!(entry.operation, Operation::Put) {
                continue;
            }
            items.push(Self::decode_item(&entry.value, entry.revision)?);
        }
        Ok(items)
    }
}

impl CoordinationStore for JetStreamStore {
    async fn initialize(&self) -> crate::Result<()> {
        self.kv_store
            .status()
            .await
            .map_err(|e| Error::Store(format!("Coordination kv bucket is not reachable: {e:?}")))?;
        Ok(())
    }

    async fn try_create_partition(&self, partition_key: &str) -> crate::Result<bool> {
        let item = PartitionStoreItem::new_unassigned(partition_key);
        let payload = Self::encode_item(&item)?;
        match self
            .kv_store
            .create(Self::encode_key(partition_key), payload)
            .await
        {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == CreateErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(Error::Store(format!(
                "Failed to create partition {partition_key}: {e:?}"
            ))),
        }
    }

    async fn get_partition(
        &self,
        partition_key: &str,
    ) -> crate::Result<Option<PartitionStoreItem>> {
        let entry = self
            .kv_store
            .entry(Self::encode_key(partition_key))
            .await
            .map_err(|e| Error::Store(format!("Failed to read partition {partition_key}: {e:?}")))?;
        match entry {
            Some(entry) if matches!(entry.operation, Operation::Put) => {
                Ok(Some(Self::decode_item(&entry.value, entry.revision)?))
            }
            _ => Ok(None),
        }
    }

    async fn try_acquire_available_partition(
        &self,
        owner_id: &str,
        lease_timeout: Duration,
    ) -> crate::Result<Option<PartitionStoreItem>> {
        let now = Utc::now();
        let mut candidates: Vec<PartitionStoreItem> = self
            .list_items()
            .await?
            .into_iter()
            .filter(|item| item.is_available(now))
            .collect();
        candidates.sort_by(|a, b| {
            (a.available_since(), &a.source_partition_key)
                .cmp(&(b.available_since(), &b.source_partition_key))
        });

        // race the CAS update candidate by candidate; a conflict just means
        // another instance got there first
        for mut item in candidates {
            item.partition_owner = Some(owner_id.to_string());
            item.source_partition_status = PartitionStatus::Assigned;
            item.partition_ownership_timeout = Some(now + lease_timeout);
            if let Some(revision) = self.update_with_revision(&item).await? {
                item.version = revision;
                return Ok(Some(item));
            }
            debug!(
                partition_key = item.source_partition_key,
                owner_id, "Lost the acquisition race, trying the next candidate"
            );
        }
        Ok(None)
    }

    async fn try_update_partition(&self, item: &PartitionStoreItem) -> crate::Result<bool> {
        Ok(self.update_with_revision(item).await?.is_some())
    }

    async fn list_acquirable_keys(&self) -> crate::Result<Vec<String>> {
        let now = Utc::now();
        Ok(self
            .list_items()
            .await?
            .into_iter()
            .filter(|item| item.is_available(now))
            .map(|item| item.source_partition_key)
            .collect())
    }

    async fn list_owned_partitions(
        &self,
        owner_id: &str,
    ) -> crate::Result<Vec<PartitionStoreItem>> {
        Ok(self
            .list_items()
            .await?
            .into_iter()
            .filter(|item| {
                item.source_partition_status == PartitionStatus::Assigned
                    && item.partition_owner.as_deref() == Some(owner_id)
            })
            .collect())
    }
}
