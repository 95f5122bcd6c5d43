//! Lease-based implementation of the source partition coordination protocol.
//!
//! Every horizontally-scaled instance of a source runs its own
//! [LeaseCoordinator] against the shared [CoordinationStore]; instances never
//! talk to each other. Ownership of a partition is a time-bounded lease: an
//! instance that stalls or crashes simply stops renewing and the partition
//! becomes acquirable again once the lease lapses. All mutation goes through
//! the store's conditional update, so at most one instance can believe it
//! owns a given partition at any instant.

use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::CoordinatorConfig;
use crate::error::{Error, Result};
use crate::partition::{
    PartitionIdentifier, PartitionStatus, PartitionStoreItem, SourcePartition,
};
use crate::store::CoordinationStore;

const COMPLETE_ACTION: &str = "complete";
const CLOSE_ACTION: &str = "close";
const SAVE_STATE_ACTION: &str = "save progress state";
const RENEW_ACTION: &str = "renew ownership";

/// The coordinator a source plugin drives. `T` is the caller-owned progress
/// state; the coordinator only ever moves it across the store boundary as an
/// opaque JSON string. Clonable so a source with multiple local workers can
/// share one coordinator across tasks.
pub struct LeaseCoordinator<T, S> {
    store: S,
    config: CoordinatorConfig,
    owner_id: String,
    initialized: Arc<AtomicBool>,
    /// Guards the partition discovery supplier so only one local worker runs
    /// the (possibly expensive) enumeration per poll round. Holds the instant
    /// of the last run for forced rediscovery.
    last_supplier_run: Arc<Mutex<DateTime<Utc>>>,
    _partition_state: PhantomData<fn() -> T>,
}

impl<T, S: Clone> Clone for LeaseCoordinator<T, S> {
    fn clone(&self) -> Self {
        LeaseCoordinator {
            store: self.store.clone(),
            config: self.config.clone(),
            owner_id: self.owner_id.clone(),
            initialized: Arc::clone(&self.initialized),
            last_supplier_run: Arc::clone(&self.last_supplier_run),
            _partition_state: PhantomData,
        }
    }
}

impl<T, S> LeaseCoordinator<T, S>
where
    T: Serialize + DeserializeOwned,
    S: CoordinationStore,
{
    pub fn new(store: S, config: CoordinatorConfig) -> Self {
        let owner_id = config.owner_id();
        LeaseCoordinator {
            store,
            config,
            owner_id,
            initialized: Arc::new(AtomicBool::new(false)),
            last_supplier_run: Arc::new(Mutex::new(Utc::now())),
            _partition_state: PhantomData,
        }
    }

    pub fn owner_id(&self) -> &str {
        &self.owner_id
    }

    /// Store-side setup. Must be called once before any other operation;
    /// calling it from every instance concurrently is fine.
    pub async fn initialize(&self) -> Result<()> {
        self.store.initialize().await?;
        self.initialized.store(true, Ordering::Release);
        Ok(())
    }

    /// Tries to acquire one partition for this instance. The discovery
    /// supplier is only invoked when nothing is acquirable outright (or when
    /// forced rediscovery is overdue), and identifiers it yields are created
    /// create-if-absent so a key that already ran to completion is never
    /// resurrected. Returns `Ok(None)` when there is no work right now; the
    /// caller should back off and poll again.
    pub async fn get_next_partition<F>(
        &self,
        partition_creation_supplier: F,
    ) -> Result<Option<SourcePartition<T>>>
    where
        F: FnOnce() -> Vec<PartitionIdentifier>,
    {
        self.ensure_initialized()?;

        let mut acquired = self
            .store
            .try_acquire_available_partition(&self.owner_id, self.config.lease_timeout)
            .await?;

        if let Ok(mut last_run) = self.last_supplier_run.try_lock() {
            let overdue = self
                .config
                .force_supplier_after
                .is_some_and(|after| Utc::now() >= *last_run + after);
            if acquired.is_none() || overdue {
                *last_run = Utc::now();
                let identifiers = partition_creation_supplier();
                info!(
                    owner_id = self.owner_id,
                    discovered = identifiers.len(),
                    "Ran the partition creation supplier"
                );
                self.create_partitions(identifiers).await?;
            }
        }

        if acquired.is_none() {
            acquired = self
                .store
                .try_acquire_available_partition(&self.owner_id, self.config.lease_timeout)
                .await?;
        }

        let Some(item) = acquired else {
            info!(
                owner_id = self.owner_id,
                "No partitions acquired, even after running the partition creation supplier"
            );
            return Ok(None);
        };

        debug!(
            partition_key = item.source_partition_key,
            owner_id = self.owner_id,
            "Acquired partition"
        );
        Ok(Some(SourcePartition {
            partition_state: self.decode_progress_state(&item),
            closed_count: item.closed_count,
            partition_key: item.source_partition_key,
        }))
    }

    /// Marks an owned partition as done forever. The item is kept in the
    /// store as a dedup record so re-discovery of the same key is a no-op.
    pub async fn complete_partition(&self, partition_key: &str) -> Result<()> {
        self.ensure_initialized()?;

        let mut item = self.owned_item(partition_key, COMPLETE_ACTION).await?;
        item.partition_owner = None;
        item.re_open_at = None;
        item.partition_ownership_timeout = None;
        item.source_partition_status = PartitionStatus::Completed;
        self.write_item(&item, COMPLETE_ACTION).await?;

        info!(
            partition_key,
            owner_id = self.owner_id,
            "Partition was completed"
        );
        Ok(())
    }

    /// Parks an owned partition until `reopen_after` has passed, releasing
    /// ownership. A partition that has been closed `max_closed_count` times
    /// is considered exhausted and is completed instead of parked. Saved
    /// progress state is carried across the close so the next owner resumes
    /// from the last checkpoint.
    pub async fn close_partition(
        &self,
        partition_key: &str,
        reopen_after: Duration,
        max_closed_count: u64,
    ) -> Result<()> {
        self.ensure_initialized()?;

        let mut item = self.owned_item(partition_key, CLOSE_ACTION).await?;
        item.partition_owner = None;
        item.partition_ownership_timeout = None;
        item.closed_count += 1;
        if item.closed_count >= max_closed_count {
            item.source_partition_status = PartitionStatus::Completed;
            item.re_open_at = None;
        } else {
            item.source_partition_status = PartitionStatus::Closed;
            item.re_open_at = Some(Utc::now() + reopen_after);
        }
        self.write_item(&item, CLOSE_ACTION).await?;

        info!(
            partition_key,
            owner_id = self.owner_id,
            status = ?item.source_partition_status,
            closed_count = item.closed_count,
            "Partition was closed"
        );
        Ok(())
    }

    /// Checkpoints the caller's progress on an owned partition without
    /// changing its status, and renews the ownership lease. A partition
    /// reclaimed after a crash resumes from the last state saved here, so
    /// callers should checkpoint before closing.
    pub async fn save_progress_state(
        &self,
        partition_key: &str,
        partition_progress_state: &T,
    ) -> Result<()> {
        self.ensure_initialized()?;

        let encoded = serde_json::to_string(partition_progress_state).map_err(|e| {
            Error::Serde(format!(
                "Unable to encode progress state for partition {partition_key}: {e}"
            ))
        })?;

        let mut item = self.owned_item(partition_key, SAVE_STATE_ACTION).await?;
        item.partition_ownership_timeout = Some(Utc::now() + self.config.lease_timeout);
        item.partition_progress_state = Some(encoded);
        self.write_item(&item, SAVE_STATE_ACTION).await?;

        debug!(
            partition_key,
            owner_id = self.owner_id,
            "Progress state was saved"
        );
        Ok(())
    }

    /// Extends the ownership lease on an owned partition to
    /// `now + extension` without writing a checkpoint. For owners expecting
    /// a long quiet stretch (waiting on downstream acknowledgments) that
    /// have nothing new to save.
    pub async fn renew_partition_ownership(
        &self,
        partition_key: &str,
        extension: Duration,
    ) -> Result<()> {
        self.ensure_initialized()?;

        let mut item = self.owned_item(partition_key, RENEW_ACTION).await?;
        item.partition_ownership_timeout = Some(Utc::now() + extension);
        self.write_item(&item, RENEW_ACTION).await?;

        debug!(
            partition_key,
            owner_id = self.owner_id,
            "Partition ownership was renewed"
        );
        Ok(())
    }

    /// Releases every partition this instance owns so other instances can
    /// acquire them immediately instead of waiting out the lease. Called on
    /// graceful shutdown. Best effort: a store that cannot be reached is
    /// tolerated (the leases will lapse on their own) and every store call
    /// is bounded so shutdown never hangs.
    pub async fn give_up_partitions(&self) -> Result<()> {
        if !self.initialized.load(Ordering::Acquire) {
            return Ok(());
        }

        let owned = match tokio::time::timeout(
            self.config.give_up_timeout,
            self.store.list_owned_partitions(&self.owner_id),
        )
        .await
        {
            Ok(Ok(items)) => items,
            Ok(Err(e)) => {
                warn!(
                    owner_id = self.owner_id,
                    error = %e,
                    "Unable to list owned partitions while shutting down. Their leases will lapse on their own."
                );
                return Ok(());
            }
            Err(_) => {
                warn!(
                    owner_id = self.owner_id,
                    "Timed out listing owned partitions while shutting down. Their leases will lapse on their own."
                );
                return Ok(());
            }
        };

        for mut item in owned {
            item.source_partition_status = PartitionStatus::Unassigned;
            item.partition_owner = None;
            item.partition_ownership_timeout = None;

            let written = tokio::time::timeout(
                self.config.give_up_timeout,
                self.store.try_update_partition(&item),
            )
            .await;
            match written {
                Ok(Ok(true)) => {
                    info!(
                        partition_key = item.source_partition_key,
                        owner_id = self.owner_id,
                        "Partition was given up"
                    );
                }
                Ok(Ok(false)) => {
                    info!(
                        partition_key = item.source_partition_key,
                        "Unable to explicitly give up the partition. It can be considered given up."
                    );
                }
                Ok(Err(e)) => {
                    warn!(
                        partition_key = item.source_partition_key,
                        error = %e,
                        "Store failed while giving up the partition. Its lease will lapse on its own."
                    );
                }
                Err(_) => {
                    warn!(
                        partition_key = item.source_partition_key,
                        "Timed out giving up the partition. Its lease will lapse on its own."
                    );
                }
            }
        }
        Ok(())
    }

    async fn create_partitions(&self, identifiers: Vec<PartitionIdentifier>) -> Result<()> {
        for identifier in identifiers {
            let partition_key = identifier.partition_key();
            if partition_key.is_empty() {
                warn!("Skipping a discovered partition identifier with an empty key");
                continue;
            }
            if self.store.get_partition(partition_key).await?.is_some() {
                continue;
            }
            if self.store.try_create_partition(partition_key).await? {
                info!(
                    partition_key,
                    owner_id = self.owner_id,
                    "Created partition"
                );
            }
        }
        Ok(())
    }

    /// Reads the item and verifies this instance still holds it. Every
    /// mutating operation funnels through here, which is how a deposed owner
    /// finds out it lost the lease.
    async fn owned_item(&self, partition_key: &str, action: &str) -> Result<PartitionStoreItem> {
        let item = self
            .store
            .get_partition(partition_key)
            .await?
            .ok_or_else(|| {
                Error::PartitionNotFound(format!(
                    "Unable to {action} because partition key {partition_key} was not found by owner {}",
                    self.owner_id
                ))
            })?;

        if item.source_partition_status != PartitionStatus::Assigned
            || item.partition_owner.as_deref() != Some(self.owner_id.as_str())
        {
            return Err(Error::PartitionNotOwned(format!(
                "Partition key {partition_key} is not owned by {}. The ownership timeout most likely \
                 expired and the partition was acquired by another instance.",
                self.owner_id
            )));
        }
        Ok(item)
    }

    async fn write_item(&self, item: &PartitionStoreItem, action: &str) -> Result<()> {
        match self.store.try_update_partition(item).await {
            Ok(true) => Ok(()),
            Ok(false) => Err(Error::PartitionUpdate(format!(
                "Conditional update failed trying to {action} partition {}",
                item.source_partition_key
            ))),
            Err(e) => Err(Error::PartitionUpdate(format!(
                "Store failed trying to {action} partition {}: {e}",
                item.source_partition_key
            ))),
        }
    }

    fn decode_progress_state(&self, item: &PartitionStoreItem) -> Option<T> {
        let raw = item.partition_progress_state.as_ref()?;
        match serde_json::from_str(raw) {
            Ok(state) => Some(state),
            Err(e) => {
                warn!(
                    partition_key = item.source_partition_key,
                    error = %e,
                    "Unable to decode the saved progress state, the partition starts from scratch"
                );
                None
            }
        }
    }

    fn ensure_initialized(&self) -> Result<()> {
        if !self.initialized.load(Ordering::Acquire) {
            return Err(Error::Uninitialized);
        }
        Ok(())
    }
}
