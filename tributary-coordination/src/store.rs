use std::time::Duration;

use crate::partition::PartitionStoreItem;

pub mod in_memory_store;
pub mod jetstream_store;

/// CoordinationStore is the trait that defines the interface for the durable
/// backend holding [PartitionStoreItem]s. All cross-instance coordination
/// rests on two operations being atomic: `try_acquire_available_partition`
/// (find-and-claim) and `try_update_partition` (compare-and-swap on the
/// item's whole-row `version`).
///
/// Implementations return [crate::Error::Store] for read/transport failures;
/// a lost CAS race is `Ok(false)`, not an error.
#[trait_variant::make(Send)]
pub trait CoordinationStore: Clone + Send + Sync + 'static {
    /// Store-side setup (bucket/collection existence). Idempotent, safe to
    /// call from every instance concurrently.
    async fn initialize(&self) -> crate::Result<()>;

    /// Create-if-absent with status `Unassigned` and no owner. Returns false
    /// when an item for the key already exists, the existing item (including
    /// a completed one) is never overwritten.
    async fn try_create_partition(&self, partition_key: &str) -> crate::Result<bool>;

    /// Keyed read of one item, with its current CAS version stamped on.
    async fn get_partition(
        &self,
        partition_key: &str,
    ) -> crate::Result<Option<PartitionStoreItem>>;

    /// Atomically finds one available item (oldest-eligible-first, best
    /// effort) and claims it: owner set, status `Assigned`, ownership
    /// timeout `now + lease_timeout`. Returns the claimed item, or `None`
    /// when nothing is available right now.
    async fn try_acquire_available_partition(
        &self,
        owner_id: &str,
        lease_timeout: Duration,
    ) -> crate::Result<Option<PartitionStoreItem>>;

    /// Conditional write: persists `item`'s fields iff the stored version
    /// still equals `item.version`. `Ok(false)` means the row changed since
    /// it was read and nothing was written.
    async fn try_update_partition(&self, item: &PartitionStoreItem) -> crate::Result<bool>;

    /// Keys of all currently-available items. Diagnostics only, acquisition
    /// does not depend on it.
    async fn list_acquirable_keys(&self) -> crate::Result<Vec<String>>;

    /// All items currently assigned to `owner_id`. Drives the shutdown
    /// give-up path.
    async fn list_owned_partitions(
        &self,
        owner_id: &str,
    ) -> crate::Result<Vec<PartitionStoreItem>>;
}
