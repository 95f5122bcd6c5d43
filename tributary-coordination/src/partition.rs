use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Names one unit of source work (a file, a shard, a time slice) by a key
/// that is unique within the source's partition namespace. Produced by the
/// caller's discovery supplier and discarded once converted into a store
/// item.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PartitionIdentifier {
    partition_key: String,
}

impl PartitionIdentifier {
    pub fn new(partition_key: impl Into<String>) -> Self {
        PartitionIdentifier {
            partition_key: partition_key.into(),
        }
    }

    pub fn partition_key(&self) -> &str {
        &self.partition_key
    }
}

/// Lifecycle status of a partition. `Completed` is the only terminal state,
/// completed items are kept forever so re-discovered keys are never replayed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PartitionStatus {
    Unassigned,
    Assigned,
    Closed,
    Completed,
}

/// The durable record for one partition. Mutated exclusively through
/// conditional updates issued by the coordinator; `partition_owner` is
/// `Some` iff the status is [PartitionStatus::Assigned] and `re_open_at` is
/// `Some` iff the status is [PartitionStatus::Closed].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartitionStoreItem {
    pub source_partition_key: String,
    pub partition_owner: Option<String>,
    /// Opaque serialized progress state. The coordinator never inspects its
    /// structure, the caller-side type binding happens in
    /// [crate::LeaseCoordinator].
    pub partition_progress_state: Option<String>,
    pub source_partition_status: PartitionStatus,
    pub partition_ownership_timeout: Option<DateTime<Utc>>,
    pub re_open_at: Option<DateTime<Utc>>,
    pub closed_count: u64,
    /// Whole-row CAS token maintained by the store. Not part of the
    /// persisted payload: backends that have a native version (a KV entry
    /// revision) stamp it on read.
    #[serde(skip)]
    pub version: u64,
}

impl PartitionStoreItem {
    pub fn new_unassigned(partition_key: impl Into<String>) -> Self {
        PartitionStoreItem {
            source_partition_key: partition_key.into(),
            partition_owner: None,
            partition_progress_state: None,
            source_partition_status: PartitionStatus::Unassigned,
            partition_ownership_timeout: None,
            re_open_at: None,
            closed_count: 0,
            version: 0,
        }
    }

    /// Whether the partition can be acquired at `now`: unassigned, assigned
    /// past its ownership timeout, or closed past its reopen instant.
    pub fn is_available(&self, now: DateTime<Utc>) -> bool {
        match self.source_partition_status {
            PartitionStatus::Unassigned => true,
            PartitionStatus::Assigned => self
                .partition_ownership_timeout
                .is_none_or(|timeout| timeout <= now),
            PartitionStatus::Closed => self.re_open_at.is_none_or(|reopen| reopen <= now),
            PartitionStatus::Completed => false,
        }
    }

    /// The instant since when the partition has been eligible for
    /// acquisition. Stores use this to hand out the oldest-eligible item
    /// first. `None` for completed partitions.
    pub(crate) fn available_since(&self) -> Option<DateTime<Utc>> {
        match self.source_partition_status {
            PartitionStatus::Unassigned => Some(DateTime::<Utc>::MIN_UTC),
            PartitionStatus::Assigned => Some(
                self.partition_ownership_timeout
                    .unwrap_or(DateTime::<Utc>::MIN_UTC),
            ),
            PartitionStatus::Closed => Some(self.re_open_at.unwrap_or(DateTime::<Utc>::MIN_UTC)),
            PartitionStatus::Completed => None,
        }
    }
}

/// The lease handle returned to a caller by a successful acquisition.
/// Ephemeral, it is dropped once the caller completes or closes the
/// partition. `closed_count` tells the caller how often this partition was
/// already parked and reopened.
#[derive(Debug, Clone, PartialEq)]
pub struct SourcePartition<T> {
    pub partition_key: String,
    pub partition_state: Option<T>,
    pub closed_count: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;

    #[test]
    fn test_unassigned_is_available() {
        let item = PartitionStoreItem::new_unassigned("p1");
        assert!(item.is_available(Utc::now()));
    }

    #[test]
    fn test_assigned_availability_follows_ownership_timeout() {
        let now = Utc::now();
        let mut item = PartitionStoreItem::new_unassigned("p1");
        item.source_partition_status = PartitionStatus::Assigned;
        item.partition_owner = Some("owner-a".to_string());
        item.partition_ownership_timeout = Some(now + TimeDelta::seconds(60));

        assert!(!item.is_available(now));
        assert!(item.is_available(now + TimeDelta::seconds(61)));
    }

    #[test]
    fn test_closed_availability_follows_re_open_at() {
        let now = Utc::now();
        let mut item = PartitionStoreItem::new_unassigned("p1");
        item.source_partition_status = PartitionStatus::Closed;
        item.re_open_at = Some(now + TimeDelta::seconds(30));

        assert!(!item.is_available(now));
        assert!(item.is_available(now + TimeDelta::seconds(31)));
    }

    #[test]
    fn test_completed_is_never_available() {
        let mut item = PartitionStoreItem::new_unassigned("p1");
        item.source_partition_status = PartitionStatus::Completed;

        assert!(!item.is_available(Utc::now()));
        assert!(item.available_since().is_none());
    }

    #[test]
    fn test_version_is_not_part_of_the_persisted_payload() {
        let mut item = PartitionStoreItem::new_unassigned("p1");
        item.version = 42;

        let payload = serde_json::to_string(&item).unwrap();
        let decoded: PartitionStoreItem = serde_json::from_str(&payload).unwrap();
        assert_eq!(decoded.version, 0);
        assert_eq!(decoded.source_partition_key, "p1");
    }

    #[test]
    fn test_ordering_prefers_longest_eligible() {
        let now = Utc::now();
        let unassigned = PartitionStoreItem::new_unassigned("p1");

        let mut expired = PartitionStoreItem::new_unassigned("p2");
        expired.source_partition_status = PartitionStatus::Assigned;
        expired.partition_owner = Some("owner-a".to_string());
        expired.partition_ownership_timeout = Some(now - TimeDelta::seconds(10));

        let mut reopened = PartitionStoreItem::new_unassigned("p3");
        reopened.source_partition_status = PartitionStatus::Closed;
        reopened.re_open_at = Some(now - TimeDelta::seconds(5));

        assert!(unassigned.available_since() < expired.available_since());
        assert!(expired.available_since() < reopened.available_since());
    }
}
