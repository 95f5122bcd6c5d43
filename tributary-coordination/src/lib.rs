//! Distributed source-partition coordination for tributary pipelines.
//!
//! Horizontally-scaled instances of the same source plugin use this crate to
//! cooperatively claim, process, checkpoint, release and retire disjoint
//! units of work ("partitions") against a shared durable store, without any
//! instance talking to another. Correctness rests entirely on the backing
//! store offering atomic conditional updates; there is no leader election
//! and no quorum.
//!
//! A source drives the protocol in a loop:
//!
//! ```no_run
//! # use std::time::Duration;
//! # use tributary_coordination::{
//! #     CoordinatorConfig, LeaseCoordinator, PartitionIdentifier,
//! #     store::in_memory_store::InMemoryStore,
//! # };
//! # async fn run() -> tributary_coordination::Result<()> {
//! let coordinator: LeaseCoordinator<String, _> = LeaseCoordinator::new(
//!     InMemoryStore::new(),
//!     CoordinatorConfig::new("s3-source"),
//! );
//! coordinator.initialize().await?;
//!
//! while let Some(partition) = coordinator
//!     .get_next_partition(|| vec![PartitionIdentifier::new("bucket/object.json")])
//!     .await?
//! {
//!     // ... read records, checkpoint along the way ...
//!     coordinator
//!         .save_progress_state(&partition.partition_key, &"offset=10".to_string())
//!         .await?;
//!     coordinator
//!         .close_partition(&partition.partition_key, Duration::from_secs(60), 5)
//!         .await?;
//! }
//! coordinator.give_up_partitions().await?;
//! # Ok(())
//! # }
//! ```

/// Configurations for the coordinator, owner identity included.
pub mod config;

/// The lease-based coordinator implementing the caller-facing protocol.
pub mod coordinator;

pub mod error;

/// The partition data model: identifiers, statuses, the durable store item
/// and the lease handle returned to callers.
pub mod partition;

/// The durable-store contract and its bundled backends.
pub mod store;

pub use config::CoordinatorConfig;
pub use coordinator::LeaseCoordinator;
pub use error::{Error, Result};
pub use partition::{PartitionIdentifier, PartitionStatus, PartitionStoreItem, SourcePartition};
pub use store::CoordinationStore;
