use std::time::Duration;

/// Default lease stamped onto a partition at acquisition. A partition whose
/// owner has not completed, closed or checkpointed it within this window is
/// reclaimable by any other instance.
const DEFAULT_LEASE_TIMEOUT: Duration = Duration::from_secs(600);

/// Upper bound on each store call made while giving up partitions during
/// shutdown.
const DEFAULT_GIVE_UP_TIMEOUT: Duration = Duration::from_secs(5);

/// Configurations for a [crate::LeaseCoordinator]. One coordinator is built
/// per source; every instance of that source across the fleet must use the
/// same `source_identifier` so they compete over the same partition set.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Identifies the source whose partitions are being coordinated.
    pub source_identifier: String,
    /// Optional namespace prefix, for fleets that share one coordination
    /// store across multiple pipelines.
    pub partition_prefix: Option<String>,
    /// Identity of this instance within the fleet. Defaults to the HOSTNAME
    /// environment variable, falling back to a generated uuid.
    pub instance_identity: Option<String>,
    /// Lease duration stamped onto a partition at acquisition and renewed on
    /// every progress-state save.
    pub lease_timeout: Duration,
    /// When set, the partition discovery supplier is re-run at least this
    /// often even if acquisition succeeds outright. Sources whose partition
    /// universe grows over time (change streams) need periodic
    /// re-enumeration; listing-style sources can leave this unset.
    pub force_supplier_after: Option<Duration>,
    /// Bound on each store call during [crate::LeaseCoordinator::give_up_partitions],
    /// so a dead store cannot block shutdown.
    pub give_up_timeout: Duration,
}

impl CoordinatorConfig {
    pub fn new(source_identifier: impl Into<String>) -> Self {
        CoordinatorConfig {
            source_identifier: source_identifier.into(),
            partition_prefix: None,
            instance_identity: None,
            lease_timeout: DEFAULT_LEASE_TIMEOUT,
            force_supplier_after: None,
            give_up_timeout: DEFAULT_GIVE_UP_TIMEOUT,
        }
    }

    pub fn with_partition_prefix(mut self, partition_prefix: impl Into<String>) -> Self {
        self.partition_prefix = Some(partition_prefix.into());
        self
    }

    pub fn with_instance_identity(mut self, instance_identity: impl Into<String>) -> Self {
        self.instance_identity = Some(instance_identity.into());
        self
    }

    pub fn with_lease_timeout(mut self, lease_timeout: Duration) -> Self {
        self.lease_timeout = lease_timeout;
        self
    }

    pub fn with_force_supplier_after(mut self, force_supplier_after: Duration) -> Self {
        self.force_supplier_after = Some(force_supplier_after);
        self
    }

    pub fn with_give_up_timeout(mut self, give_up_timeout: Duration) -> Self {
        self.give_up_timeout = give_up_timeout;
        self
    }

    /// The fully-qualified source identifier, `{prefix}|{source}` when a
    /// prefix is configured.
    pub(crate) fn qualified_source_identifier(&self) -> String {
        match &self.partition_prefix {
            Some(prefix) => format!("{prefix}|{}", self.source_identifier),
            None => self.source_identifier.clone(),
        }
    }

    /// Owner id stamped into `partition_owner` on acquisition, in the form
    /// `{qualified_source}:{instance}`.
    pub(crate) fn owner_id(&self) -> String {
        let instance = self
            .instance_identity
            .clone()
            .or_else(|| std::env::var("HOSTNAME").ok())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        format!("{}:{instance}", self.qualified_source_identifier())
    }
}
