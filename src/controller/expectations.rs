//! In-flight create/delete tracking for cluster child resources
//!
//! Creating a Pod or a PVC returns before the watch cache sees the new
//! object, so a reconcile that runs right after a create would observe the old
//! state and issue the same create again. The tracker records how many
//! creates/deletes were issued per owning cluster and resource kind, and
//! reports the cluster as "satisfied" only once every one of them has been
//! observed, or the record is older than the TTL.
//!
//! The tracker is process-local and not a source of truth. Losing it (e.g. an
//! operator restart) only means the next reconcile may act on a stale view;
//! every action is checked against live objects before being issued.

use std::fmt;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use kube::ResourceExt;
use tracing::trace;

use crate::crd::Cluster;

/// Default time after which unobserved expectations are ignored
pub const DEFAULT_EXPECTATIONS_TTL: Duration = Duration::from_secs(5 * 60);

/// Identity of the cluster owning a set of child resources
#[derive(Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct OwnerKey {
    pub namespace: String,
    pub name: String,
}

impl OwnerKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Key of a Cluster resource
    pub fn for_cluster(cluster: &Cluster) -> Self {
        Self::new(cluster.namespace().unwrap_or_default(), cluster.name_any())
    }
}

impl fmt::Display for OwnerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Child resource kinds tracked per cluster
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub enum ResourceKind {
    Pod,
    Job,
    PersistentVolumeClaim,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 3] = [
        ResourceKind::Pod,
        ResourceKind::Job,
        ResourceKind::PersistentVolumeClaim,
    ];

    fn index(self) -> usize {
        match self {
            ResourceKind::Pod => 0,
            ResourceKind::Job => 1,
            ResourceKind::PersistentVolumeClaim => 2,
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceKind::Pod => write!(f, "pod"),
            ResourceKind::Job => write!(f, "job"),
            ResourceKind::PersistentVolumeClaim => write!(f, "pvc"),
        }
    }
}

/// Pending creates/deletes for one resource kind
#[derive(Clone, Copy, Debug)]
pub struct KindExpectations {
    pub pending_creates: u32,
    pub pending_deletes: u32,
    /// When an expectation was last raised for this kind
    pub timestamp: Instant,
}

impl KindExpectations {
    fn new(now: Instant) -> Self {
        Self {
            pending_creates: 0,
            pending_deletes: 0,
            timestamp: now,
        }
    }

    /// All issued actions have been observed
    pub fn fulfilled(&self) -> bool {
        self.pending_creates == 0 && self.pending_deletes == 0
    }

    fn expired(&self, now: Instant, ttl: Duration) -> bool {
        now.saturating_duration_since(self.timestamp) > ttl
    }
}

/// Expectations of a single cluster, one slot per [`ResourceKind`]
#[derive(Clone, Debug, Default)]
pub struct ExpectationRecord {
    kinds: [Option<KindExpectations>; 3],
}

impl ExpectationRecord {
    pub fn get(&self, kind: ResourceKind) -> Option<&KindExpectations> {
        self.kinds[kind.index()].as_ref()
    }

    fn slot_mut(&mut self, kind: ResourceKind, now: Instant) -> &mut KindExpectations {
        self.kinds[kind.index()].get_or_insert_with(|| KindExpectations::new(now))
    }

    fn satisfied(&self, now: Instant, ttl: Duration) -> bool {
        self.kinds
            .iter()
            .flatten()
            .all(|k| k.fulfilled() || k.expired(now, ttl))
    }
}

/// Thread-safe expectation store, sharded by owner key
pub struct ExpectationTracker {
    records: DashMap<OwnerKey, ExpectationRecord>,
    ttl: Duration,
}

impl Default for ExpectationTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ExpectationTracker {
    /// Create a tracker with the default 5 minute TTL
    pub fn new() -> Self {
        Self::with_ttl(DEFAULT_EXPECTATIONS_TTL)
    }

    /// Create a tracker with a custom TTL
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            records: DashMap::new(),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Record that `n` creates of `kind` are about to be issued for `key`.
    ///
    /// Call before the create request so a watch event arriving ahead of the
    /// response is still matched. If the request fails, undo the expectation
    /// with [`observe_creation`](Self::observe_creation).
    pub fn expect_creations(&self, key: &OwnerKey, kind: ResourceKind, n: u32) {
        let now = Instant::now();
        let mut record = self.records.entry(key.clone()).or_default();
        let entry = record.slot_mut(kind, now);
        if entry.expired(now, self.ttl) {
            // Stale counts would otherwise delay the new expectation by a full TTL
            *entry = KindExpectations::new(now);
        }
        entry.pending_creates = entry.pending_creates.saturating_add(n);
        entry.timestamp = now;
        trace!(owner = %key, %kind, pending = entry.pending_creates, "Expecting creations");
    }

    /// Record that `n` deletes of `kind` are about to be issued for `key`
    ///
    /// Undo with [`observe_deletion`](Self::observe_deletion) if the request
    /// fails.
    pub fn expect_deletions(&self, key: &OwnerKey, kind: ResourceKind, n: u32) {
        let now = Instant::now();
        let mut record = self.records.entry(key.clone()).or_default();
        let entry = record.slot_mut(kind, now);
        if entry.expired(now, self.ttl) {
            // Stale counts would otherwise delay the new expectation by a full TTL
            *entry = KindExpectations::new(now);
        }
        entry.pending_deletes = entry.pending_deletes.saturating_add(n);
        entry.timestamp = now;
        trace!(owner = %key, %kind, pending = entry.pending_deletes, "Expecting deletions");
    }

    /// A create of `kind` owned by `key` has been observed
    pub fn observe_creation(&self, key: &OwnerKey, kind: ResourceKind) {
        if let Some(mut record) = self.records.get_mut(key)
            && let Some(entry) = record.kinds[kind.index()].as_mut()
        {
            entry.pending_creates = entry.pending_creates.saturating_sub(1);
            trace!(owner = %key, %kind, pending = entry.pending_creates, "Observed creation");
        }
    }

    /// A delete of `kind` owned by `key` has been observed
    pub fn observe_deletion(&self, key: &OwnerKey, kind: ResourceKind) {
        if let Some(mut record) = self.records.get_mut(key)
            && let Some(entry) = record.kinds[kind.index()].as_mut()
        {
            entry.pending_deletes = entry.pending_deletes.saturating_sub(1);
            trace!(owner = %key, %kind, pending = entry.pending_deletes, "Observed deletion");
        }
    }

    /// Whether all issued actions for `key` were observed or have expired.
    ///
    /// A key with no record is satisfied.
    pub fn satisfied_expectations(&self, key: &OwnerKey) -> bool {
        match self.records.get(key) {
            Some(record) => record.satisfied(Instant::now(), self.ttl),
            None => true,
        }
    }

    /// Snapshot of the expectations recorded for `key`
    pub fn pending(&self, key: &OwnerKey) -> Option<ExpectationRecord> {
        self.records.get(key).map(|r| r.clone())
    }

    /// Total unobserved creates and deletes across all clusters
    pub fn total_pending(&self) -> u64 {
        self.records
            .iter()
            .flat_map(|r| r.kinds.into_iter().flatten())
            .map(|k| u64::from(k.pending_creates) + u64::from(k.pending_deletes))
            .sum()
    }

    /// Forget everything about `key` (the cluster is gone)
    pub fn delete_expectations(&self, key: &OwnerKey) {
        self.records.remove(key);
    }
}
