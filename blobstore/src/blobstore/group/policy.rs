use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tracing::{debug, warn};

use super::{BlobStoreGroup, Member};
use crate::BlobHeaders;

/// Name of the policy used when none is configured, or the configured one is
/// unknown.
pub const DEFAULT_FILL_POLICY: &str = WriteToFirstPolicy::NAME;

/// Picks the member of a group that receives a new blob.
pub trait PlacementPolicy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Returns a writable member, or None if there is none.
    fn choose_blob_store<'g>(
        &self,
        group: &'g BlobStoreGroup,
        headers: &BlobHeaders,
    ) -> Option<&'g Member>;
}

/// Writes to the first writable member, in configured order.
#[derive(Debug, Default)]
pub struct WriteToFirstPolicy;

impl WriteToFirstPolicy {
    pub const NAME: &'static str = "writeToFirst";
}

impl PlacementPolicy for WriteToFirstPolicy {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn choose_blob_store<'g>(
        &self,
        group: &'g BlobStoreGroup,
        _headers: &BlobHeaders,
    ) -> Option<&'g Member> {
        group.members().iter().find(|m| m.store().is_writable())
    }
}

/// Spreads new blobs across the writable members in turn.
#[derive(Debug, Default)]
pub struct RoundRobinPolicy {
    next: AtomicUsize,
}

impl RoundRobinPolicy {
    pub const NAME: &'static str = "roundRobin";
}

impl PlacementPolicy for RoundRobinPolicy {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn choose_blob_store<'g>(
        &self,
        group: &'g BlobStoreGroup,
        _headers: &BlobHeaders,
    ) -> Option<&'g Member> {
        let writable: Vec<&Member> = group
            .members()
            .iter()
            .filter(|m| m.store().is_writable())
            .collect();
        if writable.is_empty() {
            return None;
        }

        let i = self.next.fetch_add(1, Ordering::Relaxed) % writable.len();
        Some(writable[i])
    }
}

pub type PolicyFactory = fn() -> Arc<dyn PlacementPolicy>;

/// Maps placement policy names to factories.
pub struct PolicyRegistry(BTreeMap<&'static str, PolicyFactory>);

impl PolicyRegistry {
    /// A registry without any policies. Everything resolves to the default.
    pub fn empty() -> Self {
        Self(BTreeMap::new())
    }

    pub fn register(&mut self, name: &'static str, factory: PolicyFactory) {
        self.0.insert(name, factory);
    }

    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.0.keys().copied()
    }

    /// Instantiates the named policy. Unset or unknown names fall back to
    /// [WriteToFirstPolicy], a missing policy must not keep a group from
    /// serving.
    pub fn resolve(&self, name: Option<&str>) -> Arc<dyn PlacementPolicy> {
        match name {
            None => debug!(policy = DEFAULT_FILL_POLICY, "no fill policy configured"),
            Some(name) => match self.0.get(name) {
                Some(factory) => return factory(),
                None => warn!(
                    policy = name,
                    fallback = DEFAULT_FILL_POLICY,
                    "unknown fill policy, using fallback"
                ),
            },
        }
        Arc::new(WriteToFirstPolicy)
    }
}

impl Default for PolicyRegistry {
    fn default() -> Self {
        let mut reg = Self::empty();
        reg.register(WriteToFirstPolicy::NAME, || {
            Arc::new(WriteToFirstPolicy) as Arc<dyn PlacementPolicy>
        });
        reg.register(RoundRobinPolicy::NAME, || {
            Arc::new(RoundRobinPolicy::default()) as Arc<dyn PlacementPolicy>
        });
        reg
    }
}
