//! A blob store aggregating several member blob stores behind the
//! [BlobStore] contract.
//!
//! New blobs go to the member picked by the [PlacementPolicy]. Reads consult
//! the [LocationCache], and scan the members if it can't help. An id may, in
//! degenerate cases, be held by more than one member; operations whose outcome
//! depends on several members aggregate explicitly:
//!
//! - [BlobStore::exists] and [BlobStore::get] return the first match, writable
//!   members first.
//! - [BlobStore::delete] and [BlobStore::delete_hard] ask every member holding
//!   the id, and succeed only if all of them did. Successful deletions are not
//!   rolled back if another member fails.
//! - [BlobStore::delete_if_temp] stops at the first member that deleted.
//! - [BlobStore::make_blob_permanent] promotes in place on the first owner,
//!   never copying between members.

use std::num::NonZeroUsize;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use parking_lot::RwLock;
use tokio::io::AsyncRead;
use tracing::{debug, info, instrument, trace, warn};

use super::{BlobStore, MemberRegistry};
use crate::composition::{CompositionContext, ServiceBuilder};
use crate::configuration::{
    GroupConfiguration, GROUP_FILL_POLICY_KEY, GROUP_MEMBERS_KEY, GROUP_SECTION,
};
use crate::metrics::{self, OperationMetricsDelta};
use crate::{Blob, BlobHeaders, BlobId, BlobStoreConfiguration, Error};

mod cache;
mod policy;

pub use self::cache::{LocationCache, DEFAULT_CACHE_CAPACITY, DEFAULT_CACHE_TTL};
pub use self::policy::{
    PlacementPolicy, PolicyFactory, PolicyRegistry, RoundRobinPolicy, WriteToFirstPolicy,
    DEFAULT_FILL_POLICY,
};

pub const GROUP_TYPE: &str = "group";

/// A blob store participating in a group, by its configured name.
pub struct Member {
    name: String,
    store: Arc<dyn BlobStore>,
}

impl Member {
    pub fn new(name: impl Into<String>, store: Arc<dyn BlobStore>) -> Self {
        Self {
            name: name.into(),
            store,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn store(&self) -> &Arc<dyn BlobStore> {
        &self.store
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum State {
    Initialized,
    Started,
    Stopped,
}

pub struct BlobStoreGroup {
    configuration: BlobStoreConfiguration,
    // resolved once in init, never changed afterwards.
    members: Vec<Member>,
    policy: Arc<dyn PlacementPolicy>,
    cache: LocationCache,
    state: RwLock<State>,
}

impl BlobStoreGroup {
    /// Resolves the configured members through the registry, and the
    /// configured placement policy. The group needs to be started before it
    /// serves requests.
    #[instrument(skip_all, fields(blob_store.name = %configuration.name), err)]
    pub async fn init(
        configuration: BlobStoreConfiguration,
        registry: &dyn MemberRegistry,
        policies: &PolicyRegistry,
        cache: LocationCache,
    ) -> Result<Self, Error> {
        let group_configuration = GroupConfiguration::try_from(&configuration)?;

        let mut members = Vec::with_capacity(group_configuration.members.len());
        for name in group_configuration.members {
            let store = registry.resolve(&name).await?;
            members.push(Member { name, store });
        }

        let policy = policies.resolve(group_configuration.fill_policy.as_deref());

        info!(
            members = ?members.iter().map(|m| m.name.as_str()).collect::<Vec<_>>(),
            policy = policy.name(),
            "initialized blob store group"
        );

        Ok(Self {
            configuration,
            members,
            policy,
            cache,
            state: RwLock::new(State::Initialized),
        })
    }

    /// The members, in configured order.
    pub fn members(&self) -> &[Member] {
        &self.members
    }

    pub fn member(&self, name: &str) -> Option<&Member> {
        self.members.iter().find(|m| m.name == name)
    }

    pub fn placement_policy(&self) -> &dyn PlacementPolicy {
        self.policy.as_ref()
    }

    pub fn location_cache(&self) -> &LocationCache {
        &self.cache
    }

    fn ensure_started(&self) -> Result<(), Error> {
        match *self.state.read() {
            State::Started => Ok(()),
            state => Err(Error::InvalidRequest(format!(
                "blob store group {} is not started ({:?})",
                self.configuration.name, state
            ))),
        }
    }

    /// Finds the member holding a live blob with the id.
    ///
    /// A cached location is used if the member still confirms it. Otherwise
    /// writable members are asked first, then the others, each in configured
    /// order. Hits on writable members are cached.
    #[instrument(skip(self), fields(blob.id = %id))]
    pub async fn locate(&self, id: &BlobId) -> Result<Option<&Member>, Error> {
        self.ensure_started()?;

        if let Some(name) = self.cache.get(id) {
            if let Some(member) = self.member(&name) {
                if member.store.exists(id).await? {
                    trace!(member = %member.name, "location cache hit");
                    return Ok(Some(member));
                }
            }
            trace!(member = %name, "stale location cache entry");
            self.cache.invalidate(id);
        }

        let (writable, read_only): (Vec<&Member>, Vec<&Member>) =
            self.members.iter().partition(|m| m.store.is_writable());

        for member in writable {
            if member.store.exists(id).await? {
                debug!(member = %member.name, "located blob");
                self.cache.put(id.clone(), member.name.clone());
                return Ok(Some(member));
            }
        }

        for member in read_only {
            if member.store.exists(id).await? {
                debug!(member = %member.name, "located blob on read-only member");
                return Ok(Some(member));
            }
        }

        Ok(None)
    }

    fn choose_member(&self, headers: &BlobHeaders) -> Result<&Member, Error> {
        let member = self
            .policy
            .choose_blob_store(self, headers)
            .ok_or_else(|| {
                Error::InvalidRequest(format!(
                    "blob store group {} has no writable member",
                    self.configuration.name
                ))
            })?;
        debug!(member = %member.name, policy = self.policy.name(), "placing new blob");
        Ok(member)
    }

    /// All members holding the id, in configured order. Never uses the cache.
    async fn owners(&self, id: &BlobId, include_deleted: bool) -> Result<Vec<&Member>, Error> {
        let mut owners = Vec::new();
        for member in &self.members {
            let holds = if include_deleted {
                member.store.exists_including_deleted(id).await?
            } else {
                member.store.exists(id).await?
            };
            if holds {
                owners.push(member);
            }
        }
        Ok(owners)
    }

    async fn delete_from_owners(&self, id: &BlobId, reason: &str) -> Result<bool, Error> {
        let owners = self.owners(id, false).await?;
        if owners.is_empty() {
            debug!("no member holds the blob");
            return Ok(false);
        }

        let mut deleted_all = true;
        for member in owners {
            if !member.store.delete(id, reason).await? {
                warn!(member = %member.name, "member did not delete blob");
                deleted_all = false;
            }
        }
        Ok(deleted_all)
    }

    async fn delete_hard_from_owners(&self, id: &BlobId) -> Result<bool, Error> {
        let owners = self.owners(id, true).await?;
        if owners.is_empty() {
            debug!("no member holds the blob");
            return Ok(false);
        }

        let mut deleted_all = true;
        for member in owners {
            if !member.store.delete_hard(id).await? {
                warn!(member = %member.name, "member did not purge blob");
                deleted_all = false;
            }
        }
        Ok(deleted_all)
    }
}

#[async_trait]
impl BlobStore for BlobStoreGroup {
    #[instrument(skip_all, fields(blob_store.name = %self.configuration.name))]
    async fn start(&self) -> Result<(), Error> {
        *self.state.write() = State::Started;
        info!("started blob store group");
        Ok(())
    }

    #[instrument(skip_all, fields(blob_store.name = %self.configuration.name))]
    async fn stop(&self) -> Result<(), Error> {
        *self.state.write() = State::Stopped;
        self.cache.clear();
        info!("stopped blob store group");
        Ok(())
    }

    #[instrument(skip_all, fields(blob_store.name = %self.configuration.name))]
    async fn create(
        &self,
        reader: &mut (dyn AsyncRead + Send + Unpin),
        headers: BlobHeaders,
    ) -> Result<Blob, Error> {
        self.ensure_started()?;
        let member = self.choose_member(&headers)?;
        member.store.create(reader, headers).await
    }

    #[instrument(skip_all, fields(blob_store.name = %self.configuration.name, path = %path.display()))]
    async fn create_from_path(
        &self,
        path: &Path,
        headers: BlobHeaders,
        size: u64,
        b3_digest: &str,
    ) -> Result<Blob, Error> {
        self.ensure_started()?;
        let member = self.choose_member(&headers)?;
        member
            .store
            .create_from_path(path, headers, size, b3_digest)
            .await
    }

    #[instrument(skip(self, headers), fields(blob.id = %id))]
    async fn copy(&self, id: &BlobId, headers: BlobHeaders) -> Result<Blob, Error> {
        match self.locate(id).await? {
            Some(member) => member.store.copy(id, headers).await,
            None => Err(Error::NotFound(id.clone())),
        }
    }

    #[instrument(skip(self), fields(blob.id = %id))]
    async fn get(&self, id: &BlobId, include_deleted: bool) -> Result<Option<Blob>, Error> {
        self.ensure_started()?;

        if !include_deleted {
            return match self.locate(id).await? {
                Some(member) => member.store.get(id, false).await,
                None => Ok(None),
            };
        }

        // soft-deleted blobs don't pass exists(), so locate() can't find
        // them. Try the cached member, then everyone in configured order.
        if let Some(member) = self.cache.get(id).and_then(|name| self.member(&name)) {
            if let Some(blob) = member.store.get(id, true).await? {
                return Ok(Some(blob));
            }
        }
        for member in &self.members {
            if let Some(blob) = member.store.get(id, true).await? {
                return Ok(Some(blob));
            }
        }
        Ok(None)
    }

    #[instrument(skip(self), fields(blob.id = %id))]
    async fn exists(&self, id: &BlobId) -> Result<bool, Error> {
        Ok(self.locate(id).await?.is_some())
    }

    #[instrument(skip(self), fields(blob.id = %id))]
    async fn exists_including_deleted(&self, id: &BlobId) -> Result<bool, Error> {
        self.ensure_started()?;
        Ok(!self.owners(id, true).await?.is_empty())
    }

    #[instrument(skip(self), fields(blob.id = %id))]
    async fn delete(&self, id: &BlobId, reason: &str) -> Result<bool, Error> {
        self.ensure_started()?;
        let res = self.delete_from_owners(id, reason).await;
        self.cache.invalidate(id);
        res
    }

    #[instrument(skip(self), fields(blob.id = %id))]
    async fn delete_hard(&self, id: &BlobId) -> Result<bool, Error> {
        self.ensure_started()?;
        let res = self.delete_hard_from_owners(id).await;
        self.cache.invalidate(id);
        res
    }

    fn blob_id_stream(&self) -> BoxStream<'static, Result<BlobId, Error>> {
        if let Err(e) = self.ensure_started() {
            return futures::stream::iter([Err(e)]).boxed();
        }

        let streams: Vec<_> = self
            .members
            .iter()
            .map(|m| m.store.blob_id_stream())
            .collect();
        futures::stream::iter(streams).flatten().boxed()
    }

    #[instrument(skip_all, fields(blob.id = %blob.id()))]
    async fn is_owner(&self, blob: &Blob) -> Result<bool, Error> {
        for member in &self.members {
            if member.store.is_owner(blob).await? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    #[instrument(skip_all, fields(blob.id = %blob.id()))]
    async fn make_blob_permanent(
        &self,
        blob: &Blob,
        headers: BlobHeaders,
    ) -> Result<Blob, Error> {
        self.ensure_started()?;

        for member in &self.members {
            if member.store.is_owner(blob).await? {
                debug!(member = %member.name, "promoting blob in place");
                return member.store.make_blob_permanent(blob, headers).await;
            }
        }
        Err(Error::NotFound(blob.id().clone()))
    }

    #[instrument(skip_all, fields(blob.id = %blob.id()))]
    async fn delete_if_temp(&self, blob: &Blob) -> Result<bool, Error> {
        self.ensure_started()?;

        for member in &self.members {
            if member.store.delete_if_temp(blob).await? {
                debug!(member = %member.name, "deleted temporary blob");
                self.cache.invalidate(blob.id());
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn is_writable(&self) -> bool {
        self.members.iter().any(|m| m.store.is_writable())
    }

    fn operation_metrics_delta(&self) -> OperationMetricsDelta {
        metrics::aggregate(
            self.members
                .iter()
                .map(|m| m.store.operation_metrics_delta()),
        )
    }

    fn configuration(&self) -> &BlobStoreConfiguration {
        &self.configuration
    }
}

fn default_cache_ttl_secs() -> u64 {
    DEFAULT_CACHE_TTL.as_secs()
}

fn default_cache_capacity() -> NonZeroUsize {
    NonZeroUsize::new(DEFAULT_CACHE_CAPACITY).expect("capacity must be non-zero")
}

#[derive(serde::Deserialize, Debug)]
#[serde(deny_unknown_fields)]
pub struct BlobStoreGroupConfig {
    #[serde(default)]
    members: Vec<String>,
    #[serde(default)]
    fill_policy: Option<String>,
    #[serde(default = "default_cache_ttl_secs")]
    cache_ttl_secs: u64,
    #[serde(default = "default_cache_capacity")]
    cache_capacity: NonZeroUsize,
}

impl BlobStoreGroupConfig {
    fn to_configuration(&self, instance_name: &str) -> BlobStoreConfiguration {
        let mut configuration = BlobStoreConfiguration::new(instance_name, GROUP_TYPE)
            .with_attribute(GROUP_SECTION, GROUP_MEMBERS_KEY, self.members.clone());
        if let Some(fill_policy) = &self.fill_policy {
            configuration = configuration.with_attribute(
                GROUP_SECTION,
                GROUP_FILL_POLICY_KEY,
                fill_policy.clone(),
            );
        }
        configuration
    }

    fn location_cache(&self) -> LocationCache {
        LocationCache::new(self.cache_capacity, Duration::from_secs(self.cache_ttl_secs))
    }
}

impl TryFrom<url::Url> for BlobStoreGroupConfig {
    type Error = Box<dyn std::error::Error + Send + Sync>;
    fn try_from(_url: url::Url) -> Result<Self, Self::Error> {
        Err(Error::StorageError(
            "Instantiating a BlobStoreGroup from a url is not supported".into(),
        )
        .into())
    }
}

#[async_trait]
impl ServiceBuilder for BlobStoreGroupConfig {
    type Output = dyn BlobStore;
    async fn build(
        &self,
        instance_name: &str,
        context: &CompositionContext<dyn BlobStore>,
    ) -> Result<Arc<dyn BlobStore>, Box<dyn std::error::Error + Send + Sync + 'static>> {
        let group = BlobStoreGroup::init(
            self.to_configuration(instance_name),
            context,
            &PolicyRegistry::default(),
            self.location_cache(),
        )
        .await?;
        group.start().await?;
        Ok(Arc::new(group))
    }
}
