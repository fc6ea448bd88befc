//! The composition module builds a set of named blob stores from their
//! configurations _at runtime_, resolving references between them (a group
//! names its members).
//!
//! Store configs are deserialized with serde. The registry maps the `type` tag
//! of an internally tagged config to a Config struct, which is deserialized and
//! returned as a `Box<dyn ServiceBuilder<Output = dyn BlobStore>>`.
//!
//! ### Example 1.: Registering a new kind of BlobStore
//!
//! You need a Config struct which implements `DeserializeOwned`,
//! `TryFrom<url::Url>` and `ServiceBuilder<Output = dyn BlobStore>`.
//!
//! ```
//! use std::sync::Arc;
//!
//! use depot_blobstore::composition::*;
//! use depot_blobstore::blobstore::BlobStore;
//!
//! #[derive(serde::Deserialize)]
//! struct MyBlobStoreConfig {
//! }
//!
//! #[async_trait::async_trait]
//! impl ServiceBuilder for MyBlobStoreConfig {
//!     type Output = dyn BlobStore;
//!     async fn build(&self, _: &str, _: &CompositionContext<Self::Output>) -> Result<Arc<Self::Output>, Box<dyn std::error::Error + Send + Sync + 'static>> {
//!         todo!()
//!     }
//! }
//!
//! impl TryFrom<url::Url> for MyBlobStoreConfig {
//!     type Error = Box<dyn std::error::Error + Send + Sync>;
//!     fn try_from(url: url::Url) -> Result<Self, Self::Error> {
//!         todo!()
//!     }
//! }
//!
//! pub fn add_my_store(reg: &mut Registry) {
//!     reg.register::<Box<dyn ServiceBuilder<Output = dyn BlobStore>>, MyBlobStoreConfig>("mystoretype");
//! }
//! ```
//!
//! ### Example 2.: Composing a group out of two memory stores
//!
//! ```
//! use depot_blobstore::composition::*;
//! use depot_blobstore::blobstore::BlobStore;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! # tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(async move {
//! let configs_json = serde_json::json!({
//!   "one": {
//!     "type": "memory"
//!   },
//!   "two": {
//!     "type": "memory"
//!   },
//!   "default": {
//!     "type": "group",
//!     "members": ["one", "two"],
//!     "fill_policy": "roundRobin"
//!   }
//! });
//!
//! let configs = with_registry(&REG, || serde_json::from_value(configs_json))?;
//! let composition = Composition::<dyn BlobStore>::from_configs(configs);
//! let blob_store = composition.build("default").await?;
//! # Ok(())
//! # })
//! # }
//! ```
//!
//! ### Example 3.: Extending the default registry with third-party types
//!
//! ```
//! # pub fn add_my_store(reg: &mut depot_blobstore::composition::Registry) {}
//! let mut my_registry = depot_blobstore::composition::Registry::default();
//! depot_blobstore::composition::add_default_services(&mut my_registry);
//! add_my_store(&mut my_registry);
//! ```
//!
//! Continue with Example 2, with my_registry instead of REG.

use async_trait::async_trait;
use erased_serde::deserialize;
use futures::future::BoxFuture;
use futures::FutureExt;
use lazy_static::lazy_static;
use serde::de::DeserializeOwned;
use serde_tagged::de::{BoxFnSeed, SeedFactory};
use serde_tagged::util::TagString;
use std::any::{Any, TypeId};
use std::cell::Cell;
use std::collections::BTreeMap;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;

use crate::blobstore::{BlobStore, MemberRegistry};
use crate::Error;

/// Resolves tag names to the corresponding Config type.
// One registry serves every output type, so the TypeId of the requested
// output is part of the key, and entries are stored type-erased and
// downcast to `RegistryEntry<T>` on lookup.
#[derive(Default)]
pub struct Registry(BTreeMap<(TypeId, &'static str), Box<dyn Any + Sync>>);

pub type FromUrlSeed<T> =
    Box<dyn Fn(url::Url) -> Result<T, Box<dyn std::error::Error + Send + Sync>> + Sync>;

pub struct RegistryEntry<T> {
    serde_deserialize_seed: BoxFnSeed<DeserializeWithRegistry<T>>,
    from_url_seed: FromUrlSeed<DeserializeWithRegistry<T>>,
}

impl Registry {
    /// Registers a mapping from type tag to a concrete config type.
    ///
    /// After calling `register::<Box<dyn FooTrait>, FooStruct>("footype")`,
    /// deserializing an input tagged "footype" into a `Box<dyn FooTrait>`
    /// goes through the Deserialize impl of `FooStruct`, followed by
    /// `Into::into`.
    pub fn register<
        T: 'static,
        C: DeserializeOwned
            + TryFrom<url::Url, Error = Box<dyn std::error::Error + Send + Sync>>
            + Into<T>,
    >(
        &mut self,
        type_name: &'static str,
    ) {
        self.0.insert(
            (TypeId::of::<T>(), type_name),
            Box::new(RegistryEntry {
                serde_deserialize_seed: BoxFnSeed::new(|x| {
                    deserialize::<C>(x)
                        .map(Into::into)
                        .map(DeserializeWithRegistry)
                }),
                from_url_seed: Box::new(|url| {
                    C::try_from(url)
                        .map(Into::into)
                        .map(DeserializeWithRegistry)
                }),
            }),
        );
    }

    fn entry<T: 'static>(&self, tag: &str) -> Option<&RegistryEntry<T>> {
        // find() instead of get(), the key borrows a &'static str.
        self.0
            .iter()
            .find(|((type_id, name), _)| *type_id == TypeId::of::<T>() && *name == tag)
            .and_then(|(_, entry)| <dyn Any>::downcast_ref(&**entry))
    }
}

struct RegistryWithFakeType<'r, T>(&'r Registry, PhantomData<T>);

impl<'r, 'de: 'r, T: 'static> SeedFactory<'de, TagString<'de>> for RegistryWithFakeType<'r, T> {
    type Value = DeserializeWithRegistry<T>;
    type Seed = &'r BoxFnSeed<Self::Value>;

    fn seed<E>(self, tag: TagString<'de>) -> Result<Self::Seed, E>
    where
        E: serde::de::Error,
    {
        let tag: &str = tag.as_ref();
        self.0
            .entry::<T>(tag)
            .map(|entry| &entry.serde_deserialize_seed)
            .ok_or_else(|| serde::de::Error::custom(format!("unknown store type {}", tag)))
    }
}

/// Wrapper type which implements Deserialize using the active registry.
///
/// Deserializing a `DeserializeWithRegistry<Box<dyn MyTrait>>` uses the types
/// registered for `Box<dyn MyTrait>`.
pub struct DeserializeWithRegistry<T>(pub T);

impl<'de, T: 'static> serde::Deserialize<'de> for DeserializeWithRegistry<T> {
    fn deserialize<D>(de: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let reg = ACTIVE_REG
            .get()
            .ok_or_else(|| serde::de::Error::custom("no active registry, use with_registry"))?;
        serde_tagged::de::internal::deserialize(
            de,
            "type",
            RegistryWithFakeType(reg, PhantomData::<T>),
        )
    }
}

#[derive(Debug, thiserror::Error)]
enum TryFromUrlError {
    #[error("unknown store type: {0}")]
    UnknownTag(String),
    #[error("no active registry, use with_registry")]
    NoRegistry,
}

impl<T: 'static> TryFrom<url::Url> for DeserializeWithRegistry<T> {
    type Error = Box<dyn std::error::Error + Send + Sync>;
    fn try_from(url: url::Url) -> Result<Self, Self::Error> {
        // "filesystem+foo://…" is looked up as "filesystem".
        let tag = url.scheme().split('+').next().unwrap_or_default();
        let reg = ACTIVE_REG.get().ok_or(TryFromUrlError::NoRegistry)?;
        let entry = reg
            .entry::<T>(tag)
            .ok_or_else(|| TryFromUrlError::UnknownTag(tag.into()))?;
        (entry.from_url_seed)(url)
    }
}

thread_local! {
    /// The active Registry is global state, as there's no universal way to
    /// pass state into `serde_json::from_str`, `toml::from_str` and friends.
    static ACTIVE_REG: Cell<Option<&'static Registry>> = const { Cell::new(None) };
}

/// Run the provided closure with a registry context.
/// Any serde deserialize calls within the closure will use the registry to
/// resolve tag names to the corresponding Config type.
pub fn with_registry<R>(reg: &'static Registry, f: impl FnOnce() -> R) -> R {
    let prev = ACTIVE_REG.replace(Some(reg));
    let result = f();
    ACTIVE_REG.set(prev);
    result
}

lazy_static! {
    /// The registry with all builtin blob store types.
    pub static ref REG: Registry = {
        let mut reg = Default::default();
        add_default_services(&mut reg);
        reg
    };
}

/// Register the builtin blob stores with the given registry.
/// Useful to build a registry with the builtin types _and_ third-party ones.
pub fn add_default_services(reg: &mut Registry) {
    crate::blobstore::register_blob_stores(reg);
}

/// Handed to [ServiceBuilder::build], allows resolving other named stores of
/// the same composition.
pub struct CompositionContext<'a, T: ?Sized> {
    // names of the stores currently being built, to detect cycles.
    stack: Vec<String>,
    composition: Option<&'a Composition<T>>,
}

impl<'a, T: ?Sized + Send + Sync + 'static> CompositionContext<'a, T> {
    /// A context that can't resolve anything, for stores built on their own.
    pub fn blank() -> Self {
        Self {
            stack: Default::default(),
            composition: None,
        }
    }

    pub async fn resolve(
        &self,
        entrypoint: String,
    ) -> Result<Arc<T>, Box<dyn std::error::Error + Send + Sync + 'static>> {
        if self.stack.contains(&entrypoint) {
            return Err(CompositionError::Recursion(self.stack.clone()).into());
        }
        match self.composition {
            Some(comp) => Ok(comp.build_internal(self.stack.clone(), entrypoint).await?),
            None => Err(CompositionError::NotFound(entrypoint).into()),
        }
    }
}

/// Group members are resolved through the composition they're configured in.
#[async_trait]
impl<'a> MemberRegistry for CompositionContext<'a, dyn BlobStore> {
    async fn resolve(&self, name: &str) -> Result<Arc<dyn BlobStore>, Error> {
        CompositionContext::<dyn BlobStore>::resolve(self, name.to_string())
            .await
            .map_err(|e| Error::StorageError(e.to_string()))
    }
}

/// Implemented on a per-store-type Config struct, instantiates the store.
#[async_trait]
pub trait ServiceBuilder: Send + Sync {
    type Output: ?Sized;
    async fn build(
        &self,
        instance_name: &str,
        context: &CompositionContext<Self::Output>,
    ) -> Result<Arc<Self::Output>, Box<dyn std::error::Error + Send + Sync + 'static>>;
}

impl<T: ?Sized, S: ServiceBuilder<Output = T> + 'static> From<S>
    for Box<dyn ServiceBuilder<Output = T>>
{
    fn from(t: S) -> Self {
        Box::new(t)
    }
}

enum InstantiationState<T: ?Sized> {
    Config(Box<dyn ServiceBuilder<Output = T>>),
    InProgress(tokio::sync::watch::Receiver<Option<Result<Arc<T>, CompositionError>>>),
    Done(Result<Arc<T>, CompositionError>),
}

/// A set of named store configs, each instantiated at most once, on first use.
pub struct Composition<T: ?Sized> {
    instances: std::sync::Mutex<HashMap<String, InstantiationState<T>>>,
}

#[derive(thiserror::Error, Clone, Debug)]
pub enum CompositionError {
    #[error("store not found: {0}")]
    NotFound(String),
    #[error("recursion not allowed {0:?}")]
    Recursion(Vec<String>),
    #[error("store construction panicked {0}")]
    Poisoned(String),
    #[error("instantiation of store {0} failed: {1}")]
    Failed(String, Arc<dyn std::error::Error + Send + Sync>),
}

impl<T: ?Sized + Send + Sync + 'static> Composition<T> {
    pub fn from_configs(
        // The concrete HashMap type drives type inference when deserializing.
        configs: HashMap<String, DeserializeWithRegistry<Box<dyn ServiceBuilder<Output = T>>>>,
    ) -> Self {
        Self::from_configs_iter(configs)
    }

    pub fn from_configs_iter(
        configs: impl IntoIterator<
            Item = (
                String,
                DeserializeWithRegistry<Box<dyn ServiceBuilder<Output = T>>>,
            ),
        >,
    ) -> Self {
        Composition {
            instances: std::sync::Mutex::new(
                configs
                    .into_iter()
                    .map(|(k, v)| (k, InstantiationState::Config(v.0)))
                    .collect(),
            ),
        }
    }

    /// Returns the store with the given name, building it (and everything
    /// it refers to) if not done yet.
    pub async fn build(&self, entrypoint: &str) -> Result<Arc<T>, CompositionError> {
        self.build_internal(vec![], entrypoint.to_string()).await
    }

    fn build_internal(
        &self,
        stack: Vec<String>,
        entrypoint: String,
    ) -> BoxFuture<'_, Result<Arc<T>, CompositionError>> {
        let mut instances = match self.instances.lock() {
            Ok(instances) => instances,
            Err(_) => {
                return futures::future::err(CompositionError::Poisoned(entrypoint)).boxed()
            }
        };
        let entry = match instances.get_mut(&entrypoint) {
            Some(v) => v,
            None => return futures::future::err(CompositionError::NotFound(entrypoint)).boxed(),
        };
        // Swap in a placeholder while computing the new state. The lock is
        // held throughout, nobody observes it.
        let prev_val = std::mem::replace(
            entry,
            InstantiationState::Done(Err(CompositionError::Poisoned(entrypoint.clone()))),
        );
        let (new_val, ret) = match prev_val {
            InstantiationState::Done(store) => (
                InstantiationState::Done(store.clone()),
                futures::future::ready(store).boxed(),
            ),
            InstantiationState::Config(config) => {
                let (tx, rx) = tokio::sync::watch::channel(None);
                (
                    InstantiationState::InProgress(rx),
                    (async move {
                        let mut new_context = CompositionContext {
                            stack: stack.clone(),
                            composition: Some(self),
                        };
                        new_context.stack.push(entrypoint.clone());
                        let res = config
                            .build(&entrypoint, &new_context)
                            .await
                            .map_err(|e| CompositionError::Failed(entrypoint.clone(), e.into()));

                        // receivers may be gone already, that's fine.
                        let _ = tx.send(Some(res.clone()));

                        if let Ok(mut instances) = self.instances.lock() {
                            instances.insert(entrypoint, InstantiationState::Done(res.clone()));
                        }
                        res
                    })
                    .boxed(),
                )
            }
            // someone else is building this store already, wait for them.
            InstantiationState::InProgress(mut recv) => {
                (InstantiationState::InProgress(recv.clone()), {
                    let entrypoint = entrypoint.clone();
                    (async move {
                        loop {
                            if let Some(v) = recv.borrow_and_update().as_ref().cloned() {
                                break v;
                            }
                            if recv.changed().await.is_err() {
                                break Err(CompositionError::Poisoned(entrypoint));
                            }
                        }
                    })
                    .boxed()
                })
            }
        };
        *entry = new_val;
        ret
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::blobstore::BlobStore;

    fn parse(
        json: serde_json::Value,
    ) -> HashMap<String, DeserializeWithRegistry<Box<dyn ServiceBuilder<Output = dyn BlobStore>>>>
    {
        with_registry(&REG, || serde_json::from_value(json)).expect("must deserialize")
    }

    #[tokio::test]
    async fn build_group() {
        let composition = Composition::<dyn BlobStore>::from_configs(parse(serde_json::json!({
            "one": { "type": "memory" },
            "two": { "type": "memory" },
            "default": { "type": "group", "members": ["one", "two"] }
        })));

        let group = composition.build("default").await.expect("must build");
        assert_eq!("default", group.configuration().name);
        assert_eq!("group", group.configuration().type_name);
        assert!(group.is_writable());

        // members are shared with the composition.
        let one = composition.build("one").await.expect("must build");
        assert_eq!("one", one.configuration().name);
    }

    #[tokio::test]
    async fn missing_member() {
        let composition = Composition::<dyn BlobStore>::from_configs(parse(serde_json::json!({
            "default": { "type": "group", "members": ["nope"] }
        })));

        assert!(composition.build("default").await.is_err());
    }

    #[tokio::test]
    async fn reject_recursion() {
        let composition = Composition::<dyn BlobStore>::from_configs(parse(serde_json::json!({
            "a": { "type": "group", "members": ["b"] },
            "b": { "type": "group", "members": ["a"] }
        })));

        assert!(composition.build("a").await.is_err());
    }

    #[test]
    fn reject_unknown_type() {
        let res: Result<
            HashMap<
                String,
                DeserializeWithRegistry<Box<dyn ServiceBuilder<Output = dyn BlobStore>>>,
            >,
            _,
        > = with_registry(&REG, || {
            serde_json::from_value(serde_json::json!({
                "default": { "type": "carrier-pigeon" }
            }))
        });
        assert!(res.is_err());
    }
}
