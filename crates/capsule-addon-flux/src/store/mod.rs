//! Access to the Kubernetes object store.
//!
//! [`ObjectStore`] is the seam between the reconciliation logic and the API server. [`Client`] is
//! the real implementation, [`MemoryStore`] keeps objects in-process and is what the tests run
//! against.
//!
//! Writes are funnelled through [`create_or_update`] and [`update_if_changed`], which fetch the
//! current object, let a mutation closure repair it and only write when the closure reports a
//! change.
use std::fmt::Debug;

use async_trait::async_trait;
use k8s_openapi::{ClusterResourceScope, NamespaceResourceScope};
use kube::{Api, Resource, ResourceExt};
use serde::{Serialize, de::DeserializeOwned};
use snafu::{OptionExt, Snafu};

pub mod client;
pub mod memory;

pub use client::Client;
pub use memory::MemoryStore;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("failed to get {kind} {name:?}"))]
    GetObject {
        source: kube::Error,
        kind: String,
        name: String,
    },

    #[snafu(display("failed to list {kind}"))]
    ListObjects { source: kube::Error, kind: String },

    #[snafu(display("failed to create {kind} {name:?}"))]
    CreateObject {
        source: kube::Error,
        kind: String,
        name: String,
    },

    #[snafu(display("failed to replace {kind} {name:?}"))]
    ReplaceObject {
        source: kube::Error,
        kind: String,
        name: String,
    },

    #[snafu(display("{kind} {name:?} already exists"))]
    AlreadyExists { kind: String, name: String },

    #[snafu(display("{kind} {name:?} was modified concurrently, expected resource version {expected:?}"))]
    Conflict {
        kind: String,
        name: String,
        expected: Option<String>,
    },

    #[snafu(display("{kind} {name:?} does not exist"))]
    ObjectNotFound { kind: String, name: String },

    #[snafu(display("{kind} object has no name"))]
    MissingName { kind: String },

    #[snafu(display("failed to convert {kind} {name:?}"))]
    ConvertObject {
        source: serde_json::Error,
        kind: String,
        name: String,
    },
}

/// Picks the right [`Api`] constructor for a resource scope.
pub trait ApiScope {
    const NAMESPACED: bool;

    fn api<K>(client: kube::Client, namespace: Option<&str>) -> Api<K>
    where
        K: Resource<DynamicType = (), Scope = Self>;
}

impl ApiScope for NamespaceResourceScope {
    const NAMESPACED: bool = true;

    fn api<K>(client: kube::Client, namespace: Option<&str>) -> Api<K>
    where
        K: Resource<DynamicType = (), Scope = Self>,
    {
        match namespace {
            Some(namespace) => Api::namespaced(client, namespace),
            None => Api::all(client),
        }
    }
}

impl ApiScope for ClusterResourceScope {
    const NAMESPACED: bool = false;

    fn api<K>(client: kube::Client, _namespace: Option<&str>) -> Api<K>
    where
        K: Resource<DynamicType = (), Scope = Self>,
    {
        Api::all(client)
    }
}

/// Any statically typed Kubernetes object the store can handle.
pub trait StoreObject:
    Resource<DynamicType = (), Scope: ApiScope>
    + Clone
    + Debug
    + DeserializeOwned
    + Serialize
    + Send
    + Sync
    + 'static
{
}

impl<K> StoreObject for K
where
    K: Resource<DynamicType = ()>
        + Clone
        + Debug
        + DeserializeOwned
        + Serialize
        + Send
        + Sync
        + 'static,
    K::Scope: ApiScope,
{
}

pub(crate) fn kind_of<K: StoreObject>() -> String {
    K::kind(&()).into_owned()
}

/// Get, list, create and replace objects.
///
/// `namespace` is ignored for cluster scoped objects. For namespaced objects `None` means all
/// namespaces.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Returns `None` if the object does not exist.
    async fn get_opt<K: StoreObject>(&self, name: &str, namespace: Option<&str>)
    -> Result<Option<K>>;

    async fn list<K: StoreObject>(&self, namespace: Option<&str>) -> Result<Vec<K>>;

    async fn create<K: StoreObject>(&self, object: &K) -> Result<K>;

    /// Replaces the object, failing if its `resourceVersion` is stale.
    async fn replace<K: StoreObject>(&self, object: &K) -> Result<K>;
}

/// What [`create_or_update`] did.
#[derive(Clone, Copy, Debug, Eq, PartialEq, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum OperationResult {
    Unchanged,
    Created,
    Updated,
}

/// Creates `desired` if no object with its name exists, otherwise runs `mutate` on the existing
/// object and replaces it if `mutate` returns `true`.
///
/// `mutate` is also applied to `desired` before it is created.
pub async fn create_or_update<S, K, F>(
    store: &S,
    mut desired: K,
    mutate: F,
) -> Result<(K, OperationResult)>
where
    S: ObjectStore,
    K: StoreObject,
    F: FnOnce(&mut K) -> bool + Send,
{
    let name = desired
        .meta()
        .name
        .clone()
        .with_context(|| MissingNameSnafu { kind: kind_of::<K>() })?;
    let namespace = desired.namespace();

    match store.get_opt::<K>(&name, namespace.as_deref()).await? {
        Some(existing) => update_if_changed(store, existing, mutate).await,
        None => {
            mutate(&mut desired);
            let created = store.create(&desired).await?;
            Ok((created, OperationResult::Created))
        }
    }
}

/// Runs `mutate` on an object fetched from the store and replaces it if `mutate` returns `true`.
pub async fn update_if_changed<S, K, F>(
    store: &S,
    mut existing: K,
    mutate: F,
) -> Result<(K, OperationResult)>
where
    S: ObjectStore,
    K: StoreObject,
    F: FnOnce(&mut K) -> bool + Send,
{
    if !mutate(&mut existing) {
        return Ok((existing, OperationResult::Unchanged));
    }

    let updated = store.replace(&existing).await?;
    Ok((updated, OperationResult::Updated))
}
