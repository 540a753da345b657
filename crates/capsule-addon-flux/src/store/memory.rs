//! An in-process [`ObjectStore`].
//!
//! Objects are kept as JSON, keyed by kind, namespace and name. The store assigns `uid` and
//! `resourceVersion` the way the API server does and rejects replaces carrying a stale
//! `resourceVersion`, which is enough to exercise the reconciliation logic without a cluster.
use std::collections::BTreeMap;

use async_trait::async_trait;
use kube::ResourceExt;
use parking_lot::Mutex;
use serde_json::Value;
use snafu::{OptionExt, ResultExt};

use crate::store::{
    AlreadyExistsSnafu, ApiScope, ConflictSnafu, ConvertObjectSnafu, MissingNameSnafu,
    ObjectNotFoundSnafu, ObjectStore, Result, StoreObject, kind_of,
};

#[derive(Clone, Debug, Eq, Ord, PartialEq, PartialOrd)]
struct ObjectKey {
    api_version: String,
    kind: String,
    namespace: Option<String>,
    name: String,
}

impl ObjectKey {
    fn new<K: StoreObject>(name: &str, namespace: Option<&str>) -> Self {
        Self {
            api_version: K::api_version(&()).into_owned(),
            kind: kind_of::<K>(),
            namespace: namespace
                .filter(|_| <K::Scope as ApiScope>::NAMESPACED)
                .map(ToOwned::to_owned),
            name: name.to_owned(),
        }
    }

    fn of<K: StoreObject>(object: &K) -> Result<Self> {
        let name = object
            .meta()
            .name
            .as_deref()
            .with_context(|| MissingNameSnafu { kind: kind_of::<K>() })?;
        Ok(Self::new::<K>(name, object.namespace().as_deref()))
    }
}

#[derive(Debug, Default)]
struct State {
    objects: BTreeMap<ObjectKey, Value>,
    last_resource_version: u64,
    last_uid: u64,
    writes: usize,
}

impl State {
    fn stamp<K: StoreObject>(&mut self, object: &mut K, keep_uid: Option<String>) {
        self.last_resource_version += 1;
        let meta = object.meta_mut();
        meta.resource_version = Some(self.last_resource_version.to_string());
        meta.uid = keep_uid.or_else(|| {
            self.last_uid += 1;
            Some(format!("00000000-0000-0000-0000-{:012}", self.last_uid))
        });
    }

    fn store<K: StoreObject>(&mut self, key: ObjectKey, object: &K) -> Result<()> {
        let value = serde_json::to_value(object).with_context(|_| ConvertObjectSnafu {
            kind: kind_of::<K>(),
            name: key.name.clone(),
        })?;
        self.objects.insert(key, value);
        Ok(())
    }

    fn load<K: StoreObject>(key: &ObjectKey, value: &Value) -> Result<K> {
        serde_json::from_value(value.clone()).with_context(|_| ConvertObjectSnafu {
            kind: kind_of::<K>(),
            name: key.name.clone(),
        })
    }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds an object, overwriting any previous one with the same name.
    ///
    /// Unlike [`ObjectStore::create`] this is not counted as a write.
    pub fn insert<K: StoreObject>(&self, mut object: K) -> Result<K> {
        let key = ObjectKey::of(&object)?;
        let mut state = self.state.lock();
        let uid = object.meta().uid.clone();
        state.stamp(&mut object, uid);
        state.store(key, &object)?;
        Ok(object)
    }

    /// Removes an object, returning whether it existed.
    pub fn remove<K: StoreObject>(&self, name: &str, namespace: Option<&str>) -> bool {
        self.state
            .lock()
            .objects
            .remove(&ObjectKey::new::<K>(name, namespace))
            .is_some()
    }

    /// Reads an object without going through the async [`ObjectStore`] interface.
    pub fn get<K: StoreObject>(&self, name: &str, namespace: Option<&str>) -> Option<K> {
        let key = ObjectKey::new::<K>(name, namespace);
        let state = self.state.lock();
        state
            .objects
            .get(&key)
            .and_then(|value| State::load(&key, value).ok())
    }

    /// Number of successful creates and replaces.
    pub fn writes(&self) -> usize {
        self.state.lock().writes
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn get_opt<K: StoreObject>(
        &self,
        name: &str,
        namespace: Option<&str>,
    ) -> Result<Option<K>> {
        let key = ObjectKey::new::<K>(name, namespace);
        let state = self.state.lock();
        state
            .objects
            .get(&key)
            .map(|value| State::load(&key, value))
            .transpose()
    }

    async fn list<K: StoreObject>(&self, namespace: Option<&str>) -> Result<Vec<K>> {
        let api_version = K::api_version(&());
        let kind = kind_of::<K>();
        let namespace = namespace.filter(|_| <K::Scope as ApiScope>::NAMESPACED);

        let state = self.state.lock();
        state
            .objects
            .iter()
            .filter(|(key, _)| key.api_version == api_version && key.kind == kind)
            .filter(|(key, _)| namespace.is_none() || key.namespace.as_deref() == namespace)
            .map(|(key, value)| State::load(key, value))
            .collect()
    }

    async fn create<K: StoreObject>(&self, object: &K) -> Result<K> {
        let key = ObjectKey::of(object)?;
        let mut state = self.state.lock();
        if state.objects.contains_key(&key) {
            return AlreadyExistsSnafu {
                kind: key.kind,
                name: key.name,
            }
            .fail();
        }

        let mut created = object.clone();
        state.stamp(&mut created, None);
        state.store(key, &created)?;
        state.writes += 1;
        Ok(created)
    }

    async fn replace<K: StoreObject>(&self, object: &K) -> Result<K> {
        let key = ObjectKey::of(object)?;
        let mut state = self.state.lock();
        let current: K = match state.objects.get(&key) {
            Some(value) => State::load(&key, value)?,
            None => {
                return ObjectNotFoundSnafu {
                    kind: key.kind,
                    name: key.name,
                }
                .fail();
            }
        };

        let expected = object.resource_version();
        if expected.is_some() && expected != current.resource_version() {
            return ConflictSnafu {
                kind: key.kind,
                name: key.name,
                expected,
            }
            .fail();
        }

        let mut replaced = object.clone();
        state.stamp(&mut replaced, current.uid());
        state.store(key, &replaced)?;
        state.writes += 1;
        Ok(replaced)
    }
}
