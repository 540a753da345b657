use async_trait::async_trait;
use kube::{
    Api, ResourceExt,
    api::{ListParams, PostParams},
};
use snafu::{OptionExt, ResultExt};

use crate::store::{
    ApiScope, CreateObjectSnafu, GetObjectSnafu, ListObjectsSnafu, MissingNameSnafu, ObjectStore,
    ReplaceObjectSnafu, Result, StoreObject, kind_of,
};

/// [`ObjectStore`] backed by the API server.
///
/// Every write carries the configured field manager.
#[derive(Clone)]
pub struct Client {
    client: kube::Client,
    post_params: PostParams,
}

impl Client {
    pub fn new(client: kube::Client, field_manager: Option<String>) -> Self {
        Self {
            client,
            post_params: PostParams {
                field_manager,
                ..PostParams::default()
            },
        }
    }

    /// The wrapped client, for watches and anything else outside of [`ObjectStore`].
    pub fn as_kube_client(&self) -> kube::Client {
        self.client.clone()
    }

    /// Returns an [`Api`] object which is either namespaced or not depending on the scope of `K`.
    pub fn get_api<K: StoreObject>(&self, namespace: Option<&str>) -> Api<K> {
        <K::Scope as ApiScope>::api(self.client.clone(), namespace)
    }
}

fn name_of<K: StoreObject>(object: &K) -> Result<String> {
    object
        .meta()
        .name
        .clone()
        .with_context(|| MissingNameSnafu { kind: kind_of::<K>() })
}

#[async_trait]
impl ObjectStore for Client {
    async fn get_opt<K: StoreObject>(
        &self,
        name: &str,
        namespace: Option<&str>,
    ) -> Result<Option<K>> {
        self.get_api::<K>(namespace)
            .get_opt(name)
            .await
            .with_context(|_| GetObjectSnafu {
                kind: kind_of::<K>(),
                name,
            })
    }

    async fn list<K: StoreObject>(&self, namespace: Option<&str>) -> Result<Vec<K>> {
        Ok(self
            .get_api::<K>(namespace)
            .list(&ListParams::default())
            .await
            .with_context(|_| ListObjectsSnafu {
                kind: kind_of::<K>(),
            })?
            .items)
    }

    async fn create<K: StoreObject>(&self, object: &K) -> Result<K> {
        let name = name_of(object)?;
        self.get_api::<K>(object.namespace().as_deref())
            .create(&self.post_params, object)
            .await
            .with_context(|_| CreateObjectSnafu {
                kind: kind_of::<K>(),
                name,
            })
    }

    async fn replace<K: StoreObject>(&self, object: &K) -> Result<K> {
        let name = name_of(object)?;
        self.get_api::<K>(object.namespace().as_deref())
            .replace(&name, &self.post_params, object)
            .await
            .with_context(|_| ReplaceObjectSnafu {
                kind: kind_of::<K>(),
                name: name.clone(),
            })
    }
}
