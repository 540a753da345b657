//! Distributes a kubeconfig Secret to every namespace of a Tenant through a Capsule
//! `GlobalTenantResource`.
use std::collections::BTreeMap;

use k8s_openapi::{
    api::core::v1::Secret,
    apimachinery::pkg::{apis::meta::v1::LabelSelector, runtime::RawExtension},
};
use kube::api::ObjectMeta;
use snafu::{ResultExt, Snafu};

use crate::{
    constants::{
        GLOBAL_TENANT_RESOURCE_SUFFIX, MANAGED_BY_LABEL, MANAGER_NAME, TENANT_NAME_LABEL,
    },
    crd::{GlobalTenantResource, GlobalTenantResourceSpec, ResourceSpec},
    store::{self, ObjectStore, OperationResult, create_or_update},
};

type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to embed Secret {secret:?} into GlobalTenantResource"))]
    EmbedSecret {
        source: serde_json::Error,
        secret: String,
    },

    #[snafu(display("failed to ensure GlobalTenantResource {name:?} for Tenant {tenant:?}"))]
    EnsureGlobalTenantResource {
        source: store::Error,
        name: String,
        tenant: String,
    },
}

/// Generate the GlobalTenantResource name for a Tenant and ServiceAccount.
pub fn global_resource_name(tenant: &str, service_account: &str) -> String {
    format!("{tenant}-{service_account}{GLOBAL_TENANT_RESOURCE_SUFFIX}")
}

/// Copy of `secret` suitable for embedding, without anything the API server sets or that ties
/// it to its original namespace.
pub fn embeddable_secret(secret: &Secret) -> Secret {
    let metadata = &secret.metadata;
    Secret {
        metadata: ObjectMeta {
            name: metadata.name.clone(),
            labels: metadata.labels.clone(),
            annotations: metadata.annotations.clone(),
            ..ObjectMeta::default()
        },
        ..secret.clone()
    }
}

fn tenant_selector(tenant: &str) -> LabelSelector {
    LabelSelector {
        match_labels: Some(BTreeMap::from([(
            TENANT_NAME_LABEL.to_owned(),
            tenant.to_owned(),
        )])),
        ..LabelSelector::default()
    }
}

/// Creates or refreshes the GlobalTenantResource `name`, replicating `secret` into all namespaces
/// of `tenant`.
pub async fn ensure_global_resource<S: ObjectStore>(
    store: &S,
    name: &str,
    tenant: &str,
    secret: &Secret,
) -> Result<OperationResult> {
    let secret_name = secret.metadata.name.clone().unwrap_or_default();
    let embedded =
        serde_json::to_value(embeddable_secret(secret)).with_context(|_| EmbedSecretSnafu {
            secret: secret_name.clone(),
        })?;

    let desired = GlobalTenantResource::new(name, GlobalTenantResourceSpec::default());
    let selector = tenant_selector(tenant);
    let resources = vec![ResourceSpec {
        raw_items: vec![RawExtension(embedded)],
        ..ResourceSpec::default()
    }];

    let (_, result) = create_or_update(store, desired, move |resource: &mut GlobalTenantResource| {
        let mut changed = false;
        let labels = resource.metadata.labels.get_or_insert_with(BTreeMap::new);
        if labels.get(MANAGED_BY_LABEL).map(String::as_str) != Some(MANAGER_NAME) {
            labels.insert(MANAGED_BY_LABEL.to_owned(), MANAGER_NAME.to_owned());
            changed = true;
        }
        if resource.spec.tenant_selector != selector {
            resource.spec.tenant_selector = selector;
            changed = true;
        }
        if resource.spec.resources != resources {
            resource.spec.resources = resources;
            changed = true;
        }
        changed
    })
    .await
    .with_context(|_| EnsureGlobalTenantResourceSnafu { name, tenant })?;

    tracing::debug!(
        global_tenant_resource = name,
        tenant,
        secret = %secret_name,
        %result,
        "ensured GlobalTenantResource"
    );
    Ok(result)
}

#[cfg(test)]
mod tests {
    use k8s_openapi::ByteString;

    use super::*;
    use crate::store::MemoryStore;

    fn kubeconfig_secret(content: &str) -> Secret {
        Secret {
            metadata: ObjectMeta {
                name: Some("sa1-kubeconfig".to_owned()),
                namespace: Some("ns1".to_owned()),
                uid: Some("uid-secret".to_owned()),
                resource_version: Some("42".to_owned()),
                ..ObjectMeta::default()
            },
            type_: Some("Opaque".to_owned()),
            data: Some(BTreeMap::from([(
                "kubeconfig".to_owned(),
                ByteString(content.as_bytes().to_vec()),
            )])),
            ..Secret::default()
        }
    }

    #[test]
    fn names() {
        assert_eq!(global_resource_name("t1", "sa1"), "t1-sa1-kubeconfig");
    }

    #[test]
    fn embedded_copy_drops_server_fields() {
        let copy = embeddable_secret(&kubeconfig_secret("a"));

        assert_eq!(copy.metadata.name.as_deref(), Some("sa1-kubeconfig"));
        assert_eq!(copy.metadata.namespace, None);
        assert_eq!(copy.metadata.uid, None);
        assert_eq!(copy.metadata.resource_version, None);
        assert_eq!(copy.data, kubeconfig_secret("a").data);
    }

    async fn ensure(store: &MemoryStore, content: &str) -> OperationResult {
        ensure_global_resource(store, "t1-sa1-kubeconfig", "t1", &kubeconfig_secret(content))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn creates_and_tracks_secret() {
        let store = MemoryStore::new();

        assert_eq!(ensure(&store, "a").await, OperationResult::Created);
        assert_eq!(ensure(&store, "a").await, OperationResult::Unchanged);
        assert_eq!(ensure(&store, "b").await, OperationResult::Updated);

        let resource: GlobalTenantResource = store.get("t1-sa1-kubeconfig", None).unwrap();
        assert_eq!(
            resource.metadata.labels.unwrap()["app.kubernetes.io/managed-by"],
            "capsule-addon-fluxcd"
        );
        assert_eq!(
            resource.spec.tenant_selector.match_labels.unwrap()["kubernetes.io/metadata.name"],
            "t1"
        );
        let item = &resource.spec.resources[0].raw_items[0].0;
        assert_eq!(item["apiVersion"], "v1");
        assert_eq!(item["kind"], "Secret");
        assert_eq!(item["metadata"]["name"], "sa1-kubeconfig");
        assert!(item["metadata"].get("namespace").is_none());
        assert!(item["metadata"].get("uid").is_none());
        // "b", base64 encoded
        assert_eq!(item["data"]["kubeconfig"], "Yg==");
    }

    #[tokio::test]
    async fn repairs_managed_by_label() {
        let store = MemoryStore::new();
        ensure(&store, "a").await;
        let mut resource: GlobalTenantResource = store.get("t1-sa1-kubeconfig", None).unwrap();
        resource.metadata.labels = None;
        store.replace(&resource).await.unwrap();

        assert_eq!(ensure(&store, "a").await, OperationResult::Updated);
    }
}
