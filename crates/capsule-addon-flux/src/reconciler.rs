//! One reconciliation pass for one ServiceAccount.
//!
//! A pass runs every step from the top, in order:
//!
//! 1. RBAC granting impersonation through the proxy ([`rbac`]),
//! 2. the token Secret ([`token`]),
//! 3. the kubeconfig Secret ([`kubeconfig`]),
//! 4. the owned Tenants ([`ownership`]),
//! 5. the Namespace owner reference ([`namespace_owner`]),
//! 6. the GlobalTenantResources, if requested ([`distribution`]).
//!
//! Every step is idempotent and derives its object names from the ServiceAccount alone, so a pass
//! can be retried at any point.
use std::{fmt, sync::Arc, time::Duration};

use k8s_openapi::api::core::v1::ServiceAccount;
use kube::ResourceExt;
use snafu::{ResultExt, Snafu};
use strum::{EnumDiscriminants, IntoStaticStr};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::{
    admission::{is_addon_enabled, wants_global_kubeconfig},
    config::ProxyConfig,
    distribution::{self, ensure_global_resource, global_resource_name},
    kubeconfig::{self, ensure_kubeconfig_secret},
    namespace_owner::{self, NamespaceBinding, bind_namespace},
    ownership::{TenantLookup, owned_tenants},
    rbac::{self, ensure_access},
    store::{self, ObjectStore},
    token::{self, ensure_token_secret, get_token_secret, token_from_secret},
};

/// How long to wait before retrying when something the pass depends on isn't there yet.
pub const REQUEUE_DELAY: Duration = Duration::from_secs(5);

type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, EnumDiscriminants, Snafu)]
#[strum_discriminants(derive(IntoStaticStr))]
pub enum Error {
    #[snafu(display("failed to get ServiceAccount"))]
    GetServiceAccount { source: store::Error },

    #[snafu(display("failed to ensure RBAC"))]
    EnsureAccess { source: rbac::Error },

    #[snafu(display("failed to ensure token Secret"))]
    EnsureToken { source: token::Error },

    #[snafu(display("failed to get token Secret"))]
    GetToken { source: token::Error },

    #[snafu(display("failed to ensure kubeconfig Secret"))]
    EnsureKubeconfig { source: kubeconfig::Error },

    #[snafu(display("failed to bind Namespace to Tenant {tenant:?}"))]
    BindNamespace {
        source: namespace_owner::Error,
        tenant: String,
    },

    #[snafu(display("failed to distribute kubeconfig to Tenant {tenant:?}"))]
    Distribute {
        source: distribution::Error,
        tenant: String,
    },

    #[snafu(display("reconciliation was cancelled"))]
    Cancelled,
}

impl Error {
    /// `PascalCase`d name of the error variant, for logs.
    pub fn category(&self) -> &'static str {
        ErrorDiscriminants::from(self).into()
    }
}

/// What the caller should do after a successful pass.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ReconcileOutcome {
    /// Nothing to do until something changes.
    Done,

    /// Run again after the given delay, something wasn't ready yet.
    RequeueAfter(Duration),
}

/// Identifies the ServiceAccount a pass is for.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct IdentityKey {
    pub namespace: String,
    pub name: String,
}

impl IdentityKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Runs reconciliation passes against a store, using `L` to find owned Tenants.
pub struct Reconciler<S, L> {
    store: Arc<S>,
    tenants: L,
    proxy: Arc<ProxyConfig>,
}

impl<S, L> Reconciler<S, L>
where
    S: ObjectStore,
    L: TenantLookup,
{
    pub fn new(store: Arc<S>, tenants: L, proxy: Arc<ProxyConfig>) -> Self {
        Self {
            store,
            tenants,
            proxy,
        }
    }

    /// Runs one pass for `key`, giving up with [`Error::Cancelled`] as soon as `cancel` fires.
    pub async fn reconcile(
        &self,
        key: &IdentityKey,
        cancel: &CancellationToken,
    ) -> Result<ReconcileOutcome> {
        let span = tracing::info_span!(
            "reconcile",
            service_account.namespace = %key.namespace,
            service_account.name = %key.name,
        );

        async {
            tokio::select! {
                biased;
                () = cancel.cancelled() => CancelledSnafu.fail(),
                outcome = self.run_pass(key) => outcome,
            }
        }
        .instrument(span)
        .await
    }

    async fn run_pass(&self, key: &IdentityKey) -> Result<ReconcileOutcome> {
        let store = &*self.store;
        let IdentityKey { namespace, name } = key;

        let Some(service_account) = store
            .get_opt::<ServiceAccount>(name, Some(namespace.as_str()))
            .await
            .context(GetServiceAccountSnafu)?
        else {
            tracing::debug!("ServiceAccount is gone, nothing to do");
            return Ok(ReconcileOutcome::Done);
        };
        if !is_addon_enabled(&service_account) {
            tracing::debug!("addon is not enabled for ServiceAccount, nothing to do");
            return Ok(ReconcileOutcome::Done);
        }
        // A Tenant listing this ServiceAccount may have gone away since the pass was queued.
        let tenants = owned_tenants(&self.tenants, namespace, name);
        let Some(first) = tenants.first() else {
            tracing::info!("ServiceAccount owns no Tenant, nothing to do");
            return Ok(ReconcileOutcome::Done);
        };

        ensure_access(store, name, namespace)
            .await
            .context(EnsureAccessSnafu)?;

        ensure_token_secret(store, name, namespace)
            .await
            .context(EnsureTokenSnafu)?;
        let token_secret = get_token_secret(store, name, namespace)
            .await
            .context(GetTokenSnafu)?;
        let Some(token) = token_from_secret(&token_secret) else {
            tracing::info!(
                secret = %token_secret.name_any(),
                "token has not been populated yet, requeueing"
            );
            return Ok(ReconcileOutcome::RequeueAfter(REQUEUE_DELAY));
        };

        let (kubeconfig_secret, _) =
            ensure_kubeconfig_secret(store, &self.proxy, name, namespace, &token)
                .await
                .context(EnsureKubeconfigSnafu)?;

        match bind_namespace(store, namespace, first)
            .await
            .with_context(|_| BindNamespaceSnafu {
                tenant: first.name_any(),
            })? {
            NamespaceBinding::Bound(_) => {}
            NamespaceBinding::NamespaceMissing => {
                tracing::info!("Namespace does not exist yet, requeueing");
                return Ok(ReconcileOutcome::RequeueAfter(REQUEUE_DELAY));
            }
        }

        if wants_global_kubeconfig(&service_account) {
            for tenant in &tenants {
                let tenant = tenant.name_any();
                ensure_global_resource(
                    store,
                    &global_resource_name(&tenant, name),
                    &tenant,
                    &kubeconfig_secret,
                )
                .await
                .with_context(|_| DistributeSnafu { tenant })?;
            }
        }

        tracing::info!(tenants = tenants.len(), "reconciled ServiceAccount");
        Ok(ReconcileOutcome::Done)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use k8s_openapi::{
        ByteString,
        api::{
            core::v1::{Namespace, Secret},
            rbac::v1::{ClusterRole, ClusterRoleBinding, RoleBinding},
        },
    };
    use kube::{api::ObjectMeta, runtime::watcher};

    use super::*;
    use crate::{
        constants::{
            ADDON_ENABLED_ANNOTATION, KUBECONFIG_GLOBAL_ANNOTATION,
            SERVICE_ACCOUNT_NAME_ANNOTATION, SERVICE_ACCOUNT_TOKEN_SECRET_TYPE,
        },
        crd::{GlobalTenantResource, OwnerKind, OwnerSpec, Tenant, TenantSpec},
        index::TenantOwnerIndex,
        kubeconfig::Kubeconfig,
        store::MemoryStore,
    };

    const PROXY_URL: &str = "https://capsule-proxy.capsule-system.svc:9001";

    struct Fixture {
        store: Arc<MemoryStore>,
        index: TenantOwnerIndex,
        reconciler: Reconciler<MemoryStore, TenantOwnerIndex>,
        cancel: CancellationToken,
    }

    impl Fixture {
        fn new(global: bool) -> Self {
            let store = Arc::new(MemoryStore::new());
            let mut annotations = BTreeMap::from([(
                ADDON_ENABLED_ANNOTATION.to_owned(),
                "true".to_owned(),
            )]);
            if global {
                annotations.insert(KUBECONFIG_GLOBAL_ANNOTATION.to_owned(), "true".to_owned());
            }
            store
                .insert(ServiceAccount {
                    metadata: ObjectMeta {
                        name: Some("sa1".to_owned()),
                        namespace: Some("ns1".to_owned()),
                        annotations: Some(annotations),
                        ..ObjectMeta::default()
                    },
                    ..ServiceAccount::default()
                })
                .unwrap();
            store
                .insert(Namespace {
                    metadata: ObjectMeta {
                        name: Some("ns1".to_owned()),
                        ..ObjectMeta::default()
                    },
                    ..Namespace::default()
                })
                .unwrap();

            let index = TenantOwnerIndex::new();
            let proxy = ProxyConfig::new(PROXY_URL, b"ca".to_vec()).unwrap();
            let reconciler = Reconciler::new(store.clone(), index.clone(), Arc::new(proxy));

            Self {
                store,
                index,
                reconciler,
                cancel: CancellationToken::new(),
            }
        }

        fn with_tenant(self, name: &str) -> Self {
            let mut tenant = Tenant::new(name, TenantSpec {
                owners: vec![OwnerSpec {
                    kind: OwnerKind::ServiceAccount,
                    name: "system:serviceaccount:ns1:sa1".to_owned(),
                }],
            });
            tenant.metadata.uid = Some(format!("uid-{name}"));
            self.index.apply_event(watcher::Event::Apply(tenant));
            self
        }

        fn with_token(self, secret_name: &str, token: &str) -> Self {
            self.store
                .insert(Secret {
                    metadata: ObjectMeta {
                        name: Some(secret_name.to_owned()),
                        namespace: Some("ns1".to_owned()),
                        annotations: Some(BTreeMap::from([(
                            SERVICE_ACCOUNT_NAME_ANNOTATION.to_owned(),
                            "sa1".to_owned(),
                        )])),
                        ..ObjectMeta::default()
                    },
                    type_: Some(SERVICE_ACCOUNT_TOKEN_SECRET_TYPE.to_owned()),
                    data: Some(BTreeMap::from([(
                        "token".to_owned(),
                        ByteString(token.as_bytes().to_vec()),
                    )])),
                    ..Secret::default()
                })
                .unwrap();
            self
        }

        async fn reconcile(&self) -> Result<ReconcileOutcome> {
            self.reconciler
                .reconcile(&IdentityKey::new("ns1", "sa1"), &self.cancel)
                .await
        }

        fn namespace_owners(&self) -> Vec<String> {
            self.store
                .get::<Namespace>("ns1", None)
                .unwrap()
                .metadata
                .owner_references
                .unwrap_or_default()
                .into_iter()
                .map(|reference| reference.name)
                .collect()
        }
    }

    #[tokio::test]
    async fn full_pass() {
        let fixture = Fixture::new(false).with_tenant("t1");

        // Kubernetes hasn't filled in the token yet.
        assert_eq!(
            fixture.reconcile().await.unwrap(),
            ReconcileOutcome::RequeueAfter(REQUEUE_DELAY)
        );
        let store = &fixture.store;
        assert!(store.get::<Secret>("sa1-kubeconfig", Some("ns1")).is_none());

        let mut token_secret: Secret = store.get("sa1-token", Some("ns1")).unwrap();
        assert_eq!(
            token_secret.type_.as_deref(),
            Some("kubernetes.io/service-account-token")
        );
        token_secret.data = Some(BTreeMap::from([(
            "token".to_owned(),
            ByteString(b"abc".to_vec()),
        )]));
        store.insert(token_secret).unwrap();

        assert_eq!(fixture.reconcile().await.unwrap(), ReconcileOutcome::Done);

        let role_binding: RoleBinding = store.get("sa1", Some("ns1")).unwrap();
        assert_eq!(role_binding.role_ref.name, "cluster-admin");
        let role: ClusterRole = store.get("ns1-sa1-impersonator", None).unwrap();
        let rules = role.rules.unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(
            rules[0].resource_names,
            Some(vec!["system:serviceaccount:ns1:sa1".to_owned()])
        );
        assert!(
            store
                .get::<ClusterRoleBinding>("ns1-sa1-impersonator", None)
                .is_some()
        );

        let kubeconfig_secret: Secret = store.get("sa1-kubeconfig", Some("ns1")).unwrap();
        let kubeconfig = Kubeconfig::from_yaml(
            std::str::from_utf8(&kubeconfig_secret.data.unwrap()["kubeconfig"].0).unwrap(),
        )
        .unwrap();
        assert_eq!(kubeconfig.clusters[0].cluster.server, PROXY_URL);
        assert_eq!(kubeconfig.clusters[0].cluster.certificate_authority_data, b"ca");
        assert_eq!(kubeconfig.users[0].user.token, "abc");

        assert_eq!(fixture.namespace_owners(), vec!["t1"]);
        assert!(store.get::<GlobalTenantResource>("t1-sa1-kubeconfig", None).is_none());
    }

    #[tokio::test]
    async fn second_pass_writes_nothing() {
        let fixture = Fixture::new(true)
            .with_tenant("t1")
            .with_token("sa1-token", "abc");
        assert_eq!(fixture.reconcile().await.unwrap(), ReconcileOutcome::Done);
        let writes = fixture.store.writes();

        assert_eq!(fixture.reconcile().await.unwrap(), ReconcileOutcome::Done);

        assert_eq!(fixture.store.writes(), writes);
    }

    #[tokio::test]
    async fn global_kubeconfig_is_distributed_to_every_tenant() {
        let fixture = Fixture::new(true)
            .with_tenant("t2")
            .with_tenant("t1")
            .with_token("sa1-token", "abc");

        assert_eq!(fixture.reconcile().await.unwrap(), ReconcileOutcome::Done);

        // The Namespace goes to the first Tenant by name.
        assert_eq!(fixture.namespace_owners(), vec!["t1"]);
        for tenant in ["t1", "t2"] {
            let resource: GlobalTenantResource = fixture
                .store
                .get(&format!("{tenant}-sa1-kubeconfig"), None)
                .unwrap();
            assert_eq!(
                resource.spec.tenant_selector.match_labels.unwrap()["kubernetes.io/metadata.name"],
                tenant
            );
            assert_eq!(
                resource.spec.resources[0].raw_items[0].0["metadata"]["name"],
                "sa1-kubeconfig"
            );
        }
    }

    #[tokio::test]
    async fn token_change_is_propagated() {
        let fixture = Fixture::new(true)
            .with_tenant("t1")
            .with_token("sa1-token", "abc");
        fixture.reconcile().await.unwrap();

        let fixture = fixture.with_token("sa1-token", "rotated");
        assert_eq!(fixture.reconcile().await.unwrap(), ReconcileOutcome::Done);

        let secret: Secret = fixture.store.get("sa1-kubeconfig", Some("ns1")).unwrap();
        let kubeconfig = Kubeconfig::from_yaml(
            std::str::from_utf8(&secret.data.unwrap()["kubeconfig"].0).unwrap(),
        )
        .unwrap();
        assert_eq!(kubeconfig.users[0].user.token, "rotated");
        let resource: GlobalTenantResource =
            fixture.store.get("t1-sa1-kubeconfig", None).unwrap();
        let embedded: Secret =
            serde_json::from_value(resource.spec.resources[0].raw_items[0].0.clone()).unwrap();
        assert_eq!(embedded.data, secret_data(&fixture.store));
    }

    fn secret_data(store: &MemoryStore) -> Option<BTreeMap<String, ByteString>> {
        store
            .get::<Secret>("sa1-kubeconfig", Some("ns1"))
            .and_then(|secret| secret.data)
    }

    #[tokio::test]
    async fn existing_token_secret_is_reused() {
        let fixture = Fixture::new(false)
            .with_tenant("t1")
            .with_token("sa1-token-x7k2p", "abc");

        assert_eq!(fixture.reconcile().await.unwrap(), ReconcileOutcome::Done);

        assert!(fixture.store.get::<Secret>("sa1-token", Some("ns1")).is_none());
    }

    #[tokio::test]
    async fn deleted_service_account_is_a_no_op() {
        let fixture = Fixture::new(false).with_tenant("t1");
        fixture.store.remove::<ServiceAccount>("sa1", Some("ns1"));

        assert_eq!(fixture.reconcile().await.unwrap(), ReconcileOutcome::Done);

        assert_eq!(fixture.store.writes(), 0);
    }

    #[tokio::test]
    async fn owning_no_tenant_writes_nothing() {
        let fixture = Fixture::new(true).with_token("sa1-token", "abc");

        assert_eq!(fixture.reconcile().await.unwrap(), ReconcileOutcome::Done);

        assert_eq!(fixture.store.writes(), 0);
        assert!(fixture.store.get::<RoleBinding>("sa1", Some("ns1")).is_none());
        assert!(
            fixture
                .store
                .get::<ClusterRole>("ns1-sa1-impersonator", None)
                .is_none()
        );
        assert!(fixture.store.get::<Secret>("sa1-kubeconfig", Some("ns1")).is_none());
    }

    #[tokio::test]
    async fn deleted_tenant_stops_reconciliation() {
        let fixture = Fixture::new(false).with_tenant("t1");
        let mut tenant = Tenant::new("t1", TenantSpec { owners: Vec::new() });
        tenant.metadata.uid = Some("uid-t1".to_owned());
        fixture.index.apply_event(watcher::Event::Delete(tenant));

        assert_eq!(fixture.reconcile().await.unwrap(), ReconcileOutcome::Done);

        assert_eq!(fixture.store.writes(), 0);
    }

    #[tokio::test]
    async fn missing_namespace_is_requeued() {
        let fixture = Fixture::new(false)
            .with_tenant("t1")
            .with_token("sa1-token", "abc");
        fixture.store.remove::<Namespace>("ns1", None);

        assert_eq!(
            fixture.reconcile().await.unwrap(),
            ReconcileOutcome::RequeueAfter(REQUEUE_DELAY)
        );
    }

    #[tokio::test]
    async fn cancelled_pass_does_nothing() {
        let fixture = Fixture::new(false)
            .with_tenant("t1")
            .with_token("sa1-token", "abc");
        fixture.cancel.cancel();

        let error = fixture.reconcile().await.unwrap_err();

        assert!(matches!(error, Error::Cancelled));
        assert_eq!(fixture.store.writes(), 0);
    }
}
