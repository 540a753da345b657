//! Decides which ServiceAccounts are reconciled at all.
//!
//! Both checks are pure apart from the index read, so they can run on every watch event before any
//! work is scheduled.
use k8s_openapi::api::core::v1::ServiceAccount;
use kube::ResourceExt;

use crate::{
    constants::{
        ADDON_ENABLED_ANNOTATION, ADDON_ENABLED_VALUE, KUBECONFIG_GLOBAL_ANNOTATION,
        KUBECONFIG_GLOBAL_VALUE,
    },
    ownership::{TenantLookup, owned_tenants},
};

fn has_annotation(service_account: &ServiceAccount, key: &str, value: &str) -> bool {
    service_account
        .annotations()
        .get(key)
        .is_some_and(|actual| actual == value)
}

/// Whether the ServiceAccount opted in to the addon.
pub fn is_addon_enabled(service_account: &ServiceAccount) -> bool {
    has_annotation(service_account, ADDON_ENABLED_ANNOTATION, ADDON_ENABLED_VALUE)
}

/// Whether the ServiceAccount's kubeconfig should be distributed to all of its Tenants'
/// namespaces.
pub fn wants_global_kubeconfig(service_account: &ServiceAccount) -> bool {
    has_annotation(
        service_account,
        KUBECONFIG_GLOBAL_ANNOTATION,
        KUBECONFIG_GLOBAL_VALUE,
    )
}

/// A ServiceAccount is reconciled if it opted in and owns at least one Tenant.
pub fn should_reconcile<L>(service_account: &ServiceAccount, tenants: &L) -> bool
where
    L: TenantLookup + ?Sized,
{
    if !is_addon_enabled(service_account) {
        return false;
    }

    let Some(namespace) = service_account.namespace() else {
        return false;
    };

    !owned_tenants(tenants, &namespace, &service_account.name_any()).is_empty()
}
