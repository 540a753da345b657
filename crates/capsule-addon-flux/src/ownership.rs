//! Resolves the Tenants a ServiceAccount is declared owner of.
use std::sync::Arc;

use crate::crd::{OwnerKind, Tenant};

const SERVICE_ACCOUNT_SUBJECT_PREFIX: &str = "system:serviceaccount:";

/// Lookup of Tenants by declared owner.
///
/// Implementations return Tenants ordered by name, so callers picking the first element get the
/// same Tenant on every pass.
pub trait TenantLookup: Send + Sync {
    fn list_owned(&self, owner_kind: OwnerKind, owner_name: &str) -> Vec<Arc<Tenant>>;
}

impl<T: TenantLookup + ?Sized> TenantLookup for Arc<T> {
    fn list_owned(&self, owner_kind: OwnerKind, owner_name: &str) -> Vec<Arc<Tenant>> {
        (**self).list_owned(owner_kind, owner_name)
    }
}

/// The username Kubernetes authenticates a ServiceAccount as.
pub fn service_account_subject(namespace: &str, name: &str) -> String {
    format!("{SERVICE_ACCOUNT_SUBJECT_PREFIX}{namespace}:{name}")
}

/// Inverse of [`service_account_subject`].
pub fn parse_service_account_subject(subject: &str) -> Option<(&str, &str)> {
    let (namespace, name) = subject
        .strip_prefix(SERVICE_ACCOUNT_SUBJECT_PREFIX)?
        .split_once(':')?;
    (!namespace.is_empty() && !name.is_empty() && !name.contains(':')).then_some((namespace, name))
}

/// Tenants owned by the given ServiceAccount, ordered by Tenant name.
pub fn owned_tenants<L>(lookup: &L, namespace: &str, name: &str) -> Vec<Arc<Tenant>>
where
    L: TenantLookup + ?Sized,
{
    lookup.list_owned(
        OwnerKind::ServiceAccount,
        &service_account_subject(namespace, name),
    )
}
