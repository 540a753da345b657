//! Makes a Tenant the controlling owner of a ServiceAccount's namespace.
use k8s_openapi::{
    api::core::v1::Namespace, apimachinery::pkg::apis::meta::v1::OwnerReference,
};
use kube::{Resource, ResourceExt};
use snafu::{OptionExt, ResultExt, Snafu};

use crate::{
    crd::Tenant,
    store::{self, ObjectStore, OperationResult, update_if_changed},
};

type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to get Namespace {namespace:?}"))]
    GetNamespace {
        source: store::Error,
        namespace: String,
    },

    #[snafu(display("failed to update owner of Namespace {namespace:?}"))]
    UpdateNamespace {
        source: store::Error,
        namespace: String,
    },

    #[snafu(display("Tenant {tenant:?} has no UID and can't own anything yet"))]
    TenantMissingUid { tenant: String },

    #[snafu(display(
        "Namespace {namespace:?} is already controlled by {kind} {owner:?}, refusing to hand it to Tenant {tenant:?}"
    ))]
    AlreadyControlled {
        namespace: String,
        kind: String,
        owner: String,
        tenant: String,
    },
}

/// Outcome of [`bind_namespace`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum NamespaceBinding {
    Bound(OperationResult),

    /// The Namespace does not exist (yet).
    NamespaceMissing,
}

fn same_owner(a: &OwnerReference, b: &OwnerReference) -> bool {
    let group = |api_version: &str| {
        api_version
            .split_once('/')
            .map_or("", |(group, _)| group)
            .to_owned()
    };
    group(&a.api_version) == group(&b.api_version) && a.kind == b.kind && a.name == b.name
}

/// Sets `owner` as the controller reference of `namespace`.
///
/// An existing reference to the same owner is refreshed in place. A controller reference to any
/// other owner is an error, as Kubernetes allows only one controller per object. Non-controller
/// references are left alone.
pub fn set_controller_reference(
    namespace: &mut Namespace,
    owner: OwnerReference,
) -> Result<bool> {
    let namespace_name = namespace.name_any();
    let references = namespace.metadata.owner_references.get_or_insert_with(Vec::new);

    if let Some(controller) = references
        .iter()
        .find(|reference| reference.controller == Some(true) && !same_owner(reference, &owner))
    {
        return AlreadyControlledSnafu {
            namespace: namespace_name,
            kind: controller.kind.clone(),
            owner: controller.name.clone(),
            tenant: owner.name,
        }
        .fail();
    }

    match references
        .iter_mut()
        .find(|reference| same_owner(reference, &owner))
    {
        Some(existing) if *existing == owner => Ok(false),
        Some(existing) => {
            *existing = owner;
            Ok(true)
        }
        None => {
            references.push(owner);
            Ok(true)
        }
    }
}

/// Makes `tenant` the controller of the Namespace called `namespace`.
pub async fn bind_namespace<S: ObjectStore>(
    store: &S,
    namespace: &str,
    tenant: &Tenant,
) -> Result<NamespaceBinding> {
    let owner = tenant
        .controller_owner_ref(&())
        .with_context(|| TenantMissingUidSnafu {
            tenant: tenant.name_any(),
        })?;

    let Some(existing) = store
        .get_opt::<Namespace>(namespace, None)
        .await
        .context(GetNamespaceSnafu { namespace })?
    else {
        return Ok(NamespaceBinding::NamespaceMissing);
    };

    // Validated up front, the mutation closure can't carry an error out.
    let mut candidate = existing.clone();
    set_controller_reference(&mut candidate, owner.clone())?;

    let (_, result) = update_if_changed(store, existing, move |namespace: &mut Namespace| {
        set_controller_reference(namespace, owner).unwrap_or(false)
    })
    .await
    .context(UpdateNamespaceSnafu { namespace })?;

    tracing::debug!(namespace, tenant = %tenant.name_any(), %result, "bound Namespace to Tenant");
    Ok(NamespaceBinding::Bound(result))
}
