//! RBAC letting a ServiceAccount act through the Capsule Proxy.
//!
//! Three objects are kept in shape on every pass:
//!
//! * a RoleBinding in the ServiceAccount's namespace granting `cluster-admin`,
//! * a ClusterRole allowing impersonation of exactly the ServiceAccount's own username,
//! * a ClusterRoleBinding of that ClusterRole to the ServiceAccount.
use k8s_openapi::api::rbac::v1::{
    ClusterRole, ClusterRoleBinding, PolicyRule, RoleBinding, RoleRef, Subject,
};
use kube::api::ObjectMeta;
use snafu::{ResultExt, Snafu};

use crate::{
    constants::{
        CLUSTER_ADMIN_ROLE, CLUSTER_ROLE_KIND, IMPERSONATOR_SUFFIX, RBAC_API_GROUP,
        SERVICE_ACCOUNT_KIND,
    },
    ownership::service_account_subject,
    store::{self, ObjectStore, OperationResult, create_or_update},
};

type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to ensure RoleBinding {name:?} in namespace {namespace:?}"))]
    EnsureRoleBinding {
        source: store::Error,
        name: String,
        namespace: String,
    },

    #[snafu(display("failed to ensure impersonator ClusterRole {name:?}"))]
    EnsureClusterRole { source: store::Error, name: String },

    #[snafu(display("failed to ensure impersonator ClusterRoleBinding {name:?}"))]
    EnsureClusterRoleBinding { source: store::Error, name: String },
}

/// Generate the RoleBinding name, which is the ServiceAccount name itself.
pub fn role_binding_name(service_account: &str) -> String {
    service_account.to_owned()
}

/// Generate the name shared by the impersonator ClusterRole and ClusterRoleBinding.
pub fn impersonator_name(namespace: &str, service_account: &str) -> String {
    format!("{namespace}-{service_account}{IMPERSONATOR_SUFFIX}")
}

/// What [`ensure_access`] did to each object.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct AccessResult {
    pub role_binding: OperationResult,
    pub cluster_role: OperationResult,
    pub cluster_role_binding: OperationResult,
}

/// Creates or repairs the RoleBinding, impersonator ClusterRole and ClusterRoleBinding for the
/// given ServiceAccount.
pub async fn ensure_access<S: ObjectStore>(
    store: &S,
    name: &str,
    namespace: &str,
) -> Result<AccessResult> {
    let role_binding = ensure_role_binding(store, name, namespace).await?;
    let cluster_role = ensure_impersonator_role(store, name, namespace).await?;
    let cluster_role_binding = ensure_impersonator_binding(store, name, namespace).await?;

    Ok(AccessResult {
        role_binding,
        cluster_role,
        cluster_role_binding,
    })
}

fn service_account_subjects(name: &str, namespace: &str) -> Vec<Subject> {
    vec![Subject {
        kind: SERVICE_ACCOUNT_KIND.to_owned(),
        name: name.to_owned(),
        namespace: Some(namespace.to_owned()),
        ..Subject::default()
    }]
}

fn same_subjects(current: Option<&[Subject]>, desired: &[Subject]) -> bool {
    let Some(current) = current else {
        return desired.is_empty();
    };

    current.len() == desired.len()
        && current.iter().zip(desired).all(|(current, desired)| {
            current.kind == desired.kind
                && current.name == desired.name
                && current.namespace == desired.namespace
        })
}

fn cluster_role_ref(name: &str) -> RoleRef {
    RoleRef {
        api_group: RBAC_API_GROUP.to_owned(),
        kind: CLUSTER_ROLE_KIND.to_owned(),
        name: name.to_owned(),
    }
}

/// The single rule of the impersonator ClusterRole.
pub fn impersonation_rule(name: &str, namespace: &str) -> PolicyRule {
    PolicyRule {
        api_groups: Some(vec![String::new()]),
        resources: Some(vec!["users".to_owned()]),
        verbs: vec!["impersonate".to_owned()],
        resource_names: Some(vec![service_account_subject(namespace, name)]),
        ..PolicyRule::default()
    }
}

async fn ensure_role_binding<S: ObjectStore>(
    store: &S,
    name: &str,
    namespace: &str,
) -> Result<OperationResult> {
    let binding_name = role_binding_name(name);
    let desired = RoleBinding {
        metadata: ObjectMeta {
            name: Some(binding_name.clone()),
            namespace: Some(namespace.to_owned()),
            ..ObjectMeta::default()
        },
        ..RoleBinding::default()
    };
    let subjects = service_account_subjects(name, namespace);
    let role_ref = cluster_role_ref(CLUSTER_ADMIN_ROLE);

    let (_, result) = create_or_update(store, desired, move |binding: &mut RoleBinding| {
        let mut changed = false;
        if binding.role_ref != role_ref {
            binding.role_ref = role_ref;
            changed = true;
        }
        if !same_subjects(binding.subjects.as_deref(), &subjects) {
            binding.subjects = Some(subjects);
            changed = true;
        }
        changed
    })
    .await
    .with_context(|_| EnsureRoleBindingSnafu {
        name: binding_name.clone(),
        namespace,
    })?;

    tracing::debug!(role_binding = %binding_name, %result, "ensured RoleBinding");
    Ok(result)
}

async fn ensure_impersonator_role<S: ObjectStore>(
    store: &S,
    name: &str,
    namespace: &str,
) -> Result<OperationResult> {
    let role_name = impersonator_name(namespace, name);
    let desired = ClusterRole {
        metadata: ObjectMeta {
            name: Some(role_name.clone()),
            ..ObjectMeta::default()
        },
        ..ClusterRole::default()
    };
    let rules = vec![impersonation_rule(name, namespace)];

    // Anything besides the one rule is dropped, the role must never grant more than that.
    let (_, result) = create_or_update(store, desired, move |role: &mut ClusterRole| {
        if role.rules.as_ref() == Some(&rules) {
            return false;
        }
        role.rules = Some(rules);
        true
    })
    .await
    .with_context(|_| EnsureClusterRoleSnafu {
        name: role_name.clone(),
    })?;

    tracing::debug!(cluster_role = %role_name, %result, "ensured impersonator ClusterRole");
    Ok(result)
}

async fn ensure_impersonator_binding<S: ObjectStore>(
    store: &S,
    name: &str,
    namespace: &str,
) -> Result<OperationResult> {
    let binding_name = impersonator_name(namespace, name);
    let desired = ClusterRoleBinding {
        metadata: ObjectMeta {
            name: Some(binding_name.clone()),
            ..ObjectMeta::default()
        },
        ..ClusterRoleBinding::default()
    };
    let subjects = service_account_subjects(name, namespace);
    let role_ref = cluster_role_ref(&binding_name);

    let (_, result) = create_or_update(store, desired, move |binding: &mut ClusterRoleBinding| {
        let mut changed = false;
        if binding.role_ref != role_ref {
            binding.role_ref = role_ref;
            changed = true;
        }
        if !same_subjects(binding.subjects.as_deref(), &subjects) {
            binding.subjects = Some(subjects);
            changed = true;
        }
        changed
    })
    .await
    .with_context(|_| EnsureClusterRoleBindingSnafu {
        name: binding_name.clone(),
    })?;

    tracing::debug!(
        cluster_role_binding = %binding_name,
        %result,
        "ensured impersonator ClusterRoleBinding"
    );
    Ok(result)
}
