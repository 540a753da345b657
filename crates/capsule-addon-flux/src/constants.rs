//! Names, keys and values shared with Capsule, the Capsule Proxy and Kubernetes itself.
//!
//! Everything in here is part of the wire contract and must not change.
use const_format::concatcp;

/// Field manager and value of the `app.kubernetes.io/managed-by` label.
pub const MANAGER_NAME: &str = "capsule-addon-fluxcd";

const ANNOTATION_PREFIX: &str = "capsule.addon.fluxcd/";

/// Annotation enabling the addon for a ServiceAccount.
pub const ADDON_ENABLED_ANNOTATION: &str = concatcp!(ANNOTATION_PREFIX, "enabled");
pub const ADDON_ENABLED_VALUE: &str = "true";

/// Annotation requesting the kubeconfig to be distributed to every namespace of the tenant.
pub const KUBECONFIG_GLOBAL_ANNOTATION: &str = concatcp!(ANNOTATION_PREFIX, "kubeconfig-global");
pub const KUBECONFIG_GLOBAL_VALUE: &str = "true";

pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";

/// Label Capsule puts on every Tenant, carrying its name.
pub const TENANT_NAME_LABEL: &str = "kubernetes.io/metadata.name";

pub const KUBECONFIG_SECRET_KEY: &str = "kubeconfig";
pub const KUBECONFIG_SECRET_SUFFIX: &str = "-kubeconfig";
pub const TOKEN_SECRET_SUFFIX: &str = "-token";
pub const GLOBAL_TENANT_RESOURCE_SUFFIX: &str = "-kubeconfig";
pub const IMPERSONATOR_SUFFIX: &str = "-impersonator";

pub const KUBECONFIG_CLUSTER_NAME: &str = "default";
pub const KUBECONFIG_USER_NAME: &str = "default";
pub const KUBECONFIG_CONTEXT_NAME: &str = "default";
pub const KUBECONFIG_CONTEXT_NAMESPACE: &str = "default";

pub const SERVICE_ACCOUNT_NAME_ANNOTATION: &str = "kubernetes.io/service-account.name";
pub const SERVICE_ACCOUNT_TOKEN_SECRET_TYPE: &str = "kubernetes.io/service-account-token";
pub const SERVICE_ACCOUNT_TOKEN_KEY: &str = "token";
pub const OPAQUE_SECRET_TYPE: &str = "Opaque";

pub const RBAC_API_GROUP: &str = "rbac.authorization.k8s.io";
pub const CLUSTER_ROLE_KIND: &str = "ClusterRole";
pub const CLUSTER_ADMIN_ROLE: &str = "cluster-admin";
pub const SERVICE_ACCOUNT_KIND: &str = "ServiceAccount";

pub const DEFAULT_PROXY_URL: &str = "https://capsule-proxy.capsule-system.svc:9001";
pub const DEFAULT_PROXY_CA_PATH: &str = "/tmp/ca.crt";
pub const DEFAULT_HEALTH_ADDRESS: &str = "0.0.0.0:10080";
