use k8s_openapi::apimachinery::pkg::{apis::meta::v1::LabelSelector, runtime::RawExtension};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Replicates its items into every namespace of every Tenant matched by `tenant_selector`.
#[derive(Clone, CustomResource, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[kube(
    group = "capsule.clastix.io",
    version = "v1beta2",
    kind = "GlobalTenantResource",
    plural = "globaltenantresources"
)]
#[serde(rename_all = "camelCase")]
pub struct GlobalTenantResourceSpec {
    #[serde(default)]
    pub tenant_selector: LabelSelector,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resync_period: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pruning_on_delete: Option<bool>,

    #[serde(default)]
    pub resources: Vec<ResourceSpec>,
}

#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace_selector: Option<LabelSelector>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub raw_items: Vec<RawExtension>,
}
