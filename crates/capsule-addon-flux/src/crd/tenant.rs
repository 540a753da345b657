use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// A Capsule Tenant, read-only to this controller.
#[derive(Clone, CustomResource, Debug, Default, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[kube(
    group = "capsule.clastix.io",
    version = "v1beta2",
    kind = "Tenant",
    plural = "tenants"
)]
#[serde(rename_all = "camelCase")]
pub struct TenantSpec {
    #[serde(default)]
    pub owners: Vec<OwnerSpec>,
}

#[derive(Clone, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OwnerSpec {
    pub kind: OwnerKind,
    pub name: String,
}

#[derive(
    Clone,
    Copy,
    Debug,
    Deserialize,
    Eq,
    Hash,
    JsonSchema,
    PartialEq,
    Serialize,
    strum::Display,
    strum::EnumString,
)]
pub enum OwnerKind {
    User,
    Group,
    ServiceAccount,
}

/// The key Capsule's owner index uses, `<kind>:<name>`.
pub fn owner_index_key(kind: OwnerKind, name: &str) -> String {
    format!("{kind}:{name}")
}

impl Tenant {
    /// All owner index keys this Tenant is reachable under, without duplicates.
    pub fn owner_index_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .spec
            .owners
            .iter()
            .map(|owner| owner_index_key(owner.kind, &owner.name))
            .collect();
        keys.sort();
        keys.dedup();
        keys
    }

    /// Names of the ServiceAccount owners, as `(namespace, name)`.
    pub fn service_account_owners(&self) -> impl Iterator<Item = (&str, &str)> {
        self.spec
            .owners
            .iter()
            .filter(|owner| owner.kind == OwnerKind::ServiceAccount)
            .filter_map(|owner| crate::ownership::parse_service_account_subject(&owner.name))
    }
}

#[cfg(test)]
mod tests {
    use indoc::indoc;

    use super::*;

    #[test]
    fn deserialize_ignores_unknown_fields() {
        let tenant: Tenant = serde_yaml::from_str(indoc! {"
            apiVersion: capsule.clastix.io/v1beta2
            kind: Tenant
            metadata:
              name: oil
            spec:
              owners:
                - kind: ServiceAccount
                  name: system:serviceaccount:oil-production:gitops
                  clusterRoles:
                    - admin
                - kind: User
                  name: alice
              namespaceOptions:
                quota: 3
        "})
        .unwrap();

        assert_eq!(tenant.owner_index_keys(), vec![
            "ServiceAccount:system:serviceaccount:oil-production:gitops".to_owned(),
            "User:alice".to_owned(),
        ]);
        assert_eq!(
            tenant.service_account_owners().collect::<Vec<_>>(),
            vec![("oil-production", "gitops")]
        );
    }

    #[test]
    fn duplicate_owners_produce_one_key() {
        let owner = OwnerSpec {
            kind: OwnerKind::Group,
            name: "devs".to_owned(),
        };
        let tenant = Tenant::new("oil", TenantSpec {
            owners: vec![owner.clone(), owner],
        });

        assert_eq!(tenant.owner_index_keys(), vec!["Group:devs".to_owned()]);
    }
}
