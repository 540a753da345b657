//! Kubeconfigs pointing at the Capsule Proxy and the Secret they are stored in.
use std::collections::BTreeMap;

use k8s_openapi::{ByteString, api::core::v1::Secret};
use kube::api::ObjectMeta;
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};

use crate::{
    config::ProxyConfig,
    constants::{
        KUBECONFIG_CLUSTER_NAME, KUBECONFIG_CONTEXT_NAME, KUBECONFIG_CONTEXT_NAMESPACE,
        KUBECONFIG_SECRET_KEY, KUBECONFIG_SECRET_SUFFIX, KUBECONFIG_USER_NAME, OPAQUE_SECRET_TYPE,
    },
    store::{self, ObjectStore, OperationResult, create_or_update},
};

type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to serialize kubeconfig"))]
    SerializeKubeconfig { source: serde_yaml::Error },

    #[snafu(display("failed to deserialize kubeconfig"))]
    DeserializeKubeconfig { source: serde_yaml::Error },

    #[snafu(display("failed to ensure kubeconfig Secret {name:?} in namespace {namespace:?}"))]
    EnsureKubeconfigSecret {
        source: store::Error,
        name: String,
        namespace: String,
    },
}

/// A client configuration file as understood by `kubectl` and client libraries.
///
/// Only the fields written by [`build_kubeconfig`] are modelled.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct Kubeconfig {
    #[serde(rename = "apiVersion")]
    pub api_version: String,
    pub kind: String,
    #[serde(default)]
    pub preferences: BTreeMap<String, serde_yaml::Value>,
    #[serde(default)]
    pub clusters: Vec<NamedCluster>,
    #[serde(default)]
    pub users: Vec<NamedUser>,
    #[serde(default)]
    pub contexts: Vec<NamedContext>,
    #[serde(default)]
    pub current_context: String,
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct NamedCluster {
    pub name: String,
    pub cluster: Cluster,
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct Cluster {
    pub server: String,
    #[serde(with = "base64_bytes")]
    pub certificate_authority_data: Vec<u8>,
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct NamedUser {
    pub name: String,
    pub user: User,
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct User {
    pub token: String,
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct NamedContext {
    pub name: String,
    pub context: Context,
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Context {
    pub cluster: String,
    pub user: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

mod base64_bytes {
    use base64::{Engine, engine::general_purpose::STANDARD};
    use serde::{Deserialize, Deserializer, Serializer, de::Error};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded.trim()).map_err(D::Error::custom)
    }
}

/// Builds a kubeconfig with a single cluster, user and context, all named `default`.
pub fn build_kubeconfig(server: &str, ca: &[u8], token: &str) -> Kubeconfig {
    Kubeconfig {
        api_version: "v1".to_owned(),
        kind: "Config".to_owned(),
        preferences: BTreeMap::new(),
        clusters: vec![NamedCluster {
            name: KUBECONFIG_CLUSTER_NAME.to_owned(),
            cluster: Cluster {
                server: server.to_owned(),
                certificate_authority_data: ca.to_vec(),
            },
        }],
        users: vec![NamedUser {
            name: KUBECONFIG_USER_NAME.to_owned(),
            user: User {
                token: token.to_owned(),
            },
        }],
        contexts: vec![NamedContext {
            name: KUBECONFIG_CONTEXT_NAME.to_owned(),
            context: Context {
                cluster: KUBECONFIG_CLUSTER_NAME.to_owned(),
                user: KUBECONFIG_USER_NAME.to_owned(),
                namespace: Some(KUBECONFIG_CONTEXT_NAMESPACE.to_owned()),
            },
        }],
        current_context: KUBECONFIG_CONTEXT_NAME.to_owned(),
    }
}

impl Kubeconfig {
    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).context(SerializeKubeconfigSnafu)
    }

    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).context(DeserializeKubeconfigSnafu)
    }
}

/// Generate the name of the Secret holding a ServiceAccount's kubeconfig.
pub fn kubeconfig_secret_name(service_account: &str) -> String {
    format!("{service_account}{KUBECONFIG_SECRET_SUFFIX}")
}

/// Writes a kubeconfig for the ServiceAccount, pointing at the proxy and authenticating with
/// `token`, into its kubeconfig Secret.
///
/// The Secret is updated whenever its content no longer matches, for example after the token
/// changed.
pub async fn ensure_kubeconfig_secret<S: ObjectStore>(
    store: &S,
    proxy: &ProxyConfig,
    service_account: &str,
    namespace: &str,
    token: &str,
) -> Result<(Secret, OperationResult)> {
    let kubeconfig = build_kubeconfig(proxy.url(), proxy.ca(), token).to_yaml()?;
    let name = kubeconfig_secret_name(service_account);
    let desired = Secret {
        metadata: ObjectMeta {
            name: Some(name.clone()),
            namespace: Some(namespace.to_owned()),
            ..ObjectMeta::default()
        },
        ..Secret::default()
    };
    let data = BTreeMap::from([(
        KUBECONFIG_SECRET_KEY.to_owned(),
        ByteString(kubeconfig.into_bytes()),
    )]);

    let result = create_or_update(store, desired, move |secret: &mut Secret| {
        let mut changed = false;
        if secret.type_.as_deref() != Some(OPAQUE_SECRET_TYPE) {
            secret.type_ = Some(OPAQUE_SECRET_TYPE.to_owned());
            changed = true;
        }
        if secret.data.as_ref() != Some(&data) {
            secret.data = Some(data);
            secret.string_data = None;
            changed = true;
        }
        changed
    })
    .await
    .with_context(|_| EnsureKubeconfigSecretSnafu {
        name: name.clone(),
        namespace,
    })?;

    tracing::debug!(secret = %name, result = %result.1, "ensured kubeconfig Secret");
    Ok(result)
}

#[cfg(test)]
mod tests {
    use indoc::indoc;

    use super::*;

    const SERVER: &str = "https://capsule-proxy.capsule-system.svc:9001";
    const CA: &[u8] = b"-----BEGIN CERTIFICATE-----\nMIIB\n-----END CERTIFICATE-----\n";

    #[test]
    fn round_trip() {
        let kubeconfig = build_kubeconfig(SERVER, CA, "abc");

        let parsed = Kubeconfig::from_yaml(&kubeconfig.to_yaml().unwrap()).unwrap();

        assert_eq!(parsed, kubeconfig);
        assert_eq!(parsed.clusters.len(), 1);
        assert_eq!(parsed.clusters[0].cluster.server, SERVER);
        assert_eq!(parsed.clusters[0].cluster.certificate_authority_data, CA);
        assert_eq!(parsed.users.len(), 1);
        assert_eq!(parsed.users[0].user.token, "abc");
        let context = &parsed.contexts[0];
        assert_eq!(parsed.current_context, context.name);
        assert_eq!(context.context.cluster, parsed.clusters[0].name);
        assert_eq!(context.context.user, parsed.users[0].name);
    }

    #[test]
    fn loadable_by_kube_client() {
        let yaml = build_kubeconfig(SERVER, CA, "abc").to_yaml().unwrap();

        let loaded = kube::config::Kubeconfig::from_yaml(&yaml).unwrap();

        assert_eq!(loaded.current_context.as_deref(), Some("default"));
        let cluster = loaded.clusters[0].cluster.as_ref().unwrap();
        assert_eq!(cluster.server.as_deref(), Some(SERVER));
        assert_eq!(
            cluster.certificate_authority_data.as_deref(),
            Some("LS0tLS1CRUdJTiBDRVJUSUZJQ0FURS0tLS0tCk1JSUIKLS0tLS1FTkQgQ0VSVElGSUNBVEUtLS0tLQo=")
        );
    }

    #[test]
    fn wire_format() {
        let yaml = build_kubeconfig("https://proxy:9001", b"ca", "abc")
            .to_yaml()
            .unwrap();

        assert_eq!(yaml, indoc! {"
            apiVersion: v1
            kind: Config
            preferences: {}
            clusters:
            - name: default
              cluster:
                server: https://proxy:9001
                certificate-authority-data: Y2E=
            users:
            - name: default
              user:
                token: abc
            contexts:
            - name: default
              context:
                cluster: default
                user: default
                namespace: default
            current-context: default
        "});
    }
}
