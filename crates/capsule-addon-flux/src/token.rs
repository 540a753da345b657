//! Long-lived ServiceAccount tokens.
//!
//! Kubernetes fills a Secret of type `kubernetes.io/service-account-token` with a token for the
//! ServiceAccount named in its `kubernetes.io/service-account.name` annotation. This controller
//! only makes sure such a Secret exists and reads the token back once it has been populated.
use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Secret;
use kube::api::ObjectMeta;
use snafu::{ResultExt, Snafu};

use crate::{
    constants::{
        SERVICE_ACCOUNT_NAME_ANNOTATION, SERVICE_ACCOUNT_TOKEN_KEY,
        SERVICE_ACCOUNT_TOKEN_SECRET_TYPE, TOKEN_SECRET_SUFFIX,
    },
    store::{self, ObjectStore, OperationResult, create_or_update},
};

type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to list Secrets in namespace {namespace:?}"))]
    ListSecrets {
        source: store::Error,
        namespace: String,
    },

    #[snafu(display("failed to create token Secret {name:?} in namespace {namespace:?}"))]
    CreateTokenSecret {
        source: store::Error,
        name: String,
        namespace: String,
    },

    #[snafu(display(
        "no token Secret found for ServiceAccount {service_account:?} in namespace {namespace:?}"
    ))]
    TokenSecretNotFound {
        service_account: String,
        namespace: String,
    },
}

/// Generate the name of the token Secret created for a ServiceAccount.
pub fn token_secret_name(service_account: &str) -> String {
    format!("{service_account}{TOKEN_SECRET_SUFFIX}")
}

fn is_token_secret_for(secret: &Secret, service_account: &str) -> bool {
    secret.type_.as_deref() == Some(SERVICE_ACCOUNT_TOKEN_SECRET_TYPE)
        && secret
            .metadata
            .annotations
            .as_ref()
            .and_then(|annotations| annotations.get(SERVICE_ACCOUNT_NAME_ANNOTATION))
            .is_some_and(|name| name == service_account)
}

async fn find_token_secret<S: ObjectStore>(
    store: &S,
    service_account: &str,
    namespace: &str,
) -> Result<Option<Secret>> {
    let secrets: Vec<Secret> = store
        .list(Some(namespace))
        .await
        .context(ListSecretsSnafu { namespace })?;

    Ok(secrets
        .into_iter()
        .find(|secret| is_token_secret_for(secret, service_account)))
}

/// Makes sure a token Secret bound to the ServiceAccount exists.
///
/// A token Secret that already exists is reused, whoever created it. Otherwise a Secret named
/// after [`token_secret_name`] is created. Its data is filled in by Kubernetes some time later.
pub async fn ensure_token_secret<S: ObjectStore>(
    store: &S,
    service_account: &str,
    namespace: &str,
) -> Result<(Secret, OperationResult)> {
    if let Some(existing) = find_token_secret(store, service_account, namespace).await? {
        return Ok((existing, OperationResult::Unchanged));
    }

    let name = token_secret_name(service_account);
    let desired = Secret {
        metadata: ObjectMeta {
            name: Some(name.clone()),
            namespace: Some(namespace.to_owned()),
            annotations: Some(BTreeMap::from([(
                SERVICE_ACCOUNT_NAME_ANNOTATION.to_owned(),
                service_account.to_owned(),
            )])),
            ..ObjectMeta::default()
        },
        type_: Some(SERVICE_ACCOUNT_TOKEN_SECRET_TYPE.to_owned()),
        ..Secret::default()
    };

    // Kubernetes owns the contents, so an existing Secret is never touched.
    let result = create_or_update(store, desired, |_| false)
        .await
        .with_context(|_| CreateTokenSecretSnafu {
            name: name.clone(),
            namespace,
        })?;

    tracing::debug!(secret = %name, result = %result.1, "ensured token Secret");
    Ok(result)
}

/// Looks up the token Secret bound to the ServiceAccount without creating one.
pub async fn get_token_secret<S: ObjectStore>(
    store: &S,
    service_account: &str,
    namespace: &str,
) -> Result<Secret> {
    match find_token_secret(store, service_account, namespace).await? {
        Some(secret) => Ok(secret),
        None => TokenSecretNotFoundSnafu {
            service_account,
            namespace,
        }
        .fail(),
    }
}

/// The token stored in the Secret, or `None` while Kubernetes has not populated it yet.
pub fn token_from_secret(secret: &Secret) -> Option<String> {
    let token = secret.data.as_ref()?.get(SERVICE_ACCOUNT_TOKEN_KEY)?;
    if token.0.is_empty() {
        return None;
    }
    String::from_utf8(token.0.clone()).ok()
}

#[cfg(test)]
mod tests {
    use k8s_openapi::ByteString;

    use super::*;
    use crate::store::MemoryStore;

    fn token_secret(name: &str, service_account: &str, token: Option<&str>) -> Secret {
        Secret {
            metadata: ObjectMeta {
                name: Some(name.to_owned()),
                namespace: Some("ns1".to_owned()),
                annotations: Some(BTreeMap::from([(
                    SERVICE_ACCOUNT_NAME_ANNOTATION.to_owned(),
                    service_account.to_owned(),
                )])),
                ..ObjectMeta::default()
            },
            type_: Some(SERVICE_ACCOUNT_TOKEN_SECRET_TYPE.to_owned()),
            data: token.map(|token| {
                BTreeMap::from([(
                    SERVICE_ACCOUNT_TOKEN_KEY.to_owned(),
                    ByteString(token.as_bytes().to_vec()),
                )])
            }),
            ..Secret::default()
        }
    }

    #[tokio::test]
    async fn creates_missing_token_secret() {
        let store = MemoryStore::new();

        let (secret, result) = ensure_token_secret(&store, "sa1", "ns1").await.unwrap();

        assert_eq!(result, OperationResult::Created);
        assert_eq!(secret.metadata.name.as_deref(), Some("sa1-token"));
        assert_eq!(
            secret.type_.as_deref(),
            Some("kubernetes.io/service-account-token")
        );
        assert!(token_from_secret(&secret).is_none());
    }

    #[tokio::test]
    async fn reuses_existing_token_secret() {
        let store = MemoryStore::new();
        store
            .insert(token_secret("sa1-token-x7k2p", "sa1", Some("abc")))
            .unwrap();

        let (secret, result) = ensure_token_secret(&store, "sa1", "ns1").await.unwrap();

        assert_eq!(result, OperationResult::Unchanged);
        assert_eq!(secret.metadata.name.as_deref(), Some("sa1-token-x7k2p"));
        assert_eq!(store.writes(), 0);
        assert!(store.get::<Secret>("sa1-token", Some("ns1")).is_none());
    }

    #[tokio::test]
    async fn ignores_secrets_bound_to_other_accounts() {
        let store = MemoryStore::new();
        store
            .insert(token_secret("other-token", "other", Some("abc")))
            .unwrap();

        assert!(matches!(
            get_token_secret(&store, "sa1", "ns1").await,
            Err(Error::TokenSecretNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn reads_populated_token() {
        let store = MemoryStore::new();
        store
            .insert(token_secret("sa1-token", "sa1", Some("abc")))
            .unwrap();

        let secret = get_token_secret(&store, "sa1", "ns1").await.unwrap();

        assert_eq!(token_from_secret(&secret).as_deref(), Some("abc"));
    }

    #[test]
    fn empty_token_is_not_ready() {
        assert!(token_from_secret(&token_secret("sa1-token", "sa1", Some(""))).is_none());
        assert!(token_from_secret(&token_secret("sa1-token", "sa1", None)).is_none());
    }
}
