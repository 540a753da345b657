//! Which namespaces ServiceAccounts are watched in.
use k8s_openapi::NamespaceResourceScope;
use kube::{Api, Resource};

#[derive(Clone, Debug, Eq, Ord, PartialEq, PartialOrd)]
pub enum WatchNamespace {
    All,
    One(String),
}

impl From<&str> for WatchNamespace {
    fn from(s: &str) -> Self {
        if s.is_empty() {
            Self::All
        } else {
            Self::One(s.to_owned())
        }
    }
}

impl WatchNamespace {
    pub fn as_namespace(&self) -> Option<&str> {
        match self {
            Self::All => None,
            Self::One(namespace) => Some(namespace),
        }
    }

    /// An [`Api`] restricted to the watched namespace, or spanning the cluster for [`Self::All`].
    pub fn get_api<K>(&self, client: kube::Client) -> Api<K>
    where
        K: Resource<DynamicType = (), Scope = NamespaceResourceScope>,
    {
        match self {
            Self::All => Api::all(client),
            Self::One(namespace) => Api::namespaced(client, namespace),
        }
    }
}
