//! How to reach the Capsule Proxy.
use std::path::{Path, PathBuf};

use snafu::{OptionExt, ResultExt, Snafu, ensure};
use url::Url;

type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to parse proxy URL {url:?}"))]
    ParseProxyUrl {
        source: url::ParseError,
        url: String,
    },

    #[snafu(display("proxy URL {url:?} must use http or https, not {scheme:?}"))]
    UnsupportedScheme { url: String, scheme: String },

    #[snafu(display("proxy URL {url:?} has no host"))]
    MissingHost { url: String },

    #[snafu(display("failed to read proxy CA certificate from {path:?}"))]
    ReadProxyCa {
        source: std::io::Error,
        path: PathBuf,
    },

    #[snafu(display("proxy CA certificate is empty"))]
    EmptyProxyCa,
}

/// Endpoint and CA certificate written into every kubeconfig.
///
/// Validated once on construction and immutable afterwards.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ProxyConfig {
    url: String,
    ca: Vec<u8>,
}

impl ProxyConfig {
    pub fn new(url: impl Into<String>, ca: Vec<u8>) -> Result<Self> {
        let url = url.into();
        let parsed = Url::parse(&url).with_context(|_| ParseProxyUrlSnafu { url: url.clone() })?;

        ensure!(
            matches!(parsed.scheme(), "http" | "https"),
            UnsupportedSchemeSnafu {
                url: url.clone(),
                scheme: parsed.scheme(),
            }
        );
        parsed
            .host_str()
            .filter(|host| !host.is_empty())
            .with_context(|| MissingHostSnafu { url: url.clone() })?;
        ensure!(!ca.is_empty(), EmptyProxyCaSnafu);

        Ok(Self { url, ca })
    }

    /// Reads the CA certificate from `ca_path`.
    pub async fn from_ca_file(url: impl Into<String>, ca_path: impl AsRef<Path>) -> Result<Self> {
        let ca_path = ca_path.as_ref();
        let ca = tokio::fs::read(ca_path)
            .await
            .context(ReadProxyCaSnafu { path: ca_path })?;
        Self::new(url, ca)
    }

    /// The proxy URL as it was configured.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// PEM encoded CA certificate of the proxy.
    pub fn ca(&self) -> &[u8] {
        &self.ca
    }
}
