//! Liveness and readiness endpoints polled by the kubelet.
//!
//! `/healthz` answers as long as the process serves requests. `/readyz` only succeeds once the
//! Tenant owner index has loaded, before that the controller isn't running yet.
use std::net::SocketAddr;

use axum::{Router, extract::State, http::StatusCode, routing::get};
use snafu::{ResultExt, Snafu};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::index::TenantOwnerIndex;

type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to bind health listener to {address}"))]
    BindListener {
        source: std::io::Error,
        address: SocketAddr,
    },

    #[snafu(display("failed to serve health endpoints"))]
    Serve { source: std::io::Error },
}

/// Binds the health listener, so a taken port fails startup instead of the first kubelet check.
pub async fn bind(address: SocketAddr) -> Result<TcpListener> {
    TcpListener::bind(address)
        .await
        .context(BindListenerSnafu { address })
}

pub fn router(index: TenantOwnerIndex) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .with_state(index)
}

async fn healthz() -> &'static str {
    "ok"
}

async fn readyz(State(index): State<TenantOwnerIndex>) -> (StatusCode, &'static str) {
    if index.is_ready() {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "Tenant owner index is not ready")
    }
}

/// Serves the health endpoints on `listener` until `cancel` fires.
pub async fn serve(
    listener: TcpListener,
    index: TenantOwnerIndex,
    cancel: CancellationToken,
) -> Result<()> {
    if let Ok(address) = listener.local_addr() {
        tracing::info!(%address, "serving health endpoints");
    }

    axum::serve(listener, router(index))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
        .context(ServeSnafu)
}

#[cfg(test)]
mod tests {
    use axum::{body::Body, http::Request};
    use kube::runtime::watcher;
    use rstest::rstest;
    use tower::ServiceExt;

    use super::*;

    #[rstest]
    #[case::alive_before_ready("/healthz", false, StatusCode::OK)]
    #[case::not_ready("/readyz", false, StatusCode::SERVICE_UNAVAILABLE)]
    #[case::ready("/readyz", true, StatusCode::OK)]
    #[case::unknown_path("/metrics", true, StatusCode::NOT_FOUND)]
    #[tokio::test]
    async fn endpoints(#[case] path: &str, #[case] index_ready: bool, #[case] expected: StatusCode) {
        let index = TenantOwnerIndex::new();
        if index_ready {
            index.apply_event(watcher::Event::Init);
            index.apply_event(watcher::Event::InitDone);
        }

        let response = router(index)
            .oneshot(Request::get(path).body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), expected);
    }

    #[tokio::test]
    async fn serve_stops_on_cancel() {
        let listener = bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        serve(listener, TenantOwnerIndex::new(), cancel)
            .await
            .unwrap();
    }
}
