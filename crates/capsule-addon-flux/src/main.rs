use std::sync::Arc;

use capsule_addon_flux::{
    cli::{Command, Opts},
    config::{self, ProxyConfig},
    constants::MANAGER_NAME,
    controller, health,
    index::TenantOwnerIndex,
    signal::{self, cancel_on_shutdown_signal},
    store::Client,
};
use capsule_addon_telemetry::Tracing;
use clap::Parser;
use kube::Api;
use snafu::{ResultExt, Snafu};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Snafu)]
enum Error {
    #[snafu(display("failed to initialize tracing"))]
    InitTracing {
        source: capsule_addon_telemetry::tracing::Error,
    },

    #[snafu(display("invalid Capsule Proxy configuration"))]
    ProxyConfig { source: config::Error },

    #[snafu(display("failed to create Kubernetes client"))]
    CreateClient { source: kube::Error },

    #[snafu(display("failed to watch for shutdown signals"))]
    WatchSignals { source: signal::SignalError },

    #[snafu(display("failed to start health endpoints"))]
    HealthEndpoints { source: health::Error },
}

#[snafu::report]
#[tokio::main]
async fn main() -> Result<(), Error> {
    let Opts { command } = Opts::parse();
    let Command::Run(run) = command;

    let _tracing_guard = Tracing::pre_configured(MANAGER_NAME, run.telemetry)
        .init()
        .context(InitTracingSnafu)?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        proxy_url = %run.proxy_url,
        proxy_ca_path = %run.proxy_ca_path.display(),
        "starting {MANAGER_NAME}"
    );

    let proxy = ProxyConfig::from_ca_file(run.proxy_url, &run.proxy_ca_path)
        .await
        .context(ProxyConfigSnafu)?;
    let kube_client = kube::Client::try_default()
        .await
        .context(CreateClientSnafu)?;
    let client = Client::new(kube_client.clone(), Some(MANAGER_NAME.to_owned()));

    let cancel = CancellationToken::new();
    cancel_on_shutdown_signal(cancel.clone()).context(WatchSignalsSnafu)?;

    let health_listener = health::bind(run.health_bind_address)
        .await
        .context(HealthEndpointsSnafu)?;

    let index = TenantOwnerIndex::new();
    let (tenant_changes_tx, tenant_changes) = mpsc::unbounded_channel();
    let index_task = tokio::spawn(index.clone().run(
        Api::all(kube_client),
        tenant_changes_tx,
        cancel.clone(),
    ));
    let health_task = tokio::spawn(health::serve(
        health_listener,
        index.clone(),
        cancel.clone(),
    ));

    let index_ready = tokio::select! {
        () = index.wait_until_ready() => true,
        () = cancel.cancelled() => false,
    };
    if index_ready {
        tracing::info!(owners = index.owner_count(), "Tenant owner index is ready");
        controller::run(
            client,
            index,
            tenant_changes,
            Arc::new(proxy),
            &run.watch_namespace,
            cancel.clone(),
        )
        .await;
    }

    cancel.cancel();
    if let Err(error) = index_task.await {
        tracing::error!(
            error = &error as &dyn std::error::Error,
            "Tenant owner index task failed"
        );
    }
    match health_task.await {
        Ok(Ok(())) => {}
        Ok(Err(error)) => tracing::error!(
            error = &error as &dyn std::error::Error,
            "health server failed"
        ),
        Err(error) => tracing::error!(
            error = &error as &dyn std::error::Error,
            "health server task failed"
        ),
    }

    Ok(())
}
