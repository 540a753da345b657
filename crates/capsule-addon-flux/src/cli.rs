//! Command line interface of the controller.
use std::{net::SocketAddr, path::PathBuf};

use capsule_addon_telemetry::tracing::TelemetryOptions;
use clap::{Args, Parser, Subcommand};

use crate::{
    constants::{DEFAULT_HEALTH_ADDRESS, DEFAULT_PROXY_CA_PATH, DEFAULT_PROXY_URL},
    namespace::WatchNamespace,
};

#[derive(Debug, PartialEq, Eq, Parser)]
#[command(author, version, about)]
pub struct Opts {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, PartialEq, Eq, Subcommand)]
pub enum Command {
    /// Run the controller.
    #[command(alias = "manager")]
    Run(RunArguments),
}

#[derive(Debug, PartialEq, Eq, Args)]
pub struct RunArguments {
    /// URL of the Capsule Proxy, written into every kubeconfig.
    #[arg(long, env, value_name = "URL", default_value = DEFAULT_PROXY_URL)]
    pub proxy_url: String,

    /// PEM file holding the CA certificate of the Capsule Proxy.
    #[arg(long, env, value_name = "FILE", default_value = DEFAULT_PROXY_CA_PATH)]
    pub proxy_ca_path: PathBuf,

    /// Provides a specific namespace to watch (instead of watching all namespaces)
    #[arg(long, env, default_value = "")]
    pub watch_namespace: WatchNamespace,

    /// Address serving the `/healthz` and `/readyz` endpoints.
    #[arg(long, env, value_name = "ADDRESS", default_value = DEFAULT_HEALTH_ADDRESS)]
    pub health_bind_address: SocketAddr,

    // Flattened structs go last so the help headings are correct.
    #[command(flatten)]
    pub telemetry: TelemetryOptions,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_cli() {
        use clap::CommandFactory;

        Opts::command().print_long_help().unwrap();
        Opts::command().debug_assert()
    }

    #[test]
    fn defaults() {
        let opts = Opts::parse_from(["capsule-addon-flux", "manager"]);

        let Command::Run(run) = opts.command;
        assert_eq!(run.proxy_url, DEFAULT_PROXY_URL);
        assert_eq!(run.proxy_ca_path, PathBuf::from(DEFAULT_PROXY_CA_PATH));
        assert_eq!(run.watch_namespace, WatchNamespace::All);
        assert_eq!(run.health_bind_address.port(), 10080);
        assert!(!run.telemetry.console_log_disabled);
    }

    #[test]
    fn explicit_arguments() {
        let opts = Opts::parse_from([
            "capsule-addon-flux",
            "run",
            "--proxy-url",
            "https://proxy.example.com",
            "--proxy-ca-path",
            "/etc/capsule-proxy/ca.crt",
            "--watch-namespace",
            "flux-system",
            "--health-bind-address",
            "127.0.0.1:8081",
        ]);

        let Command::Run(run) = opts.command;
        assert_eq!(run.proxy_url, "https://proxy.example.com");
        assert_eq!(run.proxy_ca_path, PathBuf::from("/etc/capsule-proxy/ca.crt"));
        assert_eq!(
            run.watch_namespace,
            WatchNamespace::One("flux-system".to_owned())
        );
        assert_eq!(
            run.health_bind_address,
            SocketAddr::from(([127, 0, 0, 1], 8081))
        );
    }
}
