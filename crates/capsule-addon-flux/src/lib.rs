//! Reconciles Capsule tenant owner ServiceAccounts into everything they need to work through the
//! Capsule Proxy: RBAC granting impersonation, a token, a kubeconfig pointing at the proxy and,
//! optionally, a `GlobalTenantResource` distributing that kubeconfig to every tenant namespace.
//!
//! The entry point is [`reconciler::Reconciler`], which is driven by [`controller::run`].

pub mod admission;
pub mod cli;
pub mod config;
pub mod constants;
pub mod controller;
pub mod crd;
pub mod distribution;
pub mod events;
pub mod health;
pub mod index;
pub mod kubeconfig;
pub mod namespace;
pub mod namespace_owner;
pub mod ownership;
pub mod rbac;
pub mod reconciler;
pub mod signal;
pub mod store;
pub mod token;

// External re-exports
pub use k8s_openapi;
pub use kube;
