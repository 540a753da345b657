//! A secondary index over Tenants, keyed by declared owner.
//!
//! The index is fed from a Tenant watch and answers [`TenantLookup`] queries without going to the
//! API server. Entries are kept per owner key in a [`BTreeMap`] keyed by Tenant name, which gives
//! callers a stable, lexicographic order.
use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};

use futures::{StreamExt, TryStreamExt};
use kube::{
    Api, ResourceExt,
    runtime::{WatchStreamExt, watcher},
};
use parking_lot::RwLock;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::{
    crd::{OwnerKind, Tenant, tenant::owner_index_key},
    ownership::TenantLookup,
};

#[derive(Debug, Default)]
struct IndexState {
    by_owner: HashMap<String, BTreeMap<String, Arc<Tenant>>>,
    keys_by_tenant: HashMap<String, Vec<String>>,

    /// Tenants seen since the last `Init`, swapped in on `InitDone`.
    relist: Option<Vec<Tenant>>,
}

impl IndexState {
    fn apply(&mut self, tenant: Tenant) {
        let name = tenant.name_any();
        self.remove(&name);

        let keys = tenant.owner_index_keys();
        let tenant = Arc::new(tenant);
        for key in &keys {
            self.by_owner
                .entry(key.clone())
                .or_default()
                .insert(name.clone(), tenant.clone());
        }
        self.keys_by_tenant.insert(name, keys);
    }

    fn remove(&mut self, name: &str) {
        let Some(keys) = self.keys_by_tenant.remove(name) else {
            return;
        };

        for key in keys {
            if let Some(tenants) = self.by_owner.get_mut(&key) {
                tenants.remove(name);
                if tenants.is_empty() {
                    self.by_owner.remove(&key);
                }
            }
        }
    }

    fn replace_all(&mut self, tenants: Vec<Tenant>) {
        self.by_owner.clear();
        self.keys_by_tenant.clear();
        for tenant in tenants {
            self.apply(tenant);
        }
    }
}

/// Tenants by owner key, see [`owner_index_key`].
///
/// Clones share the same underlying index.
#[derive(Clone, Debug)]
pub struct TenantOwnerIndex {
    state: Arc<RwLock<IndexState>>,
    ready: Arc<watch::Sender<bool>>,
}

impl Default for TenantOwnerIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl TenantOwnerIndex {
    pub fn new() -> Self {
        let (ready, _) = watch::channel(false);
        Self {
            state: Arc::default(),
            ready: Arc::new(ready),
        }
    }

    pub fn apply_event(&self, event: watcher::Event<Tenant>) {
        let mut state = self.state.write();
        match event {
            watcher::Event::Apply(tenant) => state.apply(tenant),
            watcher::Event::Delete(tenant) => state.remove(&tenant.name_any()),
            watcher::Event::Init => state.relist = Some(Vec::new()),
            watcher::Event::InitApply(tenant) => state.relist.get_or_insert_default().push(tenant),
            watcher::Event::InitDone => {
                let tenants = state.relist.take().unwrap_or_default();
                state.replace_all(tenants);
                drop(state);
                self.ready.send_replace(true);
            }
        }
    }

    /// Whether the initial list of Tenants has been loaded.
    pub fn is_ready(&self) -> bool {
        *self.ready.borrow()
    }

    /// Resolves once the initial list of Tenants has been loaded.
    pub async fn wait_until_ready(&self) {
        let mut ready = self.ready.subscribe();
        // The sender lives as long as `self`, so this can't fail.
        let _ = ready.wait_for(|ready| *ready).await;
    }

    /// Number of owner keys currently indexed.
    pub fn owner_count(&self) -> usize {
        self.state.read().by_owner.len()
    }

    /// Feeds the index from a watch on all Tenants until `cancel` fires.
    ///
    /// Every applied or deleted Tenant is sent to `changes` once the index reflects it, so
    /// consumers looking the Tenant up again see the new state.
    pub async fn run(
        self,
        api: Api<Tenant>,
        changes: mpsc::UnboundedSender<Tenant>,
        cancel: CancellationToken,
    ) {
        let mut events = watcher(api, watcher::Config::default())
            .default_backoff()
            .boxed();

        tracing::info!("starting Tenant owner index");
        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                event = events.try_next() => match event {
                    Ok(Some(event)) => {
                        let changed = match &event {
                            watcher::Event::Apply(tenant) | watcher::Event::Delete(tenant) => {
                                Some(tenant.clone())
                            }
                            _ => None,
                        };
                        self.apply_event(event);
                        if let Some(tenant) = changed {
                            // Only fails once the controller is gone, which ends the loop anyway.
                            let _ = changes.send(tenant);
                        }
                    }
                    Ok(None) => break,
                    Err(error) => {
                        tracing::warn!(
                            error = &error as &dyn std::error::Error,
                            "Tenant watch failed, retrying"
                        );
                    }
                },
            }
        }
        tracing::info!("stopped Tenant owner index");
    }
}

impl TenantLookup for TenantOwnerIndex {
    fn list_owned(&self, owner_kind: OwnerKind, owner_name: &str) -> Vec<Arc<Tenant>> {
        self.state
            .read()
            .by_owner
            .get(&owner_index_key(owner_kind, owner_name))
            .map(|tenants| tenants.values().cloned().collect())
            .unwrap_or_default()
    }
}
