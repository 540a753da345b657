//! Wires the [`Reconciler`] into a kube-runtime [`Controller`].
//!
//! ServiceAccounts are watched, passed through [`should_reconcile`] and only then handed to the
//! controller. Tenant changes come from the [`TenantOwnerIndex`] after it has applied them, and
//! re-trigger every owning ServiceAccount that passes the same filter.
use std::{collections::HashMap, future, sync::Arc, time::Duration};

use backoff::{ExponentialBackoff, backoff::Backoff};
use futures::{StreamExt, TryStreamExt, stream};
use k8s_openapi::api::core::v1::ServiceAccount;
use kube::{
    Api, ResourceExt,
    runtime::{
        Controller, WatchStreamExt,
        controller::{self, Action},
        events::Recorder,
        reflector::{self, ObjectRef, Store},
        watcher,
    },
};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::{
    admission::should_reconcile,
    config::ProxyConfig,
    constants::MANAGER_NAME,
    crd::Tenant,
    events::{self, publish_controller_error},
    index::TenantOwnerIndex,
    namespace::WatchNamespace,
    reconciler::{self, IdentityKey, ReconcileOutcome, Reconciler},
    store::Client,
};

/// First retry delay after a failed pass, doubled on every further failure.
pub const INITIAL_BACKOFF: Duration = Duration::from_secs(5);
pub const MAX_BACKOFF: Duration = Duration::from_secs(5 * 60);

fn failure_backoff() -> ExponentialBackoff {
    ExponentialBackoff {
        current_interval: INITIAL_BACKOFF,
        initial_interval: INITIAL_BACKOFF,
        randomization_factor: 0.0,
        multiplier: 2.0,
        max_interval: MAX_BACKOFF,
        max_elapsed_time: None,
        ..ExponentialBackoff::default()
    }
}

/// Per ServiceAccount exponential backoff for failed passes.
#[derive(Debug, Default)]
pub struct FailureBackoff {
    backoffs: Mutex<HashMap<IdentityKey, ExponentialBackoff>>,
}

impl FailureBackoff {
    /// Records a failure for `key` and returns how long to wait before retrying.
    pub fn next_delay(&self, key: &IdentityKey) -> Duration {
        self.backoffs
            .lock()
            .entry(key.clone())
            .or_insert_with(failure_backoff)
            .next_backoff()
            .unwrap_or(MAX_BACKOFF)
    }

    /// Forgets all failures of `key`.
    pub fn reset(&self, key: &IdentityKey) {
        self.backoffs.lock().remove(key);
    }

    /// Forgets the failures of every key `keep` rejects.
    pub fn retain(&self, mut keep: impl FnMut(&IdentityKey) -> bool) {
        self.backoffs.lock().retain(|key, _| keep(key));
    }

    pub fn len(&self) -> usize {
        self.backoffs.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub struct Context {
    reconciler: Reconciler<Client, TenantOwnerIndex>,
    service_accounts: Store<ServiceAccount>,
    cancel: CancellationToken,
    backoff: FailureBackoff,
}

fn identity_key(service_account: &ServiceAccount) -> IdentityKey {
    IdentityKey::new(
        service_account.namespace().unwrap_or_default(),
        service_account.name_any(),
    )
}

fn object_ref(key: &IdentityKey) -> ObjectRef<ServiceAccount> {
    ObjectRef::new(&key.name).within(&key.namespace)
}

async fn reconcile(
    service_account: Arc<ServiceAccount>,
    ctx: Arc<Context>,
) -> Result<Action, reconciler::Error> {
    let key = identity_key(&service_account);
    let outcome = ctx.reconciler.reconcile(&key, &ctx.cancel).await?;
    ctx.backoff.reset(&key);

    Ok(match outcome {
        ReconcileOutcome::Done => Action::await_change(),
        ReconcileOutcome::RequeueAfter(delay) => Action::requeue(delay),
    })
}

#[allow(clippy::needless_pass_by_value)]
fn error_policy(
    service_account: Arc<ServiceAccount>,
    error: &reconciler::Error,
    ctx: Arc<Context>,
) -> Action {
    // ServiceAccounts deleted while failing never reach a successful pass.
    ctx.backoff
        .retain(|key| ctx.service_accounts.get(&object_ref(key)).is_some());

    let key = identity_key(&service_account);
    let delay = ctx.backoff.next_delay(&key);
    tracing::warn!(
        service_account = %key,
        error = error as &dyn std::error::Error,
        category = error.category(),
        retry_in = ?delay,
        "failed to reconcile ServiceAccount"
    );
    Action::requeue(delay)
}

/// ServiceAccounts to reconcile when `tenant` changed: every ServiceAccount owner that is known and
/// passes [`should_reconcile`].
///
/// `index` must already reflect the change, so a deleted Tenant no longer admits its owners.
fn tenant_owners(
    tenant: &Tenant,
    service_accounts: &Store<ServiceAccount>,
    index: &TenantOwnerIndex,
) -> Vec<ObjectRef<ServiceAccount>> {
    tenant
        .service_account_owners()
        .map(|(namespace, name)| ObjectRef::new(name).within(namespace))
        .filter(|object_ref| {
            service_accounts
                .get(object_ref)
                .is_some_and(|service_account| should_reconcile(&service_account, index))
        })
        .collect()
}

fn report_reconciled(
    recorder: &Recorder,
    result: &Result<
        (ObjectRef<ServiceAccount>, Action),
        controller::Error<reconciler::Error, watcher::Error>,
    >,
) {
    match result {
        Ok((object, _)) => {
            tracing::info!(controller.name = MANAGER_NAME, %object, "Reconciled object");
        }
        Err(error) => {
            tracing::error!(
                controller.name = MANAGER_NAME,
                error = error as &dyn std::error::Error,
                "Failed to reconcile object",
            );
            publish_controller_error(recorder, error);
        }
    }
}

async fn shutdown(cancel: CancellationToken) {
    cancel.cancelled().await;
}

/// Runs the controller until `cancel` fires.
///
/// `index` must be fed and ready before this is called, the ServiceAccount filter relies on it.
/// `tenant_changes` receives the Tenants the index has applied since.
pub async fn run(
    client: Client,
    index: TenantOwnerIndex,
    mut tenant_changes: mpsc::UnboundedReceiver<Tenant>,
    proxy: Arc<ProxyConfig>,
    watch_namespace: &WatchNamespace,
    cancel: CancellationToken,
) {
    let kube_client = client.as_kube_client();
    let service_account_api: Api<ServiceAccount> = watch_namespace.get_api(kube_client.clone());
    let recorder = events::recorder(kube_client);

    let (service_accounts, writer) = reflector::store();
    let filter_index = index.clone();
    let trigger = watcher(service_account_api, watcher::Config::default())
        .default_backoff()
        .reflect(writer)
        .applied_objects()
        .try_filter(move |service_account| {
            future::ready(should_reconcile(service_account, &filter_index))
        });

    let owners_store = service_accounts.clone();
    let owners_index = index.clone();
    let tenant_trigger = stream::poll_fn(move |cx| tenant_changes.poll_recv(cx))
        .flat_map(move |tenant| stream::iter(tenant_owners(&tenant, &owners_store, &owners_index)));

    let context = Context {
        reconciler: Reconciler::new(Arc::new(client), index, proxy),
        service_accounts: service_accounts.clone(),
        cancel: cancel.clone(),
        backoff: FailureBackoff::default(),
    };

    tracing::info!(
        watch_namespace = watch_namespace.as_namespace().unwrap_or("<all>"),
        "starting ServiceAccount controller"
    );
    Controller::for_stream(trigger, service_accounts)
        .reconcile_on(tenant_trigger)
        .graceful_shutdown_on(shutdown(cancel))
        .run(reconcile, error_policy, Arc::new(context))
        .for_each(|result| {
            report_reconciled(&recorder, &result);
            future::ready(())
        })
        .await;
    tracing::info!("stopped ServiceAccount controller");
}
