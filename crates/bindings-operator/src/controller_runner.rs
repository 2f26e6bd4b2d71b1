//! Controller runner - builds one controller future per resource kind

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::NamespaceResourceScope;
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client, Resource, ResourceExt};

use bindings_common::crd::{ProvisionedService, ServiceBinding, ServiceBindingProjection};
use bindings_controller::{projection, provisioned_service, service_binding, BindingContext};

/// Watcher timeout (seconds) - must be less than client read_timeout (30s)
const WATCH_TIMEOUT_SECS: u32 = 25;

type ControllerFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

fn watcher_config() -> WatcherConfig {
    WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS)
}

/// Api for `K` in `namespace`, or across the cluster when unset
fn scoped_api<K>(client: &Client, namespace: Option<&str>) -> Api<K>
where
    K: Resource<Scope = NamespaceResourceScope>,
    <K as Resource>::DynamicType: Default,
{
    match namespace {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    }
}

/// Build the ServiceBinding, ServiceBindingProjection and ProvisionedService controllers
pub fn build_controllers(
    client: Client,
    namespace: Option<&str>,
    resync: Duration,
) -> Vec<ControllerFuture> {
    let ctx = Arc::new(BindingContext::from_client(client.clone(), resync));

    let bindings = Controller::new(
        scoped_api::<ServiceBinding>(&client, namespace),
        watcher_config(),
    );
    let store = bindings.store();
    let binding_ctrl = bindings
        .owns(scoped_api::<Secret>(&client, namespace), watcher_config())
        .owns(
            scoped_api::<ServiceBindingProjection>(&client, namespace),
            watcher_config(),
        )
        .watches(
            scoped_api::<ProvisionedService>(&client, namespace),
            watcher_config(),
            move |service| {
                let api_version = ProvisionedService::api_version(&());
                let kind = ProvisionedService::kind(&());
                let name = service.name_any();
                let namespace = service.namespace();
                let affected: Vec<ObjectRef<ServiceBinding>> = store
                    .state()
                    .iter()
                    .filter(|binding| {
                        service_binding::references_service(
                            binding,
                            &api_version,
                            &kind,
                            namespace.as_deref(),
                            &name,
                        )
                    })
                    .map(|binding| ObjectRef::from_obj(binding.as_ref()))
                    .collect();

                tracing::debug!(
                    service = %name,
                    affected_count = affected.len(),
                    "triggering re-reconciliation of bindings"
                );
                affected
            },
        )
        .shutdown_on_signal()
        .run(
            service_binding::reconcile,
            service_binding::error_policy,
            ctx.clone(),
        )
        .for_each(log_reconcile_result("ServiceBinding"));

    let projection_ctrl = Controller::new(
        scoped_api::<ServiceBindingProjection>(&client, namespace),
        watcher_config(),
    )
    .shutdown_on_signal()
    .run(projection::reconcile, projection::error_policy, ctx.clone())
    .for_each(log_reconcile_result("ServiceBindingProjection"));

    let provisioned_ctrl = Controller::new(
        scoped_api::<ProvisionedService>(&client, namespace),
        watcher_config(),
    )
    .shutdown_on_signal()
    .run(
        provisioned_service::reconcile,
        provisioned_service::error_policy,
        ctx,
    )
    .for_each(log_reconcile_result("ProvisionedService"));

    tracing::info!("- ServiceBinding controller");
    tracing::info!("- ServiceBindingProjection controller");
    tracing::info!("- ProvisionedService controller");

    vec![
        Box::pin(binding_ctrl),
        Box::pin(projection_ctrl),
        Box::pin(provisioned_ctrl),
    ]
}

fn log_reconcile_result<T: std::fmt::Debug, E: std::fmt::Debug>(
    controller_name: &'static str,
) -> impl Fn(Result<T, E>) -> std::future::Ready<()> {
    move |result| {
        match result {
            Ok(action) => tracing::debug!(?action, "{} reconciliation completed", controller_name),
            Err(e) => tracing::error!(error = ?e, "{} reconciliation error", controller_name),
        }
        std::future::ready(())
    }
}
