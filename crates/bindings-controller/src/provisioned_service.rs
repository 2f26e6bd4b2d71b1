//! ProvisionedService reconciler
//!
//! Republishes `spec.binding` under `status.binding` so the service can be
//! referenced from a ServiceBinding like any other serviceable resource.

use std::sync::Arc;
use std::time::Duration;

use kube::runtime::controller::Action;
use kube::ResourceExt;
use tracing::{debug, error, instrument, warn};

use bindings_common::conditions::READY;
use bindings_common::crd::ProvisionedService;
use bindings_common::{ConditionSet, REQUEUE_ERROR_SECS};

use crate::context::BindingContext;
use crate::error::ReconcileError;

/// Conditions reported by a ProvisionedService
pub fn condition_set() -> ConditionSet {
    ConditionSet::living(&[])
}

/// Reconcile a ProvisionedService
#[instrument(skip(service, ctx), fields(service = %service.name_any()))]
pub async fn reconcile(
    service: Arc<ProvisionedService>,
    ctx: Arc<BindingContext>,
) -> Result<Action, ReconcileError> {
    let name = service.name_any();
    let namespace = service.namespace().unwrap_or_default();

    let set = condition_set();
    let previous = service.status.clone().unwrap_or_default();
    let mut status = previous.clone();
    set.initialize(&mut status.conditions);

    let action = match service.validate() {
        Ok(()) => {
            status.binding = Some(service.spec.binding.clone());
            set.mark_true(&mut status.conditions, READY);
            Action::requeue(ctx.resync)
        }
        Err(e) => {
            warn!(error = %e, "provisioned service is invalid");
            status.binding = None;
            set.mark_false(&mut status.conditions, READY, e.reason(), &e.to_string());
            Action::await_change()
        }
    };
    status.observed_generation = service.metadata.generation;

    if status != previous {
        ctx.kube
            .patch_provisioned_service_status(&name, &namespace, &status)
            .await?;
    } else {
        debug!("status unchanged");
    }
    Ok(action)
}

/// Error policy for the ProvisionedService controller
pub fn error_policy(
    service: Arc<ProvisionedService>,
    error: &ReconcileError,
    _ctx: Arc<BindingContext>,
) -> Action {
    error!(
        ?error,
        service = %service.name_any(),
        retryable = error.is_retryable(),
        "reconciliation failed"
    );

    if error.is_retryable() {
        Action::requeue(Duration::from_secs(REQUEUE_ERROR_SECS))
    } else {
        Action::await_change()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use bindings_common::conditions;
    use bindings_common::crd::{
        ConditionStatus, ProvisionedServiceSpec, ProvisionedServiceStatus, SecretReference,
    };

    use super::*;
    use crate::client::MockBindingKubeClient;

    fn sample_service(secret: &str) -> ProvisionedService {
        let mut service = ProvisionedService::new(
            "account-db",
            ProvisionedServiceSpec {
                binding: SecretReference {
                    name: secret.to_string(),
                },
            },
        );
        service.metadata.namespace = Some("default".to_string());
        service.metadata.generation = Some(1);
        service
    }

    fn capture_status(
        mock: &mut MockBindingKubeClient,
    ) -> Arc<Mutex<Option<ProvisionedServiceStatus>>> {
        let captured = Arc::new(Mutex::new(None));
        let sink = captured.clone();
        mock.expect_patch_provisioned_service_status()
            .times(1)
            .returning(move |_, _, status| {
                *sink.lock().expect("lock") = Some(status.clone());
                Ok(())
            });
        captured
    }

    /// Story: A provisioned service publishes its secret for resolvers
    #[tokio::test]
    async fn story_service_publishes_binding_secret() {
        let mut mock = MockBindingKubeClient::new();
        let captured = capture_status(&mut mock);
        let ctx = Arc::new(BindingContext::for_testing(Arc::new(mock)));

        let action = reconcile(Arc::new(sample_service("account-db-credentials")), ctx)
            .await
            .expect("reconcile");

        assert_eq!(action, Action::requeue(ctx_resync()));
        let status = captured.lock().expect("lock").clone().expect("status");
        assert_eq!(
            status.binding.map(|b| b.name).as_deref(),
            Some("account-db-credentials")
        );
        assert_eq!(status.observed_generation, Some(1));
        let ready = conditions::find(&status.conditions, READY).expect("ready");
        assert_eq!(ready.status, ConditionStatus::True);
    }

    /// Story: A published status is not rewritten on every resync
    #[tokio::test]
    async fn story_unchanged_status_is_not_patched() {
        let mut service = sample_service("account-db-credentials");
        let mut status = ProvisionedServiceStatus {
            observed_generation: Some(1),
            binding: Some(service.spec.binding.clone()),
            ..Default::default()
        };
        let set = condition_set();
        set.initialize(&mut status.conditions);
        set.mark_true(&mut status.conditions, READY);
        service.status = Some(status);

        let ctx = Arc::new(BindingContext::for_testing(Arc::new(
            MockBindingKubeClient::new(),
        )));
        reconcile(Arc::new(service), ctx).await.expect("reconcile");
    }

    #[tokio::test]
    async fn story_service_without_secret_is_not_ready() {
        let mut mock = MockBindingKubeClient::new();
        let captured = capture_status(&mut mock);
        let ctx = Arc::new(BindingContext::for_testing(Arc::new(mock)));

        let action = reconcile(Arc::new(sample_service("")), ctx)
            .await
            .expect("reconcile");

        assert_eq!(action, Action::await_change());
        let status = captured.lock().expect("lock").clone().expect("status");
        assert!(status.binding.is_none());
        let ready = conditions::find(&status.conditions, READY).expect("ready");
        assert_eq!(ready.status, ConditionStatus::False);
        assert_eq!(ready.reason, "ValidationFailed");
    }

    #[test]
    fn story_error_policy_awaits_change_for_permanent_failures() {
        let ctx = Arc::new(BindingContext::for_testing(Arc::new(
            MockBindingKubeClient::new(),
        )));
        let err = ReconcileError::from(bindings_common::Error::validation_for_field("account-db", "spec.binding.name", "is required"));
        assert_eq!(
            error_policy(Arc::new(sample_service("s")), &err, ctx),
            Action::await_change()
        );
    }

    fn ctx_resync() -> Duration {
        Duration::from_secs(bindings_common::REQUEUE_SUCCESS_SECS)
    }
}
