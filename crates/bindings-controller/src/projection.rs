//! ServiceBindingProjection reconciler
//!
//! Runs the projection engine against every workload the projection's
//! application reference selects and writes the result back. A finalizer
//! keeps the projection around until its Undo has run. Projections marked
//! Custom belong to a third party: they are left alone, except that one we
//! already hold a finalizer for is un-projected once and then released.

use std::sync::Arc;
use std::time::Duration;

use kube::api::DynamicObject;
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::{Resource, ResourceExt};
use tracing::{debug, error, info, instrument, warn};

use bindings_common::crd::{
    ServiceBindingProjection, ServiceBindingProjectionStatus, APPLICATION_AVAILABLE,
};
use bindings_common::events::{actions, reasons};
use bindings_common::{
    ConditionSet, PROJECTION_FINALIZER, REQUEUE_ERROR_SECS, REQUEUE_WAITING_SECS,
};
use bindings_projection::{engine, BindingDescriptor, DynamicWorkload};

use crate::context::BindingContext;
use crate::error::ReconcileError;
use crate::patch::workload_patch;

/// Conditions reported by a ServiceBindingProjection
pub fn condition_set() -> ConditionSet {
    ConditionSet::living(&[APPLICATION_AVAILABLE])
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Mode {
    Project,
    Unproject,
}

fn has_finalizer(projection: &ServiceBindingProjection) -> bool {
    projection.finalizers().iter().any(|f| f == PROJECTION_FINALIZER)
}

/// Reconcile a ServiceBindingProjection
#[instrument(skip(projection, ctx), fields(projection = %projection.name_any()))]
pub async fn reconcile(
    projection: Arc<ServiceBindingProjection>,
    ctx: Arc<BindingContext>,
) -> Result<Action, ReconcileError> {
    let name = projection.name_any();
    let namespace = projection.namespace().unwrap_or_default();
    let custom = projection.is_custom_projection();
    let finalizer = has_finalizer(&projection);

    if custom && !finalizer {
        debug!("custom projection, managed elsewhere");
        return Ok(Action::await_change());
    }

    if projection.metadata.deletion_timestamp.is_some() {
        if finalizer {
            cleanup(&projection, &namespace, &ctx).await?;
            ctx.kube
                .remove_projection_finalizer(&name, &namespace)
                .await?;
        }
        return Ok(Action::await_change());
    }

    if !custom && !finalizer {
        ctx.kube.add_projection_finalizer(&name, &namespace).await?;
    }

    let set = condition_set();
    let previous = projection.status.clone().unwrap_or_default();
    let mut status = previous.clone();
    set.initialize(&mut status.conditions);

    let mode = if custom { Mode::Unproject } else { Mode::Project };
    let result = project(&projection, &namespace, &ctx, &set, &mut status, mode).await;
    status.observed_generation = projection.metadata.generation;

    if status != previous {
        ctx.kube
            .patch_projection_status(&name, &namespace, &status)
            .await?;
    }

    let action = result?;
    if custom {
        info!("custom projection un-projected, releasing finalizer");
        ctx.kube
            .remove_projection_finalizer(&name, &namespace)
            .await?;
        return Ok(Action::await_change());
    }
    Ok(action)
}

async fn project(
    projection: &ServiceBindingProjection,
    namespace: &str,
    ctx: &BindingContext,
    set: &ConditionSet,
    status: &mut ServiceBindingProjectionStatus,
    mode: Mode,
) -> Result<Action, ReconcileError> {
    let descriptor = match projection
        .validate()
        .and_then(|()| BindingDescriptor::from_projection(projection))
    {
        Ok(descriptor) => descriptor,
        Err(e) => {
            warn!(error = %e, "projection validation failed");
            set.mark_false(
                &mut status.conditions,
                APPLICATION_AVAILABLE,
                e.reason(),
                &e.to_string(),
            );
            return Ok(Action::await_change());
        }
    };

    let workloads = match ctx
        .kube
        .list_workloads(namespace, &projection.spec.application)
        .await
    {
        Ok(workloads) => workloads,
        Err(e) => {
            set.mark_false(
                &mut status.conditions,
                APPLICATION_AVAILABLE,
                e.reason(),
                &e.to_string(),
            );
            return Err(e.into());
        }
    };

    if workloads.is_empty() {
        debug!("application not found");
        set.mark_false(
            &mut status.conditions,
            APPLICATION_AVAILABLE,
            "SubjectMissing",
            &format!(
                "{} {} not found",
                projection.spec.application.kind,
                projection.spec.application.name.as_deref().unwrap_or("(by selector)")
            ),
        );
        return Ok(Action::requeue(Duration::from_secs(REQUEUE_WAITING_SECS)));
    }

    for workload in workloads {
        if let Err(e) = sync_workload(projection, namespace, ctx, &descriptor, workload, mode).await
        {
            set.mark_false(
                &mut status.conditions,
                APPLICATION_AVAILABLE,
                e.reason(),
                &e.to_string(),
            );
            if !e.is_retryable() {
                ctx.events
                    .publish(
                        &projection.object_ref(&()),
                        EventType::Warning,
                        e.reason(),
                        actions::PROJECT,
                        Some(e.to_string()),
                    )
                    .await;
            }
            return Err(e);
        }
    }

    set.mark_true(&mut status.conditions, APPLICATION_AVAILABLE);
    Ok(Action::requeue(ctx.resync))
}

/// Run the engine on one workload and write it back when it changed
async fn sync_workload(
    projection: &ServiceBindingProjection,
    namespace: &str,
    ctx: &BindingContext,
    descriptor: &BindingDescriptor,
    original: DynamicObject,
    mode: Mode,
) -> Result<(), ReconcileError> {
    let workload_name = original.name_any();
    let mut workload = DynamicWorkload::from_dynamic(original.clone())?;
    match mode {
        Mode::Project => engine::apply(descriptor, &mut workload)?,
        Mode::Unproject => engine::remove(descriptor, &mut workload)?,
    }
    let updated = workload.into_dynamic()?;

    let Some(patch) = workload_patch(&original, &updated)? else {
        debug!(workload = %workload_name, "workload already up to date");
        return Ok(());
    };

    ctx.kube
        .patch_workload(namespace, &projection.spec.application, &workload_name, &patch)
        .await?;

    let (reason, verb) = match mode {
        Mode::Project => (reasons::PROJECTED, "Projected binding into"),
        Mode::Unproject => (reasons::UNPROJECTED, "Removed binding from"),
    };
    info!(workload = %workload_name, ?mode, "updated workload");
    ctx.events
        .publish(
            &projection.object_ref(&()),
            EventType::Normal,
            reason,
            actions::PROJECT,
            Some(format!(
                "{verb} {} \"{workload_name}\"",
                projection.spec.application.kind
            )),
        )
        .await;
    Ok(())
}

/// Undo the projection on every workload before the finalizer is released
async fn cleanup(
    projection: &ServiceBindingProjection,
    namespace: &str,
    ctx: &BindingContext,
) -> Result<(), ReconcileError> {
    // the mount name and env narrow Undo on volumes other bindings share
    let descriptor = BindingDescriptor::from_projection(projection).unwrap_or_else(|_| {
        BindingDescriptor::new(projection.name_any(), projection.spec.binding.name.clone())
    });

    let workloads = match ctx
        .kube
        .list_workloads(namespace, &projection.spec.application)
        .await
    {
        Ok(workloads) => workloads,
        Err(e) if !e.is_retryable() => {
            warn!(error = %e, "application cannot be resolved, nothing to clean up");
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    };

    for workload in workloads {
        sync_workload(projection, namespace, ctx, &descriptor, workload, Mode::Unproject).await?;
    }

    ctx.events
        .publish(
            &projection.object_ref(&()),
            EventType::Normal,
            reasons::UNPROJECTED,
            actions::DELETE,
            Some("Removed binding from application".to_string()),
        )
        .await;
    Ok(())
}

/// Error policy for the ServiceBindingProjection controller
///
/// - Retryable errors (transient): requeue after 30 seconds
/// - Non-retryable errors (permanent): await spec change
pub fn error_policy(
    projection: Arc<ServiceBindingProjection>,
    error: &ReconcileError,
    _ctx: Arc<BindingContext>,
) -> Action {
    error!(
        ?error,
        projection = %projection.name_any(),
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
        ApplicationReference, ConditionStatus, SecretReference, ServiceBindingProjectionSpec,
    };
    use bindings_common::{CUSTOM_PROJECTION_ANNOTATION, CUSTOM_PROJECTION_VALUE};
    use bindings_projection::PodTemplateDocument;
    use serde_json::Value;

    use super::*;
    use crate::client::MockBindingKubeClient;

    // =========================================================================
    // Test Fixtures
    // =========================================================================

    fn sample_projection(finalized: bool) -> ServiceBindingProjection {
        let mut projection = ServiceBindingProjection::new(
            "my-binding",
            ServiceBindingProjectionSpec {
                name: "my-binding".to_string(),
                r#type: None,
                provider: None,
                binding: SecretReference {
                    name: "my-secret".to_string(),
                },
                application: ApplicationReference {
                    api_version: "apps/v1".to_string(),
                    kind: "Deployment".to_string(),
                    name: Some("my-app".to_string()),
                    ..Default::default()
                },
                env: Vec::new(),
            },
        );
        projection.metadata.namespace = Some("default".to_string());
        projection.metadata.generation = Some(2);
        if finalized {
            projection.metadata.finalizers = Some(vec![PROJECTION_FINALIZER.to_string()]);
        }
        projection
    }

    fn mark_custom(projection: &mut ServiceBindingProjection) {
        projection.metadata.annotations = Some(
            [(
                CUSTOM_PROJECTION_ANNOTATION.to_string(),
                CUSTOM_PROJECTION_VALUE.to_string(),
            )]
            .into(),
        );
    }

    fn mark_deleted(projection: &mut ServiceBindingProjection) {
        projection.metadata.deletion_timestamp = Some(
            serde_json::from_value(serde_json::json!("2026-01-01T00:00:00Z")).expect("timestamp"),
        );
    }

    fn deployment() -> DynamicObject {
        serde_yaml::from_str(
            r#"
apiVersion: apps/v1
kind: Deployment
metadata:
  name: my-app
  namespace: default
  resourceVersion: "5"
spec:
  template:
    spec:
      containers:
      - name: app
        image: example/app
"#,
        )
        .expect("parse deployment")
    }

    /// The deployment as it looks after this projection ran
    fn projected_deployment() -> DynamicObject {
        let descriptor =
            BindingDescriptor::from_projection(&sample_projection(true)).expect("descriptor");
        let mut workload = DynamicWorkload::from_dynamic(deployment()).expect("lift");
        engine::apply(&descriptor, &mut workload).expect("apply");
        workload.into_dynamic().expect("lower")
    }

    type Captured<T> = Arc<Mutex<Option<T>>>;

    fn capture_status(
        mock: &mut MockBindingKubeClient,
    ) -> Captured<ServiceBindingProjectionStatus> {
        let captured: Captured<ServiceBindingProjectionStatus> = Arc::new(Mutex::new(None));
        let sink = captured.clone();
        mock.expect_patch_projection_status()
            .returning(move |_, _, status| {
                *sink.lock().expect("lock") = Some(status.clone());
                Ok(())
            });
        captured
    }

    fn capture_patch(mock: &mut MockBindingKubeClient) -> Captured<json_patch::Patch> {
        let captured: Captured<json_patch::Patch> = Arc::new(Mutex::new(None));
        let sink = captured.clone();
        mock.expect_patch_workload()
            .times(1)
            .returning(move |_, _, _, patch| {
                *sink.lock().expect("lock") = Some(patch.clone());
                Ok(())
            });
        captured
    }

    fn patched(original: DynamicObject, captured: &Captured<json_patch::Patch>) -> Value {
        let patch = captured
            .lock()
            .expect("lock")
            .clone()
            .expect("workload patched");
        let mut doc = serde_json::to_value(original).expect("serialize");
        json_patch::patch(&mut doc, &patch).expect("patch applies");
        doc
    }

    fn application_available(status: &Captured<ServiceBindingProjectionStatus>) -> (ConditionStatus, String) {
        let status = status.lock().expect("lock").clone().expect("status patched");
        let c = conditions::find(&status.conditions, APPLICATION_AVAILABLE)
            .cloned()
            .expect("condition present");
        (c.status, c.reason)
    }

    // =========================================================================
    // Reconciliation Story Tests
    // =========================================================================

    /// Story: The binding secret is mounted into the application
    #[tokio::test]
    async fn story_projection_mounts_secret_into_application() {
        let mut mock = MockBindingKubeClient::new();
        mock.expect_list_workloads()
            .returning(|_, _| Ok(vec![deployment()]));
        let patch = capture_patch(&mut mock);
        let status = capture_status(&mut mock);

        let ctx = Arc::new(BindingContext::for_testing(Arc::new(mock)));
        let action = reconcile(Arc::new(sample_projection(true)), ctx)
            .await
            .expect("reconcile");

        assert_eq!(action, Action::requeue(Duration::from_secs(300)));
        let doc = patched(deployment(), &patch);
        assert_eq!(
            doc.pointer("/spec/template/spec/volumes/0/projected/sources/0/secret/name"),
            Some(&Value::String("my-secret".to_string()))
        );
        assert_eq!(
            doc.pointer("/spec/template/spec/containers/0/volumeMounts/0/mountPath"),
            Some(&Value::String("/bindings/my-binding".to_string()))
        );
        assert_eq!(application_available(&status).0, ConditionStatus::True);
    }

    /// Story: The first reconcile claims the projection with a finalizer
    #[tokio::test]
    async fn story_new_projection_gets_finalizer() {
        let mut mock = MockBindingKubeClient::new();
        mock.expect_add_projection_finalizer()
            .times(1)
            .returning(|_, _| Ok(()));
        mock.expect_list_workloads()
            .returning(|_, _| Ok(vec![projected_deployment()]));
        capture_status(&mut mock);

        let ctx = Arc::new(BindingContext::for_testing(Arc::new(mock)));
        reconcile(Arc::new(sample_projection(false)), ctx)
            .await
            .expect("reconcile");
    }

    /// Story: An already projected workload is not written again
    #[tokio::test]
    async fn story_projected_workload_is_left_alone() {
        let mut mock = MockBindingKubeClient::new();
        mock.expect_list_workloads()
            .returning(|_, _| Ok(vec![projected_deployment()]));
        let status = capture_status(&mut mock);

        let ctx = Arc::new(BindingContext::for_testing(Arc::new(mock)));
        reconcile(Arc::new(sample_projection(true)), ctx)
            .await
            .expect("reconcile");
        assert_eq!(application_available(&status).0, ConditionStatus::True);
    }

    /// Story: A projection waits for its application to exist
    #[tokio::test]
    async fn story_missing_application_waits() {
        let mut mock = MockBindingKubeClient::new();
        mock.expect_list_workloads().returning(|_, _| Ok(vec![]));
        let status = capture_status(&mut mock);

        let ctx = Arc::new(BindingContext::for_testing(Arc::new(mock)));
        let action = reconcile(Arc::new(sample_projection(true)), ctx)
            .await
            .expect("reconcile");

        assert_eq!(
            action,
            Action::requeue(Duration::from_secs(REQUEUE_WAITING_SECS))
        );
        assert_eq!(
            application_available(&status),
            (ConditionStatus::False, "SubjectMissing".to_string())
        );
    }

    /// Story: A workload without a pod template cannot be projected into
    #[tokio::test]
    async fn story_workload_without_template_fails_permanently() {
        let mut mock = MockBindingKubeClient::new();
        mock.expect_list_workloads().returning(|_, _| {
            Ok(vec![serde_yaml::from_str(
                r#"
apiVersion: apps/v1
kind: Deployment
metadata:
  name: my-app
spec: {}
"#,
            )
            .expect("parse")])
        });
        let status = capture_status(&mut mock);

        let ctx = Arc::new(BindingContext::for_testing(Arc::new(mock)));
        let err = reconcile(Arc::new(sample_projection(true)), ctx)
            .await
            .expect_err("no template");

        assert!(!err.is_retryable());
        assert_eq!(
            application_available(&status),
            (ConditionStatus::False, "ProjectionFailed".to_string())
        );
    }

    /// Story: Custom projections without our finalizer are someone else's
    #[tokio::test]
    async fn story_custom_projection_is_skipped() {
        let mut projection = sample_projection(false);
        mark_custom(&mut projection);

        let ctx = Arc::new(BindingContext::for_testing(Arc::new(
            MockBindingKubeClient::new(),
        )));
        let action = reconcile(Arc::new(projection), ctx)
            .await
            .expect("reconcile");
        assert_eq!(action, Action::await_change());
    }

    /// Story: Turning a projection Custom undoes our projection and lets go
    #[tokio::test]
    async fn story_projection_turned_custom_is_unprojected_and_released() {
        let mut projection = sample_projection(true);
        mark_custom(&mut projection);

        let mut mock = MockBindingKubeClient::new();
        mock.expect_list_workloads()
            .returning(|_, _| Ok(vec![projected_deployment()]));
        let patch = capture_patch(&mut mock);
        capture_status(&mut mock);
        mock.expect_remove_projection_finalizer()
            .times(1)
            .returning(|_, _| Ok(()));

        let ctx = Arc::new(BindingContext::for_testing(Arc::new(mock)));
        let action = reconcile(Arc::new(projection), ctx)
            .await
            .expect("reconcile");

        assert_eq!(action, Action::await_change());
        let doc = patched(projected_deployment(), &patch);
        assert_eq!(doc.pointer("/spec/template/spec/volumes"), None);
        assert_eq!(doc.pointer("/spec/template/spec/containers/0/volumeMounts"), None);
        assert_eq!(doc.pointer("/metadata/annotations"), None);
    }

    /// Story: Deleting a projection restores the workload before release
    #[tokio::test]
    async fn story_deleted_projection_is_undone_before_release() {
        let mut projection = sample_projection(true);
        mark_deleted(&mut projection);

        let mut mock = MockBindingKubeClient::new();
        mock.expect_list_workloads()
            .returning(|_, _| Ok(vec![projected_deployment()]));
        let patch = capture_patch(&mut mock);
        mock.expect_remove_projection_finalizer()
            .times(1)
            .returning(|_, _| Ok(()));

        let ctx = Arc::new(BindingContext::for_testing(Arc::new(mock)));
        let action = reconcile(Arc::new(projection), ctx)
            .await
            .expect("reconcile");

        assert_eq!(action, Action::await_change());
        let doc = patched(projected_deployment(), &patch);
        let restored = DynamicWorkload::from_dynamic(
            serde_json::from_value(doc).expect("deserialize"),
        )
        .expect("lift");
        assert!(restored
            .pod_template()
            .and_then(|t| t.spec.as_ref())
            .is_some_and(|s| s.volumes.is_none()));
    }

    #[tokio::test]
    async fn story_deleted_projection_with_unresolvable_application_is_released() {
        let mut projection = sample_projection(true);
        mark_deleted(&mut projection);

        let mut mock = MockBindingKubeClient::new();
        mock.expect_list_workloads().returning(|_, app| {
            Err(bindings_common::Error::resolution(
                format!("{}/{}", app.api_version, app.kind),
                "kind is not served",
            ))
        });
        mock.expect_remove_projection_finalizer()
            .times(1)
            .returning(|_, _| Ok(()));

        let ctx = Arc::new(BindingContext::for_testing(Arc::new(mock)));
        reconcile(Arc::new(projection), ctx)
            .await
            .expect("reconcile");
    }

    #[test]
    fn story_error_policy_requeues_transient_failures() {
        let projection = Arc::new(sample_projection(true));
        let ctx = Arc::new(BindingContext::for_testing(Arc::new(
            MockBindingKubeClient::new(),
        )));
        let err = ReconcileError::from(bindings_common::Error::internal("boom"));
        assert_eq!(
            error_policy(projection, &err, ctx),
            Action::requeue(Duration::from_secs(REQUEUE_ERROR_SECS))
        );
    }
}
