//! ServiceBinding reconciler
//!
//! Resolves the binding's service to a secret, copies that secret (plus
//! `type`, `provider` and mappings) into a Secret owned by the binding, and
//! hands the result to a ServiceBindingProjection. Status reports whether the
//! service was available and mirrors the projection's readiness.

use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::core::v1::Secret;
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::{Resource, ResourceExt};
use tracing::{debug, error, info, instrument, warn};

use bindings_common::conditions::{self, READY};
use bindings_common::crd::{
    ConditionStatus, SecretReference, ServiceBinding, ServiceBindingProjection,
    ServiceBindingStatus, PROJECTION_READY, SERVICE_AVAILABLE,
};
use bindings_common::events::{actions, reasons};
use bindings_common::{ConditionSet, Error, REQUEUE_ERROR_SECS, REQUEUE_WAITING_SECS};

use crate::context::BindingContext;
use crate::error::ReconcileError;
use crate::resources::{
    is_controlled_by, make_projected_secret, make_projection, projected_secret_name,
    projection_matches, secret_matches, update_projection, update_secret,
};

/// Conditions reported by a ServiceBinding
pub fn condition_set() -> ConditionSet {
    ConditionSet::living(&[SERVICE_AVAILABLE, PROJECTION_READY])
}

/// Reconcile a ServiceBinding
#[instrument(skip(binding, ctx), fields(binding = %binding.name_any()))]
pub async fn reconcile(
    binding: Arc<ServiceBinding>,
    ctx: Arc<BindingContext>,
) -> Result<Action, ReconcileError> {
    if binding.metadata.deletion_timestamp.is_some() {
        debug!("binding is being deleted, generated resources are garbage collected");
        return Ok(Action::await_change());
    }

    let mut binding = (*binding).clone();
    binding.set_defaults();
    let namespace = binding.namespace().unwrap_or_default();

    let set = condition_set();
    let previous = binding.status.clone().unwrap_or_default();
    let mut status = previous.clone();
    set.initialize(&mut status.conditions);

    let result = reconcile_binding(&binding, &namespace, &ctx, &set, &mut status).await;
    status.observed_generation = binding.metadata.generation;

    if status != previous {
        ctx.kube
            .patch_binding_status(&binding.name_any(), &namespace, &status)
            .await?;

        if set.is_happy(&status.conditions) {
            info!("binding ready");
            ctx.events
                .publish(
                    &binding.object_ref(&()),
                    EventType::Normal,
                    reasons::RECONCILED,
                    actions::RECONCILE,
                    Some(format!(
                        "ServiceBinding reconciled: \"{}/{}\"",
                        namespace,
                        binding.name_any()
                    )),
                )
                .await;
        }
    }

    result
}

async fn reconcile_binding(
    binding: &ServiceBinding,
    namespace: &str,
    ctx: &BindingContext,
    set: &ConditionSet,
    status: &mut ServiceBindingStatus,
) -> Result<Action, ReconcileError> {
    if let Err(e) = binding.validate() {
        warn!(error = %e, "binding validation failed");
        set.mark_false(&mut status.conditions, READY, e.reason(), &e.to_string());
        ctx.events
            .publish(
                &binding.object_ref(&()),
                EventType::Warning,
                reasons::VALIDATION_FAILED,
                actions::RECONCILE,
                Some(e.to_string()),
            )
            .await;
        // Spec changes are required to fix validation errors
        return Ok(Action::await_change());
    }

    let Some(reference) = resolve_reference_secret(binding, namespace, ctx, set, status).await?
    else {
        status.binding = None;
        return Ok(Action::requeue(Duration::from_secs(REQUEUE_WAITING_SECS)));
    };

    let secret = match projected_secret(binding, namespace, ctx, &reference).await {
        Ok(secret) => secret,
        Err(e) => {
            set.mark_false(
                &mut status.conditions,
                SERVICE_AVAILABLE,
                e.reason(),
                &e.to_string(),
            );
            return Err(e);
        }
    };
    let secret_name = secret.name_any();
    status.binding = Some(SecretReference {
        name: secret_name.clone(),
    });
    set.mark_true(&mut status.conditions, SERVICE_AVAILABLE);

    let projection = match service_binding_projection(binding, namespace, ctx, &secret_name).await
    {
        Ok(projection) => projection,
        Err(e) => {
            set.mark_false(
                &mut status.conditions,
                PROJECTION_READY,
                e.reason(),
                &e.to_string(),
            );
            return Err(e);
        }
    };
    propagate_projection_status(set, status, &projection);

    Ok(Action::requeue(ctx.resync))
}

/// Resolve the service and fetch its secret.
///
/// Returns `None` after marking ServiceAvailable when the service or its
/// secret is not there yet.
async fn resolve_reference_secret(
    binding: &ServiceBinding,
    namespace: &str,
    ctx: &BindingContext,
    set: &ConditionSet,
    status: &mut ServiceBindingStatus,
) -> Result<Option<Secret>, ReconcileError> {
    let Some(service) = binding.spec.service.as_ref() else {
        return Ok(None);
    };

    let secret_name = match ctx.resolver.secret_name(namespace, service).await {
        Ok(name) => name,
        Err(e) if e.is_service_unavailable() => {
            debug!(error = %e, "waiting for service");
            set.mark_false(
                &mut status.conditions,
                SERVICE_AVAILABLE,
                e.reason(),
                &e.to_string(),
            );
            return Ok(None);
        }
        Err(e) => {
            set.mark_false(
                &mut status.conditions,
                SERVICE_AVAILABLE,
                e.reason(),
                &e.to_string(),
            );
            return Err(e.into());
        }
    };

    match ctx.kube.get_secret(&secret_name, namespace).await? {
        Some(secret) => Ok(Some(secret)),
        None => {
            debug!(secret = %secret_name, "waiting for service secret");
            set.mark_false(
                &mut status.conditions,
                SERVICE_AVAILABLE,
                "SecretNotFound",
                &format!("secret {secret_name} not found"),
            );
            Ok(None)
        }
    }
}

/// Create or update the projected Secret
async fn projected_secret(
    binding: &ServiceBinding,
    namespace: &str,
    ctx: &BindingContext,
    reference: &Secret,
) -> Result<Secret, ReconcileError> {
    let name = projected_secret_name(&binding.name_any());
    let desired = make_projected_secret(binding, reference)?;

    match ctx.kube.get_secret(&name, namespace).await? {
        None => match ctx.kube.create_secret(namespace, &desired).await {
            Ok(created) => {
                info!(secret = %name, "created projected secret");
                publish(
                    ctx,
                    binding,
                    EventType::Normal,
                    reasons::CREATED,
                    format!("Created projected Secret \"{name}\""),
                )
                .await;
                Ok(created)
            }
            Err(e) => {
                publish(
                    ctx,
                    binding,
                    EventType::Warning,
                    reasons::CREATION_FAILED,
                    format!("Failed to create projected Secret \"{name}\": {e}"),
                )
                .await;
                Err(e.into())
            }
        },
        Some(existing) if !is_controlled_by(&existing.metadata, binding) => {
            let e = Error::ownership(binding.name_any(), "Secret", &name);
            publish(
                ctx,
                binding,
                EventType::Warning,
                reasons::OWNERSHIP_CONFLICT,
                e.to_string(),
            )
            .await;
            Err(e.into())
        }
        Some(existing) if secret_matches(&desired, &existing) => Ok(existing),
        Some(existing) => {
            let updated = ctx
                .kube
                .replace_secret(namespace, &update_secret(existing, desired))
                .await?;
            debug!(secret = %name, "updated projected secret");
            publish(
                ctx,
                binding,
                EventType::Normal,
                reasons::UPDATED,
                format!("Updated projected Secret \"{name}\""),
            )
            .await;
            Ok(updated)
        }
    }
}

/// Create or update the ServiceBindingProjection
async fn service_binding_projection(
    binding: &ServiceBinding,
    namespace: &str,
    ctx: &BindingContext,
    secret_name: &str,
) -> Result<ServiceBindingProjection, ReconcileError> {
    let desired = make_projection(binding, secret_name)?;
    let name = desired.name_any();

    match ctx.kube.get_projection(&name, namespace).await? {
        None => match ctx.kube.create_projection(namespace, &desired).await {
            Ok(created) => {
                info!(projection = %name, "created service binding projection");
                publish(
                    ctx,
                    binding,
                    EventType::Normal,
                    reasons::CREATED,
                    format!("Created ServiceBindingProjection \"{name}\""),
                )
                .await;
                Ok(created)
            }
            Err(e) => {
                publish(
                    ctx,
                    binding,
                    EventType::Warning,
                    reasons::CREATION_FAILED,
                    format!("Failed to create ServiceBindingProjection \"{name}\": {e}"),
                )
                .await;
                Err(e.into())
            }
        },
        Some(existing) if !is_controlled_by(&existing.metadata, binding) => {
            let e = Error::ownership(binding.name_any(), "ServiceBindingProjection", &name);
            publish(
                ctx,
                binding,
                EventType::Warning,
                reasons::OWNERSHIP_CONFLICT,
                e.to_string(),
            )
            .await;
            Err(e.into())
        }
        Some(existing) if projection_matches(&desired, &existing) => Ok(existing),
        Some(existing) => {
            let updated = ctx
                .kube
                .replace_projection(namespace, &update_projection(existing, desired))
                .await?;
            debug!(projection = %name, "updated service binding projection");
            publish(
                ctx,
                binding,
                EventType::Normal,
                reasons::UPDATED,
                format!("Updated ServiceBindingProjection \"{name}\""),
            )
            .await;
            Ok(updated)
        }
    }
}

/// Mirror the projection's Ready condition into ProjectionReady
fn propagate_projection_status(
    set: &ConditionSet,
    status: &mut ServiceBindingStatus,
    projection: &ServiceBindingProjection,
) {
    let ready = projection
        .status
        .as_ref()
        .and_then(|s| conditions::find(&s.conditions, READY))
        .cloned();

    match ready {
        Some(c) if c.status == ConditionStatus::True => {
            set.mark_true(&mut status.conditions, PROJECTION_READY)
        }
        Some(c) if c.status == ConditionStatus::False => {
            set.mark_false(&mut status.conditions, PROJECTION_READY, &c.reason, &c.message)
        }
        Some(c) => {
            set.mark_unknown(&mut status.conditions, PROJECTION_READY, &c.reason, &c.message)
        }
        None => set.mark_unknown(
            &mut status.conditions,
            PROJECTION_READY,
            "ProjectionPending",
            "waiting for the projection to be reconciled",
        ),
    }
}

async fn publish(
    ctx: &BindingContext,
    binding: &ServiceBinding,
    type_: EventType,
    reason: &str,
    note: String,
) {
    ctx.events
        .publish(
            &binding.object_ref(&()),
            type_,
            reason,
            actions::RECONCILE,
            Some(note),
        )
        .await;
}

/// Whether `binding` resolves its service through the named resource
///
/// Versions are ignored: a binding written against one version of a
/// serviceable still follows the object when it is served under another.
pub fn references_service(
    binding: &ServiceBinding,
    api_version: &str,
    kind: &str,
    namespace: Option<&str>,
    name: &str,
) -> bool {
    let group = |v: &str| v.rsplit_once('/').map(|(g, _)| g.to_string()).unwrap_or_default();
    binding.metadata.namespace.as_deref() == namespace
        && binding.spec.service.as_ref().is_some_and(|svc| {
            svc.kind == kind && svc.name == name && group(&svc.api_version) == group(api_version)
        })
}

/// Error policy for the ServiceBinding controller
///
/// - Retryable errors (transient): requeue after 30 seconds
/// - Non-retryable errors (permanent): await spec change
pub fn error_policy(
    binding: Arc<ServiceBinding>,
    error: &ReconcileError,
    _ctx: Arc<BindingContext>,
) -> Action {
    error!(
        ?error,
        binding = %binding.name_any(),
        retryable = error.is_retryable(),
        "reconciliation failed"
    );

    if error.is_retryable() {
        Action::requeue(Duration::from_secs(REQUEUE_ERROR_SECS))
    } else {
        Action::await_change()
    }
}
