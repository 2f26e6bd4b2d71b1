//! Kubernetes Event recording for binding controllers.
//!
//! Events are fire-and-forget: failures are logged as warnings and never
//! propagate errors. A failed event must never break reconciliation.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{EventType, Recorder, Reporter};
use kube::Client;
use tracing::warn;

/// Trait for publishing Kubernetes Events.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish a Kubernetes Event on the given resource.
    ///
    /// # Arguments
    ///
    /// * `resource_ref` - The Kubernetes object this event is about
    /// * `type_` - Normal or Warning
    /// * `reason` - Machine-readable reason string (e.g. "Created")
    /// * `action` - What action was taken (e.g. "Reconcile")
    /// * `note` - Optional human-readable message
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    );
}

/// Production implementation wrapping `kube::runtime::events::Recorder`.
pub struct KubeEventPublisher {
    recorder: Recorder,
}

impl KubeEventPublisher {
    /// Create a new publisher reporting as `controller_name`
    pub fn new(client: Client, controller_name: &str) -> Self {
        let reporter = Reporter {
            controller: controller_name.to_string(),
            instance: None,
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        let event = kube::runtime::events::Event {
            type_,
            reason: reason.to_string(),
            note,
            action: action.to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, resource_ref).await {
            warn!(reason, action, error = %e, "failed to publish Kubernetes event");
        }
    }
}

/// No-op implementation for tests.
pub struct NoopEventPublisher;

#[async_trait]
impl EventPublisher for NoopEventPublisher {
    async fn publish(
        &self,
        _resource_ref: &ObjectReference,
        _type_: EventType,
        _reason: &str,
        _action: &str,
        _note: Option<String>,
    ) {
    }
}

/// Well-known event reason strings.
pub mod reasons {
    /// A generated resource was created
    pub const CREATED: &str = "Created";
    /// A generated resource was updated to match the binding
    pub const UPDATED: &str = "Updated";
    /// Creating a generated resource failed
    pub const CREATION_FAILED: &str = "CreationFailed";
    /// A generated resource name is controlled by someone else
    pub const OWNERSHIP_CONFLICT: &str = "OwnershipConflict";
    /// The binding was fully reconciled
    pub const RECONCILED: &str = "ServiceBindingReconciled";
    /// The binding was projected into a workload
    pub const PROJECTED: &str = "Projected";
    /// The binding was removed from a workload
    pub const UNPROJECTED: &str = "Unprojected";
    /// Spec validation failed
    pub const VALIDATION_FAILED: &str = "ValidationFailed";
}

/// Well-known event action strings.
pub mod actions {
    /// Standard reconciliation loop
    pub const RECONCILE: &str = "Reconcile";
    /// Mutating a workload pod template
    pub const PROJECT: &str = "Project";
    /// Cleaning up on deletion
    pub const DELETE: &str = "Delete";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn noop_publisher_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<NoopEventPublisher>();
        assert_send_sync::<KubeEventPublisher>();
    }

    #[test]
    fn reason_constants_are_pascal_case() {
        for reason in [
            reasons::CREATED,
            reasons::UPDATED,
            reasons::CREATION_FAILED,
            reasons::OWNERSHIP_CONFLICT,
            reasons::PROJECTED,
        ] {
            assert!(reason.chars().next().is_some_and(char::is_uppercase));
            assert!(!reason.contains(' '));
        }
    }

    #[tokio::test]
    async fn noop_publisher_does_not_panic() {
        let publisher = NoopEventPublisher;
        publisher
            .publish(
                &ObjectReference::default(),
                EventType::Normal,
                reasons::CREATED,
                actions::RECONCILE,
                Some("test".to_string()),
            )
            .await;
    }
}
