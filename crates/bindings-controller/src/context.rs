//! Shared reconciler context

use std::sync::Arc;
use std::time::Duration;

use kube::Client;

use bindings_common::events::{EventPublisher, KubeEventPublisher};
#[cfg(test)]
use bindings_common::events::NoopEventPublisher;

use crate::client::{BindingKubeClient, BindingKubeClientImpl};
use crate::resolver::{KubeServiceResolver, ServiceResolver};

/// Name reported on Kubernetes events
pub const CONTROLLER_NAME: &str = "service-bindings-controller";

/// Context shared by the binding reconcilers
pub struct BindingContext {
    /// Kubernetes client for reading and writing resources
    pub kube: Arc<dyn BindingKubeClient>,
    /// Resolves service references to secret names
    pub resolver: Arc<dyn ServiceResolver>,
    /// Event publisher for emitting Kubernetes Events
    pub events: Arc<dyn EventPublisher>,
    /// Requeue interval after a successful reconcile
    pub resync: Duration,
}

impl BindingContext {
    /// Create a context from a Kubernetes client
    pub fn from_client(client: Client, resync: Duration) -> Self {
        let kube: Arc<dyn BindingKubeClient> = Arc::new(BindingKubeClientImpl::new(client.clone()));
        Self {
            resolver: Arc::new(KubeServiceResolver::new(kube.clone())),
            kube,
            events: Arc::new(KubeEventPublisher::new(client, CONTROLLER_NAME)),
            resync,
        }
    }

    /// Create a context for testing with a mock client
    #[cfg(test)]
    pub fn for_testing(kube: Arc<dyn BindingKubeClient>) -> Self {
        Self {
            resolver: Arc::new(KubeServiceResolver::new(kube.clone())),
            kube,
            events: Arc::new(NoopEventPublisher),
            resync: Duration::from_secs(bindings_common::REQUEUE_SUCCESS_SECS),
        }
    }
}
