//! Serviceable resolution
//!
//! A binding's `spec.service` is either a Secret or any resource that
//! publishes its secret's name at `status.binding.name`.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use bindings_common::crd::ServiceReference;
use bindings_common::Error;

use crate::client::BindingKubeClient;

/// Resolves a service reference to the name of the Secret holding its binding
#[async_trait]
pub trait ServiceResolver: Send + Sync {
    /// Name of the binding Secret for `service` in `namespace`
    async fn secret_name(&self, namespace: &str, service: &ServiceReference)
        -> Result<String, Error>;
}

/// Resolver backed by the Kubernetes API
pub struct KubeServiceResolver {
    kube: Arc<dyn BindingKubeClient>,
}

impl KubeServiceResolver {
    /// Create a resolver reading services through `kube`
    pub fn new(kube: Arc<dyn BindingKubeClient>) -> Self {
        Self { kube }
    }
}

#[async_trait]
impl ServiceResolver for KubeServiceResolver {
    async fn secret_name(
        &self,
        namespace: &str,
        service: &ServiceReference,
    ) -> Result<String, Error> {
        if service.is_secret() {
            return Ok(service.name.clone());
        }

        let reference = service.to_string();
        let Some(object) = self.kube.get_service(namespace, service).await? else {
            return Err(Error::ServiceNotFound { reference });
        };

        match object
            .data
            .pointer("/status/binding/name")
            .and_then(|v| v.as_str())
            .filter(|name| !name.is_empty())
        {
            Some(name) => {
                debug!(service = %reference, secret = %name, "resolved service");
                Ok(name.to_string())
            }
            None => Err(Error::ServiceNotReady {
                reference,
                message: "status.binding.name is not set".to_string(),
            }),
        }
    }
}
