//! Kubernetes access for the binding reconcilers
//!
//! Everything the reconcilers read or write goes through [`BindingKubeClient`]
//! so reconciliation can be exercised against a mock.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use kube::api::{
    Api, ApiResource, DynamicObject, ListParams, Patch, PatchParams, PostParams, TypeMeta,
};
use kube::core::gvk::GroupVersion;
use kube::Client;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use bindings_common::crd::{
    ApplicationReference, ProvisionedService, ProvisionedServiceStatus, ServiceBinding,
    ServiceBindingProjection, ServiceBindingProjectionStatus, ServiceBindingStatus,
    ServiceReference,
};
use bindings_common::{Error, FIELD_MANAGER, PROJECTION_FINALIZER};

/// Trait abstracting Kubernetes client operations for the binding reconcilers
#[cfg_attr(test, automock)]
#[async_trait]
pub trait BindingKubeClient: Send + Sync {
    /// Get a Secret by name
    async fn get_secret(&self, name: &str, namespace: &str) -> Result<Option<Secret>, Error>;

    /// Create a Secret
    async fn create_secret(&self, namespace: &str, secret: &Secret) -> Result<Secret, Error>;

    /// Replace an existing Secret
    async fn replace_secret(&self, namespace: &str, secret: &Secret) -> Result<Secret, Error>;

    /// Get a ServiceBindingProjection by name
    async fn get_projection(
        &self,
        name: &str,
        namespace: &str,
    ) -> Result<Option<ServiceBindingProjection>, Error>;

    /// Create a ServiceBindingProjection
    async fn create_projection(
        &self,
        namespace: &str,
        projection: &ServiceBindingProjection,
    ) -> Result<ServiceBindingProjection, Error>;

    /// Replace an existing ServiceBindingProjection
    async fn replace_projection(
        &self,
        namespace: &str,
        projection: &ServiceBindingProjection,
    ) -> Result<ServiceBindingProjection, Error>;

    /// Patch the status of a ServiceBinding
    async fn patch_binding_status(
        &self,
        name: &str,
        namespace: &str,
        status: &ServiceBindingStatus,
    ) -> Result<(), Error>;

    /// Patch the status of a ServiceBindingProjection
    async fn patch_projection_status(
        &self,
        name: &str,
        namespace: &str,
        status: &ServiceBindingProjectionStatus,
    ) -> Result<(), Error>;

    /// Patch the status of a ProvisionedService
    async fn patch_provisioned_service_status(
        &self,
        name: &str,
        namespace: &str,
        status: &ProvisionedServiceStatus,
    ) -> Result<(), Error>;

    /// Add the projection finalizer if missing
    async fn add_projection_finalizer(&self, name: &str, namespace: &str) -> Result<(), Error>;

    /// Remove the projection finalizer if present
    async fn remove_projection_finalizer(&self, name: &str, namespace: &str)
        -> Result<(), Error>;

    /// Fetch the object behind a service reference, `None` when it does not exist
    async fn get_service(
        &self,
        namespace: &str,
        service: &ServiceReference,
    ) -> Result<Option<DynamicObject>, Error>;

    /// Fetch the workloads an application reference points at
    ///
    /// A named reference yields at most one workload; a selector yields every
    /// match.
    async fn list_workloads(
        &self,
        namespace: &str,
        application: &ApplicationReference,
    ) -> Result<Vec<DynamicObject>, Error>;

    /// Apply a JSON patch to a workload
    async fn patch_workload(
        &self,
        namespace: &str,
        application: &ApplicationReference,
        name: &str,
        patch: &json_patch::Patch,
    ) -> Result<(), Error>;
}

/// Real Kubernetes client implementation
pub struct BindingKubeClientImpl {
    client: Client,
}

impl BindingKubeClientImpl {
    /// Create a new client wrapper
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Resolve `apiVersion` + `kind` to a served resource through discovery
    async fn discover(&self, api_version: &str, kind: &str) -> Result<ApiResource, Error> {
        let reference = format!("{api_version}/{kind}");
        let gvk = api_version
            .parse::<GroupVersion>()
            .map_err(|e| Error::resolution(&reference, e.to_string()))?
            .with_kind(kind);
        let (resource, _caps) = kube::discovery::pinned_kind(&self.client, &gvk)
            .await
            .map_err(|e| Error::resolution(&reference, e.to_string()))?;
        debug!(api_version, kind, plural = %resource.plural, "discovered resource");
        Ok(resource)
    }

    async fn set_projection_finalizers(
        &self,
        name: &str,
        namespace: &str,
        present: bool,
    ) -> Result<(), Error> {
        let api: Api<ServiceBindingProjection> = Api::namespaced(self.client.clone(), namespace);
        let Some(projection) = api.get_opt(name).await? else {
            return Ok(());
        };

        let mut finalizers = projection.metadata.finalizers.unwrap_or_default();
        let has = finalizers.iter().any(|f| f == PROJECTION_FINALIZER);
        if has == present {
            return Ok(());
        }
        if present {
            finalizers.push(PROJECTION_FINALIZER.to_string());
        } else {
            finalizers.retain(|f| f != PROJECTION_FINALIZER);
        }

        let patch = serde_json::json!({
            "metadata": {
                "finalizers": finalizers,
                "resourceVersion": projection.metadata.resource_version,
            }
        });
        api.patch(
            name,
            &PatchParams::apply(FIELD_MANAGER),
            &Patch::Merge(&patch),
        )
        .await?;
        Ok(())
    }
}

#[async_trait]
impl BindingKubeClient for BindingKubeClientImpl {
    async fn get_secret(&self, name: &str, namespace: &str) -> Result<Option<Secret>, Error> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        match api.get(name).await {
            Ok(secret) => Ok(Some(secret)),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn create_secret(&self, namespace: &str, secret: &Secret) -> Result<Secret, Error> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.create(&PostParams::default(), secret).await?)
    }

    async fn replace_secret(&self, namespace: &str, secret: &Secret) -> Result<Secret, Error> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        let name = secret.metadata.name.as_deref().unwrap_or_default();
        Ok(api.replace(name, &PostParams::default(), secret).await?)
    }

    async fn get_projection(
        &self,
        name: &str,
        namespace: &str,
    ) -> Result<Option<ServiceBindingProjection>, Error> {
        let api: Api<ServiceBindingProjection> = Api::namespaced(self.client.clone(), namespace);
        match api.get(name).await {
            Ok(projection) => Ok(Some(projection)),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn create_projection(
        &self,
        namespace: &str,
        projection: &ServiceBindingProjection,
    ) -> Result<ServiceBindingProjection, Error> {
        let api: Api<ServiceBindingProjection> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.create(&PostParams::default(), projection).await?)
    }

    async fn replace_projection(
        &self,
        namespace: &str,
        projection: &ServiceBindingProjection,
    ) -> Result<ServiceBindingProjection, Error> {
        let api: Api<ServiceBindingProjection> = Api::namespaced(self.client.clone(), namespace);
        let name = projection.metadata.name.as_deref().unwrap_or_default();
        Ok(api.replace(name, &PostParams::default(), projection).await?)
    }

    async fn patch_binding_status(
        &self,
        name: &str,
        namespace: &str,
        status: &ServiceBindingStatus,
    ) -> Result<(), Error> {
        let api: Api<ServiceBinding> = Api::namespaced(self.client.clone(), namespace);
        let status_patch = serde_json::json!({ "status": status });
        api.patch_status(
            name,
            &PatchParams::apply(FIELD_MANAGER),
            &Patch::Merge(&status_patch),
        )
        .await?;
        Ok(())
    }

    async fn patch_projection_status(
        &self,
        name: &str,
        namespace: &str,
        status: &ServiceBindingProjectionStatus,
    ) -> Result<(), Error> {
        let api: Api<ServiceBindingProjection> = Api::namespaced(self.client.clone(), namespace);
        let status_patch = serde_json::json!({ "status": status });
        api.patch_status(
            name,
            &PatchParams::apply(FIELD_MANAGER),
            &Patch::Merge(&status_patch),
        )
        .await?;
        Ok(())
    }

    async fn patch_provisioned_service_status(
        &self,
        name: &str,
        namespace: &str,
        status: &ProvisionedServiceStatus,
    ) -> Result<(), Error> {
        let api: Api<ProvisionedService> = Api::namespaced(self.client.clone(), namespace);
        let status_patch = serde_json::json!({ "status": status });
        api.patch_status(
            name,
            &PatchParams::apply(FIELD_MANAGER),
            &Patch::Merge(&status_patch),
        )
        .await?;
        Ok(())
    }

    async fn add_projection_finalizer(&self, name: &str, namespace: &str) -> Result<(), Error> {
        self.set_projection_finalizers(name, namespace, true).await
    }

    async fn remove_projection_finalizer(
        &self,
        name: &str,
        namespace: &str,
    ) -> Result<(), Error> {
        self.set_projection_finalizers(name, namespace, false).await
    }

    async fn get_service(
        &self,
        namespace: &str,
        service: &ServiceReference,
    ) -> Result<Option<DynamicObject>, Error> {
        let resource = self.discover(&service.api_version, &service.kind).await?;
        let api: Api<DynamicObject> =
            Api::namespaced_with(self.client.clone(), namespace, &resource);
        Ok(api.get_opt(&service.name).await?)
    }

    async fn list_workloads(
        &self,
        namespace: &str,
        application: &ApplicationReference,
    ) -> Result<Vec<DynamicObject>, Error> {
        let resource = self
            .discover(&application.api_version, &application.kind)
            .await?;
        let api: Api<DynamicObject> =
            Api::namespaced_with(self.client.clone(), namespace, &resource);

        let items = if let Some(name) = application.name.as_deref().filter(|n| !n.is_empty()) {
            api.get_opt(name).await?.into_iter().collect()
        } else {
            let selector = application
                .selector
                .as_ref()
                .map(|s| s.to_selector_string())
                .unwrap_or_default();
            api.list(&ListParams::default().labels(&selector))
                .await?
                .items
        };

        // List items arrive without apiVersion/kind
        Ok(items
            .into_iter()
            .map(|mut obj| {
                obj.types = Some(TypeMeta {
                    api_version: resource.api_version.clone(),
                    kind: resource.kind.clone(),
                });
                obj
            })
            .collect())
    }

    async fn patch_workload(
        &self,
        namespace: &str,
        application: &ApplicationReference,
        name: &str,
        patch: &json_patch::Patch,
    ) -> Result<(), Error> {
        let resource = self
            .discover(&application.api_version, &application.kind)
            .await?;
        let api: Api<DynamicObject> =
            Api::namespaced_with(self.client.clone(), namespace, &resource);
        api.patch(
            name,
            &PatchParams::apply(FIELD_MANAGER),
            &Patch::<()>::Json(patch.clone()),
        )
        .await?;
        Ok(())
    }
}
