//! CRD installation
//!
//! The operator applies its own CRDs on startup with server-side apply so
//! the installed schema always matches the running version.

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Api, Patch, PatchParams};
use kube::{Client, CustomResourceExt};

use bindings_common::crd::{ProvisionedService, ServiceBinding, ServiceBindingProjection};
use bindings_common::FIELD_MANAGER;

/// Every CRD served by the operator
fn all_crds() -> Vec<CustomResourceDefinition> {
    vec![
        ServiceBinding::crd(),
        ServiceBindingProjection::crd(),
        ProvisionedService::crd(),
    ]
}

/// All CRDs as a multi-document YAML stream
pub fn render_crds() -> anyhow::Result<String> {
    let docs = all_crds()
        .iter()
        .map(|crd| {
            serde_yaml::to_string(crd)
                .map_err(|e| anyhow::anyhow!("failed to serialize CRD: {}", e))
        })
        .collect::<anyhow::Result<Vec<_>>>()?;
    Ok(docs.join("---\n"))
}

/// Ensure all CRDs are installed
pub async fn ensure_crds_installed(client: &Client) -> anyhow::Result<()> {
    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(FIELD_MANAGER).force();

    for crd in all_crds() {
        let name = crd.metadata.name.clone().unwrap_or_default();
        tracing::info!(crd = %name, "installing CRD");
        crds.patch(&name, &params, &Patch::Apply(&crd))
            .await
            .map_err(|e| anyhow::anyhow!("failed to install {} CRD: {}", name, e))?;
    }

    tracing::info!("all CRDs installed/updated");
    Ok(())
}
