//! ProvisionedService CRD
//!
//! The minimal "serviceable" resource: it points at an existing Secret and
//! republishes that reference under `status.binding` where resolvers look.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{Condition, SecretReference};
use crate::Error;

/// ProvisionedService exposes an existing Secret as a bindable service.
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "bindings.labs.vmware.com",
    version = "v1alpha1",
    kind = "ProvisionedService",
    namespaced,
    status = "ProvisionedServiceStatus",
    printcolumn = r#"{"name":"Secret","type":"string","jsonPath":".status.binding.name"}"#,
    printcolumn = r#"{"name":"Ready","type":"string","jsonPath":".status.conditions[?(@.type==\"Ready\")].status"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ProvisionedServiceSpec {
    /// Secret holding the service's binding data
    pub binding: SecretReference,
}

/// ProvisionedService status
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProvisionedServiceStatus {
    /// Generation most recently reconciled
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Current conditions
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// Published binding secret
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub binding: Option<SecretReference>,
}

impl ProvisionedService {
    /// Validate the service
    pub fn validate(&self) -> Result<(), Error> {
        if self.spec.binding.name.is_empty() {
            return Err(Error::validation_for_field(
                self.metadata.name.as_deref().unwrap_or_default(),
                "spec.binding.name",
                "is required",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn story_provisioned_service_points_at_secret() {
        let yaml = r#"
apiVersion: bindings.labs.vmware.com/v1alpha1
kind: ProvisionedService
metadata:
  name: account-db
spec:
  binding:
    name: account-db-credentials
"#;
        let service: ProvisionedService = serde_yaml::from_str(yaml).expect("parse");
        assert!(service.validate().is_ok());
        assert_eq!(service.spec.binding.name, "account-db-credentials");
        assert!(service.status.is_none());
    }

    #[test]
    fn story_empty_binding_name_is_rejected() {
        let service = ProvisionedService::new("db", ProvisionedServiceSpec::default());
        let err = service.validate().expect_err("empty binding");
        assert!(err.to_string().contains("spec.binding.name"));
    }
}
