//! ServiceBindingProjection CRD
//!
//! Internal resource created by the ServiceBinding reconciler once the
//! projected secret exists. It carries everything the projection engine
//! needs and nothing it has to resolve.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{validate_env, ApplicationReference, Condition, EnvMapping, SecretReference};
use crate::{Error, CUSTOM_PROJECTION_ANNOTATION, CUSTOM_PROJECTION_VALUE};

/// Condition: the application workload was found and mutated
pub const APPLICATION_AVAILABLE: &str = "ApplicationAvailable";

/// ServiceBindingProjection mounts a resolved secret into a workload.
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "internal.service.binding",
    version = "v1alpha2",
    kind = "ServiceBindingProjection",
    namespaced,
    status = "ServiceBindingProjectionStatus",
    printcolumn = r#"{"name":"Ready","type":"string","jsonPath":".status.conditions[?(@.type==\"Ready\")].status"}"#,
    printcolumn = r#"{"name":"Reason","type":"string","jsonPath":".status.conditions[?(@.type==\"Ready\")].reason"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ServiceBindingProjectionSpec {
    /// Directory name of the binding under the mount root
    pub name: String,

    /// Binding type override
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub r#type: Option<String>,

    /// Binding provider override
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,

    /// Secret to mount
    pub binding: SecretReference,

    /// Workload receiving the binding
    pub application: ApplicationReference,

    /// Environment variables to populate from the binding
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<EnvMapping>,
}

/// ServiceBindingProjection status
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ServiceBindingProjectionStatus {
    /// Generation most recently reconciled
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Current conditions
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

impl ServiceBindingProjection {
    /// Whether a third party has taken over projection for this resource
    pub fn is_custom_projection(&self) -> bool {
        self.metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(CUSTOM_PROJECTION_ANNOTATION))
            .is_some_and(|v| v == CUSTOM_PROJECTION_VALUE)
    }

    /// Validate the projection
    pub fn validate(&self) -> Result<(), Error> {
        let owner = self.metadata.name.as_deref().unwrap_or_default();
        if self.spec.name.is_empty() {
            return Err(Error::validation_for_field(owner, "spec.name", "is required"));
        }
        if self.spec.binding.name.is_empty() {
            return Err(Error::validation_for_field(
                owner,
                "spec.binding",
                "is required",
            ));
        }
        self.spec.application.validate(owner, "spec.application")?;
        validate_env(owner, &self.spec.env)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;

    const PROJECTION_YAML: &str = r#"
apiVersion: internal.service.binding/v1alpha2
kind: ServiceBindingProjection
metadata:
  name: my-binding
  namespace: default
spec:
  name: my-binding-name
  binding:
    name: my-secret
  application:
    apiVersion: apps/v1
    kind: Deployment
    name: my-app
    containers: [1]
  env:
  - name: TYPE
    key: type
"#;

    fn parse() -> ServiceBindingProjection {
        serde_yaml::from_str(PROJECTION_YAML).expect("parse")
    }

    #[test]
    fn story_projection_yaml_parses_and_validates() {
        let projection = parse();
        assert!(projection.validate().is_ok());
        assert_eq!(projection.spec.binding.name, "my-secret");
        assert!(!projection.is_custom_projection());
    }

    /// Story: Marking a projection Custom hands it to a third party
    #[test]
    fn story_custom_projection_marker() {
        let mut projection = parse();
        projection.metadata.annotations = Some(BTreeMap::from([(
            CUSTOM_PROJECTION_ANNOTATION.to_string(),
            CUSTOM_PROJECTION_VALUE.to_string(),
        )]));
        assert!(projection.is_custom_projection());

        projection.metadata.annotations = Some(BTreeMap::from([(
            CUSTOM_PROJECTION_ANNOTATION.to_string(),
            "Default".to_string(),
        )]));
        assert!(!projection.is_custom_projection());
    }

    #[test]
    fn story_projection_requires_binding_secret() {
        let mut projection = parse();
        projection.spec.binding.name.clear();
        let err = projection.validate().expect_err("no secret");
        assert!(err.to_string().contains("spec.binding"));

        let mut projection = parse();
        projection.spec.name.clear();
        assert!(projection.validate().is_err());
    }
}
