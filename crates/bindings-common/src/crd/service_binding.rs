//! ServiceBinding CRD
//!
//! The user-facing declaration that a workload should receive the
//! credentials of a service.

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{
    validate_env, ApplicationReference, Condition, EnvMapping, Mapping, SecretReference,
    ServiceReference,
};
use crate::{Error, SERVICE_BINDING_GROUP};

/// Condition: the service resolved to a secret that exists
pub const SERVICE_AVAILABLE: &str = "ServiceAvailable";

/// Condition: the projection into the application is ready
pub const PROJECTION_READY: &str = "ProjectionReady";

/// ServiceBinding connects an application workload to a service's secret.
///
/// Example:
/// ```yaml
/// apiVersion: service.binding/v1alpha2
/// kind: ServiceBinding
/// metadata:
///   name: account-db
/// spec:
///   type: mysql
///   application:
///     apiVersion: apps/v1
///     kind: Deployment
///     name: account-service
///   service:
///     apiVersion: bindings.labs.vmware.com/v1alpha1
///     kind: ProvisionedService
///     name: account-db
///   env:
///   - name: DB_USER
///     key: username
///   mappings:
///   - name: url
///     value: "mysql://{{ .username }}:{{ .password }}@{{ .host }}/accounts"
/// ```
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "service.binding",
    version = "v1alpha2",
    kind = "ServiceBinding",
    namespaced,
    status = "ServiceBindingStatus",
    shortname = "bind",
    printcolumn = r#"{"name":"Ready","type":"string","jsonPath":".status.conditions[?(@.type==\"Ready\")].status"}"#,
    printcolumn = r#"{"name":"Reason","type":"string","jsonPath":".status.conditions[?(@.type==\"Ready\")].reason"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ServiceBindingSpec {
    /// Directory name of the binding under the mount root (defaults to the resource name)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Binding type exposed to the application (e.g., "mysql")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub r#type: Option<String>,

    /// Binding provider exposed to the application (e.g., "bitnami")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,

    /// Workload receiving the binding
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub application: Option<ApplicationReference>,

    /// Service providing the binding secret
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<ServiceReference>,

    /// Environment variables to populate from the binding
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<EnvMapping>,

    /// Extra keys derived from the service secret
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mappings: Vec<Mapping>,
}

/// ServiceBinding status
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ServiceBindingStatus {
    /// Generation most recently reconciled
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Current conditions
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// The projected secret mounted into the application
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub binding: Option<SecretReference>,
}

impl ServiceBinding {
    /// Fill defaulted fields: `spec.name` falls back to the resource name
    pub fn set_defaults(&mut self) {
        if self.spec.name.as_deref().is_none_or(str::is_empty) {
            self.spec.name = self.metadata.name.clone();
        }
    }

    /// Validate the binding
    pub fn validate(&self) -> Result<(), Error> {
        let owner = self.metadata.name.as_deref().unwrap_or_default();

        match &self.spec.application {
            Some(app) => app.validate(owner, "spec.application")?,
            None => {
                return Err(Error::validation_for_field(
                    owner,
                    "spec.application",
                    "is required",
                ))
            }
        }

        match &self.spec.service {
            Some(svc) => {
                if svc.namespace.as_deref().is_some_and(|ns| !ns.is_empty()) {
                    return Err(Error::validation_for_field(
                        owner,
                        "spec.service.namespace",
                        "must not be set",
                    ));
                }
                if svc.api_version.is_empty() || svc.kind.is_empty() {
                    return Err(Error::validation_for_field(
                        owner,
                        "spec.service",
                        "apiVersion and kind are required",
                    ));
                }
                if svc.name.is_empty() {
                    return Err(Error::validation_for_field(
                        owner,
                        "spec.service.name",
                        "is required",
                    ));
                }
            }
            None => {
                return Err(Error::validation_for_field(
                    owner,
                    "spec.service",
                    "is required",
                ))
            }
        }

        validate_env(owner, &self.spec.env)?;

        for (i, m) in self.spec.mappings.iter().enumerate() {
            if m.name.is_empty() {
                return Err(Error::validation_for_field(
                    owner,
                    format!("spec.mappings[{i}].name"),
                    "is required",
                ));
            }
        }

        Ok(())
    }

    /// Mount directory name, after defaulting
    pub fn binding_name(&self) -> &str {
        self.spec
            .name
            .as_deref()
            .filter(|n| !n.is_empty())
            .or(self.metadata.name.as_deref())
            .unwrap_or_default()
    }

    /// Annotations forwarded to generated resources: those in our API group
    pub fn forwarded_annotations(&self) -> BTreeMap<String, String> {
        self.metadata
            .annotations
            .iter()
            .flatten()
            .filter(|(k, _)| k.contains(SERVICE_BINDING_GROUP))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BINDING_YAML: &str = r#"
apiVersion: service.binding/v1alpha2
kind: ServiceBinding
metadata:
  name: account-db
  namespace: default
  annotations:
    projection.service.binding/type: Custom
    unrelated.example.com/note: keep-out
spec:
  type: mysql
  application:
    apiVersion: apps/v1
    kind: Deployment
    name: account-service
    containers: [0, sidecar]
  service:
    apiVersion: bindings.labs.vmware.com/v1alpha1
    kind: ProvisionedService
    name: account-db
  env:
  - name: DB_USER
    key: username
  mappings:
  - name: url
    value: "{{ .username }}@db"
"#;

    fn parse() -> ServiceBinding {
        serde_yaml::from_str(BINDING_YAML).expect("parse")
    }

    /// Story: A well formed binding parses and validates
    #[test]
    fn story_binding_yaml_round_trips_through_validation() {
        let binding = parse();
        assert!(binding.validate().is_ok());
        assert_eq!(binding.spec.r#type.as_deref(), Some("mysql"));
        assert_eq!(
            binding
                .spec
                .application
                .as_ref()
                .map(|a| a.containers.len()),
            Some(2)
        );
        assert_eq!(binding.spec.mappings[0].name, "url");
    }

    /// Story: The mount name defaults to the binding's own name
    #[test]
    fn story_defaulting_fills_spec_name() {
        let mut binding = parse();
        assert_eq!(binding.binding_name(), "account-db");
        binding.set_defaults();
        assert_eq!(binding.spec.name.as_deref(), Some("account-db"));

        binding.spec.name = Some("custom".to_string());
        binding.set_defaults();
        assert_eq!(binding.binding_name(), "custom");
    }

    #[test]
    fn story_missing_application_and_service_are_rejected() {
        let mut binding = parse();
        binding.spec.application = None;
        let err = binding.validate().expect_err("no application");
        assert!(err.to_string().contains("spec.application"));

        let mut binding = parse();
        binding.spec.service = None;
        let err = binding.validate().expect_err("no service");
        assert!(err.to_string().contains("spec.service"));

        let mut binding = parse();
        if let Some(svc) = binding.spec.service.as_mut() {
            svc.name = String::new();
        }
        let err = binding.validate().expect_err("no service name");
        assert!(err.to_string().contains("spec.service.name"));
    }

    #[test]
    fn story_service_namespace_is_disallowed() {
        let mut binding = parse();
        if let Some(svc) = binding.spec.service.as_mut() {
            svc.namespace = Some("elsewhere".to_string());
        }
        let err = binding.validate().expect_err("namespace");
        assert!(err.to_string().contains("spec.service.namespace"));
    }

    /// Story: Only our own annotations travel to the projection
    #[test]
    fn story_only_group_annotations_are_forwarded() {
        let binding = parse();
        let forwarded = binding.forwarded_annotations();
        assert_eq!(forwarded.len(), 1);
        assert_eq!(
            forwarded.get("projection.service.binding/type"),
            Some(&"Custom".to_string())
        );
    }
}
