//! Shared types used across the binding CRDs

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use schemars::gen::SchemaGenerator;
use schemars::schema::{Schema, SchemaObject};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::Error;

/// Reference to a Secret in the same namespace
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct SecretReference {
    /// Secret name
    pub name: String,
}

/// Label selector limited to equality matches
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LabelSelector {
    /// Labels that must match
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub match_labels: BTreeMap<String, String>,
}

impl LabelSelector {
    /// Render as a Kubernetes list selector string (`a=b,c=d`)
    pub fn to_selector_string(&self) -> String {
        self.match_labels
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(",")
    }
}

/// A container targeted by a binding: a name, or an index into `containers`
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum ContainerTarget {
    /// Zero-based index into the regular container list
    Index(u32),
    /// Container name (regular or init)
    Name(String),
}

impl JsonSchema for ContainerTarget {
    fn schema_name() -> String {
        "ContainerTarget".to_string()
    }

    fn is_referenceable() -> bool {
        false
    }

    fn json_schema(_: &mut SchemaGenerator) -> Schema {
        let mut schema = SchemaObject::default();
        schema.extensions.insert(
            "x-kubernetes-int-or-string".to_string(),
            serde_json::Value::Bool(true),
        );
        Schema::Object(schema)
    }
}

impl std::fmt::Display for ContainerTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Index(i) => write!(f, "{i}"),
            Self::Name(n) => write!(f, "{n}"),
        }
    }
}

/// The workload a binding projects into
///
/// Either `name` or `selector` identifies the workload(s). `namespace` is
/// accepted on the wire only so validation can reject it.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationReference {
    /// API version of the workload (e.g., "apps/v1")
    pub api_version: String,

    /// Kind of the workload (e.g., "Deployment")
    pub kind: String,

    /// Name of the workload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Must be empty; bindings are namespace local
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,

    /// Select workloads by label instead of name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<LabelSelector>,

    /// Containers to bind into; all containers when empty
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub containers: Vec<ContainerTarget>,
}

impl ApplicationReference {
    /// Validate the reference, reporting errors under `path`
    pub fn validate(&self, owner: &str, path: &str) -> Result<(), Error> {
        if self.api_version.is_empty() {
            return Err(Error::validation_for_field(
                owner,
                format!("{path}.apiVersion"),
                "is required",
            ));
        }
        if self.kind.is_empty() {
            return Err(Error::validation_for_field(
                owner,
                format!("{path}.kind"),
                "is required",
            ));
        }
        if self.namespace.as_deref().is_some_and(|ns| !ns.is_empty()) {
            return Err(Error::validation_for_field(
                owner,
                format!("{path}.namespace"),
                "must not be set",
            ));
        }
        match (&self.name, &self.selector) {
            (Some(name), None) if !name.is_empty() => Ok(()),
            (None, Some(selector)) if !selector.match_labels.is_empty() => Ok(()),
            (Some(_), Some(_)) => Err(Error::validation_for_field(
                owner,
                path,
                "expected exactly one of name or selector",
            )),
            _ => Err(Error::validation_for_field(
                owner,
                format!("{path}.name"),
                "name or selector is required",
            )),
        }
    }
}

/// The service a binding resolves its secret from
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ServiceReference {
    /// API version of the service (e.g., "v1")
    pub api_version: String,

    /// Kind of the service (e.g., "Secret")
    pub kind: String,

    /// Name of the service
    #[serde(default)]
    pub name: String,

    /// Must be empty; bindings are namespace local
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

impl ServiceReference {
    /// Whether this reference points directly at a Secret
    pub fn is_secret(&self) -> bool {
        self.api_version == "v1" && self.kind == "Secret"
    }
}

impl std::fmt::Display for ServiceReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.api_version, self.kind, self.name)
    }
}

/// An environment variable sourced from a key of the binding secret
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct EnvMapping {
    /// Environment variable name
    pub name: String,
    /// Secret key (or `type` / `provider`)
    pub key: String,
}

/// A derived key written into the projected secret
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct Mapping {
    /// Key to write
    pub name: String,
    /// Literal value or template rendered against the secret's data
    pub value: String,
}

/// Validate a list of env mappings: names and keys required, names unique
pub fn validate_env(owner: &str, env: &[EnvMapping]) -> Result<(), Error> {
    let mut seen: BTreeMap<&str, usize> = BTreeMap::new();
    for (i, e) in env.iter().enumerate() {
        if e.name.is_empty() {
            return Err(Error::validation_for_field(
                owner,
                format!("spec.env[{i}].name"),
                "is required",
            ));
        }
        if e.key.is_empty() {
            return Err(Error::validation_for_field(
                owner,
                format!("spec.env[{i}].key"),
                "is required",
            ));
        }
        if let Some(first) = seen.insert(e.name.as_str(), i) {
            return Err(Error::validation_for_field(
                owner,
                format!("spec.env[{i}].name"),
                format!("duplicates spec.env[{first}].name"),
            ));
        }
    }
    Ok(())
}

/// Condition status following Kubernetes conventions
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ConditionStatus {
    /// Condition is true
    True,
    /// Condition is false
    False,
    /// Condition status is unknown
    #[default]
    Unknown,
}

impl std::fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::True => write!(f, "True"),
            Self::False => write!(f, "False"),
            Self::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Kubernetes-style condition for status reporting
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Type of condition (e.g., Ready, ServiceAvailable)
    #[serde(rename = "type")]
    pub type_: String,

    /// Status of the condition (True, False, Unknown)
    pub status: ConditionStatus,

    /// Machine-readable reason for the condition
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,

    /// Human-readable message
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,

    /// Last time the condition transitioned
    pub last_transition_time: DateTime<Utc>,
}

impl Condition {
    /// Create a new condition with the current timestamp
    pub fn new(
        type_: impl Into<String>,
        status: ConditionStatus,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            type_: type_.into(),
            status,
            reason: reason.into(),
            message: message.into(),
            last_transition_time: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn app(name: Option<&str>) -> ApplicationReference {
        ApplicationReference {
            api_version: "apps/v1".to_string(),
            kind: "Deployment".to_string(),
            name: name.map(str::to_string),
            ..Default::default()
        }
    }

    #[test]
    fn story_container_targets_parse_as_int_or_string() {
        let targets: Vec<ContainerTarget> =
            serde_yaml::from_str("[1, app, \"sidecar\"]").expect("parse");
        assert_eq!(
            targets,
            vec![
                ContainerTarget::Index(1),
                ContainerTarget::Name("app".to_string()),
                ContainerTarget::Name("sidecar".to_string()),
            ]
        );
        assert_eq!(targets[0].to_string(), "1");
    }

    #[test]
    fn story_application_reference_requires_name_or_selector() {
        assert!(app(Some("web")).validate("b", "spec.application").is_ok());

        let err = app(None)
            .validate("b", "spec.application")
            .expect_err("missing name");
        assert!(err.to_string().contains("spec.application.name"));

        let mut by_selector = app(None);
        by_selector.selector = Some(LabelSelector {
            match_labels: BTreeMap::from([("app".to_string(), "web".to_string())]),
        });
        assert!(by_selector.validate("b", "spec.application").is_ok());
        assert_eq!(
            by_selector
                .selector
                .as_ref()
                .map(LabelSelector::to_selector_string),
            Some("app=web".to_string())
        );

        let mut both = app(Some("web"));
        both.selector = by_selector.selector.clone();
        assert!(both.validate("b", "spec.application").is_err());
    }

    #[test]
    fn story_application_reference_rejects_namespace() {
        let mut reference = app(Some("web"));
        reference.namespace = Some("other".to_string());
        let err = reference
            .validate("b", "spec.application")
            .expect_err("namespace set");
        assert!(err.to_string().contains("spec.application.namespace"));
    }

    #[test]
    fn story_env_mappings_must_be_complete_and_unique() {
        let ok = vec![
            EnvMapping {
                name: "USER".to_string(),
                key: "username".to_string(),
            },
            EnvMapping {
                name: "TYPE".to_string(),
                key: "type".to_string(),
            },
        ];
        assert!(validate_env("b", &ok).is_ok());

        let missing_key = vec![EnvMapping {
            name: "USER".to_string(),
            key: String::new(),
        }];
        let err = validate_env("b", &missing_key).expect_err("missing key");
        assert!(err.to_string().contains("spec.env[0].key"));

        let dup = vec![ok[0].clone(), ok[0].clone()];
        let err = validate_env("b", &dup).expect_err("duplicate");
        assert!(err.to_string().contains("spec.env[1].name"));
        assert!(err.to_string().contains("spec.env[0].name"));
    }

    #[test]
    fn story_secret_service_reference_is_detected() {
        let secret = ServiceReference {
            api_version: "v1".to_string(),
            kind: "Secret".to_string(),
            name: "db".to_string(),
            namespace: None,
        };
        assert!(secret.is_secret());
        assert_eq!(secret.to_string(), "v1/Secret/db");

        let other = ServiceReference {
            api_version: "bindings.labs.vmware.com/v1alpha1".to_string(),
            kind: "ProvisionedService".to_string(),
            name: "db".to_string(),
            namespace: None,
        };
        assert!(!other.is_secret());
    }
}
