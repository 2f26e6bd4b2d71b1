//! Resources generated for a ServiceBinding
//!
//! A binding owns two children: the projected Secret (the service's secret
//! plus `type`, `provider` and derived mapping keys) and the
//! ServiceBindingProjection that mounts it into the application.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use k8s_openapi::ByteString;
use kube::api::ObjectMeta;
use kube::{Resource, ResourceExt};

use bindings_common::crd::{
    Mapping, SecretReference, ServiceBinding, ServiceBindingProjection,
    ServiceBindingProjectionSpec,
};
use bindings_common::{Error, Result, SERVICE_BINDING_LABEL};

use crate::template::TemplateEngine;

const TYPE_KEY: &str = "type";
const PROVIDER_KEY: &str = "provider";

/// Name of the projected Secret generated for a binding
pub fn projected_secret_name(binding: &str) -> String {
    format!("{binding}-projection")
}

/// Name of the ServiceBindingProjection generated for a binding
pub fn projection_name(binding: &str) -> String {
    binding.to_string()
}

/// Compute the projected secret data.
///
/// Starts from a copy of `reference`, sets `type` and `provider` when given,
/// then writes each mapping in order. Templated mapping values are rendered
/// against the data as it stands, so later mappings see earlier ones. Any
/// template failure aborts the whole build.
pub fn build_projected_data(
    binding_type: Option<&str>,
    provider: Option<&str>,
    mappings: &[Mapping],
    reference: &BTreeMap<String, ByteString>,
) -> Result<BTreeMap<String, ByteString>> {
    let mut data = reference.clone();

    if let Some(t) = binding_type.filter(|t| !t.is_empty()) {
        data.insert(TYPE_KEY.to_string(), ByteString(t.as_bytes().to_vec()));
    }
    if let Some(p) = provider.filter(|p| !p.is_empty()) {
        data.insert(PROVIDER_KEY.to_string(), ByteString(p.as_bytes().to_vec()));
    }

    let engine = TemplateEngine::new();
    for mapping in mappings {
        let value = if TemplateEngine::has_template_syntax(&mapping.value) {
            engine
                .render(&mapping.value, &stringify(&data))
                .map_err(|e| Error::template(&mapping.name, e.to_string()))?
        } else {
            mapping.value.clone()
        };
        data.insert(mapping.name.clone(), ByteString(value.into_bytes()));
    }

    Ok(data)
}

fn stringify(data: &BTreeMap<String, ByteString>) -> BTreeMap<String, String> {
    data.iter()
        .map(|(k, v)| (k.clone(), String::from_utf8_lossy(&v.0).into_owned()))
        .collect()
}

/// Labels on generated resources: the binding's labels plus the binding label
fn generated_labels(binding: &ServiceBinding) -> BTreeMap<String, String> {
    let mut labels = binding.labels().clone();
    labels.insert(SERVICE_BINDING_LABEL.to_string(), binding.name_any());
    labels
}

fn controller_ref(binding: &ServiceBinding) -> Result<OwnerReference> {
    binding.controller_owner_ref(&()).ok_or_else(|| {
        Error::internal_with_context(
            "owner-reference",
            format!("ServiceBinding {} has no uid", binding.name_any()),
        )
    })
}

/// Build the desired projected Secret for a binding
pub fn make_projected_secret(binding: &ServiceBinding, reference: &Secret) -> Result<Secret> {
    let data = build_projected_data(
        binding.spec.r#type.as_deref(),
        binding.spec.provider.as_deref(),
        &binding.spec.mappings,
        &reference.data.clone().unwrap_or_default(),
    )?;

    Ok(Secret {
        metadata: ObjectMeta {
            name: Some(projected_secret_name(&binding.name_any())),
            namespace: binding.namespace(),
            labels: Some(generated_labels(binding)),
            owner_references: Some(vec![controller_ref(binding)?]),
            ..Default::default()
        },
        type_: reference.type_.clone(),
        data: Some(data),
        ..Default::default()
    })
}

/// Build the desired ServiceBindingProjection for a binding whose secret is `secret_name`
pub fn make_projection(
    binding: &ServiceBinding,
    secret_name: &str,
) -> Result<ServiceBindingProjection> {
    let application = binding.spec.application.clone().ok_or_else(|| {
        Error::validation_for_field(binding.name_any(), "spec.application", "is required")
    })?;
    let annotations = binding.forwarded_annotations();

    let mut projection = ServiceBindingProjection::new(
        &projection_name(&binding.name_any()),
        ServiceBindingProjectionSpec {
            name: binding.binding_name().to_string(),
            r#type: binding.spec.r#type.clone().filter(|t| !t.is_empty()),
            provider: binding.spec.provider.clone().filter(|p| !p.is_empty()),
            binding: SecretReference {
                name: secret_name.to_string(),
            },
            application,
            env: binding.spec.env.clone(),
        },
    );
    projection.metadata.namespace = binding.namespace();
    projection.metadata.labels = Some(generated_labels(binding));
    projection.metadata.annotations = (!annotations.is_empty()).then_some(annotations);
    projection.metadata.owner_references = Some(vec![controller_ref(binding)?]);
    Ok(projection)
}

/// Whether `meta` names `binding` as its controller
pub fn is_controlled_by(meta: &ObjectMeta, binding: &ServiceBinding) -> bool {
    let Some(uid) = binding.meta().uid.as_deref() else {
        return false;
    };
    meta.owner_references
        .iter()
        .flatten()
        .any(|r| r.controller == Some(true) && r.uid == uid)
}

fn same_map(a: &Option<BTreeMap<String, String>>, b: &Option<BTreeMap<String, String>>) -> bool {
    a.as_ref().filter(|m| !m.is_empty()) == b.as_ref().filter(|m| !m.is_empty())
}

/// Whether an existing projected Secret already matches the desired one
pub fn secret_matches(desired: &Secret, existing: &Secret) -> bool {
    desired.type_ == existing.type_
        && desired.data.as_ref().filter(|d| !d.is_empty())
            == existing.data.as_ref().filter(|d| !d.is_empty())
        && same_map(&desired.metadata.labels, &existing.metadata.labels)
        && same_map(&desired.metadata.annotations, &existing.metadata.annotations)
}

/// Whether an existing projection already matches the desired one
pub fn projection_matches(
    desired: &ServiceBindingProjection,
    existing: &ServiceBindingProjection,
) -> bool {
    desired.spec == existing.spec
        && same_map(&desired.metadata.labels, &existing.metadata.labels)
        && same_map(&desired.metadata.annotations, &existing.metadata.annotations)
}

/// Carry the desired content onto an existing Secret, keeping the rest of its metadata
pub fn update_secret(mut existing: Secret, desired: Secret) -> Secret {
    existing.type_ = desired.type_;
    existing.data = desired.data;
    existing.metadata.labels = desired.metadata.labels;
    existing.metadata.annotations = desired.metadata.annotations;
    existing
}

/// Carry the desired content onto an existing projection, keeping the rest of its metadata
pub fn update_projection(
    mut existing: ServiceBindingProjection,
    desired: ServiceBindingProjection,
) -> ServiceBindingProjection {
    existing.spec = desired.spec;
    existing.metadata.labels = desired.metadata.labels;
    existing.metadata.annotations = desired.metadata.annotations;
    existing
}

#[cfg(test)]
mod tests {
    use bindings_common::crd::{ApplicationReference, ServiceBindingSpec, ServiceReference};

    use super::*;

    fn bytes(s: &str) -> ByteString {
        ByteString(s.as_bytes().to_vec())
    }

    fn data(pairs: &[(&str, &str)]) -> BTreeMap<String, ByteString> {
        pairs.iter().map(|(k, v)| (k.to_string(), bytes(v))).collect()
    }

    fn mapping(name: &str, value: &str) -> Mapping {
        Mapping {
            name: name.to_string(),
            value: value.to_string(),
        }
    }

    fn binding() -> ServiceBinding {
        let mut binding = ServiceBinding::new(
            "my-binding",
            ServiceBindingSpec {
                application: Some(ApplicationReference {
                    api_version: "apps/v1".to_string(),
                    kind: "Deployment".to_string(),
                    name: Some("my-app".to_string()),
                    ..Default::default()
                }),
                service: Some(ServiceReference {
                    api_version: "v1".to_string(),
                    kind: "Secret".to_string(),
                    name: "my-service".to_string(),
                    namespace: None,
                }),
                ..Default::default()
            },
        );
        binding.metadata.namespace = Some("my-namespace".to_string());
        binding.metadata.uid = Some("binding-uid".to_string());
        binding.metadata.labels = Some(BTreeMap::from([(
            "app".to_string(),
            "accounts".to_string(),
        )]));
        binding
    }

    // =========================================================================
    // Story: Projected secret data
    // =========================================================================

    #[test]
    fn story_empty_reference_projects_empty_data() {
        let out = build_projected_data(None, None, &[], &BTreeMap::new()).expect("build");
        assert!(out.is_empty());
    }

    #[test]
    fn story_existing_keys_are_preserved() {
        let reference = data(&[("username", "root"), ("password", "password1")]);
        let out = build_projected_data(None, None, &[], &reference).expect("build");
        assert_eq!(out, reference);
    }

    /// Story: type and provider are published as keys
    #[test]
    fn story_type_and_provider_are_added() {
        let reference = data(&[("type", "original"), ("username", "root")]);
        let out = build_projected_data(Some("mysql"), Some("bitnami"), &[], &reference)
            .expect("build");
        assert_eq!(
            out,
            data(&[
                ("type", "mysql"),
                ("provider", "bitnami"),
                ("username", "root")
            ])
        );

        let out = build_projected_data(Some(""), None, &[], &reference).expect("build");
        assert_eq!(out.get("type"), Some(&bytes("original")));
    }

    /// Story: Mappings derive new keys from existing ones, in order
    #[test]
    fn story_mappings_render_against_current_data() {
        let reference = data(&[("username", "root"), ("password", "password1")]);
        let mappings = vec![
            mapping("literal", "value"),
            mapping("credentials", "{{ .username }}:{{ .password }}"),
            mapping("url", "mysql://{{ .credentials }}@db"),
        ];
        let out = build_projected_data(None, None, &mappings, &reference).expect("build");

        assert_eq!(out.get("literal"), Some(&bytes("value")));
        assert_eq!(out.get("credentials"), Some(&bytes("root:password1")));
        assert_eq!(out.get("url"), Some(&bytes("mysql://root:password1@db")));
        assert_eq!(reference.len(), 2);
    }

    /// Story: A broken mapping fails the whole build and names the mapping
    #[test]
    fn story_invalid_mappings_fail() {
        let reference = data(&[("username", "root")]);

        let err = build_projected_data(None, None, &[mapping("bad", "{{  }")], &reference)
            .expect_err("parse failure");
        assert!(matches!(&err, Error::Template { mapping, .. } if mapping == "bad"));

        let err = build_projected_data(
            None,
            None,
            &[mapping("ok", "x"), mapping("exec", "{{ call .invalid }}")],
            &reference,
        )
        .expect_err("render failure");
        assert!(matches!(&err, Error::Template { mapping, .. } if mapping == "exec"));
    }

    // =========================================================================
    // Story: Generated resources
    // =========================================================================

    #[test]
    fn story_projected_secret_is_owned_and_labeled() {
        let mut binding = binding();
        binding.spec.r#type = Some("mysql".to_string());
        let reference = Secret {
            type_: Some("Opaque".to_string()),
            data: Some(data(&[("username", "root")])),
            ..Default::default()
        };

        let secret = make_projected_secret(&binding, &reference).expect("secret");
        assert_eq!(
            secret.metadata.name.as_deref(),
            Some("my-binding-projection")
        );
        assert_eq!(secret.metadata.namespace.as_deref(), Some("my-namespace"));
        assert_eq!(secret.type_.as_deref(), Some("Opaque"));
        let labels = secret.metadata.labels.clone().unwrap_or_default();
        assert_eq!(labels.get("app").map(String::as_str), Some("accounts"));
        assert_eq!(
            labels.get(SERVICE_BINDING_LABEL).map(String::as_str),
            Some("my-binding")
        );
        assert!(is_controlled_by(&secret.metadata, &binding));
        assert_eq!(
            secret.data.as_ref().and_then(|d| d.get("type")),
            Some(&bytes("mysql"))
        );
    }

    #[test]
    fn story_binding_without_uid_cannot_own_children() {
        let mut binding = binding();
        binding.metadata.uid = None;
        assert!(make_projected_secret(&binding, &Secret::default()).is_err());
        assert!(!is_controlled_by(&ObjectMeta::default(), &binding));
    }

    /// Story: The projection carries the resolved secret and forwarded annotations
    #[test]
    fn story_projection_mirrors_binding() {
        let mut binding = binding();
        binding.spec.name = Some("accounts-db".to_string());
        binding.spec.provider = Some("bitnami".to_string());
        binding.metadata.annotations = Some(BTreeMap::from([
            (
                "projection.service.binding/type".to_string(),
                "Custom".to_string(),
            ),
            ("example.com/other".to_string(), "x".to_string()),
        ]));

        let projection = make_projection(&binding, "my-binding-projection").expect("projection");
        assert_eq!(projection.metadata.name.as_deref(), Some("my-binding"));
        assert_eq!(projection.spec.name, "accounts-db");
        assert_eq!(projection.spec.binding.name, "my-binding-projection");
        assert_eq!(projection.spec.provider.as_deref(), Some("bitnami"));
        assert!(projection.is_custom_projection());
        assert_eq!(
            projection.metadata.annotations.as_ref().map(BTreeMap::len),
            Some(1)
        );
        assert!(is_controlled_by(&projection.metadata, &binding));
    }

    /// Story: Updates only happen when something we manage differs
    #[test]
    fn story_semantic_equality_ignores_unmanaged_metadata() {
        let binding = binding();
        let reference = Secret {
            data: Some(data(&[("username", "root")])),
            ..Default::default()
        };
        let desired = make_projected_secret(&binding, &reference).expect("secret");

        let mut existing = desired.clone();
        existing.metadata.resource_version = Some("7".to_string());
        existing.metadata.annotations = Some(BTreeMap::new());
        assert!(secret_matches(&desired, &existing));

        existing.data = Some(data(&[("username", "admin")]));
        assert!(!secret_matches(&desired, &existing));

        let updated = update_secret(existing, desired.clone());
        assert!(secret_matches(&desired, &updated));
        assert_eq!(updated.metadata.resource_version.as_deref(), Some("7"));

        let desired = make_projection(&binding, "s").expect("projection");
        let mut existing = desired.clone();
        existing.spec.binding.name = "other".to_string();
        assert!(!projection_matches(&desired, &existing));
        let updated = update_projection(existing, desired.clone());
        assert!(projection_matches(&desired, &updated));
    }
}
