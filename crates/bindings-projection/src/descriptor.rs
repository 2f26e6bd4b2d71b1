//! Binding descriptor
//!
//! The immutable intent for one reconcile pass: which secret to mount,
//! under which name, into which containers, with which extra env vars.
//! Built fresh every time from the projection resource.

use bindings_common::crd::{EnvMapping, ServiceBindingProjection};
use bindings_common::{Error, Result};

use crate::naming;
use crate::selector::TargetSelector;

/// Engine phase name used in errors raised while checking the descriptor
pub const PHASE_DESCRIPTOR: &str = "descriptor";

/// Env mapping key resolved from the binding type
pub const TYPE_KEY: &str = "type";

/// Env mapping key resolved from the binding provider
pub const PROVIDER_KEY: &str = "provider";

/// Everything the engine needs to project one binding
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BindingDescriptor {
    identity: String,
    secret_name: String,
    mount_name: String,
    binding_type: Option<String>,
    provider: Option<String>,
    env: Vec<EnvMapping>,
    targets: TargetSelector,
    custom_projection: bool,
}

impl BindingDescriptor {
    /// Create a descriptor mounting `secret_name` under the binding's own name
    pub fn new(identity: impl Into<String>, secret_name: impl Into<String>) -> Self {
        let identity = identity.into();
        Self {
            mount_name: identity.clone(),
            identity,
            secret_name: secret_name.into(),
            binding_type: None,
            provider: None,
            env: Vec::new(),
            targets: TargetSelector::all(),
            custom_projection: false,
        }
    }

    /// Build the descriptor for a projection resource
    pub fn from_projection(projection: &ServiceBindingProjection) -> Result<Self> {
        let identity = projection
            .metadata
            .name
            .clone()
            .ok_or_else(|| Error::projection_in_phase("", PHASE_DESCRIPTOR, "resource has no name"))?;

        let descriptor = Self::new(identity, projection.spec.binding.name.clone())
            .with_mount_name(projection.spec.name.clone())
            .with_type(projection.spec.r#type.clone())
            .with_provider(projection.spec.provider.clone())
            .with_env(projection.spec.env.clone())
            .with_targets(TargetSelector::new(
                projection.spec.application.containers.clone(),
            ))
            .with_custom_projection(projection.is_custom_projection());
        descriptor.validate()?;
        Ok(descriptor)
    }

    /// Set the directory name under the mount root; empty keeps the default
    pub fn with_mount_name(mut self, mount_name: impl Into<String>) -> Self {
        let mount_name = mount_name.into();
        if !mount_name.is_empty() {
            self.mount_name = mount_name;
        }
        self
    }

    /// Set the binding type override
    pub fn with_type(mut self, binding_type: Option<String>) -> Self {
        self.binding_type = binding_type.filter(|t| !t.is_empty());
        self
    }

    /// Set the binding provider override
    pub fn with_provider(mut self, provider: Option<String>) -> Self {
        self.provider = provider.filter(|p| !p.is_empty());
        self
    }

    /// Set the env var mappings
    pub fn with_env(mut self, env: Vec<EnvMapping>) -> Self {
        self.env = env;
        self
    }

    /// Set the targeted containers
    pub fn with_targets(mut self, targets: TargetSelector) -> Self {
        self.targets = targets;
        self
    }

    /// Mark the projection as handled by a third party
    pub fn with_custom_projection(mut self, custom: bool) -> Self {
        self.custom_projection = custom;
        self
    }

    /// Reject descriptors the engine cannot act on
    pub fn validate(&self) -> Result<()> {
        if self.identity.is_empty() {
            return Err(Error::projection_in_phase(
                "",
                PHASE_DESCRIPTOR,
                "binding identity is empty",
            ));
        }
        if self.secret_name.is_empty() {
            return Err(Error::projection_in_phase(
                &self.identity,
                PHASE_DESCRIPTOR,
                "secret reference is empty",
            ));
        }
        if self.mount_name.contains('/') {
            return Err(Error::projection_in_phase(
                &self.identity,
                PHASE_DESCRIPTOR,
                format!("mount name '{}' must not contain '/'", self.mount_name),
            ));
        }
        for (i, e) in self.env.iter().enumerate() {
            if e.name.is_empty() || e.key.is_empty() {
                return Err(Error::projection_in_phase(
                    &self.identity,
                    PHASE_DESCRIPTOR,
                    format!("env[{i}] needs both name and key"),
                ));
            }
        }
        Ok(())
    }

    /// Stable binding identity
    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Secret mounted into the workload
    pub fn secret_name(&self) -> &str {
        &self.secret_name
    }

    /// Directory name under the mount root
    pub fn mount_name(&self) -> &str {
        &self.mount_name
    }

    /// Binding type override
    pub fn binding_type(&self) -> Option<&str> {
        self.binding_type.as_deref()
    }

    /// Binding provider override
    pub fn provider(&self) -> Option<&str> {
        self.provider.as_deref()
    }

    /// Env var mappings, in declaration order
    pub fn env(&self) -> &[EnvMapping] {
        &self.env
    }

    /// Targeted containers
    pub fn targets(&self) -> &TargetSelector {
        &self.targets
    }

    /// Whether Apply is handed to a third party
    pub fn is_custom_projection(&self) -> bool {
        self.custom_projection
    }

    /// Whether type or provider is overridden
    pub fn has_overrides(&self) -> bool {
        self.binding_type.is_some() || self.provider.is_some()
    }

    /// Ledger annotation key for this binding
    pub fn ledger_key(&self) -> String {
        naming::ledger_key(&self.identity)
    }

    /// Volume name for this binding's secret
    pub fn volume_name(&self) -> String {
        naming::volume_name(&self.secret_name)
    }
}

#[cfg(test)]
mod tests {
    use bindings_common::crd::{ContainerTarget, ServiceBindingProjectionSpec, SecretReference};

    use super::*;

    #[test]
    fn story_mount_name_defaults_to_identity() {
        let d = BindingDescriptor::new("my-binding", "my-secret");
        assert_eq!(d.mount_name(), "my-binding");
        assert!(d.targets().is_all());
        assert!(!d.has_overrides());

        let d = d.with_mount_name("").with_type(Some(String::new()));
        assert_eq!(d.mount_name(), "my-binding");
        assert_eq!(d.binding_type(), None);
    }

    /// Story: Malformed input is rejected before anything is touched
    #[test]
    fn story_descriptor_validation() {
        let err = BindingDescriptor::new("my-binding", "")
            .validate()
            .expect_err("no secret");
        assert!(err.to_string().contains("secret reference is empty"));
        assert!(err.to_string().contains("during descriptor"));

        assert!(BindingDescriptor::new("", "s").validate().is_err());
        assert!(BindingDescriptor::new("b", "s")
            .with_mount_name("a/b")
            .validate()
            .is_err());
        assert!(BindingDescriptor::new("b", "s")
            .with_env(vec![EnvMapping {
                name: "X".to_string(),
                key: String::new(),
            }])
            .validate()
            .is_err());
    }

    #[test]
    fn story_descriptor_from_projection() {
        let mut projection = ServiceBindingProjection::new(
            "my-binding",
            ServiceBindingProjectionSpec {
                name: "my-binding-name".to_string(),
                r#type: Some("mysql".to_string()),
                binding: SecretReference {
                    name: "my-secret".to_string(),
                },
                ..Default::default()
            },
        );
        projection.spec.application.containers = vec![ContainerTarget::Index(1)];

        let d = BindingDescriptor::from_projection(&projection).expect("descriptor");
        assert_eq!(d.identity(), "my-binding");
        assert_eq!(d.secret_name(), "my-secret");
        assert_eq!(d.mount_name(), "my-binding-name");
        assert_eq!(d.binding_type(), Some("mysql"));
        assert!(d.has_overrides());
        assert!(d.targets().matches_container(1, "any"));
        assert!(!d.targets().matches_container(0, "any"));
        assert_eq!(
            d.volume_name(),
            "binding-5c5a15a8b0b3e154d77746945e563ba40100681b"
        );
    }
}
