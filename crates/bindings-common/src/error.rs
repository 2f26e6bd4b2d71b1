//! Error types for service binding operations
//!
//! Errors carry the binding they concern plus enough context (phase,
//! container, field path, service reference) for a reconciler to turn them
//! into a useful status condition or Kubernetes event.

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for service binding operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// A resource spec failed validation
    #[error("validation error for {binding}{}: {message}", field_suffix(.field))]
    Validation {
        /// Name of the resource with invalid configuration
        binding: String,
        /// The invalid field path (e.g., "spec.service.name")
        field: Option<String>,
        /// Description of what's invalid
        message: String,
    },

    /// The projection engine rejected its input
    #[error("projection error for {binding} during {phase}{}: {message}", container_suffix(.container))]
    Projection {
        /// Binding identity being projected
        binding: String,
        /// Engine phase (descriptor, undo, apply-volume, apply-container)
        phase: String,
        /// Container being mutated, when the failure is container scoped
        container: Option<String>,
        /// Description of what failed
        message: String,
    },

    /// A secret mapping template failed to parse or render
    #[error("template error in mapping {mapping}: {message}")]
    Template {
        /// Name of the mapping whose template failed
        mapping: String,
        /// Renderer message
        message: String,
    },

    /// The referenced service does not exist (yet)
    #[error("service {reference} not found")]
    ServiceNotFound {
        /// The service reference, formatted as `apiVersion/kind/name`
        reference: String,
    },

    /// The referenced service exists but does not publish a binding secret yet
    #[error("service {reference} not ready: {message}")]
    ServiceNotReady {
        /// The service reference
        reference: String,
        /// Why the service cannot be resolved yet
        message: String,
    },

    /// The referenced service cannot be resolved
    #[error("failed to resolve service {reference}: {message}")]
    Resolution {
        /// The service reference
        reference: String,
        /// Description of what failed
        message: String,
    },

    /// A generated resource exists but is controlled by someone else
    #[error("{binding} does not own {kind} {name}")]
    Ownership {
        /// Binding that expected to own the resource
        binding: String,
        /// Kind of the conflicting resource
        kind: String,
        /// Name of the conflicting resource
        name: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
        /// The resource kind being serialized (if known)
        kind: Option<String>,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "reconciler", "discovery")
        context: String,
    },
}

fn field_suffix(field: &Option<String>) -> String {
    field
        .as_deref()
        .map(|f| format!(" ({f})"))
        .unwrap_or_default()
}

fn container_suffix(container: &Option<String>) -> String {
    container
        .as_deref()
        .map(|c| format!(" in container {c}"))
        .unwrap_or_default()
}

impl Error {
    /// Create a validation error with binding context
    pub fn validation_for(binding: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            binding: binding.into(),
            field: None,
            message: msg.into(),
        }
    }

    /// Create a validation error with binding context and field path
    pub fn validation_for_field(
        binding: impl Into<String>,
        field: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Validation {
            binding: binding.into(),
            field: Some(field.into()),
            message: msg.into(),
        }
    }

    /// Create a projection error for an engine phase
    pub fn projection_in_phase(
        binding: impl Into<String>,
        phase: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Projection {
            binding: binding.into(),
            phase: phase.into(),
            container: None,
            message: msg.into(),
        }
    }

    /// Create a projection error scoped to a single container
    pub fn projection_in_container(
        binding: impl Into<String>,
        phase: impl Into<String>,
        container: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Projection {
            binding: binding.into(),
            phase: phase.into(),
            container: Some(container.into()),
            message: msg.into(),
        }
    }

    /// Create a template error for a named mapping
    pub fn template(mapping: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Template {
            mapping: mapping.into(),
            message: msg.into(),
        }
    }

    /// Create a hard resolution error
    pub fn resolution(reference: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Resolution {
            reference: reference.into(),
            message: msg.into(),
        }
    }

    /// Create an ownership conflict error
    pub fn ownership(
        binding: impl Into<String>,
        kind: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self::Ownership {
            binding: binding.into(),
            kind: kind.into(),
            name: name.into(),
        }
    }

    /// Create a serialization error with resource kind context
    pub fn serialization_for_kind(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: Some(kind.into()),
        }
    }

    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: UNKNOWN_CONTEXT.to_string(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Check if this error is retryable
    ///
    /// Validation, projection, template and ownership errors need a spec or
    /// cluster fix and are not retried. A missing or not-yet-ready service is
    /// retried; so are transient Kubernetes errors.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => !matches!(
                source,
                kube::Error::Api(ae) if (400..500).contains(&ae.code) && ae.code != 404 && ae.code != 409
            ),
            Error::Validation { .. } => false,
            Error::Projection { .. } => false,
            Error::Template { .. } => false,
            Error::ServiceNotFound { .. } => true,
            Error::ServiceNotReady { .. } => true,
            Error::Resolution { .. } => false,
            Error::Ownership { .. } => false,
            Error::Serialization { .. } => false,
            Error::Internal { .. } => true,
        }
    }

    /// True when the error means "the service is not available yet"
    pub fn is_service_unavailable(&self) -> bool {
        matches!(
            self,
            Error::ServiceNotFound { .. } | Error::ServiceNotReady { .. }
        )
    }

    /// Get the binding name if this error is associated with a specific binding
    pub fn binding(&self) -> Option<&str> {
        match self {
            Error::Validation { binding, .. } => Some(binding),
            Error::Projection { binding, .. } => Some(binding),
            Error::Ownership { binding, .. } => Some(binding),
            _ => None,
        }
    }

    /// Machine-readable reason used for status conditions and events
    pub fn reason(&self) -> &'static str {
        match self {
            Error::Kube { .. } => "KubernetesError",
            Error::Validation { .. } => "ValidationFailed",
            Error::Projection { .. } => "ProjectionFailed",
            Error::Template { .. } => "TemplateFailed",
            Error::ServiceNotFound { .. } => "ServiceNotFound",
            Error::ServiceNotReady { .. } => "ServiceNotReady",
            Error::Resolution { .. } => "ResolutionFailed",
            Error::Ownership { .. } => "OwnershipConflict",
            Error::Serialization { .. } => "SerializationFailed",
            Error::Internal { .. } => "InternalError",
        }
    }
}
