//! Common types for service bindings: CRDs, errors, conditions and telemetry

#![deny(missing_docs)]

pub mod conditions;
pub mod crd;
pub mod error;
pub mod events;
pub mod telemetry;

pub use conditions::ConditionSet;
pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// API group of the user-facing ServiceBinding resource
pub const SERVICE_BINDING_GROUP: &str = "service.binding";

/// API group of the internal projection resource
pub const INTERNAL_GROUP: &str = "internal.service.binding";

/// Prefix shared by every ledger annotation key written on a workload
pub const LEDGER_KEY_PREFIX: &str = "internal.service.binding/projection-";

/// Owner annotation listing containers that received `SERVICE_BINDING_ROOT` from us
pub const BINDING_ROOT_ANNOTATION: &str = "internal.service.binding/binding-root";

/// Annotation marking a projection as managed by a third party
pub const CUSTOM_PROJECTION_ANNOTATION: &str = "projection.service.binding/type";

/// Value of [`CUSTOM_PROJECTION_ANNOTATION`] that disables our Apply phase
pub const CUSTOM_PROJECTION_VALUE: &str = "Custom";

/// Label placed on resources generated for a ServiceBinding
pub const SERVICE_BINDING_LABEL: &str = "service.binding/servicebinding";

/// Environment variable naming the directory bindings are mounted under
pub const SERVICE_BINDING_ROOT_ENV: &str = "SERVICE_BINDING_ROOT";

/// Mount root used when a container does not set [`SERVICE_BINDING_ROOT_ENV`]
pub const DEFAULT_BINDING_ROOT: &str = "/bindings";

/// Kubernetes limit for label values, volume names and annotation name segments
pub const MAX_NAME_LENGTH: usize = 63;

/// Finalizer placed on ServiceBindingProjections so Undo runs before deletion
pub const PROJECTION_FINALIZER: &str = "servicebindingprojections.internal.service.binding";

/// Field manager used for server-side apply and patches
pub const FIELD_MANAGER: &str = "service-bindings-controller";

/// Requeue interval after a successful reconcile
pub const REQUEUE_SUCCESS_SECS: u64 = 300;

/// Requeue interval while waiting for a service or secret to appear
pub const REQUEUE_WAITING_SECS: u64 = 10;

/// Requeue interval after a retryable error
pub const REQUEUE_ERROR_SECS: u64 = 30;
