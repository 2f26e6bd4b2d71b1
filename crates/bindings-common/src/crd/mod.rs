//! Custom Resource Definitions for service bindings
//!
//! `ServiceBinding` is the user-facing intent, `ServiceBindingProjection` is
//! the internal resource the projection engine acts on, and
//! `ProvisionedService` is the simplest resource a binding can point at.

mod projection;
mod provisioned_service;
mod service_binding;
mod types;

pub use projection::{
    ServiceBindingProjection, ServiceBindingProjectionSpec, ServiceBindingProjectionStatus,
    APPLICATION_AVAILABLE,
};
pub use provisioned_service::{
    ProvisionedService, ProvisionedServiceSpec, ProvisionedServiceStatus,
};
pub use service_binding::{
    ServiceBinding, ServiceBindingSpec, ServiceBindingStatus, PROJECTION_READY,
    SERVICE_AVAILABLE,
};
pub use types::{
    ApplicationReference, Condition, ConditionStatus, ContainerTarget, EnvMapping, LabelSelector,
    Mapping, SecretReference, ServiceReference, validate_env,
};
