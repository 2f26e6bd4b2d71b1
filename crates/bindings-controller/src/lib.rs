//! Reconcilers for the service binding resources
//!
//! - **ServiceBinding**: resolves the referenced service, materializes the
//!   projected Secret and hands off to a ServiceBindingProjection
//! - **ServiceBindingProjection**: mounts the Secret into the application
//!   and undoes the mount when the projection goes away
//! - **ProvisionedService**: publishes an existing Secret as a serviceable

#![deny(missing_docs)]

pub mod client;
pub mod context;
pub mod error;
pub mod patch;
pub mod projection;
pub mod provisioned_service;
pub mod resolver;
pub mod resources;
pub mod service_binding;
pub mod template;

pub use client::{BindingKubeClient, BindingKubeClientImpl};
pub use context::{BindingContext, CONTROLLER_NAME};
pub use error::ReconcileError;
pub use resolver::{KubeServiceResolver, ServiceResolver};
