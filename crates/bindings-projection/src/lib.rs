//! Binding projection engine
//!
//! Computes the pod template delta that mounts a binding secret into a
//! workload, and the exact inverse of that delta. The engine is pure: it
//! mutates the document it is handed and keeps all of its memory in the
//! document's own annotations.
//!
//! - [`naming`]: deterministic, length-bounded volume names and ledger keys
//! - [`ledger`]: the annotation bookkeeping that makes Undo stateless
//! - [`descriptor`]: the per-reconcile binding intent
//! - [`engine`]: `apply` / `remove`
//! - [`workload`]: adapters exposing workload kinds as pod template documents

#![deny(missing_docs)]

pub mod descriptor;
pub mod engine;
pub mod ledger;
pub mod naming;
pub mod ordering;
pub mod selector;
pub mod workload;

pub use descriptor::BindingDescriptor;
pub use engine::{apply, remove};
pub use selector::TargetSelector;
pub use workload::{DynamicWorkload, PodTemplateDocument};
