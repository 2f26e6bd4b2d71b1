//! Container targeting
//!
//! An empty target list selects every container. Indices only ever address
//! the regular container list; init containers are matched by name.

use bindings_common::crd::ContainerTarget;

/// Which containers of a pod spec receive the binding
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TargetSelector {
    targets: Vec<ContainerTarget>,
}

impl TargetSelector {
    /// Select every container
    pub fn all() -> Self {
        Self::default()
    }

    /// Select the given containers
    pub fn new(targets: Vec<ContainerTarget>) -> Self {
        Self { targets }
    }

    /// Whether every container is selected
    pub fn is_all(&self) -> bool {
        self.targets.is_empty()
    }

    /// Whether the regular container at `index` named `name` is selected
    pub fn matches_container(&self, index: usize, name: &str) -> bool {
        self.is_all()
            || self.targets.iter().any(|t| match t {
                ContainerTarget::Index(i) => *i as usize == index,
                ContainerTarget::Name(n) => n == name,
            })
    }

    /// Whether the init container named `name` is selected
    pub fn matches_init_container(&self, name: &str) -> bool {
        self.is_all()
            || self
                .targets
                .iter()
                .any(|t| matches!(t, ContainerTarget::Name(n) if n == name))
    }
}
