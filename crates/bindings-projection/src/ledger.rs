//! Annotation ledger
//!
//! The only durable memory the engine has. On the owning resource:
//! - `LedgerKey(identity)` → comma-separated names of the volumes injected
//!   for that binding
//! - `internal.service.binding/binding-root` → containers where the engine
//!   introduced `SERVICE_BINDING_ROOT`
//!
//! On the pod template, `LedgerKey(identity)-type` / `-provider` hold the
//! override values that env vars and volume files read through the
//! downward API.
//!
//! Missing annotation maps read as empty. Maps and entries emptied by a
//! removal collapse back to absent.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::LazyLock;

use k8s_openapi::api::core::v1::{EnvVar, PodSpec, Volume};
use kube::api::ObjectMeta;
use regex::Regex;

use bindings_common::{BINDING_ROOT_ANNOTATION, LEDGER_KEY_PREFIX};

use crate::naming;

/// Field paths of override env vars written by any binding
static OVERRIDE_FIELD_PATH: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(
        r"^metadata\.annotations\['{}[0-9a-f]+-(type|provider)'\]$",
        regex::escape(LEDGER_KEY_PREFIX)
    ))
    .expect("override field path pattern is hardcoded and valid")
});

/// Ledger keys of any binding
static LEDGER_KEY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!("^{}[0-9a-f]+$", regex::escape(LEDGER_KEY_PREFIX)))
        .expect("ledger key pattern is hardcoded and valid")
});

/// Read an annotation, treating a missing map as empty
pub fn annotation<'a>(meta: &'a ObjectMeta, key: &str) -> Option<&'a str> {
    meta.annotations
        .as_ref()
        .and_then(|a| a.get(key))
        .map(String::as_str)
}

/// Set an annotation, creating the map when needed
pub fn set_annotation(meta: &mut ObjectMeta, key: impl Into<String>, value: impl Into<String>) {
    meta.annotations
        .get_or_insert_with(BTreeMap::new)
        .insert(key.into(), value.into());
}

/// Remove an annotation, dropping the map when the removal emptied it
pub fn remove_annotation(meta: &mut ObjectMeta, key: &str) -> Option<String> {
    let annotations = meta.annotations.as_mut()?;
    let removed = annotations.remove(key);
    if removed.is_some() && annotations.is_empty() {
        meta.annotations = None;
    }
    removed
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Record the volumes injected for `identity`
pub fn record_injection(owner: &mut ObjectMeta, identity: &str, volume_names: &[String]) {
    set_annotation(owner, naming::ledger_key(identity), volume_names.join(","));
}

/// Record type/provider overrides on the pod template.
///
/// Nothing is written when neither is set.
pub fn record_overrides(
    template: &mut ObjectMeta,
    identity: &str,
    binding_type: Option<&str>,
    provider: Option<&str>,
) {
    if let Some(t) = binding_type {
        set_annotation(template, naming::type_annotation_key(identity), t);
    }
    if let Some(p) = provider {
        set_annotation(template, naming::provider_annotation_key(identity), p);
    }
}

/// Volume names (or, for older entries, secret names) recorded for `identity`
pub fn find_prior_injection(owner: &ObjectMeta, identity: &str) -> Option<Vec<String>> {
    annotation(owner, &naming::ledger_key(identity)).map(split_list)
}

/// Entries recorded by every binding except `identity`
pub fn recorded_by_others(owner: &ObjectMeta, identity: &str) -> BTreeSet<String> {
    let own_key = naming::ledger_key(identity);
    owner
        .annotations
        .iter()
        .flatten()
        .filter(|(k, _)| k.as_str() != own_key && LEDGER_KEY.is_match(k))
        .flat_map(|(_, v)| split_list(v))
        .collect()
}

/// Whether a volume is named, directly or through its secret, in `entries`
pub fn is_recorded(volume: &Volume, entries: &BTreeSet<String>) -> bool {
    entries.contains(&volume.name)
        || volume_secret_names(volume)
            .iter()
            .any(|secret| entries.contains(secret))
}

/// Delete the override annotations for `identity`
pub fn clear_overrides(template: &mut ObjectMeta, identity: &str) {
    remove_annotation(template, &naming::type_annotation_key(identity));
    remove_annotation(template, &naming::provider_annotation_key(identity));
}

/// Delete the ledger entry and both override annotations for `identity`
pub fn clear_injection(owner: &mut ObjectMeta, template: Option<&mut ObjectMeta>, identity: &str) {
    remove_annotation(owner, &naming::ledger_key(identity));
    if let Some(template) = template {
        clear_overrides(template, identity);
    }
}

/// Secret names a volume reads from
pub fn volume_secret_names(volume: &Volume) -> Vec<String> {
    let mut names = Vec::new();
    if let Some(name) = volume.secret.as_ref().and_then(|s| s.secret_name.clone()) {
        names.push(name);
    }
    if let Some(sources) = volume.projected.as_ref().and_then(|p| p.sources.as_ref()) {
        names.extend(
            sources
                .iter()
                .filter_map(|s| s.secret.as_ref())
                .map(|s| s.name.clone()),
        );
    }
    names
}

/// Everything currently injected by any binding on a workload
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct InjectedSet {
    /// Names of injected volumes
    pub volumes: BTreeSet<String>,
    /// Secrets backing the injected volumes
    pub secrets: BTreeSet<String>,
}

impl InjectedSet {
    /// Whether an env var was written by some binding
    pub fn is_injected_env(&self, env: &EnvVar) -> bool {
        let Some(source) = env.value_from.as_ref() else {
            return false;
        };
        if let Some(secret_ref) = source.secret_key_ref.as_ref() {
            return self.secrets.contains(&secret_ref.name);
        }
        source
            .field_ref
            .as_ref()
            .is_some_and(|f| is_override_field_path(&f.field_path))
    }
}

/// Scan every ledger entry on the owner and resolve the injected secrets
/// through the pod spec's volumes
pub fn injected_secrets_and_volumes(owner: &ObjectMeta, spec: Option<&PodSpec>) -> InjectedSet {
    let volumes: BTreeSet<String> = owner
        .annotations
        .iter()
        .flatten()
        .filter(|(k, _)| LEDGER_KEY.is_match(k))
        .flat_map(|(_, v)| split_list(v))
        .collect();

    let secrets = spec
        .and_then(|s| s.volumes.as_ref())
        .into_iter()
        .flatten()
        .filter(|v| volumes.contains(&v.name))
        .flat_map(volume_secret_names)
        .collect();

    InjectedSet { volumes, secrets }
}

/// Whether a downward API field path points at an override annotation
pub fn is_override_field_path(field_path: &str) -> bool {
    OVERRIDE_FIELD_PATH.is_match(field_path)
}

/// A container addressed by list and name
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum ContainerSlot {
    /// Entry of `spec.containers`
    Regular(String),
    /// Entry of `spec.initContainers`
    Init(String),
}

impl ContainerSlot {
    fn parse(entry: &str) -> Option<Self> {
        match entry.split_once('/') {
            Some(("initContainers", name)) => Some(Self::Init(name.to_string())),
            Some(("containers", name)) => Some(Self::Regular(name.to_string())),
            _ => None,
        }
    }

    /// Container name
    pub fn name(&self) -> &str {
        match self {
            Self::Init(n) | Self::Regular(n) => n,
        }
    }
}

impl fmt::Display for ContainerSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Init(n) => write!(f, "initContainers/{n}"),
            Self::Regular(n) => write!(f, "containers/{n}"),
        }
    }
}

/// Containers where the engine added `SERVICE_BINDING_ROOT`
pub fn root_env_slots(owner: &ObjectMeta) -> BTreeSet<ContainerSlot> {
    annotation(owner, BINDING_ROOT_ANNOTATION)
        .map(split_list)
        .unwrap_or_default()
        .iter()
        .filter_map(|e| ContainerSlot::parse(e))
        .collect()
}

fn write_root_env_slots(owner: &mut ObjectMeta, slots: &BTreeSet<ContainerSlot>) {
    if slots.is_empty() {
        remove_annotation(owner, BINDING_ROOT_ANNOTATION);
    } else {
        let value = slots
            .iter()
            .map(ContainerSlot::to_string)
            .collect::<Vec<_>>()
            .join(",");
        set_annotation(owner, BINDING_ROOT_ANNOTATION, value);
    }
}

/// Remember that the engine added `SERVICE_BINDING_ROOT` to a container
pub fn record_root_env(owner: &mut ObjectMeta, slot: ContainerSlot) {
    let mut slots = root_env_slots(owner);
    if slots.insert(slot) {
        write_root_env_slots(owner, &slots);
    }
}

/// Forget a container recorded by [`record_root_env`]
pub fn clear_root_env(owner: &mut ObjectMeta, slot: &ContainerSlot) {
    let mut slots = root_env_slots(owner);
    if slots.remove(slot) {
        write_root_env_slots(owner, &slots);
    }
}
