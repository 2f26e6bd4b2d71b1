//! Apply and Undo
//!
//! `apply` always starts with `remove`, so the result depends only on the
//! descriptor and on what other bindings and the user put there. Undo finds
//! its work through the ledger, never through the descriptor's current
//! secret, so a binding that switched secrets still cleans up the old one.
//!
//! Both phases keep every entry they did not create in its original slot;
//! injected entries are sorted among the slots they occupy.

use std::collections::BTreeSet;

use k8s_openapi::api::core::v1::{
    Container, DownwardAPIProjection, DownwardAPIVolumeFile, EnvVar, EnvVarSource,
    ObjectFieldSelector, PodSpec, PodTemplateSpec, ProjectedVolumeSource, SecretKeySelector,
    SecretProjection, Volume, VolumeMount, VolumeProjection,
};
use kube::api::ObjectMeta;
use tracing::debug;

use bindings_common::{
    Error, Result, CUSTOM_PROJECTION_ANNOTATION, CUSTOM_PROJECTION_VALUE, DEFAULT_BINDING_ROOT,
    SERVICE_BINDING_ROOT_ENV,
};

use crate::descriptor::{BindingDescriptor, PROVIDER_KEY, TYPE_KEY};
use crate::ledger::{self, ContainerSlot, InjectedSet};
use crate::naming;
use crate::ordering::sort_injected;
use crate::workload::PodTemplateDocument;

/// Phase name for errors raised while removing a prior injection
pub const PHASE_UNDO: &str = "undo";

/// Phase name for errors raised while adding the volume
pub const PHASE_APPLY_VOLUME: &str = "apply-volume";

/// Phase name for errors raised while mutating a container
pub const PHASE_APPLY_CONTAINER: &str = "apply-container";

/// Project a binding into a workload.
///
/// Removes whatever this binding injected before, then mounts the secret
/// into every selected container, exposes `SERVICE_BINDING_ROOT` and adds
/// the requested env vars. Projections handed to a third party stop after
/// the removal.
pub fn apply<D>(descriptor: &BindingDescriptor, document: &mut D) -> Result<()>
where
    D: PodTemplateDocument + ?Sized,
{
    descriptor.validate()?;
    remove(descriptor, document)?;

    if descriptor.is_custom_projection() || is_custom_workload(document.owner_metadata()) {
        debug!(
            binding = descriptor.identity(),
            "custom projection, skipping apply"
        );
        return Ok(());
    }

    let identity = descriptor.identity();
    let (owner, template) = document.split_mut();
    let PodTemplateSpec { metadata, spec } = template.ok_or_else(|| {
        Error::projection_in_phase(identity, PHASE_APPLY_VOLUME, "workload has no pod template")
    })?;
    let spec = spec.as_mut().ok_or_else(|| {
        Error::projection_in_phase(identity, PHASE_APPLY_VOLUME, "pod template has no spec")
    })?;

    let volume_name = apply_volume(descriptor, owner, metadata, spec)?;
    let injected = ledger::injected_secrets_and_volumes(owner, Some(spec));

    let targets = descriptor.targets();
    for container in spec.init_containers.iter_mut().flatten() {
        if targets.matches_init_container(&container.name) {
            let slot = ContainerSlot::Init(container.name.clone());
            apply_container(descriptor, owner, container, slot, &volume_name, &injected)?;
        }
    }
    for (index, container) in spec.containers.iter_mut().enumerate() {
        if targets.matches_container(index, &container.name) {
            let slot = ContainerSlot::Regular(container.name.clone());
            apply_container(descriptor, owner, container, slot, &volume_name, &injected)?;
        }
    }

    debug!(binding = identity, volume = %volume_name, "binding projected");
    Ok(())
}

/// Remove everything a binding injected into a workload.
///
/// A workload the binding never touched is left as it was, apart from
/// collapsing empty collections.
pub fn remove<D>(descriptor: &BindingDescriptor, document: &mut D) -> Result<()>
where
    D: PodTemplateDocument + ?Sized,
{
    let identity = descriptor.identity();
    if identity.is_empty() {
        return Err(Error::projection_in_phase(
            identity,
            PHASE_UNDO,
            "binding identity is empty",
        ));
    }

    let (owner, template) = document.split_mut();
    let Some(PodTemplateSpec { metadata, spec }) = template else {
        ledger::remove_annotation(owner, &naming::ledger_key(identity));
        return Ok(());
    };
    let populated = Populated::capture(metadata, spec);

    if let Some(meta) = metadata.as_mut() {
        ledger::clear_overrides(meta, identity);
    }

    if let Some(spec) = spec.as_mut() {
        let override_paths = [
            naming::annotation_field_path(&naming::type_annotation_key(identity)),
            naming::annotation_field_path(&naming::provider_annotation_key(identity)),
        ];
        for container in containers_mut(spec) {
            if let Some(env) = container.env.as_mut() {
                env.retain(|e| !reads_field(e, &override_paths));
            }
        }

        if let Some(recorded) = ledger::find_prior_injection(owner, identity) {
            let others = ledger::recorded_by_others(owner, identity);
            undo_volumes(descriptor, spec, &recorded, &others);
        }
    }
    ledger::remove_annotation(owner, &naming::ledger_key(identity));

    if let Some(spec) = spec.as_mut() {
        release_root_env(owner, spec);
    }

    normalize(metadata, spec, &populated);
    Ok(())
}

fn is_custom_workload(owner: &ObjectMeta) -> bool {
    ledger::annotation(owner, CUSTOM_PROJECTION_ANNOTATION) == Some(CUSTOM_PROJECTION_VALUE)
}

fn containers(spec: &PodSpec) -> impl Iterator<Item = &Container> {
    spec.init_containers
        .iter()
        .flatten()
        .chain(spec.containers.iter())
}

fn containers_mut(spec: &mut PodSpec) -> impl Iterator<Item = &mut Container> {
    spec.init_containers
        .iter_mut()
        .flatten()
        .chain(spec.containers.iter_mut())
}

fn reads_field(env: &EnvVar, paths: &[String]) -> bool {
    env.value_from
        .as_ref()
        .and_then(|s| s.field_ref.as_ref())
        .is_some_and(|f| paths.contains(&f.field_path))
}

fn reads_secret(env: &EnvVar, secrets: &BTreeSet<String>) -> bool {
    env.value_from
        .as_ref()
        .and_then(|s| s.secret_key_ref.as_ref())
        .is_some_and(|s| secrets.contains(&s.name))
}

/// Undo the volumes recorded for a binding.
///
/// A volume another binding still records stays in place; only this
/// binding's mount of it and the env vars it declared are dropped.
fn undo_volumes(
    descriptor: &BindingDescriptor,
    spec: &mut PodSpec,
    recorded: &[String],
    others: &BTreeSet<String>,
) {
    let volumes = spec.volumes.as_deref().unwrap_or_default();

    let mut removed_volumes = BTreeSet::new();
    for entry in recorded {
        if volumes.iter().any(|v| &v.name == entry) {
            removed_volumes.insert(entry.clone());
        } else {
            // entries written before volume names were recorded hold secret names
            removed_volumes.extend(
                volumes
                    .iter()
                    .filter(|v| ledger::volume_secret_names(v).contains(entry))
                    .map(|v| v.name.clone()),
            );
        }
    }
    if removed_volumes.is_empty() {
        return;
    }

    let (shared, owned): (BTreeSet<String>, BTreeSet<String>) =
        removed_volumes.into_iter().partition(|name| {
            volumes
                .iter()
                .find(|v| &v.name == name)
                .is_some_and(|v| ledger::is_recorded(v, others))
        });
    let owned_secrets = secrets_of(volumes, &owned);
    let shared_secrets = secrets_of(volumes, &shared);
    let own_env: BTreeSet<&str> = descriptor.env().iter().map(|m| m.name.as_str()).collect();

    if let Some(volumes) = spec.volumes.as_mut() {
        volumes.retain(|v| !owned.contains(&v.name));
    }
    for container in containers_mut(spec) {
        let own_path = binding_mount_path(container, descriptor);
        if let Some(mounts) = container.volume_mounts.as_mut() {
            mounts.retain(|m| {
                !owned.contains(&m.name) && !(shared.contains(&m.name) && m.mount_path == own_path)
            });
        }
        if let Some(env) = container.env.as_mut() {
            env.retain(|e| {
                !reads_secret(e, &owned_secrets)
                    && !(own_env.contains(e.name.as_str()) && reads_secret(e, &shared_secrets))
            });
        }
    }
}

fn secrets_of(volumes: &[Volume], names: &BTreeSet<String>) -> BTreeSet<String> {
    volumes
        .iter()
        .filter(|v| names.contains(&v.name))
        .flat_map(ledger::volume_secret_names)
        .collect()
}

/// Directory bindings are mounted under in `container`
fn binding_root(container: &Container) -> String {
    container
        .env
        .iter()
        .flatten()
        .find(|e| e.name == SERVICE_BINDING_ROOT_ENV)
        .and_then(|e| e.value.clone())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| DEFAULT_BINDING_ROOT.to_string())
}

fn binding_mount_path(container: &Container, descriptor: &BindingDescriptor) -> String {
    format!(
        "{}/{}",
        binding_root(container).trim_end_matches('/'),
        descriptor.mount_name()
    )
}

/// Drop `SERVICE_BINDING_ROOT` from containers that no longer mount any binding
fn release_root_env(owner: &mut ObjectMeta, spec: &mut PodSpec) {
    let slots = ledger::root_env_slots(owner);
    if slots.is_empty() {
        return;
    }
    let injected = ledger::injected_secrets_and_volumes(owner, Some(spec));

    for slot in slots {
        let container = match &slot {
            ContainerSlot::Init(name) => spec
                .init_containers
                .iter_mut()
                .flatten()
                .find(|c| &c.name == name),
            ContainerSlot::Regular(name) => spec.containers.iter_mut().find(|c| &c.name == name),
        };
        let Some(container) = container else {
            ledger::clear_root_env(owner, &slot);
            continue;
        };

        let still_bound = container
            .volume_mounts
            .iter()
            .flatten()
            .any(|m| injected.volumes.contains(&m.name));
        if !still_bound {
            if let Some(env) = container.env.as_mut() {
                env.retain(|e| e.name != SERVICE_BINDING_ROOT_ENV);
            }
            ledger::clear_root_env(owner, &slot);
        }
    }
}

/// Which collections held entries before Undo ran
struct Populated {
    metadata: bool,
    annotations: bool,
    volumes: bool,
    containers: Vec<(bool, bool)>,
}

impl Populated {
    fn capture(metadata: &Option<ObjectMeta>, spec: &Option<PodSpec>) -> Self {
        let filled = |v: &Option<Vec<_>>| v.as_ref().is_some_and(|v| !v.is_empty());
        Self {
            metadata: metadata
                .as_ref()
                .is_some_and(|m| *m != ObjectMeta::default()),
            annotations: metadata
                .as_ref()
                .and_then(|m| m.annotations.as_ref())
                .is_some_and(|a| !a.is_empty()),
            volumes: spec.as_ref().is_some_and(|s| filled(&s.volumes)),
            containers: spec
                .iter()
                .flat_map(containers)
                .map(|c| {
                    (
                        c.env.as_ref().is_some_and(|e| !e.is_empty()),
                        c.volume_mounts.as_ref().is_some_and(|m| !m.is_empty()),
                    )
                })
                .collect(),
        }
    }
}

/// Collapse collections Undo emptied back to absent; ones the user left
/// empty stay as they were
fn normalize(metadata: &mut Option<ObjectMeta>, spec: &mut Option<PodSpec>, before: &Populated) {
    if let Some(meta) = metadata.as_mut() {
        if before.annotations && meta.annotations.as_ref().is_some_and(|a| a.is_empty()) {
            meta.annotations = None;
        }
    }
    if before.metadata && metadata.as_ref().is_some_and(|m| *m == ObjectMeta::default()) {
        *metadata = None;
    }

    let Some(spec) = spec.as_mut() else {
        return;
    };
    if before.volumes && spec.volumes.as_ref().is_some_and(Vec::is_empty) {
        spec.volumes = None;
    }
    for (container, &(env, mounts)) in containers_mut(spec).zip(&before.containers) {
        if env && container.env.as_ref().is_some_and(Vec::is_empty) {
            container.env = None;
        }
        if mounts && container.volume_mounts.as_ref().is_some_and(Vec::is_empty) {
            container.volume_mounts = None;
        }
    }
}

fn field_ref_source(annotation_key: &str) -> EnvVarSource {
    EnvVarSource {
        field_ref: Some(ObjectFieldSelector {
            field_path: naming::annotation_field_path(annotation_key),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn downward_file(path: &str, annotation_key: &str) -> DownwardAPIVolumeFile {
    DownwardAPIVolumeFile {
        path: path.to_string(),
        field_ref: Some(ObjectFieldSelector {
            field_path: naming::annotation_field_path(annotation_key),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Add the binding volume and record it; returns the volume name
fn apply_volume(
    descriptor: &BindingDescriptor,
    owner: &mut ObjectMeta,
    template_meta: &mut Option<ObjectMeta>,
    spec: &mut PodSpec,
) -> Result<String> {
    let identity = descriptor.identity();
    let volume_name = descriptor.volume_name();

    let mut sources = vec![VolumeProjection {
        secret: Some(SecretProjection {
            name: descriptor.secret_name().to_string(),
            ..Default::default()
        }),
        ..Default::default()
    }];

    if descriptor.has_overrides() {
        let mut items = Vec::new();
        if descriptor.binding_type().is_some() {
            items.push(downward_file(TYPE_KEY, &naming::type_annotation_key(identity)));
        }
        if descriptor.provider().is_some() {
            items.push(downward_file(
                PROVIDER_KEY,
                &naming::provider_annotation_key(identity),
            ));
        }
        sources.push(VolumeProjection {
            downward_api: Some(DownwardAPIProjection { items: Some(items) }),
            ..Default::default()
        });
    }
    let volume = Volume {
        name: volume_name.clone(),
        projected: Some(ProjectedVolumeSource {
            sources: Some(sources),
            ..Default::default()
        }),
        ..Default::default()
    };

    let existing = spec
        .volumes
        .iter()
        .flatten()
        .find(|v| v.name == volume_name);
    if let Some(existing) = existing {
        if *existing != volume
            && ledger::is_recorded(existing, &ledger::recorded_by_others(owner, identity))
        {
            return Err(Error::projection_in_phase(
                identity,
                PHASE_APPLY_VOLUME,
                format!(
                    "secret {} is already projected by another binding with a different type or provider",
                    descriptor.secret_name()
                ),
            ));
        }
    }

    if descriptor.has_overrides() {
        ledger::record_overrides(
            template_meta.get_or_insert_with(ObjectMeta::default),
            identity,
            descriptor.binding_type(),
            descriptor.provider(),
        );
    }

    let volumes = spec.volumes.get_or_insert_with(Vec::new);
    if !volumes.iter().any(|v| v.name == volume_name) {
        volumes.push(volume);
    }

    ledger::record_injection(owner, identity, std::slice::from_ref(&volume_name));
    let injected = ledger::injected_secrets_and_volumes(owner, Some(spec));
    if let Some(volumes) = spec.volumes.as_mut() {
        sort_injected(
            volumes,
            |v| injected.volumes.contains(&v.name),
            |v| v.name.clone(),
        );
    }

    Ok(volume_name)
}

fn apply_container(
    descriptor: &BindingDescriptor,
    owner: &mut ObjectMeta,
    container: &mut Container,
    slot: ContainerSlot,
    volume_name: &str,
    injected: &InjectedSet,
) -> Result<()> {
    let identity = descriptor.identity();
    let env = container.env.get_or_insert_with(Vec::new);
    if !env.iter().any(|e| e.name == SERVICE_BINDING_ROOT_ENV) {
        env.push(EnvVar {
            name: SERVICE_BINDING_ROOT_ENV.to_string(),
            value: Some(DEFAULT_BINDING_ROOT.to_string()),
            ..Default::default()
        });
        ledger::record_root_env(owner, slot);
    }
    let mount_path = binding_mount_path(container, descriptor);

    let mounts = container.volume_mounts.get_or_insert_with(Vec::new);
    if let Some(conflict) = mounts
        .iter()
        .find(|m| m.mount_path == mount_path && m.name != volume_name)
    {
        return Err(Error::projection_in_container(
            identity,
            PHASE_APPLY_CONTAINER,
            &container.name,
            format!(
                "mount path {mount_path} is already used by volume {}",
                conflict.name
            ),
        ));
    }
    if !mounts
        .iter()
        .any(|m| m.name == volume_name && m.mount_path == mount_path)
    {
        mounts.push(VolumeMount {
            name: volume_name.to_string(),
            mount_path,
            read_only: Some(true),
            ..Default::default()
        });
    }
    sort_injected(
        mounts,
        |m| injected.volumes.contains(&m.name),
        |m| (m.name.clone(), m.mount_path.clone()),
    );

    let env = container.env.get_or_insert_with(Vec::new);
    for mapping in descriptor.env() {
        let value_from = match mapping.key.as_str() {
            TYPE_KEY if descriptor.binding_type().is_some() => {
                field_ref_source(&naming::type_annotation_key(identity))
            }
            PROVIDER_KEY if descriptor.provider().is_some() => {
                field_ref_source(&naming::provider_annotation_key(identity))
            }
            key => EnvVarSource {
                secret_key_ref: Some(SecretKeySelector {
                    name: descriptor.secret_name().to_string(),
                    key: key.to_string(),
                    ..Default::default()
                }),
                ..Default::default()
            },
        };
        env.push(EnvVar {
            name: mapping.name.clone(),
            value_from: Some(value_from),
            ..Default::default()
        });
    }
    sort_injected(
        env,
        |e| injected.is_injected_env(e),
        |e| e.name.clone(),
    );

    Ok(())
}
