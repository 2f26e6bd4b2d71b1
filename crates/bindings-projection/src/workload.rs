//! Workload adapters
//!
//! The engine only ever touches two things on a workload: the owning
//! resource's metadata (where the ledger lives) and the pod template.
//! [`PodTemplateDocument`] exposes exactly that, for the built-in workload
//! kinds and for arbitrary resources fetched as [`DynamicObject`]s.
//!
//! A [`DynamicWorkload`] writes back only the collections the engine
//! manages; every other field of the raw template, including fields the
//! typed model does not know, is left as it was read.

use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, ReplicaSet, StatefulSet};
use k8s_openapi::api::batch::v1::{CronJob, Job};
use k8s_openapi::api::core::v1::{PodTemplateSpec, ReplicationController};
use kube::api::{DynamicObject, ObjectMeta};
use serde_json::{Map, Value};

use bindings_common::{Error, Result};

/// A resource that owns a pod template
pub trait PodTemplateDocument {
    /// Metadata of the owning resource
    fn owner_metadata(&self) -> &ObjectMeta;

    /// The pod template, if the resource carries one
    fn pod_template(&self) -> Option<&PodTemplateSpec>;

    /// Owner metadata and pod template, borrowed together
    fn split_mut(&mut self) -> (&mut ObjectMeta, Option<&mut PodTemplateSpec>);
}

macro_rules! spec_template_document {
    ($($kind:ty),+ $(,)?) => {$(
        impl PodTemplateDocument for $kind {
            fn owner_metadata(&self) -> &ObjectMeta {
                &self.metadata
            }

            fn pod_template(&self) -> Option<&PodTemplateSpec> {
                self.spec.as_ref().map(|s| &s.template)
            }

            fn split_mut(&mut self) -> (&mut ObjectMeta, Option<&mut PodTemplateSpec>) {
                (&mut self.metadata, self.spec.as_mut().map(|s| &mut s.template))
            }
        }
    )+};
}

spec_template_document!(Deployment, StatefulSet, DaemonSet, Job);

macro_rules! optional_template_document {
    ($($kind:ty),+ $(,)?) => {$(
        impl PodTemplateDocument for $kind {
            fn owner_metadata(&self) -> &ObjectMeta {
                &self.metadata
            }

            fn pod_template(&self) -> Option<&PodTemplateSpec> {
                self.spec.as_ref().and_then(|s| s.template.as_ref())
            }

            fn split_mut(&mut self) -> (&mut ObjectMeta, Option<&mut PodTemplateSpec>) {
                (
                    &mut self.metadata,
                    self.spec.as_mut().and_then(|s| s.template.as_mut()),
                )
            }
        }
    )+};
}

optional_template_document!(ReplicaSet, ReplicationController);

impl PodTemplateDocument for CronJob {
    fn owner_metadata(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn pod_template(&self) -> Option<&PodTemplateSpec> {
        self.spec
            .as_ref()
            .and_then(|s| s.job_template.spec.as_ref())
            .map(|s| &s.template)
    }

    fn split_mut(&mut self) -> (&mut ObjectMeta, Option<&mut PodTemplateSpec>) {
        (
            &mut self.metadata,
            self.spec
                .as_mut()
                .and_then(|s| s.job_template.spec.as_mut())
                .map(|s| &mut s.template),
        )
    }
}

const CRON_JOB_KIND: &str = "CronJob";

/// Any resource with a pod template at `spec.template`
/// (`spec.jobTemplate.spec.template` for CronJobs)
#[derive(Clone, Debug)]
pub struct DynamicWorkload {
    object: DynamicObject,
    template: Option<PodTemplateSpec>,
}

impl DynamicWorkload {
    /// Lift the pod template out of a dynamic object
    pub fn from_dynamic(object: DynamicObject) -> Result<Self> {
        let kind = kind_of(&object);
        let template = match object.data.pointer(template_pointer(&kind)) {
            Some(Value::Null) | None => None,
            Some(value) => Some(
                serde_json::from_value(value.clone())
                    .map_err(|e| Error::serialization_for_kind(&kind, e.to_string()))?,
            ),
        };
        Ok(Self { object, template })
    }

    /// Write the pod template back into the dynamic object
    ///
    /// Annotations, volumes, and each container's env and mounts are taken
    /// from the typed template. List entries that were already present keep
    /// their raw form.
    pub fn into_dynamic(self) -> Result<DynamicObject> {
        let Self {
            mut object,
            template,
        } = self;
        let Some(template) = template else {
            return Ok(object);
        };

        let kind = kind_of(&object);
        let typed = serde_json::to_value(&template)
            .map_err(|e| Error::serialization_for_kind(&kind, e.to_string()))?;
        let pointer = template_pointer(&kind);
        match (object.data.pointer_mut(pointer), typed) {
            (Some(Value::Object(raw)), Value::Object(typed)) => {
                splice_template(raw, typed);
                Ok(object)
            }
            _ => Err(Error::serialization_for_kind(
                kind,
                format!("resource has no object at {pointer}"),
            )),
        }
    }

    /// Kind of the wrapped resource
    pub fn kind(&self) -> String {
        kind_of(&self.object)
    }

    /// The wrapped resource, without any pending template changes
    pub fn object(&self) -> &DynamicObject {
        &self.object
    }
}

impl PodTemplateDocument for DynamicWorkload {
    fn owner_metadata(&self) -> &ObjectMeta {
        &self.object.metadata
    }

    fn pod_template(&self) -> Option<&PodTemplateSpec> {
        self.template.as_ref()
    }

    fn split_mut(&mut self) -> (&mut ObjectMeta, Option<&mut PodTemplateSpec>) {
        (&mut self.object.metadata, self.template.as_mut())
    }
}

fn kind_of(object: &DynamicObject) -> String {
    object
        .types
        .as_ref()
        .map(|t| t.kind.clone())
        .unwrap_or_default()
}

fn template_pointer(kind: &str) -> &'static str {
    if kind == CRON_JOB_KIND {
        "/spec/jobTemplate/spec/template"
    } else {
        "/spec/template"
    }
}

fn splice_template(raw: &mut Map<String, Value>, mut typed: Map<String, Value>) {
    splice_annotations(raw, typed.get("metadata"));

    let Some(Value::Object(typed_spec)) = typed.remove("spec") else {
        return;
    };
    if !matches!(raw.get("spec"), Some(Value::Object(_))) {
        raw.insert("spec".to_string(), Value::Object(typed_spec));
        return;
    }
    let Some(Value::Object(raw_spec)) = raw.get_mut("spec") else {
        return;
    };
    splice_list(raw_spec, &typed_spec, "volumes");

    for key in ["initContainers", "containers"] {
        let (Some(Value::Array(raw_containers)), Some(Value::Array(typed_containers))) =
            (raw_spec.get_mut(key), typed_spec.get(key))
        else {
            continue;
        };
        for (raw_container, typed_container) in raw_containers.iter_mut().zip(typed_containers) {
            if let (Value::Object(raw_container), Value::Object(typed_container)) =
                (raw_container, typed_container)
            {
                splice_list(raw_container, typed_container, "env");
                splice_list(raw_container, typed_container, "volumeMounts");
            }
        }
    }
}

fn splice_annotations(raw: &mut Map<String, Value>, typed_meta: Option<&Value>) {
    let annotations = typed_meta.and_then(|m| m.get("annotations")).cloned();
    let meta = match raw.get_mut("metadata") {
        Some(Value::Object(meta)) => meta,
        _ => {
            if let Some(annotations) = annotations {
                let mut meta = Map::new();
                meta.insert("annotations".to_string(), annotations);
                raw.insert("metadata".to_string(), Value::Object(meta));
            }
            return;
        }
    };
    match annotations {
        Some(annotations) => {
            meta.insert("annotations".to_string(), annotations);
        }
        None => {
            meta.remove("annotations");
            let emptied = meta.is_empty() && typed_meta.is_none();
            if emptied {
                raw.remove("metadata");
            }
        }
    }
}

/// Rebuild `raw[key]` from `typed[key]`, reusing each raw entry the typed
/// entry was read from
fn splice_list(raw: &mut Map<String, Value>, typed: &Map<String, Value>, key: &str) {
    let Some(Value::Array(typed_items)) = typed.get(key) else {
        raw.remove(key);
        return;
    };
    let mut unused = match raw.remove(key) {
        Some(Value::Array(items)) => items.into_iter().map(Some).collect(),
        _ => Vec::new(),
    };
    let merged = typed_items
        .iter()
        .map(|item| {
            unused
                .iter_mut()
                .find(|r| r.as_ref().is_some_and(|r| covers(r, item)))
                .and_then(Option::take)
                .unwrap_or_else(|| item.clone())
        })
        .collect();
    raw.insert(key.to_string(), Value::Array(merged));
}

/// Whether `raw` carries every field of `typed` with the same value
fn covers(raw: &Value, typed: &Value) -> bool {
    match (raw, typed) {
        (Value::Object(raw), Value::Object(typed)) => typed
            .iter()
            .all(|(k, v)| raw.get(k).is_some_and(|r| covers(r, v))),
        (Value::Array(raw), Value::Array(typed)) => {
            raw.len() == typed.len() && raw.iter().zip(typed).all(|(r, t)| covers(r, t))
        }
        _ => raw == typed,
    }
}
