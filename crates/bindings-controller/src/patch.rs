//! Workload write-back
//!
//! Workloads are written back with a JSON patch computed from the object as
//! read and the object after projection. The patch is guarded by a `test`
//! on `metadata.resourceVersion`, so a concurrent writer makes it fail with
//! a conflict instead of being overwritten.

use json_patch::jsonptr::PointerBuf;
use json_patch::{Patch, PatchOperation, TestOperation};
use kube::api::DynamicObject;
use serde_json::Value;

/// Compute the patch turning `before` into `after`, or `None` when unchanged
pub fn workload_patch(
    before: &DynamicObject,
    after: &DynamicObject,
) -> Result<Option<Patch>, serde_json::Error> {
    let old = serde_json::to_value(before)?;
    let new = serde_json::to_value(after)?;

    let diff = json_patch::diff(&old, &new);
    if diff.0.is_empty() {
        return Ok(None);
    }

    let mut ops = Vec::with_capacity(diff.0.len() + 1);
    if let Some(version) = before.metadata.resource_version.as_deref() {
        ops.push(PatchOperation::Test(TestOperation {
            path: PointerBuf::from_tokens(["metadata", "resourceVersion"]),
            value: Value::String(version.to_string()),
        }));
    }
    ops.extend(diff.0);
    Ok(Some(Patch(ops)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn deployment() -> DynamicObject {
        serde_yaml::from_str(
            r#"
apiVersion: apps/v1
kind: Deployment
metadata:
  name: my-app
  namespace: default
  resourceVersion: "42"
spec:
  template:
    spec:
      containers:
      - name: app
"#,
        )
        .expect("parse deployment")
    }

    /// Story: An untouched workload is not written
    #[test]
    fn story_unchanged_workload_produces_no_patch() {
        let before = deployment();
        let after = before.clone();
        assert!(workload_patch(&before, &after).expect("diff").is_none());
    }

    /// Story: A projected workload is patched under optimistic concurrency
    #[test]
    fn story_changed_workload_patch_is_guarded_and_applies() {
        let before = deployment();
        let mut after = before.clone();
        after.metadata.annotations = Some(
            [(
                "internal.service.binding/projection-abc".to_string(),
                "binding-123".to_string(),
            )]
            .into(),
        );
        if let Some(spec) = after.data.pointer_mut("/spec/template/spec") {
            spec["volumes"] = serde_json::json!([{"name": "binding-123"}]);
        }

        let patch = workload_patch(&before, &after)
            .expect("diff")
            .expect("patch expected");
        assert!(matches!(
            patch.0.first(),
            Some(PatchOperation::Test(t)) if t.value == Value::String("42".to_string())
        ));

        let mut doc = serde_json::to_value(&before).expect("serialize");
        json_patch::patch(&mut doc, &patch).expect("patch applies");
        assert_eq!(doc, serde_json::to_value(&after).expect("serialize"));
    }

    #[test]
    fn story_stale_resource_version_fails_the_test_operation() {
        let before = deployment();
        let mut after = before.clone();
        after.metadata.labels = Some([("a".to_string(), "b".to_string())].into());
        let patch = workload_patch(&before, &after)
            .expect("diff")
            .expect("patch expected");

        let mut moved_on = before.clone();
        moved_on.metadata.resource_version = Some("43".to_string());
        let mut doc = serde_json::to_value(&moved_on).expect("serialize");
        assert!(json_patch::patch(&mut doc, &patch).is_err());
    }
}
