//! Ownership markers stamped on every object this system creates.
//!
//! Markers are the only way ownership is determined. They are written in the
//! same request that creates the object, never patched on afterwards.

use serde_json::Value as Json;

use crate::{DeploymentId, Generation};

pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
pub const MANAGED_BY_VALUE: &str = "gantry";
pub const DEPLOYMENT_ID_LABEL: &str = "gantry.io/deployment-id";
pub const GENERATION_ANNOTATION: &str = "gantry.io/generation";

/// Field manager name used for server-side apply.
pub const FIELD_MANAGER: &str = "gantry";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ownership {
    pub deployment_id: DeploymentId,
    pub generation: Option<Generation>,
}

fn label<'a>(raw: &'a Json, key: &str) -> Option<&'a str> {
    raw.pointer("/metadata/labels").and_then(|l| l.get(key)).and_then(|v| v.as_str())
}

/// Read ownership from an object's metadata. Requires both the managed-by and deployment-id markers.
pub fn read_ownership(raw: &Json) -> Option<Ownership> {
    if label(raw, MANAGED_BY_LABEL)? != MANAGED_BY_VALUE {
        return None;
    }
    let deployment_id = label(raw, DEPLOYMENT_ID_LABEL)?.parse().ok()?;
    Some(Ownership { deployment_id, generation: read_generation(raw) })
}

pub fn read_generation(raw: &Json) -> Option<Generation> {
    raw.pointer("/metadata/annotations")
        .and_then(|a| a.get(GENERATION_ANNOTATION))
        .and_then(|v| v.as_str())
        .and_then(|s| s.parse::<u64>().ok())
        .map(Generation)
}

/// Label selector matching everything this system owns.
pub fn owned_selector() -> String { format!("{}={}", MANAGED_BY_LABEL, MANAGED_BY_VALUE) }

/// Label selector matching objects owned for one deployment.
pub fn deployment_selector(id: DeploymentId) -> String {
    format!("{},{}={}", owned_selector(), DEPLOYMENT_ID_LABEL, id)
}

/// Write all markers into `metadata` of `obj`, creating maps as needed.
pub fn stamp(obj: &mut Json, id: DeploymentId, generation: Generation) {
    stamp_labels(obj, id);
    if let Some(meta) = obj.get_mut("metadata").and_then(|m| m.as_object_mut()) {
        let annos = meta.entry("annotations").or_insert_with(|| Json::Object(Default::default()));
        if let Some(a) = annos.as_object_mut() {
            a.insert(GENERATION_ANNOTATION.into(), Json::String(generation.to_string()));
        }
    }
}

/// Labels only; used for pod templates so pods are attributable to their deployment.
pub fn stamp_labels(obj: &mut Json, id: DeploymentId) {
    let Some(root) = obj.as_object_mut() else { return };
    let meta = root.entry("metadata").or_insert_with(|| Json::Object(Default::default()));
    if let Some(meta) = meta.as_object_mut() {
        let labels = meta.entry("labels").or_insert_with(|| Json::Object(Default::default()));
        if let Some(l) = labels.as_object_mut() {
            l.insert(MANAGED_BY_LABEL.into(), Json::String(MANAGED_BY_VALUE.into()));
            l.insert(DEPLOYMENT_ID_LABEL.into(), Json::String(id.to_string()));
        }
    }
}
