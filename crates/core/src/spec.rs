//! Desired spec: the ordered set of object templates a deployment wants live,
//! plus rendering into platform manifests carrying ownership markers.

use std::collections::BTreeSet;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as Json};

use crate::{markers, DeploymentId, Generation, ObjectKind, ObjectRef};

static DNS_SUBDOMAIN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?(\.[a-z0-9]([-a-z0-9]*[a-z0-9])?)*$").expect("static regex")
});
static DNS_LABEL: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?$").expect("static regex"));

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SpecError {
    #[error("invalid name {name:?} for {kind}: {reason}")]
    InvalidName { kind: ObjectKind, name: String, reason: &'static str },
    #[error("invalid namespace {0:?}")]
    InvalidNamespace(String),
    #[error("duplicate object {0}")]
    Duplicate(String),
    #[error("{0} objects cannot be declared; they are owned by their workload")]
    NotPlannable(ObjectKind),
    #[error("{object}: body must be an object with keys from {allowed:?}, found {found:?}")]
    InvalidBody { object: String, allowed: &'static [&'static str], found: String },
}

/// One object the deployment wants to exist.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectTemplate {
    pub kind: ObjectKind,
    pub name: String,
    /// Defaults to the deployment's namespace.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub labels: Map<String, Json>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub annotations: Map<String, Json>,
    /// Managed sections of the object (`spec`, `data`, ...).
    #[serde(default)]
    pub body: Map<String, Json>,
}

impl ObjectTemplate {
    pub fn object_ref(&self, default_ns: &str) -> ObjectRef {
        ObjectRef::new(self.kind, self.namespace.clone().unwrap_or_else(|| default_ns.to_string()), self.name.clone())
    }

    /// Managed sections as a JSON object; the value drift and plan comparisons use.
    pub fn managed_fields(&self) -> Json { Json::Object(self.body.clone()) }

    fn validate(&self) -> Result<(), SpecError> {
        if !self.kind.is_planned() {
            return Err(SpecError::NotPlannable(self.kind));
        }
        let name_ok = match self.kind {
            ObjectKind::Service => self.name.len() <= 63 && DNS_LABEL.is_match(&self.name),
            _ => self.name.len() <= 253 && DNS_SUBDOMAIN.is_match(&self.name),
        };
        if !name_ok {
            return Err(SpecError::InvalidName { kind: self.kind, name: self.name.clone(), reason: "not a DNS-1123 name" });
        }
        if let Some(ns) = &self.namespace {
            validate_namespace(ns)?;
        }
        let allowed = self.kind.ops().managed_sections();
        if let Some(bad) = self.body.keys().find(|k| !allowed.contains(&k.as_str())) {
            return Err(SpecError::InvalidBody { object: format!("{}/{}", self.kind, self.name), allowed, found: bad.clone() });
        }
        Ok(())
    }
}

pub fn validate_namespace(ns: &str) -> Result<(), SpecError> {
    if ns.len() <= 63 && DNS_LABEL.is_match(ns) { Ok(()) } else { Err(SpecError::InvalidNamespace(ns.to_string())) }
}

/// Structured desired configuration for a deployment.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DesiredSpec {
    #[serde(default)]
    pub objects: Vec<ObjectTemplate>,
}

impl DesiredSpec {
    /// Structural checks only; template-level schema validation happens upstream.
    pub fn validate(&self, default_ns: &str) -> Result<(), SpecError> {
        validate_namespace(default_ns)?;
        let mut seen = BTreeSet::new();
        for t in &self.objects {
            t.validate()?;
            let r = t.object_ref(default_ns);
            if !seen.insert(r.clone()) {
                return Err(SpecError::Duplicate(r.to_string()));
            }
        }
        Ok(())
    }

    pub fn find(&self, object: &ObjectRef, default_ns: &str) -> Option<&ObjectTemplate> {
        self.objects.iter().find(|t| &t.object_ref(default_ns) == object)
    }

    pub fn find_mut(&mut self, object: &ObjectRef, default_ns: &str) -> Option<&mut ObjectTemplate> {
        self.objects.iter_mut().find(|t| &t.object_ref(default_ns) == object)
    }
}

/// Fully rendered object ready to send to the platform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub object: ObjectRef,
    pub body: Json,
}

impl Manifest {
    /// Render a template with ownership markers for `generation`.
    pub fn render(tpl: &ObjectTemplate, id: DeploymentId, default_ns: &str, generation: Generation) -> Self {
        let object = tpl.object_ref(default_ns);
        let ops = tpl.kind.ops();
        let mut meta = Map::new();
        meta.insert("name".into(), Json::String(object.name.clone()));
        meta.insert("namespace".into(), Json::String(object.namespace.clone()));
        if !tpl.labels.is_empty() { meta.insert("labels".into(), Json::Object(tpl.labels.clone())); }
        if !tpl.annotations.is_empty() { meta.insert("annotations".into(), Json::Object(tpl.annotations.clone())); }

        let mut root = Map::new();
        root.insert("apiVersion".into(), Json::String(tpl.kind.api_version()));
        root.insert("kind".into(), Json::String(ops.kind_name().to_string()));
        root.insert("metadata".into(), Json::Object(meta));
        for (k, v) in tpl.body.iter() {
            root.insert(k.clone(), v.clone());
        }
        let mut body = Json::Object(root);
        markers::stamp(&mut body, id, generation);
        if tpl.kind == ObjectKind::Workload {
            if let Some(pod_tpl) = body.pointer_mut("/spec/template") {
                markers::stamp_labels(pod_tpl, id);
            }
        }
        Manifest { object, body }
    }

    /// Managed sections of the rendered body (markers injected into pod templates included).
    pub fn managed_fields(&self) -> Json {
        Json::Object(self.object.kind.ops().extract_managed_fields(&self.body))
    }
}
