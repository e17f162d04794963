//! Drift response policy, per deployment with optional per-kind overrides.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{fields, ObjectKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PolicyMode {
    /// Revert drift to the desired state.
    #[default]
    Enforce,
    /// Fold permitted drift back into the desired state.
    Adopt,
    /// Exclude from comparison entirely.
    Ignore,
}

/// A JSON-pointer prefix, optionally scoped to one kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MutationRule {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<ObjectKind>,
    pub path: String,
}

impl MutationRule {
    pub fn new(kind: Option<ObjectKind>, path: impl Into<String>) -> Self { Self { kind, path: path.into() } }

    pub fn matches(&self, kind: ObjectKind, path: &str) -> bool {
        self.kind.map(|k| k == kind).unwrap_or(true) && fields::path_within(path, &self.path)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DriftPolicy {
    #[serde(default)]
    pub default: PolicyMode,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub per_kind: BTreeMap<ObjectKind, PolicyMode>,
    /// Fields the template allows to change out-of-band (Adopt candidates).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allowed_mutations: Vec<MutationRule>,
    /// Fields never compared.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ignore_paths: Vec<MutationRule>,
    /// Adopt without waiting for a user approval.
    #[serde(default)]
    pub auto_adopt: bool,
}

impl DriftPolicy {
    pub fn mode_for(&self, kind: ObjectKind) -> PolicyMode {
        self.per_kind.get(&kind).copied().unwrap_or(self.default)
    }

    pub fn is_ignored(&self, kind: ObjectKind, path: &str) -> bool {
        self.mode_for(kind) == PolicyMode::Ignore || self.ignore_paths.iter().any(|r| r.matches(kind, path))
    }

    pub fn is_mutation_allowed(&self, kind: ObjectKind, path: &str) -> bool {
        self.allowed_mutations.iter().any(|r| r.matches(kind, path))
    }
}
