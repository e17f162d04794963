//! Gantry drift classifier.
//!
//! [`classify`] compares one live object with the template it was last applied
//! from; [`resolve`] turns the verdict into a response under the deployment's
//! drift policy. Both are pure; callers own every side effect.

#![forbid(unsafe_code)]

use gantry_core::fields;
use gantry_core::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as Json};

/// One managed field whose live value differs from the desired one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDrift {
    pub path: String,
    pub desired: Option<Json>,
    pub live: Option<Json>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "verdict")]
pub enum DriftVerdict {
    NoDrift,
    ModifiedExternally { fields: Vec<FieldDrift> },
    DeletedExternally,
    /// Object without our markers (or another deployment's). `displaced` means
    /// it took the place of an object we were tracking under the same name.
    Unmanaged { displaced: bool },
}

impl DriftVerdict {
    pub fn is_drift(&self) -> bool { !matches!(self, DriftVerdict::NoDrift) }
}

pub struct ClassifyInput<'a> {
    pub deployment: DeploymentId,
    pub lifecycle: LifecycleState,
    pub default_ns: &'a str,
    /// Template for this object at `last_applied_generation`, if it was declared there.
    pub template: Option<&'a ObjectTemplate>,
    /// The Managed Resource row for this identity, if any.
    pub managed: Option<&'a ManagedResource>,
    /// Current live object; `None` when the platform reports it gone.
    pub live: Option<&'a LiveObject>,
    pub policy: &'a DriftPolicy,
}

/// Desired fields of a template as a JSON object shaped like the live object.
pub fn desired_fields(tpl: &ObjectTemplate) -> Json {
    let mut root = tpl.body.clone();
    let mut meta = Map::new();
    if !tpl.labels.is_empty() {
        meta.insert("labels".into(), Json::Object(tpl.labels.clone()));
    }
    if !tpl.annotations.is_empty() {
        meta.insert("annotations".into(), Json::Object(tpl.annotations.clone()));
    }
    if !meta.is_empty() {
        root.insert("metadata".into(), Json::Object(meta));
    }
    Json::Object(root)
}

/// Field-level differences between a template and a live object, ignored paths excluded.
pub fn compare(tpl: &ObjectTemplate, live: &LiveObject, policy: &DriftPolicy) -> Vec<FieldDrift> {
    let kind = live.object.kind;
    let desired = desired_fields(tpl);
    fields::subset_diff(&desired, &live.raw, "")
        .into_iter()
        .filter(|p| !policy.is_ignored(kind, p))
        .map(|path| FieldDrift {
            desired: desired.pointer(&path).cloned(),
            live: live.raw.pointer(&path).cloned(),
            path,
        })
        .collect()
}

pub fn classify(input: &ClassifyInput<'_>) -> DriftVerdict {
    let tracked = input.managed.filter(|m| m.deployment_id == input.deployment);
    let Some(live) = input.live else {
        return match tracked {
            Some(row) if row.managed && input.lifecycle != LifecycleState::Deleted => DriftVerdict::DeletedExternally,
            _ => DriftVerdict::NoDrift,
        };
    };
    // a row flagged unmanaged already saw its object vanish; a fresh uid is the replacement
    let uid_moved = tracked.map(|row| row.managed && row.uid != live.uid).unwrap_or(false);
    if !live.is_owned_by(input.deployment) {
        return DriftVerdict::Unmanaged { displaced: uid_moved };
    }
    if uid_moved {
        return DriftVerdict::DeletedExternally;
    }
    if input.lifecycle == LifecycleState::Deleted {
        return DriftVerdict::NoDrift;
    }
    let Some(tpl) = input.template else { return DriftVerdict::NoDrift };
    if input.policy.mode_for(live.object.kind) == PolicyMode::Ignore {
        return DriftVerdict::NoDrift;
    }
    let fields = compare(tpl, live, input.policy);
    if fields.is_empty() { DriftVerdict::NoDrift } else { DriftVerdict::ModifiedExternally { fields } }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "response")]
pub enum DriftResponse {
    /// Nothing to do.
    None,
    /// Record and reconcile back to the desired state.
    Enforce { fields: Vec<FieldDrift> },
    /// Fold the live values into the desired spec, consuming `approvals`.
    Adopt { fields: Vec<FieldDrift>, approvals: Vec<i64> },
    /// Excluded by policy: no event, no trigger.
    Ignore,
}

/// Decide how to answer a verdict. `approval_for(path)` returns a pending
/// approval covering that field, if one exists. Adoption is all-or-nothing:
/// one field outside the rules sends the whole set to Enforce.
pub fn resolve(
    verdict: &DriftVerdict,
    kind: ObjectKind,
    policy: &DriftPolicy,
    mut approval_for: impl FnMut(&str) -> Option<i64>,
) -> DriftResponse {
    let mode = policy.mode_for(kind);
    match verdict {
        DriftVerdict::NoDrift | DriftVerdict::Unmanaged { .. } => DriftResponse::None,
        DriftVerdict::DeletedExternally if mode == PolicyMode::Ignore => DriftResponse::Ignore,
        DriftVerdict::DeletedExternally => DriftResponse::Enforce { fields: Vec::new() },
        DriftVerdict::ModifiedExternally { .. } if mode == PolicyMode::Ignore => DriftResponse::Ignore,
        DriftVerdict::ModifiedExternally { fields } if mode == PolicyMode::Adopt => {
            let mut approvals = Vec::new();
            for f in fields {
                if !policy.is_mutation_allowed(kind, &f.path) {
                    return DriftResponse::Enforce { fields: fields.clone() };
                }
                if policy.auto_adopt {
                    continue;
                }
                match approval_for(&f.path) {
                    Some(a) => {
                        if !approvals.contains(&a) {
                            approvals.push(a);
                        }
                    }
                    None => return DriftResponse::Enforce { fields: fields.clone() },
                }
            }
            DriftResponse::Adopt { fields: fields.clone(), approvals }
        }
        DriftVerdict::ModifiedExternally { fields } => DriftResponse::Enforce { fields: fields.clone() },
    }
}

/// New desired spec with the live values of `drifted` written into `object`'s template.
/// Returns `None` when the object is not declared or a path cannot be written.
pub fn adopt_into(spec: &DesiredSpec, object: &ObjectRef, default_ns: &str, drifted: &[FieldDrift]) -> Option<DesiredSpec> {
    let mut next = spec.clone();
    let tpl = next.find_mut(object, default_ns)?;
    let mut doc = desired_fields(tpl);
    for f in drifted {
        match &f.live {
            Some(v) => {
                if !fields::set_pointer(&mut doc, &f.path, v.clone()) {
                    return None;
                }
            }
            None => fields::remove_pointer(&mut doc, &f.path),
        }
    }
    let Json::Object(mut root) = doc else { return None };
    if let Some(Json::Object(meta)) = root.remove("metadata") {
        tpl.labels = meta.get("labels").and_then(|v| v.as_object()).cloned().unwrap_or_default();
        tpl.annotations = meta.get("annotations").and_then(|v| v.as_object()).cloned().unwrap_or_default();
    }
    tpl.body = root;
    Some(next)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use gantry_core::{markers, MutationRule};
    use serde_json::json;

    fn tpl() -> ObjectTemplate {
        let body = json!({"spec": {"replicas": 2, "template": {"spec": {"containers": [{"name": "gs", "image": "gs:1"}]}}}});
        ObjectTemplate {
            kind: ObjectKind::Workload,
            name: "gs".into(),
            namespace: None,
            labels: Default::default(),
            annotations: Default::default(),
            body: body.as_object().cloned().unwrap(),
        }
    }

    fn live(id: DeploymentId, uid: &str, replicas: u32, owned: bool) -> LiveObject {
        let mut raw = json!({
            "metadata": {"name": "gs", "namespace": "games", "uid": uid},
            "spec": {
                "replicas": replicas,
                "podManagementPolicy": "OrderedReady",
                "template": {"spec": {"containers": [{"name": "gs", "image": "gs:1", "imagePullPolicy": "IfNotPresent"}]}}
            }
        });
        if owned {
            markers::stamp(&mut raw, id, Generation::FIRST);
        }
        LiveObject { object: ObjectRef::new(ObjectKind::Workload, "games", "gs"), uid: uid.into(), resource_version: "1".into(), raw }
    }

    fn row(id: DeploymentId, uid: &str, managed: bool) -> ManagedResource {
        ManagedResource {
            deployment_id: id,
            object: ObjectRef::new(ObjectKind::Workload, "games", "gs"),
            uid: uid.into(),
            last_seen_at: Utc::now(),
            managed,
        }
    }

    fn input<'a>(
        id: DeploymentId,
        t: &'a ObjectTemplate,
        managed: Option<&'a ManagedResource>,
        live: Option<&'a LiveObject>,
        policy: &'a DriftPolicy,
    ) -> ClassifyInput<'a> {
        ClassifyInput { deployment: id, lifecycle: LifecycleState::Active, default_ns: "games", template: Some(t), managed, live, policy }
    }

    #[test]
    fn platform_defaults_are_not_drift() {
        let id = DeploymentId::new();
        let (t, p) = (tpl(), DriftPolicy::default());
        let l = live(id, "u1", 2, true);
        let r = row(id, "u1", true);
        assert_eq!(classify(&input(id, &t, Some(&r), Some(&l), &p)), DriftVerdict::NoDrift);
    }

    #[test]
    fn modified_field_is_reported_with_values() {
        let id = DeploymentId::new();
        let (t, p) = (tpl(), DriftPolicy::default());
        let l = live(id, "u1", 5, true);
        let r = row(id, "u1", true);
        match classify(&input(id, &t, Some(&r), Some(&l), &p)) {
            DriftVerdict::ModifiedExternally { fields } => {
                assert_eq!(fields.len(), 1);
                assert_eq!(fields[0].path, "/spec/replicas");
                assert_eq!(fields[0].desired, Some(json!(2)));
                assert_eq!(fields[0].live, Some(json!(5)));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn missing_or_replaced_objects() {
        let id = DeploymentId::new();
        let (t, p) = (tpl(), DriftPolicy::default());
        let r = row(id, "u1", true);
        assert_eq!(classify(&input(id, &t, Some(&r), None, &p)), DriftVerdict::DeletedExternally);

        // recreated by someone else under the same name
        let foreign = live(id, "u2", 2, false);
        assert_eq!(classify(&input(id, &t, Some(&r), Some(&foreign), &p)), DriftVerdict::Unmanaged { displaced: true });
        // a copy carrying our markers but a new uid
        let copy = live(id, "u2", 2, true);
        assert_eq!(classify(&input(id, &t, Some(&r), Some(&copy), &p)), DriftVerdict::DeletedExternally);
        // row already knows the object vanished: new uid is our own recreate
        let gone = row(id, "u1", false);
        assert_eq!(classify(&input(id, &t, Some(&gone), Some(&copy), &p)), DriftVerdict::NoDrift);
        assert_eq!(classify(&input(id, &t, Some(&gone), None, &p)), DriftVerdict::NoDrift);

        let mut deleting = input(id, &t, Some(&r), None, &p);
        deleting.lifecycle = LifecycleState::Deleted;
        assert_eq!(classify(&deleting), DriftVerdict::NoDrift);
    }

    #[test]
    fn ignore_policy_and_paths_suppress_comparison() {
        let id = DeploymentId::new();
        let t = tpl();
        let l = live(id, "u1", 5, true);
        let mut p = DriftPolicy::default();
        p.ignore_paths.push(MutationRule::new(Some(ObjectKind::Workload), "/spec/replicas"));
        assert_eq!(classify(&input(id, &t, None, Some(&l), &p)), DriftVerdict::NoDrift);

        let mut p = DriftPolicy::default();
        p.per_kind.insert(ObjectKind::Workload, PolicyMode::Ignore);
        assert_eq!(classify(&input(id, &t, None, Some(&l), &p)), DriftVerdict::NoDrift);
        assert_eq!(resolve(&DriftVerdict::DeletedExternally, ObjectKind::Workload, &p, |_| None), DriftResponse::Ignore);
    }

    #[test]
    fn adopt_requires_rule_and_approval() {
        let drift = DriftVerdict::ModifiedExternally {
            fields: vec![FieldDrift { path: "/spec/replicas".into(), desired: Some(json!(2)), live: Some(json!(5)) }],
        };
        let mut p = DriftPolicy { default: PolicyMode::Adopt, ..Default::default() };
        // not an allowed mutation: enforced
        assert!(matches!(resolve(&drift, ObjectKind::Workload, &p, |_| Some(1)), DriftResponse::Enforce { .. }));

        p.allowed_mutations.push(MutationRule::new(Some(ObjectKind::Workload), "/spec/replicas"));
        assert!(matches!(resolve(&drift, ObjectKind::Workload, &p, |_| None), DriftResponse::Enforce { .. }));
        match resolve(&drift, ObjectKind::Workload, &p, |_| Some(7)) {
            DriftResponse::Adopt { approvals, .. } => assert_eq!(approvals, vec![7]),
            other => panic!("unexpected {other:?}"),
        }
        p.auto_adopt = true;
        match resolve(&drift, ObjectKind::Workload, &p, |_| None) {
            DriftResponse::Adopt { approvals, .. } => assert!(approvals.is_empty()),
            other => panic!("unexpected {other:?}"),
        }
        // enforce mode never adopts
        let enforce = DriftPolicy { auto_adopt: true, ..p.clone() };
        let enforce = DriftPolicy { default: PolicyMode::Enforce, ..enforce };
        assert!(matches!(resolve(&drift, ObjectKind::Workload, &enforce, |_| Some(1)), DriftResponse::Enforce { .. }));
    }

    #[test]
    fn adopt_into_rewrites_template() {
        let spec = DesiredSpec { objects: vec![tpl()] };
        let obj = ObjectRef::new(ObjectKind::Workload, "games", "gs");
        let drifted = vec![FieldDrift { path: "/spec/replicas".into(), desired: Some(json!(2)), live: Some(json!(5)) }];
        let next = adopt_into(&spec, &obj, "games", &drifted).unwrap();
        assert_eq!(next.objects[0].body["spec"]["replicas"], json!(5));
        assert_eq!(next.objects[0].body["spec"]["template"], spec.objects[0].body["spec"]["template"]);
        assert!(adopt_into(&spec, &ObjectRef::new(ObjectKind::Service, "games", "gs"), "games", &drifted).is_none());
    }
}
