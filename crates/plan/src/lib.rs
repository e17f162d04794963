//! Gantry planner: a pure function from (desired spec at generation G,
//! managed rows, owned live objects) to an ordered action list.
//!
//! Creates and updates run in dependency rank order (config before workloads
//! before services before routes); deletions follow in reverse rank.
//! Identical inputs always produce identical plans.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use gantry_core::fields;
use gantry_core::markers::{self, GENERATION_ANNOTATION};
use gantry_core::prelude::*;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PlanMode {
    Converge,
    Teardown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action")]
pub enum Action {
    Create { manifest: Manifest },
    /// `fields` are the managed paths that differ; empty when only the generation marker is stale.
    Update { manifest: Manifest, uid: String, fields: Vec<String> },
    Delete { object: ObjectRef, uid: String },
}

impl Action {
    pub fn object(&self) -> &ObjectRef {
        match self {
            Action::Create { manifest } | Action::Update { manifest, .. } => &manifest.object,
            Action::Delete { object, .. } => object,
        }
    }

    pub fn verb(&self) -> &'static str {
        match self {
            Action::Create { .. } => "create",
            Action::Update { .. } => "update",
            Action::Delete { .. } => "delete",
        }
    }

    /// Short form for logs and event payloads.
    pub fn summary(&self) -> serde_json::Value {
        serde_json::json!({"action": self.verb(), "object": self.object().key()})
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub deployment: DeploymentId,
    pub generation: Generation,
    pub mode: PlanMode,
    pub actions: Vec<Action>,
}

impl Plan {
    pub fn is_empty(&self) -> bool { self.actions.is_empty() }

    pub fn counts(&self) -> (usize, usize, usize) {
        self.actions.iter().fold((0, 0, 0), |(c, u, d), a| match a {
            Action::Create { .. } => (c + 1, u, d),
            Action::Update { .. } => (c, u + 1, d),
            Action::Delete { .. } => (c, u, d + 1),
        })
    }
}

pub struct PlanInput<'a> {
    pub deployment: &'a Deployment,
    /// Managed Resource rows of this deployment.
    pub managed: &'a [ManagedResource],
    /// Live objects carrying this deployment's markers.
    pub live: &'a [LiveObject],
}

fn marker_path() -> String { format!("/metadata/annotations/{}", GENERATION_ANNOTATION.replace('~', "~0").replace('/', "~1")) }

fn sort_key(o: &ObjectRef) -> (u8, &str, &str) { (o.kind.rank(), o.namespace.as_str(), o.name.as_str()) }

pub fn plan(input: &PlanInput<'_>) -> Plan {
    let d = input.deployment;
    let mode = if d.lifecycle == LifecycleState::Deleted { PlanMode::Teardown } else { PlanMode::Converge };
    let live: BTreeMap<&ObjectRef, &LiveObject> = input
        .live
        .iter()
        .filter(|l| l.object.kind.is_planned() && l.is_owned_by(d.id))
        .map(|l| (&l.object, l))
        .collect();

    let mut forward: Vec<Action> = Vec::new();
    let mut wanted: SmallVec<[ObjectRef; 8]> = SmallVec::new();
    if mode == PlanMode::Converge {
        let marker = marker_path();
        for tpl in d.desired_spec.objects.iter().filter(|t| t.kind.is_planned()) {
            let manifest = Manifest::render(tpl, d.id, &d.namespace, d.generation);
            wanted.push(manifest.object.clone());
            let Some(current) = live.get(&manifest.object) else {
                forward.push(Action::Create { manifest });
                continue;
            };
            if d.policy.mode_for(tpl.kind) == PolicyMode::Ignore {
                continue;
            }
            let diff: Vec<String> = fields::subset_diff(&manifest.body, &current.raw, "")
                .into_iter()
                .filter(|p| p != &marker && !d.policy.is_ignored(tpl.kind, p))
                .collect();
            let stale = markers::read_generation(&current.raw) != Some(d.generation);
            if !diff.is_empty() || stale {
                forward.push(Action::Update { manifest, uid: current.uid.clone(), fields: diff });
            }
        }
        forward.sort_by(|a, b| sort_key(a.object()).cmp(&sort_key(b.object())));
    }

    // deletion candidates: live objects we own plus rows whose object we may not see
    let mut doomed: BTreeMap<ObjectRef, String> = BTreeMap::new();
    for row in input.managed.iter().filter(|r| r.deployment_id == d.id && r.object.kind.is_planned()) {
        doomed.insert(row.object.clone(), row.uid.clone());
    }
    for (obj, l) in live.iter() {
        doomed.insert((*obj).clone(), l.uid.clone());
    }
    let mut deletes: Vec<Action> = doomed
        .into_iter()
        .filter(|(obj, _)| !wanted.contains(obj))
        .map(|(object, uid)| Action::Delete { object, uid })
        .collect();
    deletes.sort_by(|a, b| sort_key(b.object()).cmp(&sort_key(a.object())));

    forward.extend(deletes);
    Plan { deployment: d.id, generation: d.generation, mode, actions: forward }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use gantry_core::{ObjectTemplate, TemplateRef};
    use serde_json::{json, Value as Json};

    fn tpl(kind: ObjectKind, name: &str, body: Json) -> ObjectTemplate {
        ObjectTemplate {
            kind,
            name: name.into(),
            namespace: None,
            labels: Default::default(),
            annotations: Default::default(),
            body: body.as_object().cloned().unwrap(),
        }
    }

    fn deployment(objects: Vec<ObjectTemplate>) -> Deployment {
        Deployment {
            id: DeploymentId::new(),
            template: TemplateRef { name: "game-server".into(), version: "1".into() },
            namespace: "games".into(),
            desired_spec: DesiredSpec { objects },
            policy: DriftPolicy::default(),
            generation: Generation::FIRST,
            last_applied_generation: Generation::ZERO,
            lifecycle: LifecycleState::Active,
            status: StatusSummary::Progressing,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            archived_at: None,
        }
    }

    /// What the platform would hold after applying `m`, with some defaulting.
    fn live_from(m: &Manifest, uid: &str) -> LiveObject {
        let mut raw = m.body.clone();
        fields::set_pointer(&mut raw, "/metadata/uid", json!(uid));
        fields::set_pointer(&mut raw, "/metadata/creationTimestamp", json!("2024-01-01T00:00:00Z"));
        if m.object.kind == ObjectKind::Service {
            fields::set_pointer(&mut raw, "/spec/clusterIP", json!("10.0.0.7"));
        }
        LiveObject { object: m.object.clone(), uid: uid.into(), resource_version: "9".into(), raw }
    }

    fn full_spec() -> Vec<ObjectTemplate> {
        vec![
            tpl(ObjectKind::Route, "gs", json!({"spec": {"rules": []}})),
            tpl(ObjectKind::Service, "gs", json!({"spec": {"ports": [{"port": 7777}]}})),
            tpl(ObjectKind::Workload, "gs", json!({"spec": {"replicas": 1}})),
            tpl(ObjectKind::ConfigMap, "gs-config", json!({"data": {"motd": "hi"}})),
        ]
    }

    #[test]
    fn empty_world_creates_in_dependency_order() {
        let d = deployment(full_spec());
        let p = plan(&PlanInput { deployment: &d, managed: &[], live: &[] });
        let kinds: Vec<ObjectKind> = p.actions.iter().map(|a| a.object().kind).collect();
        assert_eq!(kinds, vec![ObjectKind::ConfigMap, ObjectKind::Workload, ObjectKind::Service, ObjectKind::Route]);
        assert_eq!(p.counts(), (4, 0, 0));
        assert_eq!(p.mode, PlanMode::Converge);
    }

    #[test]
    fn converged_world_plans_nothing() {
        let d = deployment(full_spec());
        let live: Vec<LiveObject> = d
            .desired_spec
            .objects
            .iter()
            .enumerate()
            .map(|(i, t)| live_from(&Manifest::render(t, d.id, "games", d.generation), &format!("u{i}")))
            .collect();
        let first = plan(&PlanInput { deployment: &d, managed: &[], live: &live });
        assert!(first.is_empty(), "{:?}", first.actions);
        let second = plan(&PlanInput { deployment: &d, managed: &[], live: &live });
        assert_eq!(first, second);
    }

    #[test]
    fn changed_field_or_stale_marker_updates() {
        let mut d = deployment(vec![tpl(ObjectKind::Workload, "gs", json!({"spec": {"replicas": 1}}))]);
        let mut l = live_from(&Manifest::render(&d.desired_spec.objects[0], d.id, "games", d.generation), "u1");
        fields::set_pointer(&mut l.raw, "/spec/replicas", json!(4));
        let p = plan(&PlanInput { deployment: &d, managed: &[], live: std::slice::from_ref(&l) });
        match &p.actions[..] {
            [Action::Update { uid, fields, .. }] => {
                assert_eq!(uid, "u1");
                assert_eq!(fields, &vec!["/spec/replicas".to_string()]);
            }
            other => panic!("unexpected {other:?}"),
        }

        // same fields, newer generation: marker refresh only
        let l = live_from(&Manifest::render(&d.desired_spec.objects[0], d.id, "games", d.generation), "u1");
        d.generation = Generation(2);
        let p = plan(&PlanInput { deployment: &d, managed: &[], live: std::slice::from_ref(&l) });
        assert!(matches!(&p.actions[..], [Action::Update { fields, .. }] if fields.is_empty()));
    }

    #[test]
    fn ignore_policy_skips_updates_not_creates() {
        let mut d = deployment(vec![
            tpl(ObjectKind::Workload, "gs", json!({"spec": {"replicas": 1}})),
            tpl(ObjectKind::Service, "gs", json!({"spec": {"ports": [{"port": 7777}]}})),
        ]);
        d.policy.per_kind.insert(ObjectKind::Workload, PolicyMode::Ignore);
        d.policy.per_kind.insert(ObjectKind::Service, PolicyMode::Ignore);
        let mut l = live_from(&Manifest::render(&d.desired_spec.objects[0], d.id, "games", d.generation), "u1");
        fields::set_pointer(&mut l.raw, "/spec/replicas", json!(4));
        let p = plan(&PlanInput { deployment: &d, managed: &[], live: std::slice::from_ref(&l) });
        assert_eq!(p.actions.len(), 1);
        assert!(matches!(&p.actions[0], Action::Create { manifest } if manifest.object.kind == ObjectKind::Service));
    }

    #[test]
    fn deletes_only_owned_and_last() {
        let d = deployment(vec![tpl(ObjectKind::ConfigMap, "keep", json!({"data": {}}))]);
        let keep = Manifest::render(&d.desired_spec.objects[0], d.id, "games", d.generation);
        let gone_tpl = tpl(ObjectKind::Service, "old", json!({"spec": {}}));
        let stale = live_from(&Manifest::render(&gone_tpl, d.id, "games", Generation::FIRST), "u-old");
        let mut foreign = stale.clone();
        foreign.object.name = "theirs".into();
        foreign.raw = json!({"metadata": {"name": "theirs", "namespace": "games"}});
        let row_only = ManagedResource {
            deployment_id: d.id,
            object: ObjectRef::new(ObjectKind::Workload, "games", "retired"),
            uid: "u-retired".into(),
            last_seen_at: Utc::now(),
            managed: false,
        };
        let p = plan(&PlanInput {
            deployment: &d,
            managed: std::slice::from_ref(&row_only),
            live: &[live_from(&keep, "u-keep"), stale, foreign],
        });
        let verbs: Vec<(&str, &str)> = p.actions.iter().map(|a| (a.verb(), a.object().name.as_str())).collect();
        // service (rank 2) goes before workload (rank 1) on the way down
        assert_eq!(verbs, vec![("delete", "old"), ("delete", "retired")]);
    }

    #[test]
    fn teardown_deletes_everything_owned() {
        let mut d = deployment(full_spec());
        let live: Vec<LiveObject> = d
            .desired_spec
            .objects
            .iter()
            .enumerate()
            .map(|(i, t)| live_from(&Manifest::render(t, d.id, "games", d.generation), &format!("u{i}")))
            .collect();
        d.lifecycle = LifecycleState::Deleted;
        let p = plan(&PlanInput { deployment: &d, managed: &[], live: &live });
        assert_eq!(p.mode, PlanMode::Teardown);
        let kinds: Vec<ObjectKind> = p.actions.iter().map(|a| a.object().kind).collect();
        assert_eq!(kinds, vec![ObjectKind::Route, ObjectKind::Service, ObjectKind::Workload, ObjectKind::ConfigMap]);
        assert_eq!(p.counts(), (0, 0, 4));
    }
}
