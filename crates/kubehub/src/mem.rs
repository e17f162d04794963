//! In-memory platform: enough server behavior (UIDs, resourceVersions,
//! apply merging, watches) to drive the whole control loop without a cluster.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use futures::stream::BoxStream;
use gantry_core::fields;
use gantry_core::markers;
use gantry_core::prelude::*;
use serde_json::{json, Value as Json};
use tokio::sync::broadcast;
use tracing::debug;

use crate::{selector_matches, DeleteOutcome, Platform, PlatformError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    Get,
    Create,
    Apply,
    Delete,
    List,
}

struct Fault {
    op: Op,
    name: Option<String>,
    error: PlatformError,
    remaining: usize,
}

struct State {
    objects: BTreeMap<ObjectRef, LiveObject>,
    rv: u64,
    uid: u64,
    faults: Vec<Fault>,
    log: Vec<(Op, ObjectRef)>,
    auto_ready: bool,
}

struct Shared {
    state: Mutex<State>,
    tx: broadcast::Sender<Notification>,
}

#[derive(Clone)]
pub struct MemPlatform {
    shared: Arc<Shared>,
}

impl Default for MemPlatform {
    fn default() -> Self { Self::new() }
}

impl MemPlatform {
    /// Workloads report ready as soon as they are written.
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(1024);
        let state = State { objects: BTreeMap::new(), rv: 0, uid: 0, faults: Vec::new(), log: Vec::new(), auto_ready: true };
        Self { shared: Arc::new(Shared { state: Mutex::new(state), tx }) }
    }

    /// Workloads stay Progressing until [`MemPlatform::set_status`] says otherwise.
    pub fn without_auto_ready() -> Self {
        let me = Self::new();
        me.state().auto_ready = false;
        me
    }

    fn state(&self) -> MutexGuard<'_, State> { self.shared.state.lock().unwrap_or_else(PoisonError::into_inner) }

    /// Fail the next `op` (optionally only for objects named `name`) with `error`.
    pub fn fail_next(&self, op: Op, name: Option<&str>, error: PlatformError) { self.fail_times(op, name, error, 1) }

    pub fn fail_times(&self, op: Op, name: Option<&str>, error: PlatformError, times: usize) {
        self.state().faults.push(Fault { op, name: name.map(str::to_string), error, remaining: times });
    }

    /// Mutating calls (create/apply/delete) in the order they arrived.
    pub fn mutations(&self) -> Vec<(Op, ObjectRef)> {
        self.state().log.iter().filter(|(op, _)| matches!(op, Op::Create | Op::Apply | Op::Delete)).cloned().collect()
    }

    pub fn clear_log(&self) { self.state().log.clear() }

    pub fn object(&self, object: &ObjectRef) -> Option<LiveObject> { self.state().objects.get(object).cloned() }

    pub fn objects(&self) -> Vec<LiveObject> { self.state().objects.values().cloned().collect() }

    /// Another actor changes a field.
    pub fn external_edit(&self, object: &ObjectRef, pointer: &str, value: Json) -> Option<LiveObject> {
        let mut st = self.state();
        let mut obj = st.objects.get(object)?.clone();
        let bump_spec = fields::path_within(pointer, "/spec");
        if !fields::set_pointer(&mut obj.raw, pointer, value) {
            return None;
        }
        if bump_spec {
            bump_generation(&mut obj.raw);
        }
        let auto_ready = st.auto_ready;
        Some(self.commit(&mut st, obj, NotificationKind::Update, auto_ready))
    }

    /// Another actor deletes the object.
    pub fn external_delete(&self, object: &ObjectRef) -> Option<LiveObject> {
        let mut st = self.state();
        let gone = st.objects.remove(object)?;
        self.publish(NotificationKind::Delete, &gone);
        Some(gone)
    }

    /// Put an object without ownership markers in place (someone else's object).
    pub fn insert_foreign(&self, object: ObjectRef, body: Json) -> LiveObject {
        let mut st = self.state();
        let mut raw = body;
        set_identity(&mut raw, &object);
        let obj = self.fresh(&mut st, object, raw);
        self.commit(&mut st, obj, NotificationKind::Add, false)
    }

    /// Overwrite `status` of an object, as a controller would.
    pub fn set_status(&self, object: &ObjectRef, status: Json) -> Option<LiveObject> {
        let mut st = self.state();
        let mut obj = st.objects.get(object)?.clone();
        if let Some(root) = obj.raw.as_object_mut() {
            root.insert("status".into(), status);
        }
        Some(self.commit(&mut st, obj, NotificationKind::Update, false))
    }

    /// A pod created by a workload; carries the workload's pod-template labels.
    pub fn add_pod(&self, id: DeploymentId, namespace: &str, name: &str, status: Json) -> LiveObject {
        let object = ObjectRef::new(ObjectKind::Pod, namespace, name);
        let mut raw = json!({"apiVersion": "v1", "kind": "Pod", "status": status});
        set_identity(&mut raw, &object);
        markers::stamp_labels(&mut raw, id);
        let mut st = self.state();
        let obj = self.fresh(&mut st, object, raw);
        self.commit(&mut st, obj, NotificationKind::Add, false)
    }

    fn take_fault(&self, st: &mut State, op: Op, object: Option<&ObjectRef>) -> Result<(), PlatformError> {
        let pos = st.faults.iter().position(|f| {
            f.op == op && f.remaining > 0 && match (&f.name, object) {
                (Some(n), Some(o)) => n == &o.name,
                (Some(_), None) => false,
                (None, _) => true,
            }
        });
        let Some(pos) = pos else { return Ok(()) };
        let fault = &mut st.faults[pos];
        fault.remaining -= 1;
        let err = fault.error.clone();
        if fault.remaining == 0 {
            st.faults.remove(pos);
        }
        debug!(op = ?op, error = %err, "injected platform fault");
        Err(err)
    }

    fn fresh(&self, st: &mut State, object: ObjectRef, mut raw: Json) -> LiveObject {
        st.uid += 1;
        let uid = format!("mem-{:08}", st.uid);
        if let Some(meta) = raw.get_mut("metadata").and_then(|m| m.as_object_mut()) {
            meta.insert("uid".into(), Json::String(uid.clone()));
            meta.insert("generation".into(), json!(1));
        }
        LiveObject { object, uid, resource_version: String::new(), raw }
    }

    /// Stamp a new resourceVersion, store, and notify watchers.
    fn commit(&self, st: &mut State, mut obj: LiveObject, event: NotificationKind, ready: bool) -> LiveObject {
        st.rv += 1;
        obj.resource_version = st.rv.to_string();
        if ready && obj.object.kind == ObjectKind::Workload {
            mark_ready(&mut obj.raw);
        }
        if let Some(meta) = obj.raw.get_mut("metadata").and_then(|m| m.as_object_mut()) {
            meta.insert("resourceVersion".into(), Json::String(obj.resource_version.clone()));
        }
        st.objects.insert(obj.object.clone(), obj.clone());
        self.publish(event, &obj);
        obj
    }

    fn publish(&self, event: NotificationKind, obj: &LiveObject) {
        if selector_matches(&markers::owned_selector(), &obj.raw) {
            let _ = self.shared.tx.send(Notification { event, object: obj.clone() });
        }
    }

    fn owned_of(&self, kind: ObjectKind) -> Vec<LiveObject> {
        let sel = markers::owned_selector();
        self.state().objects.values().filter(|o| o.object.kind == kind && selector_matches(&sel, &o.raw)).cloned().collect()
    }
}

fn set_identity(raw: &mut Json, object: &ObjectRef) {
    if !raw.is_object() {
        *raw = json!({});
    }
    if let Some(root) = raw.as_object_mut() {
        let meta = root.entry("metadata").or_insert_with(|| json!({}));
        if let Some(m) = meta.as_object_mut() {
            m.insert("name".into(), Json::String(object.name.clone()));
            m.insert("namespace".into(), Json::String(object.namespace.clone()));
        }
    }
}

fn bump_generation(raw: &mut Json) {
    let next = raw.pointer("/metadata/generation").and_then(|v| v.as_u64()).unwrap_or(0) + 1;
    fields::set_pointer(raw, "/metadata/generation", json!(next));
}

fn mark_ready(raw: &mut Json) {
    let replicas = raw.pointer("/spec/replicas").and_then(|v| v.as_u64()).unwrap_or(1);
    let generation = raw.pointer("/metadata/generation").and_then(|v| v.as_u64()).unwrap_or(1);
    let revision = format!("rev-{generation}");
    if let Some(root) = raw.as_object_mut() {
        root.insert(
            "status".into(),
            json!({
                "replicas": replicas,
                "readyReplicas": replicas,
                "updatedReplicas": replicas,
                "observedGeneration": generation,
                "currentRevision": revision,
                "updateRevision": revision,
            }),
        );
    }
}

#[async_trait]
impl Platform for MemPlatform {
    async fn get(&self, object: &ObjectRef) -> Result<Option<LiveObject>, PlatformError> {
        let mut st = self.state();
        self.take_fault(&mut st, Op::Get, Some(object))?;
        st.log.push((Op::Get, object.clone()));
        Ok(st.objects.get(object).cloned())
    }

    async fn create(&self, manifest: &Manifest) -> Result<LiveObject, PlatformError> {
        let mut st = self.state();
        self.take_fault(&mut st, Op::Create, Some(&manifest.object))?;
        st.log.push((Op::Create, manifest.object.clone()));
        if st.objects.contains_key(&manifest.object) {
            return Err(PlatformError::AlreadyExists(manifest.object.to_string()));
        }
        let obj = self.fresh(&mut st, manifest.object.clone(), manifest.body.clone());
        let auto_ready = st.auto_ready;
        Ok(self.commit(&mut st, obj, NotificationKind::Add, auto_ready))
    }

    async fn apply(&self, manifest: &Manifest) -> Result<LiveObject, PlatformError> {
        let mut st = self.state();
        self.take_fault(&mut st, Op::Apply, Some(&manifest.object))?;
        st.log.push((Op::Apply, manifest.object.clone()));
        let auto_ready = st.auto_ready;
        let Some(current) = st.objects.get(&manifest.object).cloned() else {
            let obj = self.fresh(&mut st, manifest.object.clone(), manifest.body.clone());
            return Ok(self.commit(&mut st, obj, NotificationKind::Add, auto_ready));
        };
        let mut next = current.clone();
        fields::deep_merge(&mut next.raw, &manifest.body);
        if next.raw == current.raw {
            return Ok(current);
        }
        if next.raw.get("spec") != current.raw.get("spec") {
            bump_generation(&mut next.raw);
        }
        Ok(self.commit(&mut st, next, NotificationKind::Update, auto_ready))
    }

    async fn delete(&self, object: &ObjectRef, uid: &str) -> Result<DeleteOutcome, PlatformError> {
        let mut st = self.state();
        self.take_fault(&mut st, Op::Delete, Some(object))?;
        st.log.push((Op::Delete, object.clone()));
        match st.objects.get(object) {
            None => Ok(DeleteOutcome::AlreadyGone),
            Some(o) if o.uid != uid => Ok(DeleteOutcome::Replaced),
            Some(_) => {
                if let Some(gone) = st.objects.remove(object) {
                    self.publish(NotificationKind::Delete, &gone);
                }
                Ok(DeleteOutcome::Deleted)
            }
        }
    }

    async fn list(&self, kind: ObjectKind, selector: &str) -> Result<Vec<LiveObject>, PlatformError> {
        let mut st = self.state();
        self.take_fault(&mut st, Op::List, None)?;
        Ok(st.objects.values().filter(|o| o.object.kind == kind && selector_matches(selector, &o.raw)).cloned().collect())
    }

    fn watch(&self, kind: ObjectKind) -> BoxStream<'static, Result<WatchEvent, PlatformError>> {
        let mut rx = self.shared.tx.subscribe();
        let me = self.clone();
        Box::pin(async_stream::stream! {
            yield Ok(WatchEvent::Restarted { kind, objects: me.owned_of(kind) });
            loop {
                match rx.recv().await {
                    Ok(n) if n.object.object.kind == kind => yield Ok(WatchEvent::Changed(n)),
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(kind = %kind, skipped, "mem watch lagged; relisting");
                        yield Ok(WatchEvent::Restarted { kind, objects: me.owned_of(kind) });
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }
}
