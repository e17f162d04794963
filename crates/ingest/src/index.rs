//! Coalescing intake queue and the in-memory live index built from it.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use gantry_core::prelude::*;
use rustc_hash::FxHashMap;

/// Coalescing queue keyed by UID with FIFO order and fixed capacity.
/// A newer notification for a queued UID replaces the older one in place.
pub struct Coalescer {
    map: FxHashMap<String, Notification>,
    order: VecDeque<String>,
    cap: usize,
    dropped: u64,
}

impl Coalescer {
    pub fn with_capacity(cap: usize) -> Self {
        Self { map: FxHashMap::default(), order: VecDeque::new(), cap: cap.max(1), dropped: 0 }
    }

    pub fn len(&self) -> usize { self.map.len() }
    pub fn is_empty(&self) -> bool { self.map.is_empty() }
    /// Notifications evicted because the queue was full; the next resync covers them.
    pub fn dropped(&self) -> u64 { self.dropped }

    pub fn push(&mut self, n: Notification) {
        let uid = n.object.uid.clone();
        if !self.map.contains_key(&uid) {
            if self.order.len() >= self.cap {
                if let Some(old) = self.order.pop_front() {
                    self.map.remove(&old);
                    self.dropped += 1;
                }
            }
            self.order.push_back(uid.clone());
        }
        self.map.insert(uid, n);
    }

    pub fn drain_ready(&mut self) -> Vec<Notification> {
        let mut out = Vec::with_capacity(self.order.len());
        while let Some(uid) = self.order.pop_front() {
            if let Some(n) = self.map.remove(&uid) {
                out.push(n);
            }
        }
        out
    }
}

/// Immutable view of every owned object ingest has seen, swapped in whole.
#[derive(Debug, Default)]
pub struct LiveIndex {
    pub epoch: u64,
    objects: BTreeMap<ObjectRef, LiveObject>,
}

impl LiveIndex {
    pub fn get(&self, object: &ObjectRef) -> Option<&LiveObject> { self.objects.get(object) }
    pub fn len(&self) -> usize { self.objects.len() }
    pub fn is_empty(&self) -> bool { self.objects.is_empty() }

    pub fn owned_by(&self, id: DeploymentId) -> impl Iterator<Item = &LiveObject> + '_ {
        self.objects.values().filter(move |o| o.is_owned_by(id))
    }
}

/// Builds [`LiveIndex`] instances from notification batches and relists.
#[derive(Default)]
pub struct IndexBuilder {
    epoch: u64,
    objects: BTreeMap<ObjectRef, LiveObject>,
}

impl IndexBuilder {
    pub fn new() -> Self { Self::default() }

    pub fn apply(&mut self, batch: &[Notification]) {
        for n in batch {
            match n.event {
                NotificationKind::Add | NotificationKind::Update => {
                    self.objects.insert(n.object.object.clone(), n.object.clone());
                }
                NotificationKind::Delete => {
                    // a recreated object under the same name must survive a late delete of its predecessor
                    if self.objects.get(&n.object.object).map(|o| o.uid == n.object.uid).unwrap_or(false) {
                        self.objects.remove(&n.object.object);
                    }
                }
            }
        }
        self.epoch = self.epoch.saturating_add(1);
    }

    /// Replace everything of `kind` with a full list.
    pub fn replace_kind(&mut self, kind: ObjectKind, objects: &[LiveObject]) {
        self.objects.retain(|k, _| k.kind != kind);
        for o in objects {
            self.objects.insert(o.object.clone(), o.clone());
        }
        self.epoch = self.epoch.saturating_add(1);
    }

    pub fn freeze(&self) -> Arc<LiveIndex> { Arc::new(LiveIndex { epoch: self.epoch, objects: self.objects.clone() }) }
}
