//! Gantry core types: deployments, managed resources, events and the
//! observation vocabulary shared by every other crate.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod fields;
pub mod kinds;
pub mod markers;
pub mod policy;
pub mod spec;

pub use kinds::{KindOps, ObjectKind};
pub use markers::Ownership;
pub use policy::{DriftPolicy, MutationRule, PolicyMode};
pub use spec::{DesiredSpec, Manifest, ObjectTemplate, SpecError};

/// Generates `as_str`, `Display` and `FromStr` for fieldless enums stored as text.
macro_rules! str_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(&self) -> &'static str {
                match self { $($name::$variant => $text),+ }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
        }

        impl FromStr for $name {
            type Err = UnknownVariant;
            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(UnknownVariant { ty: stringify!($name), value: other.to_string() }),
                }
            }
        }
    };
}
pub(crate) use str_enum;

/// Text column held a value no variant maps to.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {ty} value: {value}")]
pub struct UnknownVariant {
    pub ty: &'static str,
    pub value: String,
}

// ---- identifiers ----

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeploymentId(pub Uuid);

impl DeploymentId {
    pub fn new() -> Self { Self(Uuid::new_v4()) }
}

impl Default for DeploymentId {
    fn default() -> Self { Self::new() }
}

impl fmt::Display for DeploymentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "{}", self.0.hyphenated()) }
}

impl FromStr for DeploymentId {
    type Err = uuid::Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> { Uuid::parse_str(s).map(Self) }
}

/// Monotonic version of a deployment's desired state. Zero means "never applied".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Generation(pub u64);

impl Generation {
    pub const ZERO: Generation = Generation(0);
    pub const FIRST: Generation = Generation(1);

    pub fn get(self) -> u64 { self.0 }
    pub fn next(self) -> Self { Self(self.0.saturating_add(1)) }
}

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "{}", self.0) }
}

// ---- lifecycle and status ----

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LifecycleState {
    Active,
    Paused,
    Deleted,
}

str_enum!(LifecycleState { Active => "Active", Paused => "Paused", Deleted => "Deleted" });

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StatusSummary {
    Healthy,
    Progressing,
    Degraded,
    Error,
}

str_enum!(StatusSummary {
    Healthy => "Healthy",
    Progressing => "Progressing",
    Degraded => "Degraded",
    Error => "Error",
});

impl StatusSummary {
    /// Precedence used when aggregating: Error > Degraded > Progressing > Healthy.
    pub fn severity(self) -> u8 {
        match self {
            StatusSummary::Healthy => 0,
            StatusSummary::Progressing => 1,
            StatusSummary::Degraded => 2,
            StatusSummary::Error => 3,
        }
    }

    pub fn worst(self, other: StatusSummary) -> StatusSummary {
        if other.severity() > self.severity() { other } else { self }
    }
}

/// Template a deployment was instantiated from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateRef {
    pub name: String,
    pub version: String,
}

/// Desired-state record for one managed instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Deployment {
    pub id: DeploymentId,
    pub template: TemplateRef,
    pub namespace: String,
    pub desired_spec: DesiredSpec,
    pub policy: DriftPolicy,
    pub generation: Generation,
    pub last_applied_generation: Generation,
    pub lifecycle: LifecycleState,
    pub status: StatusSummary,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub archived_at: Option<DateTime<Utc>>,
}

impl Deployment {
    pub fn is_converged(&self) -> bool {
        self.last_applied_generation == self.generation && self.status == StatusSummary::Healthy
    }
}

// ---- platform objects ----

/// Identity of a platform object by name. Names can be reused over time; see [`LiveObject::uid`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectRef {
    pub kind: ObjectKind,
    pub namespace: String,
    pub name: String,
}

impl ObjectRef {
    pub fn new(kind: ObjectKind, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self { kind, namespace: namespace.into(), name: name.into() }
    }

    /// Stable key used in snapshots and event payloads.
    pub fn key(&self) -> String { format!("{}/{}/{}", self.kind, self.namespace, self.name) }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.kind, self.namespace, self.name)
    }
}

/// An object as reported by the platform (get/list/watch).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiveObject {
    pub object: ObjectRef,
    pub uid: String,
    pub resource_version: String,
    pub raw: serde_json::Value,
}

impl LiveObject {
    pub fn ownership(&self) -> Option<Ownership> { markers::read_ownership(&self.raw) }

    pub fn is_owned_by(&self, id: DeploymentId) -> bool {
        self.ownership().map(|o| o.deployment_id == id).unwrap_or(false)
    }

    pub fn status(&self) -> ResourceStatus { self.object.kind.ops().extract_status(&self.raw) }
}

/// Row of the Managed Resource table: one platform object owned for a deployment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagedResource {
    pub deployment_id: DeploymentId,
    pub object: ObjectRef,
    pub uid: String,
    pub last_seen_at: DateTime<Utc>,
    pub managed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NotificationKind {
    Add,
    Update,
    Delete,
}

/// One watch notification, normalized.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub event: NotificationKind,
    pub object: LiveObject,
}

/// Items produced by a platform watch stream.
#[derive(Debug, Clone)]
pub enum WatchEvent {
    Changed(Notification),
    /// The watch was (re)established; `objects` is the full current list for `kind`.
    Restarted { kind: ObjectKind, objects: Vec<LiveObject> },
}

// ---- observed status ----

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResourceHealth {
    Ready,
    Progressing,
    Unhealthy,
}

impl ResourceHealth {
    pub fn as_summary(self) -> StatusSummary {
        match self {
            ResourceHealth::Ready => StatusSummary::Healthy,
            ResourceHealth::Progressing => StatusSummary::Progressing,
            ResourceHealth::Unhealthy => StatusSummary::Degraded,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: String,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Selected live status fields for one object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceStatus {
    pub health: ResourceHealth,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ready_replicas: Option<u32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generation_marker: Option<Generation>,
}

impl ResourceStatus {
    pub fn new(health: ResourceHealth) -> Self {
        Self { health, replicas: None, ready_replicas: None, conditions: Vec::new(), message: None, generation_marker: None }
    }
}

/// Cache of live status for one deployment; overwritten wholesale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservedSnapshot {
    pub deployment_id: DeploymentId,
    pub resources: BTreeMap<String, ResourceStatus>,
    pub observed_at: DateTime<Utc>,
}

impl ObservedSnapshot {
    pub fn empty(deployment_id: DeploymentId) -> Self {
        Self { deployment_id, resources: BTreeMap::new(), observed_at: Utc::now() }
    }

    pub fn summary(&self) -> StatusSummary {
        aggregate_status(self.resources.values().map(|s| s.health))
    }
}

/// Fold per-resource health into a deployment summary (empty set is Healthy).
pub fn aggregate_status<I: IntoIterator<Item = ResourceHealth>>(healths: I) -> StatusSummary {
    healths
        .into_iter()
        .fold(StatusSummary::Healthy, |acc, h| acc.worst(h.as_summary()))
}

// ---- events ----

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventSource {
    User,
    Reconciler,
    PlatformWatch,
    System,
}

str_enum!(EventSource {
    User => "user",
    Reconciler => "reconciler",
    PlatformWatch => "platform-watch",
    System => "system",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    DeploymentCreated,
    DesiredStateChanged,
    LifecycleChanged,
    ReconcileStarted,
    ReconcileSucceeded,
    ReconcileFailed,
    ReconcileDeferred,
    ReconcileSkipped,
    ResourceCreated,
    ResourceUpdated,
    ResourceDeleted,
    ResourceConflict,
    DriftDetected,
    DriftAdopted,
    ResourceDeletedExternally,
    UnmanagedObjectDetected,
    ResourceHealthChanged,
    AdoptionApproved,
    TeardownCompleted,
}

str_enum!(EventType {
    DeploymentCreated => "DeploymentCreated",
    DesiredStateChanged => "DesiredStateChanged",
    LifecycleChanged => "LifecycleChanged",
    ReconcileStarted => "ReconcileStarted",
    ReconcileSucceeded => "ReconcileSucceeded",
    ReconcileFailed => "ReconcileFailed",
    ReconcileDeferred => "ReconcileDeferred",
    ReconcileSkipped => "ReconcileSkipped",
    ResourceCreated => "ResourceCreated",
    ResourceUpdated => "ResourceUpdated",
    ResourceDeleted => "ResourceDeleted",
    ResourceConflict => "ResourceConflict",
    DriftDetected => "DriftDetected",
    DriftAdopted => "DriftAdopted",
    ResourceDeletedExternally => "ResourceDeletedExternally",
    UnmanagedObjectDetected => "UnmanagedObjectDetected",
    ResourceHealthChanged => "ResourceHealthChanged",
    AdoptionApproved => "AdoptionApproved",
    TeardownCompleted => "TeardownCompleted",
});

/// Event to append; the store assigns `seq` and `created_at`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewEvent {
    pub deployment_id: DeploymentId,
    pub source: EventSource,
    pub event_type: EventType,
    pub payload: serde_json::Value,
}

impl NewEvent {
    pub fn new(deployment_id: DeploymentId, source: EventSource, event_type: EventType, payload: serde_json::Value) -> Self {
        Self { deployment_id, source, event_type, payload }
    }

    pub fn reconciler(deployment_id: DeploymentId, event_type: EventType, payload: serde_json::Value) -> Self {
        Self::new(deployment_id, EventSource::Reconciler, event_type, payload)
    }

    pub fn watch(deployment_id: DeploymentId, event_type: EventType, payload: serde_json::Value) -> Self {
        Self::new(deployment_id, EventSource::PlatformWatch, event_type, payload)
    }
}

/// Immutable audit record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub seq: i64,
    pub deployment_id: DeploymentId,
    pub source: EventSource,
    pub event_type: EventType,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

// ---- reconcile triggers ----

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TriggerReason {
    DesiredChanged,
    Drift,
    HealthChanged,
    Periodic,
    Manual,
    Lifecycle,
}

str_enum!(TriggerReason {
    DesiredChanged => "desired-changed",
    Drift => "drift",
    HealthChanged => "health-changed",
    Periodic => "periodic",
    Manual => "manual",
    Lifecycle => "lifecycle",
});

impl TriggerReason {
    /// Whether the trigger runs immediately even when the deployment is backing off or dead.
    pub fn bypasses_backoff(self) -> bool {
        matches!(self, TriggerReason::DesiredChanged | TriggerReason::Manual | TriggerReason::Lifecycle)
    }
}

/// Something that can enqueue a reconcile for a deployment.
pub trait TriggerSink: Send + Sync {
    fn trigger(&self, id: DeploymentId, reason: TriggerReason);
}

pub mod prelude {
    pub use super::{
        aggregate_status, Deployment, DeploymentId, DesiredSpec, DriftPolicy, Event, EventSource, EventType,
        Generation, KindOps, LifecycleState, LiveObject, ManagedResource, Manifest, NewEvent, Notification,
        NotificationKind, ObjectKind, ObjectRef, ObjectTemplate, ObservedSnapshot, Ownership, PolicyMode,
        ResourceHealth, ResourceStatus, StatusSummary, TemplateRef, TriggerReason, TriggerSink, WatchEvent,
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_precedence() {
        let all = [ResourceHealth::Ready, ResourceHealth::Progressing, ResourceHealth::Ready];
        assert_eq!(aggregate_status(all), StatusSummary::Progressing);
        let mixed = [ResourceHealth::Progressing, ResourceHealth::Unhealthy, ResourceHealth::Ready];
        assert_eq!(aggregate_status(mixed), StatusSummary::Degraded);
        assert_eq!(aggregate_status(Vec::new()), StatusSummary::Healthy);
        assert_eq!(StatusSummary::Degraded.worst(StatusSummary::Error), StatusSummary::Error);
        assert_eq!(StatusSummary::Error.worst(StatusSummary::Healthy), StatusSummary::Error);
    }

    #[test]
    fn enums_round_trip_text() {
        for t in EventType::ALL {
            assert_eq!(t.as_str().parse::<EventType>().unwrap(), *t);
        }
        assert_eq!("platform-watch".parse::<EventSource>().unwrap(), EventSource::PlatformWatch);
        assert!("Running".parse::<LifecycleState>().is_err());
    }

    #[test]
    fn generation_next_is_monotonic() {
        let g = Generation::FIRST;
        assert!(g.next() > g);
        assert_eq!(Generation(u64::MAX).next(), Generation(u64::MAX));
    }

    #[test]
    fn trigger_reasons_that_skip_backoff() {
        assert!(TriggerReason::DesiredChanged.bypasses_backoff());
        assert!(TriggerReason::Manual.bypasses_backoff());
        assert!(!TriggerReason::Drift.bypasses_backoff());
        assert!(!TriggerReason::Periodic.bypasses_backoff());
    }
}
